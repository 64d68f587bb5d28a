use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tokio::sync::oneshot;

/// One price observation from the market data feed.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Tick {
    /// Exchange-assigned numeric instrument token.
    pub token: u32,
    /// Trading symbol, e.g. "NIFTY2590224500CE".
    pub symbol: String,
    pub last_price: f64,
    pub timestamp: DateTime<Utc>,
}

/// Ordered batch of ticks delivered by the feed. Batch size and cadence are
/// controlled upstream; the engine processes whatever arrives, in order.
pub type TickBatch = Vec<Tick>;

/// The two legs of a paired option trade, discriminated by symbol suffix.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum InstrumentKind {
    /// Call option ("CE" suffix).
    Call,
    /// Put option ("PE" suffix).
    Put,
}

impl InstrumentKind {
    /// Derive the kind from a trading symbol's suffix. Returns `None` for
    /// symbols that are neither calls nor puts.
    pub fn from_symbol(symbol: &str) -> Option<Self> {
        if symbol.ends_with("CE") {
            Some(InstrumentKind::Call)
        } else if symbol.ends_with("PE") {
            Some(InstrumentKind::Put)
        } else {
            None
        }
    }

    /// The other leg's kind.
    pub fn opposite(self) -> Self {
        match self {
            InstrumentKind::Call => InstrumentKind::Put,
            InstrumentKind::Put => InstrumentKind::Call,
        }
    }
}

impl std::fmt::Display for InstrumentKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            InstrumentKind::Call => write!(f, "CE"),
            InstrumentKind::Put => write!(f, "PE"),
        }
    }
}

/// Side of a trade.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum OrderSide {
    Buy,
    Sell,
}

impl std::fmt::Display for OrderSide {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            OrderSide::Buy => write!(f, "BUY"),
            OrderSide::Sell => write!(f, "SELL"),
        }
    }
}

/// An order handed to the execution gateway. Always a market order; the
/// reference price is the last observed price at submission time and doubles
/// as the simulated fill when paper semantics apply.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct OrderRequest {
    /// Client-side order id (uuid), distinct from the broker-assigned id.
    pub id: String,
    pub symbol: String,
    pub side: OrderSide,
    pub quantity: u32,
    pub reference_price: f64,
}

impl OrderRequest {
    pub fn market(
        symbol: impl Into<String>,
        side: OrderSide,
        quantity: u32,
        reference_price: f64,
    ) -> Self {
        Self {
            id: uuid::Uuid::new_v4().to_string(),
            symbol: symbol.into(),
            side,
            quantity,
            reference_price,
        }
    }
}

/// Acknowledgement of an accepted order. The fill price is not known yet;
/// it resolves asynchronously via `ExecutionGateway::resolve_fill`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct OrderReceipt {
    /// Broker-assigned order id used for history lookup.
    pub order_id: String,
}

/// Whether orders reach the real broker or are simulated.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TradingMode {
    Live,
    Paper,
}

impl std::fmt::Display for TradingMode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            TradingMode::Live => write!(f, "live"),
            TradingMode::Paper => write!(f, "paper"),
        }
    }
}

/// Execution blocks of the cycle state machine.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum Block {
    /// Selecting the instrument pair for this cycle.
    #[default]
    Init,
    /// Tracking prices, waiting for the entry trigger.
    Update,
    /// Evaluating the ordered decision rules every batch.
    Decision,
    /// Resetting per-cycle state before the next pass.
    NextCycle,
}

impl std::fmt::Display for Block {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Block::Init => write!(f, "init"),
            Block::Update => write!(f, "update"),
            Block::Decision => write!(f, "decision"),
            Block::NextCycle => write!(f, "next_cycle"),
        }
    }
}

/// A completed trade action, published on the telemetry channel.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TradeEvent {
    pub action: OrderSide,
    pub symbol: String,
    pub price: f64,
    pub quantity: u32,
    pub timestamp: DateTime<Utc>,
    pub cycle: u64,
}

/// Tagged telemetry events consumed by an external dashboard.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "event", rename_all = "snake_case")]
pub enum EngineEvent {
    BlockChanged { from: Block, to: Block, cycle: u64 },
    Trade(TradeEvent),
}

/// Which parameter namespace a control update targets.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum ParamScope {
    /// Settings owned by one strategy instance.
    PerStrategy,
    /// Settings shared across strategies of an account.
    CrossCutting,
}

/// A live parameter update from the external control channel.
///
/// The optional reply channel carries the accepted/rejected boolean back to
/// the sender; updates are applied strictly between tick batches.
#[derive(Debug)]
pub struct ControlUpdate {
    pub scope: ParamScope,
    pub name: String,
    pub value: serde_json::Value,
    pub reply: Option<oneshot::Sender<bool>>,
}
