use std::sync::Arc;

use chrono::Utc;
use tokio::sync::{broadcast, mpsc};
use tracing::{debug, error, info};

use common::{
    EngineEvent, ExecutionGateway, OrderRequest, OrderSide, Result, TradeEvent,
};
use ledger::InstrumentLedger;
use params::ParameterStore;
use selector::Selection;

use crate::fills::{self, FillUpdate};

/// The ordered decision rules. Priority is the position in the rule order:
/// the specific re-entry rules run ahead of the generic target and
/// stop-loss exits so overlapping guards resolve deterministically.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RuleKind {
    InitialBuy,
    BuyBackEntry,
    BuyBackExit,
    Rebuy,
    TakeProfit,
    StopLoss,
}

pub const DEFAULT_RULE_ORDER: [RuleKind; 6] = [
    RuleKind::InitialBuy,
    RuleKind::BuyBackEntry,
    RuleKind::BuyBackExit,
    RuleKind::Rebuy,
    RuleKind::TakeProfit,
    RuleKind::StopLoss,
];

/// The profit exit fires once the armed price sits within one unit of the
/// target, above or below. Tolerates tick-granularity overshoot without
/// demanding exact equality.
const TARGET_FIRE_BAND: f64 = 1.0;

/// One-shot flags, one per rule. A rule whose flag is set can never fire
/// again within the cycle; flags are set at submission time, before any
/// await, so re-evaluation while a fill is in flight cannot double-submit.
#[derive(Debug, Clone, Copy, Default)]
pub struct DoneFlags {
    initial_buy: bool,
    buy_back_entry: bool,
    buy_back_exit: bool,
    rebuy: bool,
    take_profit: bool,
    stop_loss: bool,
}

impl DoneFlags {
    pub fn is_set(&self, kind: RuleKind) -> bool {
        match kind {
            RuleKind::InitialBuy => self.initial_buy,
            RuleKind::BuyBackEntry => self.buy_back_entry,
            RuleKind::BuyBackExit => self.buy_back_exit,
            RuleKind::Rebuy => self.rebuy,
            RuleKind::TakeProfit => self.take_profit,
            RuleKind::StopLoss => self.stop_loss,
        }
    }

    fn set(&mut self, kind: RuleKind) {
        match kind {
            RuleKind::InitialBuy => self.initial_buy = true,
            RuleKind::BuyBackEntry => self.buy_back_entry = true,
            RuleKind::BuyBackExit => self.buy_back_exit = true,
            RuleKind::Rebuy => self.rebuy = true,
            RuleKind::TakeProfit => self.take_profit = true,
            RuleKind::StopLoss => self.stop_loss = true,
        }
    }

    pub fn all_clear(&self) -> bool {
        !(self.initial_buy
            || self.buy_back_entry
            || self.buy_back_exit
            || self.rebuy
            || self.take_profit
            || self.stop_loss)
    }
}

/// Trading parameters scoped to the active cycle. Rules may mutate them
/// (the rebuy halves the target and doubles the quantity); the cycle reset
/// restores them from the store.
#[derive(Debug, Clone, Copy, Default)]
struct CycleParams {
    target: f64,
    quantity: u32,
}

#[derive(Debug, Clone)]
struct BuyBackLeg {
    token: u32,
    symbol: String,
    quantity: u32,
}

/// Everything the decision rules need to act on the outside world.
#[derive(Clone)]
pub struct EngineDeps {
    pub gateway: Arc<dyn ExecutionGateway>,
    pub event_tx: broadcast::Sender<EngineEvent>,
    pub fill_tx: mpsc::Sender<FillUpdate>,
}

/// Evaluates the ordered rule set against the ledger's main and opposite
/// instruments, submitting orders through the gateway.
pub struct DecisionEngine {
    rule_order: Vec<RuleKind>,
    done: DoneFlags,
    profit_armed: bool,
    bought_and_sold: bool,
    buyback: Option<BuyBackLeg>,
    cycle_params: Option<CycleParams>,
}

impl DecisionEngine {
    pub fn new() -> Self {
        Self::with_rule_order(DEFAULT_RULE_ORDER.to_vec())
    }

    pub fn with_rule_order(rule_order: Vec<RuleKind>) -> Self {
        Self {
            rule_order,
            done: DoneFlags::default(),
            profit_armed: false,
            bought_and_sold: false,
            buyback: None,
            cycle_params: None,
        }
    }

    /// Terminal flag: the cycle's position has been opened and fully closed.
    pub fn bought_and_sold(&self) -> bool {
        self.bought_and_sold
    }

    pub fn done(&self) -> &DoneFlags {
        &self.done
    }

    /// Clear all per-cycle state. Called only from the cycle reset.
    pub fn reset(&mut self) {
        self.done = DoneFlags::default();
        self.profit_armed = false;
        self.bought_and_sold = false;
        self.buyback = None;
        self.cycle_params = None;
    }

    /// Run one pass over the rule order. Each rule is one-shot; a rule that
    /// already fired is skipped. Called once per batch while the controller
    /// is in the decision block.
    pub async fn evaluate(
        &mut self,
        ledger: &mut InstrumentLedger,
        params: &ParameterStore,
        sel: &Selection,
        cycle: u64,
        deps: &EngineDeps,
    ) -> Result<()> {
        // Disabled trading blocks submissions but never observation; the
        // ledger keeps updating upstream of this call.
        if !params.shared().boolean("trading_enabled") {
            debug!("Trading disabled; decision rules not evaluated");
            return Ok(());
        }

        if self.cycle_params.is_none() {
            let strategy = params.strategy();
            self.cycle_params = Some(CycleParams {
                target: strategy.number("target"),
                quantity: strategy.integer("quantity").max(1) as u32,
            });
        }

        self.observe_flags(ledger, params, sel);

        for kind in self.rule_order.clone() {
            if self.done.is_set(kind) {
                continue;
            }
            match kind {
                RuleKind::InitialBuy => {
                    self.rule_initial_buy(ledger, params, sel, cycle, deps).await
                }
                RuleKind::BuyBackEntry => {
                    self.rule_buy_back_entry(ledger, params, sel, cycle, deps).await
                }
                RuleKind::BuyBackExit => {
                    self.rule_buy_back_exit(ledger, params, cycle, deps).await
                }
                RuleKind::Rebuy => self.rule_rebuy(ledger, params, sel, cycle, deps).await,
                RuleKind::TakeProfit => {
                    self.rule_take_profit(ledger, params, sel, cycle, deps).await
                }
                RuleKind::StopLoss => {
                    self.rule_stop_loss(ledger, params, sel, cycle, deps).await
                }
            }
            if self.bought_and_sold {
                break;
            }
        }
        Ok(())
    }

    /// Derived-flag pass over the instruments the rules watch: peak-and-fall
    /// detection, and freezing the trough once the price recovers to the
    /// captured reference.
    fn observe_flags(&self, ledger: &mut InstrumentLedger, params: &ParameterStore, sel: &Selection) {
        let margin = params.strategy().number("peak_fall_margin");
        let watched = [
            Some(sel.main.token),
            self.buyback.as_ref().map(|b| b.token),
        ];

        for token in watched.into_iter().flatten() {
            let (mark_fall, mark_reached) = match ledger.get(token) {
                Some(rec) => {
                    let fall = !rec.flags.peak_and_fall
                        && rec.peak_retreat().map_or(false, |r| r >= margin);
                    let reached = !rec.flags.reference_reached
                        && !rec.flags.low_frozen
                        && matches!(
                            (rec.reference_price, rec.low_since_ref),
                            (Some(r), Some(low)) if low < r && rec.last_price >= r
                        );
                    (fall, reached)
                }
                None => (false, false),
            };
            if mark_fall {
                ledger.mark_peak_and_fall(token);
                debug!(token, "Peak-and-fall detected");
            }
            if mark_reached {
                // The reference capture freezes trough tracking; later
                // comparisons use the frozen dip, not a moving minimum.
                ledger.mark_reference_reached(token);
                ledger.freeze_low(token);
                debug!(token, "Price recovered to reference; trough frozen");
            }
        }
    }

    // ─── Rules, in order of declaration ───────────────────────────────────────

    /// Opens the cycle's position in the main leg at the current price and
    /// captures the trough-tracking reference.
    async fn rule_initial_buy(
        &mut self,
        ledger: &mut InstrumentLedger,
        params: &ParameterStore,
        sel: &Selection,
        cycle: u64,
        deps: &EngineDeps,
    ) {
        let Some(rec) = ledger.get(sel.main.token) else {
            return;
        };
        let price = rec.last_price;
        let quantity = self.params_snapshot().quantity;

        self.done.set(RuleKind::InitialBuy);
        self.submit(
            OrderSide::Buy,
            sel.main.token,
            &sel.main.symbol,
            quantity,
            price,
            params,
            cycle,
            deps,
        )
        .await;
        ledger.mark_bought(sel.main.token, price);
        ledger.set_reference(sel.main.token);
    }

    /// After a stop-loss exit, re-enters on the opposite kind: the
    /// instrument nearest below the configured ceiling. Stays eligible
    /// until a candidate shows up in the ledger.
    async fn rule_buy_back_entry(
        &mut self,
        ledger: &mut InstrumentLedger,
        params: &ParameterStore,
        sel: &Selection,
        cycle: u64,
        deps: &EngineDeps,
    ) {
        if !self.done.is_set(RuleKind::StopLoss) {
            return;
        }

        let opposite_kind = sel.main.kind.opposite();
        let ceiling = params.strategy().number("buyback_ceiling");
        let candidate = ledger
            .records()
            .filter(|r| {
                r.kind == Some(opposite_kind) && r.last_price < ceiling && r.buy_price.is_none()
            })
            .max_by(|a, b| a.last_price.total_cmp(&b.last_price))
            .map(|r| (r.token, r.symbol.clone(), r.last_price));

        let Some((token, symbol, price)) = candidate else {
            debug!(%opposite_kind, ceiling, "No buy-back candidate below ceiling yet");
            return;
        };

        let quantity = self.params_snapshot().quantity;
        self.done.set(RuleKind::BuyBackEntry);
        self.buyback = Some(BuyBackLeg {
            token,
            symbol: symbol.clone(),
            quantity,
        });
        self.submit(OrderSide::Buy, token, &symbol, quantity, price, params, cycle, deps)
            .await;
        ledger.mark_bought(token, price);
        ledger.set_reference(token);
    }

    /// Closes the buy-back leg at its own target and ends the cycle.
    async fn rule_buy_back_exit(
        &mut self,
        ledger: &mut InstrumentLedger,
        params: &ParameterStore,
        cycle: u64,
        deps: &EngineDeps,
    ) {
        let Some(bb) = self.buyback.clone() else {
            return;
        };
        let Some(rec) = ledger.get(bb.token) else {
            return;
        };
        let target = params.strategy().number("buyback_target");
        if rec.change_since_buy < target {
            return;
        }

        let price = rec.last_price;
        self.done.set(RuleKind::BuyBackExit);
        self.bought_and_sold = true;
        info!(symbol = %bb.symbol, change = rec.change_since_buy, "Buy-back target reached; closing cycle");
        self.submit(
            OrderSide::Sell,
            bb.token,
            &bb.symbol,
            bb.quantity,
            price,
            params,
            cycle,
            deps,
        )
        .await;
    }

    /// Averages down once per cycle: after a dip of at least `rebuy_drop`
    /// below the reference and a recovery back to it, doubles the position
    /// and halves the remaining target. Uses the frozen dip, never a moving
    /// minimum.
    async fn rule_rebuy(
        &mut self,
        ledger: &mut InstrumentLedger,
        params: &ParameterStore,
        sel: &Selection,
        cycle: u64,
        deps: &EngineDeps,
    ) {
        if !self.done.is_set(RuleKind::InitialBuy) || self.done.is_set(RuleKind::StopLoss) {
            return;
        }
        let Some(rec) = ledger.get(sel.main.token) else {
            return;
        };
        if !(rec.flags.peak_and_fall && rec.flags.reference_reached) {
            return;
        }
        let (Some(reference), Some(low)) = (rec.reference_price, rec.low_since_ref) else {
            return;
        };
        let rebuy_drop = params.strategy().number("rebuy_drop");
        if reference - low < rebuy_drop {
            return;
        }

        let price = rec.last_price;
        let add_quantity = self.params_snapshot().quantity;
        self.done.set(RuleKind::Rebuy);
        if let Some(cp) = self.cycle_params.as_mut() {
            cp.target /= 2.0;
            cp.quantity *= 2;
        }
        info!(
            symbol = %sel.main.symbol,
            dip = reference - low,
            add_quantity,
            "Rebuy: averaging down after dip-and-recover"
        );
        self.submit(
            OrderSide::Buy,
            sel.main.token,
            &sel.main.symbol,
            add_quantity,
            price,
            params,
            cycle,
            deps,
        )
        .await;
    }

    /// Arm-then-fire profit exit. Arming and firing never happen on the
    /// same tick: the latch arms once the change reaches `target − ε`, and
    /// the sell fires on a later tick inside the one-unit band around the
    /// target.
    async fn rule_take_profit(
        &mut self,
        ledger: &mut InstrumentLedger,
        params: &ParameterStore,
        sel: &Selection,
        cycle: u64,
        deps: &EngineDeps,
    ) {
        if !self.done.is_set(RuleKind::InitialBuy) || self.done.is_set(RuleKind::StopLoss) {
            return;
        }
        let Some(rec) = ledger.get(sel.main.token) else {
            return;
        };
        if rec.buy_price.is_none() {
            return;
        }

        let cp = self.params_snapshot();
        let epsilon = params.strategy().number("target_epsilon");

        if !self.profit_armed {
            if rec.change_since_buy >= cp.target - epsilon {
                self.profit_armed = true;
                debug!(
                    change = rec.change_since_buy,
                    target = cp.target,
                    "Profit latch armed"
                );
            }
            return;
        }

        if (rec.change_since_buy - cp.target).abs() > TARGET_FIRE_BAND {
            return;
        }

        let price = rec.last_price;
        self.done.set(RuleKind::TakeProfit);
        self.bought_and_sold = true;
        info!(
            symbol = %sel.main.symbol,
            change = rec.change_since_buy,
            target = cp.target,
            "Profit target sell fired"
        );
        self.submit(
            OrderSide::Sell,
            sel.main.token,
            &sel.main.symbol,
            cp.quantity,
            price,
            params,
            cycle,
            deps,
        )
        .await;
    }

    /// Forced exit once the loss reaches the stop. Not terminal: the
    /// buy-back entry becomes eligible afterwards.
    async fn rule_stop_loss(
        &mut self,
        ledger: &mut InstrumentLedger,
        params: &ParameterStore,
        sel: &Selection,
        cycle: u64,
        deps: &EngineDeps,
    ) {
        if !self.done.is_set(RuleKind::InitialBuy) || self.done.is_set(RuleKind::TakeProfit) {
            return;
        }
        let Some(rec) = ledger.get(sel.main.token) else {
            return;
        };
        if rec.buy_price.is_none() {
            return;
        }

        let stoploss = params.strategy().number("stoploss");
        if rec.change_since_buy > stoploss {
            return;
        }

        let price = rec.last_price;
        let quantity = self.params_snapshot().quantity;
        self.done.set(RuleKind::StopLoss);
        info!(
            symbol = %sel.main.symbol,
            change = rec.change_since_buy,
            stoploss,
            "Stop-loss sell fired"
        );
        self.submit(
            OrderSide::Sell,
            sel.main.token,
            &sel.main.symbol,
            quantity,
            price,
            params,
            cycle,
            deps,
        )
        .await;
    }

    // ─── Order submission ─────────────────────────────────────────────────────

    /// Submit one order. Placement failures fall back to paper semantics
    /// (the reference price stands as the fill) so the state machine never
    /// stalls on the broker; with `paper_fills` set the broker is not
    /// contacted at all. Either way a trade event goes out on telemetry.
    #[allow(clippy::too_many_arguments)]
    async fn submit(
        &self,
        side: OrderSide,
        token: u32,
        symbol: &str,
        quantity: u32,
        reference_price: f64,
        params: &ParameterStore,
        cycle: u64,
        deps: &EngineDeps,
    ) {
        let order = OrderRequest::market(symbol, side, quantity, reference_price);

        if params.shared().boolean("paper_fills") {
            info!(symbol, %side, quantity, price = reference_price, cycle, "Paper fill at reference price");
        } else {
            match deps.gateway.place_order(&order).await {
                Ok(receipt) => {
                    info!(
                        symbol,
                        %side,
                        quantity,
                        order_id = %receipt.order_id,
                        cycle,
                        "Order accepted"
                    );
                    fills::track(
                        deps.gateway.clone(),
                        token,
                        receipt.order_id,
                        side,
                        reference_price,
                        cycle,
                        deps.fill_tx.clone(),
                    );
                }
                Err(e) => {
                    error!(
                        symbol,
                        %side,
                        error = %e,
                        "Order placement failed; falling back to paper fill"
                    );
                }
            }
        }

        let _ = deps.event_tx.send(EngineEvent::Trade(TradeEvent {
            action: side,
            symbol: symbol.to_string(),
            price: reference_price,
            quantity,
            timestamp: Utc::now(),
            cycle,
        }));
    }

    fn params_snapshot(&self) -> CycleParams {
        self.cycle_params.unwrap_or_default()
    }
}

impl Default for DecisionEngine {
    fn default() -> Self {
        Self::new()
    }
}
