use async_trait::async_trait;

use crate::{OrderReceipt, OrderRequest, Result};

/// Abstraction over the external broker.
///
/// `KiteGateway` implements this for live trading, `PaperGateway` for
/// simulation. The gateway performs no deduplication: at-most-once
/// submission per (instrument, action) is the DecisionEngine's job,
/// enforced through its per-rule done flags.
#[async_trait]
pub trait ExecutionGateway: Send + Sync {
    /// Submit an order. Returns the broker-assigned order id on acceptance;
    /// the fill price resolves later via `resolve_fill`.
    async fn place_order(&self, order: &OrderRequest) -> Result<OrderReceipt>;

    /// Resolve the executed price for an accepted order, polling broker
    /// order history until a terminal fill record exists.
    async fn resolve_fill(&self, order_id: &str) -> Result<f64>;
}
