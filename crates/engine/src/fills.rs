use std::sync::Arc;

use tokio::sync::mpsc;
use tracing::{info, warn};

use common::{ExecutionGateway, OrderSide};

/// Completion report for one tracked order, delivered back to the
/// controller on the fill channel and applied between tick batches.
#[derive(Debug, Clone)]
pub struct FillUpdate {
    pub token: u32,
    pub order_id: String,
    pub side: OrderSide,
    pub executed_price: f64,
    /// Cycle the order was submitted in. A fill outliving its cycle refers
    /// to a position that no longer exists and must be dropped.
    pub cycle: u64,
}

/// Spawn a task that resolves the fill for one accepted order.
///
/// The task polls broker history via the gateway; on failure, or a zero
/// executed price, the reference price stands in as the fill, so the state
/// machine never stalls on the broker. Ledger adjustments happen only when
/// the controller receives the `FillUpdate`, never here.
pub fn track(
    gateway: Arc<dyn ExecutionGateway>,
    token: u32,
    order_id: String,
    side: OrderSide,
    reference_price: f64,
    cycle: u64,
    fill_tx: mpsc::Sender<FillUpdate>,
) {
    tokio::spawn(async move {
        let executed_price = match gateway.resolve_fill(&order_id).await {
            Ok(price) if price > 0.0 => price,
            Ok(_) => {
                warn!(order_id, "Fill resolved to zero price; using reference price");
                reference_price
            }
            Err(e) => {
                warn!(order_id, error = %e, "Fill resolution failed; using reference price");
                reference_price
            }
        };

        info!(order_id, token, executed_price, "Order fill resolved");
        let _ = fill_tx
            .send(FillUpdate {
                token,
                order_id,
                side,
                executed_price,
                cycle,
            })
            .await;
    });
}
