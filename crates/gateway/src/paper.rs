use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use tokio::sync::RwLock;
use tracing::{debug, info};

use common::{Error, ExecutionGateway, OrderReceipt, OrderRequest, OrderSide, Result};

/// A simulated order retained for auditing.
#[derive(Debug, Clone)]
pub struct PaperOrder {
    pub order_id: String,
    pub symbol: String,
    pub side: OrderSide,
    pub quantity: u32,
    pub fill_price: f64,
}

/// Simulated broker for paper trading.
///
/// Orders fill instantly at the reference price; no request ever leaves the
/// process. The DecisionEngine behaves identically against this gateway,
/// which is what makes dry runs meaningful.
pub struct PaperGateway {
    orders: Arc<RwLock<HashMap<String, PaperOrder>>>,
}

impl PaperGateway {
    pub fn new() -> Self {
        info!("PaperGateway initialized — fills simulated at reference price");
        Self {
            orders: Arc::new(RwLock::new(HashMap::new())),
        }
    }

    /// Every simulated order so far, for auditing.
    pub async fn orders(&self) -> Vec<PaperOrder> {
        self.orders.read().await.values().cloned().collect()
    }
}

impl Default for PaperGateway {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl ExecutionGateway for PaperGateway {
    async fn place_order(&self, order: &OrderRequest) -> Result<OrderReceipt> {
        let order_id = uuid::Uuid::new_v4().to_string();
        debug!(
            symbol = %order.symbol,
            side = %order.side,
            qty = order.quantity,
            fill = order.reference_price,
            "Paper fill simulated"
        );
        self.orders.write().await.insert(
            order_id.clone(),
            PaperOrder {
                order_id: order_id.clone(),
                symbol: order.symbol.clone(),
                side: order.side,
                quantity: order.quantity,
                fill_price: order.reference_price,
            },
        );
        Ok(OrderReceipt { order_id })
    }

    async fn resolve_fill(&self, order_id: &str) -> Result<f64> {
        self.orders
            .read()
            .await
            .get(order_id)
            .map(|o| o.fill_price)
            .ok_or_else(|| Error::FillResolution {
                order_id: order_id.to_string(),
                reason: "unknown paper order".to_string(),
            })
    }
}
