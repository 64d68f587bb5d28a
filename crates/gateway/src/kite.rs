use std::time::Duration;

use async_trait::async_trait;
use reqwest::Client;
use serde::Deserialize;
use tracing::debug;

use common::{Error, ExecutionGateway, OrderReceipt, OrderRequest, Result};

const BASE_URL: &str = "https://api.kite.trade";

/// How long resolve_fill keeps polling order history before giving up.
const FILL_POLL_ATTEMPTS: u32 = 10;
const FILL_POLL_INTERVAL: Duration = Duration::from_millis(500);

/// REST client for the Kite Connect order API.
///
/// Session management (login, token refresh) is owned by an external
/// collaborator; this client only attaches the pre-issued access token.
pub struct KiteGateway {
    api_key: String,
    access_token: String,
    http: Client,
}

impl KiteGateway {
    pub fn new(api_key: impl Into<String>, access_token: impl Into<String>) -> Self {
        Self {
            api_key: api_key.into(),
            access_token: access_token.into(),
            http: Client::builder()
                .use_rustls_tls()
                .build()
                .expect("Failed to build HTTP client"),
        }
    }

    fn auth_header(&self) -> String {
        format!("token {}:{}", self.api_key, self.access_token)
    }

    async fn order_history(&self, order_id: &str) -> Result<Vec<OrderRecord>> {
        let url = format!("{BASE_URL}/orders/{order_id}");
        let resp = self
            .http
            .get(&url)
            .header("X-Kite-Version", "3")
            .header("Authorization", self.auth_header())
            .send()
            .await
            .map_err(|e| Error::Http(e.to_string()))?;

        let status = resp.status();
        let body = resp.text().await.map_err(|e| Error::Http(e.to_string()))?;
        if !status.is_success() {
            return Err(Error::Broker(format!("HTTP {status}: {body}")));
        }

        let parsed: HistoryResponse = serde_json::from_str(&body)?;
        Ok(parsed.data)
    }
}

#[async_trait]
impl ExecutionGateway for KiteGateway {
    async fn place_order(&self, order: &OrderRequest) -> Result<OrderReceipt> {
        let form = [
            ("tradingsymbol", order.symbol.clone()),
            ("exchange", "NFO".to_string()),
            ("transaction_type", order.side.to_string()),
            ("order_type", "MARKET".to_string()),
            ("quantity", order.quantity.to_string()),
            ("product", "MIS".to_string()),
            ("validity", "DAY".to_string()),
        ];

        debug!(symbol = %order.symbol, side = %order.side, "Submitting order to broker");
        let resp = self
            .http
            .post(format!("{BASE_URL}/orders/regular"))
            .header("X-Kite-Version", "3")
            .header("Authorization", self.auth_header())
            .form(&form)
            .send()
            .await
            .map_err(|e| Error::Http(e.to_string()))?;

        let status = resp.status();
        let body = resp.text().await.map_err(|e| Error::Http(e.to_string()))?;
        if !status.is_success() {
            return Err(Error::Broker(format!("HTTP {status}: {body}")));
        }

        let parsed: PlaceResponse = serde_json::from_str(&body)?;
        Ok(OrderReceipt {
            order_id: parsed.data.order_id,
        })
    }

    async fn resolve_fill(&self, order_id: &str) -> Result<f64> {
        for attempt in 0..FILL_POLL_ATTEMPTS {
            match self.order_history(order_id).await {
                Ok(records) => {
                    // The last history entry with a terminal status carries
                    // the executed price.
                    let done = records
                        .iter()
                        .rev()
                        .find(|r| r.status == "COMPLETE" && r.average_price > 0.0);
                    if let Some(rec) = done {
                        return Ok(rec.average_price);
                    }
                    if records.iter().any(|r| r.status == "REJECTED" || r.status == "CANCELLED") {
                        return Err(Error::FillResolution {
                            order_id: order_id.to_string(),
                            reason: "order rejected or cancelled".to_string(),
                        });
                    }
                }
                Err(e) => {
                    debug!(order_id, attempt, error = %e, "Order history lookup failed");
                }
            }
            tokio::time::sleep(FILL_POLL_INTERVAL).await;
        }

        Err(Error::FillResolution {
            order_id: order_id.to_string(),
            reason: "no terminal fill record within the polling window".to_string(),
        })
    }
}

// ─── Response types ───────────────────────────────────────────────────────────

#[derive(Deserialize)]
struct PlaceResponse {
    data: PlaceData,
}

#[derive(Deserialize)]
struct PlaceData {
    order_id: String,
}

#[derive(Deserialize)]
struct HistoryResponse {
    #[serde(default)]
    data: Vec<OrderRecord>,
}

#[derive(Deserialize)]
struct OrderRecord {
    status: String,
    #[serde(default)]
    average_price: f64,
}
