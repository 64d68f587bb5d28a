use thiserror::Error;

#[derive(Debug, Error)]
pub enum Error {
    #[error("Broker API error: {0}")]
    Broker(String),

    #[error("HTTP error: {0}")]
    Http(String),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("Configuration error: {0}")]
    Config(String),

    #[error("Fill resolution failed for order {order_id}: {reason}")]
    FillResolution { order_id: String, reason: String },

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("{0}")]
    Other(String),
}

pub type Result<T, E = Error> = std::result::Result<T, E>;
