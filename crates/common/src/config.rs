use crate::TradingMode;

/// All configuration loaded from environment variables at startup.
/// Missing required variables cause an immediate panic with a clear message;
/// startup-time configuration errors are the only fatal errors in the system.
#[derive(Debug, Clone)]
pub struct Config {
    // Broker credentials (required only in live mode; the session itself —
    // login flow, token refresh — is owned by an external collaborator)
    pub kite_api_key: String,
    pub kite_access_token: String,

    // Trading
    pub trading_mode: TradingMode,

    // Parameter override file path
    pub params_config_path: String,
}

impl Config {
    /// Load all configuration from environment variables.
    /// Loads `.env` if present. Panics on any missing required variable.
    pub fn from_env() -> Self {
        let _ = dotenvy::dotenv(); // ignore error if .env not present

        let trading_mode = match required_env("TRADING_MODE").to_lowercase().as_str() {
            "paper" => TradingMode::Paper,
            "live" => TradingMode::Live,
            other => panic!("ERROR: TRADING_MODE must be 'paper' or 'live', got: '{other}'"),
        };

        // Credentials are required before live trading can be enabled.
        let (kite_api_key, kite_access_token) = match trading_mode {
            TradingMode::Live => (
                required_env("KITE_API_KEY"),
                required_env("KITE_ACCESS_TOKEN"),
            ),
            TradingMode::Paper => (
                optional_env("KITE_API_KEY").unwrap_or_default(),
                optional_env("KITE_ACCESS_TOKEN").unwrap_or_default(),
            ),
        };

        Config {
            kite_api_key,
            kite_access_token,
            trading_mode,
            params_config_path: optional_env("PARAMS_CONFIG_PATH")
                .unwrap_or_else(|| "config/params.toml".to_string()),
        }
    }
}

fn required_env(key: &str) -> String {
    std::env::var(key).unwrap_or_else(|_| {
        panic!("Required environment variable '{key}' is not set. Check your .env file.")
    })
}

fn optional_env(key: &str) -> Option<String> {
    std::env::var(key).ok()
}
