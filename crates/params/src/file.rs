use serde::Deserialize;
use tracing::{info, warn};

use common::{Error, ParamScope, Result};

use crate::store::ParameterStore;

/// Parameter overrides loaded from a TOML file at startup.
///
/// Example `config/params.toml`:
/// ```toml
/// [strategy]
/// quantity = 150
/// target = 12.0
/// stoploss = -8.0
///
/// [shared]
/// trading_enabled = true
/// ```
///
/// Overrides pass through the same validated update path as the control
/// channel; invalid entries are logged and skipped, never applied.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct ParamFileConfig {
    #[serde(default)]
    pub strategy: toml::Table,
    #[serde(default)]
    pub shared: toml::Table,
}

impl ParamFileConfig {
    /// Load overrides from a TOML file. Returns `Ok(None)` if the file does
    /// not exist (built-in defaults apply); a malformed file is a
    /// configuration error, fatal at startup.
    pub fn load(path: &str) -> Result<Option<Self>> {
        let content = match std::fs::read_to_string(path) {
            Ok(c) => c,
            Err(_) => {
                info!(path, "No parameter override file; using built-in defaults");
                return Ok(None);
            }
        };
        let parsed = toml::from_str(&content)
            .map_err(|e| Error::Config(format!("invalid parameter overrides at '{path}': {e}")))?;
        Ok(Some(parsed))
    }

    /// Apply all overrides to the store through the validated update path.
    pub fn apply(&self, store: &mut ParameterStore) {
        for (scope, table) in [
            (ParamScope::PerStrategy, &self.strategy),
            (ParamScope::CrossCutting, &self.shared),
        ] {
            for (name, value) in table {
                let json = toml_to_json(value);
                if store.update(scope, name, &json) {
                    info!(?scope, name, %json, "Parameter override applied");
                } else {
                    warn!(?scope, name, %json, "Parameter override rejected");
                }
            }
        }
    }
}

fn toml_to_json(value: &toml::Value) -> serde_json::Value {
    match value {
        toml::Value::Integer(v) => serde_json::json!(v),
        toml::Value::Float(v) => serde_json::json!(v),
        toml::Value::Boolean(v) => serde_json::json!(v),
        toml::Value::String(v) => serde_json::json!(v),
        other => serde_json::json!(other.to_string()),
    }
}
