use std::collections::HashMap;

use serde::{Deserialize, Serialize};
use tracing::warn;

use common::ParamScope;

/// Declared type of a parameter.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ParamKind {
    Number,
    Integer,
    Boolean,
    String,
}

/// A typed parameter value.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum ParamValue {
    Number(f64),
    Integer(i64),
    Boolean(bool),
    Text(String),
}

impl ParamValue {
    pub fn as_f64(&self) -> Option<f64> {
        match self {
            ParamValue::Number(v) => Some(*v),
            ParamValue::Integer(v) => Some(*v as f64),
            _ => None,
        }
    }

    pub fn as_i64(&self) -> Option<i64> {
        match self {
            ParamValue::Integer(v) => Some(*v),
            _ => None,
        }
    }

    pub fn as_bool(&self) -> Option<bool> {
        match self {
            ParamValue::Boolean(v) => Some(*v),
            _ => None,
        }
    }

    pub fn as_str(&self) -> Option<&str> {
        match self {
            ParamValue::Text(v) => Some(v),
            _ => None,
        }
    }
}

/// Declaration of one named setting: type, default, optional numeric bounds.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ParamSpec {
    pub name: String,
    pub kind: ParamKind,
    pub default: ParamValue,
    pub min: Option<f64>,
    pub max: Option<f64>,
    pub description: String,
}

impl ParamSpec {
    pub fn new(
        name: &str,
        kind: ParamKind,
        default: ParamValue,
        min: Option<f64>,
        max: Option<f64>,
        description: &str,
    ) -> Self {
        Self {
            name: name.to_string(),
            kind,
            default,
            min,
            max,
            description: description.to_string(),
        }
    }
}

/// Catalog entry published for external configuration tooling.
#[derive(Debug, Clone, Serialize)]
pub struct CatalogEntry {
    pub name: String,
    #[serde(rename = "type")]
    pub kind: ParamKind,
    pub default: ParamValue,
    pub min: Option<f64>,
    pub max: Option<f64>,
    pub description: String,
}

/// One namespace of typed, validated, live-updatable settings.
#[derive(Debug, Clone, Default)]
pub struct ParamTable {
    specs: Vec<ParamSpec>,
    values: HashMap<String, ParamValue>,
}

impl ParamTable {
    pub fn new(specs: Vec<ParamSpec>) -> Self {
        Self {
            specs,
            values: HashMap::new(),
        }
    }

    fn spec(&self, name: &str) -> Option<&ParamSpec> {
        self.specs.iter().find(|s| s.name == name)
    }

    /// Apply an update. Returns `true` and applies the value only if the
    /// name is declared, the value coerces to the declared type, and the
    /// numeric bounds hold; otherwise the table is left unchanged.
    pub fn update(&mut self, name: &str, value: &serde_json::Value) -> bool {
        let Some(spec) = self.spec(name) else {
            warn!(name, "Rejected update for undeclared parameter");
            return false;
        };

        let Some(coerced) = coerce(spec.kind, value) else {
            warn!(name, ?value, "Rejected parameter update: type mismatch");
            return false;
        };

        if let Some(n) = coerced.as_f64() {
            if spec.min.is_some_and(|min| n < min) || spec.max.is_some_and(|max| n > max) {
                warn!(name, value = n, "Rejected parameter update: out of bounds");
                return false;
            }
        }

        self.values.insert(name.to_string(), coerced);
        true
    }

    /// Current value (or the declared default) of a numeric parameter.
    /// Unknown names fall back to 0.0 with a warning.
    pub fn number(&self, name: &str) -> f64 {
        self.value(name).and_then(|v| v.as_f64()).unwrap_or_else(|| {
            warn!(name, "Unknown numeric parameter read");
            0.0
        })
    }

    pub fn integer(&self, name: &str) -> i64 {
        self.value(name).and_then(|v| v.as_i64()).unwrap_or_else(|| {
            warn!(name, "Unknown integer parameter read");
            0
        })
    }

    pub fn boolean(&self, name: &str) -> bool {
        self.value(name)
            .and_then(|v| v.as_bool())
            .unwrap_or_else(|| {
                warn!(name, "Unknown boolean parameter read");
                false
            })
    }

    pub fn text(&self, name: &str) -> String {
        self.value(name)
            .and_then(|v| v.as_str().map(str::to_string))
            .unwrap_or_else(|| {
                warn!(name, "Unknown string parameter read");
                String::new()
            })
    }

    fn value(&self, name: &str) -> Option<ParamValue> {
        self.values
            .get(name)
            .cloned()
            .or_else(|| self.spec(name).map(|s| s.default.clone()))
    }

    pub fn catalog(&self) -> Vec<CatalogEntry> {
        self.specs
            .iter()
            .map(|s| CatalogEntry {
                name: s.name.clone(),
                kind: s.kind,
                default: s.default.clone(),
                min: s.min,
                max: s.max,
                description: s.description.clone(),
            })
            .collect()
    }
}

fn coerce(kind: ParamKind, value: &serde_json::Value) -> Option<ParamValue> {
    match kind {
        ParamKind::Number => value.as_f64().map(ParamValue::Number),
        ParamKind::Integer => match value.as_i64() {
            Some(v) => Some(ParamValue::Integer(v)),
            // Integral floats ("75.0") are accepted; anything fractional is not.
            None => value.as_f64().and_then(|f| {
                if f.fract() == 0.0 && f.is_finite() {
                    Some(ParamValue::Integer(f as i64))
                } else {
                    None
                }
            }),
        },
        ParamKind::Boolean => value.as_bool().map(ParamValue::Boolean),
        ParamKind::String => value.as_str().map(|s| ParamValue::Text(s.to_string())),
    }
}

/// Both parameter namespaces of one strategy instance.
///
/// Owned exclusively by that instance's controller task; updates from the
/// control channel are applied strictly between tick batches.
#[derive(Debug, Clone, Default)]
pub struct ParameterStore {
    strategy: ParamTable,
    shared: ParamTable,
}

impl ParameterStore {
    pub fn new(strategy: ParamTable, shared: ParamTable) -> Self {
        Self { strategy, shared }
    }

    /// The per-strategy namespace.
    pub fn strategy(&self) -> &ParamTable {
        &self.strategy
    }

    /// The cross-cutting namespace.
    pub fn shared(&self) -> &ParamTable {
        &self.shared
    }

    pub fn update(&mut self, scope: ParamScope, name: &str, value: &serde_json::Value) -> bool {
        match scope {
            ParamScope::PerStrategy => self.strategy.update(name, value),
            ParamScope::CrossCutting => self.shared.update(name, value),
        }
    }

    pub fn catalog(&self, scope: ParamScope) -> Vec<CatalogEntry> {
        match scope {
            ParamScope::PerStrategy => self.strategy.catalog(),
            ParamScope::CrossCutting => self.shared.catalog(),
        }
    }
}

// ─── Tests ────────────────────────────────────────────────────────────────────
