//! Built-in parameter declarations for both namespaces.

use crate::store::{ParamKind, ParamSpec, ParamTable, ParamValue, ParameterStore};

/// Per-strategy settings: selection band, entry trigger, and the decision
/// rule thresholds.
pub fn strategy_table() -> ParamTable {
    ParamTable::new(vec![
        ParamSpec::new(
            "quantity",
            ParamKind::Integer,
            ParamValue::Integer(75),
            Some(1.0),
            Some(10_000.0),
            "order quantity per leg, in contract units",
        ),
        ParamSpec::new(
            "main_kind",
            ParamKind::String,
            ParamValue::Text("CE".to_string()),
            None,
            None,
            "kind of the main leg: CE or PE",
        ),
        ParamSpec::new(
            "select_base",
            ParamKind::Number,
            ParamValue::Number(20.0),
            Some(0.0),
            None,
            "lower bound of the selection price band",
        ),
        ParamSpec::new(
            "select_width",
            ParamKind::Number,
            ParamValue::Number(90.0),
            Some(1.0),
            None,
            "width of the selection price band",
        ),
        ParamSpec::new(
            "select_step",
            ParamKind::Number,
            ParamValue::Number(5.0),
            Some(0.1),
            None,
            "amount the band widens per retry when too few instruments qualify",
        ),
        ParamSpec::new(
            "select_floor",
            ParamKind::Number,
            ParamValue::Number(10.0),
            Some(0.0),
            None,
            "lowest the band's lower bound may be widened to",
        ),
        ParamSpec::new(
            "target_premium",
            ParamKind::Number,
            ParamValue::Number(100.0),
            Some(0.0),
            None,
            "preferred premium; ties are broken by least deviation from it",
        ),
        ParamSpec::new(
            "entry_drop_pct",
            ParamKind::Number,
            ParamValue::Number(3.0),
            Some(0.0),
            Some(100.0),
            "percent fall from first observed price that starts the decision phase",
        ),
        ParamSpec::new(
            "target",
            ParamKind::Number,
            ParamValue::Number(10.0),
            Some(0.0),
            None,
            "profit target in points over the buy price",
        ),
        ParamSpec::new(
            "target_epsilon",
            ParamKind::Number,
            ParamValue::Number(0.5),
            Some(0.0),
            None,
            "tolerance below the target at which the profit latch arms",
        ),
        ParamSpec::new(
            "stoploss",
            ParamKind::Number,
            ParamValue::Number(-10.0),
            None,
            Some(0.0),
            "loss in points from the buy price that forces an exit",
        ),
        ParamSpec::new(
            "rebuy_drop",
            ParamKind::Number,
            ParamValue::Number(5.0),
            Some(0.0),
            None,
            "dip in points below the reference that triggers the one-shot rebuy",
        ),
        ParamSpec::new(
            "peak_fall_margin",
            ParamKind::Number,
            ParamValue::Number(2.0),
            Some(0.0),
            None,
            "retreat from the running peak that marks a peak-and-fall",
        ),
        ParamSpec::new(
            "buyback_ceiling",
            ParamKind::Number,
            ParamValue::Number(100.0),
            Some(0.0),
            None,
            "buy-back picks the opposite-kind instrument nearest below this price",
        ),
        ParamSpec::new(
            "buyback_target",
            ParamKind::Number,
            ParamValue::Number(10.0),
            Some(0.0),
            None,
            "profit target in points for the buy-back leg",
        ),
    ])
}

/// Cross-cutting settings shared by every strategy of an account.
pub fn shared_table() -> ParamTable {
    ParamTable::new(vec![
        ParamSpec::new(
            "trading_enabled",
            ParamKind::Boolean,
            ParamValue::Boolean(true),
            None,
            None,
            "when false, no new orders are submitted; observation continues",
        ),
        ParamSpec::new(
            "paper_fills",
            ParamKind::Boolean,
            ParamValue::Boolean(false),
            None,
            None,
            "when true, fills are simulated at the reference price without calling the broker",
        ),
    ])
}

/// Store preloaded with every built-in declaration.
pub fn default_store() -> ParameterStore {
    ParameterStore::new(strategy_table(), shared_table())
}
