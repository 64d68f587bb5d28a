pub mod controller;
pub mod decision;
pub mod fills;

pub use controller::CycleController;
pub use decision::{DecisionEngine, EngineDeps, RuleKind, DEFAULT_RULE_ORDER};
pub use fills::FillUpdate;
