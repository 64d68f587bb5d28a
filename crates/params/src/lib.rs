pub mod defaults;
pub mod file;
pub mod store;

pub use defaults::default_store;
pub use file::ParamFileConfig;
pub use store::{CatalogEntry, ParamKind, ParamSpec, ParamTable, ParamValue, ParameterStore};
