pub mod loader;
pub mod schema;

pub use loader::{config_path, load_config, load_config_from_str, load_default_config};
pub use schema::{OperatorConfig, StoreKind};
