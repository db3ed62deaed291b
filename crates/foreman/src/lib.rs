pub mod asset;
pub mod backend;
pub mod config;
pub mod error;
pub mod global;
pub mod lock;
pub mod manifest;
pub mod operation;
pub mod resource;
pub mod session;
pub mod strategy;
pub mod telemetry;
pub mod values;

pub use asset::{Asset, AssetCache};
pub use backend::{Backends, ClusterGateway, ReleaseStore, RemoteBundleStore, Templater, Validator};
pub use config::{load_config, OperatorConfig};
pub use error::{ConfigError, ForemanError, Result};
pub use lock::{LockGuard, ReentrantLock};
pub use manifest::{Manifest, ManifestItem};
pub use operation::Orchestrator;
pub use resource::{AssetRef, ResourceSpec, ResourceStore};
pub use session::{Deadline, Session, SessionOptions, TeardownHandle, Wait};
pub use strategy::{
    RolloutOutcome, RolloutReport, RotationEngine, Status, Strategy, StrategyRegistry,
    UninstallReport,
};
pub use telemetry::{init_logging, LogFormat};
