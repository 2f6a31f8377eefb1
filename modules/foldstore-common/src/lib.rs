pub mod config;
pub mod telemetry;

pub use config::{load_config, EngineConfig, PersistenceMode};
