//! KDL configuration parsing for Keel.
//!
//! This crate handles parsing of:
//! - Coordinator configuration (keel.kdl)
//! - Duration strings such as `"100ms"` or `"5m"`
//! - Environment overrides

pub mod duration;
pub mod error;
pub mod system;

pub use duration::parse_duration;
pub use error::{ConfigError, ConfigResult};
pub use system::{
    CoordinatorConfig, DatabaseConfig, LockConfig, LogFormat, LoggingConfig, MessageConfig,
    RetryConfig, SweeperConfig, WorkerConfig, parse_coordinator_config,
};
