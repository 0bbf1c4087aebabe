//! Node infrastructure shared by applications embedding vicinity.
//!
//! - [`config`] - TOML configuration file, converted into the component configs
//! - [`logging`] - Logging initialization

pub mod config;
pub mod logging;

pub use config::NodeConfig;
pub use logging::{LogConfig, init_logging};
