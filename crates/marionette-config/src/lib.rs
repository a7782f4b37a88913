//! Configuration system for Marionette sessions.
//!
//! Settings persist to disk as RON files, accept CLI overrides via clap, and
//! tolerate missing or unknown fields so older config files keep loading.

mod cli;
mod config;
mod error;

pub use cli::CliArgs;
pub use config::{
    CONFIG_FILE_NAME, Config, DebugConfig, FilterConfig, ReconnectConfig, SessionConfig, SyncConfig, TransferConfig,
    default_config_dir,
};
pub use error::ConfigError;
