//! Command-line argument parsing for Marionette.

use std::path::PathBuf;

use clap::Parser;

use crate::Config;

/// Marionette command-line arguments.
///
/// CLI values override settings loaded from `config.ron`.
#[derive(Parser, Debug, Default)]
#[command(name = "marionette", about = "Shared avatar session")]
pub struct CliArgs {
    /// Display name announced to other participants.
    #[arg(long)]
    pub name: Option<String>,

    /// Room to join. Omit to host a new room.
    #[arg(long)]
    pub room: Option<String>,

    /// Maximum peers admitted when hosting.
    #[arg(long)]
    pub max_peers: Option<usize>,

    /// Bytes per transfer chunk.
    #[arg(long)]
    pub chunk_size: Option<usize>,

    /// Log level (error, warn, info, debug, trace).
    #[arg(long)]
    pub log_level: Option<String>,

    /// Path to config directory (overrides default location).
    #[arg(long)]
    pub config: Option<PathBuf>,
}

impl Config {
    /// Apply CLI overrides to a loaded config.
    pub fn apply_cli_overrides(&mut self, args: &CliArgs) {
        if let Some(ref name) = args.name {
            self.session.display_name = name.clone();
        }
        if let Some(max) = args.max_peers {
            self.session.max_peers = max;
        }
        if let Some(size) = args.chunk_size {
            self.transfer.chunk_size = size;
        }
        if let Some(ref level) = args.log_level {
            self.debug.log_level = level.clone();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_cli_override() {
        let mut config = Config::default();
        let args = CliArgs {
            name: Some("Ada".to_string()),
            chunk_size: Some(6000),
            ..Default::default()
        };
        config.apply_cli_overrides(&args);
        assert_eq!(config.session.display_name, "Ada");
        assert_eq!(config.transfer.chunk_size, 6000);
        // Non-overridden fields retain defaults
        assert_eq!(config.session.max_peers, 8);
        assert_eq!(config.debug.log_level, "info");
    }

    #[test]
    fn test_cli_no_override() {
        let original = Config::default();
        let mut config = Config::default();
        config.apply_cli_overrides(&CliArgs::default());
        assert_eq!(config, original);
    }

    #[test]
    fn test_cli_parses_flags() {
        let args =
            CliArgs::try_parse_from(["marionette", "--room", "abc123", "--max-peers", "4"]).unwrap();
        assert_eq!(args.room.as_deref(), Some("abc123"));
        assert_eq!(args.max_peers, Some(4));
        assert!(args.name.is_none());
    }
}
