//! Loopback demo: a host and a guest in one process over the in-memory
//! network.
//!
//! Configuration is loaded from `config.ron` and can be overridden via CLI
//! flags. Run with `cargo run -p marionette-cli -- --name Alice` to host as
//! Alice, or pass `--room <id>` to try joining a specific room id instead of
//! the loopback host's.

mod puppet;

use std::error::Error;
use std::sync::Arc;
use std::time::Duration;

use clap::Parser;
use marionette_config::{CliArgs, Config, default_config_dir};
use marionette_net::{AssetKind, MemoryNetwork, PeerId};
use marionette_sync::{SessionOptions, SessionRuntime};
use tracing::info;

use puppet::{ProgressLog, Puppet};

/// How long the demo session stays up before leaving.
const RUN_TIME: Duration = Duration::from_secs(3);

/// Size of the generated avatar model.
const AVATAR_BYTES: usize = 48_000;

#[tokio::main]
async fn main() {
    let args = CliArgs::parse();

    let config_dir = args.config.clone().unwrap_or_else(default_config_dir);
    let mut config = Config::load_or_create(&config_dir).unwrap_or_else(|e| {
        eprintln!("Failed to load config: {e}, using defaults");
        Config::default()
    });
    config.apply_cli_overrides(&args);

    let log_dir = config_dir.join("logs");
    marionette_log::init_logging(Some(&log_dir), cfg!(debug_assertions), Some(&config));

    if let Err(err) = run(&config, args.room.as_deref()).await {
        tracing::error!("Demo failed: {}", err);
        std::process::exit(1);
    }
}

/// Deterministic stand-in for an avatar model file.
fn generated_model(len: usize) -> Vec<u8> {
    let mut state = 0x2545_f491_u32;
    (0..len)
        .map(|_| {
            state ^= state << 13;
            state ^= state >> 17;
            state ^= state << 5;
            state as u8
        })
        .collect()
}

async fn run(config: &Config, room: Option<&str>) -> Result<(), Box<dyn Error>> {
    let network = Arc::new(MemoryNetwork::new());
    let options = SessionOptions::from(config);

    let host_view = Arc::new(Puppet::new("host"));
    let host = SessionRuntime::new(Arc::clone(&network), Arc::clone(&host_view), options.clone())
        .with_progress_observer(Arc::new(ProgressLog))
        .create(&config.session.display_name)
        .await?;
    info!("Room {} is open", host.room_id());
    host.set_local_asset(AssetKind::Avatar, Some(generated_model(AVATAR_BYTES)))
        .await?;

    let target = room.map(PeerId::from).unwrap_or_else(|| host.room_id().clone());
    let guest_view = Arc::new(Puppet::new("guest"));
    let guest = SessionRuntime::new(Arc::clone(&network), Arc::clone(&guest_view), options)
        .with_progress_observer(Arc::new(ProgressLog))
        .join(target, "Guest")
        .await?;
    guest.chat("hello from the loopback guest").await?;

    tokio::time::sleep(RUN_TIME).await;

    for record in host.peers().await? {
        let latency = host.latency(&record.peer_id).await?;
        info!(
            "{} ({}): {:?}, asset: {}, latency: {:?}",
            record.display_name,
            record.peer_id,
            record.connection_state,
            record.has_asset,
            latency.and_then(|l| l.average_ms)
        );
    }
    for state in guest_view.remote_states() {
        info!(
            "Guest sees {} at {:?} ({} expressions)",
            state.display_name,
            state.position,
            state.expressions.len()
        );
    }
    info!("Host renders {} remote avatars", host_view.remote_states().len());

    guest.leave().await?;
    let notified = host.leave().await?;
    info!("Host left, {} peers notified", notified);
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_generated_model_is_stable() {
        let a = generated_model(64);
        assert_eq!(a.len(), 64);
        assert_eq!(a, generated_model(64));
        assert!(a.iter().any(|b| *b != a[0]));
    }
}
