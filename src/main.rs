//! voicedeck-daemon: live voice conversations driven from a USB button deck
//!
//! This daemon provides:
//! - Key edge decoding and key images for the deck
//! - Microphone capture and gapless playback
//! - A persistent connection to the live conversation service
//! - A recording state machine tying them together
//!
//! Key 0 is push-to-talk, key 1 toggles hands-free recording. Releasing
//! push-to-talk or toggling off ends the user's turn.

mod audio;
mod config;
mod device;
mod events;
mod history;
mod lifecycle;
mod session;
mod state;
#[cfg(test)]
mod testing;

use std::sync::Arc;

use anyhow::{bail, Result};
use tracing::{error, info};
use tracing_subscriber::EnvFilter;

use crate::audio::AudioPipeline;
use crate::config::{Config, ConfigProvider, FileConfigProvider, API_KEY_VAR};
use crate::device::{DeviceDriver, IconSet, KeyImageEncoder};
use crate::lifecycle::ShutdownSignal;
use crate::session::{LiveSessionClient, WsConnector};
use crate::state::Coordinator;

#[tokio::main]
async fn main() -> Result<()> {
    // Initialize logging
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    info!(
        version = env!("CARGO_PKG_VERSION"),
        "voicedeck-daemon starting"
    );

    // Load configuration, writing defaults on first run
    let provider = FileConfigProvider::from_env()?;
    let config = provider.load()?;
    if !provider.path().exists() {
        provider.save(&config)?;
        info!(path = %provider.path().display(), "default configuration written");
    }
    config.validate()?;
    info!(
        path = %provider.path().display(),
        model = %config.session.model,
        "configuration loaded"
    );

    if config.api_key.is_none() {
        bail!("{} is not set", API_KEY_VAR);
    }

    let icons = config.device.icons_dir.as_deref().map(|dir| {
        let set = IconSet::load(dir);
        info!(count = set.len(), "key images loaded");
        Arc::new(set) as Arc<dyn KeyImageEncoder>
    });

    let (device, audio) = open_hardware(&config)?;
    let session = LiveSessionClient::new(
        Arc::new(WsConnector::new()),
        config.audio.input_sample_rate,
    );

    let mut coordinator = Coordinator::new(config, device, audio, session, icons);
    if let Err(e) = coordinator.start().await {
        error!(error = %e, "startup failed");
        coordinator.shutdown().await;
        return Err(e);
    }

    let shutdown = ShutdownSignal::new();
    info!("daemon initialized, entering main loop");
    coordinator.run(shutdown.wait()).await;

    info!("voicedeck-daemon stopped");
    Ok(())
}

#[cfg(feature = "hardware")]
fn open_hardware(config: &Config) -> Result<(DeviceDriver, AudioPipeline)> {
    use crate::audio::CpalHost;
    use crate::device::HidTransport;

    let device = DeviceDriver::new(Arc::new(HidTransport::new()));
    let audio = AudioPipeline::new(Arc::new(CpalHost::new()), config.audio.clone());
    Ok((device, audio))
}

#[cfg(not(feature = "hardware"))]
fn open_hardware(_config: &Config) -> Result<(DeviceDriver, AudioPipeline)> {
    bail!("built without USB and audio support; rebuild with `--features hardware`")
}
