//! Recording coordinator
//!
//! Owns the deck, the audio pipeline and the conversation session, and runs
//! the state machine against their events from a single task.

use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use tokio::sync::broadcast::{self, error::RecvError};
use tokio::sync::mpsc;
use tokio::time::Instant;
use tracing::{debug, error, info, trace, warn};

use crate::audio::AudioPipeline;
use crate::config::Config;
use crate::device::{DeviceDriver, KeyImageEncoder, KeyRole};
use crate::events::{AudioEvent, DeviceEvent, DisconnectSource, EventBus, SessionEvent, StateEvent};
use crate::history::History;
use crate::session::{Credential, InboundMessage, LiveSessionClient, Role, SessionError, UsageReport};

use super::machine::{Action, KeyBindings, RecordingMode, StateMachine};

/// One transcription fragment
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Transcript {
    pub role: Role,
    pub text: String,
}

pub struct Coordinator {
    config: Config,
    machine: StateMachine,
    device: DeviceDriver,
    audio: AudioPipeline,
    session: LiveSessionClient,
    icons: Option<Arc<dyn KeyImageEncoder>>,
    events: EventBus<StateEvent>,

    device_events: broadcast::Receiver<DeviceEvent>,
    audio_events: broadcast::Receiver<AudioEvent>,
    session_events: broadcast::Receiver<SessionEvent>,

    /// Deadline of a delayed turn-boundary signal
    pending_turn: Option<Instant>,
    transcripts: History<Transcript>,
    usage: UsageReport,
    /// Key images waiting to be written, in the order they were requested
    icon_queue: Option<mpsc::UnboundedSender<(u8, Vec<u8>)>>,
}

impl Coordinator {
    pub fn new(
        config: Config,
        device: DeviceDriver,
        audio: AudioPipeline,
        session: LiveSessionClient,
        icons: Option<Arc<dyn KeyImageEncoder>>,
    ) -> Self {
        let events = EventBus::default();
        let bindings = KeyBindings {
            push_to_talk: config.device.push_to_talk_key,
            toggle: config.device.toggle_key,
        };

        // Subscribe before anything connects so no edge is missed
        let device_events = device.subscribe();
        let audio_events = audio.subscribe();
        let session_events = session.subscribe();

        Self {
            machine: StateMachine::new(bindings, events.clone()),
            transcripts: History::new(config.recording.transcript_history),
            config,
            device,
            audio,
            session,
            icons,
            events,
            device_events,
            audio_events,
            session_events,
            pending_turn: None,
            usage: UsageReport::default(),
            icon_queue: None,
        }
    }

    /// Subscribe to mode changes and turn-boundary notifications
    pub fn subscribe(&self) -> broadcast::Receiver<StateEvent> {
        self.events.subscribe()
    }

    pub fn mode(&self) -> RecordingMode {
        self.machine.mode()
    }

    /// Most recent transcription fragments, oldest first
    pub fn transcripts(&self) -> &History<Transcript> {
        &self.transcripts
    }

    /// Token usage summed over the session
    pub fn usage(&self) -> UsageReport {
        self.usage
    }

    /// Connect the deck, open the audio devices and the conversation
    pub async fn start(&mut self) -> Result<()> {
        self.device
            .connect(self.config.device.show_picker)
            .await
            .context("failed to connect deck")?;
        describe_device(&self.device).await;

        if let Err(e) = self.device.reset().await {
            warn!(error = %e, "failed to reset deck");
        }
        if let Err(e) = self.device.set_brightness(self.config.device.brightness).await {
            warn!(error = %e, "failed to set deck brightness");
        }
        self.push_icons(RecordingMode::Idle);

        self.audio
            .initialize(None)
            .context("failed to initialize audio")?;

        let credential = self
            .config
            .api_key
            .as_deref()
            .map(Credential::new)
            .context("no API key configured")?;
        self.session
            .connect(&credential, &self.config.session)
            .await
            .context("failed to open conversation session")?;

        info!("coordinator started");
        Ok(())
    }

    /// Process events until `shutdown` resolves, then release everything
    pub async fn run(&mut self, shutdown: impl Future<Output = ()>) {
        tokio::pin!(shutdown);

        loop {
            tokio::select! {
                event = self.device_events.recv() => match event {
                    Ok(event) => self.on_device_event(event).await,
                    Err(RecvError::Lagged(n)) => warn!(skipped = n, "device event receiver lagged"),
                    Err(RecvError::Closed) => break,
                },

                event = self.audio_events.recv() => match event {
                    Ok(event) => self.on_audio_event(event).await,
                    Err(RecvError::Lagged(n)) => warn!(skipped = n, "audio event receiver lagged"),
                    Err(RecvError::Closed) => break,
                },

                event = self.session_events.recv() => match event {
                    Ok(event) => self.on_session_event(event).await,
                    Err(RecvError::Lagged(n)) => warn!(skipped = n, "session event receiver lagged"),
                    Err(RecvError::Closed) => break,
                },

                _ = wait_for(self.pending_turn), if self.pending_turn.is_some() => {
                    self.pending_turn = None;
                    self.send_turn_boundary().await;
                }

                _ = &mut shutdown => {
                    info!("shutdown requested");
                    break;
                }
            }
        }

        self.shutdown().await;
    }

    /// Stop streaming and close all connections; safe to call repeatedly
    pub async fn shutdown(&mut self) {
        self.pending_turn = None;
        self.icon_queue = None;
        self.audio.stop_streaming();
        self.session.disconnect().await;
        self.device.disconnect().await;
        self.audio.stop();

        info!(
            transcripts = self.transcripts.len(),
            prompt_tokens = self.usage.prompt_tokens,
            response_tokens = self.usage.response_tokens,
            total_tokens = self.usage.total_tokens,
            "coordinator stopped"
        );
    }

    async fn on_device_event(&mut self, event: DeviceEvent) {
        match event {
            DeviceEvent::Connected => debug!("deck connected"),
            DeviceEvent::Key(edge) => {
                let before = self.machine.mode();
                let actions = self.machine.handle_key(edge);
                self.apply(before, actions).await;
            }
            DeviceEvent::Disconnected { unplugged } => {
                warn!(unplugged, "deck disconnected, recording disabled");
                let before = self.machine.mode();
                let actions = self.machine.handle_disconnect(DisconnectSource::Device);
                self.apply(before, actions).await;
            }
            DeviceEvent::Error { message } => warn!(%message, "deck fault"),
        }
    }

    async fn on_audio_event(&mut self, event: AudioEvent) {
        match event {
            AudioEvent::Frame(frame) => {
                if self.session.is_open() {
                    self.session.send_audio(&frame.to_bytes()).await;
                } else {
                    trace!(sequence = frame.sequence, "frame dropped, session not open");
                }
            }
            AudioEvent::StreamingStarted => debug!("capture streaming"),
            AudioEvent::StreamingStopped => debug!("capture paused"),
            AudioEvent::Warning { message } => warn!(%message, "audio warning"),
            AudioEvent::Error { message } => error!(%message, "audio fault"),
        }
    }

    async fn on_session_event(&mut self, event: SessionEvent) {
        match event {
            SessionEvent::Opened => debug!("conversation session open"),
            SessionEvent::Message(message) => self.on_message(message),
            SessionEvent::Error { message } => warn!(%message, "conversation session fault"),
            SessionEvent::Closed { reason } => {
                warn!(%reason, "conversation session closed, recording disabled");
                let before = self.machine.mode();
                let actions = self.machine.handle_disconnect(DisconnectSource::Session);
                self.apply(before, actions).await;
            }
        }
    }

    fn on_message(&mut self, message: InboundMessage) {
        match message {
            InboundMessage::AudioChunk(pcm) => {
                if let Err(e) = self.audio.play_audio(&pcm) {
                    warn!(error = %e, bytes = pcm.len(), "failed to play audio chunk");
                }
            }
            InboundMessage::TranscriptionFragment { role, text } => {
                info!(?role, %text, "transcript");
                self.transcripts.push(Transcript { role, text });
            }
            InboundMessage::TurnComplete => debug!("model turn complete"),
            InboundMessage::UsageReport(usage) => {
                let totals = &mut self.usage;
                totals.prompt_tokens = totals.prompt_tokens.saturating_add(usage.prompt_tokens);
                totals.response_tokens = totals.response_tokens.saturating_add(usage.response_tokens);
                totals.total_tokens = totals.total_tokens.saturating_add(usage.total_tokens);
                debug!(
                    prompt_tokens = usage.prompt_tokens,
                    response_tokens = usage.response_tokens,
                    session_total = self.usage.total_tokens,
                    "usage reported"
                );
            }
            InboundMessage::ErrorNotice(notice) => warn!(%notice, "conversation service notice"),
            InboundMessage::Ignored => {}
        }
    }

    /// Carry out the side effects of a transition away from `before`
    async fn apply(&mut self, before: RecordingMode, actions: Vec<Action>) {
        for action in actions {
            match action {
                Action::StartStreaming => self.audio.start_streaming(),
                Action::StopStreaming => self.audio.stop_streaming(),
                Action::ScheduleTurnBoundary => {
                    let delay_ms = self.config.recording.turn_signal_delay_ms;
                    if delay_ms == 0 {
                        self.send_turn_boundary().await;
                    } else {
                        debug!(delay_ms, "turn boundary scheduled");
                        self.pending_turn = Some(Instant::now() + Duration::from_millis(delay_ms));
                    }
                }
                Action::CancelTurnBoundary => {
                    if self.pending_turn.take().is_some() {
                        info!("pending turn boundary cancelled");
                        self.events.publish(StateEvent::TurnBoundaryCancelled);
                    }
                }
            }
        }

        let mode = self.machine.mode();
        if mode != before {
            self.push_icons(mode);
        }
    }

    async fn send_turn_boundary(&mut self) {
        match self.session.send_turn_boundary().await {
            Ok(()) => {
                info!("turn boundary sent");
                self.events.publish(StateEvent::TurnBoundarySent);
            }
            Err(SessionError::NotConnected) => debug!("no session, turn boundary skipped"),
            Err(e) => warn!(error = %e, "failed to send turn boundary"),
        }
    }

    /// Swap key images to reflect `mode`
    ///
    /// Transfers run in the background on a single writer, so the deck
    /// always ends up showing the images for the latest mode.
    fn push_icons(&mut self, mode: RecordingMode) {
        let Some(icons) = &self.icons else {
            return;
        };
        if !self.device.is_connected() {
            return;
        }

        let keys = [
            (
                KeyRole::PushToTalk,
                self.config.device.push_to_talk_key,
                mode == RecordingMode::PushToTalkActive,
            ),
            (
                KeyRole::Toggle,
                self.config.device.toggle_key,
                mode == RecordingMode::ToggleActive,
            ),
        ];

        let images: Vec<(u8, Vec<u8>)> = keys
            .into_iter()
            .filter_map(|(role, key, active)| Some((key, icons.encode(role, active)?)))
            .collect();

        if self.icon_queue.as_ref().map_or(true, |queue| queue.is_closed()) {
            self.icon_queue = Some(spawn_icon_writer(self.device.clone()));
        }
        let Some(queue) = &self.icon_queue else {
            return;
        };
        for image in images {
            if queue.send(image).is_err() {
                warn!("key image writer stopped");
                return;
            }
        }
    }
}

fn spawn_icon_writer(device: DeviceDriver) -> mpsc::UnboundedSender<(u8, Vec<u8>)> {
    let (tx, mut rx) = mpsc::unbounded_channel::<(u8, Vec<u8>)>();
    tokio::spawn(async move {
        while let Some((key, image)) = rx.recv().await {
            if let Err(e) = device.send_image(key, &image).await {
                warn!(key, error = %e, "failed to update key image");
            }
        }
        debug!("key image writer finished");
    });
    tx
}

async fn describe_device(device: &DeviceDriver) {
    let serial = device.serial_number().await;
    let firmware = device.firmware_version().await;
    match (serial, firmware) {
        (Ok(serial), Ok(firmware)) => info!(%serial, %firmware, "deck ready"),
        (serial, firmware) => warn!(
            serial = ?serial.ok(),
            firmware = ?firmware.ok(),
            "deck identity unavailable"
        ),
    }
}

async fn wait_for(deadline: Option<Instant>) {
    match deadline {
        Some(deadline) => tokio::time::sleep_until(deadline).await,
        None => std::future::pending().await,
    }
}
