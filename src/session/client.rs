//! Live conversation session client
//!
//! Owns the connection to the conversation service. Connection failures are
//! returned from [`LiveSessionClient::connect`]; everything after that is
//! reported on the event bus. The client never reconnects by itself.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use tokio::sync::{broadcast, mpsc};
use tracing::{debug, info, warn};

use crate::config::SessionSettings;
use crate::events::{EventBus, SessionEvent};

use super::protocol::{self, audio_mime_type, decode_inbound, InboundMessage};
use super::transport::{SessionConnector, WireInbound};

/// Errors raised by the session client
#[derive(Debug, Clone, thiserror::Error)]
pub enum SessionError {
    #[error("failed to connect: {0}")]
    Connect(String),

    #[error("failed to send: {0}")]
    Send(String),

    #[error("session is not connected")]
    NotConnected,

    #[error("failed to encode message: {0}")]
    Encode(String),
}

/// Connection lifecycle
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionState {
    Disconnected,
    Connecting,
    Open,
    Closed,
}

impl std::fmt::Display for SessionState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            SessionState::Disconnected => write!(f, "Disconnected"),
            SessionState::Connecting => write!(f, "Connecting"),
            SessionState::Open => write!(f, "Open"),
            SessionState::Closed => write!(f, "Closed"),
        }
    }
}

/// API key for the conversation service
#[derive(Clone)]
pub struct Credential(String);

impl Credential {
    pub fn new(api_key: impl Into<String>) -> Self {
        Self(api_key.into())
    }

    fn expose(&self) -> &str {
        &self.0
    }
}

impl std::fmt::Debug for Credential {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "Credential(***)")
    }
}

/// The currently open connection
struct ActiveLink {
    outbound: mpsc::Sender<String>,
    closed: Arc<AtomicBool>,
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

/// Client for one live conversation at a time
pub struct LiveSessionClient {
    connector: Arc<dyn SessionConnector>,
    state: Arc<Mutex<SessionState>>,
    link: Arc<Mutex<Option<ActiveLink>>>,
    mime_type: String,
    events: EventBus<SessionEvent>,
}

impl LiveSessionClient {
    /// `input_sample_rate` is the rate of the PCM passed to `send_audio`
    pub fn new(connector: Arc<dyn SessionConnector>, input_sample_rate: u32) -> Self {
        Self {
            connector,
            state: Arc::new(Mutex::new(SessionState::Disconnected)),
            link: Arc::new(Mutex::new(None)),
            mime_type: audio_mime_type(input_sample_rate),
            events: EventBus::default(),
        }
    }

    /// Subscribe to session notifications
    pub fn subscribe(&self) -> broadcast::Receiver<SessionEvent> {
        self.events.subscribe()
    }

    pub fn state(&self) -> SessionState {
        *lock(&self.state)
    }

    pub fn is_open(&self) -> bool {
        self.state() == SessionState::Open
    }

    /// Open the connection and send the setup message
    ///
    /// Resolves as soon as the transport is open; the protocol has no
    /// application-level acknowledgment to wait for.
    pub async fn connect(
        &self,
        credential: &Credential,
        settings: &SessionSettings,
    ) -> Result<(), SessionError> {
        if self.link_sender().is_some() {
            self.disconnect().await;
        }

        *lock(&self.state) = SessionState::Connecting;
        info!(endpoint = %settings.endpoint, model = %settings.model, "connecting to conversation service");

        let url = format!("{}?key={}", settings.endpoint, credential.expose());
        let wire = match self.connector.open(&url).await {
            Ok(wire) => wire,
            Err(e) => {
                *lock(&self.state) = SessionState::Closed;
                warn!(error = %e, "conversation service connect failed");
                return Err(e);
            }
        };

        let setup = protocol::setup_message(
            &settings.model,
            &settings.voice,
            settings.system_instruction.as_deref(),
        )
        .map_err(|e| SessionError::Encode(e.to_string()))?;

        if wire.outbound.send(setup).await.is_err() {
            *lock(&self.state) = SessionState::Closed;
            return Err(SessionError::Connect(
                "connection closed before setup was sent".to_string(),
            ));
        }

        let closed = Arc::new(AtomicBool::new(false));
        *lock(&self.link) = Some(ActiveLink {
            outbound: wire.outbound,
            closed: Arc::clone(&closed),
        });
        *lock(&self.state) = SessionState::Open;

        info!(voice = %settings.voice, "conversation session open");
        self.events.publish(SessionEvent::Opened);

        tokio::spawn(read_loop(
            wire.inbound,
            closed,
            Arc::clone(&self.state),
            Arc::clone(&self.link),
            self.events.clone(),
        ));
        Ok(())
    }

    /// Send one chunk of captured PCM; a no-op when not connected
    pub async fn send_audio(&self, pcm: &[u8]) {
        let Some((outbound, closed)) = self.active_link() else {
            return;
        };

        let message = match protocol::audio_message(pcm, &self.mime_type) {
            Ok(message) => message,
            Err(e) => {
                self.report(SessionError::Encode(e.to_string()));
                return;
            }
        };

        if outbound.send(message).await.is_err() {
            self.link_lost(&closed);
        }
    }

    /// Tell the service the user's turn is over; the connection stays open
    pub async fn send_turn_boundary(&self) -> Result<(), SessionError> {
        let (outbound, closed) = self.active_link().ok_or(SessionError::NotConnected)?;
        let message =
            protocol::turn_boundary_message().map_err(|e| SessionError::Encode(e.to_string()))?;

        if outbound.send(message).await.is_err() {
            return Err(self.link_lost(&closed));
        }
        debug!("turn boundary sent");
        Ok(())
    }

    /// Close the connection
    pub async fn disconnect(&self) {
        let link = lock(&self.link).take();
        let Some(link) = link else {
            return;
        };

        // Dropping the sender makes the transport close the connection
        drop(link.outbound);
        finish(
            &link.closed,
            &self.state,
            &self.events,
            "closed locally".to_string(),
        );
    }

    fn link_sender(&self) -> Option<mpsc::Sender<String>> {
        lock(&self.link).as_ref().map(|link| link.outbound.clone())
    }

    fn active_link(&self) -> Option<(mpsc::Sender<String>, Arc<AtomicBool>)> {
        lock(&self.link)
            .as_ref()
            .map(|link| (link.outbound.clone(), Arc::clone(&link.closed)))
    }

    /// The transport stopped accepting frames: report it and end the session
    fn link_lost(&self, closed: &Arc<AtomicBool>) -> SessionError {
        let error = SessionError::Send("connection is closed".to_string());
        if closed.load(Ordering::SeqCst) {
            return error;
        }
        self.report(error.clone());
        release_link(&self.link, closed);
        finish(closed, &self.state, &self.events, "send failed".to_string());
        error
    }

    fn report(&self, error: SessionError) {
        warn!(error = %error, "session fault");
        self.events.publish(SessionEvent::Error {
            message: error.to_string(),
        });
    }
}

/// Emit the close notification once per connection
fn finish(
    closed: &AtomicBool,
    state: &Mutex<SessionState>,
    events: &EventBus<SessionEvent>,
    reason: String,
) {
    if closed.swap(true, Ordering::SeqCst) {
        return;
    }
    *lock(state) = SessionState::Closed;
    info!(%reason, "conversation session closed");
    events.publish(SessionEvent::Closed { reason });
}

async fn read_loop(
    mut inbound: mpsc::Receiver<WireInbound>,
    closed: Arc<AtomicBool>,
    state: Arc<Mutex<SessionState>>,
    link: Arc<Mutex<Option<ActiveLink>>>,
    events: EventBus<SessionEvent>,
) {
    let reason = loop {
        match inbound.recv().await {
            Some(WireInbound::Text(text)) => {
                if closed.load(Ordering::SeqCst) {
                    continue;
                }
                for message in decode_inbound(&text) {
                    if message == InboundMessage::Ignored {
                        continue;
                    }
                    events.publish(SessionEvent::Message(message));
                }
            }
            Some(WireInbound::Error(message)) => {
                if closed.load(Ordering::SeqCst) {
                    continue;
                }
                warn!(error = %message, "transport fault");
                events.publish(SessionEvent::Error { message });
            }
            Some(WireInbound::Closed(reason)) => break reason,
            None => break "transport ended".to_string(),
        }
    };

    release_link(&link, &closed);
    finish(&closed, &state, &events, reason);
}

/// Drop the link only if it still belongs to the connection behind `closed`
fn release_link(link: &Mutex<Option<ActiveLink>>, closed: &Arc<AtomicBool>) {
    let mut current = lock(link);
    if current
        .as_ref()
        .is_some_and(|active| Arc::ptr_eq(&active.closed, closed))
    {
        *current = None;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::session::protocol::Role;
    use crate::testing::ChannelConnector;
    use std::time::Duration;

    fn settings() -> SessionSettings {
        SessionSettings {
            system_instruction: Some("Answer briefly.".to_string()),
            ..SessionSettings::default()
        }
    }

    async fn next_event(rx: &mut broadcast::Receiver<SessionEvent>) -> SessionEvent {
        tokio::time::timeout(Duration::from_secs(1), rx.recv())
            .await
            .expect("timed out waiting for session event")
            .unwrap()
    }

    #[tokio::test]
    async fn test_connect_sends_setup_first() {
        let (connector, mut server) = ChannelConnector::new();
        let client = LiveSessionClient::new(connector, 16_000);
        client
            .connect(&Credential::new("secret"), &settings())
            .await
            .unwrap();

        assert_eq!(client.state(), SessionState::Open);
        let setup = server.next_outbound().await;
        assert!(setup.contains("\"setup\""));
        assert!(setup.contains("Answer briefly."));
        assert!(server.url().ends_with("?key=secret"));
    }

    #[tokio::test]
    async fn test_connect_failure_rejects() {
        let connector = ChannelConnector::failing();
        let client = LiveSessionClient::new(connector, 16_000);
        let result = client.connect(&Credential::new("k"), &settings()).await;

        assert!(matches!(result, Err(SessionError::Connect(_))));
        assert_eq!(client.state(), SessionState::Closed);
    }

    #[tokio::test]
    async fn test_send_audio_before_connect_is_noop() {
        let (connector, _server) = ChannelConnector::new();
        let client = LiveSessionClient::new(connector, 16_000);
        let mut rx = client.subscribe();

        client.send_audio(&[0, 1]).await;
        assert!(rx.try_recv().is_err());
        assert!(matches!(
            client.send_turn_boundary().await,
            Err(SessionError::NotConnected)
        ));
    }

    #[tokio::test]
    async fn test_audio_and_turn_boundary_framing() {
        let (connector, mut server) = ChannelConnector::new();
        let client = LiveSessionClient::new(connector, 16_000);
        client.connect(&Credential::new("k"), &settings()).await.unwrap();
        server.next_outbound().await;

        client.send_audio(&[1, 0, 2, 0]).await;
        client.send_turn_boundary().await.unwrap();

        let audio: serde_json::Value = serde_json::from_str(&server.next_outbound().await).unwrap();
        assert_eq!(audio["realtimeInput"]["mediaChunks"][0]["mimeType"], "audio/pcm;rate=16000");
        assert_eq!(audio["realtimeInput"]["mediaChunks"][0]["data"], "AQACAA==");

        let boundary = server.next_outbound().await;
        assert!(boundary.contains("audioStreamEnd"));
        assert!(client.is_open());
    }

    #[tokio::test]
    async fn test_inbound_dispatch_skips_garbage() {
        let (connector, mut server) = ChannelConnector::new();
        let client = LiveSessionClient::new(connector, 16_000);
        let mut rx = client.subscribe();
        client.connect(&Credential::new("k"), &settings()).await.unwrap();
        assert_eq!(next_event(&mut rx).await, SessionEvent::Opened);

        server.push_inbound("{not json").await;
        server
            .push_inbound(r#"{"serverContent":{"inputTranscription":{"text":"hi"}}}"#)
            .await;
        server
            .push_inbound(r#"{"serverContent":{"turnComplete":true}}"#)
            .await;

        assert_eq!(
            next_event(&mut rx).await,
            SessionEvent::Message(InboundMessage::TranscriptionFragment {
                role: Role::User,
                text: "hi".to_string()
            })
        );
        assert_eq!(
            next_event(&mut rx).await,
            SessionEvent::Message(InboundMessage::TurnComplete)
        );
        assert!(client.is_open());
    }

    #[tokio::test]
    async fn test_remote_close_emits_once() {
        let (connector, mut server) = ChannelConnector::new();
        let client = LiveSessionClient::new(connector, 16_000);
        let mut rx = client.subscribe();
        client.connect(&Credential::new("k"), &settings()).await.unwrap();
        assert_eq!(next_event(&mut rx).await, SessionEvent::Opened);

        server.close("going away").await;
        assert_eq!(
            next_event(&mut rx).await,
            SessionEvent::Closed {
                reason: "going away".to_string()
            }
        );
        assert_eq!(client.state(), SessionState::Closed);

        client.disconnect().await;
        tokio::time::sleep(Duration::from_millis(20)).await;
        assert!(rx.try_recv().is_err());
    }

    #[tokio::test]
    async fn test_local_disconnect_emits_once() {
        let (connector, mut server) = ChannelConnector::new();
        let client = LiveSessionClient::new(connector, 16_000);
        let mut rx = client.subscribe();
        client.connect(&Credential::new("k"), &settings()).await.unwrap();
        assert_eq!(next_event(&mut rx).await, SessionEvent::Opened);

        client.disconnect().await;
        assert!(matches!(next_event(&mut rx).await, SessionEvent::Closed { .. }));

        // The transport noticing the close afterwards must not repeat it
        server.close("closed").await;
        tokio::time::sleep(Duration::from_millis(20)).await;
        assert!(rx.try_recv().is_err());

        client.send_audio(&[0, 0]).await;
        assert!(rx.try_recv().is_err());
    }

    #[tokio::test]
    async fn test_writer_failure_reports_error_then_closes_once() {
        let (connector, mut server) = ChannelConnector::new();
        let client = LiveSessionClient::new(connector, 16_000);
        let mut rx = client.subscribe();
        client.connect(&Credential::new("k"), &settings()).await.unwrap();
        assert_eq!(next_event(&mut rx).await, SessionEvent::Opened);
        server.next_outbound().await;

        server.hang_up();
        client.send_audio(&[0, 0]).await;

        assert!(matches!(next_event(&mut rx).await, SessionEvent::Error { .. }));
        assert_eq!(
            next_event(&mut rx).await,
            SessionEvent::Closed {
                reason: "send failed".to_string()
            }
        );
        assert_eq!(client.state(), SessionState::Closed);

        // Later sends and the transport's own close stay silent
        client.send_audio(&[0, 0]).await;
        assert!(matches!(
            client.send_turn_boundary().await,
            Err(SessionError::NotConnected)
        ));
        server.close("connection reset").await;
        tokio::time::sleep(Duration::from_millis(20)).await;
        assert!(rx.try_recv().is_err());
    }

    #[tokio::test]
    async fn test_transport_fault_then_close() {
        let (connector, server) = ChannelConnector::new();
        let client = LiveSessionClient::new(connector, 16_000);
        let mut rx = client.subscribe();
        client.connect(&Credential::new("k"), &settings()).await.unwrap();
        assert_eq!(next_event(&mut rx).await, SessionEvent::Opened);

        server.fail("send failed: broken pipe").await;
        assert_eq!(
            next_event(&mut rx).await,
            SessionEvent::Error {
                message: "send failed: broken pipe".to_string()
            }
        );
        assert!(matches!(next_event(&mut rx).await, SessionEvent::Closed { .. }));
        assert_eq!(client.state(), SessionState::Closed);

        tokio::time::sleep(Duration::from_millis(20)).await;
        assert!(rx.try_recv().is_err());
    }
}
