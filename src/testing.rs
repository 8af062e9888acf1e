//! In-memory stand-ins for the deck, the audio devices and the conversation
//! service

use std::collections::HashMap;
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use tokio::sync::mpsc;

use crate::audio::{AudioBackend, AudioError, AudioHost, CaptureGraph, CaptureRequest, ClockState};
use crate::device::{DeviceError, DeviceTransport, InputReports};
use crate::session::{SessionConnector, SessionError, WireInbound, WireLink};

#[derive(Default)]
struct DeckState {
    input: Option<mpsc::Sender<Vec<u8>>>,
    open_error: Option<DeviceError>,
    writes: Vec<Vec<u8>>,
    feature_writes: Vec<Vec<u8>>,
    feature_responses: HashMap<u8, Vec<u8>>,
}

/// Deck that records everything written to it
#[derive(Default)]
pub struct FakeTransport {
    state: Mutex<DeckState>,
}

impl FakeTransport {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    /// Make the next `open` fail
    pub fn fail_open(&self, error: DeviceError) {
        self.state.lock().unwrap().open_error = Some(error);
    }

    /// Deliver an input report as if the deck sent it
    pub async fn send_report(&self, report: Vec<u8>) {
        let input = self.state.lock().unwrap().input.clone();
        if let Some(input) = input {
            let _ = input.send(report).await;
        }
    }

    /// End the input stream without a local close
    pub fn unplug(&self) {
        self.state.lock().unwrap().input = None;
    }

    pub fn writes(&self) -> Vec<Vec<u8>> {
        self.state.lock().unwrap().writes.clone()
    }

    pub fn feature_writes(&self) -> Vec<Vec<u8>> {
        self.state.lock().unwrap().feature_writes.clone()
    }

    pub fn set_feature_response(&self, report_id: u8, response: Vec<u8>) {
        self.state
            .lock()
            .unwrap()
            .feature_responses
            .insert(report_id, response);
    }
}

#[async_trait]
impl DeviceTransport for FakeTransport {
    async fn open(&self, _show_picker: bool) -> Result<InputReports, DeviceError> {
        let mut state = self.state.lock().unwrap();
        if let Some(error) = state.open_error.take() {
            return Err(error);
        }
        let (tx, rx) = mpsc::channel(32);
        state.input = Some(tx);
        Ok(rx)
    }

    async fn close(&self) {
        self.state.lock().unwrap().input = None;
    }

    async fn write_report(&self, report: &[u8]) -> Result<(), DeviceError> {
        // Give concurrent writers a chance to interleave
        tokio::task::yield_now().await;
        self.state.lock().unwrap().writes.push(report.to_vec());
        Ok(())
    }

    async fn send_feature_report(&self, report: &[u8]) -> Result<(), DeviceError> {
        self.state.lock().unwrap().feature_writes.push(report.to_vec());
        Ok(())
    }

    async fn get_feature_report(
        &self,
        report_id: u8,
        length: usize,
    ) -> Result<Vec<u8>, DeviceError> {
        let state = self.state.lock().unwrap();
        Ok(state
            .feature_responses
            .get(&report_id)
            .cloned()
            .unwrap_or_else(|| {
                let mut response = vec![0u8; length];
                response[0] = report_id;
                response
            }))
    }
}

struct AudioState {
    graph: Option<CaptureGraph>,
    clock: f64,
    clock_state: ClockState,
    enqueued: usize,
    requests: Vec<CaptureRequest>,
}

/// Audio host with a manual clock and a hand-fed microphone
pub struct FakeAudioHost {
    state: Arc<Mutex<AudioState>>,
}

impl FakeAudioHost {
    pub fn new() -> Arc<Self> {
        Arc::new(Self {
            state: Arc::new(Mutex::new(AudioState {
                graph: None,
                clock: 0.0,
                clock_state: ClockState::Running,
                enqueued: 0,
                requests: Vec::new(),
            })),
        })
    }

    /// Feed samples to the open capture graph
    pub fn capture(&self, samples: &[f32]) {
        if let Some(graph) = self.state.lock().unwrap().graph.as_mut() {
            graph.push(samples);
        }
    }

    pub fn set_clock(&self, seconds: f64) {
        self.state.lock().unwrap().clock = seconds;
    }

    pub fn set_clock_state(&self, clock_state: ClockState) {
        self.state.lock().unwrap().clock_state = clock_state;
    }

    /// Number of chunks queued for playback
    pub fn enqueued(&self) -> usize {
        self.state.lock().unwrap().enqueued
    }

    pub fn requests(&self) -> Vec<CaptureRequest> {
        self.state.lock().unwrap().requests.clone()
    }
}

struct FakeBackend {
    state: Arc<Mutex<AudioState>>,
}

impl AudioHost for FakeAudioHost {
    fn open(
        &self,
        request: &CaptureRequest,
        graph: CaptureGraph,
    ) -> Result<Box<dyn AudioBackend>, AudioError> {
        let mut state = self.state.lock().unwrap();
        state.graph = Some(graph);
        state.requests.push(request.clone());
        Ok(Box::new(FakeBackend {
            state: Arc::clone(&self.state),
        }))
    }
}

impl AudioBackend for FakeBackend {
    fn resume(&mut self) -> Result<ClockState, AudioError> {
        Ok(self.state.lock().unwrap().clock_state)
    }

    fn playback_clock(&self) -> f64 {
        self.state.lock().unwrap().clock
    }

    fn enqueue(&mut self, _start: f64, _samples: Vec<f32>) {
        self.state.lock().unwrap().enqueued += 1;
    }

    fn close(&mut self) {
        self.state.lock().unwrap().graph = None;
    }
}

/// Connector whose single link is driven by a [`ServerEnd`]
pub struct ChannelConnector {
    link: Mutex<Option<WireLink>>,
    url: Arc<Mutex<String>>,
}

/// The service side of a [`ChannelConnector`] link
pub struct ServerEnd {
    outbound: mpsc::Receiver<String>,
    inbound: mpsc::Sender<WireInbound>,
    url: Arc<Mutex<String>>,
}

impl ChannelConnector {
    pub fn new() -> (Arc<Self>, ServerEnd) {
        let (outbound_tx, outbound_rx) = mpsc::channel(64);
        let (inbound_tx, inbound_rx) = mpsc::channel(64);
        let url = Arc::new(Mutex::new(String::new()));

        let connector = Arc::new(Self {
            link: Mutex::new(Some(WireLink {
                outbound: outbound_tx,
                inbound: inbound_rx,
            })),
            url: Arc::clone(&url),
        });
        let server = ServerEnd {
            outbound: outbound_rx,
            inbound: inbound_tx,
            url,
        };
        (connector, server)
    }

    /// Connector that refuses every connection
    pub fn failing() -> Arc<Self> {
        Arc::new(Self {
            link: Mutex::new(None),
            url: Arc::new(Mutex::new(String::new())),
        })
    }
}

#[async_trait]
impl SessionConnector for ChannelConnector {
    async fn open(&self, url: &str) -> Result<WireLink, SessionError> {
        *self.url.lock().unwrap() = url.to_string();
        self.link
            .lock()
            .unwrap()
            .take()
            .ok_or_else(|| SessionError::Connect("connection refused".to_string()))
    }
}

impl ServerEnd {
    /// Next message sent by the client
    pub async fn next_outbound(&mut self) -> String {
        tokio::time::timeout(std::time::Duration::from_secs(1), self.outbound.recv())
            .await
            .expect("timed out waiting for outbound message")
            .expect("client closed the connection")
    }

    /// URL the client connected to
    pub fn url(&self) -> String {
        self.url.lock().unwrap().clone()
    }

    pub async fn push_inbound(&self, text: &str) {
        let _ = self.inbound.send(WireInbound::Text(text.to_string())).await;
    }

    /// Stop accepting client frames, as a dead socket writer would
    pub fn hang_up(&mut self) {
        self.outbound.close();
    }

    /// Report a write failure the way the socket writer does
    pub async fn fail(&self, error: &str) {
        let _ = self.inbound.send(WireInbound::Error(error.to_string())).await;
        let _ = self
            .inbound
            .send(WireInbound::Closed("send failed".to_string()))
            .await;
    }

    pub async fn close(&self, reason: &str) {
        let _ = self
            .inbound
            .send(WireInbound::Closed(reason.to_string()))
            .await;
    }
}
