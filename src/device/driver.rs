//! Deck driver: key edge decoding, serialized image transfers and control
//! commands on top of a [`DeviceTransport`].

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use tokio::sync::{broadcast, mpsc, oneshot};
use tracing::{debug, info, warn};

use crate::events::{DeviceEvent, EventBus};

use super::protocol::{
    self, image_packets, KeyStates, FEATURE_REPORT_LENGTH, FIRMWARE_REPORT_ID,
    FIRMWARE_TEXT_OFFSET, KEY_COUNT, SERIAL_REPORT_ID, SERIAL_TEXT_OFFSET,
};
use super::transport::{DeviceError, DeviceTransport, InputReports};

/// Depth of the outbound image queue
const WRITE_QUEUE_DEPTH: usize = 16;

/// All reports of one image, written back to back
struct WriteJob {
    key_index: u8,
    reports: Vec<Vec<u8>>,
    done: oneshot::Sender<Result<(), DeviceError>>,
}

/// Live connection: the outbound queue of the current device
struct Link {
    writer: mpsc::Sender<WriteJob>,
    generation: u64,
}

/// Driver for one deck
///
/// Cloning is cheap; clones share the same connection.
#[derive(Clone)]
pub struct DeviceDriver {
    transport: Arc<dyn DeviceTransport>,
    link: Arc<Mutex<Option<Link>>>,
    keys: Arc<Mutex<KeyStates>>,
    generation: Arc<AtomicU64>,
    events: EventBus<DeviceEvent>,
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

impl DeviceDriver {
    /// Create a driver over the given transport; nothing is opened yet
    pub fn new(transport: Arc<dyn DeviceTransport>) -> Self {
        Self {
            transport,
            link: Arc::new(Mutex::new(None)),
            keys: Arc::new(Mutex::new(KeyStates::default())),
            generation: Arc::new(AtomicU64::new(0)),
            events: EventBus::default(),
        }
    }

    /// Subscribe to device notifications
    pub fn subscribe(&self) -> broadcast::Receiver<DeviceEvent> {
        self.events.subscribe()
    }

    /// Whether a device is currently open
    pub fn is_connected(&self) -> bool {
        lock(&self.link).is_some()
    }

    /// Snapshot of the per-key pressed state
    pub fn key_states(&self) -> KeyStates {
        lock(&self.keys).clone()
    }

    /// Open the deck and start decoding its input reports
    pub async fn connect(&self, show_picker: bool) -> Result<(), DeviceError> {
        if self.is_connected() {
            self.disconnect().await;
        }

        let reports = self.transport.open(show_picker).await?;
        lock(&self.keys).reset();

        let generation = self.generation.fetch_add(1, Ordering::SeqCst) + 1;
        let (writer_tx, writer_rx) = mpsc::channel(WRITE_QUEUE_DEPTH);
        tokio::spawn(write_loop(
            Arc::clone(&self.transport),
            writer_rx,
            self.events.clone(),
        ));

        *lock(&self.link) = Some(Link {
            writer: writer_tx,
            generation,
        });

        info!(generation, "deck connected");
        self.events.publish(DeviceEvent::Connected);

        tokio::spawn(self.clone().read_loop(reports, generation));
        Ok(())
    }

    /// Close the deck if open
    pub async fn disconnect(&self) {
        let link = lock(&self.link).take();
        if link.is_none() {
            return;
        }

        self.transport.close().await;
        lock(&self.keys).reset();

        info!("deck disconnected");
        self.events.publish(DeviceEvent::Disconnected { unplugged: false });
    }

    /// Transfer an encoded image to one key
    ///
    /// Transfers are queued; concurrent calls never interleave packets.
    pub async fn send_image(&self, key_index: u8, image: &[u8]) -> Result<(), DeviceError> {
        let writer = self.writer()?;
        if usize::from(key_index) >= KEY_COUNT {
            return Err(DeviceError::InvalidKey(key_index));
        }

        let reports = image_packets(key_index, image)?
            .iter()
            .map(|packet| packet.to_report())
            .collect();

        let (done_tx, done_rx) = oneshot::channel();
        writer
            .send(WriteJob {
                key_index,
                reports,
                done: done_tx,
            })
            .await
            .map_err(|_| DeviceError::NotConnected)?;

        done_rx.await.map_err(|_| DeviceError::NotConnected)?
    }

    /// Reset the deck to its boot screen
    pub async fn reset(&self) -> Result<(), DeviceError> {
        self.ensure_connected()?;
        self.transport
            .send_feature_report(&protocol::reset_report())
            .await
    }

    /// Set backlight brightness; values above 100 are clamped
    pub async fn set_brightness(&self, percent: u8) -> Result<(), DeviceError> {
        self.ensure_connected()?;
        debug!(percent = percent.min(100), "setting brightness");
        self.transport
            .send_feature_report(&protocol::brightness_report(percent))
            .await
    }

    /// Read the device serial number
    pub async fn serial_number(&self) -> Result<String, DeviceError> {
        self.read_text(SERIAL_REPORT_ID, SERIAL_TEXT_OFFSET).await
    }

    /// Read the firmware version string
    pub async fn firmware_version(&self) -> Result<String, DeviceError> {
        self.read_text(FIRMWARE_REPORT_ID, FIRMWARE_TEXT_OFFSET).await
    }

    async fn read_text(&self, report_id: u8, offset: usize) -> Result<String, DeviceError> {
        self.ensure_connected()?;
        let response = self
            .transport
            .get_feature_report(report_id, FEATURE_REPORT_LENGTH)
            .await?;
        Ok(protocol::decode_feature_text(&response, offset))
    }

    fn ensure_connected(&self) -> Result<(), DeviceError> {
        if self.is_connected() {
            Ok(())
        } else {
            Err(DeviceError::NotConnected)
        }
    }

    fn writer(&self) -> Result<mpsc::Sender<WriteJob>, DeviceError> {
        lock(&self.link)
            .as_ref()
            .map(|link| link.writer.clone())
            .ok_or(DeviceError::NotConnected)
    }

    /// Decode input reports until the stream ends
    async fn read_loop(self, mut reports: InputReports, generation: u64) {
        while let Some(report) = reports.recv().await {
            let edges = lock(&self.keys).apply_report(&report);
            for edge in edges {
                debug!(key = edge.key_index, pressed = edge.pressed, "key edge");
                self.events.publish(DeviceEvent::Key(edge));
            }
        }

        // A local disconnect already cleared the link for this generation
        let unplugged = {
            let mut link = lock(&self.link);
            if link.as_ref().is_some_and(|l| l.generation == generation) {
                *link = None;
                true
            } else {
                false
            }
        };

        if unplugged {
            lock(&self.keys).reset();
            warn!(generation, "deck unplugged");
            self.events
                .publish(DeviceEvent::Disconnected { unplugged: true });
        }
    }
}

/// Drain the outbound queue, one whole image at a time
async fn write_loop(
    transport: Arc<dyn DeviceTransport>,
    mut jobs: mpsc::Receiver<WriteJob>,
    events: EventBus<DeviceEvent>,
) {
    while let Some(job) = jobs.recv().await {
        let mut result = Ok(());
        for report in &job.reports {
            if let Err(e) = transport.write_report(report).await {
                warn!(key = job.key_index, error = %e, "image transfer failed");
                events.publish(DeviceEvent::Error {
                    message: e.to_string(),
                });
                result = Err(e);
                break;
            }
        }

        if result.is_ok() {
            debug!(key = job.key_index, packets = job.reports.len(), "image transferred");
        }
        let _ = job.done.send(result);
    }
    debug!("deck write queue closed");
}
