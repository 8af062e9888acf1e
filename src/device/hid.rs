//! USB HID transport using hidapi
//!
//! hidapi is blocking, so input reports are polled on a dedicated thread
//! and forwarded into a tokio channel. Writes and feature requests run on
//! the blocking pool.

use std::ffi::CString;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::thread;
use std::time::Duration;

use async_trait::async_trait;
use hidapi::{HidApi, HidDevice};
use tokio::sync::mpsc;
use tracing::{debug, error, info, warn};

use super::protocol::{INPUT_REPORT_LENGTH, PRODUCT_ID, VENDOR_ID};
use super::transport::{DeviceError, DeviceTransport, InputReports};

/// Interval between input polls when no report is pending
const POLL_INTERVAL: Duration = Duration::from_millis(5);

type SharedDevice = Arc<Mutex<Option<HidDevice>>>;

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

/// hidapi-backed deck transport
#[derive(Default)]
pub struct HidTransport {
    device: SharedDevice,
    /// Path of the last device opened through discovery
    authorized: Mutex<Option<CString>>,
    /// Stop flag of the current reader thread
    running: Mutex<Option<Arc<AtomicBool>>>,
}

impl HidTransport {
    pub fn new() -> Self {
        Self::default()
    }

    fn shared(&self) -> SharedDevice {
        Arc::clone(&self.device)
    }
}

fn find_device(api: &HidApi) -> Option<CString> {
    api.device_list()
        .find(|info| info.vendor_id() == VENDOR_ID && info.product_id() == PRODUCT_ID)
        .map(|info| info.path().to_owned())
}

#[async_trait]
impl DeviceTransport for HidTransport {
    async fn open(&self, show_picker: bool) -> Result<InputReports, DeviceError> {
        let authorized = lock(&self.authorized).clone();

        let (path, device) = tokio::task::spawn_blocking(move || {
            let api = HidApi::new().map_err(|e| DeviceError::Open(e.to_string()))?;
            let path = if show_picker {
                find_device(&api).ok_or(DeviceError::NotFound)?
            } else {
                authorized.ok_or(DeviceError::NotFound)?
            };

            let device = api
                .open_path(&path)
                .map_err(|e| DeviceError::Open(e.to_string()))?;
            device
                .set_blocking_mode(false)
                .map_err(|e| DeviceError::Open(e.to_string()))?;
            Ok::<_, DeviceError>((path, device))
        })
        .await
        .map_err(|e| DeviceError::Open(e.to_string()))??;

        info!(?path, "deck opened");
        *lock(&self.authorized) = Some(path);
        *lock(&self.device) = Some(device);

        let running = Arc::new(AtomicBool::new(true));
        if let Some(previous) = lock(&self.running).replace(Arc::clone(&running)) {
            previous.store(false, Ordering::SeqCst);
        }

        let (tx, rx) = mpsc::channel(64);
        let shared = self.shared();
        thread::Builder::new()
            .name("deck-reader".to_string())
            .spawn(move || {
                debug!("deck reader thread started");
                poll_reports(shared, tx, running);
                debug!("deck reader thread stopped");
            })
            .map_err(|e| DeviceError::Open(e.to_string()))?;

        Ok(rx)
    }

    async fn close(&self) {
        if let Some(running) = lock(&self.running).take() {
            running.store(false, Ordering::SeqCst);
        }
        lock(&self.device).take();
    }

    async fn write_report(&self, report: &[u8]) -> Result<(), DeviceError> {
        let shared = self.shared();
        let report = report.to_vec();
        tokio::task::spawn_blocking(move || {
            let guard = lock(&shared);
            let device = guard.as_ref().ok_or(DeviceError::NotConnected)?;
            device
                .write(&report)
                .map(|_| ())
                .map_err(|e| DeviceError::Write(e.to_string()))
        })
        .await
        .map_err(|e| DeviceError::Write(e.to_string()))?
    }

    async fn send_feature_report(&self, report: &[u8]) -> Result<(), DeviceError> {
        let shared = self.shared();
        let report = report.to_vec();
        tokio::task::spawn_blocking(move || {
            let guard = lock(&shared);
            let device = guard.as_ref().ok_or(DeviceError::NotConnected)?;
            device
                .send_feature_report(&report)
                .map_err(|e| DeviceError::Feature(e.to_string()))
        })
        .await
        .map_err(|e| DeviceError::Feature(e.to_string()))?
    }

    async fn get_feature_report(
        &self,
        report_id: u8,
        length: usize,
    ) -> Result<Vec<u8>, DeviceError> {
        let shared = self.shared();
        tokio::task::spawn_blocking(move || {
            let guard = lock(&shared);
            let device = guard.as_ref().ok_or(DeviceError::NotConnected)?;
            let mut buf = vec![0u8; length];
            buf[0] = report_id;
            let read = device
                .get_feature_report(&mut buf)
                .map_err(|e| DeviceError::Feature(e.to_string()))?;
            buf.truncate(read);
            Ok(buf)
        })
        .await
        .map_err(|e| DeviceError::Feature(e.to_string()))?
    }
}

/// Poll input reports until closed or the device errors out (unplug)
fn poll_reports(shared: SharedDevice, tx: mpsc::Sender<Vec<u8>>, running: Arc<AtomicBool>) {
    let mut buf = [0u8; INPUT_REPORT_LENGTH];

    while running.load(Ordering::SeqCst) {
        let read = {
            let guard = lock(&shared);
            let Some(device) = guard.as_ref() else {
                break;
            };
            device.read(&mut buf)
        };

        match read {
            Ok(0) => thread::sleep(POLL_INTERVAL),
            Ok(n) => {
                if tx.blocking_send(buf[..n].to_vec()).is_err() {
                    warn!("input report channel closed");
                    break;
                }
            }
            Err(e) => {
                error!(error = %e, "deck read failed, treating as unplug");
                lock(&shared).take();
                break;
            }
        }
    }
}
