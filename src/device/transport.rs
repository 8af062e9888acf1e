//! Host-side access to the deck
//!
//! The driver talks to hardware only through [`DeviceTransport`], so a test
//! double can stand in for a real USB device.

use async_trait::async_trait;
use tokio::sync::mpsc;

/// Errors raised by the device transport and driver
#[derive(Debug, Clone, thiserror::Error)]
pub enum DeviceError {
    #[error("no matching deck found or authorized")]
    NotFound,

    #[error("failed to open deck: {0}")]
    Open(String),

    #[error("deck is not connected")]
    NotConnected,

    #[error("failed to write report: {0}")]
    Write(String),

    #[error("feature report failed: {0}")]
    Feature(String),

    #[error("key index {0} is out of range")]
    InvalidKey(u8),

    #[error("image is empty")]
    EmptyImage,

    #[error("image of {0} bytes does not fit in one transfer")]
    ImageTooLarge(usize),
}

/// Stream of raw input reports; closes when the device goes away
pub type InputReports = mpsc::Receiver<Vec<u8>>;

/// Permission-gated access to one physical deck
#[async_trait]
pub trait DeviceTransport: Send + Sync + 'static {
    /// Open a matching device and start delivering input reports
    ///
    /// With `show_picker` false only a previously authorized device may be
    /// opened.
    async fn open(&self, show_picker: bool) -> Result<InputReports, DeviceError>;

    /// Close the device; the input report stream ends
    async fn close(&self);

    /// Write one output report
    async fn write_report(&self, report: &[u8]) -> Result<(), DeviceError>;

    /// Send a feature report on the control channel
    async fn send_feature_report(&self, report: &[u8]) -> Result<(), DeviceError>;

    /// Read a feature report of `length` bytes
    async fn get_feature_report(&self, report_id: u8, length: usize)
        -> Result<Vec<u8>, DeviceError>;
}
