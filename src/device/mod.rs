//! Device module for the USB button deck
//!
//! Decodes key presses from input reports, streams key images as chunked
//! output reports and issues control commands over feature reports.

mod driver;
#[cfg(feature = "hardware")]
mod hid;
mod icons;
pub mod protocol;
mod transport;

pub use driver::DeviceDriver;
#[cfg(feature = "hardware")]
pub use hid::HidTransport;
pub use icons::{IconSet, KeyImageEncoder, KeyRole};
pub use protocol::{KeyEdgeEvent, KeyStates};
pub use transport::{DeviceError, DeviceTransport, InputReports};
