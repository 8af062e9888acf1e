//! Events module for component notifications
//!
//! Each component publishes a closed set of event variants on its own
//! [`EventBus`]. The coordinator is the main subscriber; a UI layer can
//! subscribe to the same buses.

mod bus;

pub use bus::EventBus;

use serde::{Deserialize, Serialize};

use crate::audio::AudioFrame;
use crate::device::KeyEdgeEvent;
use crate::session::InboundMessage;

/// Notifications from the device driver
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DeviceEvent {
    /// Device opened and listening for input reports
    Connected,
    /// A key changed state
    Key(KeyEdgeEvent),
    /// Device went away; `unplugged` is false for a local disconnect
    Disconnected { unplugged: bool },
    /// Post-connection fault (failed write, failed image transfer)
    Error { message: String },
}

/// Notifications from the audio pipeline
#[derive(Debug, Clone)]
pub enum AudioEvent {
    /// A completed capture frame while streaming
    Frame(AudioFrame),
    /// Streaming flag raised
    StreamingStarted,
    /// Streaming flag lowered
    StreamingStopped,
    /// Audio clock could not be brought to a running state
    Warning { message: String },
    /// Capture or playback fault
    Error { message: String },
}

/// Notifications from the live session client
#[derive(Debug, Clone, PartialEq)]
pub enum SessionEvent {
    /// Transport open and setup sent
    Opened,
    /// Classified inbound message
    Message(InboundMessage),
    /// Non-fatal transport fault
    Error { message: String },
    /// Connection closed; emitted once per connection
    Closed { reason: String },
}

/// What caused a forced return to Idle
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DisconnectSource {
    Device,
    Session,
}

impl std::fmt::Display for DisconnectSource {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            DisconnectSource::Device => write!(f, "device"),
            DisconnectSource::Session => write!(f, "session"),
        }
    }
}

/// Events emitted by the recording state machine and coordinator
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum StateEvent {
    /// Push-to-talk key pressed from Idle
    PushToTalkStarted,

    /// Push-to-talk key released
    PushToTalkEnded {
        /// Duration in milliseconds the key was held
        duration_ms: u64,
    },

    /// Toggle key switched recording on
    ToggleStarted,

    /// Toggle key switched recording off
    ToggleEnded {
        /// Duration in milliseconds toggle mode was active
        duration_ms: u64,
    },

    /// Recording stopped because a device or session went away
    ForcedIdle { source: DisconnectSource },

    /// The "no more input" signal was sent to the conversation service
    TurnBoundarySent,

    /// A pending turn signal was dropped because recording resumed
    TurnBoundaryCancelled,
}

impl std::fmt::Display for StateEvent {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            StateEvent::PushToTalkStarted => write!(f, "PTT_STARTED"),
            StateEvent::PushToTalkEnded { duration_ms } => {
                write!(f, "PTT_ENDED ({}ms)", duration_ms)
            }
            StateEvent::ToggleStarted => write!(f, "TOGGLE_STARTED"),
            StateEvent::ToggleEnded { duration_ms } => {
                write!(f, "TOGGLE_ENDED ({}ms)", duration_ms)
            }
            StateEvent::ForcedIdle { source } => write!(f, "FORCED_IDLE ({})", source),
            StateEvent::TurnBoundarySent => write!(f, "TURN_BOUNDARY_SENT"),
            StateEvent::TurnBoundaryCancelled => write!(f, "TURN_BOUNDARY_CANCELLED"),
        }
    }
}
