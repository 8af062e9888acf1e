//! State module for recording modes
//!
//! Provides an explicit state machine with three modes:
//! - Idle: Default state, microphone frames are discarded
//! - PushToTalkActive: Momentary, while the push-to-talk key is held
//! - ToggleActive: Toggle, persists until the toggle key is pressed again
//!
//! The coordinator feeds it device and session events and carries out the
//! resulting actions.

mod coordinator;
mod machine;

pub use coordinator::Coordinator;
