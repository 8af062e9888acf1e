//! Core recording state machine
//!
//! Maps key edges and disconnects to recording modes. Side effects are
//! returned as [`Action`]s for the coordinator to carry out, which keeps
//! the transition table free of I/O.

use std::time::Instant;

use tracing::{debug, info};

use crate::device::KeyEdgeEvent;
use crate::events::{DisconnectSource, EventBus, StateEvent};

/// The three recording modes
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum RecordingMode {
    /// Not recording
    #[default]
    Idle,
    /// Recording while the push-to-talk key is held
    PushToTalkActive,
    /// Recording until the toggle key is pressed again
    ToggleActive,
}

impl std::fmt::Display for RecordingMode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            RecordingMode::Idle => write!(f, "Idle"),
            RecordingMode::PushToTalkActive => write!(f, "PTTActive"),
            RecordingMode::ToggleActive => write!(f, "ToggleActive"),
        }
    }
}

/// Side effects requested by a transition
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Action {
    StartStreaming,
    StopStreaming,
    /// Send (or schedule) the turn-boundary signal
    ScheduleTurnBoundary,
    /// Drop a turn-boundary signal that has not been sent yet
    CancelTurnBoundary,
}

/// Which keys drive which mode
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct KeyBindings {
    pub push_to_talk: u8,
    pub toggle: u8,
}

impl Default for KeyBindings {
    fn default() -> Self {
        Self {
            push_to_talk: 0,
            toggle: 1,
        }
    }
}

/// The state machine that manages recording modes
pub struct StateMachine {
    /// Current mode
    mode: RecordingMode,
    bindings: KeyBindings,
    /// Time when the current non-Idle mode was entered
    mode_entered_at: Option<Instant>,
    events: EventBus<StateEvent>,
}

impl StateMachine {
    /// Create a state machine in Idle
    pub fn new(bindings: KeyBindings, events: EventBus<StateEvent>) -> Self {
        Self {
            mode: RecordingMode::Idle,
            bindings,
            mode_entered_at: None,
            events,
        }
    }

    /// Get the current mode
    pub fn mode(&self) -> RecordingMode {
        self.mode
    }

    /// Handle a key edge from the deck
    pub fn handle_key(&mut self, edge: KeyEdgeEvent) -> Vec<Action> {
        let next = self.compute_next_mode(edge);
        if next == self.mode {
            return Vec::new();
        }

        let actions = match next {
            RecordingMode::Idle => vec![Action::StopStreaming, Action::ScheduleTurnBoundary],
            RecordingMode::PushToTalkActive | RecordingMode::ToggleActive => {
                vec![Action::CancelTurnBoundary, Action::StartStreaming]
            }
        };

        self.transition_to(next);
        actions
    }

    /// Force Idle after the device or session went away
    ///
    /// No turn signal is sent; there is nothing to send it to.
    pub fn handle_disconnect(&mut self, source: DisconnectSource) -> Vec<Action> {
        if self.mode != RecordingMode::Idle {
            info!(from = %self.mode, %source, "forcing Idle after disconnect");
            self.mode = RecordingMode::Idle;
            self.mode_entered_at = None;
            self.events.publish(StateEvent::ForcedIdle { source });
        }
        vec![Action::StopStreaming, Action::CancelTurnBoundary]
    }

    /// Compute the next mode based on the current mode and a key edge
    fn compute_next_mode(&self, edge: KeyEdgeEvent) -> RecordingMode {
        match self.mode {
            RecordingMode::Idle => self.compute_from_idle(edge),
            RecordingMode::PushToTalkActive => self.compute_from_push_to_talk(edge),
            RecordingMode::ToggleActive => self.compute_from_toggle(edge),
        }
    }

    fn compute_from_idle(&self, edge: KeyEdgeEvent) -> RecordingMode {
        if !edge.pressed {
            return RecordingMode::Idle;
        }
        if edge.key_index == self.bindings.push_to_talk {
            RecordingMode::PushToTalkActive
        } else if edge.key_index == self.bindings.toggle {
            RecordingMode::ToggleActive
        } else {
            RecordingMode::Idle
        }
    }

    fn compute_from_push_to_talk(&self, edge: KeyEdgeEvent) -> RecordingMode {
        if edge.key_index == self.bindings.push_to_talk && !edge.pressed {
            RecordingMode::Idle
        } else {
            if edge.key_index == self.bindings.toggle && edge.pressed {
                debug!("toggle ignored while push-to-talk is held");
            }
            RecordingMode::PushToTalkActive
        }
    }

    fn compute_from_toggle(&self, edge: KeyEdgeEvent) -> RecordingMode {
        if edge.key_index == self.bindings.toggle && edge.pressed {
            RecordingMode::Idle
        } else {
            if edge.key_index == self.bindings.push_to_talk && edge.pressed {
                debug!("push-to-talk ignored while toggle mode is on");
            }
            RecordingMode::ToggleActive
        }
    }

    /// Perform a mode transition
    fn transition_to(&mut self, new_mode: RecordingMode) {
        let old_mode = self.mode;
        let duration_ms = self
            .mode_entered_at
            .map(|t| t.elapsed().as_millis() as u64)
            .unwrap_or(0);

        info!(
            from = %old_mode,
            to = %new_mode,
            duration_ms = duration_ms,
            "mode transition"
        );

        self.emit_exit_event(old_mode, duration_ms);

        self.mode = new_mode;
        self.mode_entered_at = if new_mode != RecordingMode::Idle {
            Some(Instant::now())
        } else {
            None
        };

        self.emit_entry_event(new_mode);
    }

    fn emit_exit_event(&self, mode: RecordingMode, duration_ms: u64) {
        let event = match mode {
            RecordingMode::Idle => return,
            RecordingMode::PushToTalkActive => StateEvent::PushToTalkEnded { duration_ms },
            RecordingMode::ToggleActive => StateEvent::ToggleEnded { duration_ms },
        };

        debug!(?event, "emitting exit event");
        self.events.publish(event);
    }

    fn emit_entry_event(&self, mode: RecordingMode) {
        let event = match mode {
            RecordingMode::Idle => return,
            RecordingMode::PushToTalkActive => StateEvent::PushToTalkStarted,
            RecordingMode::ToggleActive => StateEvent::ToggleStarted,
        };

        debug!(?event, "emitting entry event");
        self.events.publish(event);
    }
}
