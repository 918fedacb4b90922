//! Measurement trigger state machine.
//!
//! ```text
//! PoweredDown -> PoweredOn -> (Reset) -> ModeSet -> Measuring -> Ready
//!                                                      ^           |
//!                                                      +-----------+  continuous
//!                                  PoweredDown <-------------------+  one-shot
//! ```
//!
//! A reset is only accepted while powered on; some chips corrupt their
//! configuration when reset from power-down. Any bus error moves the machine
//! to `Unknown`, from which the chip has to be powered on or down again.

use crate::error::SensorError;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TriggerState {
    PoweredDown,
    PoweredOn,
    Reset,
    ModeSet,
    Measuring,
    Ready,
    Unknown,
}

impl TriggerState {
    pub fn can_enter(self, next: TriggerState) -> bool {
        use TriggerState::*;
        match (self, next) {
            (_, PoweredDown) => true,
            (_, Unknown) => true,
            (_, PoweredOn) => true,
            (PoweredOn, Reset) => true,
            (Unknown, ModeSet) => false,
            (_, ModeSet) => true,
            (ModeSet | Ready, Measuring) => true,
            (Measuring, Ready) => true,
            _ => false,
        }
    }
}

/// Tracks the chip's trigger state and rejects illegal transitions.
#[derive(Debug, Clone)]
pub struct TriggerMachine {
    state: TriggerState,
}

impl TriggerMachine {
    pub fn new(initial: TriggerState) -> Self {
        Self { state: initial }
    }

    pub fn state(&self) -> TriggerState {
        self.state
    }

    pub fn advance(&mut self, next: TriggerState) -> Result<(), SensorError> {
        if !self.state.can_enter(next) {
            return Err(SensorError::InvalidTransition {
                from: self.state,
                to: next,
            });
        }
        self.state = next;
        Ok(())
    }

    /// Record that a bus error left the chip in an unknown state.
    pub fn fault(&mut self) {
        self.state = TriggerState::Unknown;
    }
}
