//! Two-threshold on/off controller.
//!
//! OFF → ON when the value reaches `on`, ON → OFF when it falls to `off`.
//! Anything strictly between the two leaves the output where it is, so the
//! fan does not chatter around a single set point.

use tracing::debug;

use crate::models::{ActuatorState, Reading, Thresholds};

#[derive(Debug, Clone)]
pub struct HysteresisController {
    thresholds: Thresholds,
    state: ActuatorState,
}

impl HysteresisController {
    /// Starts OFF.
    pub fn new(thresholds: Thresholds) -> Self {
        Self {
            thresholds,
            state: ActuatorState::Off,
        }
    }

    pub fn thresholds(&self) -> Thresholds {
        self.thresholds
    }

    /// Last committed state.
    pub fn state(&self) -> ActuatorState {
        self.state
    }

    /// Feed one reading and commit the resulting state.
    pub fn update(&mut self, reading: &Reading) -> ActuatorState {
        self.update_value(reading.value())
    }

    pub fn update_value(&mut self, value: f64) -> ActuatorState {
        let next = match self.state {
            ActuatorState::Off if value >= self.thresholds.on() => ActuatorState::On,
            ActuatorState::On if value <= self.thresholds.off() => ActuatorState::Off,
            current => current,
        };

        if next != self.state {
            debug!(value, from = %self.state, to = %next, "hysteresis transition");
        }
        self.state = next;
        next
    }
}
