//! Boundaries between the agent core and the outside world.
//!
//! ```text
//!   SampleSource ──▶ AgentLoop ──▶ Actuator
//!                        │
//!                        ▼
//!              TelemetryPublisher ──▶ ConnectionManager ──▶ Transport
//! ```
//!
//! Sensors, outputs and the pub/sub client implement these traits; the core
//! only ever talks to them through here.

use futures::future::BoxFuture;

use crate::error::{ActuatorError, ConnectionError, SampleError, TransportError};
use crate::models::Reading;

/// Reads one measurement. Implementations may block, but must bound the
/// time they block (device timeouts); the agent additionally runs reads on
/// the blocking pool under a deadline.
pub trait SampleSource: Send + 'static {
    fn read(&mut self) -> Result<Reading, SampleError>;
}

/// Binary output. `set` must be idempotent.
pub trait Actuator: Send + 'static {
    fn set(&mut self, on: bool) -> Result<(), ActuatorError>;

    fn is_on(&self) -> bool;

    /// Give the underlying resource back to the OS. Called once at teardown,
    /// after the output has been driven off.
    fn release(&mut self) -> Result<(), ActuatorError> {
        Ok(())
    }
}

impl<A: Actuator + ?Sized> Actuator for Box<A> {
    fn set(&mut self, on: bool) -> Result<(), ActuatorError> {
        (**self).set(on)
    }

    fn is_on(&self) -> bool {
        (**self).is_on()
    }

    fn release(&mut self) -> Result<(), ActuatorError> {
        (**self).release()
    }
}

/// Requested delivery guarantee for a publish.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DeliveryGuarantee {
    AtMostOnce,
    AtLeastOnce,
}

/// A connected pub/sub handle. Runs its own background I/O.
pub trait Transport: Send + Sync + 'static {
    /// Queue a message. Must not await network I/O.
    fn publish(
        &self,
        channel: &str,
        payload: Vec<u8>,
        guarantee: DeliveryGuarantee,
    ) -> Result<(), TransportError>;

    fn disconnect(&self) -> BoxFuture<'_, Result<(), TransportError>>;
}

/// Establishes a [`Transport`]. Each call is one connection attempt.
pub trait Connector: Send + Sync + 'static {
    type Transport: Transport;

    fn connect(&self) -> BoxFuture<'_, Result<Self::Transport, ConnectionError>>;
}

/// Actuator for agents without a physical output. Only remembers the
/// commanded level.
#[derive(Debug, Default)]
pub struct NoActuator {
    on: bool,
}

impl Actuator for NoActuator {
    fn set(&mut self, on: bool) -> Result<(), ActuatorError> {
        self.on = on;
        Ok(())
    }

    fn is_on(&self) -> bool {
        self.on
    }
}
