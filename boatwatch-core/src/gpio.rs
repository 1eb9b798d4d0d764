//! Binary output on a sysfs GPIO pin (fan, relay).

use std::time::Duration;

use sysfs_gpio::{Direction, Pin};
use tracing::{debug, info, warn};

use crate::error::{ActuatorError, ResourceError};
use crate::ports::Actuator;

/// udev needs a moment to fix permissions on a freshly exported pin.
const EXPORT_SETTLE: Duration = Duration::from_millis(100);
const DIRECTION_ATTEMPTS: u32 = 5;

pub struct GpioOutput {
    pin: Pin,
    number: u64,
    on: bool,
    exported: bool,
}

impl GpioOutput {
    /// Export `number` and configure it as an output driven low.
    ///
    /// Blocks the calling thread while udev settles; from async code use
    /// [`GpioOutput::open_async`].
    pub fn open(number: u64) -> Result<Self, ResourceError> {
        let pin = Pin::new(number);
        pin.export().map_err(|e| open_error(number, e))?;

        let mut attempt = 1;
        loop {
            match pin.set_direction(Direction::Low) {
                Ok(()) => break,
                Err(e) if attempt < DIRECTION_ATTEMPTS => {
                    debug!(pin = number, attempt, "GPIO not ready yet: {}", e);
                    attempt += 1;
                    std::thread::sleep(EXPORT_SETTLE);
                }
                Err(e) => {
                    let _ = pin.unexport();
                    return Err(open_error(number, e));
                }
            }
        }

        info!(pin = number, "GPIO output ready (low)");
        Ok(Self {
            pin,
            number,
            on: false,
            exported: true,
        })
    }

    /// [`GpioOutput::open`] on the blocking pool.
    pub async fn open_async(number: u64) -> Result<Self, ResourceError> {
        tokio::task::spawn_blocking(move || Self::open(number))
            .await
            .map_err(|e| open_error(number, e))?
    }
}

impl Actuator for GpioOutput {
    fn set(&mut self, on: bool) -> Result<(), ActuatorError> {
        if !self.exported {
            return Err(ActuatorError::NotInitialised);
        }
        self.pin
            .set_value(u8::from(on))
            .map_err(|e| ActuatorError::Io(format!("GPIO{}: {}", self.number, e)))?;
        self.on = on;
        Ok(())
    }

    fn is_on(&self) -> bool {
        self.on
    }

    fn release(&mut self) -> Result<(), ActuatorError> {
        if !self.exported {
            return Ok(());
        }
        if self.on {
            self.set(false)?;
        }
        self.exported = false;
        self.pin
            .unexport()
            .map_err(|e| ActuatorError::Io(format!("GPIO{} unexport: {}", self.number, e)))?;
        info!(pin = self.number, "GPIO unexported");
        Ok(())
    }
}

impl Drop for GpioOutput {
    fn drop(&mut self) {
        if self.exported {
            warn!(pin = self.number, "GPIO dropped without release");
            let _ = self.pin.set_value(0);
            let _ = self.pin.unexport();
        }
    }
}

fn open_error(number: u64, e: impl std::fmt::Display) -> ResourceError {
    ResourceError::Open {
        resource: format!("GPIO{}", number),
        reason: e.to_string(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_open_invalid_pin_is_resource_error() {
        let err = GpioOutput::open(99_999).err().expect("pin should not exist");
        assert!(matches!(err, ResourceError::Open { ref resource, .. } if resource == "GPIO99999"));
    }

    #[tokio::test]
    async fn test_open_async_runs_off_the_runtime() {
        let err = GpioOutput::open_async(99_998).await.err().expect("pin should not exist");
        assert!(matches!(err, ResourceError::Open { ref resource, .. } if resource == "GPIO99998"));
    }
}
