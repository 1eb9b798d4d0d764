/*!
Hardware stand-ins: a sample source that replays a script and an
in-memory actuator that records every write.
*/

use std::collections::VecDeque;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;
use std::time::Duration;

use boatwatch_core::{Actuator, ActuatorError, Reading, SampleError, SampleSource};
use parking_lot::Mutex;

/// One scripted read.
#[derive(Debug, Clone)]
pub enum ScriptStep {
    /// Single-value reading (CPU temperature).
    Value(f64),
    /// Temperature plus humidity.
    Climate(f64, f64),
    /// Read fails as if the device sent this garbage line.
    Malformed(String),
    /// Read fails with an I/O error.
    IoFailure,
    /// Read blocks for this long, then yields the next step.
    Stall(Duration),
}

/// Replays [`ScriptStep`]s in order. Once exhausted every read fails with
/// [`SampleError::Empty`].
#[derive(Debug, Clone, Default)]
pub struct ScriptedSource {
    steps: Arc<Mutex<VecDeque<ScriptStep>>>,
    reads: Arc<AtomicU32>,
}

impl ScriptedSource {
    pub fn new(steps: impl IntoIterator<Item = ScriptStep>) -> Self {
        Self {
            steps: Arc::new(Mutex::new(steps.into_iter().collect())),
            reads: Arc::new(AtomicU32::new(0)),
        }
    }

    /// Convenience for a single-value trace.
    pub fn values(values: &[f64]) -> Self {
        Self::new(values.iter().copied().map(ScriptStep::Value))
    }

    pub fn push(&self, step: ScriptStep) {
        self.steps.lock().push_back(step);
    }

    pub fn read_count(&self) -> u32 {
        self.reads.load(Ordering::Relaxed)
    }

    pub fn remaining(&self) -> usize {
        self.steps.lock().len()
    }
}

impl SampleSource for ScriptedSource {
    fn read(&mut self) -> Result<Reading, SampleError> {
        self.reads.fetch_add(1, Ordering::Relaxed);
        loop {
            // lock is released before sleeping
            let step = self.steps.lock().pop_front();
            match step {
                None => return Err(SampleError::Empty),
                Some(ScriptStep::Value(v)) => return Ok(Reading::new(v)),
                Some(ScriptStep::Climate(t, h)) => return Ok(Reading::new(t).with_secondary(h)),
                Some(ScriptStep::Malformed(line)) => {
                    return Err(SampleError::malformed(line, "scripted malformed line"))
                }
                Some(ScriptStep::IoFailure) => {
                    return Err(SampleError::Io(std::io::Error::new(
                        std::io::ErrorKind::BrokenPipe,
                        "scripted device failure",
                    )))
                }
                Some(ScriptStep::Stall(d)) => std::thread::sleep(d),
            }
        }
    }
}

#[derive(Debug, Default)]
struct ActuatorLog {
    on: bool,
    writes: Vec<bool>,
    fail_next: u32,
    releases: u32,
}

/// In-memory binary output. Clones share state so tests can inspect it
/// after handing the actuator to an agent.
#[derive(Debug, Clone, Default)]
pub struct MockActuator {
    log: Arc<Mutex<ActuatorLog>>,
}

impl MockActuator {
    pub fn new() -> Self {
        Self::default()
    }

    /// Actuator left ON by a previous run.
    pub fn starting_on() -> Self {
        let actuator = Self::default();
        actuator.log.lock().on = true;
        actuator
    }

    /// Fail the next `n` writes without changing the level.
    pub fn fail_next_writes(&self, n: u32) {
        self.log.lock().fail_next = n;
    }

    pub fn level(&self) -> bool {
        self.log.lock().on
    }

    /// Every successful write, in order.
    pub fn writes(&self) -> Vec<bool> {
        self.log.lock().writes.clone()
    }

    pub fn release_count(&self) -> u32 {
        self.log.lock().releases
    }
}

impl Actuator for MockActuator {
    fn set(&mut self, on: bool) -> Result<(), ActuatorError> {
        let mut log = self.log.lock();
        if log.fail_next > 0 {
            log.fail_next -= 1;
            return Err(ActuatorError::Io("scripted write failure".into()));
        }
        log.on = on;
        log.writes.push(on);
        Ok(())
    }

    fn is_on(&self) -> bool {
        self.log.lock().on
    }

    fn release(&mut self) -> Result<(), ActuatorError> {
        self.log.lock().releases += 1;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_script_replays_in_order() {
        let mut source = ScriptedSource::new([
            ScriptStep::Value(48.0),
            ScriptStep::Malformed("abc, notanumber".into()),
            ScriptStep::Climate(73.4, 42.0),
        ]);

        assert_eq!(source.read().unwrap().value(), 48.0);
        assert!(matches!(source.read(), Err(SampleError::Malformed { .. })));
        let climate = source.read().unwrap();
        assert_eq!(climate.secondary(), &[42.0]);
        assert!(matches!(source.read(), Err(SampleError::Empty)));
        assert_eq!(source.read_count(), 4);
    }

    #[test]
    fn test_steps_can_be_appended_through_a_clone() {
        let mut source = ScriptedSource::values(&[47.0]);
        let handle = source.clone();
        handle.push(ScriptStep::Stall(Duration::from_millis(1)));
        handle.push(ScriptStep::Value(52.0));
        assert_eq!(handle.remaining(), 3);

        assert_eq!(source.read().unwrap().value(), 47.0);
        // a stall is consumed together with the step after it
        assert_eq!(source.read().unwrap().value(), 52.0);
        assert_eq!(handle.remaining(), 0);
        assert_eq!(handle.read_count(), 2);
    }

    #[test]
    fn test_actuator_failures_keep_level() {
        let mut actuator = MockActuator::starting_on();
        actuator.fail_next_writes(1);

        assert!(actuator.set(false).is_err());
        assert!(actuator.is_on());
        actuator.set(false).unwrap();
        assert!(!actuator.is_on());
        assert_eq!(actuator.writes(), vec![false]);
    }

    #[test]
    fn test_clones_share_state() {
        let handle = MockActuator::new();
        let mut owned = handle.clone();
        owned.set(true).unwrap();
        owned.release().unwrap();
        assert!(handle.level());
        assert_eq!(handle.release_count(), 1);
    }
}
