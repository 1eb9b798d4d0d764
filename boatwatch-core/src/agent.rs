//! Agent main loop: sense → decide → actuate → publish on a fixed period.
//!
//! Lifecycle: `Starting` (drive the actuator off, start the connection
//! manager) → `Running` → `Stopping` (actuator off, release, disconnect) →
//! `Stopped`. Teardown runs exactly once, whether the loop ends on a
//! shutdown signal, a startup failure, or the future being dropped.
//!
//! Per-cycle failures are logged and the loop carries on; only startup
//! errors come back out of [`AgentLoop::run`].

use std::any::Any;
use std::future::Future;
use std::panic::AssertUnwindSafe;
use std::sync::Arc;
use std::time::Duration;

use futures::FutureExt;
use parking_lot::Mutex;
use tokio::sync::watch;
use tokio::time::MissedTickBehavior;
use tracing::{error, info, warn};

use crate::connection::ConnectionManager;
use crate::error::{AgentError, ResourceError, SampleError};
use crate::hysteresis::HysteresisController;
use crate::models::{ActuatorState, Reading};
use crate::ports::{Actuator, Connector, SampleSource, Transport};
use crate::telemetry::{PayloadSchema, PublishOutcome, TelemetryPublisher};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AgentPhase {
    Starting,
    Running,
    Stopping,
    Stopped,
}

/// Timing knobs for one agent.
#[derive(Debug, Clone, Copy)]
pub struct LoopTiming {
    /// Time between cycle starts.
    pub period: Duration,
    /// A sample read slower than this counts as a failed sample.
    pub read_timeout: Duration,
    /// Pause between failed connect attempts.
    pub retry_interval: Duration,
}

impl Default for LoopTiming {
    fn default() -> Self {
        Self {
            period: Duration::from_secs(5),
            read_timeout: Duration::from_secs(3),
            retry_interval: Duration::from_secs(30),
        }
    }
}

/// Per-outcome cycle counters.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct AgentSummary {
    pub cycles: u64,
    /// Cycles dropped because no sample could be read.
    pub skipped: u64,
    pub delivered: u64,
    pub not_connected: u64,
    pub rejected: u64,
    /// Actuator write failures and panicking cycles.
    pub faults: u64,
}

/// Where and how telemetry is published.
pub struct TelemetryTarget {
    pub channel: String,
    pub schema: Box<dyn PayloadSchema>,
}

impl TelemetryTarget {
    pub fn new(channel: impl Into<String>, schema: impl PayloadSchema) -> Self {
        Self {
            channel: channel.into(),
            schema: Box::new(schema),
        }
    }
}

pub struct AgentLoop<S, A, C>
where
    S: SampleSource,
    A: Actuator,
    C: Connector,
{
    source: S,
    actuator: A,
    connector: C,
    controller: HysteresisController,
    target: TelemetryTarget,
    timing: LoopTiming,
    phase: watch::Sender<AgentPhase>,
}

impl<S, A, C> AgentLoop<S, A, C>
where
    S: SampleSource,
    A: Actuator,
    C: Connector,
{
    pub fn new(
        source: S,
        actuator: A,
        connector: C,
        controller: HysteresisController,
        target: TelemetryTarget,
        timing: LoopTiming,
    ) -> Self {
        let (phase, _) = watch::channel(AgentPhase::Starting);
        Self {
            source,
            actuator,
            connector,
            controller,
            target,
            timing,
            phase,
        }
    }

    /// Observe lifecycle transitions.
    pub fn phase(&self) -> watch::Receiver<AgentPhase> {
        self.phase.subscribe()
    }

    /// Run until `shutdown` resolves. Returns `Err` only for startup
    /// failures; the actuator is off by the time this returns.
    pub async fn run<F>(self, shutdown: F) -> Result<AgentSummary, AgentError>
    where
        F: Future<Output = ()>,
    {
        let AgentLoop {
            source,
            actuator,
            connector,
            controller,
            target,
            timing,
            phase,
        } = self;

        phase.send_replace(AgentPhase::Starting);
        let mut teardown = Teardown {
            actuator,
            connection: None,
            phase,
            done: false,
        };

        if let Err(e) = teardown.actuator.set(false) {
            error!("Cannot drive actuator to OFF at startup: {}", e);
            teardown.run().await;
            return Err(ResourceError::Actuator(e).into());
        }
        info!("Actuator initialised and set to OFF");

        let connection = ConnectionManager::spawn(connector, timing.retry_interval);
        teardown.connection = Some(connection.clone());

        let mut cycle = Cycle {
            source: Arc::new(Mutex::new(source)),
            controller,
            publisher: TelemetryPublisher::new(connection, target.channel, target.schema),
            read_timeout: timing.read_timeout,
            summary: AgentSummary::default(),
        };

        teardown.phase.send_replace(AgentPhase::Running);
        info!(
            period = ?timing.period,
            channel = %cycle.publisher.channel(),
            "Agent running"
        );

        let mut ticker = tokio::time::interval(timing.period);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
        tokio::pin!(shutdown);

        loop {
            tokio::select! {
                biased;
                _ = &mut shutdown => {
                    info!("Shutdown requested");
                    break;
                }
                _ = ticker.tick() => {}
            }

            let outcome = AssertUnwindSafe(cycle.run_once(&mut teardown.actuator))
                .catch_unwind()
                .await;
            if let Err(panic) = outcome {
                cycle.summary.faults += 1;
                error!(
                    cycle = cycle.summary.cycles,
                    "Cycle aborted by unexpected error: {}",
                    panic_message(&*panic)
                );
            }
        }

        teardown.run().await;
        info!(summary = ?cycle.summary, "Agent stopped");
        Ok(cycle.summary)
    }
}

struct Cycle<S: SampleSource, T: Transport> {
    source: Arc<Mutex<S>>,
    controller: HysteresisController,
    publisher: TelemetryPublisher<T>,
    read_timeout: Duration,
    summary: AgentSummary,
}

impl<S: SampleSource, T: Transport> Cycle<S, T> {
    async fn run_once<A: Actuator>(&mut self, actuator: &mut A) {
        self.summary.cycles += 1;
        let n = self.summary.cycles;

        let reading = match self.sample().await {
            Ok(reading) => reading,
            Err(e) => {
                self.summary.skipped += 1;
                warn!(
                    cycle = n,
                    step = "sample",
                    actuator = %self.controller.state(),
                    "Sample failed, skipping cycle: {}", e
                );
                return;
            }
        };

        let previous = self.controller.state();
        let state = self.controller.update(&reading);
        if state != previous {
            info!(value = reading.value(), "Actuator turned {}", state);
        }

        // written every cycle so a failed write is repaired on the next one
        if let Err(e) = actuator.set(state.is_on()) {
            self.summary.faults += 1;
            warn!(cycle = n, step = "actuate", commanded = %state, "Actuator write failed: {}", e);
        }

        let outcome = self.publisher.publish(&reading, state);
        self.record(n, &reading, state, &outcome);
    }

    fn record(&mut self, n: u64, reading: &Reading, state: ActuatorState, outcome: &PublishOutcome) {
        match outcome {
            PublishOutcome::Delivered(_) => self.summary.delivered += 1,
            PublishOutcome::Skipped(_) => self.summary.not_connected += 1,
            PublishOutcome::Rejected(reason) => {
                self.summary.rejected += 1;
                warn!(cycle = n, step = "publish", "Telemetry rejected: {}", reason);
            }
        }

        info!(
            cycle = n,
            value = reading.value(),
            secondary = ?reading.secondary(),
            actuator = %state,
            publish = %outcome,
            "Cycle complete"
        );
    }

    async fn sample(&self) -> Result<Reading, SampleError> {
        let source = self.source.clone();
        let read = tokio::task::spawn_blocking(move || source.lock().read());

        match tokio::time::timeout(self.read_timeout, read).await {
            Ok(Ok(result)) => result,
            Ok(Err(join)) => Err(SampleError::Task(join.to_string())),
            Err(_) => Err(SampleError::Timeout(self.read_timeout)),
        }
    }
}

/// Owns everything that must be released on the way out.
struct Teardown<A: Actuator, T: Transport> {
    actuator: A,
    connection: Option<ConnectionManager<T>>,
    phase: watch::Sender<AgentPhase>,
    done: bool,
}

impl<A: Actuator, T: Transport> Teardown<A, T> {
    fn release_actuator(&mut self) {
        if let Err(e) = self.actuator.set(false) {
            warn!("Could not drive actuator OFF during teardown: {}", e);
        }
        if let Err(e) = self.actuator.release() {
            warn!("Could not release actuator: {}", e);
        }
    }

    async fn run(&mut self) {
        if self.done {
            return;
        }
        self.done = true;
        self.phase.send_replace(AgentPhase::Stopping);

        self.release_actuator();
        if let Some(connection) = self.connection.take() {
            connection.shutdown().await;
        }

        self.phase.send_replace(AgentPhase::Stopped);
        info!("Actuator OFF, transport disconnected, resources released");
    }
}

impl<A: Actuator, T: Transport> Drop for Teardown<A, T> {
    fn drop(&mut self) {
        if self.done {
            return;
        }
        self.done = true;
        self.phase.send_replace(AgentPhase::Stopping);
        self.release_actuator();
        if let Some(connection) = self.connection.take() {
            connection.abort();
        }
        self.phase.send_replace(AgentPhase::Stopped);
        warn!("Agent torn down without a clean shutdown; actuator forced OFF");
    }
}

fn panic_message(panic: &(dyn Any + Send)) -> &str {
    if let Some(s) = panic.downcast_ref::<&'static str>() {
        s
    } else if let Some(s) = panic.downcast_ref::<String>() {
        s.as_str()
    } else {
        "unknown panic"
    }
}
