/*!
Test harness for Boatwatch agents

Wires the stubs into a real `AgentLoop`:
- Scripted sensor, in-memory actuator, recording transport
- Runs an exact number of cycles on the (paused) tokio clock
- Assertions on the published telemetry and on emitted log lines
*/

use std::collections::HashMap;
use std::io;
use std::sync::Arc;
use std::time::Duration;

use anyhow::Result;
use boatwatch_core::{
    AgentError, AgentLoop, AgentSummary, ClimateSchema, FanSchema, HysteresisController,
    LoopTiming, TelemetryTarget, Thresholds,
};
use parking_lot::Mutex;
use serde_json::Value;
use tracing::subscriber::DefaultGuard;
use tracing_subscriber::fmt::MakeWriter;

use crate::mqtt_stub::{MockConnector, MockTransport};
use crate::sensor_stub::{MockActuator, ScriptedSource};

pub const FAN_TOPIC: &str = "home/boat/cpu";
pub const CLIMATE_TOPIC: &str = "home/boat/usb_sht45";

pub type MockAgent = AgentLoop<ScriptedSource, MockActuator, MockConnector>;

/// Complete test rig for one agent.
pub struct TestHarness {
    pub source: ScriptedSource,
    pub actuator: MockActuator,
    pub transport: MockTransport,
    pub connector: MockConnector,
    pub timing: LoopTiming,
    expectations: Vec<Expectation>,
}

#[derive(Debug)]
struct Expectation {
    topic: String,
    expected_count: usize,
}

impl TestHarness {
    pub fn new() -> Self {
        let _ = tracing_subscriber::fmt()
            .with_test_writer()
            .with_env_filter("debug")
            .try_init();

        let transport = MockTransport::new();
        Self {
            source: ScriptedSource::default(),
            actuator: MockActuator::new(),
            connector: MockConnector::new(transport.clone()),
            transport,
            timing: LoopTiming::default(),
            expectations: Vec::new(),
        }
    }

    pub fn with_source(mut self, source: ScriptedSource) -> Self {
        self.source = source;
        self
    }

    pub fn with_actuator(mut self, actuator: MockActuator) -> Self {
        self.actuator = actuator;
        self
    }

    /// Broker refuses the first `failures` connection attempts.
    pub fn with_connect_failures(mut self, failures: u32) -> Self {
        self.connector = MockConnector::failing(failures, self.transport.clone());
        self
    }

    pub fn with_unreachable_broker(mut self) -> Self {
        self.connector = MockConnector::unreachable(self.transport.clone());
        self
    }

    pub fn with_timing(mut self, timing: LoopTiming) -> Self {
        self.timing = timing;
        self
    }

    /// Fan agent on [`FAN_TOPIC`], ON at `on`, OFF at `off`.
    pub fn fan_agent(&self, on: f64, off: f64) -> Result<MockAgent> {
        self.agent(on, off, TelemetryTarget::new(FAN_TOPIC, FanSchema))
    }

    /// Climate forwarder on [`CLIMATE_TOPIC`].
    pub fn climate_agent(&self, on: f64, off: f64) -> Result<MockAgent> {
        self.agent(on, off, TelemetryTarget::new(CLIMATE_TOPIC, ClimateSchema))
    }

    fn agent(&self, on: f64, off: f64, target: TelemetryTarget) -> Result<MockAgent> {
        let controller = HysteresisController::new(Thresholds::new(on, off)?);
        Ok(AgentLoop::new(
            self.source.clone(),
            self.actuator.clone(),
            self.connector.clone(),
            controller,
            target,
            self.timing,
        ))
    }

    /// How long to let an agent run so that exactly `cycles` cycles start.
    pub fn window_for(&self, cycles: u32) -> Duration {
        let period = self.timing.period;
        period * cycles.saturating_sub(1) + period / 2
    }

    /// Run `agent` for exactly `cycles` cycles, then signal shutdown.
    pub async fn run_cycles(
        &self,
        agent: MockAgent,
        cycles: u32,
    ) -> std::result::Result<AgentSummary, AgentError> {
        let window = self.window_for(cycles);
        agent.run(tokio::time::sleep(window)).await
    }

    /// Expect `count` messages on `topic` once the run is over.
    pub fn expect_messages(&mut self, topic: &str, count: usize) -> &mut Self {
        self.expectations.push(Expectation {
            topic: topic.to_string(),
            expected_count: count,
        });
        self
    }

    pub fn verify_expectations(&self) -> Result<()> {
        for expectation in &self.expectations {
            let actual_count = self.transport.find_messages_by_topic(&expectation.topic).len();
            if actual_count != expectation.expected_count {
                anyhow::bail!(
                    "Expectation failed for topic '{}': expected {} messages, got {}",
                    expectation.topic,
                    expectation.expected_count,
                    actual_count
                );
            }
        }
        Ok(())
    }

    /// Every payload on `topic`, parsed as JSON, in publish order.
    pub fn payloads(&self, topic: &str) -> Result<Vec<Value>> {
        self.transport
            .find_messages_by_topic(topic)
            .iter()
            .map(|msg| Ok(serde_json::from_slice(&msg.payload)?))
            .collect()
    }

    /// Assert a field of the latest message on `topic`.
    pub fn assert_field_equals(&self, topic: &str, field: &str, expected: &Value) -> Result<()> {
        let Some(msg) = self.transport.get_last_json_message::<Value>(topic)? else {
            anyhow::bail!("No message published on {}", topic);
        };
        match msg.get(field) {
            Some(actual) if actual == expected => Ok(()),
            Some(actual) => anyhow::bail!(
                "Field '{}' mismatch: expected {}, got {}",
                field,
                expected,
                actual
            ),
            None => anyhow::bail!("Field '{}' not found in latest message on {}", field, topic),
        }
    }

    pub fn get_stats(&self) -> TestStats {
        let messages = self.transport.get_published_messages();
        let mut topic_counts = HashMap::new();
        for msg in &messages {
            *topic_counts.entry(msg.topic.clone()).or_insert(0) += 1;
        }

        TestStats {
            total_messages: messages.len(),
            topic_counts,
            actuator_writes: self.actuator.writes().len(),
            connect_attempts: self.connector.attempt_times().len(),
        }
    }
}

impl Default for TestHarness {
    fn default() -> Self {
        Self::new()
    }
}

#[derive(Debug)]
pub struct TestStats {
    pub total_messages: usize,
    pub topic_counts: HashMap<String, usize>,
    pub actuator_writes: usize,
    pub connect_attempts: usize,
}

/// In-memory log sink for asserting on what an agent reported.
///
/// Installed as the thread's default subscriber, so it sees everything the
/// agent logs on a current-thread test runtime.
#[derive(Clone, Default)]
pub struct LogCapture {
    buf: Arc<Mutex<Vec<u8>>>,
}

pub struct CaptureWriter(Arc<Mutex<Vec<u8>>>);

impl io::Write for CaptureWriter {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        self.0.lock().extend_from_slice(buf);
        Ok(buf.len())
    }

    fn flush(&mut self) -> io::Result<()> {
        Ok(())
    }
}

impl<'a> MakeWriter<'a> for LogCapture {
    type Writer = CaptureWriter;

    fn make_writer(&'a self) -> Self::Writer {
        CaptureWriter(self.buf.clone())
    }
}

impl LogCapture {
    /// Start capturing. Capture stops when the guard is dropped.
    pub fn install() -> (Self, DefaultGuard) {
        let capture = Self::default();
        let subscriber = tracing_subscriber::fmt()
            .with_writer(capture.clone())
            .with_ansi(false)
            .without_time()
            .with_max_level(tracing::Level::DEBUG)
            .finish();
        (capture, tracing::subscriber::set_default(subscriber))
    }

    pub fn lines(&self) -> Vec<String> {
        String::from_utf8_lossy(&self.buf.lock())
            .lines()
            .map(str::to_string)
            .collect()
    }

    /// WARN lines mentioning `needle`.
    pub fn warnings_containing(&self, needle: &str) -> Vec<String> {
        self.lines()
            .into_iter()
            .filter(|line| line.contains("WARN") && line.contains(needle))
            .collect()
    }
}
