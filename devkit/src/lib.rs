/*!
# Boatwatch DevKit - Stubs and utilities for agent development

Lets the agent core run without a broker or real hardware:
- Recording MQTT transport and a connector that fails on demand
- Scripted sample source and an in-memory actuator
- Test harness wiring them into an `AgentLoop` with payload assertions
*/

pub mod mqtt_stub;
pub mod sensor_stub;
pub mod test_utils;

pub use mqtt_stub::{MockConnector, MockMessage, MockTransport};
pub use sensor_stub::{MockActuator, ScriptStep, ScriptedSource};
pub use test_utils::{LogCapture, TestHarness};
