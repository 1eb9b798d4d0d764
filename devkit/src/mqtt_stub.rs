/*!
Mock MQTT transport for development without a broker.

Records every published message and lets tests simulate broker outages:
the connector can fail a set number of attempts (or forever) and the
transport can start rejecting publishes.
*/

use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::sync::Arc;

use anyhow::Result;
use boatwatch_core::{Connector, ConnectionError, DeliveryGuarantee, Transport, TransportError};
use futures::future::BoxFuture;
use futures::FutureExt;
use parking_lot::Mutex;
use tokio::time::Instant;

#[derive(Debug, Clone)]
pub struct MockMessage {
    pub topic: String,
    pub payload: Vec<u8>,
    pub guarantee: DeliveryGuarantee,
}

#[derive(Default)]
struct TransportLog {
    published: Mutex<Vec<MockMessage>>,
    rejecting: AtomicBool,
    disconnects: AtomicU32,
}

/// Recording transport. Clones share the same log.
#[derive(Clone, Default)]
pub struct MockTransport {
    log: Arc<TransportLog>,
}

impl MockTransport {
    pub fn new() -> Self {
        Self::default()
    }

    /// Make subsequent publishes fail with a full queue.
    pub fn set_rejecting(&self, rejecting: bool) {
        self.log.rejecting.store(rejecting, Ordering::Relaxed);
    }

    pub fn get_published_messages(&self) -> Vec<MockMessage> {
        self.log.published.lock().clone()
    }

    pub fn find_messages_by_topic(&self, topic: &str) -> Vec<MockMessage> {
        self.log
            .published
            .lock()
            .iter()
            .filter(|msg| msg.topic == topic)
            .cloned()
            .collect()
    }

    /// Parse the last message of a topic as JSON.
    pub fn get_last_json_message<T>(&self, topic: &str) -> Result<Option<T>>
    where
        T: for<'de> serde::Deserialize<'de>,
    {
        match self.find_messages_by_topic(topic).last() {
            Some(msg) => Ok(Some(serde_json::from_slice(&msg.payload)?)),
            None => Ok(None),
        }
    }

    pub fn disconnect_count(&self) -> u32 {
        self.log.disconnects.load(Ordering::Relaxed)
    }
}

impl Transport for MockTransport {
    fn publish(
        &self,
        channel: &str,
        payload: Vec<u8>,
        guarantee: DeliveryGuarantee,
    ) -> Result<(), TransportError> {
        if self.log.rejecting.load(Ordering::Relaxed) {
            return Err(TransportError::QueueFull);
        }
        tracing::debug!("[MOCK] Published to {}: {} bytes", channel, payload.len());
        self.log.published.lock().push(MockMessage {
            topic: channel.to_string(),
            payload,
            guarantee,
        });
        Ok(())
    }

    fn disconnect(&self) -> BoxFuture<'_, Result<(), TransportError>> {
        self.log.disconnects.fetch_add(1, Ordering::Relaxed);
        async { Ok(()) }.boxed()
    }
}

/// Connector that fails a configurable number of attempts, then hands out
/// the shared [`MockTransport`].
#[derive(Clone)]
pub struct MockConnector {
    transport: MockTransport,
    failures_left: Arc<AtomicU32>,
    attempts: Arc<Mutex<Vec<Instant>>>,
}

impl MockConnector {
    /// Connects on the first attempt.
    pub fn new(transport: MockTransport) -> Self {
        Self::failing(0, transport)
    }

    /// Fails `failures` attempts before succeeding.
    pub fn failing(failures: u32, transport: MockTransport) -> Self {
        Self {
            transport,
            failures_left: Arc::new(AtomicU32::new(failures)),
            attempts: Arc::new(Mutex::new(Vec::new())),
        }
    }

    /// Broker never reachable.
    pub fn unreachable(transport: MockTransport) -> Self {
        Self::failing(u32::MAX, transport)
    }

    /// Clock reading of every connect attempt so far.
    pub fn attempt_times(&self) -> Vec<Instant> {
        self.attempts.lock().clone()
    }
}

impl Connector for MockConnector {
    type Transport = MockTransport;

    fn connect(&self) -> BoxFuture<'_, Result<MockTransport, ConnectionError>> {
        self.attempts.lock().push(Instant::now());

        let failed = self
            .failures_left
            .fetch_update(Ordering::Relaxed, Ordering::Relaxed, |left| left.checked_sub(1))
            .is_ok();

        let result = if failed {
            Err(ConnectionError::Network("simulated broker outage".into()))
        } else {
            Ok(self.transport.clone())
        };
        async move { result }.boxed()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_mock_transport_records_publishes() {
        let transport = MockTransport::new();
        transport
            .publish("home/boat/cpu", br#"{"temp":47.0,"fan":0}"#.to_vec(), DeliveryGuarantee::AtLeastOnce)
            .unwrap();

        let messages = transport.get_published_messages();
        assert_eq!(messages.len(), 1);
        assert_eq!(messages[0].topic, "home/boat/cpu");
        assert_eq!(messages[0].guarantee, DeliveryGuarantee::AtLeastOnce);

        let parsed: Option<serde_json::Value> = transport.get_last_json_message("home/boat/cpu").unwrap();
        assert_eq!(parsed.unwrap()["fan"], 0);
    }

    #[tokio::test]
    async fn test_rejecting_transport() {
        let transport = MockTransport::new();
        transport.set_rejecting(true);
        let err = transport
            .publish("t", b"{}".to_vec(), DeliveryGuarantee::AtLeastOnce)
            .unwrap_err();
        assert!(matches!(err, TransportError::QueueFull));
        assert!(transport.get_published_messages().is_empty());
    }

    #[tokio::test]
    async fn test_connector_fails_then_succeeds() {
        let connector = MockConnector::failing(2, MockTransport::new());
        assert!(connector.connect().await.is_err());
        assert!(connector.connect().await.is_err());
        assert!(connector.connect().await.is_ok());
        assert!(connector.connect().await.is_ok());
        assert_eq!(connector.attempt_times().len(), 4);
    }
}
