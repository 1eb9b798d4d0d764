//! Transport lifecycle, decoupled from the sampling cadence.
//!
//! A background task keeps calling the [`Connector`] until one attempt
//! succeeds, sleeping a fixed interval between failures. Callers only ever
//! see a snapshot of the state; `publish` fails fast with
//! [`PublishError::NotReady`] instead of waiting for the link.
//!
//! Retrying stops after the first successful connect. A transport that later
//! drops is expected to recover on its own I/O loop; the manager stays
//! `Ready`.

use std::fmt;
use std::sync::atomic::{AtomicBool, AtomicU32, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use parking_lot::{Mutex, RwLock};
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use crate::error::PublishError;
use crate::ports::{Connector, DeliveryGuarantee, Transport};

/// Upper bound on a best-effort disconnect during shutdown.
const DISCONNECT_TIMEOUT: Duration = Duration::from_secs(5);

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ConnectionState {
    Disconnected,
    Connecting,
    Ready,
    Failed(String),
}

impl ConnectionState {
    pub fn is_ready(&self) -> bool {
        matches!(self, ConnectionState::Ready)
    }
}

impl fmt::Display for ConnectionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ConnectionState::Disconnected => f.write_str("disconnected"),
            ConnectionState::Connecting => f.write_str("connecting"),
            ConnectionState::Ready => f.write_str("ready"),
            ConnectionState::Failed(reason) => write!(f, "failed ({reason})"),
        }
    }
}

/// Receipt for a queued publish.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Ack {
    pub sequence: u64,
}

struct Shared<T> {
    state: watch::Sender<ConnectionState>,
    transport: RwLock<Option<Arc<T>>>,
    attempts: AtomicU32,
    published: AtomicU64,
    /// Set once by `shutdown`; the connect task must not advance past it.
    closed: AtomicBool,
}

impl<T> Shared<T> {
    /// Publish `state` and optionally install `transport`, unless shutdown
    /// has started. Both happen under the transport write lock so they can
    /// never interleave with `shutdown` taking the transport.
    fn advance(&self, state: ConnectionState, transport: Option<T>) -> bool {
        let mut slot = self.transport.write();
        if self.closed.load(Ordering::SeqCst) {
            return false;
        }
        if let Some(transport) = transport {
            *slot = Some(Arc::new(transport));
        }
        self.state.send_replace(state);
        true
    }
}

/// Cloneable handle; all clones observe the same connection.
pub struct ConnectionManager<T: Transport> {
    shared: Arc<Shared<T>>,
    task: Arc<Mutex<Option<JoinHandle<()>>>>,
}

impl<T: Transport> Clone for ConnectionManager<T> {
    fn clone(&self) -> Self {
        Self {
            shared: self.shared.clone(),
            task: self.task.clone(),
        }
    }
}

impl<T: Transport> ConnectionManager<T> {
    /// Start the connect loop on the current tokio runtime. Returns at once.
    pub fn spawn<C>(connector: C, retry_interval: Duration) -> Self
    where
        C: Connector<Transport = T>,
    {
        let (state, _) = watch::channel(ConnectionState::Disconnected);
        let shared = Arc::new(Shared {
            state,
            transport: RwLock::new(None),
            attempts: AtomicU32::new(0),
            published: AtomicU64::new(0),
            closed: AtomicBool::new(false),
        });

        let handle = tokio::spawn(connect_loop(connector, shared.clone(), retry_interval));

        Self {
            shared,
            task: Arc::new(Mutex::new(Some(handle))),
        }
    }

    /// Latest state snapshot. Never blocks on the network.
    pub fn current(&self) -> ConnectionState {
        self.shared.state.borrow().clone()
    }

    pub fn subscribe(&self) -> watch::Receiver<ConnectionState> {
        self.shared.state.subscribe()
    }

    /// Connect attempts made so far.
    pub fn attempts(&self) -> u32 {
        self.shared.attempts.load(Ordering::Relaxed)
    }

    pub fn publish(
        &self,
        channel: &str,
        payload: Vec<u8>,
        guarantee: DeliveryGuarantee,
    ) -> Result<Ack, PublishError> {
        if !self.shared.state.borrow().is_ready() {
            return Err(PublishError::NotReady);
        }
        let transport = self
            .shared
            .transport
            .read()
            .clone()
            .ok_or(PublishError::NotReady)?;

        transport.publish(channel, payload, guarantee)?;
        let sequence = self.shared.published.fetch_add(1, Ordering::Relaxed) + 1;
        Ok(Ack { sequence })
    }

    /// Stop the connect loop without touching the transport. Safe to call
    /// from `Drop`.
    pub fn abort(&self) {
        if let Some(handle) = self.task.lock().take() {
            handle.abort();
        }
    }

    /// Stop the connect loop and disconnect the transport (best-effort).
    /// Idempotent.
    pub async fn shutdown(&self) {
        let transport = {
            let mut slot = self.shared.transport.write();
            self.shared.closed.store(true, Ordering::SeqCst);
            slot.take()
        };
        self.abort();

        if let Some(transport) = transport {
            match tokio::time::timeout(DISCONNECT_TIMEOUT, transport.disconnect()).await {
                Ok(Ok(())) => info!("Transport disconnected"),
                Ok(Err(e)) => warn!("Transport disconnect failed: {}", e),
                Err(_) => warn!("Transport disconnect timed out after {:?}", DISCONNECT_TIMEOUT),
            }
        }
        self.shared.state.send_replace(ConnectionState::Disconnected);
    }
}

async fn connect_loop<C: Connector>(
    connector: C,
    shared: Arc<Shared<C::Transport>>,
    retry_interval: Duration,
) {
    loop {
        if !shared.advance(ConnectionState::Connecting, None) {
            return;
        }
        let attempt = shared.attempts.fetch_add(1, Ordering::Relaxed) + 1;
        debug!(attempt, "Connecting transport");

        match connector.connect().await {
            Ok(transport) => {
                if shared.advance(ConnectionState::Ready, Some(transport)) {
                    info!(attempt, "Transport connected");
                } else {
                    debug!(attempt, "Connected after shutdown, dropping transport");
                }
                return;
            }
            Err(e) => {
                warn!(
                    attempt,
                    retry_in = ?retry_interval,
                    "Transport connect failed: {}", e
                );
                if !shared.advance(ConnectionState::Failed(e.to_string()), None) {
                    return;
                }
                tokio::time::sleep(retry_interval).await;
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::{ConnectionError, TransportError};
    use futures::future::BoxFuture;
    use futures::FutureExt;

    struct NullTransport;

    impl Transport for NullTransport {
        fn publish(&self, _: &str, _: Vec<u8>, _: DeliveryGuarantee) -> Result<(), TransportError> {
            Ok(())
        }

        fn disconnect(&self) -> BoxFuture<'_, Result<(), TransportError>> {
            async { Ok(()) }.boxed()
        }
    }

    struct NeverConnects;

    impl Connector for NeverConnects {
        type Transport = NullTransport;

        fn connect(&self) -> BoxFuture<'_, Result<NullTransport, ConnectionError>> {
            async { Err(ConnectionError::Network("unreachable".into())) }.boxed()
        }
    }

    struct AlwaysConnects;

    impl Connector for AlwaysConnects {
        type Transport = NullTransport;

        fn connect(&self) -> BoxFuture<'_, Result<NullTransport, ConnectionError>> {
            async { Ok(NullTransport) }.boxed()
        }
    }

    struct HangingConnector;

    impl Connector for HangingConnector {
        type Transport = NullTransport;

        fn connect(&self) -> BoxFuture<'_, Result<NullTransport, ConnectionError>> {
            futures::future::pending().boxed()
        }
    }

    #[tokio::test(start_paused = true)]
    async fn test_publish_is_not_ready_while_failing() {
        let manager = ConnectionManager::spawn(NeverConnects, Duration::from_secs(30));
        let mut rx = manager.subscribe();
        rx.wait_for(|s| matches!(s, ConnectionState::Failed(_)))
            .await
            .unwrap();

        let err = manager
            .publish("home/boat/cpu", b"{}".to_vec(), DeliveryGuarantee::AtLeastOnce)
            .unwrap_err();
        assert!(matches!(err, PublishError::NotReady));
        assert!(matches!(manager.current(), ConnectionState::Failed(_)));
        manager.shutdown().await;
    }

    #[tokio::test]
    async fn test_ready_then_shutdown_disconnects() {
        let manager = ConnectionManager::spawn(AlwaysConnects, Duration::from_secs(30));
        let mut rx = manager.subscribe();
        rx.wait_for(ConnectionState::is_ready).await.unwrap();

        let ack = manager
            .publish("home/boat/cpu", b"{}".to_vec(), DeliveryGuarantee::AtLeastOnce)
            .unwrap();
        assert_eq!(ack.sequence, 1);
        assert_eq!(manager.attempts(), 1);

        manager.shutdown().await;
        assert_eq!(manager.current(), ConnectionState::Disconnected);
        // second shutdown is a no-op
        manager.shutdown().await;
    }

    #[tokio::test]
    async fn test_publish_fails_fast_while_connecting() {
        let manager = ConnectionManager::spawn(HangingConnector, Duration::from_secs(30));
        let mut rx = manager.subscribe();
        rx.wait_for(|s| matches!(s, ConnectionState::Connecting))
            .await
            .unwrap();

        let started = std::time::Instant::now();
        let err = manager
            .publish("home/boat/cpu", b"{}".to_vec(), DeliveryGuarantee::AtLeastOnce)
            .unwrap_err();
        assert!(matches!(err, PublishError::NotReady));
        assert!(started.elapsed() < Duration::from_millis(100));

        manager.shutdown().await;
        assert_eq!(manager.current(), ConnectionState::Disconnected);
    }

    #[tokio::test]
    async fn test_connect_finishing_after_shutdown_is_discarded() {
        let manager = ConnectionManager::spawn(HangingConnector, Duration::from_secs(30));
        let mut rx = manager.subscribe();
        rx.wait_for(|s| matches!(s, ConnectionState::Connecting))
            .await
            .unwrap();
        manager.shutdown().await;

        // a connect that resolved just before the abort landed
        assert!(!manager.shared.advance(ConnectionState::Ready, Some(NullTransport)));
        assert!(!manager.shared.advance(ConnectionState::Connecting, None));
        assert_eq!(manager.current(), ConnectionState::Disconnected);
        assert!(manager.shared.transport.read().is_none());
        let err = manager
            .publish("home/boat/cpu", b"{}".to_vec(), DeliveryGuarantee::AtLeastOnce)
            .unwrap_err();
        assert!(matches!(err, PublishError::NotReady));
    }
}
