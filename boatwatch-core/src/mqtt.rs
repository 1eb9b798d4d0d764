//! rumqttc-backed [`Connector`] and [`Transport`].
//!
//! A connect attempt polls a fresh event loop until the broker's CONNACK
//! (bounded by the connect timeout). On success the event loop is moved to
//! its own task, which keeps the socket alive, handles acks and lets
//! rumqttc re-dial on its own if the link drops.

use std::time::Duration;

use futures::future::BoxFuture;
use futures::FutureExt;
use parking_lot::Mutex;
use rumqttc::{
    AsyncClient, ClientError, ConnectReturnCode, Event, EventLoop, Incoming, MqttOptions, Outgoing,
    QoS,
};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::config::{AgentSettings, Credentials};
use crate::error::{ConnectionError, TransportError};
use crate::ports::{Connector, DeliveryGuarantee, Transport};

/// Requests buffered between the client handle and the event loop.
const REQUEST_CAPACITY: usize = 10;
/// Pause before polling again after a network error.
const IO_ERROR_BACKOFF: Duration = Duration::from_secs(5);
const DISCONNECT_GRACE: Duration = Duration::from_secs(2);

#[derive(Debug, Clone)]
pub struct MqttConnector {
    client_prefix: String,
    broker: String,
    port: u16,
    credentials: Option<Credentials>,
    keep_alive: Duration,
    connect_timeout: Duration,
}

impl MqttConnector {
    pub fn new(client_prefix: impl Into<String>, broker: impl Into<String>, port: u16) -> Self {
        Self {
            client_prefix: client_prefix.into(),
            broker: broker.into(),
            port,
            credentials: None,
            keep_alive: Duration::from_secs(60),
            connect_timeout: Duration::from_secs(60),
        }
    }

    pub fn from_settings(settings: &AgentSettings) -> Self {
        let mut connector = Self::new(settings.kind.name(), &settings.broker, settings.port);
        if let Some(credentials) = &settings.credentials {
            connector = connector.with_credentials(credentials.clone());
        }
        connector.keep_alive = settings.keep_alive;
        connector.connect_timeout = settings.connect_timeout;
        connector
    }

    pub fn with_credentials(mut self, credentials: Credentials) -> Self {
        self.credentials = Some(credentials);
        self
    }

    fn options(&self) -> MqttOptions {
        let client_id = format!("{}-{}", self.client_prefix, Uuid::new_v4().simple());
        let mut options = MqttOptions::new(client_id, &self.broker, self.port);
        options.set_keep_alive(self.keep_alive);
        options.set_clean_session(true);
        if let Some(credentials) = &self.credentials {
            options.set_credentials(&credentials.username, &credentials.password);
        }
        options
    }

    async fn handshake(&self, eventloop: &mut EventLoop) -> Result<(), ConnectionError> {
        loop {
            match eventloop.poll().await {
                Ok(Event::Incoming(Incoming::ConnAck(ack))) => {
                    return match ack.code {
                        ConnectReturnCode::Success => Ok(()),
                        code => Err(ConnectionError::Refused(format!("{:?}", code))),
                    };
                }
                Ok(_) => {}
                Err(rumqttc::ConnectionError::ConnectionRefused(code)) => {
                    return Err(ConnectionError::Refused(format!("{:?}", code)));
                }
                Err(e) => return Err(ConnectionError::Network(e.to_string())),
            }
        }
    }
}

impl Connector for MqttConnector {
    type Transport = MqttTransport;

    fn connect(&self) -> BoxFuture<'_, Result<MqttTransport, ConnectionError>> {
        async move {
            let (client, mut eventloop) = AsyncClient::new(self.options(), REQUEST_CAPACITY);

            match tokio::time::timeout(self.connect_timeout, self.handshake(&mut eventloop)).await {
                Ok(Ok(())) => {}
                Ok(Err(e)) => return Err(e),
                Err(_) => return Err(ConnectionError::Timeout(self.connect_timeout)),
            }
            info!("Connected to MQTT broker at {}:{}", self.broker, self.port);

            let io = tokio::spawn(drive_event_loop(eventloop));

            Ok(MqttTransport {
                client,
                io: Mutex::new(Some(io)),
            })
        }
        .boxed()
    }
}

pub struct MqttTransport {
    client: AsyncClient,
    io: Mutex<Option<JoinHandle<()>>>,
}

impl Transport for MqttTransport {
    fn publish(
        &self,
        channel: &str,
        payload: Vec<u8>,
        guarantee: DeliveryGuarantee,
    ) -> Result<(), TransportError> {
        let qos = match guarantee {
            DeliveryGuarantee::AtMostOnce => QoS::AtMostOnce,
            DeliveryGuarantee::AtLeastOnce => QoS::AtLeastOnce,
        };
        self.client
            .try_publish(channel, qos, false, payload)
            .map_err(|e| match e {
                ClientError::TryRequest(_) => TransportError::QueueFull,
                other => TransportError::Closed(other.to_string()),
            })
    }

    fn disconnect(&self) -> BoxFuture<'_, Result<(), TransportError>> {
        async move {
            let result = self
                .client
                .disconnect()
                .await
                .map_err(|e| TransportError::Closed(e.to_string()));

            let io = self.io.lock().take();
            if let Some(mut io) = io {
                if tokio::time::timeout(DISCONNECT_GRACE, &mut io).await.is_err() {
                    io.abort();
                }
            }
            result
        }
        .boxed()
    }
}

impl Drop for MqttTransport {
    fn drop(&mut self) {
        if let Some(io) = self.io.get_mut().take() {
            io.abort();
        }
    }
}

async fn drive_event_loop(mut eventloop: EventLoop) {
    // the handshake already saw a CONNACK
    let mut link_up = true;
    loop {
        match eventloop.poll().await {
            Ok(Event::Incoming(Incoming::ConnAck(_))) => {
                if !link_up {
                    info!("MQTT link re-established");
                }
                link_up = true;
            }
            Ok(Event::Incoming(Incoming::PubAck(ack))) => {
                debug!(pkid = ack.pkid, "Publish acknowledged");
            }
            Ok(Event::Outgoing(Outgoing::Disconnect)) => {
                debug!("MQTT disconnect sent, stopping I/O loop");
                return;
            }
            Ok(_) => {}
            Err(e) => {
                if std::mem::replace(&mut link_up, false) {
                    warn!("MQTT link lost: {}", e);
                } else {
                    debug!("MQTT still unreachable: {}", e);
                }
                tokio::time::sleep(IO_ERROR_BACKOFF).await;
            }
        }
    }
}
