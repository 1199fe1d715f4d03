//! rumqttc-backed transport adapter.
//!
//! Wraps an [`rumqttc::AsyncClient`] and drives its event loop on a
//! background task, forwarding inbound publishes into a single mpsc
//! channel. Reconnection is rumqttc's own: the driver keeps polling
//! through connection errors with a short pause, and the broker re-routes
//! queued QoS 1 traffic once the session is back.
//!
//! # Example
//!
//! ```rust,ignore
//! use printrelay_proto::mqtt::{MqttConfig, MqttTransport};
//!
//! let (transport, inbound) = MqttTransport::connect(MqttConfig {
//!     host: "relay.example.net".into(),
//!     port: 1883,
//!     ..MqttConfig::default()
//! })?;
//! // hand `inbound` to the listener registry, share `transport` freely
//! ```

use std::time::Duration;

use rumqttc::{AsyncClient, Event, MqttOptions, Packet};
use secrecy::{ExposeSecret, SecretString};
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

use crate::error::Error;
use crate::transport::{InboundMessage, QoS, Transport};

/// Pause between polls after a connection error, so a dead broker does
/// not spin the driver task.
const RECONNECT_PAUSE: Duration = Duration::from_secs(1);

/// Username/password pair for the relay broker.
#[derive(Debug, Clone)]
pub struct MqttCredentials {
    pub username: String,
    pub password: SecretString,
}

/// Connection settings for the relay broker.
#[derive(Debug, Clone)]
pub struct MqttConfig {
    pub host: String,
    pub port: u16,
    /// Client identifier presented to the broker. Must be unique per
    /// connection or the broker will kick the older session.
    pub client_id: String,
    pub credentials: Option<MqttCredentials>,
    pub keep_alive: Duration,
    /// Capacity of both the rumqttc request queue and the inbound channel.
    pub capacity: usize,
}

impl Default for MqttConfig {
    fn default() -> Self {
        Self {
            host: "localhost".into(),
            port: 1883,
            client_id: "printrelay".into(),
            credentials: None,
            keep_alive: Duration::from_secs(10),
            capacity: 256,
        }
    }
}

/// Handle to a connected broker client.
///
/// Cheaply cloneable; all clones share one connection. Dropping every
/// clone does not stop the driver — call [`shutdown`](Self::shutdown).
#[derive(Debug, Clone)]
pub struct MqttTransport {
    client: AsyncClient,
    cancel: CancellationToken,
}

impl MqttTransport {
    /// Build the client and spawn the event-loop driver.
    ///
    /// Returns immediately; the first CONNECT happens asynchronously on
    /// the driver task. Connection failures surface as log events and
    /// retries, publish failures surface on the publishing call.
    pub fn connect(config: MqttConfig) -> (Self, mpsc::Receiver<InboundMessage>) {
        let mut options = MqttOptions::new(config.client_id, config.host, config.port);
        options.set_keep_alive(config.keep_alive);
        if let Some(creds) = &config.credentials {
            options.set_credentials(creds.username.clone(), creds.password.expose_secret());
        }

        let (client, event_loop) = AsyncClient::new(options, config.capacity);
        let (inbound_tx, inbound_rx) = mpsc::channel(config.capacity);
        let cancel = CancellationToken::new();

        let task_cancel = cancel.clone();
        tokio::spawn(async move {
            drive(event_loop, inbound_tx, task_cancel).await;
        });

        (Self { client, cancel }, inbound_rx)
    }

    /// Signal the driver task to stop and disconnect.
    pub fn shutdown(&self) {
        self.cancel.cancel();
    }
}

impl Transport for MqttTransport {
    async fn publish(
        &self,
        topic: &str,
        payload: Vec<u8>,
        qos: QoS,
        retain: bool,
    ) -> Result<(), Error> {
        self.client
            .publish(topic, map_qos(qos), retain, payload)
            .await
            .map_err(|e| Error::Publish {
                topic: topic.to_owned(),
                reason: e.to_string(),
            })
    }

    async fn subscribe(&self, topic: &str, qos: QoS) -> Result<(), Error> {
        self.client
            .subscribe(topic, map_qos(qos))
            .await
            .map_err(|e| Error::Subscribe {
                topic: topic.to_owned(),
                reason: e.to_string(),
            })
    }

    async fn unsubscribe(&self, topic: &str) -> Result<(), Error> {
        self.client
            .unsubscribe(topic)
            .await
            .map_err(|e| Error::Unsubscribe {
                topic: topic.to_owned(),
                reason: e.to_string(),
            })
    }
}

fn map_qos(qos: QoS) -> rumqttc::QoS {
    match qos {
        QoS::AtMostOnce => rumqttc::QoS::AtMostOnce,
        QoS::AtLeastOnce => rumqttc::QoS::AtLeastOnce,
        QoS::ExactlyOnce => rumqttc::QoS::ExactlyOnce,
    }
}

// ── Event-loop driver ────────────────────────────────────────────────

/// Poll the rumqttc event loop until cancelled, forwarding publishes.
async fn drive(
    mut event_loop: rumqttc::EventLoop,
    inbound_tx: mpsc::Sender<InboundMessage>,
    cancel: CancellationToken,
) {
    loop {
        tokio::select! {
            biased;
            _ = cancel.cancelled() => {
                tracing::debug!("transport driver cancelled");
                break;
            }
            event = event_loop.poll() => match event {
                Ok(Event::Incoming(Packet::Publish(publish))) => {
                    let message = InboundMessage {
                        topic: publish.topic,
                        payload: publish.payload,
                    };
                    // The registry owns the receiving side; if it is gone
                    // there is nobody left to dispatch to.
                    if inbound_tx.send(message).await.is_err() {
                        tracing::debug!("inbound channel closed, stopping driver");
                        break;
                    }
                }
                Ok(Event::Incoming(Packet::ConnAck(_))) => {
                    tracing::info!("connected to relay broker");
                }
                Ok(Event::Incoming(Packet::Disconnect)) => {
                    tracing::warn!("broker sent disconnect");
                }
                Ok(_) => {}
                Err(e) => {
                    tracing::warn!(error = %e, "broker connection error, retrying");
                    tokio::select! {
                        biased;
                        _ = cancel.cancelled() => break,
                        _ = tokio::time::sleep(RECONNECT_PAUSE) => {}
                    }
                }
            }
        }
    }
}
