//! In-memory transport double.
//!
//! Behaves like a broker confined to one connection: publishes are
//! recorded, echoed back to the inbound channel when this connection is
//! subscribed to the topic, and mirrored to a tap stream so a scripted
//! peer (a fake device) can react to them. Used by the core crate's unit
//! and integration tests; also handy for examples that should run without
//! a broker.

use std::collections::{HashMap, HashSet};
use std::sync::Mutex;
use std::time::Duration;

use bytes::Bytes;
use tokio::sync::{broadcast, mpsc};

use crate::error::Error;
use crate::transport::{InboundMessage, QoS, Transport};

const CHANNEL_CAPACITY: usize = 256;

/// One recorded publish, in call order.
#[derive(Debug, Clone)]
pub struct PublishRecord {
    pub topic: String,
    pub payload: Bytes,
    pub qos: QoS,
    pub retain: bool,
}

#[derive(Debug, Default)]
struct State {
    subscribed: HashSet<String>,
    published: Vec<PublishRecord>,
    subscribe_calls: HashMap<String, usize>,
    unsubscribe_calls: HashMap<String, usize>,
    /// Remaining publishes that succeed before injected failures begin.
    fail_after: Option<usize>,
    publish_delay: Option<Duration>,
}

/// See module docs. Clone-able; all clones share one state.
#[derive(Debug, Clone)]
pub struct LoopbackTransport {
    inbound_tx: mpsc::Sender<InboundMessage>,
    tap: broadcast::Sender<InboundMessage>,
    state: std::sync::Arc<Mutex<State>>,
}

impl LoopbackTransport {
    pub fn new() -> (Self, mpsc::Receiver<InboundMessage>) {
        let (inbound_tx, inbound_rx) = mpsc::channel(CHANNEL_CAPACITY);
        let (tap, _) = broadcast::channel(CHANNEL_CAPACITY);
        (
            Self {
                inbound_tx,
                tap,
                state: std::sync::Arc::new(Mutex::new(State::default())),
            },
            inbound_rx,
        )
    }

    /// Stream of everything published through this transport, regardless
    /// of subscriptions. A fake device listens here.
    pub fn tap(&self) -> broadcast::Receiver<InboundMessage> {
        self.tap.subscribe()
    }

    /// Deliver a message from "the other side" of the broker. Dropped
    /// silently when this connection is not subscribed to the topic,
    /// exactly like a real broker would.
    pub async fn inject(&self, topic: &str, payload: impl Into<Bytes>) {
        let subscribed = {
            let state = self.state.lock().unwrap_or_else(std::sync::PoisonError::into_inner);
            state.subscribed.contains(topic)
        };
        if subscribed {
            let _ = self
                .inbound_tx
                .send(InboundMessage {
                    topic: topic.to_owned(),
                    payload: payload.into(),
                })
                .await;
        }
    }

    pub fn published(&self) -> Vec<PublishRecord> {
        self.lock().published.clone()
    }

    pub fn is_subscribed(&self, topic: &str) -> bool {
        self.lock().subscribed.contains(topic)
    }

    pub fn subscribe_count(&self, topic: &str) -> usize {
        self.lock().subscribe_calls.get(topic).copied().unwrap_or(0)
    }

    pub fn unsubscribe_count(&self, topic: &str) -> usize {
        self.lock()
            .unsubscribe_calls
            .get(topic)
            .copied()
            .unwrap_or(0)
    }

    /// Let the next `n` publishes succeed, then fail every one after.
    pub fn fail_publishes_after(&self, n: usize) {
        self.lock().fail_after = Some(n);
    }

    /// Delay each publish, so tests with a paused clock can interleave
    /// cancellation deterministically.
    pub fn set_publish_delay(&self, delay: Duration) {
        self.lock().publish_delay = Some(delay);
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, State> {
        self.state
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner)
    }
}

impl Transport for LoopbackTransport {
    async fn publish(
        &self,
        topic: &str,
        payload: Vec<u8>,
        qos: QoS,
        retain: bool,
    ) -> Result<(), Error> {
        let delay = self.lock().publish_delay;
        if let Some(delay) = delay {
            tokio::time::sleep(delay).await;
        }

        let (echo, payload) = {
            let mut state = self.lock();
            if let Some(remaining) = state.fail_after {
                if remaining == 0 {
                    return Err(Error::Publish {
                        topic: topic.to_owned(),
                        reason: "injected failure".into(),
                    });
                }
                state.fail_after = Some(remaining - 1);
            }
            let payload = Bytes::from(payload);
            state.published.push(PublishRecord {
                topic: topic.to_owned(),
                payload: payload.clone(),
                qos,
                retain,
            });
            (state.subscribed.contains(topic), payload)
        };

        let message = InboundMessage {
            topic: topic.to_owned(),
            payload,
        };
        let _ = self.tap.send(message.clone());
        if echo {
            let _ = self.inbound_tx.send(message).await;
        }
        Ok(())
    }

    async fn subscribe(&self, topic: &str, _qos: QoS) -> Result<(), Error> {
        let mut state = self.lock();
        state.subscribed.insert(topic.to_owned());
        *state.subscribe_calls.entry(topic.to_owned()).or_default() += 1;
        Ok(())
    }

    async fn unsubscribe(&self, topic: &str) -> Result<(), Error> {
        let mut state = self.lock();
        state.subscribed.remove(topic);
        *state.unsubscribe_calls.entry(topic.to_owned()).or_default() += 1;
        Ok(())
    }
}
