// ── Listener registry ──
//
// Reference-counts topic subscriptions so N logical listeners share one
// broker subscription: the transport subscribe fires only on the 0→1
// transition, the unsubscribe only on N→0. One dispatch task owns the
// inbound stream and the topic map, so there is no lock to order against;
// listener sets are snapshotted before fan-out, which makes reentrant
// subscribe/unsubscribe from inside a listener safe.

use std::collections::HashMap;
use std::sync::Arc;

use tokio::sync::{mpsc, oneshot};
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use printrelay_proto::{InboundMessage, QoS, Transport};

use crate::error::CoreError;

enum RegistryOp {
    Subscribe {
        topic: String,
        qos: QoS,
        reply: oneshot::Sender<Result<Subscription, CoreError>>,
    },
    Release {
        topic: String,
        id: u64,
    },
}

/// Shared subscription hub for one transport connection.
#[derive(Clone)]
pub struct ListenerRegistry {
    ops_tx: mpsc::UnboundedSender<RegistryOp>,
    cancel: CancellationToken,
}

impl ListenerRegistry {
    /// Spawn the dispatch task over the transport's inbound stream.
    pub fn new<T: Transport>(
        transport: Arc<T>,
        inbound: mpsc::Receiver<InboundMessage>,
        subscriber_capacity: usize,
    ) -> Self {
        let (ops_tx, ops_rx) = mpsc::unbounded_channel();
        let cancel = CancellationToken::new();

        let dispatcher = Dispatcher {
            transport,
            topics: HashMap::new(),
            next_id: 0,
            subscriber_capacity,
            ops_tx: ops_tx.clone(),
        };
        let task_cancel = cancel.clone();
        tokio::spawn(async move {
            dispatcher.run(inbound, ops_rx, task_cancel).await;
        });

        Self { ops_tx, cancel }
    }

    /// Register a listener on a topic.
    ///
    /// Idempotent at the broker level: the topic string is deterministic
    /// for given inputs, and only the first listener triggers a real
    /// subscribe.
    pub async fn subscribe(
        &self,
        topic: impl Into<String>,
        qos: QoS,
    ) -> Result<Subscription, CoreError> {
        let (reply_tx, reply_rx) = oneshot::channel();
        self.ops_tx
            .send(RegistryOp::Subscribe {
                topic: topic.into(),
                qos,
                reply: reply_tx,
            })
            .map_err(|_| CoreError::Closed)?;
        reply_rx.await.map_err(|_| CoreError::Closed)?
    }

    /// Stop the dispatch task. Outstanding `Subscription`s keep their
    /// buffered messages but receive nothing further.
    pub fn shutdown(&self) {
        self.cancel.cancel();
    }
}

/// One logical listener on one topic.
///
/// Dropping it releases the slot; the broker unsubscribe happens when the
/// last listener for the topic goes away, on any exit path.
#[derive(Debug)]
pub struct Subscription {
    topic: String,
    id: u64,
    rx: mpsc::Receiver<Arc<InboundMessage>>,
    ops_tx: mpsc::UnboundedSender<RegistryOp>,
}

impl Subscription {
    pub fn topic(&self) -> &str {
        &self.topic
    }

    /// Next message on this topic. `None` once the registry shuts down.
    pub async fn recv(&mut self) -> Option<Arc<InboundMessage>> {
        self.rx.recv().await
    }

    /// Poll-based receive, for `Stream` adapters built on top.
    pub fn poll_recv(
        &mut self,
        cx: &mut std::task::Context<'_>,
    ) -> std::task::Poll<Option<Arc<InboundMessage>>> {
        self.rx.poll_recv(cx)
    }
}

impl Drop for Subscription {
    fn drop(&mut self) {
        // Registry already gone is fine; nothing left to release.
        let _ = self.ops_tx.send(RegistryOp::Release {
            topic: self.topic.clone(),
            id: self.id,
        });
    }
}

// ── Dispatch task ────────────────────────────────────────────────────

struct TopicEntry {
    listeners: Vec<(u64, mpsc::Sender<Arc<InboundMessage>>)>,
}

struct Dispatcher<T: Transport> {
    transport: Arc<T>,
    topics: HashMap<String, TopicEntry>,
    next_id: u64,
    subscriber_capacity: usize,
    ops_tx: mpsc::UnboundedSender<RegistryOp>,
}

impl<T: Transport> Dispatcher<T> {
    async fn run(
        mut self,
        mut inbound: mpsc::Receiver<InboundMessage>,
        mut ops_rx: mpsc::UnboundedReceiver<RegistryOp>,
        cancel: CancellationToken,
    ) {
        loop {
            tokio::select! {
                biased;
                _ = cancel.cancelled() => break,
                op = ops_rx.recv() => {
                    let Some(op) = op else { break };
                    self.handle_op(op).await;
                }
                message = inbound.recv() => {
                    let Some(message) = message else {
                        debug!("transport inbound stream ended, stopping dispatch");
                        break;
                    };
                    self.dispatch(message).await;
                }
            }
        }
    }

    async fn handle_op(&mut self, op: RegistryOp) {
        match op {
            RegistryOp::Subscribe { topic, qos, reply } => {
                let result = self.add_listener(topic, qos).await;
                // A dropped reply means the caller went away; its
                // Subscription drop already queued a Release.
                let _ = reply.send(result);
            }
            RegistryOp::Release { topic, id } => self.remove_listener(&topic, id).await,
        }
    }

    async fn add_listener(&mut self, topic: String, qos: QoS) -> Result<Subscription, CoreError> {
        if !self.topics.contains_key(&topic) {
            // 0→1 transition: this is the only place a broker subscribe
            // is issued for the topic.
            self.transport.subscribe(&topic, qos).await?;
            debug!(topic = %topic, "subscribed to broker topic");
            self.topics
                .insert(topic.clone(), TopicEntry { listeners: Vec::new() });
        }

        let id = self.next_id;
        self.next_id += 1;
        let (tx, rx) = mpsc::channel(self.subscriber_capacity);
        if let Some(entry) = self.topics.get_mut(&topic) {
            entry.listeners.push((id, tx));
        }

        Ok(Subscription {
            topic,
            id,
            rx,
            ops_tx: self.ops_tx.clone(),
        })
    }

    async fn remove_listener(&mut self, topic: &str, id: u64) {
        let emptied = match self.topics.get_mut(topic) {
            Some(entry) => {
                entry.listeners.retain(|(listener_id, _)| *listener_id != id);
                entry.listeners.is_empty()
            }
            None => false,
        };

        if emptied {
            // N→0 transition: drop the broker subscription.
            self.topics.remove(topic);
            if let Err(e) = self.transport.unsubscribe(topic).await {
                warn!(topic = %topic, error = %e, "broker unsubscribe failed");
            } else {
                debug!(topic = %topic, "unsubscribed from broker topic");
            }
        }
    }

    async fn dispatch(&mut self, message: InboundMessage) {
        let Some(entry) = self.topics.get(&message.topic) else {
            // Raced with an unsubscribe; the broker may still flush a few.
            return;
        };

        // Snapshot before fan-out: a listener may subscribe/unsubscribe
        // reentrantly while we iterate.
        let listeners = entry.listeners.clone();
        let message = Arc::new(message);

        let mut dead = Vec::new();
        for (id, tx) in &listeners {
            match tx.try_send(Arc::clone(&message)) {
                Ok(()) => {}
                Err(mpsc::error::TrySendError::Full(_)) => {
                    warn!(topic = %message.topic, listener = id, "slow listener, dropping message");
                }
                Err(mpsc::error::TrySendError::Closed(_)) => dead.push(*id),
            }
        }

        for id in dead {
            self.remove_listener(&message.topic, id).await;
        }
    }
}

// ── Tests ────────────────────────────────────────────────────────────
