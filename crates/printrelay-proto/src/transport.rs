// ── Transport adapter contract ──
//
// The broker client is injected into every component behind this trait,
// which is what lets the core crate run its full protocol against an
// in-memory loopback in tests. Inbound traffic is a single mpsc stream:
// the listener registry is the one consumer and fans out per topic.

use std::future::Future;

use bytes::Bytes;

use crate::error::Error;

/// Delivery guarantee requested per publish/subscribe.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum QoS {
    /// Fire and forget. Used where staleness is worse than loss (jog moves).
    AtMostOnce,
    /// Delivered at least once. Used for durable control intents and
    /// every upload message.
    AtLeastOnce,
    /// Exactly once. Not used by this protocol, kept for completeness.
    ExactlyOnce,
}

/// One message received from the broker.
///
/// `payload` is the raw bytes as published; parsing happens at the
/// consumer so one malformed message cannot poison the dispatch path.
#[derive(Debug, Clone)]
pub struct InboundMessage {
    pub topic: String,
    pub payload: Bytes,
}

/// Broker operations the protocol layer needs.
///
/// Ordering contract: messages published on one topic through one
/// transport arrive at a given subscriber in publish order. Nothing is
/// guaranteed across topics or across publishers — the protocol above is
/// designed around that.
pub trait Transport: Send + Sync + 'static {
    /// Publish a payload. Resolves once the client has accepted the
    /// message for delivery at the requested QoS.
    fn publish(
        &self,
        topic: &str,
        payload: Vec<u8>,
        qos: QoS,
        retain: bool,
    ) -> impl Future<Output = Result<(), Error>> + Send;

    /// Subscribe this connection to a topic.
    fn subscribe(&self, topic: &str, qos: QoS) -> impl Future<Output = Result<(), Error>> + Send;

    /// Remove this connection's subscription to a topic.
    fn unsubscribe(&self, topic: &str) -> impl Future<Output = Result<(), Error>> + Send;
}
