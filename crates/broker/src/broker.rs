//! Task broker abstraction.
//!
//! The broker is the **transport** for task invocations between the
//! submission side and the workers. It moves opaque payloads; serialization is
//! the caller's business.
//!
//! ## Delivery Guarantees
//!
//! - **At-least-once**: a consumed message stays in flight until it is
//!   acknowledged. If the consumer disappears, the message becomes deliverable
//!   again after the broker's visibility timeout.
//! - **Late acknowledgment**: consumers call [`Broker::ack`] only once the
//!   outcome of the attempt is recorded.
//! - **No ordering guarantees** across redeliveries and delayed retries.
//!
//! Consumers must therefore be idempotent: the same invocation may run more
//! than once, possibly concurrently.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;

use conveyor_core::TaskError;

/// Broker-side error.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum BrokerError {
    /// The broker could not be reached or rejected the command.
    #[error("broker unavailable: {0}")]
    Unavailable(String),

    /// The handle does not match an in-flight message (already acked, or the
    /// lease expired and another consumer owns it now).
    #[error("unknown delivery: {0}")]
    UnknownDelivery(String),

    /// The broker URL or options are invalid.
    #[error("invalid broker configuration: {0}")]
    Config(String),

    /// A broker that executes inline could not reach the result store.
    #[error("result store unavailable: {0}")]
    StoreUnavailable(String),
}

impl BrokerError {
    /// Whether the same call may succeed after a pause. A stale handle or a
    /// bad configuration never will.
    pub fn is_transient(&self) -> bool {
        matches!(self, Self::Unavailable(_) | Self::StoreUnavailable(_))
    }
}

impl From<BrokerError> for TaskError {
    fn from(value: BrokerError) -> Self {
        match value {
            BrokerError::StoreUnavailable(msg) => TaskError::store_unavailable(msg),
            other => TaskError::broker_unavailable(other.to_string()),
        }
    }
}

/// Identifies one in-flight delivery for ack/requeue/dead-letter.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct AckHandle {
    pub topic: String,
    pub id: String,
}

/// A message handed to a consumer.
#[derive(Debug, Clone)]
pub struct Delivery {
    pub payload: Vec<u8>,
    pub handle: AckHandle,
    /// True when this message was delivered before and never acknowledged.
    pub redelivered: bool,
}

/// Queue substrate used by the submission API and the workers.
///
/// Implementations must be safe for concurrent use from many tasks.
#[async_trait]
pub trait Broker: Send + Sync {
    /// Short backend name for logs (`memory`, `redis`, `eager`).
    fn name(&self) -> &'static str;

    /// Append a message to `topic`.
    async fn publish(&self, topic: &str, payload: Vec<u8>) -> Result<(), BrokerError>;

    /// Take the next available message, waiting up to `wait` for one.
    ///
    /// Repeated calls form the consumer's delivery stream.
    async fn consume(&self, topic: &str, wait: Duration) -> Result<Option<Delivery>, BrokerError>;

    /// Confirm a delivery; it will not be redelivered.
    async fn ack(&self, handle: &AckHandle) -> Result<(), BrokerError>;

    /// Replace an in-flight delivery with `payload`, deliverable after `delay`.
    ///
    /// The original message is released only once the replacement is
    /// scheduled, so a crash in between causes redelivery rather than loss.
    async fn requeue(
        &self,
        handle: &AckHandle,
        payload: Vec<u8>,
        delay: Duration,
    ) -> Result<(), BrokerError>;

    /// Move an in-flight delivery to the topic's dead-letter queue.
    async fn dead_letter(&self, handle: &AckHandle, reason: &str) -> Result<(), BrokerError>;

    /// Connectivity check.
    async fn ping(&self) -> Result<(), BrokerError>;
}

#[async_trait]
impl<B> Broker for Arc<B>
where
    B: Broker + ?Sized,
{
    fn name(&self) -> &'static str {
        (**self).name()
    }

    async fn publish(&self, topic: &str, payload: Vec<u8>) -> Result<(), BrokerError> {
        (**self).publish(topic, payload).await
    }

    async fn consume(&self, topic: &str, wait: Duration) -> Result<Option<Delivery>, BrokerError> {
        (**self).consume(topic, wait).await
    }

    async fn ack(&self, handle: &AckHandle) -> Result<(), BrokerError> {
        (**self).ack(handle).await
    }

    async fn requeue(
        &self,
        handle: &AckHandle,
        payload: Vec<u8>,
        delay: Duration,
    ) -> Result<(), BrokerError> {
        (**self).requeue(handle, payload, delay).await
    }

    async fn dead_letter(&self, handle: &AckHandle, reason: &str) -> Result<(), BrokerError> {
        (**self).dead_letter(handle, reason).await
    }

    async fn ping(&self) -> Result<(), BrokerError> {
        (**self).ping().await
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn only_outages_are_transient() {
        assert!(BrokerError::Unavailable("refused".into()).is_transient());
        assert!(BrokerError::StoreUnavailable("refused".into()).is_transient());
        assert!(!BrokerError::UnknownDelivery("1-0".into()).is_transient());
        assert!(!BrokerError::Config("bad url".into()).is_transient());
    }

    #[test]
    fn store_outage_keeps_its_kind_as_task_error() {
        let err: TaskError = BrokerError::StoreUnavailable("refused".into()).into();
        assert!(matches!(err, TaskError::StoreUnavailable(_)));

        let err: TaskError = BrokerError::Unavailable("refused".into()).into();
        assert!(matches!(err, TaskError::BrokerUnavailable(_)));
    }
}
