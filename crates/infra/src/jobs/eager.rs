//! Eager broker: runs tasks inline at publish time.

use std::sync::Mutex;
use std::time::Duration;

use async_trait::async_trait;
use tracing::{debug, warn};

use conveyor_broker::{AckHandle, Broker, BrokerError, DeadLetter, Delivery};
use conveyor_core::{TaskError, TaskInvocation};

use super::executor::{Attempt, TaskExecutor};

/// Direct-call adapter selected by `TASK_ALWAYS_EAGER`.
///
/// `publish` executes the invocation to completion before returning, retrying
/// back-to-back without sleeping. Results are still written to the result
/// backend, so the status API behaves the same as with a real broker.
/// Nothing is ever queued: `consume` only waits and yields nothing.
#[derive(Debug)]
pub struct EagerBroker {
    executor: TaskExecutor,
    dead: Mutex<Vec<DeadLetter>>,
}

impl EagerBroker {
    pub fn new(executor: TaskExecutor) -> Self {
        Self {
            executor,
            dead: Mutex::new(Vec::new()),
        }
    }

    /// Payloads that could not be executed (undecodable or unknown task).
    pub fn dead_letters(&self) -> Vec<DeadLetter> {
        self.dead.lock().map(|d| d.clone()).unwrap_or_default()
    }

    fn park(&self, id: String, payload: Vec<u8>, reason: String) {
        if let Ok(mut dead) = self.dead.lock() {
            dead.push(DeadLetter { id, payload, reason });
        }
    }
}

#[async_trait]
impl Broker for EagerBroker {
    fn name(&self) -> &'static str {
        "eager"
    }

    async fn publish(&self, topic: &str, payload: Vec<u8>) -> Result<(), BrokerError> {
        let mut invocation = match TaskInvocation::from_bytes(&payload) {
            Ok(inv) => inv,
            Err(e) => {
                warn!(topic, error = %e, "undecodable payload");
                self.park(String::new(), payload, e.to_string());
                return Ok(());
            }
        };

        loop {
            let attempt = self
                .executor
                .attempt(&invocation)
                .await
                .map_err(|e| match e {
                    TaskError::StoreUnavailable(msg) => BrokerError::StoreUnavailable(msg),
                    other => BrokerError::Unavailable(other.to_string()),
                })?;

            match attempt {
                Attempt::Retry { next, .. } => {
                    debug!(task_id = %next.id, retries = next.retries, "eager retry");
                    invocation = next;
                }
                Attempt::UnknownTask => {
                    self.park(
                        invocation.id.to_string(),
                        payload,
                        format!("unknown task: {}", invocation.task),
                    );
                    return Ok(());
                }
                Attempt::Succeeded | Attempt::Failed | Attempt::Duplicate => return Ok(()),
            }
        }
    }

    async fn consume(&self, _topic: &str, wait: Duration) -> Result<Option<Delivery>, BrokerError> {
        tokio::time::sleep(wait).await;
        Ok(None)
    }

    async fn ack(&self, handle: &AckHandle) -> Result<(), BrokerError> {
        Err(BrokerError::UnknownDelivery(handle.id.clone()))
    }

    async fn requeue(
        &self,
        handle: &AckHandle,
        _payload: Vec<u8>,
        _delay: Duration,
    ) -> Result<(), BrokerError> {
        Err(BrokerError::UnknownDelivery(handle.id.clone()))
    }

    async fn dead_letter(&self, handle: &AckHandle, _reason: &str) -> Result<(), BrokerError> {
        Err(BrokerError::UnknownDelivery(handle.id.clone()))
    }

    async fn ping(&self) -> Result<(), BrokerError> {
        Ok(())
    }
}
