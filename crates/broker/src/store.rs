//! Result store abstraction: a key-value store with expiry.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;

use conveyor_core::TaskError;

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum StoreError {
    #[error("store unavailable: {0}")]
    Unavailable(String),

    #[error("invalid store configuration: {0}")]
    Config(String),
}

impl From<StoreError> for TaskError {
    fn from(value: StoreError) -> Self {
        TaskError::store_unavailable(value.to_string())
    }
}

/// Key-value store holding task state and results.
///
/// Values are opaque strings (JSON in practice). A `ttl` of `None` keeps the
/// key until it is deleted.
#[async_trait]
pub trait ResultStore: Send + Sync {
    fn name(&self) -> &'static str;

    async fn set(&self, key: &str, value: String, ttl: Option<Duration>) -> Result<(), StoreError>;

    async fn get(&self, key: &str) -> Result<Option<String>, StoreError>;

    /// Returns whether the key existed.
    async fn delete(&self, key: &str) -> Result<bool, StoreError>;

    async fn ping(&self) -> Result<(), StoreError>;
}

#[async_trait]
impl<S> ResultStore for Arc<S>
where
    S: ResultStore + ?Sized,
{
    fn name(&self) -> &'static str {
        (**self).name()
    }

    async fn set(&self, key: &str, value: String, ttl: Option<Duration>) -> Result<(), StoreError> {
        (**self).set(key, value, ttl).await
    }

    async fn get(&self, key: &str) -> Result<Option<String>, StoreError> {
        (**self).get(key).await
    }

    async fn delete(&self, key: &str) -> Result<bool, StoreError> {
        (**self).delete(key).await
    }

    async fn ping(&self) -> Result<(), StoreError> {
        (**self).ping().await
    }
}
