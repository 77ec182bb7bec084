//! Redis adapters: Streams-backed broker and key-value result store.
//!
//! Both share one lazily established [`ConnectionManager`], which multiplexes
//! commands over a single connection and reconnects after failures.

mod result_store;
mod streams_broker;

pub use result_store::RedisResultStore;
pub use streams_broker::RedisStreamsBroker;

use redis::aio::ConnectionManager;
use tokio::sync::OnceCell;

/// Reconnect attempts per connection setup (200ms, then 400ms).
const CONNECT_RETRIES: usize = 2;

/// Client plus a connection opened on first use.
pub(crate) struct LazyConnection {
    client: redis::Client,
    conn: OnceCell<ConnectionManager>,
}

impl LazyConnection {
    pub(crate) fn open(url: &str) -> redis::RedisResult<Self> {
        Ok(Self {
            client: redis::Client::open(url)?,
            conn: OnceCell::new(),
        })
    }

    pub(crate) async fn get(&self) -> redis::RedisResult<ConnectionManager> {
        let conn = self
            .conn
            .get_or_try_init(|| {
                ConnectionManager::new_with_backoff(self.client.clone(), 2, 100, CONNECT_RETRIES)
            })
            .await?;
        Ok(conn.clone())
    }
}

impl std::fmt::Debug for LazyConnection {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("LazyConnection")
            .field("addr", &self.client.get_connection_info().addr)
            .field("connected", &self.conn.initialized())
            .finish()
    }
}
