//! Redis Streams transport for Relayflow.
//!
//! Each outbox row becomes one stream entry whose fields are the flat
//! [`StreamMessage`] map. Appends cap the stream with `XADD MAXLEN ~`, so
//! trimming is approximate and cheap.
//!
//! # Example
//!
//! ```no_run
//! use relayflow_redis::RedisStreamTransport;
//!
//! # async fn example() -> Result<(), Box<dyn std::error::Error>> {
//! let transport = RedisStreamTransport::new("redis://127.0.0.1:6379").await?;
//! # Ok(())
//! # }
//! ```

#![forbid(unsafe_code)]
#![warn(missing_docs)]

use futures::future::BoxFuture;
use redis::aio::ConnectionManager;
use redis::streams::{StreamMaxlen, StreamRangeReply};
use redis::{AsyncCommands, Client, RedisError, Value};
use relayflow_core::transport::{StreamMessage, StreamTransport, TransportError};
use std::collections::HashMap;

/// Stream transport over a shared Redis connection.
///
/// Clones share the same `ConnectionManager`, which reconnects on its own
/// after a dropped connection.
#[derive(Clone)]
pub struct RedisStreamTransport {
    conn_manager: ConnectionManager,
}

impl RedisStreamTransport {
    /// Connect to Redis.
    ///
    /// # Errors
    ///
    /// Returns [`TransportError::ConnectionFailed`] if the URL is invalid or the
    /// server cannot be reached.
    pub async fn new(redis_url: &str) -> Result<Self, TransportError> {
        let client = Client::open(redis_url).map_err(|e| {
            TransportError::ConnectionFailed(format!("Failed to create Redis client: {e}"))
        })?;

        let conn_manager = ConnectionManager::new(client).await.map_err(|e| {
            TransportError::ConnectionFailed(format!(
                "Failed to create Redis connection manager: {e}"
            ))
        })?;

        Ok(Self { conn_manager })
    }

    /// Transport over an existing connection manager.
    #[must_use]
    pub const fn from_manager(conn_manager: ConnectionManager) -> Self {
        Self { conn_manager }
    }
}

impl std::fmt::Debug for RedisStreamTransport {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RedisStreamTransport").finish_non_exhaustive()
    }
}

fn connection_or(error: &RedisError, fallback: impl FnOnce(String) -> TransportError) -> TransportError {
    if error.is_connection_dropped() || error.is_connection_refusal() || error.is_io_error() {
        TransportError::ConnectionFailed(error.to_string())
    } else {
        fallback(error.to_string())
    }
}

/// Decode the field map of one stream entry.
fn message_from_fields(fields: &HashMap<String, Value>) -> Result<StreamMessage, TransportError> {
    fields
        .iter()
        .map(|(key, value)| {
            redis::from_redis_value::<String>(value)
                .map(|value| (key.clone(), value))
                .map_err(|e| TransportError::ReadFailed(format!("Field {key}: {e}")))
        })
        .collect()
}

impl StreamTransport for RedisStreamTransport {
    fn append<'a>(
        &'a self,
        stream: &'a str,
        message: &'a StreamMessage,
        max_len: usize,
    ) -> BoxFuture<'a, Result<String, TransportError>> {
        Box::pin(async move {
            let mut conn = self.conn_manager.clone();
            let items: Vec<(&str, &str)> = message.iter().collect();

            let id: String = conn
                .xadd_maxlen(stream, StreamMaxlen::Approx(max_len), "*", items.as_slice())
                .await
                .map_err(|e| {
                    connection_or(&e, |reason| TransportError::PublishFailed {
                        stream: stream.to_string(),
                        reason,
                    })
                })?;

            tracing::trace!(stream, message_id = %id, "Stream entry added");
            Ok(id)
        })
    }

    fn read<'a>(
        &'a self,
        stream: &'a str,
        count: usize,
    ) -> BoxFuture<'a, Result<Vec<(String, StreamMessage)>, TransportError>> {
        Box::pin(async move {
            let mut conn = self.conn_manager.clone();
            let reply: StreamRangeReply = conn
                .xrange_count(stream, "-", "+", count)
                .await
                .map_err(|e| connection_or(&e, TransportError::ReadFailed))?;

            reply
                .ids
                .into_iter()
                .map(|entry| Ok((entry.id, message_from_fields(&entry.map)?)))
                .collect()
        })
    }

    fn delete<'a>(
        &'a self,
        stream: &'a str,
        id: &'a str,
    ) -> BoxFuture<'a, Result<(), TransportError>> {
        Box::pin(async move {
            let mut conn = self.conn_manager.clone();
            let _: i64 = conn
                .xdel(stream, &[id][..])
                .await
                .map_err(|e| connection_or(&e, TransportError::ReadFailed))?;
            Ok(())
        })
    }

    fn len<'a>(&'a self, stream: &'a str) -> BoxFuture<'a, Result<u64, TransportError>> {
        Box::pin(async move {
            let mut conn = self.conn_manager.clone();
            conn.xlen(stream)
                .await
                .map_err(|e| connection_or(&e, TransportError::ReadFailed))
        })
    }
}
