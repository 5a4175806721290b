//! Redis-backed queue transport with reliable delivery.
//!
//! # Queue Structure
//!
//! Each logical queue uses three Redis lists:
//!
//! - `{queue}`: main list, published with LPUSH and consumed from the right
//! - `{queue}:processing`: deliveries handed out but not yet settled
//! - `{queue}:dead_letter`: deliveries rejected without requeue
//!
//! # Reliability
//!
//! BRPOPLPUSH moves a body into the processing list atomically as it is
//! delivered, so a consumer that crashes mid-job leaves its delivery behind
//! for `recover_unacked` instead of losing it. Requeue and dead-lettering
//! are MULTI/EXEC transactions.

use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use redis::aio::ConnectionManager;
use redis::AsyncCommands;
use tracing::{debug, info};

use super::transport::{Delivery, QueueError, QueueStats, QueueTransport};

/// Default Redis port used when the broker address has none.
pub const DEFAULT_REDIS_PORT: u16 = 6379;

/// Builds a Redis connection URL from a broker host or URL.
///
/// Bare hosts get the default port; IPv6 literals are bracketed.
pub fn broker_url(address: &str) -> String {
    if address.starts_with("redis://") || address.starts_with("rediss://") {
        return address.to_string();
    }
    if address.starts_with('[') {
        return if address.ends_with(']') {
            format!("redis://{}:{}", address, DEFAULT_REDIS_PORT)
        } else {
            format!("redis://{}", address)
        };
    }
    match address.matches(':').count() {
        0 => format!("redis://{}:{}", address, DEFAULT_REDIS_PORT),
        1 => format!("redis://{}", address),
        // Bare IPv6 literal
        _ => format!("redis://[{}]:{}", address, DEFAULT_REDIS_PORT),
    }
}

fn processing_key(queue: &str) -> String {
    format!("{}:processing", queue)
}

fn dead_letter_key(queue: &str) -> String {
    format!("{}:dead_letter", queue)
}

/// Redis-based queue transport.
pub struct RedisQueue {
    /// Redis connection manager (handles reconnection automatically).
    redis: ConnectionManager,
    /// Source of delivery tags for this connection.
    next_tag: AtomicU64,
}

impl RedisQueue {
    /// Connects to the broker.
    ///
    /// # Arguments
    ///
    /// * `address` - Broker host (`localhost`, `10.0.0.5:6380`) or full Redis URL
    ///
    /// # Errors
    ///
    /// Returns `QueueError::ConnectionFailed` if the connection fails.
    pub async fn connect(address: &str) -> Result<Self, QueueError> {
        let url = broker_url(address);
        let client =
            redis::Client::open(url.as_str()).map_err(|e| QueueError::ConnectionFailed(e.to_string()))?;

        let redis = ConnectionManager::new(client)
            .await
            .map_err(|e| QueueError::ConnectionFailed(e.to_string()))?;

        info!(url = %url, "Connected to queue broker");

        Ok(Self::from_connection(redis))
    }

    /// Creates a transport from an existing ConnectionManager.
    pub fn from_connection(redis: ConnectionManager) -> Self {
        Self {
            redis,
            next_tag: AtomicU64::new(1),
        }
    }

    /// Moves every unsettled delivery of `queue` back to the main list.
    ///
    /// Call this before consumers start to recover work from consumers that
    /// crashed. Returns the number of recovered messages.
    pub async fn recover_unacked(&self, queue: &str) -> Result<usize, QueueError> {
        let mut conn = self.redis.clone();
        let processing = processing_key(queue);
        let bodies: Vec<Vec<u8>> = conn.lrange(&processing, 0, -1).await?;

        let mut recovered = 0;
        for body in bodies {
            let mut pipe = redis::pipe();
            pipe.atomic()
                .lrem(&processing, 1, &body)
                .rpush(queue, &body);
            pipe.query_async::<_, ()>(&mut conn).await?;
            recovered += 1;
        }

        if recovered > 0 {
            info!(queue = %queue, recovered, "Recovered unacknowledged deliveries");
        }
        Ok(recovered)
    }

    /// Returns queue statistics.
    pub async fn stats(&self, queue: &str) -> Result<QueueStats, QueueError> {
        let mut pending_conn = self.redis.clone();
        let mut processing_conn = self.redis.clone();
        let mut dead_conn = self.redis.clone();
        let processing = processing_key(queue);
        let dead_letter = dead_letter_key(queue);

        let (pending, in_flight, dead): (usize, usize, usize) = tokio::try_join!(
            pending_conn.llen::<_, usize>(queue),
            processing_conn.llen::<_, usize>(&processing),
            dead_conn.llen::<_, usize>(&dead_letter),
        )?;

        Ok(QueueStats {
            queue_name: queue.to_string(),
            pending,
            in_flight,
            dead_letter: dead,
        })
    }

    /// Deletes the main, processing and dead-letter lists of `queue`.
    ///
    /// **Warning**: This permanently deletes all messages.
    pub async fn purge(&self, queue: &str) -> Result<(), QueueError> {
        let mut conn = self.redis.clone();
        let mut pipe = redis::pipe();
        pipe.del(queue)
            .del(processing_key(queue))
            .del(dead_letter_key(queue));
        pipe.query_async::<_, ()>(&mut conn).await?;
        Ok(())
    }
}

#[async_trait]
impl QueueTransport for RedisQueue {
    async fn publish(&self, queue: &str, body: &[u8]) -> Result<(), QueueError> {
        let mut conn = self.redis.clone();
        conn.lpush::<_, _, ()>(queue, body)
            .await
            .map_err(|e| QueueError::PublishFailed {
                queue: queue.to_string(),
                reason: e.to_string(),
            })
    }

    async fn receive(&self, queue: &str, wait: Duration) -> Result<Option<Delivery>, QueueError> {
        let mut conn = self.redis.clone();
        let timeout_secs = wait.as_secs().max(1) as usize;

        let body: Option<Vec<u8>> = redis::cmd("BRPOPLPUSH")
            .arg(queue)
            .arg(processing_key(queue))
            .arg(timeout_secs)
            .query_async(&mut conn)
            .await?;

        Ok(body.map(|body| {
            let tag = self.next_tag.fetch_add(1, Ordering::SeqCst);
            debug!(queue = %queue, tag, bytes = body.len(), "Received delivery");
            // Redis lists carry no delivery history
            Delivery::new(tag, queue, body, false)
        }))
    }

    async fn ack(&self, delivery: &Delivery) -> Result<(), QueueError> {
        if !delivery.claim_settle() {
            return Ok(());
        }
        let mut conn = self.redis.clone();
        conn.lrem::<_, _, ()>(processing_key(delivery.queue()), 1, delivery.body())
            .await?;
        Ok(())
    }

    async fn nack(&self, delivery: &Delivery, requeue: bool) -> Result<(), QueueError> {
        if !delivery.claim_settle() {
            return Ok(());
        }
        let mut conn = self.redis.clone();
        let queue = delivery.queue();

        let mut pipe = redis::pipe();
        pipe.atomic()
            .lrem(processing_key(queue), 1, delivery.body());
        if requeue {
            // Right end is the next to be popped, so the retry goes first
            pipe.rpush(queue, delivery.body());
        } else {
            pipe.lpush(dead_letter_key(queue), delivery.body());
        }
        pipe.query_async::<_, ()>(&mut conn).await?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_broker_url_from_host() {
        assert_eq!(broker_url("localhost"), "redis://localhost:6379");
        assert_eq!(broker_url("10.0.0.5:6380"), "redis://10.0.0.5:6380");
        assert_eq!(broker_url("redis://custom:7000"), "redis://custom:7000");
    }

    #[test]
    fn test_broker_url_ipv6() {
        assert_eq!(broker_url("2600:1f16::1"), "redis://[2600:1f16::1]:6379");
        assert_eq!(broker_url("[2600:1f16::1]"), "redis://[2600:1f16::1]:6379");
        assert_eq!(broker_url("[::1]:6380"), "redis://[::1]:6380");
    }

    #[test]
    fn test_list_keys() {
        assert_eq!(processing_key("inqueue"), "inqueue:processing");
        assert_eq!(dead_letter_key("inqueue"), "inqueue:dead_letter");
    }
}
