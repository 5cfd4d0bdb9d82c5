use crate::{Broker, DeadLetterEntry, Delivery, MessageId};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use common::model::config::RedisConfig;
use common::model::{Stage, StageMessage};
use errors::{BrokerError, Error, Result};
use log::{info, warn};
use redis::streams::{
    StreamAutoClaimReply, StreamId, StreamPendingCountReply, StreamRangeReply, StreamReadOptions,
    StreamReadReply,
};
use redis::AsyncCommands;
use std::time::Duration;

/// Idle time stamped onto a released lease so the next lease call reclaims it
/// immediately, whatever the visibility timeout is.
const RELEASED_IDLE_MS: u64 = 86_400_000;

/// Redis Streams broker backend. One stream and one consumer group per
/// stage; pending-entry idle time implements the visibility timeout, and the
/// per-entry delivery count is the message's `dequeue_count`.
pub struct RedisBroker {
    pool: deadpool_redis::Pool,
    namespace: String,
    group: String,
    consumer_name: String,
}

impl RedisBroker {
    /// Build the pool and create the consumer group for every stage stream.
    /// Groups start at `0` so messages enqueued before a worker process comes
    /// up are still delivered.
    pub async fn connect(config: &RedisConfig, namespace: &str) -> Result<Self> {
        let pool = create_pool(config).ok_or(BrokerError::ConnectionFailed)?;
        let broker = Self {
            pool,
            namespace: namespace.to_string(),
            group: format!("{namespace}:workers"),
            consumer_name: uuid::Uuid::new_v4().to_string(),
        };

        let mut conn = broker.conn().await?;
        for stage in Stage::ALL {
            let key = broker.queue_key(stage);
            match conn
                .xgroup_create_mkstream::<&str, &str, &str, ()>(&key, &broker.group, "0")
                .await
            {
                Ok(_) => info!("created consumer group {} for {key}", broker.group),
                Err(e) if e.code() == Some("BUSYGROUP") => {}
                Err(e) => return Err(BrokerError::GroupCreateFailed(Box::new(e)).into()),
            }
        }
        Ok(broker)
    }

    async fn conn(&self) -> Result<deadpool_redis::Connection> {
        self.pool
            .get()
            .await
            .map_err(|_| BrokerError::ConnectionFailed.into())
    }

    fn queue_key(&self, stage: Stage) -> String {
        format!("{}:q:{stage}", self.namespace)
    }

    fn dlq_key(&self, stage: Stage) -> String {
        format!("{}:dlq:{stage}", self.namespace)
    }

    /// Holder and delivery count for one pending entry, from the group's PEL.
    async fn pending_entry(
        &self,
        conn: &mut deadpool_redis::Connection,
        key: &str,
        id: &str,
    ) -> Result<Option<(String, u32)>> {
        let reply: StreamPendingCountReply = conn
            .xpending_count(key, &self.group, id, id, 1)
            .await
            .map_err(|e| Error::from(BrokerError::OperationFailed(Box::new(e))))?;
        Ok(reply
            .ids
            .first()
            .map(|p| (p.consumer.clone(), p.times_delivered as u32)))
    }

    /// Only the consumer holding the lease may extend or release it. After a
    /// visibility timeout the entry may have been reclaimed by another
    /// consumer; a claim from the old holder would steal the lease back.
    async fn verify_holder(
        &self,
        conn: &mut deadpool_redis::Connection,
        key: &str,
        id: &str,
    ) -> Result<()> {
        match self.pending_entry(conn, key, id).await? {
            Some((holder, _)) if holder == self.consumer_name => Ok(()),
            _ => Err(Error::message_gone(id)),
        }
    }

    /// An entry whose payload cannot be decoded can never be processed, and
    /// skipping it would leave it pending forever. Move it to the dead-letter
    /// stream as-is and consume the lease.
    async fn dead_letter_raw(
        &self,
        conn: &mut deadpool_redis::Connection,
        stage: Stage,
        id: &str,
        raw: &str,
        reason: &str,
    ) -> Result<()> {
        let key = self.queue_key(stage);
        let moved_at = Utc::now().to_rfc3339();
        let mut pipe = redis::pipe();
        pipe.atomic()
            .xadd(
                self.dlq_key(stage),
                "*",
                &[
                    ("message", raw),
                    ("reason", reason),
                    ("attempts", "0"),
                    ("moved_at", moved_at.as_str()),
                ],
            )
            .xack(&key, &self.group, &[id])
            .xdel(&key, &[id]);
        let _: (String, u64, u64) = pipe
            .query_async(conn)
            .await
            .map_err(|e| Error::from(BrokerError::DeadLetterFailed(Box::new(e))))?;
        Ok(())
    }

    fn parse_message(stream_id: &StreamId) -> Option<StageMessage> {
        let raw = stream_id.get::<String>("payload")?;
        serde_json::from_str(&raw).ok()
    }

    /// A quarantined raw payload is not valid `StageMessage` JSON; surface it
    /// anyway, with the raw text as the payload reference, so the entry stays
    /// visible to operators.
    fn decode_dead_letter(stage: Stage, entry: &StreamId) -> Option<DeadLetterEntry> {
        let raw = entry.get::<String>("message")?;
        let message = serde_json::from_str::<StageMessage>(&raw)
            .unwrap_or_else(|_| StageMessage::new(stage, &raw, ""));
        let moved_at = entry
            .get::<String>("moved_at")
            .and_then(|s| DateTime::parse_from_rfc3339(&s).ok())
            .map(|t| t.with_timezone(&Utc))
            .unwrap_or_else(Utc::now);
        Some(DeadLetterEntry {
            id: entry.id.clone(),
            message,
            failure_reason: entry.get::<String>("reason").unwrap_or_default(),
            attempts: entry
                .get::<String>("attempts")
                .and_then(|s| s.parse().ok())
                .unwrap_or(0),
            moved_at,
        })
    }
}

#[async_trait]
impl Broker for RedisBroker {
    async fn enqueue(
        &self,
        stage: Stage,
        payload_ref: &str,
        correlation_id: &str,
    ) -> Result<MessageId> {
        let message = StageMessage::new(stage, payload_ref, correlation_id);
        let payload = serde_json::to_string(&message)?;
        let mut conn = self.conn().await?;
        let id: String = conn
            .xadd(self.queue_key(stage), "*", &[("payload", payload.as_str())])
            .await
            .map_err(|e| Error::from(BrokerError::EnqueueFailed(Box::new(e))))?;
        Ok(id)
    }

    async fn lease(&self, stage: Stage, visibility_timeout: Duration) -> Result<Option<Delivery>> {
        let key = self.queue_key(stage);
        let mut conn = self.conn().await?;
        let min_idle_ms = visibility_timeout.as_millis() as u64;

        // Expired leases first: claim one pending entry whose idle time has
        // passed the visibility timeout.
        let claimed: StreamAutoClaimReply = redis::cmd("XAUTOCLAIM")
            .arg(&key)
            .arg(&self.group)
            .arg(&self.consumer_name)
            .arg(min_idle_ms)
            .arg("0-0")
            .arg("COUNT")
            .arg(1)
            .query_async(&mut conn)
            .await
            .map_err(|e| Error::from(BrokerError::LeaseFailed(Box::new(e))))?;

        if let Some(stream_id) = claimed.claimed.first() {
            let raw = stream_id.get::<String>("payload").unwrap_or_default();
            match serde_json::from_str::<StageMessage>(&raw) {
                Ok(mut message) => {
                    message.dequeue_count = self
                        .pending_entry(&mut conn, &key, &stream_id.id)
                        .await?
                        .map(|(_, n)| n)
                        .unwrap_or(message.dequeue_count + 1);
                    return Ok(Some(Delivery {
                        id: stream_id.id.clone(),
                        message,
                    }));
                }
                Err(e) => {
                    warn!(
                        "quarantining undecodable stream entry {}: {e}",
                        stream_id.id
                    );
                    self.dead_letter_raw(
                        &mut conn,
                        stage,
                        &stream_id.id,
                        &raw,
                        &format!("undecodable payload: {e}"),
                    )
                    .await?;
                }
            }
        }

        // No reclaimable entry, hand out a new message.
        let opts = StreamReadOptions::default()
            .group(&self.group, &self.consumer_name)
            .count(1);
        let reply: StreamReadReply = conn
            .xread_options(&[&key], &[">"], &opts)
            .await
            .map_err(|e| Error::from(BrokerError::LeaseFailed(Box::new(e))))?;

        for stream_key in reply.keys {
            for stream_id in stream_key.ids {
                let raw = stream_id.get::<String>("payload").unwrap_or_default();
                match serde_json::from_str::<StageMessage>(&raw) {
                    Ok(mut message) => {
                        message.dequeue_count = 1;
                        return Ok(Some(Delivery {
                            id: stream_id.id,
                            message,
                        }));
                    }
                    Err(e) => {
                        warn!(
                            "quarantining undecodable stream entry {}: {e}",
                            stream_id.id
                        );
                        self.dead_letter_raw(
                            &mut conn,
                            stage,
                            &stream_id.id,
                            &raw,
                            &format!("undecodable payload: {e}"),
                        )
                        .await?;
                    }
                }
            }
        }
        Ok(None)
    }

    async fn ack(&self, stage: Stage, id: &str) -> Result<()> {
        let key = self.queue_key(stage);
        let mut conn = self.conn().await?;
        let acked: u64 = conn
            .xack(&key, &self.group, &[id])
            .await
            .map_err(|e| Error::from(BrokerError::OperationFailed(Box::new(e))))?;
        if acked == 0 {
            return Err(Error::message_gone(id));
        }
        let _: u64 = conn
            .xdel(&key, &[id])
            .await
            .map_err(|e| Error::from(BrokerError::OperationFailed(Box::new(e))))?;
        Ok(())
    }

    async fn extend_lease(&self, stage: Stage, id: &str, _additional: Duration) -> Result<()> {
        // Stream leases are idle-time based: re-claiming to ourselves resets
        // the idle clock, which pushes redelivery out by a full visibility
        // timeout. The exact extension length is therefore the timeout, not
        // the requested amount.
        let key = self.queue_key(stage);
        let mut conn = self.conn().await?;
        self.verify_holder(&mut conn, &key, id).await?;
        let claimed: Vec<String> = redis::cmd("XCLAIM")
            .arg(&key)
            .arg(&self.group)
            .arg(&self.consumer_name)
            .arg(0)
            .arg(id)
            .arg("JUSTID")
            .query_async(&mut conn)
            .await
            .map_err(|e| Error::from(BrokerError::OperationFailed(Box::new(e))))?;
        if claimed.is_empty() {
            return Err(Error::message_gone(id));
        }
        Ok(())
    }

    async fn release(&self, stage: Stage, id: &str) -> Result<()> {
        // Stamp a large idle time onto the entry so the next lease call's
        // XAUTOCLAIM picks it up immediately.
        let key = self.queue_key(stage);
        let mut conn = self.conn().await?;
        self.verify_holder(&mut conn, &key, id).await?;
        let claimed: Vec<String> = redis::cmd("XCLAIM")
            .arg(&key)
            .arg(&self.group)
            .arg(&self.consumer_name)
            .arg(0)
            .arg(id)
            .arg("IDLE")
            .arg(RELEASED_IDLE_MS)
            .arg("JUSTID")
            .query_async(&mut conn)
            .await
            .map_err(|e| Error::from(BrokerError::OperationFailed(Box::new(e))))?;
        if claimed.is_empty() {
            return Err(Error::message_gone(id));
        }
        Ok(())
    }

    async fn depth(&self, stage: Stage) -> Result<u64> {
        let mut conn = self.conn().await?;
        let len: u64 = conn
            .xlen(self.queue_key(stage))
            .await
            .map_err(|e| Error::from(BrokerError::OperationFailed(Box::new(e))))?;
        Ok(len)
    }

    async fn dead_letter(&self, stage: Stage, id: &str, reason: &str) -> Result<()> {
        let key = self.queue_key(stage);
        let mut conn = self.conn().await?;

        let (_, attempts) = self
            .pending_entry(&mut conn, &key, id)
            .await?
            .ok_or_else(|| Error::message_gone(id))?;

        let reply: StreamRangeReply = conn
            .xrange(&key, id, id)
            .await
            .map_err(|e| Error::from(BrokerError::OperationFailed(Box::new(e))))?;
        let message = reply
            .ids
            .first()
            .and_then(Self::parse_message)
            .ok_or_else(|| Error::message_gone(id))?;
        let payload = serde_json::to_string(&message)?;
        let attempts_field = attempts.to_string();
        let moved_at = Utc::now().to_rfc3339();

        // Move and consume the lease in one round trip.
        let mut pipe = redis::pipe();
        pipe.atomic()
            .xadd(
                self.dlq_key(stage),
                "*",
                &[
                    ("message", payload.as_str()),
                    ("reason", reason),
                    ("attempts", attempts_field.as_str()),
                    ("moved_at", moved_at.as_str()),
                ],
            )
            .xack(&key, &self.group, &[id])
            .xdel(&key, &[id]);
        let _: (String, u64, u64) = pipe
            .query_async(&mut conn)
            .await
            .map_err(|e| Error::from(BrokerError::DeadLetterFailed(Box::new(e))))?;
        Ok(())
    }

    async fn dead_letters(&self, stage: Stage, limit: usize) -> Result<Vec<DeadLetterEntry>> {
        let mut conn = self.conn().await?;
        let reply: StreamRangeReply = conn
            .xrevrange_count(self.dlq_key(stage), "+", "-", limit)
            .await
            .map_err(|e| Error::from(BrokerError::OperationFailed(Box::new(e))))?;
        Ok(reply
            .ids
            .iter()
            .filter_map(|entry| Self::decode_dead_letter(stage, entry))
            .collect())
    }

    async fn redrive(&self, stage: Stage, dead_letter_id: &str) -> Result<MessageId> {
        let dlq = self.dlq_key(stage);
        let mut conn = self.conn().await?;
        let reply: StreamRangeReply = conn
            .xrange(&dlq, dead_letter_id, dead_letter_id)
            .await
            .map_err(|e| Error::from(BrokerError::OperationFailed(Box::new(e))))?;
        let raw = reply
            .ids
            .first()
            .and_then(|e| e.get::<String>("message"))
            .ok_or_else(|| Error::message_gone(dead_letter_id))?;
        let mut message: StageMessage = serde_json::from_str(&raw)?;
        message.dequeue_count = 0;
        message.enqueued_at = Utc::now();
        let payload = serde_json::to_string(&message)?;

        let id: String = conn
            .xadd(self.queue_key(stage), "*", &[("payload", payload.as_str())])
            .await
            .map_err(|e| Error::from(BrokerError::EnqueueFailed(Box::new(e))))?;
        let _: u64 = conn
            .xdel(&dlq, &[dead_letter_id])
            .await
            .map_err(|e| Error::from(BrokerError::OperationFailed(Box::new(e))))?;
        Ok(id)
    }
}

fn create_pool(config: &RedisConfig) -> Option<deadpool_redis::Pool> {
    let cfg = deadpool_redis::Config {
        connection: Some(deadpool_redis::ConnectionInfo {
            addr: deadpool_redis::ConnectionAddr::Tcp(config.redis_host.clone(), config.redis_port),
            redis: deadpool_redis::RedisConnectionInfo {
                db: config.redis_db as i64,
                username: config.redis_username.clone(),
                password: config.redis_password.clone(),
                protocol: deadpool_redis::ProtocolVersion::RESP3,
            },
        }),
        pool: Some(deadpool_redis::PoolConfig {
            max_size: config.pool_size.unwrap_or(16),
            ..Default::default()
        }),
        ..Default::default()
    };
    cfg.create_pool(Some(deadpool_redis::Runtime::Tokio1)).ok()
}
