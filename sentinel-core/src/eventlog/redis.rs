use super::{Cursor, EventLog, LogEntry};
use crate::config::EventLogConfig;
use crate::error::{Result, SentinelError};
use crate::record::LogRecord;
use crate::types::LogId;
use ::redis::aio::ConnectionManager;
use ::redis::streams::StreamReadReply;
use async_trait::async_trait;
use std::collections::HashMap;
use std::future::Future;
use std::time::Duration;
use tracing::{debug, info};

/// Redis Streams backed event log.
///
/// A blocking `XREAD` occupies its connection, so every consumer should own
/// its own instance rather than share one with producers.
#[derive(Clone)]
pub struct RedisEventLog {
    conn: ConnectionManager,
    config: EventLogConfig,
}

impl RedisEventLog {
    pub async fn connect(redis_url: &str, config: EventLogConfig) -> Result<Self> {
        info!("Connecting event log '{}' to Redis", config.stream);
        let client = ::redis::Client::open(redis_url)?;
        let conn = ConnectionManager::new(client).await?;
        Ok(Self { conn, config })
    }

    pub fn stream(&self) -> &str {
        &self.config.stream
    }

    async fn bounded<T, F>(&self, limit: Duration, op: &str, fut: F) -> Result<T>
    where
        F: Future<Output = ::redis::RedisResult<T>>,
    {
        match tokio::time::timeout(limit, fut).await {
            Ok(result) => Ok(result?),
            Err(_) => Err(SentinelError::StoreUnavailable(format!(
                "{} on '{}' timed out after {:?}",
                op, self.config.stream, limit
            ))),
        }
    }
}

#[async_trait]
impl EventLog for RedisEventLog {
    async fn append(&self, record: &LogRecord) -> Result<LogId> {
        let mut conn = self.conn.clone();
        let mut cmd = ::redis::cmd("XADD");
        cmd.arg(&self.config.stream)
            .arg("MAXLEN")
            .arg("~")
            .arg(self.config.max_len)
            .arg("*");
        for (field, value) in record.to_fields() {
            cmd.arg(field).arg(value);
        }

        let id: String = self
            .bounded(self.config.op_timeout, "XADD", cmd.query_async(&mut conn))
            .await?;
        debug!("Appended {} as {}", record.signature, id);
        Ok(id)
    }

    async fn read_since(
        &self,
        cursor: &Cursor,
        max_count: usize,
        block_for: Duration,
    ) -> Result<Vec<LogEntry>> {
        let mut conn = self.conn.clone();
        let mut cmd = ::redis::cmd("XREAD");
        cmd.arg("COUNT").arg(max_count.max(1));
        // BLOCK 0 would wait forever.
        let block_ms = u64::try_from(block_for.as_millis()).unwrap_or(u64::MAX);
        if block_ms > 0 {
            cmd.arg("BLOCK").arg(block_ms);
        }
        cmd.arg("STREAMS")
            .arg(&self.config.stream)
            .arg(cursor.as_wire());

        let reply: Option<StreamReadReply> = self
            .bounded(
                block_for + self.config.op_timeout,
                "XREAD",
                cmd.query_async(&mut conn),
            )
            .await?;

        let mut entries = Vec::new();
        for key in reply.map(|r| r.keys).unwrap_or_default() {
            for stream_id in key.ids {
                let mut fields = HashMap::with_capacity(stream_id.map.len());
                for (name, value) in &stream_id.map {
                    match ::redis::from_redis_value::<String>(value) {
                        Ok(text) => {
                            fields.insert(name.clone(), text);
                        }
                        Err(e) => debug!("Entry {} field '{}' is not text: {}", stream_id.id, name, e),
                    }
                }
                entries.push(LogEntry {
                    id: stream_id.id,
                    fields,
                });
            }
        }
        Ok(entries)
    }
}
