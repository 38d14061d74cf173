use crate::{
    db::{sql_int, DatabaseBackend, EventRecord, LogEvent, LogEventQuery, LogEventRow, TransactionSummary},
    error::{Result, SentinelError},
    types::{CanonicalEvent, TransactionRow},
};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sqlx::sqlite::{SqliteConnectOptions, SqlitePoolOptions, SqliteRow};
use sqlx::Row;
use std::str::FromStr;

const MIGRATIONS: &[&str] = &[
    r#"
    CREATE TABLE IF NOT EXISTS tx_events (
        signature TEXT PRIMARY KEY,
        slot INTEGER NOT NULL,
        err TEXT NULL,
        logs TEXT NULL,
        created_at TEXT NOT NULL DEFAULT (strftime('%Y-%m-%dT%H:%M:%fZ', 'now'))
    )
    "#,
    "CREATE INDEX IF NOT EXISTS idx_tx_events_slot ON tx_events(slot DESC)",
    r#"
    CREATE TABLE IF NOT EXISTS transactions (
        signature TEXT PRIMARY KEY,
        slot INTEGER NOT NULL,
        block_time TEXT NULL,
        fee INTEGER NOT NULL,
        err TEXT NULL,
        raw TEXT NOT NULL,
        created_at TEXT NOT NULL DEFAULT (strftime('%Y-%m-%dT%H:%M:%fZ', 'now'))
    )
    "#,
    "CREATE INDEX IF NOT EXISTS idx_transactions_slot ON transactions(slot DESC)",
    r#"
    CREATE TABLE IF NOT EXISTS events (
        id TEXT PRIMARY KEY,
        kind TEXT NOT NULL,
        signature TEXT NOT NULL,
        event_index INTEGER NOT NULL,
        slot INTEGER NOT NULL,
        account TEXT NULL,
        program TEXT NULL,
        amount TEXT NULL,
        mint TEXT NULL,
        raw TEXT NOT NULL,
        occurred_at TEXT NOT NULL
    )
    "#,
    "CREATE INDEX IF NOT EXISTS idx_events_signature ON events(signature)",
    "CREATE INDEX IF NOT EXISTS idx_events_kind ON events(kind)",
    "CREATE INDEX IF NOT EXISTS idx_events_slot ON events(slot)",
];

/// SQLite database backend
#[derive(Clone)]
pub struct SqliteBackend {
    pool: sqlx::sqlite::SqlitePool,
}

impl SqliteBackend {
    pub async fn new(database_url: &str) -> Result<Self> {
        let pool = if database_url.contains(":memory:") {
            // Every in-memory connection is its own database.
            let options = SqliteConnectOptions::from_str(database_url)?;
            SqlitePoolOptions::new()
                .max_connections(1)
                .idle_timeout(None)
                .max_lifetime(None)
                .connect_with(options)
                .await?
        } else {
            let db_path = database_url
                .trim_start_matches("sqlite://")
                .trim_start_matches("sqlite:");
            tracing::info!("Database path: {}", db_path);

            if let Some(parent) = std::path::Path::new(db_path).parent() {
                let parent_str = parent.display().to_string();
                if !parent_str.is_empty() {
                    tracing::info!("Creating database directory: {}", parent_str);
                    std::fs::create_dir_all(parent)?;
                }
            }

            let options = SqliteConnectOptions::new()
                .filename(db_path)
                .create_if_missing(true);
            sqlx::sqlite::SqlitePool::connect_with(options).await?
        };

        let db = Self { pool };
        db.run_migrations().await?;

        Ok(db)
    }

    fn parse_timestamp(ts_str: &str) -> Result<DateTime<Utc>> {
        DateTime::parse_from_rfc3339(ts_str)
            .map(|dt| dt.with_timezone(&Utc))
            .map_err(|e| SentinelError::Database(format!("Invalid timestamp '{}': {}", ts_str, e)))
    }

    fn parse_json(text: Option<String>) -> Result<Option<serde_json::Value>> {
        match text {
            Some(text) => Ok(Some(serde_json::from_str(&text)?)),
            None => Ok(None),
        }
    }

    fn row_to_log_event(row: SqliteRow) -> Result<LogEvent> {
        Ok(LogEvent {
            signature: row.get("signature"),
            slot: row.get("slot"),
            err: Self::parse_json(row.get("err"))?,
            logs: row.get("logs"),
            created_at: Self::parse_timestamp(row.get::<String, _>("created_at").as_str())?,
        })
    }
}

#[async_trait]
impl DatabaseBackend for SqliteBackend {
    async fn run_migrations(&self) -> Result<()> {
        for statement in MIGRATIONS {
            sqlx::query(statement).execute(&self.pool).await?;
        }

        tracing::info!("SQLite migrations completed");
        Ok(())
    }

    async fn health(&self) -> Result<()> {
        sqlx::query("SELECT 1").execute(&self.pool).await?;
        Ok(())
    }

    async fn upsert_log_event(&self, row: &LogEventRow) -> Result<()> {
        let err = row.err.as_ref().map(|v| v.to_string());

        sqlx::query(
            r#"
            INSERT INTO tx_events (signature, slot, err, logs)
            VALUES (?1, ?2, ?3, ?4)
            ON CONFLICT(signature) DO UPDATE SET
                slot = excluded.slot,
                err = excluded.err,
                logs = excluded.logs
        "#,
        )
        .bind(&row.signature)
        .bind(sql_int(row.slot, "slot")?)
        .bind(err)
        .bind(&row.logs)
        .execute(&self.pool)
        .await?;

        Ok(())
    }

    async fn get_log_event(&self, signature: &str) -> Result<Option<LogEvent>> {
        let row = sqlx::query(
            "SELECT signature, slot, err, logs, created_at FROM tx_events WHERE signature = ?1",
        )
        .bind(signature)
        .fetch_optional(&self.pool)
        .await?;

        row.map(Self::row_to_log_event).transpose()
    }

    async fn latest_log_events(&self, query: &LogEventQuery) -> Result<Vec<LogEvent>> {
        // ASCII LIKE is case-insensitive in SQLite.
        let rows = sqlx::query(
            r#"
            SELECT signature, slot, err, logs, created_at FROM tx_events
            WHERE (?1 IS NULL OR logs LIKE ?1 ESCAPE '\')
              AND (?2 IS NULL OR slot >= ?2)
              AND (?3 IS NULL OR slot <= ?3)
            ORDER BY slot DESC
            LIMIT ?4
        "#,
        )
        .bind(query.like_pattern())
        .bind(query.since_slot.map(|s| sql_int(s, "since_slot")).transpose()?)
        .bind(query.until_slot.map(|s| sql_int(s, "until_slot")).transpose()?)
        .bind(query.effective_limit())
        .fetch_all(&self.pool)
        .await?;

        rows.into_iter().map(Self::row_to_log_event).collect()
    }

    async fn upsert_transaction(&self, tx: &TransactionRow) -> Result<()> {
        sqlx::query(
            r#"
            INSERT INTO transactions (signature, slot, block_time, fee, err, raw)
            VALUES (?1, ?2, ?3, ?4, ?5, ?6)
            ON CONFLICT(signature) DO UPDATE SET
                slot = excluded.slot,
                block_time = excluded.block_time,
                fee = excluded.fee,
                err = excluded.err,
                raw = excluded.raw
        "#,
        )
        .bind(&tx.signature)
        .bind(sql_int(tx.slot, "slot")?)
        .bind(tx.block_time.map(|t| t.to_rfc3339()))
        .bind(sql_int(tx.fee, "fee")?)
        .bind(tx.err.as_ref().map(|v| v.to_string()))
        .bind(serde_json::to_string(&tx.raw)?)
        .execute(&self.pool)
        .await?;

        Ok(())
    }

    async fn replace_events_for_signature(
        &self,
        signature: &str,
        events: &[CanonicalEvent],
    ) -> Result<usize> {
        let mut tx = self.pool.begin().await?;

        sqlx::query("DELETE FROM events WHERE signature = ?1")
            .bind(signature)
            .execute(&mut *tx)
            .await?;

        for event in events {
            sqlx::query(
                r#"
                INSERT INTO events (id, kind, signature, event_index, slot, account, program, amount, mint, raw, occurred_at)
                VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11)
            "#,
            )
            .bind(event.id())
            .bind(event.kind.as_str())
            .bind(signature)
            .bind(sql_int(event.index, "index")?)
            .bind(sql_int(event.slot, "slot")?)
            .bind(&event.account)
            .bind(&event.program)
            .bind(&event.amount)
            .bind(&event.mint)
            .bind(serde_json::to_string(&event.raw)?)
            .bind(event.occurred_at.to_rfc3339())
            .execute(&mut *tx)
            .await?;
        }

        tx.commit().await?;
        Ok(events.len())
    }

    async fn get_events_by_signature(&self, signature: &str) -> Result<Vec<EventRecord>> {
        let rows = sqlx::query(
            "SELECT id, kind, signature, event_index, slot, account, program, amount, mint, raw, occurred_at FROM events WHERE signature = ?1 ORDER BY event_index ASC",
        )
        .bind(signature)
        .fetch_all(&self.pool)
        .await?;

        let mut events = Vec::new();
        for row in rows {
            events.push(EventRecord {
                id: row.get("id"),
                kind: row.get("kind"),
                signature: row.get("signature"),
                event_index: row.get("event_index"),
                slot: row.get("slot"),
                account: row.get("account"),
                program: row.get("program"),
                amount: row.get("amount"),
                mint: row.get("mint"),
                raw: serde_json::from_str(row.get::<String, _>("raw").as_str())?,
                occurred_at: Self::parse_timestamp(row.get::<String, _>("occurred_at").as_str())?,
            });
        }

        Ok(events)
    }

    async fn list_recent_transactions(&self, limit: usize) -> Result<Vec<TransactionSummary>> {
        let rows = sqlx::query(
            "SELECT signature, slot, block_time, fee, err FROM transactions ORDER BY slot DESC LIMIT ?1",
        )
        .bind(limit.clamp(1, crate::db::MAX_QUERY_LIMIT) as i64)
        .fetch_all(&self.pool)
        .await?;

        let mut summaries = Vec::new();
        for row in rows {
            let block_time = row
                .get::<Option<String>, _>("block_time")
                .map(|t| Self::parse_timestamp(&t))
                .transpose()?;
            summaries.push(TransactionSummary {
                signature: row.get("signature"),
                slot: row.get("slot"),
                block_time,
                fee: row.get("fee"),
                err: Self::parse_json(row.get("err"))?,
            });
        }

        Ok(summaries)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::EventKind;
    use chrono::TimeZone;
    use serde_json::json;

    async fn memory_backend() -> SqliteBackend {
        SqliteBackend::new("sqlite::memory:").await.unwrap()
    }

    fn row(signature: &str, slot: u64, logs: &str) -> LogEventRow {
        LogEventRow {
            signature: signature.to_string(),
            slot,
            err: None,
            logs: Some(logs.to_string()),
        }
    }

    #[tokio::test]
    async fn test_upsert_is_idempotent_and_overwrites() {
        let db = memory_backend().await;

        db.upsert_log_event(&row("sigA", 100, "first")).await.unwrap();
        let mut updated = row("sigA", 102, "second");
        updated.err = Some(json!({"InstructionError": [0, "Custom"]}));
        db.upsert_log_event(&updated).await.unwrap();

        let stored = db.get_log_event("sigA").await.unwrap().unwrap();
        assert_eq!(stored.slot, 102);
        assert_eq!(stored.logs.as_deref(), Some("second"));
        assert_eq!(stored.err, updated.err);

        let all = db.latest_log_events(&LogEventQuery::default()).await.unwrap();
        assert_eq!(all.len(), 1);
    }

    #[tokio::test]
    async fn test_out_of_range_slot_is_refused() {
        let db = memory_backend().await;

        let refused = db.upsert_log_event(&row("sigA", u64::MAX, "x")).await;
        assert!(matches!(refused, Err(SentinelError::Database(_))));
        assert!(db.get_log_event("sigA").await.unwrap().is_none());

        db.upsert_log_event(&row("sigB", i64::MAX as u64, "x")).await.unwrap();
        let stored = db.get_log_event("sigB").await.unwrap().unwrap();
        assert_eq!(stored.slot, i64::MAX);

        let query = LogEventQuery {
            since_slot: Some(u64::MAX),
            ..LogEventQuery::default()
        };
        assert!(matches!(
            db.latest_log_events(&query).await,
            Err(SentinelError::Database(_))
        ));
    }

    #[tokio::test]
    async fn test_absent_err_is_sql_null() {
        let db = memory_backend().await;
        db.upsert_log_event(&row("sigA", 1, "x")).await.unwrap();

        let err: Option<String> = sqlx::query_scalar("SELECT err FROM tx_events WHERE signature = 'sigA'")
            .fetch_one(&db.pool)
            .await
            .unwrap();
        assert!(err.is_none());
    }

    #[tokio::test]
    async fn test_latest_log_events_filters() {
        let db = memory_backend().await;
        db.upsert_log_event(&row("s1", 10, "Program TokenkegQ invoke [1]")).await.unwrap();
        db.upsert_log_event(&row("s2", 20, "Program 1111 invoke [1]")).await.unwrap();
        db.upsert_log_event(&row("s3", 30, "Program tokenkegq invoke [1]")).await.unwrap();

        let query = LogEventQuery {
            program_contains: Some("TOKENKEG".into()),
            ..Default::default()
        };
        let sigs: Vec<_> = db
            .latest_log_events(&query)
            .await
            .unwrap()
            .into_iter()
            .map(|e| e.signature)
            .collect();
        assert_eq!(sigs, vec!["s3", "s1"]);

        let query = LogEventQuery {
            since_slot: Some(15),
            until_slot: Some(25),
            ..Default::default()
        };
        let rows = db.latest_log_events(&query).await.unwrap();
        assert_eq!(rows.len(), 1);
        assert_eq!(rows[0].signature, "s2");

        let query = LogEventQuery {
            limit: Some(1),
            ..Default::default()
        };
        let rows = db.latest_log_events(&query).await.unwrap();
        assert_eq!(rows[0].signature, "s3");
    }

    #[tokio::test]
    async fn test_replace_events_for_signature() {
        let db = memory_backend().await;
        let at = Utc.with_ymd_and_hms(2024, 3, 1, 0, 0, 0).unwrap();
        let event = |index: usize, kind: EventKind| CanonicalEvent {
            kind,
            signature: "sigT".into(),
            slot: 5,
            index,
            account: Some("B".into()),
            program: None,
            amount: Some("1000".into()),
            mint: None,
            raw: json!({"i": index}),
            occurred_at: at,
        };

        db.upsert_transaction(&TransactionRow {
            signature: "sigT".into(),
            slot: 5,
            block_time: Some(at),
            fee: 5000,
            err: None,
            raw: json!({}),
        })
        .await
        .unwrap();

        let first = vec![event(0, EventKind::Transfer), event(1, EventKind::ProgramLog)];
        assert_eq!(db.replace_events_for_signature("sigT", &first).await.unwrap(), 2);
        let second = vec![event(0, EventKind::Transfer)];
        db.replace_events_for_signature("sigT", &second).await.unwrap();

        let stored = db.get_events_by_signature("sigT").await.unwrap();
        assert_eq!(stored.len(), 1);
        assert_eq!(stored[0].id, second[0].id());
        assert_eq!(stored[0].amount.as_deref(), Some("1000"));
        assert_eq!(stored[0].occurred_at, at);

        let recent = db.list_recent_transactions(10).await.unwrap();
        assert_eq!(recent.len(), 1);
        assert_eq!(recent[0].fee, 5000);
        assert_eq!(recent[0].block_time, Some(at));
    }
}
