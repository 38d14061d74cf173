use crate::{
    db::{sql_int, DatabaseBackend, EventRecord, LogEvent, LogEventQuery, LogEventRow, TransactionSummary},
    error::Result,
    types::{CanonicalEvent, TransactionRow},
};
use async_trait::async_trait;
use sqlx::postgres::PgRow;
use sqlx::Row;

// Prepared statements cannot hold several commands, so each runs on its own.
const MIGRATIONS: &[&str] = &[
    r#"
    CREATE TABLE IF NOT EXISTS tx_events (
        signature TEXT PRIMARY KEY,
        slot BIGINT NOT NULL,
        err JSONB NULL,
        logs TEXT NULL,
        created_at TIMESTAMPTZ NOT NULL DEFAULT now()
    )
    "#,
    "CREATE INDEX IF NOT EXISTS idx_tx_events_slot ON tx_events(slot DESC)",
    r#"
    CREATE TABLE IF NOT EXISTS transactions (
        signature TEXT PRIMARY KEY,
        slot BIGINT NOT NULL,
        block_time TIMESTAMPTZ NULL,
        fee BIGINT NOT NULL,
        err JSONB NULL,
        raw JSONB NOT NULL,
        created_at TIMESTAMPTZ NOT NULL DEFAULT now()
    )
    "#,
    "CREATE INDEX IF NOT EXISTS idx_transactions_slot ON transactions(slot DESC)",
    r#"
    CREATE TABLE IF NOT EXISTS events (
        id TEXT PRIMARY KEY,
        kind TEXT NOT NULL,
        signature TEXT NOT NULL,
        event_index BIGINT NOT NULL,
        slot BIGINT NOT NULL,
        account TEXT NULL,
        program TEXT NULL,
        amount NUMERIC NULL,
        mint TEXT NULL,
        raw JSONB NOT NULL,
        occurred_at TIMESTAMPTZ NOT NULL
    )
    "#,
    "CREATE INDEX IF NOT EXISTS idx_events_signature ON events(signature)",
    "CREATE INDEX IF NOT EXISTS idx_events_kind ON events(kind)",
    "CREATE INDEX IF NOT EXISTS idx_events_slot ON events(slot)",
    "CREATE INDEX IF NOT EXISTS idx_events_raw_gin ON events USING GIN (raw)",
];

// Trigram index backing `program_contains`. Without it the ILIKE filter
// still works as a scan, so roles that cannot create extensions carry on.
const OPTIONAL_MIGRATIONS: &[&str] = &[
    "CREATE EXTENSION IF NOT EXISTS pg_trgm",
    "CREATE INDEX IF NOT EXISTS idx_tx_events_logs_trgm ON tx_events USING GIN (logs gin_trgm_ops)",
];

/// PostgreSQL database backend with JSONB support
#[derive(Clone)]
pub struct PostgresBackend {
    pool: sqlx::postgres::PgPool,
}

impl PostgresBackend {
    pub async fn new(database_url: &str) -> Result<Self> {
        tracing::info!("Connecting to PostgreSQL database");

        let pool = sqlx::postgres::PgPool::connect(database_url).await?;

        let backend = Self { pool };
        backend.run_migrations().await?;

        Ok(backend)
    }

    fn row_to_log_event(row: PgRow) -> LogEvent {
        LogEvent {
            signature: row.get("signature"),
            slot: row.get("slot"),
            err: row.get("err"),
            logs: row.get("logs"),
            created_at: row.get("created_at"),
        }
    }
}

#[async_trait]
impl DatabaseBackend for PostgresBackend {
    async fn run_migrations(&self) -> Result<()> {
        for statement in MIGRATIONS {
            sqlx::query(statement).execute(&self.pool).await?;
        }

        for statement in OPTIONAL_MIGRATIONS {
            if let Err(e) = sqlx::query(statement).execute(&self.pool).await {
                tracing::warn!(
                    "Skipping optional migration, log search falls back to a scan: {}",
                    e
                );
                break;
            }
        }

        tracing::info!("PostgreSQL migrations completed");
        Ok(())
    }

    async fn health(&self) -> Result<()> {
        sqlx::query("SELECT 1").execute(&self.pool).await?;
        Ok(())
    }

    async fn upsert_log_event(&self, row: &LogEventRow) -> Result<()> {
        sqlx::query(
            r#"
            INSERT INTO tx_events (signature, slot, err, logs)
            VALUES ($1, $2, $3, $4)
            ON CONFLICT (signature) DO UPDATE SET
                slot = EXCLUDED.slot,
                err = EXCLUDED.err,
                logs = EXCLUDED.logs
        "#,
        )
        .bind(&row.signature)
        .bind(sql_int(row.slot, "slot")?)
        .bind(&row.err)
        .bind(&row.logs)
        .execute(&self.pool)
        .await?;

        Ok(())
    }

    async fn get_log_event(&self, signature: &str) -> Result<Option<LogEvent>> {
        let row = sqlx::query(
            "SELECT signature, slot, err, logs, created_at FROM tx_events WHERE signature = $1",
        )
        .bind(signature)
        .fetch_optional(&self.pool)
        .await?;

        Ok(row.map(Self::row_to_log_event))
    }

    async fn latest_log_events(&self, query: &LogEventQuery) -> Result<Vec<LogEvent>> {
        let rows = sqlx::query(
            r#"
            SELECT signature, slot, err, logs, created_at FROM tx_events
            WHERE ($1::text IS NULL OR logs ILIKE $1 ESCAPE '\')
              AND ($2::bigint IS NULL OR slot >= $2)
              AND ($3::bigint IS NULL OR slot <= $3)
            ORDER BY slot DESC
            LIMIT $4
        "#,
        )
        .bind(query.like_pattern())
        .bind(query.since_slot.map(|s| sql_int(s, "since_slot")).transpose()?)
        .bind(query.until_slot.map(|s| sql_int(s, "until_slot")).transpose()?)
        .bind(query.effective_limit())
        .fetch_all(&self.pool)
        .await?;

        Ok(rows.into_iter().map(Self::row_to_log_event).collect())
    }

    async fn upsert_transaction(&self, tx: &TransactionRow) -> Result<()> {
        sqlx::query(
            r#"
            INSERT INTO transactions (signature, slot, block_time, fee, err, raw)
            VALUES ($1, $2, $3, $4, $5, $6)
            ON CONFLICT (signature) DO UPDATE SET
                slot = EXCLUDED.slot,
                block_time = EXCLUDED.block_time,
                fee = EXCLUDED.fee,
                err = EXCLUDED.err,
                raw = EXCLUDED.raw
        "#,
        )
        .bind(&tx.signature)
        .bind(sql_int(tx.slot, "slot")?)
        .bind(tx.block_time)
        .bind(sql_int(tx.fee, "fee")?)
        .bind(&tx.err)
        .bind(&tx.raw)
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

        sqlx::query("DELETE FROM events WHERE signature = $1")
            .bind(signature)
            .execute(&mut *tx)
            .await?;

        for event in events {
            sqlx::query(
                r#"
                INSERT INTO events (id, kind, signature, event_index, slot, account, program, amount, mint, raw, occurred_at)
                VALUES ($1, $2, $3, $4, $5, $6, $7, $8::text::numeric, $9, $10, $11)
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
            .bind(&event.raw)
            .bind(event.occurred_at)
            .execute(&mut *tx)
            .await?;
        }

        tx.commit().await?;
        Ok(events.len())
    }

    async fn get_events_by_signature(&self, signature: &str) -> Result<Vec<EventRecord>> {
        let rows = sqlx::query(
            "SELECT id, kind, signature, event_index, slot, account, program, amount::text AS amount, mint, raw, occurred_at FROM events WHERE signature = $1 ORDER BY event_index ASC",
        )
        .bind(signature)
        .fetch_all(&self.pool)
        .await?;

        Ok(rows
            .into_iter()
            .map(|row| EventRecord {
                id: row.get("id"),
                kind: row.get("kind"),
                signature: row.get("signature"),
                event_index: row.get("event_index"),
                slot: row.get("slot"),
                account: row.get("account"),
                program: row.get("program"),
                amount: row.get("amount"),
                mint: row.get("mint"),
                raw: row.get::<serde_json::Value, _>("raw"),
                occurred_at: row.get("occurred_at"),
            })
            .collect())
    }

    async fn list_recent_transactions(&self, limit: usize) -> Result<Vec<TransactionSummary>> {
        let rows = sqlx::query(
            "SELECT signature, slot, block_time, fee, err FROM transactions ORDER BY slot DESC LIMIT $1",
        )
        .bind(limit.clamp(1, crate::db::MAX_QUERY_LIMIT) as i64)
        .fetch_all(&self.pool)
        .await?;

        Ok(rows
            .into_iter()
            .map(|row| TransactionSummary {
                signature: row.get("signature"),
                slot: row.get("slot"),
                block_time: row.get("block_time"),
                fee: row.get("fee"),
                err: row.get("err"),
            })
            .collect())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_required_migrations_need_no_extensions() {
        for statement in MIGRATIONS {
            assert!(!statement.contains("EXTENSION"), "{}", statement);
            assert!(!statement.contains("gin_trgm_ops"), "{}", statement);
        }
        assert!(OPTIONAL_MIGRATIONS[0].contains("pg_trgm"));
        assert!(OPTIONAL_MIGRATIONS[1].contains("gin_trgm_ops"));
    }
}
