//! Postgres-backed message store.
//!
//! ## Error Mapping
//!
//! | SQLx Error | PostgreSQL Error Code | StoreError | Scenario |
//! |------------|----------------------|------------|----------|
//! | Database (unique violation) | `23505` | `DuplicateConsumer` (ledger insert) / `Storage` | Concurrent ledger insert |
//! | Database (check constraint violation) | `23514` | `InvalidRow` | Bad status / negative attempts |
//! | Database (other) | Any other | `Storage` | Other database errors |
//! | PoolClosed | N/A | `Storage` | Connection pool was closed |
//! | Other | N/A | `Storage` | Network errors, connection failures, etc. |
//!
//! ## Locking
//!
//! Claiming uses `SELECT … FOR UPDATE SKIP LOCKED`: concurrent processors never see
//! each other's in-flight rows. Consumers run in their own transactions, so the pool
//! needs at least two connections per concurrently ticking processor.

use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sqlx::postgres::{PgConnection, PgPoolOptions, PgRow};
use sqlx::{FromRow, PgPool, Postgres, Row, Transaction};
use tracing::{Span, instrument};

use courier_core::{EventId, ModuleName};
use courier_events::MessageEnvelope;

use super::schema::module_ddl;
use super::{
    InsertOutcome, MessageRecord, MessageStats, MessageStatus, MessageStore, MessageTable, StoreError,
    StoreResult, StoreTransaction,
};

const MESSAGE_COLUMNS: &str =
    "id, type, content, occurred_on_utc, processed_on_utc, error, attempts, status";

/// Postgres-backed message store.
#[derive(Debug, Clone)]
pub struct PostgresMessageStore {
    pool: Arc<PgPool>,
}

impl PostgresMessageStore {
    pub fn new(pool: PgPool) -> Self {
        Self { pool: Arc::new(pool) }
    }

    /// Connect a pool to `database_url`.
    pub async fn connect(database_url: &str) -> StoreResult<Self> {
        let pool = PgPoolOptions::new()
            .max_connections(10)
            .connect(database_url)
            .await
            .map_err(|e| map_sqlx_error("connect", e))?;
        Ok(Self::new(pool))
    }

    pub fn pool(&self) -> &PgPool {
        &self.pool
    }

    /// Create the module's schema and messaging tables if missing.
    #[instrument(skip(self), fields(module = %module), err)]
    pub async fn ensure_schema(&self, module: &ModuleName) -> StoreResult<()> {
        for statement in module_ddl(module) {
            sqlx::query(&statement)
                .execute(&*self.pool)
                .await
                .map_err(|e| map_sqlx_error("ensure_schema", e))?;
        }
        Ok(())
    }
}

#[async_trait]
impl MessageStore for PostgresMessageStore {
    type Tx = PgStoreTransaction;

    async fn begin(&self) -> StoreResult<Self::Tx> {
        let tx = self
            .pool
            .begin()
            .await
            .map_err(|e| map_sqlx_error("begin_transaction", e))?;
        Ok(PgStoreTransaction { tx })
    }

    #[instrument(skip(self), fields(table = %table, message_id = %id), err)]
    async fn find_message(&self, table: &MessageTable, id: EventId) -> StoreResult<Option<MessageRecord>> {
        let sql = format!(
            "SELECT {MESSAGE_COLUMNS} FROM {} WHERE id = $1",
            table.messages_relation()
        );
        let row = sqlx::query(&sql)
            .bind(id.as_uuid())
            .fetch_optional(&*self.pool)
            .await
            .map_err(|e| map_sqlx_error("find_message", e))?;

        row.map(|r| decode_message(&r)).transpose()
    }

    async fn consumers_of(&self, table: &MessageTable, id: EventId) -> StoreResult<Vec<String>> {
        let sql = format!(
            "SELECT name FROM {} WHERE {} = $1 ORDER BY name ASC",
            table.consumers_relation(),
            table.message_id_column()
        );
        let rows = sqlx::query(&sql)
            .bind(id.as_uuid())
            .fetch_all(&*self.pool)
            .await
            .map_err(|e| map_sqlx_error("consumers_of", e))?;

        rows.iter()
            .map(|r| r.try_get::<String, _>("name").map_err(|e| StoreError::InvalidRow(e.to_string())))
            .collect()
    }

    async fn stats(&self, table: &MessageTable) -> StoreResult<MessageStats> {
        let sql = format!(
            "SELECT status, COUNT(*) AS count FROM {} GROUP BY status",
            table.messages_relation()
        );
        let rows = sqlx::query(&sql)
            .fetch_all(&*self.pool)
            .await
            .map_err(|e| map_sqlx_error("stats", e))?;

        let mut stats = MessageStats::default();
        for row in rows {
            let status: String = row.try_get("status").map_err(|e| StoreError::InvalidRow(e.to_string()))?;
            let count: i64 = row.try_get("count").map_err(|e| StoreError::InvalidRow(e.to_string()))?;
            let count = count.max(0) as u64;
            match status.parse::<MessageStatus>()? {
                MessageStatus::Pending => stats.pending = count,
                MessageStatus::Processed => stats.processed = count,
                MessageStatus::Failed => stats.failed = count,
            }
        }
        Ok(stats)
    }

    async fn failed_messages(&self, table: &MessageTable, limit: usize) -> StoreResult<Vec<MessageRecord>> {
        let sql = format!(
            "SELECT {MESSAGE_COLUMNS} FROM {} WHERE status = 'failed' ORDER BY occurred_on_utc ASC, id ASC LIMIT $1",
            table.messages_relation()
        );
        let rows = sqlx::query(&sql)
            .bind(limit as i64)
            .fetch_all(&*self.pool)
            .await
            .map_err(|e| map_sqlx_error("failed_messages", e))?;

        rows.iter().map(decode_message).collect()
    }

    #[instrument(skip(self), fields(table = %table, message_id = %id), err)]
    async fn requeue(&self, table: &MessageTable, id: EventId) -> StoreResult<()> {
        let sql = format!(
            "UPDATE {} SET status = 'pending', attempts = 0 WHERE id = $1 AND status = 'failed'",
            table.messages_relation()
        );
        let result = sqlx::query(&sql)
            .bind(id.as_uuid())
            .execute(&*self.pool)
            .await
            .map_err(|e| map_sqlx_error("requeue", e))?;

        if result.rows_affected() == 1 {
            return Ok(());
        }
        match self.find_message(table, id).await? {
            Some(_) => Err(StoreError::NotRequeueable(id)),
            None => Err(StoreError::NotFound(id)),
        }
    }
}

/// A Postgres transaction.
///
/// Business code reaches the underlying connection through [`connection`] to run its
/// own statements inside the same transaction as the outbox insert or ledger entry.
///
/// [`connection`]: PgStoreTransaction::connection
pub struct PgStoreTransaction {
    tx: Transaction<'static, Postgres>,
}

impl core::fmt::Debug for PgStoreTransaction {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.debug_struct("PgStoreTransaction").finish_non_exhaustive()
    }
}

impl PgStoreTransaction {
    pub fn connection(&mut self) -> &mut PgConnection {
        &mut self.tx
    }
}

#[async_trait]
impl StoreTransaction for PgStoreTransaction {
    #[instrument(skip(self, envelope), fields(table = %table, message_id = %envelope.id()), err)]
    async fn insert_message(
        &mut self,
        table: &MessageTable,
        envelope: &MessageEnvelope,
    ) -> StoreResult<InsertOutcome> {
        let sql = format!(
            r#"
            INSERT INTO {} (id, type, content, occurred_on_utc)
            VALUES ($1, $2, $3, $4)
            ON CONFLICT (id) DO NOTHING
            "#,
            table.messages_relation()
        );
        let result = sqlx::query(&sql)
            .bind(envelope.id().as_uuid())
            .bind(envelope.event_type())
            .bind(envelope.payload())
            .bind(envelope.occurred_at())
            .execute(&mut *self.tx)
            .await
            .map_err(|e| map_sqlx_error("insert_message", e))?;

        Ok(if result.rows_affected() == 0 {
            InsertOutcome::Duplicate
        } else {
            InsertOutcome::Inserted
        })
    }

    #[instrument(skip(self), fields(table = %table, claimed = tracing::field::Empty), err)]
    async fn claim_pending(
        &mut self,
        table: &MessageTable,
        limit: usize,
        max_attempts: u32,
    ) -> StoreResult<Vec<MessageRecord>> {
        let sql = format!(
            r#"
            SELECT {MESSAGE_COLUMNS}
            FROM {}
            WHERE processed_on_utc IS NULL
              AND status = 'pending'
              AND attempts < $1
            ORDER BY occurred_on_utc ASC, id ASC
            LIMIT $2
            FOR UPDATE SKIP LOCKED
            "#,
            table.messages_relation()
        );
        let rows = sqlx::query(&sql)
            .bind(attempts_to_db(max_attempts))
            .bind(limit as i64)
            .fetch_all(&mut *self.tx)
            .await
            .map_err(|e| map_sqlx_error("claim_pending", e))?;

        let records = rows.iter().map(decode_message).collect::<StoreResult<Vec<_>>>()?;
        Span::current().record("claimed", records.len());
        Ok(records)
    }

    async fn fail_exhausted(&mut self, table: &MessageTable, max_attempts: u32) -> StoreResult<Vec<EventId>> {
        let relation = table.messages_relation();
        let sql = format!(
            r#"
            UPDATE {relation} SET status = 'failed'
            WHERE id IN (
                SELECT id FROM {relation}
                WHERE processed_on_utc IS NULL
                  AND status = 'pending'
                  AND attempts >= $1
                FOR UPDATE SKIP LOCKED
            )
            RETURNING id
            "#
        );
        let rows = sqlx::query(&sql)
            .bind(attempts_to_db(max_attempts))
            .fetch_all(&mut *self.tx)
            .await
            .map_err(|e| map_sqlx_error("fail_exhausted", e))?;

        rows.iter()
            .map(|r| {
                r.try_get::<uuid::Uuid, _>("id")
                    .map(EventId::from_uuid)
                    .map_err(|e| StoreError::InvalidRow(e.to_string()))
            })
            .collect()
    }

    async fn has_consumed(&mut self, table: &MessageTable, message_id: EventId, consumer: &str) -> StoreResult<bool> {
        let sql = format!(
            "SELECT EXISTS (SELECT 1 FROM {} WHERE {} = $1 AND name = $2) AS consumed",
            table.consumers_relation(),
            table.message_id_column()
        );
        let row = sqlx::query(&sql)
            .bind(message_id.as_uuid())
            .bind(consumer)
            .fetch_one(&mut *self.tx)
            .await
            .map_err(|e| map_sqlx_error("has_consumed", e))?;

        row.try_get("consumed").map_err(|e| StoreError::InvalidRow(e.to_string()))
    }

    #[instrument(skip(self), fields(table = %table, message_id = %message_id, consumer = consumer), err)]
    async fn record_consumer(&mut self, table: &MessageTable, message_id: EventId, consumer: &str) -> StoreResult<()> {
        let sql = format!(
            r#"
            INSERT INTO {} ({}, name)
            VALUES ($1, $2)
            ON CONFLICT DO NOTHING
            "#,
            table.consumers_relation(),
            table.message_id_column()
        );
        let result = sqlx::query(&sql)
            .bind(message_id.as_uuid())
            .bind(consumer)
            .execute(&mut *self.tx)
            .await
            .map_err(|e| {
                if is_unique_violation(&e) {
                    StoreError::DuplicateConsumer {
                        message_id,
                        consumer: consumer.to_string(),
                    }
                } else {
                    map_sqlx_error("record_consumer", e)
                }
            })?;

        // A concurrent insert of the same pair waits for the other transaction and
        // then inserts nothing.
        if result.rows_affected() == 0 {
            return Err(StoreError::DuplicateConsumer {
                message_id,
                consumer: consumer.to_string(),
            });
        }
        Ok(())
    }

    async fn record_failure(&mut self, table: &MessageTable, message_id: EventId, error: &str) -> StoreResult<()> {
        let sql = format!(
            "UPDATE {} SET attempts = attempts + 1, error = $2 WHERE id = $1",
            table.messages_relation()
        );
        sqlx::query(&sql)
            .bind(message_id.as_uuid())
            .bind(error)
            .execute(&mut *self.tx)
            .await
            .map_err(|e| map_sqlx_error("record_failure", e))?;
        Ok(())
    }

    async fn mark_processed(&mut self, table: &MessageTable, message_id: EventId, at: DateTime<Utc>) -> StoreResult<()> {
        let sql = format!(
            r#"
            UPDATE {}
            SET processed_on_utc = COALESCE(processed_on_utc, $2), status = 'processed'
            WHERE id = $1
            "#,
            table.messages_relation()
        );
        sqlx::query(&sql)
            .bind(message_id.as_uuid())
            .bind(at)
            .execute(&mut *self.tx)
            .await
            .map_err(|e| map_sqlx_error("mark_processed", e))?;
        Ok(())
    }

    async fn mark_failed(&mut self, table: &MessageTable, message_id: EventId, error: Option<&str>) -> StoreResult<()> {
        let sql = format!(
            "UPDATE {} SET status = 'failed', error = COALESCE($2, error) WHERE id = $1",
            table.messages_relation()
        );
        sqlx::query(&sql)
            .bind(message_id.as_uuid())
            .bind(error)
            .execute(&mut *self.tx)
            .await
            .map_err(|e| map_sqlx_error("mark_failed", e))?;
        Ok(())
    }

    async fn commit(self) -> StoreResult<()> {
        self.tx.commit().await.map_err(|e| {
            if is_unique_violation(&e) {
                StoreError::Storage(format!("unique violation at commit: {e}"))
            } else {
                map_sqlx_error("commit_transaction", e)
            }
        })
    }

    async fn rollback(self) -> StoreResult<()> {
        self.tx
            .rollback()
            .await
            .map_err(|e| map_sqlx_error("rollback", e))
    }
}

fn attempts_to_db(attempts: u32) -> i32 {
    i32::try_from(attempts).unwrap_or(i32::MAX)
}

/// Map SQLx errors to StoreError.
fn map_sqlx_error(operation: &str, err: sqlx::Error) -> StoreError {
    match err {
        sqlx::Error::Database(db_err) => {
            let msg = format!("database error in {}: {}", operation, db_err.message());
            match db_err.code().as_deref() {
                Some("23514") => StoreError::InvalidRow(msg),
                _ => StoreError::Storage(msg),
            }
        }
        sqlx::Error::PoolClosed => StoreError::Storage(format!("connection pool closed in {operation}")),
        _ => StoreError::Storage(format!("sqlx error in {operation}: {err}")),
    }
}

/// Check if an error is a unique constraint violation.
fn is_unique_violation(err: &sqlx::Error) -> bool {
    if let sqlx::Error::Database(db_err) = err {
        if let Some(code) = db_err.code() {
            return code.as_ref() == "23505";
        }
    }
    false
}

fn decode_message(row: &PgRow) -> StoreResult<MessageRecord> {
    let row = MessageRow::from_row(row).map_err(|e| StoreError::InvalidRow(format!("failed to decode message row: {e}")))?;
    row.try_into()
}

// SQLx row types

#[derive(Debug)]
struct MessageRow {
    id: uuid::Uuid,
    event_type: String,
    content: serde_json::Value,
    occurred_on_utc: DateTime<Utc>,
    processed_on_utc: Option<DateTime<Utc>>,
    error: Option<String>,
    attempts: i32,
    status: String,
}

impl<'r> FromRow<'r, PgRow> for MessageRow {
    fn from_row(row: &'r PgRow) -> Result<Self, sqlx::Error> {
        Ok(MessageRow {
            id: row.try_get("id")?,
            event_type: row.try_get("type")?,
            content: row.try_get("content")?,
            occurred_on_utc: row.try_get("occurred_on_utc")?,
            processed_on_utc: row.try_get("processed_on_utc")?,
            error: row.try_get("error")?,
            attempts: row.try_get("attempts")?,
            status: row.try_get("status")?,
        })
    }
}

impl TryFrom<MessageRow> for MessageRecord {
    type Error = StoreError;

    fn try_from(row: MessageRow) -> Result<Self, Self::Error> {
        let attempts = u32::try_from(row.attempts)
            .map_err(|_| StoreError::InvalidRow(format!("negative attempts for message {}", row.id)))?;

        Ok(MessageRecord {
            id: EventId::from_uuid(row.id),
            event_type: row.event_type,
            payload: row.content,
            occurred_at: row.occurred_on_utc,
            processed_at: row.processed_on_utc,
            error: row.error,
            attempts,
            status: row.status.parse()?,
        })
    }
}
