//! PostgreSQL store for the laneq job queue.
//!
//! All jobs live in one table. Claims are a single `UPDATE ... WHERE id =
//! (SELECT ... FOR UPDATE SKIP LOCKED)` statement, so concurrent workers never
//! lease the same row and never block each other on locked rows.
//!
//! ## Usage
//!
//! ```rust,no_run
//! use laneq_core::Client;
//! use laneq_postgres::PgStore;
//!
//! #[tokio::main]
//! async fn main() -> laneq_core::Result<()> {
//!     let store = PgStore::connect("postgres://localhost/mydb", "jobs").await?;
//!     let client = Client::new(store);
//!     client.enqueue("default", serde_json::json!({"hello": "world"})).await?;
//!     Ok(())
//! }
//! ```

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sqlx::postgres::{PgPool, PgPoolOptions, PgRow};
use sqlx::Row;
use uuid::Uuid;

use laneq_core::{ClaimedJob, Job, JobId, NewJob, Payload, QueueError, Result, Status, Store};

/// Connection options for [`PgStore`].
#[derive(Debug, Clone)]
pub struct PgStoreOptions {
    /// Maximum pool size.
    pub max_connections: u32,
    /// Job table name.
    pub table: String,
    /// Create the table and its index on connect.
    pub init_table: bool,
}

impl Default for PgStoreOptions {
    fn default() -> Self {
        Self {
            max_connections: 10,
            table: "jobs".to_string(),
            init_table: true,
        }
    }
}

/// PostgreSQL job store.
#[derive(Clone)]
pub struct PgStore {
    pool: PgPool,
    table: String,
}

impl PgStore {
    /// Connect with default options and the given table name.
    pub async fn connect(database_url: &str, table: &str) -> Result<Self> {
        let options = PgStoreOptions {
            table: table.to_string(),
            ..Default::default()
        };
        Self::connect_with(database_url, options).await
    }

    /// Connect with explicit options.
    pub async fn connect_with(database_url: &str, options: PgStoreOptions) -> Result<Self> {
        validate_table_name(&options.table)?;

        let pool = PgPoolOptions::new()
            .max_connections(options.max_connections)
            .connect(database_url)
            .await
            .map_err(|e| QueueError::Store(format!("Failed to connect to PostgreSQL: {}", e)))?;

        let store = Self {
            pool,
            table: options.table,
        };

        if options.init_table {
            store.init_table().await?;
        }

        tracing::debug!(table = %store.table, "PostgreSQL store connected");
        Ok(store)
    }

    /// Wrap an existing pool. The table is not created.
    pub fn from_pool(pool: PgPool, table: &str) -> Result<Self> {
        validate_table_name(table)?;
        Ok(Self {
            pool,
            table: table.to_string(),
        })
    }

    /// Create the job table and its claim index if missing.
    pub async fn init_table(&self) -> Result<()> {
        sqlx::query(&format!(
            r#"
            CREATE TABLE IF NOT EXISTS {} (
                id UUID PRIMARY KEY,
                lane TEXT NOT NULL,
                status TEXT NOT NULL DEFAULT 'pending',
                "try" INTEGER NOT NULL DEFAULT 0,
                created_at TIMESTAMPTZ NOT NULL DEFAULT NOW(),
                heartbeat_at TIMESTAMPTZ NOT NULL DEFAULT NOW(),
                payload JSONB NOT NULL DEFAULT '{{}}'::jsonb
            )
            "#,
            self.table
        ))
        .execute(&self.pool)
        .await
        .map_err(|e| QueueError::Store(format!("Failed to create jobs table: {}", e)))?;

        // Covers the claim's filter and ordering
        sqlx::query(&format!(
            "CREATE INDEX IF NOT EXISTS idx_{}_claim ON {} (status, lane, created_at)",
            self.table, self.table
        ))
        .execute(&self.pool)
        .await
        .map_err(|e| QueueError::Store(format!("Failed to create claim index: {}", e)))?;

        Ok(())
    }

    /// Get the underlying pool.
    pub fn pool(&self) -> &PgPool {
        &self.pool
    }

    pub fn table(&self) -> &str {
        &self.table
    }
}

/// Table names are spliced into SQL text, so only plain identifiers are allowed.
fn validate_table_name(table: &str) -> Result<()> {
    let mut chars = table.chars();
    let valid = matches!(chars.next(), Some(c) if c.is_ascii_alphabetic() || c == '_')
        && chars.all(|c| c.is_ascii_alphanumeric() || c == '_');
    if valid {
        Ok(())
    } else {
        Err(QueueError::Config(format!("Invalid table name: {:?}", table)))
    }
}

fn parse_status(raw: &str) -> Result<Status> {
    raw.parse()
}

fn decode_err(e: sqlx::Error) -> QueueError {
    QueueError::Store(format!("Failed to decode job row: {}", e))
}

fn job_from_row(row: &PgRow) -> Result<Job> {
    let status: String = row.try_get("status").map_err(decode_err)?;
    Ok(Job {
        id: JobId(row.try_get::<Uuid, _>("id").map_err(decode_err)?),
        lane: row.try_get("lane").map_err(decode_err)?,
        r#try: row.try_get("try").map_err(decode_err)?,
        status: parse_status(&status)?,
        created_at: row.try_get("created_at").map_err(decode_err)?,
        heartbeat_at: row.try_get("heartbeat_at").map_err(decode_err)?,
        payload: row.try_get("payload").map_err(decode_err)?,
    })
}

#[async_trait]
impl Store for PgStore {
    async fn claim(
        &self,
        lanes: &[String],
        now: DateTime<Utc>,
        stale_before: DateTime<Utc>,
    ) -> Result<Option<ClaimedJob>> {
        if lanes.is_empty() {
            return Ok(None);
        }

        let row = sqlx::query(&format!(
            r#"
            UPDATE {table} AS t
            SET status = 'running', heartbeat_at = $2, "try" = t."try" + 1
            WHERE t.id = (
                SELECT id FROM {table}
                WHERE lane = ANY($1)
                  AND (status = 'pending' OR (status = 'running' AND heartbeat_at < $3))
                ORDER BY array_position($1::text[], lane), created_at
                LIMIT 1
                FOR UPDATE SKIP LOCKED
            )
            RETURNING t.id, t.lane, t."try", t.status, t.created_at, to_jsonb(t.*) AS row_json
            "#,
            table = self.table
        ))
        .bind(lanes)
        .bind(now)
        .bind(stale_before)
        .fetch_optional(&self.pool)
        .await
        .map_err(|e| QueueError::Store(format!("Failed to claim job: {}", e)))?;

        let Some(row) = row else {
            return Ok(None);
        };

        let status: String = row.try_get("status").map_err(decode_err)?;
        Ok(Some(ClaimedJob {
            id: JobId(row.try_get::<Uuid, _>("id").map_err(decode_err)?),
            lane: row.try_get("lane").map_err(decode_err)?,
            r#try: row.try_get("try").map_err(decode_err)?,
            status: parse_status(&status)?,
            created_at: row.try_get("created_at").map_err(decode_err)?,
            payload: Payload(row.try_get("row_json").map_err(decode_err)?),
        }))
    }

    async fn heartbeat(&self, id: &JobId, now: DateTime<Utc>) -> Result<Option<Status>> {
        let result: Option<(String,)> = sqlx::query_as(&format!(
            "UPDATE {} SET heartbeat_at = $2 WHERE id = $1 RETURNING status",
            self.table
        ))
        .bind(id.0)
        .bind(now)
        .fetch_optional(&self.pool)
        .await
        .map_err(|e| QueueError::Store(format!("Failed to heartbeat job: {}", e)))?;

        result.map(|(status,)| parse_status(&status)).transpose()
    }

    async fn set_status(&self, id: &JobId, status: Status) -> Result<()> {
        sqlx::query(&format!("UPDATE {} SET status = $2 WHERE id = $1", self.table))
            .bind(id.0)
            .bind(status.as_str())
            .execute(&self.pool)
            .await
            .map_err(|e| QueueError::Store(format!("Failed to set job status: {}", e)))?;
        Ok(())
    }

    async fn push_job(&self, job: NewJob) -> Result<()> {
        sqlx::query(&format!(
            r#"
            INSERT INTO {} (id, lane, status, "try", created_at, heartbeat_at, payload)
            VALUES ($1, $2, 'pending', 0, $3, $3, $4)
            "#,
            self.table
        ))
        .bind(job.id.0)
        .bind(&job.lane)
        .bind(job.created_at)
        .bind(&job.payload)
        .execute(&self.pool)
        .await
        .map_err(|e| QueueError::Store(format!("Failed to push job: {}", e)))?;
        Ok(())
    }

    async fn get_job(&self, id: &JobId) -> Result<Option<Job>> {
        let row = sqlx::query(&format!(
            r#"
            SELECT id, lane, status, "try", created_at, heartbeat_at, payload
            FROM {} WHERE id = $1
            "#,
            self.table
        ))
        .bind(id.0)
        .fetch_optional(&self.pool)
        .await
        .map_err(|e| QueueError::Store(format!("Failed to get job: {}", e)))?;

        row.as_ref().map(job_from_row).transpose()
    }

    async fn request_cancel(&self, id: &JobId) -> Result<bool> {
        let result = sqlx::query(&format!(
            r#"
            UPDATE {} SET status = CASE status WHEN 'running' THEN 'cancelling' ELSE 'cancelled' END
            WHERE id = $1 AND status IN ('pending', 'running')
            "#,
            self.table
        ))
        .bind(id.0)
        .execute(&self.pool)
        .await
        .map_err(|e| QueueError::Store(format!("Failed to cancel job: {}", e)))?;

        Ok(result.rows_affected() > 0)
    }

    async fn remove_job(&self, id: &JobId) -> Result<bool> {
        let result = sqlx::query(&format!("DELETE FROM {} WHERE id = $1", self.table))
            .bind(id.0)
            .execute(&self.pool)
            .await
            .map_err(|e| QueueError::Store(format!("Failed to delete job: {}", e)))?;

        Ok(result.rows_affected() > 0)
    }

    async fn count_by_status(&self, status: Status) -> Result<usize> {
        let count: (i64,) = sqlx::query_as(&format!(
            "SELECT COUNT(*) FROM {} WHERE status = $1",
            self.table
        ))
        .bind(status.as_str())
        .fetch_one(&self.pool)
        .await
        .map_err(|e| QueueError::Store(format!("Failed to count jobs: {}", e)))?;

        Ok(count.0 as usize)
    }

    async fn close(&self) {
        self.pool.close().await;
    }
}
