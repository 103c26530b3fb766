use async_trait::async_trait;
use sqlx::sqlite::{SqliteConnectOptions, SqlitePoolOptions};
use sqlx::{Pool, Row, Sqlite};
use std::str::FromStr;
use tracing::info;

use chrono::{TimeZone, Utc};
use rq_common::{EndpointAddress, ItemData, QueueItem, QueueItemStatus};

use crate::{QueueError, QueueStorage, Result};

/// SQLite-backed queue storage. All queues of a node share one database
/// file; rows are scoped by queue name.
pub struct SqliteQueueStorage {
    pool: Pool<Sqlite>,
    queue_name: String,
}

impl SqliteQueueStorage {
    pub fn new(pool: Pool<Sqlite>, queue_name: impl Into<String>) -> Self {
        Self {
            pool,
            queue_name: queue_name.into(),
        }
    }

    /// Open (creating if missing) the database at `path` and initialize the
    /// schema.
    pub async fn connect(path: &str, queue_name: impl Into<String>) -> Result<Self> {
        let options = SqliteConnectOptions::from_str(&format!("sqlite://{}", path))
            .map_err(|e| QueueError::Storage(e.to_string()))?
            .create_if_missing(true);

        let pool = SqlitePoolOptions::new()
            .max_connections(4)
            .connect_with(options)
            .await?;

        let storage = Self::new(pool, queue_name);
        storage.init_schema().await?;
        Ok(storage)
    }

    /// Create the queue item schema.
    pub async fn init_schema(&self) -> Result<()> {
        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS queue_items (
                queue_name TEXT NOT NULL,
                id TEXT NOT NULL,
                parent_id TEXT,
                address TEXT,
                description TEXT NOT NULL,
                payload TEXT NOT NULL,
                status INTEGER NOT NULL,
                dispatch_count INTEGER NOT NULL DEFAULT 0,
                send_receive_time INTEGER NOT NULL,
                age_warning_count INTEGER NOT NULL DEFAULT 0,
                PRIMARY KEY (queue_name, id)
            )
            "#,
        )
        .execute(&self.pool)
        .await?;

        sqlx::query(
            r#"
            CREATE INDEX IF NOT EXISTS idx_queue_items_status
            ON queue_items (queue_name, status)
            "#,
        )
        .execute(&self.pool)
        .await?;

        info!(queue = %self.queue_name, "SQLite queue storage schema initialized");
        Ok(())
    }

    fn row_to_item(&self, row: &sqlx::sqlite::SqliteRow) -> Result<QueueItem> {
        let status_code: i64 = row.get("status");
        let status = QueueItemStatus::from_code(status_code as u8)
            .ok_or_else(|| QueueError::Storage(format!("unknown status code {}", status_code)))?;

        let payload: String = row.get("payload");
        let address: Option<String> = row.get("address");
        let send_receive_millis: i64 = row.get("send_receive_time");

        Ok(QueueItem {
            id: row.get("id"),
            parent_id: row.get("parent_id"),
            sender_receiver_address: address.map(EndpointAddress::new),
            item_data: ItemData {
                description: row.get("description"),
                payload: serde_json::from_str(&payload)?,
            },
            status,
            dispatch_count: row.get::<i64, _>("dispatch_count") as u32,
            send_receive_time: Utc
                .timestamp_millis_opt(send_receive_millis)
                .single()
                .unwrap_or_else(Utc::now),
            age_warning_count: row.get::<i64, _>("age_warning_count") as u16,
        })
    }
}

#[async_trait]
impl QueueStorage for SqliteQueueStorage {
    async fn store(&self, item: &QueueItem) -> Result<()> {
        sqlx::query(
            r#"
            INSERT OR REPLACE INTO queue_items
                (queue_name, id, parent_id, address, description, payload,
                 status, dispatch_count, send_receive_time, age_warning_count)
            VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?)
            "#,
        )
        .bind(&self.queue_name)
        .bind(&item.id)
        .bind(&item.parent_id)
        .bind(item.sender_receiver_address.as_ref().map(|a| a.to_string()))
        .bind(&item.item_data.description)
        .bind(serde_json::to_string(&item.item_data.payload)?)
        .bind(item.status.code() as i64)
        .bind(item.dispatch_count as i64)
        .bind(item.send_receive_time.timestamp_millis())
        .bind(item.age_warning_count as i64)
        .execute(&self.pool)
        .await?;

        Ok(())
    }

    async fn update(&self, item: &QueueItem) -> Result<()> {
        let result = sqlx::query(
            r#"
            UPDATE queue_items
            SET address = ?, status = ?, dispatch_count = ?,
                send_receive_time = ?, age_warning_count = ?
            WHERE queue_name = ? AND id = ?
            "#,
        )
        .bind(item.sender_receiver_address.as_ref().map(|a| a.to_string()))
        .bind(item.status.code() as i64)
        .bind(item.dispatch_count as i64)
        .bind(item.send_receive_time.timestamp_millis())
        .bind(item.age_warning_count as i64)
        .bind(&self.queue_name)
        .bind(&item.id)
        .execute(&self.pool)
        .await?;

        if result.rows_affected() == 0 {
            // Update of an unknown item falls back to insert; recovery
            // paths re-persist items that may never have been stored.
            return self.store(item).await;
        }

        Ok(())
    }

    async fn remove(&self, item_id: &str) -> Result<()> {
        sqlx::query("DELETE FROM queue_items WHERE queue_name = ? AND id = ?")
            .bind(&self.queue_name)
            .bind(item_id)
            .execute(&self.pool)
            .await?;

        Ok(())
    }

    async fn load_all(&self) -> Result<Vec<QueueItem>> {
        let rows = sqlx::query(
            r#"
            SELECT id, parent_id, address, description, payload,
                   status, dispatch_count, send_receive_time, age_warning_count
            FROM queue_items
            WHERE queue_name = ?
            ORDER BY rowid
            "#,
        )
        .bind(&self.queue_name)
        .fetch_all(&self.pool)
        .await?;

        let mut items = Vec::with_capacity(rows.len());
        for row in &rows {
            items.push(self.row_to_item(row)?);
        }

        Ok(items)
    }
}
