//! SQLite implementation of QueueService trait

use std::path::Path;
use std::sync::{Mutex, MutexGuard};

use chrono::{DateTime, Duration, Utc};
use log::info;
use rusqlite::{params, Connection, OptionalExtension, Row};

use crate::error::{ServiceError, ServiceResult};
use crate::queue::{
    check_pop_receipt, queue_not_found, validate_message_count, validate_queue_name, MessageOptions, QueueMessage,
    QueueOptions, QueueService,
};

const SCHEMA: &str = "
    CREATE TABLE IF NOT EXISTS storage_queues (
        name TEXT PRIMARY KEY,
        metadata TEXT NOT NULL
    );
    CREATE TABLE IF NOT EXISTS queue_messages (
        seq INTEGER PRIMARY KEY AUTOINCREMENT,
        queue_name TEXT NOT NULL,
        message_id TEXT NOT NULL UNIQUE,
        pop_receipt TEXT,
        message_text TEXT NOT NULL,
        insertion_time INTEGER NOT NULL,
        expiration_time INTEGER NOT NULL,
        time_next_visible INTEGER NOT NULL,
        dequeue_count INTEGER NOT NULL
    );
";

const MESSAGE_COLUMNS: &str = "message_id, pop_receipt, message_text, insertion_time, expiration_time, \
                               time_next_visible, dequeue_count";

/// Queue service persisted in a SQLite database; times are stored in milliseconds
pub struct SqliteQueueStore {
    conn: Mutex<Connection>,
}

impl SqliteQueueStore {
    /// Open (or create) the database file at `path`
    pub fn open(path: &Path) -> ServiceResult<Self> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        info!("Opening queue database at {}", path.display());
        Self::init(Connection::open(path)?)
    }

    pub fn in_memory() -> ServiceResult<Self> {
        Self::init(Connection::open_in_memory()?)
    }

    fn init(conn: Connection) -> ServiceResult<Self> {
        conn.busy_timeout(std::time::Duration::from_secs(5))?;
        conn.execute_batch(SCHEMA)?;
        Ok(Self { conn: Mutex::new(conn) })
    }

    fn lock(&self) -> ServiceResult<MutexGuard<'_, Connection>> {
        self.conn
            .lock()
            .map_err(|_| ServiceError::Backend("queue database lock poisoned".to_string()))
    }
}

fn from_millis(ms: i64) -> rusqlite::Result<DateTime<Utc>> {
    DateTime::from_timestamp_millis(ms).ok_or(rusqlite::Error::IntegralValueOutOfRange(0, ms))
}

fn read_message(row: &Row<'_>) -> rusqlite::Result<QueueMessage> {
    Ok(QueueMessage {
        message_id: row.get(0)?,
        pop_receipt: row.get(1)?,
        message_text: row.get(2)?,
        insertion_time: from_millis(row.get(3)?)?,
        expiration_time: from_millis(row.get(4)?)?,
        time_next_visible: from_millis(row.get(5)?)?,
        dequeue_count: row.get(6)?,
    })
}

fn require_queue(conn: &Connection, queue: &str) -> ServiceResult<()> {
    let found: Option<String> = conn
        .query_row("SELECT name FROM storage_queues WHERE name = ?1", params![queue], |row| row.get(0))
        .optional()?;
    found.map(|_| ()).ok_or_else(|| queue_not_found(queue))
}

fn purge_expired(conn: &Connection, queue: &str, now: DateTime<Utc>) -> ServiceResult<()> {
    conn.execute(
        "DELETE FROM queue_messages WHERE queue_name = ?1 AND expiration_time <= ?2",
        params![queue, now.timestamp_millis()],
    )?;
    Ok(())
}

fn visible_messages(conn: &Connection, queue: &str, count: usize, now: DateTime<Utc>) -> ServiceResult<Vec<QueueMessage>> {
    let mut stmt = conn.prepare(&format!(
        "SELECT {} FROM queue_messages
         WHERE queue_name = ?1 AND time_next_visible <= ?2 AND expiration_time > ?2
         ORDER BY seq LIMIT ?3",
        MESSAGE_COLUMNS
    ))?;
    let rows = stmt.query_map(params![queue, now.timestamp_millis(), count as i64], read_message)?;
    let mut messages = Vec::new();
    for row in rows {
        messages.push(row?);
    }
    Ok(messages)
}

impl QueueService for SqliteQueueStore {
    fn create_queue_if_not_exists(&self, queue: &str, options: &QueueOptions) -> ServiceResult<bool> {
        validate_queue_name(queue)?;
        let metadata = serde_json::to_string(&options.metadata)?;
        let conn = self.lock()?;
        let inserted = conn.execute(
            "INSERT OR IGNORE INTO storage_queues (name, metadata) VALUES (?1, ?2)",
            params![queue, metadata],
        )?;
        Ok(inserted > 0)
    }

    fn delete_queue_if_exists(&self, queue: &str) -> ServiceResult<bool> {
        let mut conn = self.lock()?;
        let tx = conn.transaction()?;
        tx.execute("DELETE FROM queue_messages WHERE queue_name = ?1", params![queue])?;
        let deleted = tx.execute("DELETE FROM storage_queues WHERE name = ?1", params![queue])?;
        tx.commit()?;
        Ok(deleted > 0)
    }

    fn create_message(&self, queue: &str, text: &str, options: &MessageOptions) -> ServiceResult<QueueMessage> {
        let conn = self.lock()?;
        require_queue(&conn, queue)?;
        let message = QueueMessage::new(text, options, Utc::now())?;
        conn.execute(
            &format!("INSERT INTO queue_messages (queue_name, {}) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8)", MESSAGE_COLUMNS),
            params![
                queue,
                message.message_id,
                message.pop_receipt,
                message.message_text,
                message.insertion_time.timestamp_millis(),
                message.expiration_time.timestamp_millis(),
                message.time_next_visible.timestamp_millis(),
                message.dequeue_count,
            ],
        )?;
        Ok(message)
    }

    fn get_messages(&self, queue: &str, count: usize, visibility_timeout: Duration) -> ServiceResult<Vec<QueueMessage>> {
        validate_message_count(count)?;
        let mut conn = self.lock()?;
        let tx = conn.transaction()?;
        require_queue(&tx, queue)?;

        let now = Utc::now();
        purge_expired(&tx, queue, now)?;
        let mut messages = visible_messages(&tx, queue, count, now)?;
        for message in &mut messages {
            message.lease(visibility_timeout, now)?;
            tx.execute(
                "UPDATE queue_messages SET pop_receipt = ?1, dequeue_count = ?2, time_next_visible = ?3
                 WHERE message_id = ?4",
                params![
                    message.pop_receipt,
                    message.dequeue_count,
                    message.time_next_visible.timestamp_millis(),
                    message.message_id,
                ],
            )?;
        }
        tx.commit()?;
        Ok(messages)
    }

    fn peek_messages(&self, queue: &str, count: usize) -> ServiceResult<Vec<QueueMessage>> {
        validate_message_count(count)?;
        let conn = self.lock()?;
        require_queue(&conn, queue)?;
        let messages = visible_messages(&conn, queue, count, Utc::now())?;
        Ok(messages.iter().map(QueueMessage::peeked).collect())
    }

    fn delete_message(&self, queue: &str, message_id: &str, pop_receipt: &str) -> ServiceResult<()> {
        let conn = self.lock()?;
        require_queue(&conn, queue)?;
        let stored = conn
            .query_row(
                &format!("SELECT {} FROM queue_messages WHERE queue_name = ?1 AND message_id = ?2", MESSAGE_COLUMNS),
                params![queue, message_id],
                read_message,
            )
            .optional()?
            .ok_or_else(|| ServiceError::NotFound(format!("message {} does not exist", message_id)))?;
        check_pop_receipt(&stored, pop_receipt)?;
        conn.execute("DELETE FROM queue_messages WHERE message_id = ?1", params![message_id])?;
        Ok(())
    }

    fn clear_messages(&self, queue: &str) -> ServiceResult<()> {
        let conn = self.lock()?;
        require_queue(&conn, queue)?;
        conn.execute("DELETE FROM queue_messages WHERE queue_name = ?1", params![queue])?;
        Ok(())
    }

    fn approximate_message_count(&self, queue: &str) -> ServiceResult<usize> {
        let conn = self.lock()?;
        require_queue(&conn, queue)?;
        let count: i64 = conn.query_row(
            "SELECT COUNT(*) FROM queue_messages WHERE queue_name = ?1 AND expiration_time > ?2",
            params![queue, Utc::now().timestamp_millis()],
            |row| row.get(0),
        )?;
        Ok(count as usize)
    }
}
