//! SQLite implementation of TableService trait

use std::collections::BTreeMap;
use std::path::Path;
use std::sync::{Mutex, MutexGuard};
use std::time::Duration;

use log::{debug, info};
use rusqlite::{params, Connection, OptionalExtension};
use serde_json::{Map, Value};

use crate::error::{ServiceError, ServiceResult};
use crate::table::batch::{TableBatch, TableOperation};
use crate::table::entity::{format_datetime, parse_datetime, EntityProperty, TypedEntity};
use crate::table::query::TableQuery;
use crate::table::{
    evaluate_query, resolve_operation, table_not_found, validate_batch, validate_table_name, TableOptions, TableService,
};

const SCHEMA: &str = "
    CREATE TABLE IF NOT EXISTS storage_tables (
        name TEXT PRIMARY KEY,
        metadata TEXT NOT NULL DEFAULT '{}'
    );
    CREATE TABLE IF NOT EXISTS table_entities (
        table_name TEXT NOT NULL,
        partition_key TEXT NOT NULL,
        row_key TEXT NOT NULL,
        properties TEXT NOT NULL,
        timestamp TEXT,
        etag TEXT,
        PRIMARY KEY (table_name, partition_key, row_key)
    );
";

/// Table service persisted in a SQLite database
pub struct SqliteTableStore {
    conn: Mutex<Connection>,
}

impl SqliteTableStore {
    /// Open (or create) the database file at `path`
    pub fn open(path: &Path) -> ServiceResult<Self> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        info!("Opening table database at {}", path.display());
        Self::init(Connection::open(path)?)
    }

    /// Private in-memory database, used by tests
    pub fn in_memory() -> ServiceResult<Self> {
        Self::init(Connection::open_in_memory()?)
    }

    fn init(conn: Connection) -> ServiceResult<Self> {
        conn.busy_timeout(Duration::from_secs(5))?;
        conn.execute_batch(SCHEMA)?;
        Ok(Self { conn: Mutex::new(conn) })
    }

    fn lock(&self) -> ServiceResult<MutexGuard<'_, Connection>> {
        self.conn
            .lock()
            .map_err(|_| ServiceError::Backend("table database lock poisoned".to_string()))
    }
}

fn exists(conn: &Connection, table: &str) -> ServiceResult<bool> {
    let count: i64 = conn.query_row(
        "SELECT COUNT(*) FROM storage_tables WHERE name = ?1",
        params![table],
        |row| row.get(0),
    )?;
    Ok(count > 0)
}

fn require_table(conn: &Connection, table: &str) -> ServiceResult<()> {
    if exists(conn, table)? {
        Ok(())
    } else {
        Err(table_not_found(table))
    }
}

fn encode_properties(entity: &TypedEntity) -> String {
    let map: Map<String, Value> = entity
        .properties
        .iter()
        .map(|(name, property)| (name.clone(), property.to_raw_json()))
        .collect();
    Value::Object(map).to_string()
}

fn decode_row(
    partition_key: String,
    row_key: String,
    properties: &str,
    timestamp: Option<String>,
    etag: Option<String>,
) -> ServiceResult<TypedEntity> {
    let raw: BTreeMap<String, Value> = serde_json::from_str(properties)?;
    let mut entity = TypedEntity::new(partition_key, row_key);
    for (name, value) in raw {
        let property = EntityProperty::from_raw_json(&value)
            .ok_or_else(|| ServiceError::Backend(format!("corrupt stored property {}", name)))?;
        entity.properties.insert(name, property);
    }
    entity.timestamp = timestamp.as_deref().and_then(parse_datetime);
    entity.etag = etag;
    Ok(entity)
}

fn load(conn: &Connection, table: &str, pk: &str, rk: &str) -> ServiceResult<Option<TypedEntity>> {
    let row = conn
        .query_row(
            "SELECT properties, timestamp, etag FROM table_entities
             WHERE table_name = ?1 AND partition_key = ?2 AND row_key = ?3",
            params![table, pk, rk],
            |row| Ok((row.get::<_, String>(0)?, row.get(1)?, row.get(2)?)),
        )
        .optional()?;
    row.map(|(properties, timestamp, etag)| decode_row(pk.to_string(), rk.to_string(), &properties, timestamp, etag))
        .transpose()
}

fn apply(conn: &Connection, table: &str, op: TableOperation, entity: &TypedEntity) -> ServiceResult<()> {
    let existing = load(conn, table, &entity.partition_key, &entity.row_key)?;
    match resolve_operation(op, existing.as_ref(), entity)? {
        Some(stored) => {
            conn.execute(
                "INSERT OR REPLACE INTO table_entities
                 (table_name, partition_key, row_key, properties, timestamp, etag)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6)",
                params![
                    table,
                    stored.partition_key,
                    stored.row_key,
                    encode_properties(&stored),
                    stored.timestamp.as_ref().map(format_datetime),
                    stored.etag,
                ],
            )?;
        }
        None => {
            conn.execute(
                "DELETE FROM table_entities WHERE table_name = ?1 AND partition_key = ?2 AND row_key = ?3",
                params![table, entity.partition_key, entity.row_key],
            )?;
        }
    }
    Ok(())
}

impl TableService for SqliteTableStore {
    fn create_table_if_not_exists(&self, table: &str, options: &TableOptions) -> ServiceResult<bool> {
        validate_table_name(table)?;
        let metadata = serde_json::to_string(&options.metadata)?;
        let conn = self.lock()?;
        let inserted = conn.execute(
            "INSERT OR IGNORE INTO storage_tables (name, metadata) VALUES (?1, ?2)",
            params![table, metadata],
        )?;
        Ok(inserted > 0)
    }

    fn delete_table_if_exists(&self, table: &str) -> ServiceResult<bool> {
        let mut conn = self.lock()?;
        let tx = conn.transaction()?;
        tx.execute("DELETE FROM table_entities WHERE table_name = ?1", params![table])?;
        let deleted = tx.execute("DELETE FROM storage_tables WHERE name = ?1", params![table])?;
        tx.commit()?;
        Ok(deleted > 0)
    }

    fn table_exists(&self, table: &str) -> ServiceResult<bool> {
        let conn = self.lock()?;
        exists(&conn, table)
    }

    fn execute_operation(&self, table: &str, op: TableOperation, entity: &TypedEntity) -> ServiceResult<()> {
        let mut conn = self.lock()?;
        let tx = conn.transaction()?;
        require_table(&tx, table)?;
        apply(&tx, table, op, entity)?;
        tx.commit()?;
        Ok(())
    }

    fn execute_batch(&self, table: &str, batch: &TableBatch) -> ServiceResult<()> {
        validate_batch(batch)?;
        let mut conn = self.lock()?;
        let tx = conn.transaction()?;
        require_table(&tx, table)?;
        for (op, entity) in batch.operations() {
            apply(&tx, table, *op, entity)?;
        }
        tx.commit()?;
        debug!("Committed batch of {} operations on table {}", batch.len(), table);
        Ok(())
    }

    fn query_entities(&self, table: &str, query: &TableQuery) -> ServiceResult<Vec<TypedEntity>> {
        let conn = self.lock()?;
        require_table(&conn, table)?;
        let mut stmt = conn.prepare(
            "SELECT partition_key, row_key, properties, timestamp, etag FROM table_entities WHERE table_name = ?1",
        )?;
        let rows = stmt.query_map(params![table], |row| {
            Ok((
                row.get::<_, String>(0)?,
                row.get::<_, String>(1)?,
                row.get::<_, String>(2)?,
                row.get::<_, Option<String>>(3)?,
                row.get::<_, Option<String>>(4)?,
            ))
        })?;

        let mut entities = Vec::new();
        for row in rows {
            let (pk, rk, properties, timestamp, etag) = row?;
            entities.push(decode_row(pk, rk, &properties, timestamp, etag)?);
        }
        evaluate_query(entities, query)
    }
}
