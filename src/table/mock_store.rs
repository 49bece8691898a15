//! Mock implementation of TableService trait for testing

use std::collections::{BTreeMap, HashMap};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Mutex, MutexGuard};

use crate::error::{InjectedFailures, ServiceError, ServiceResult};
use crate::table::batch::{TableBatch, TableOperation};
use crate::table::entity::TypedEntity;
use crate::table::query::TableQuery;
use crate::table::{
    evaluate_query, resolve_operation, table_not_found, validate_batch, validate_table_name, TableOptions, TableService,
};

type Rows = BTreeMap<(String, String), TypedEntity>;

/// In-memory table service
#[derive(Default)]
pub struct MockTableStore {
    tables: Mutex<HashMap<String, Rows>>,
    options: Mutex<HashMap<String, TableOptions>>,
    failures: InjectedFailures,
    operation_calls: AtomicUsize,
    batch_calls: AtomicUsize,
    query_calls: AtomicUsize,
}

impl MockTableStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Make the next remote call fail with `error`
    pub fn inject_failure(&self, error: ServiceError) {
        self.failures.push(error);
    }

    /// Number of `execute_operation` calls received
    pub fn operation_calls(&self) -> usize {
        self.operation_calls.load(Ordering::SeqCst)
    }

    /// Number of `execute_batch` calls received
    pub fn batch_calls(&self) -> usize {
        self.batch_calls.load(Ordering::SeqCst)
    }

    pub fn query_calls(&self) -> usize {
        self.query_calls.load(Ordering::SeqCst)
    }

    /// Get the number of entities stored in a table
    pub fn entity_count(&self, table: &str) -> usize {
        self.lock().map(|t| t.get(table).map_or(0, BTreeMap::len)).unwrap_or(0)
    }

    /// Fetch one stored entity, bypassing the query path
    pub fn get_entity(&self, table: &str, partition_key: &str, row_key: &str) -> Option<TypedEntity> {
        let tables = self.lock().ok()?;
        tables
            .get(table)?
            .get(&(partition_key.to_string(), row_key.to_string()))
            .cloned()
    }

    /// Metadata the table was created with
    pub fn table_metadata(&self, table: &str) -> Option<HashMap<String, String>> {
        self.options.lock().ok()?.get(table).map(|o| o.metadata.clone())
    }

    /// Clear all data from the store (useful for test cleanup)
    pub fn clear(&self) {
        if let Ok(mut tables) = self.lock() {
            tables.clear();
        }
        if let Ok(mut options) = self.options.lock() {
            options.clear();
        }
    }

    fn lock(&self) -> ServiceResult<MutexGuard<'_, HashMap<String, Rows>>> {
        self.tables
            .lock()
            .map_err(|_| ServiceError::Backend("table store lock poisoned".to_string()))
    }
}

fn apply(rows: &mut Rows, op: TableOperation, entity: &TypedEntity) -> ServiceResult<()> {
    let key = (entity.partition_key.clone(), entity.row_key.clone());
    match resolve_operation(op, rows.get(&key), entity)? {
        Some(stored) => {
            rows.insert(key, stored);
        }
        None => {
            rows.remove(&key);
        }
    }
    Ok(())
}

impl TableService for MockTableStore {
    fn create_table_if_not_exists(&self, table: &str, options: &TableOptions) -> ServiceResult<bool> {
        self.failures.check()?;
        validate_table_name(table)?;
        let mut tables = self.lock()?;
        if tables.contains_key(table) {
            return Ok(false);
        }
        tables.insert(table.to_string(), Rows::new());
        self.options
            .lock()
            .map_err(|_| ServiceError::Backend("table store lock poisoned".to_string()))?
            .insert(table.to_string(), options.clone());
        Ok(true)
    }

    fn delete_table_if_exists(&self, table: &str) -> ServiceResult<bool> {
        self.failures.check()?;
        Ok(self.lock()?.remove(table).is_some())
    }

    fn table_exists(&self, table: &str) -> ServiceResult<bool> {
        self.failures.check()?;
        Ok(self.lock()?.contains_key(table))
    }

    fn execute_operation(&self, table: &str, op: TableOperation, entity: &TypedEntity) -> ServiceResult<()> {
        self.operation_calls.fetch_add(1, Ordering::SeqCst);
        self.failures.check()?;
        let mut tables = self.lock()?;
        let rows = tables.get_mut(table).ok_or_else(|| table_not_found(table))?;
        apply(rows, op, entity)
    }

    fn execute_batch(&self, table: &str, batch: &TableBatch) -> ServiceResult<()> {
        self.batch_calls.fetch_add(1, Ordering::SeqCst);
        self.failures.check()?;
        validate_batch(batch)?;
        let mut tables = self.lock()?;
        let rows = tables.get_mut(table).ok_or_else(|| table_not_found(table))?;

        // Work on a copy so a failing operation leaves the table untouched
        let mut staged = rows.clone();
        for (op, entity) in batch.operations() {
            apply(&mut staged, *op, entity)?;
        }
        *rows = staged;
        Ok(())
    }

    fn query_entities(&self, table: &str, query: &TableQuery) -> ServiceResult<Vec<TypedEntity>> {
        self.query_calls.fetch_add(1, Ordering::SeqCst);
        self.failures.check()?;
        let tables = self.lock()?;
        let rows = tables.get(table).ok_or_else(|| table_not_found(table))?;
        evaluate_query(rows.values().cloned(), query)
    }
}
