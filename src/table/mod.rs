//! Table Storage Layer Abstraction
//!
//! Entity transformation, query construction and batching live here next to
//! the `TableService` trait and its two backends (in-memory and SQLite).

pub mod batch;
pub mod entity;
pub mod filter;
pub mod mock_store;
pub mod query;
pub mod sqlite_store;


use std::collections::HashMap;

use chrono::Utc;
use serde::{Deserialize, Serialize};

use crate::error::{ServiceError, ServiceResult};
use crate::table::batch::{TableBatch, TableOperation, MAX_BATCH_OPERATIONS};
use crate::table::entity::{format_datetime, TypedEntity};
use crate::table::filter::Filter;
use crate::table::query::TableQuery;

/// Options used when the table has to be created.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TableOptions {
    #[serde(default)]
    pub metadata: HashMap<String, String>,
}

/// Trait defining the table service interface
pub trait TableService: Send + Sync {
    /// Create the table, returning true when it did not exist before
    fn create_table_if_not_exists(&self, table: &str, options: &TableOptions) -> ServiceResult<bool>;

    /// Delete the table and its entities, returning true when it existed
    fn delete_table_if_exists(&self, table: &str) -> ServiceResult<bool>;

    fn table_exists(&self, table: &str) -> ServiceResult<bool>;

    /// Apply a single write operation
    fn execute_operation(&self, table: &str, op: TableOperation, entity: &TypedEntity) -> ServiceResult<()>;

    /// Apply every operation of the batch atomically
    fn execute_batch(&self, table: &str, batch: &TableBatch) -> ServiceResult<()>;

    /// Return matching entities ordered by partition key then row key
    fn query_entities(&self, table: &str, query: &TableQuery) -> ServiceResult<Vec<TypedEntity>>;
}

/// Table names are 3-63 alphanumeric characters starting with a letter.
pub fn validate_table_name(table: &str) -> ServiceResult<()> {
    let valid = (3..=63).contains(&table.len())
        && table.starts_with(|c: char| c.is_ascii_alphabetic())
        && table.chars().all(|c| c.is_ascii_alphanumeric());
    if valid {
        Ok(())
    } else {
        Err(ServiceError::BadRequest(format!("invalid table name: {}", table)))
    }
}

pub(crate) fn table_not_found(table: &str) -> ServiceError {
    ServiceError::NotFound(format!("table {} does not exist", table))
}

/// Computes the stored state of one row after `op`.
///
/// `Ok(None)` means the row is removed.
pub fn resolve_operation(
    op: TableOperation,
    existing: Option<&TypedEntity>,
    incoming: &TypedEntity,
) -> ServiceResult<Option<TypedEntity>> {
    let key = || format!("{}/{}", incoming.partition_key, incoming.row_key);
    let resolved = match (op, existing) {
        (TableOperation::Insert, Some(_)) => {
            return Err(ServiceError::Conflict(format!("entity {} already exists", key())))
        }
        (TableOperation::Update | TableOperation::Merge | TableOperation::Delete, None) => {
            return Err(ServiceError::NotFound(format!("entity {} does not exist", key())))
        }
        (TableOperation::Delete, Some(_)) => return Ok(None),
        (TableOperation::Merge | TableOperation::InsertOrMerge, Some(current)) => {
            let mut merged = current.clone();
            merged.properties.extend(incoming.properties.clone());
            merged
        }
        _ => incoming.clone(),
    };
    Ok(Some(stamp(resolved)))
}

/// Sets the service-maintained timestamp and etag.
fn stamp(mut entity: TypedEntity) -> TypedEntity {
    let now = Utc::now();
    entity.timestamp = Some(now);
    entity.etag = None;
    let digest = md5::compute(entity.to_raw_json().to_string());
    entity.etag = Some(format!("W/\"datetime'{}'-{}\"", format_datetime(&now), hex::encode(&digest.0[..8])));
    entity
}

/// Rejects batches the service would refuse as a whole.
pub fn validate_batch(batch: &TableBatch) -> ServiceResult<()> {
    let ops = batch.operations();
    if ops.is_empty() {
        return Err(ServiceError::BadRequest("batch contains no operations".to_string()));
    }
    if ops.len() > MAX_BATCH_OPERATIONS {
        return Err(ServiceError::BadRequest(format!(
            "batch contains {} operations, the limit is {}",
            ops.len(),
            MAX_BATCH_OPERATIONS
        )));
    }
    let partition = &ops[0].1.partition_key;
    let mut seen = std::collections::HashSet::new();
    for (_, entity) in ops {
        if &entity.partition_key != partition {
            return Err(ServiceError::BadRequest(
                "all operations of a batch must share one partition key".to_string(),
            ));
        }
        if !seen.insert(entity.row_key.as_str()) {
            return Err(ServiceError::BadRequest(format!(
                "row key {} appears more than once in the batch",
                entity.row_key
            )));
        }
    }
    Ok(())
}

/// Filters, orders, limits and projects candidate rows.
pub fn evaluate_query<I>(rows: I, query: &TableQuery) -> ServiceResult<Vec<TypedEntity>>
where
    I: IntoIterator<Item = TypedEntity>,
{
    let filter = query
        .filter_string()
        .map_err(|e| ServiceError::BadRequest(e.to_string()))?
        .map(|f| Filter::parse(&f))
        .transpose()?;

    let mut matched: Vec<TypedEntity> = rows
        .into_iter()
        .filter(|row| filter.as_ref().map_or(true, |f| f.matches(row)))
        .collect();
    matched.sort_by(|a, b| (&a.partition_key, &a.row_key).cmp(&(&b.partition_key, &b.row_key)));

    if let Some(top) = query.top_count() {
        matched.truncate(top);
    }
    if !query.selected().is_empty() {
        for row in &mut matched {
            row.properties.retain(|name, _| query.selected().iter().any(|s| s == name));
        }
    }
    Ok(matched)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::table::entity::EntityProperty;
    use crate::table::query::WhereClause;

    fn row(pk: &str, rk: &str, n: i32) -> TypedEntity {
        TypedEntity::new(pk, rk)
            .with_property("n", EntityProperty::Int32(n))
            .with_property("label", EntityProperty::String(format!("{}{}", pk, rk)))
    }

    #[test]
    fn test_table_names() {
        assert!(validate_table_name("people2").is_ok());
        assert!(validate_table_name("2people").is_err());
        assert!(validate_table_name("ab").is_err());
        assert!(validate_table_name("with-dash").is_err());
    }

    #[test]
    fn test_resolve_insert_and_conflict() {
        let incoming = row("p", "r", 1);
        let stored = resolve_operation(TableOperation::Insert, None, &incoming).unwrap().unwrap();
        assert!(stored.timestamp.is_some());
        assert!(stored.etag.is_some());

        let err = resolve_operation(TableOperation::Insert, Some(&stored), &incoming).unwrap_err();
        assert!(matches!(err, ServiceError::Conflict(_)));
    }

    #[test]
    fn test_resolve_merge_keeps_unspecified_properties() {
        let existing = row("p", "r", 1).with_property("kept", EntityProperty::Boolean(true));
        let incoming = TypedEntity::new("p", "r").with_property("n", EntityProperty::Int32(2));

        let merged = resolve_operation(TableOperation::Merge, Some(&existing), &incoming).unwrap().unwrap();
        assert_eq!(merged.properties["n"], EntityProperty::Int32(2));
        assert_eq!(merged.properties["kept"], EntityProperty::Boolean(true));

        let replaced = resolve_operation(TableOperation::InsertOrReplace, Some(&existing), &incoming)
            .unwrap()
            .unwrap();
        assert!(!replaced.properties.contains_key("kept"));
    }

    #[test]
    fn test_resolve_missing_rows() {
        let incoming = row("p", "r", 1);
        for op in [TableOperation::Update, TableOperation::Merge, TableOperation::Delete] {
            assert!(matches!(resolve_operation(op, None, &incoming), Err(ServiceError::NotFound(_))));
        }
        assert_eq!(resolve_operation(TableOperation::Delete, Some(&incoming), &incoming), Ok(None));
        assert!(resolve_operation(TableOperation::InsertOrMerge, None, &incoming).unwrap().is_some());
    }

    #[test]
    fn test_validate_batch() {
        let mut batch = TableBatch::new();
        assert!(validate_batch(&batch).is_err());

        batch.add(TableOperation::Insert, row("p", "1", 1));
        batch.add(TableOperation::Insert, row("p", "2", 2));
        assert!(validate_batch(&batch).is_ok());

        let mut mixed = batch.clone();
        mixed.add(TableOperation::Insert, row("q", "3", 3));
        assert!(validate_batch(&mixed).is_err());

        let mut duplicate = batch.clone();
        duplicate.add(TableOperation::Insert, row("p", "1", 4));
        assert!(validate_batch(&duplicate).is_err());

        let mut oversized = TableBatch::new();
        for i in 0..=MAX_BATCH_OPERATIONS {
            oversized.add(TableOperation::Insert, row("p", &i.to_string(), 0));
        }
        assert!(validate_batch(&oversized).is_err());
    }

    #[test]
    fn test_evaluate_query_orders_limits_and_projects() {
        let rows = vec![row("b", "1", 5), row("a", "2", 7), row("a", "1", 9), row("c", "1", 1)];
        let query = TableQuery::new()
            .where_clause(WhereClause::new("n gt ?", vec![2i64.into()]))
            .top(2)
            .select(["n"]);

        let result = evaluate_query(rows, &query).unwrap();
        let keys: Vec<_> = result.iter().map(|e| format!("{}{}", e.partition_key, e.row_key)).collect();
        assert_eq!(keys, vec!["a1", "a2"]);
        assert!(result.iter().all(|e| !e.properties.contains_key("label")));
    }

    #[test]
    fn test_evaluate_query_bad_filter() {
        let query = TableQuery::new().where_clause(WhereClause::new("n gt", vec![]));
        assert!(matches!(evaluate_query(Vec::<TypedEntity>::new(), &query), Err(ServiceError::BadRequest(_))));
    }
}
