//! Partition grouping and batch execution

use std::collections::HashMap;
use std::fmt;
use std::str::FromStr;

use log::debug;

use crate::error::TaskError;
use crate::table::entity::{key_value, transform_entity, Entity, TypedEntity, PARTITION_KEY};
use crate::table::TableService;

/// Largest number of operations the service accepts in one batch.
pub const MAX_BATCH_OPERATIONS: usize = 100;

/// Write operation applied to every entity of a task.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum TableOperation {
    Insert,
    Update,
    InsertOrReplace,
    Merge,
    InsertOrMerge,
    Delete,
}

impl TableOperation {
    /// Past-tense verb used in task summaries.
    pub fn verb(&self) -> &'static str {
        match self {
            TableOperation::Insert => "inserted",
            TableOperation::Update => "updated",
            TableOperation::InsertOrReplace => "inserted or updated",
            TableOperation::Merge => "merged",
            TableOperation::InsertOrMerge => "inserted or merged",
            TableOperation::Delete => "deleted",
        }
    }
}

impl fmt::Display for TableOperation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            TableOperation::Insert => "insert",
            TableOperation::Update => "update",
            TableOperation::InsertOrReplace => "insertOrUpdate",
            TableOperation::Merge => "merge",
            TableOperation::InsertOrMerge => "insertOrMerge",
            TableOperation::Delete => "delete",
        };
        f.write_str(name)
    }
}

impl FromStr for TableOperation {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "insert" => Ok(TableOperation::Insert),
            "update" => Ok(TableOperation::Update),
            "insertorupdate" | "insertorreplace" => Ok(TableOperation::InsertOrReplace),
            "merge" => Ok(TableOperation::Merge),
            "insertormerge" => Ok(TableOperation::InsertOrMerge),
            "delete" => Ok(TableOperation::Delete),
            other => Err(format!("unknown table operation: {}", other)),
        }
    }
}

/// Operations submitted together; all of them apply or none do.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct TableBatch {
    operations: Vec<(TableOperation, TypedEntity)>,
}

impl TableBatch {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add(&mut self, op: TableOperation, entity: TypedEntity) {
        self.operations.push((op, entity));
    }

    pub fn operations(&self) -> &[(TableOperation, TypedEntity)] {
        &self.operations
    }

    pub fn len(&self) -> usize {
        self.operations.len()
    }

    pub fn is_empty(&self) -> bool {
        self.operations.is_empty()
    }
}

/// Splits entities into per-partition batches.
///
/// Groups come out in first-seen partition order and keep the input order
/// inside each group. Entities without a partition key are grouped under the
/// empty key; callers validate keys before grouping.
pub fn group_entities(entities: Vec<Entity>) -> Vec<Vec<Entity>> {
    let mut index: HashMap<String, usize> = HashMap::new();
    let mut groups: Vec<Vec<Entity>> = Vec::new();
    for entity in entities {
        let pk = key_value(&entity, PARTITION_KEY).unwrap_or_default();
        match index.get(&pk) {
            Some(&slot) => groups[slot].push(entity),
            None => {
                index.insert(pk, groups.len());
                groups.push(vec![entity]);
            }
        }
    }
    groups
}

/// Submits one partition group, returning how many entities it covered.
///
/// A single entity goes through `execute_operation`; anything larger is sent
/// as one atomic batch.
pub fn execute_batch(
    service: &dyn TableService,
    table: &str,
    op: TableOperation,
    batch: &[Entity],
) -> Result<usize, TaskError> {
    match batch {
        [] => Ok(0),
        [single] => {
            let typed = transform_entity(single)?;
            service.execute_operation(table, op, &typed)?;
            Ok(1)
        }
        many => {
            let mut table_batch = TableBatch::new();
            for entity in many {
                table_batch.add(op, transform_entity(entity)?);
            }
            debug!("Submitting batch of {} {} operations to table {}", table_batch.len(), op, table);
            service.execute_batch(table, &table_batch)?;
            Ok(many.len())
        }
    }
}
