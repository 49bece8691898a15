//! Table entity writes and queries

use std::path::Path;

use log::{debug, info};
use serde_json::Value;

use crate::error::TaskError;
use crate::files::read_sources;
use crate::fs_util::ensure_dir;
use crate::table::batch::{execute_batch, group_entities, TableOperation};
use crate::table::entity::{entity_from_json, entity_to_json, key_value, unwrap_entity, Entity, PARTITION_KEY, ROW_KEY};
use crate::table::query::{build_query, QuerySpec, WhereClause};
use crate::table::{TableOptions, TableService};
use crate::tasks::actions::run_actions;
use crate::tasks::options::{required, QueryParams, TableParams};
use crate::tasks::{TargetConfig, TaskContext, TaskReport};

fn ensure_table(
    service: &dyn TableService,
    table: &str,
    options: &TableOptions,
    delete_first: bool,
) -> Result<(), TaskError> {
    if delete_first && service.delete_table_if_exists(table)? {
        debug!("Table '{}' deleted", table);
    }
    if service.create_table_if_not_exists(table, options)? {
        debug!("Table '{}' created", table);
    }
    Ok(())
}

fn to_entity(value: Value) -> Result<Entity, TaskError> {
    let entity = entity_from_json(value)?;
    key_value(&entity, PARTITION_KEY)?;
    key_value(&entity, ROW_KEY)?;
    Ok(entity)
}

/// Collects the entities of a write task.
///
/// Order: `options.entity`, `options.entities`, target `entities`, target
/// `entity`, then every matched file (one record or an array of records).
pub async fn gather_entities(
    params: &TableParams,
    target: &TargetConfig,
    base_dir: &Path,
) -> Result<Vec<Entity>, TaskError> {
    let mut values: Vec<Value> = Vec::new();
    values.extend(params.entity.clone().filter(|v| !v.is_null()));
    values.extend(params.entities.to_vec());
    values.extend(target.entities.to_vec());
    values.extend(target.entity.clone().filter(|v| !v.is_null()));

    let sources = target.file_sources();
    if !sources.is_empty() {
        for (path, text) in read_sources(&sources, base_dir).await? {
            let parsed: Value = serde_json::from_str(&text).map_err(|source| TaskError::Json {
                path: path.display().to_string(),
                source,
            })?;
            match parsed {
                Value::Array(items) => values.extend(items),
                single => values.push(single),
            }
        }
    }

    values.into_iter().map(to_entity).collect()
}

/// Applies `op` to every gathered entity, one partition group at a time.
pub async fn write_entities(ctx: &TaskContext<'_>, op: TableOperation) -> Result<TaskReport, TaskError> {
    let params: TableParams = ctx.params()?;
    let table = required(&params.table, "table")?;
    let services = params.service.connect(ctx.state)?;
    let service = services.table.as_ref();

    ensure_table(service, table, &params.table_options, params.table_delete)?;
    let entities = gather_entities(&params, ctx.target, ctx.base_dir).await?;

    let groups = group_entities(entities);
    debug!("{} partition group(s) to {} in {}", groups.len(), op, table);
    let mut processed = 0;
    for group in &groups {
        processed += execute_batch(service, table, op, group)?;
    }

    info!("{} entities successfully {} in storage table {}", processed, op.verb(), table);
    Ok(TaskReport::processed(processed))
}

/// Queries a table, optionally saving the result set and running actions over it.
pub async fn query(ctx: &TaskContext<'_>) -> Result<TaskReport, TaskError> {
    let params: QueryParams = ctx.params()?;
    let table = required(&params.table, "table")?;

    let spec = QuerySpec {
        pk_prefix: params.pk_prefix.clone(),
        rk_prefix: params.rk_prefix.clone(),
        where_clauses: params
            .where_clauses
            .iter()
            .cloned()
            .map(WhereClause::from_list)
            .collect::<Result<_, _>>()?,
        select: params.select.clone(),
        top: params.top,
    };
    let table_query = build_query(&spec);
    if let Some(filter) = table_query.filter_string()? {
        debug!("Querying {} with filter {}", table, filter);
    }

    let services = params.service.connect(ctx.state)?;
    let rows = services.table.query_entities(table, &table_query)?;
    let results: Vec<Value> = if params.raw {
        rows.iter().map(|row| row.to_raw_json()).collect()
    } else {
        rows.iter().map(|row| entity_to_json(&unwrap_entity(row))).collect()
    };
    let count = results.len();
    let payload = Value::Array(results);

    if let Some(dest) = &ctx.target.dest {
        let path = ctx.resolve(dest);
        if let Some(parent) = path.parent() {
            ensure_dir(parent).await?;
        }
        tokio::fs::write(&path, payload.to_string())
            .await
            .map_err(|e| TaskError::io(&path, e))?;
        debug!("Query result written to {}", path.display());
    }

    let scheduled = run_actions(&ctx.actions, &payload).await?;
    info!("{} entities successfully queried from storage table {}", count, table);
    Ok(TaskReport {
        processed: count,
        scheduled,
    })
}
