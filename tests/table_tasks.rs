use std::sync::{Arc, Mutex};

use serde_json::Value;

use storage_tasks::app_state::{AppState, StorageServices};
use storage_tasks::blob::mock_store::MockBlobStore;
use storage_tasks::config::AppConfig;
use storage_tasks::error::{ServiceError, TaskError};
use storage_tasks::queue::mock_store::MockQueueStore;
use storage_tasks::table::entity::EntityProperty;
use storage_tasks::table::mock_store::MockTableStore;
use storage_tasks::tasks::actions::Action;
use storage_tasks::tasks::{TaskFile, TaskRunner};

fn setup(yaml: &str) -> (TaskRunner, Arc<MockTableStore>, tempfile::TempDir) {
    let table = Arc::new(MockTableStore::new());
    let services = StorageServices {
        blob: Arc::new(MockBlobStore::new()),
        queue: Arc::new(MockQueueStore::new()),
        table: table.clone(),
    };
    let dir = tempfile::tempdir().unwrap();
    let runner = TaskRunner::new(
        AppState::with_services(AppConfig::default(), services),
        TaskFile::from_yaml(yaml).unwrap(),
    )
    .with_base_dir(dir.path());
    (runner, table, dir)
}

fn names(tasks: &[&str]) -> Vec<String> {
    tasks.iter().map(|t| t.to_string()).collect()
}

const PEOPLE: &str = r#"
azure-table-insert:
  options:
    table: people
  seed:
    entities:
      - { PartitionKey: a, RowKey: "1", Age: 3 }
      - { PartitionKey: b, RowKey: "1", Age: 4 }
      - { PartitionKey: a, RowKey: "2", Age: 5 }
      - { PartitionKey: a, RowKey: "3", Age: 6 }
  again:
    options: { tableDelete: true }
    entity: { PartitionKey: a, RowKey: "1", Age: 30 }
  nameless:
    options: { table: "" }
    entity: { PartitionKey: a, RowKey: "1" }
azure-table-merge:
  options:
    table: people
  birthday:
    entity: { PartitionKey: a, RowKey: "2", Age: 6, Party: true }
azure-table-update:
  options:
    table: people
  birthday:
    entity: { PartitionKey: a, RowKey: "2", Age: 7 }
  missing:
    entity: { PartitionKey: z, RowKey: "9", Age: 7 }
azure-table-delete:
  options:
    table: people
  partition-a:
    entities:
      - { PartitionKey: a, RowKey: "1" }
      - { PartitionKey: a, RowKey: "2" }
"#;

#[tokio::test]
async fn test_insert_batches_per_partition() {
    let (runner, table, _dir) = setup(PEOPLE);
    let reports = runner.run(&names(&["azure-table-insert:seed"])).await.unwrap();

    assert_eq!(reports[0].1.processed, 4);
    assert_eq!(table.entity_count("people"), 4);
    // partition a goes as one batch, partition b as a single operation
    assert_eq!(table.batch_calls(), 1);
    assert_eq!(table.operation_calls(), 1);
    assert_eq!(
        table.get_entity("people", "a", "3").unwrap().property("Age"),
        Some(EntityProperty::Int32(6))
    );
}

#[tokio::test]
async fn test_missing_table_fails_before_any_call() {
    let (runner, table, _dir) = setup(PEOPLE);
    let err = runner.run(&names(&["azure-table-insert:nameless"])).await.unwrap_err();

    assert!(matches!(err, TaskError::MissingParameter("table")));
    assert_eq!(err.to_string(), "Please provide at least a table parameter");
    assert_eq!(table.operation_calls(), 0);
    assert_eq!(table.entity_count("people"), 0);
}

#[tokio::test]
async fn test_table_delete_recreates_table() {
    let (runner, table, _dir) = setup(PEOPLE);
    runner
        .run(&names(&["azure-table-insert:seed", "azure-table-insert:again"]))
        .await
        .unwrap();

    assert_eq!(table.entity_count("people"), 1);
    assert_eq!(
        table.get_entity("people", "a", "1").unwrap().property("Age"),
        Some(EntityProperty::Int32(30))
    );
}

#[tokio::test]
async fn test_insert_conflict_halts_sequence() {
    let (runner, table, _dir) = setup(PEOPLE);
    let err = runner
        .run(&names(&["azure-table-insert:seed", "azure-table-insert:seed"]))
        .await
        .unwrap_err();

    assert!(matches!(err, TaskError::Service(ServiceError::Conflict(_))));
    assert_eq!(table.entity_count("people"), 4);
}

#[tokio::test]
async fn test_merge_keeps_and_update_replaces() {
    let (runner, table, _dir) = setup(PEOPLE);
    runner
        .run(&names(&["azure-table-insert:seed", "azure-table-merge:birthday"]))
        .await
        .unwrap();
    let merged = table.get_entity("people", "a", "2").unwrap();
    assert_eq!(merged.property("Party"), Some(EntityProperty::Boolean(true)));
    assert_eq!(merged.property("Age"), Some(EntityProperty::Int32(6)));

    runner.run(&names(&["azure-table-update:birthday"])).await.unwrap();
    let updated = table.get_entity("people", "a", "2").unwrap();
    assert_eq!(updated.property("Party"), None);
    assert_eq!(updated.property("Age"), Some(EntityProperty::Int32(7)));

    let err = runner.run(&names(&["azure-table-update:missing"])).await.unwrap_err();
    assert!(matches!(err, TaskError::Service(ServiceError::NotFound(_))));
}

#[tokio::test]
async fn test_delete_partition_group() {
    let (runner, table, _dir) = setup(PEOPLE);
    runner
        .run(&names(&["azure-table-insert:seed", "azure-table-delete"]))
        .await
        .unwrap();

    assert_eq!(table.entity_count("people"), 2);
    assert!(table.get_entity("people", "a", "3").is_some());
    assert!(table.get_entity("people", "b", "1").is_some());
}

#[tokio::test]
async fn test_entities_from_files() {
    let yaml = r#"
azure-table-insertorupdate:
  options: { table: people }
  files:
    cwd: data
    src: ["*.json"]
"#;
    let (runner, table, dir) = setup(yaml);
    std::fs::create_dir(dir.path().join("data")).unwrap();
    std::fs::write(
        dir.path().join("data").join("people.json"),
        r#"[{"PartitionKey":"f","RowKey":"1","Tags":[1,2,3]},{"PartitionKey":"f","RowKey":"2"}]"#,
    )
    .unwrap();

    let reports = runner.run(&names(&["azure-table-insertorupdate"])).await.unwrap();
    assert_eq!(reports[0].1.processed, 2);
    assert_eq!(
        table.get_entity("people", "f", "1").unwrap().property("Tags"),
        Some(EntityProperty::Binary(vec![1, 2, 3]))
    );
}

const QUERIES: &str = r#"
azure-table-insert:
  options: { table: items }
  seed:
    entities:
      - { PartitionKey: multiple, RowKey: "1", Size: 1, Label: one }
      - { PartitionKey: multiple, RowKey: "2", Size: 2, Label: two }
      - { PartitionKey: multiplea, RowKey: "1", Size: 3, Label: three }
      - { PartitionKey: multiplf, RowKey: "1", Size: 4, Label: four }
azure-table-query:
  options: { table: items }
  prefix:
    dest: out/prefix.json
    options:
      pkPrefix: multiple
  filtered:
    options:
      where:
        - ["Size gt ?", 1]
        - ["Label ne ?", "four"]
      select: [Label]
      top: 1
  raw:
    dest: out/raw.json
    options:
      pkPrefix: multiplf
      raw: true
  missing:
    options: { table: nosuchtable }
"#;

fn read_json(path: &std::path::Path) -> Vec<Value> {
    serde_json::from_str(&std::fs::read_to_string(path).unwrap()).unwrap()
}

#[tokio::test]
async fn test_prefix_query_writes_dest() {
    let (runner, _table, dir) = setup(QUERIES);
    let reports = runner
        .run(&names(&["azure-table-insert:seed", "azure-table-query:prefix"]))
        .await
        .unwrap();
    assert_eq!(reports[1].1.processed, 3);

    let rows = read_json(&dir.path().join("out").join("prefix.json"));
    let keys: Vec<_> = rows
        .iter()
        .map(|r| format!("{}/{}", r["PartitionKey"].as_str().unwrap(), r["RowKey"].as_str().unwrap()))
        .collect();
    assert_eq!(keys, vec!["multiple/1", "multiple/2", "multiplea/1"]);
    assert_eq!(rows[0]["Size"], 1);
}

#[tokio::test]
async fn test_where_select_top_and_actions() {
    let (mut runner, table, _dir) = setup(QUERIES);
    let seen = Arc::new(Mutex::new(Vec::new()));
    let sink = seen.clone();
    runner.register_actions(
        "azure-table-query:filtered",
        vec![Action::sync(move |rows| {
            sink.lock().unwrap().push(rows.clone());
            Ok(())
        })],
    );

    runner
        .run(&names(&["azure-table-insert:seed", "azure-table-query:filtered"]))
        .await
        .unwrap();

    let seen = seen.lock().unwrap();
    let rows = seen[0].as_array().unwrap();
    assert_eq!(rows.len(), 1);
    assert_eq!(rows[0]["Label"], "two");
    assert!(rows[0].get("Size").is_none());
    assert_eq!(rows[0]["PartitionKey"], "multiple");
    assert_eq!(table.query_calls(), 1);
}

#[tokio::test]
async fn test_raw_query_keeps_type_tags() {
    let (runner, _table, dir) = setup(QUERIES);
    runner
        .run(&names(&["azure-table-insert:seed", "azure-table-query:raw"]))
        .await
        .unwrap();

    let rows = read_json(&dir.path().join("out").join("raw.json"));
    assert_eq!(rows.len(), 1);
    assert_eq!(rows[0]["Size"]["$"], "Edm.Int32");
    assert_eq!(rows[0]["Size"]["_"], 4);
    assert_eq!(rows[0]["PartitionKey"]["_"], "multiplf");
    assert!(rows[0][".metadata"]["etag"].as_str().unwrap().starts_with("W/\"datetime'"));
}

#[tokio::test]
async fn test_query_missing_table_fails() {
    let (runner, _table, _dir) = setup(QUERIES);
    let err = runner.run(&names(&["azure-table-query:missing"])).await.unwrap_err();
    assert!(matches!(err, TaskError::Service(ServiceError::NotFound(_))));
}

#[tokio::test]
async fn test_failing_query_action_fails_task() {
    let (mut runner, _table, _dir) = setup(QUERIES);
    runner.register_actions(
        "azure-table-query:prefix",
        vec![Action::sync(|_| Err("cannot process".to_string()))],
    );
    let err = runner
        .run(&names(&["azure-table-insert:seed", "azure-table-query:prefix"]))
        .await
        .unwrap_err();
    assert!(matches!(err, TaskError::Action(_)));
}

#[tokio::test]
async fn test_transient_failures_follow_retry_filter() {
    let yaml = r#"
azure-table-insert:
  options: { table: people }
  retried:
    entity: { PartitionKey: a, RowKey: "1" }
  unretried:
    options: { retryFilter: NoRetryPolicyFilter }
    entity: { PartitionKey: a, RowKey: "2" }
"#;
    let (runner, table, _dir) = setup(yaml);
    table.inject_failure(ServiceError::Transient("server busy".into()));
    runner.run(&names(&["azure-table-insert:retried"])).await.unwrap();
    assert_eq!(table.entity_count("people"), 1);

    table.inject_failure(ServiceError::Transient("server busy".into()));
    let err = runner.run(&names(&["azure-table-insert:unretried"])).await.unwrap_err();
    assert!(matches!(err, TaskError::Service(ServiceError::Transient(_))));
}

const STAGED: &str = r#"
azure-table-insert:
  options:
    table: staged
    tableOptions:
      metadata: { owner: ops }
  existing:
    entities: { PartitionKey: m, RowKey: "1" }
  three-partitions:
    entities:
      - { PartitionKey: k, RowKey: "1" }
      - { PartitionKey: k, RowKey: "2" }
      - { PartitionKey: m, RowKey: "2" }
      - { PartitionKey: m, RowKey: "1" }
      - { PartitionKey: z, RowKey: "1" }
      - { PartitionKey: z, RowKey: "2" }
"#;

#[tokio::test]
async fn test_failing_batch_stops_later_batches() {
    let (runner, table, _dir) = setup(STAGED);
    runner.run(&names(&["azure-table-insert:existing"])).await.unwrap();
    assert_eq!(table.operation_calls(), 1);

    let err = runner
        .run(&names(&["azure-table-insert:three-partitions"]))
        .await
        .unwrap_err();
    assert!(matches!(err, TaskError::Service(ServiceError::Conflict(_))));

    // partition k landed, m rolled back as a whole, z was never sent
    assert!(table.get_entity("staged", "k", "1").is_some());
    assert!(table.get_entity("staged", "k", "2").is_some());
    assert!(table.get_entity("staged", "m", "2").is_none());
    assert!(table.get_entity("staged", "z", "1").is_none());
    assert_eq!(table.entity_count("staged"), 3);
    assert_eq!(table.batch_calls(), 2);
    assert_eq!(table.operation_calls(), 1);
}

#[tokio::test]
async fn test_table_options_reach_the_service() {
    let (runner, table, _dir) = setup(STAGED);
    runner.run(&names(&["azure-table-insert:existing"])).await.unwrap();
    assert_eq!(table.table_metadata("staged").unwrap()["owner"], "ops");
    assert_eq!(table.entity_count("staged"), 1);
}
