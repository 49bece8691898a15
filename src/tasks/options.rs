//! Layered task options
//!
//! Every family carries hard-coded defaults. The family `options` block is
//! merged over them and the target `options` block over that, key by key.
//! The merged map is deserialized once into the typed params of the family.

use serde::de::DeserializeOwned;
use serde::Deserialize;
use serde_json::{json, Map, Value};

use crate::app_state::{AppState, StorageServices};
use crate::blob::{BlobProperties, ContainerOptions};
use crate::config::StringOrList;
use crate::error::TaskError;
use crate::queue::{MessageOptions, QueueOptions};
use crate::retry::{RetryFilter, RetryPolicy};
use crate::table::entity::EntityValue;
use crate::table::TableOptions;
use crate::tasks::TaskFamily;

pub type OptionMap = Map<String, Value>;

/// Hard-coded defaults of a family.
pub fn family_defaults(family: TaskFamily) -> OptionMap {
    let common = json!({
        "serviceOptions": [],
        "retryFilter": "ExponentialRetryPolicyFilter",
    });
    let specific = match family {
        TaskFamily::BlobUpload => json!({
            "container": null,
            "containerOptions": {},
            "containerDelete": false,
            "blobProperties": {},
        }),
        TaskFamily::BlobDownload => json!({
            "container": null,
            "containerDelete": false,
            "prefix": null,
            "removePrefix": true,
        }),
        TaskFamily::QueueEnqueue => json!({
            "queue": null,
            "queueOptions": {},
            "messageProperties": {},
            "message": null,
            "messages": [],
        }),
        TaskFamily::QueueDequeue => json!({
            "queue": null,
            "queueOptions": {},
            "numOfMessages": 1,
            "peekOnly": false,
            "visibilityTimeout": 5,
        }),
        TaskFamily::QueueClear => json!({
            "queue": null,
            "queueOptions": {},
        }),
        TaskFamily::TableQuery => json!({
            "table": null,
            "pkPrefix": null,
            "rkPrefix": null,
            "where": [],
            "select": [],
            "top": -1,
            "raw": false,
        }),
        TaskFamily::TableEntities(_) => json!({
            "table": null,
            "tableOptions": {},
            "tableDelete": false,
            "entity": null,
            "entities": [],
        }),
    };

    let mut defaults = OptionMap::new();
    for layer in [common, specific] {
        if let Value::Object(map) = layer {
            defaults.extend(map);
        }
    }
    defaults
}

/// Merges `layers` left to right; later layers win per key.
pub fn merge_layers<'a>(layers: impl IntoIterator<Item = &'a OptionMap>) -> OptionMap {
    let mut merged = OptionMap::new();
    for layer in layers {
        for (key, value) in layer {
            merged.insert(key.clone(), value.clone());
        }
    }
    merged
}

pub fn parse_params<T: DeserializeOwned>(options: &OptionMap) -> Result<T, TaskError> {
    Ok(serde_json::from_value(Value::Object(options.clone()))?)
}

/// Returns the value of a required name parameter, rejecting empty strings.
pub fn required<'a>(value: &'a Option<String>, name: &'static str) -> Result<&'a str, TaskError> {
    value
        .as_deref()
        .filter(|v| !v.is_empty())
        .ok_or(TaskError::MissingParameter(name))
}

/// Entity records given either as one object or as a list of objects.
#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(untagged)]
pub enum RecordOrList {
    Many(Vec<Value>),
    One(Value),
}

impl Default for RecordOrList {
    fn default() -> Self {
        RecordOrList::Many(Vec::new())
    }
}

impl RecordOrList {
    /// The records in order; a lone `null` means none.
    pub fn to_vec(&self) -> Vec<Value> {
        match self {
            RecordOrList::Many(records) => records.clone(),
            RecordOrList::One(Value::Null) => Vec::new(),
            RecordOrList::One(record) => vec![record.clone()],
        }
    }
}

/// Options shared by every family.
#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ServiceParams {
    pub service_options: StringOrList,
    pub retry_filter: String,
}

impl ServiceParams {
    pub fn retry_policy(&self) -> Result<RetryPolicy, TaskError> {
        Ok(RetryPolicy::new(self.retry_filter.parse::<RetryFilter>()?))
    }

    /// Resolves the connection and wraps its services in the retry policy.
    pub fn connect(&self, state: &AppState) -> Result<StorageServices, TaskError> {
        let policy = self.retry_policy()?;
        let settings = state.connection(&self.service_options.clone().into_vec())?;
        log::debug!("Connecting with {:?}", settings);
        Ok(state.services_for(&settings)?.with_retry(policy))
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct BlobUploadParams {
    #[serde(flatten)]
    pub service: ServiceParams,
    pub container: Option<String>,
    pub container_options: ContainerOptions,
    pub container_delete: bool,
    pub blob_properties: BlobProperties,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct BlobDownloadParams {
    #[serde(flatten)]
    pub service: ServiceParams,
    pub container: Option<String>,
    pub container_delete: bool,
    pub prefix: Option<String>,
    pub remove_prefix: bool,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct EnqueueParams {
    #[serde(flatten)]
    pub service: ServiceParams,
    pub queue: Option<String>,
    pub queue_options: QueueOptions,
    pub message_properties: MessageOptions,
    pub message: Option<Value>,
    pub messages: Vec<Value>,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DequeueParams {
    #[serde(flatten)]
    pub service: ServiceParams,
    pub queue: Option<String>,
    pub queue_options: QueueOptions,
    pub num_of_messages: usize,
    pub peek_only: bool,
    /// Seconds a leased message stays invisible
    pub visibility_timeout: u64,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ClearParams {
    #[serde(flatten)]
    pub service: ServiceParams,
    pub queue: Option<String>,
    pub queue_options: QueueOptions,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TableParams {
    #[serde(flatten)]
    pub service: ServiceParams,
    pub table: Option<String>,
    pub table_options: TableOptions,
    pub table_delete: bool,
    pub entity: Option<Value>,
    pub entities: RecordOrList,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct QueryParams {
    #[serde(flatten)]
    pub service: ServiceParams,
    pub table: Option<String>,
    pub pk_prefix: Option<String>,
    pub rk_prefix: Option<String>,
    /// `[template, param, ...]` lists
    #[serde(rename = "where")]
    pub where_clauses: Vec<Vec<EntityValue>>,
    pub select: Vec<String>,
    pub top: i64,
    pub raw: bool,
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::table::batch::TableOperation;

    fn map(value: Value) -> OptionMap {
        match value {
            Value::Object(map) => map,
            _ => panic!("expected an object"),
        }
    }

    #[test]
    fn test_target_options_win_over_family_options() {
        let defaults = family_defaults(TaskFamily::QueueDequeue);
        let family = map(json!({ "queue": "jobs", "numOfMessages": 4, "peekOnly": true }));
        let target = map(json!({ "numOfMessages": 10 }));

        let merged = merge_layers([&defaults, &family, &target]);
        let params: DequeueParams = parse_params(&merged).unwrap();
        assert_eq!(params.queue.as_deref(), Some("jobs"));
        assert_eq!(params.num_of_messages, 10);
        assert!(params.peek_only);
        assert_eq!(params.visibility_timeout, 5);
        assert_eq!(params.service.retry_filter, "ExponentialRetryPolicyFilter");
    }

    #[test]
    fn test_defaults_alone_deserialize_for_every_family() {
        let defaults = family_defaults(TaskFamily::TableEntities(TableOperation::Merge));
        let params: TableParams = parse_params(&defaults).unwrap();
        assert!(params.table.is_none());
        assert!(!params.table_delete);

        let query: QueryParams = parse_params(&family_defaults(TaskFamily::TableQuery)).unwrap();
        assert_eq!(query.top, -1);
        assert!(query.where_clauses.is_empty());

        let download: BlobDownloadParams = parse_params(&family_defaults(TaskFamily::BlobDownload)).unwrap();
        assert!(download.remove_prefix);

        let _: BlobUploadParams = parse_params(&family_defaults(TaskFamily::BlobUpload)).unwrap();
        let _: EnqueueParams = parse_params(&family_defaults(TaskFamily::QueueEnqueue)).unwrap();
        let _: ClearParams = parse_params(&family_defaults(TaskFamily::QueueClear)).unwrap();
    }

    #[test]
    fn test_service_options_string_or_list() {
        let defaults = family_defaults(TaskFamily::QueueClear);
        let single = map(json!({ "serviceOptions": "Backend=mock;" }));
        let params: ClearParams = parse_params(&merge_layers([&defaults, &single])).unwrap();
        assert_eq!(params.service.service_options.into_vec(), vec!["Backend=mock;"]);
    }

    #[test]
    fn test_unknown_retry_filter_rejected() {
        let defaults = family_defaults(TaskFamily::QueueClear);
        let bad = map(json!({ "retryFilter": "RetryForever" }));
        let params: ClearParams = parse_params(&merge_layers([&defaults, &bad])).unwrap();
        assert!(matches!(params.service.retry_policy(), Err(TaskError::InvalidParameter { .. })));
    }

    #[test]
    fn test_entities_accept_one_record_or_a_list() {
        let defaults = family_defaults(TaskFamily::TableEntities(TableOperation::Insert));
        let single = map(json!({
            "entities": { "PartitionKey": "a", "RowKey": "1" },
            "tableOptions": { "metadata": { "owner": "ops" } },
        }));
        let params: TableParams = parse_params(&merge_layers([&defaults, &single])).unwrap();
        assert_eq!(params.entities.to_vec(), vec![json!({ "PartitionKey": "a", "RowKey": "1" })]);
        assert_eq!(params.table_options.metadata["owner"], "ops");

        let none = map(json!({ "entities": null }));
        let params: TableParams = parse_params(&merge_layers([&defaults, &none])).unwrap();
        assert!(params.entities.to_vec().is_empty());

        let list: RecordOrList = serde_json::from_value(json!([{ "RowKey": "1" }, { "RowKey": "2" }])).unwrap();
        assert_eq!(list.to_vec().len(), 2);
    }

    #[test]
    fn test_required_rejects_empty() {
        assert!(matches!(required(&Some(String::new()), "queue"), Err(TaskError::MissingParameter("queue"))));
        assert_eq!(required(&Some("jobs".into()), "queue").unwrap(), "jobs");
    }
}
