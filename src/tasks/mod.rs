//! Task file model and the task runner
//!
//! A task file maps family names (`azure-table-insert`, ...) to a block of
//! family options plus named targets. The runner executes `family:target`
//! invocations one at a time, in order.

pub mod actions;
pub mod blob_tasks;
pub mod options;
pub mod queue_tasks;
pub mod table_tasks;

use std::collections::{HashMap, VecDeque};
use std::fmt;
use std::fs;
use std::path::{Path, PathBuf};
use std::str::FromStr;

use log::{error, info, warn};
use serde::Deserialize;
use serde_json::Value;
use serde_yaml::Mapping;

use crate::app_state::AppState;
use crate::config::StringOrList;
use crate::error::TaskError;
use crate::files::FileSources;
use crate::table::batch::TableOperation;

use self::actions::Action;
use self::options::{family_defaults, merge_layers, parse_params, OptionMap, RecordOrList};

/// The task families a task file may configure.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum TaskFamily {
    BlobUpload,
    BlobDownload,
    QueueEnqueue,
    QueueDequeue,
    QueueClear,
    TableEntities(TableOperation),
    TableQuery,
}

impl TaskFamily {
    pub const ALL: [TaskFamily; 12] = [
        TaskFamily::BlobUpload,
        TaskFamily::BlobDownload,
        TaskFamily::QueueEnqueue,
        TaskFamily::QueueDequeue,
        TaskFamily::QueueClear,
        TaskFamily::TableEntities(TableOperation::Insert),
        TaskFamily::TableEntities(TableOperation::Update),
        TaskFamily::TableEntities(TableOperation::InsertOrReplace),
        TaskFamily::TableEntities(TableOperation::Merge),
        TaskFamily::TableEntities(TableOperation::InsertOrMerge),
        TaskFamily::TableEntities(TableOperation::Delete),
        TaskFamily::TableQuery,
    ];

    pub fn name(&self) -> &'static str {
        match self {
            TaskFamily::BlobUpload => "azure-blob-upload",
            TaskFamily::BlobDownload => "azure-blob-download",
            TaskFamily::QueueEnqueue => "azure-queue-enqueue",
            TaskFamily::QueueDequeue => "azure-queue-dequeue",
            TaskFamily::QueueClear => "azure-queue-clear",
            TaskFamily::TableEntities(TableOperation::Insert) => "azure-table-insert",
            TaskFamily::TableEntities(TableOperation::Update) => "azure-table-update",
            TaskFamily::TableEntities(TableOperation::InsertOrReplace) => "azure-table-insertorupdate",
            TaskFamily::TableEntities(TableOperation::Merge) => "azure-table-merge",
            TaskFamily::TableEntities(TableOperation::InsertOrMerge) => "azure-table-insertormerge",
            TaskFamily::TableEntities(TableOperation::Delete) => "azure-table-delete",
            TaskFamily::TableQuery => "azure-table-query",
        }
    }
}

impl fmt::Display for TaskFamily {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

impl FromStr for TaskFamily {
    type Err = TaskError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        TaskFamily::ALL
            .iter()
            .copied()
            .find(|family| family.name() == s)
            .ok_or_else(|| TaskError::UnknownTask(s.to_string()))
    }
}

/// Data of one target. Everything except `options` stays on the target and
/// is not layered.
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct TargetConfig {
    pub src: Option<StringOrList>,
    pub dest: Option<String>,
    pub cwd: Option<String>,
    pub expand: bool,
    pub prefix: Option<String>,
    pub entity: Option<Value>,
    pub entities: RecordOrList,
    pub actions: Option<StringOrList>,
    pub options: OptionMap,
}

impl TargetConfig {
    pub fn file_sources(&self) -> FileSources {
        FileSources {
            src: self.src.clone().map(StringOrList::into_vec).unwrap_or_default(),
            cwd: self.cwd.clone(),
            dest: self.dest.clone(),
            expand: self.expand,
        }
    }
}

/// Family options plus its targets, in file order.
#[derive(Debug, Clone, Default)]
pub struct FamilyConfig {
    pub options: OptionMap,
    pub targets: Vec<(String, TargetConfig)>,
}

impl FamilyConfig {
    pub fn target(&self, name: &str) -> Option<&TargetConfig> {
        self.targets.iter().find(|(n, _)| n == name).map(|(_, t)| t)
    }
}

/// A parsed task file.
#[derive(Debug, Clone, Default)]
pub struct TaskFile {
    families: Vec<(String, FamilyConfig)>,
}

impl TaskFile {
    pub fn load(path: &Path) -> Result<Self, TaskError> {
        let text = fs::read_to_string(path).map_err(|e| TaskError::io(path, e))?;
        Self::from_yaml(&text)
    }

    pub fn from_yaml(text: &str) -> Result<Self, TaskError> {
        let root: Mapping = serde_yaml::from_str(text)?;
        let mut families = Vec::new();
        for (key, value) in root {
            let Some(name) = key.as_str() else {
                warn!("Ignoring non-string task name {:?}", key);
                continue;
            };
            let Some(block) = value.as_mapping() else {
                warn!("Ignoring task {} without targets", name);
                continue;
            };

            let mut family = FamilyConfig::default();
            for (target, data) in block {
                let Some(target) = target.as_str() else { continue };
                if target == "options" {
                    family.options = serde_yaml::from_value(data.clone())?;
                } else {
                    family.targets.push((target.to_string(), serde_yaml::from_value(data.clone())?));
                }
            }
            families.push((name.to_string(), family));
        }
        Ok(Self { families })
    }

    pub fn family(&self, name: &str) -> Option<&FamilyConfig> {
        self.families.iter().find(|(n, _)| n == name).map(|(_, f)| f)
    }

    /// `family:target` names for `task`; a bare family expands to all its targets.
    pub fn expand(&self, task: &str) -> Result<Vec<String>, TaskError> {
        let (family_name, target) = match task.split_once(':') {
            Some((family, target)) => (family, Some(target)),
            None => (task, None),
        };
        TaskFamily::from_str(family_name)?;
        let family = self
            .family(family_name)
            .ok_or_else(|| TaskError::UnknownTask(task.to_string()))?;

        match target {
            Some(target) if family.target(target).is_some() => Ok(vec![task.to_string()]),
            Some(_) => Err(TaskError::UnknownTask(task.to_string())),
            None => Ok(family
                .targets
                .iter()
                .map(|(name, _)| format!("{}:{}", family_name, name))
                .collect()),
        }
    }
}

/// Outcome of one target.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct TaskReport {
    /// Files, blobs, messages or entities handled
    pub processed: usize,
    /// Tasks queued by named actions
    pub scheduled: Vec<String>,
}

impl TaskReport {
    pub fn processed(processed: usize) -> Self {
        Self {
            processed,
            scheduled: Vec::new(),
        }
    }
}

/// Everything a task implementation receives.
pub struct TaskContext<'a> {
    pub state: &'a AppState,
    pub base_dir: &'a Path,
    /// `family:target`
    pub task: &'a str,
    pub target: &'a TargetConfig,
    pub options: OptionMap,
    pub actions: Vec<Action>,
}

impl TaskContext<'_> {
    pub fn params<T: serde::de::DeserializeOwned>(&self) -> Result<T, TaskError> {
        parse_params(&self.options)
    }

    /// Resolves a task file path against the task file directory.
    pub fn resolve(&self, path: &str) -> PathBuf {
        self.base_dir.join(path)
    }
}

fn action_names(value: Option<&Value>) -> Vec<String> {
    match value {
        Some(Value::String(name)) => vec![name.clone()],
        Some(Value::Array(items)) => items.iter().filter_map(|v| v.as_str().map(String::from)).collect(),
        _ => Vec::new(),
    }
}

/// Runs task invocations against the services of an `AppState`.
pub struct TaskRunner {
    state: AppState,
    file: TaskFile,
    base_dir: PathBuf,
    registered: HashMap<String, Vec<Action>>,
}

impl TaskRunner {
    pub fn new(state: AppState, file: TaskFile) -> Self {
        Self {
            state,
            file,
            base_dir: PathBuf::from("."),
            registered: HashMap::new(),
        }
    }

    /// Directory relative task file paths (`src`, `dest`, `cwd`) start from
    pub fn with_base_dir(mut self, base_dir: impl Into<PathBuf>) -> Self {
        self.base_dir = base_dir.into();
        self
    }

    /// Appends programmatic actions to the target `task` (`family:target`).
    pub fn register_actions(&mut self, task: &str, actions: Vec<Action>) {
        self.registered.entry(task.to_string()).or_default().extend(actions);
    }

    pub fn state(&self) -> &AppState {
        &self.state
    }

    /// Runs `tasks` in order, stopping at the first failure.
    ///
    /// Tasks scheduled by named actions run right after the task that
    /// scheduled them.
    pub async fn run(&self, tasks: &[String]) -> Result<Vec<(String, TaskReport)>, TaskError> {
        let mut queue = VecDeque::new();
        for task in tasks {
            queue.extend(self.file.expand(task)?);
        }

        let mut reports = Vec::new();
        while let Some(task) = queue.pop_front() {
            let report = self.run_target(&task).await.map_err(|e| {
                error!("Task {} failed: {}", task, e);
                e
            })?;
            for scheduled in report.scheduled.iter().rev() {
                for name in self.file.expand(scheduled)?.into_iter().rev() {
                    queue.push_front(name);
                }
            }
            reports.push((task, report));
        }
        log_mdc::remove("task");
        log_mdc::remove("target");
        Ok(reports)
    }

    /// Runs a single `family:target`.
    pub async fn run_target(&self, task: &str) -> Result<TaskReport, TaskError> {
        let (family_name, target_name) = task
            .split_once(':')
            .ok_or_else(|| TaskError::UnknownTask(task.to_string()))?;
        let family: TaskFamily = family_name.parse()?;
        let config = self
            .file
            .family(family_name)
            .ok_or_else(|| TaskError::UnknownTask(task.to_string()))?;
        let target = config
            .target(target_name)
            .ok_or_else(|| TaskError::UnknownTask(task.to_string()))?;

        log_mdc::insert("task", family_name);
        log_mdc::insert("target", target_name);
        info!("Running {}", task);

        let options = merge_layers([&family_defaults(family), &config.options, &target.options]);
        let names = match &target.actions {
            Some(list) => list.clone().into_vec(),
            None => action_names(options.get("actions")),
        };
        let mut actions: Vec<Action> = names.into_iter().map(Action::Named).collect();
        if let Some(registered) = self.registered.get(task) {
            actions.extend(registered.iter().cloned());
        }

        let ctx = TaskContext {
            state: &self.state,
            base_dir: &self.base_dir,
            task,
            target,
            options,
            actions,
        };
        match family {
            TaskFamily::BlobUpload => blob_tasks::upload(&ctx).await,
            TaskFamily::BlobDownload => blob_tasks::download(&ctx).await,
            TaskFamily::QueueEnqueue => queue_tasks::enqueue(&ctx).await,
            TaskFamily::QueueDequeue => queue_tasks::dequeue(&ctx).await,
            TaskFamily::QueueClear => queue_tasks::clear(&ctx).await,
            TaskFamily::TableEntities(op) => table_tasks::write_entities(&ctx, op).await,
            TaskFamily::TableQuery => table_tasks::query(&ctx).await,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const TASKS: &str = r#"
azure-table-insert:
  options:
    table: people
    serviceOptions: "Backend=mock"
  seed:
    entities:
      - { PartitionKey: a, RowKey: "1", Age: 3 }
    options:
      tableDelete: true
  more:
    entity: { PartitionKey: b, RowKey: "2" }
azure-queue-clear:
  jobs:
    options: { queue: jobs }
uglify:
  dist: { src: a.js }
"#;

    #[test]
    fn test_family_names_round_trip() {
        for family in TaskFamily::ALL {
            assert_eq!(family.name().parse::<TaskFamily>().unwrap(), family);
        }
        assert!(matches!("azure-table-upsert".parse::<TaskFamily>(), Err(TaskError::UnknownTask(_))));
    }

    #[test]
    fn test_task_file_keeps_order_and_options() {
        let file = TaskFile::from_yaml(TASKS).unwrap();
        let family = file.family("azure-table-insert").unwrap();
        assert_eq!(family.options["table"], "people");
        let names: Vec<_> = family.targets.iter().map(|(n, _)| n.as_str()).collect();
        assert_eq!(names, vec!["seed", "more"]);

        let seed = family.target("seed").unwrap();
        assert_eq!(seed.entities.to_vec().len(), 1);
        assert_eq!(seed.options["tableDelete"], true);
        assert!(family.target("more").unwrap().entity.is_some());
    }

    #[test]
    fn test_expand() {
        let file = TaskFile::from_yaml(TASKS).unwrap();
        assert_eq!(
            file.expand("azure-table-insert").unwrap(),
            vec!["azure-table-insert:seed", "azure-table-insert:more"]
        );
        assert_eq!(file.expand("azure-queue-clear:jobs").unwrap(), vec!["azure-queue-clear:jobs"]);
        assert!(file.expand("azure-queue-clear:other").is_err());
        assert!(file.expand("azure-blob-upload").is_err());
        assert!(file.expand("uglify").is_err());
    }

    #[test]
    fn test_target_file_sources() {
        let target: TargetConfig =
            serde_yaml::from_str("{ src: 'dist/**/*', cwd: build, dest: site/, expand: true }").unwrap();
        let sources = target.file_sources();
        assert_eq!(sources.src, vec!["dist/**/*"]);
        assert_eq!(sources.cwd.as_deref(), Some("build"));
        assert!(sources.expand);
    }

    #[test]
    fn test_action_names_from_options() {
        assert_eq!(action_names(Some(&Value::from("a:b"))), vec!["a:b"]);
        assert_eq!(action_names(Some(&serde_json::json!(["x", "y"]))), vec!["x", "y"]);
        assert!(action_names(None).is_empty());
    }
}
