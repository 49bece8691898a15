//! Actions run over dequeued messages and query results

use std::fmt;
use std::panic::{self, AssertUnwindSafe};
use std::sync::Arc;

use futures::future::BoxFuture;
use futures::FutureExt;
use log::debug;
use serde_json::Value;

use crate::error::TaskError;

pub type ActionResult = Result<(), String>;
pub type SyncAction = Arc<dyn Fn(&Value) -> ActionResult + Send + Sync>;
pub type AsyncAction = Arc<dyn Fn(Value) -> BoxFuture<'static, ActionResult> + Send + Sync>;

/// One step applied to a payload (a queue message or a query result set).
#[derive(Clone)]
pub enum Action {
    Sync(SyncAction),
    Async(AsyncAction),
    /// Another task, `family` or `family:target`, queued on the runner
    Named(String),
}

impl Action {
    pub fn sync<F>(f: F) -> Self
    where
        F: Fn(&Value) -> ActionResult + Send + Sync + 'static,
    {
        Action::Sync(Arc::new(f))
    }

    pub fn asynchronous<F, Fut>(f: F) -> Self
    where
        F: Fn(Value) -> Fut + Send + Sync + 'static,
        Fut: std::future::Future<Output = ActionResult> + Send + 'static,
    {
        Action::Async(Arc::new(move |payload| f(payload).boxed()))
    }

    pub fn named(task: impl Into<String>) -> Self {
        Action::Named(task.into())
    }
}

impl fmt::Debug for Action {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Action::Sync(_) => f.write_str("Action::Sync"),
            Action::Async(_) => f.write_str("Action::Async"),
            Action::Named(name) => write!(f, "Action::Named({})", name),
        }
    }
}

fn panic_message(panic: Box<dyn std::any::Any + Send>) -> String {
    panic
        .downcast_ref::<&str>()
        .map(|s| s.to_string())
        .or_else(|| panic.downcast_ref::<String>().cloned())
        .unwrap_or_else(|| "action panicked".to_string())
}

/// Runs `actions` in order over `payload`.
///
/// The first failing action stops the sequence. Named actions are not run
/// here; their task names are returned for the runner to schedule.
pub async fn run_actions(actions: &[Action], payload: &Value) -> Result<Vec<String>, TaskError> {
    let mut scheduled = Vec::new();
    for action in actions {
        match action {
            Action::Sync(f) => {
                panic::catch_unwind(AssertUnwindSafe(|| f(payload)))
                    .map_err(panic_message)
                    .and_then(|result| result)
                    .map_err(TaskError::Action)?;
            }
            Action::Async(f) => {
                AssertUnwindSafe(f(payload.clone()))
                    .catch_unwind()
                    .await
                    .map_err(panic_message)
                    .and_then(|result| result)
                    .map_err(TaskError::Action)?;
            }
            Action::Named(task) => {
                debug!("Scheduling task {}", task);
                scheduled.push(task.clone());
            }
        }
    }
    Ok(scheduled)
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use std::sync::Mutex;

    #[tokio::test]
    async fn test_actions_run_in_order() {
        let seen = Arc::new(Mutex::new(Vec::new()));
        let first = seen.clone();
        let second = seen.clone();
        let actions = vec![
            Action::sync(move |p| {
                first.lock().unwrap().push(format!("sync {}", p["id"]));
                Ok(())
            }),
            Action::named("azure-queue-clear:jobs"),
            Action::asynchronous(move |p| {
                let second = second.clone();
                async move {
                    second.lock().unwrap().push(format!("async {}", p["id"]));
                    Ok(())
                }
            }),
        ];

        let scheduled = run_actions(&actions, &json!({ "id": 7 })).await.unwrap();
        assert_eq!(scheduled, vec!["azure-queue-clear:jobs"]);
        assert_eq!(*seen.lock().unwrap(), vec!["sync 7", "async 7"]);
    }

    #[tokio::test]
    async fn test_failure_stops_remaining_actions() {
        let ran = Arc::new(Mutex::new(false));
        let flag = ran.clone();
        let actions = vec![
            Action::sync(|_| Err("rejected".to_string())),
            Action::sync(move |_| {
                *flag.lock().unwrap() = true;
                Ok(())
            }),
        ];

        let err = run_actions(&actions, &Value::Null).await.unwrap_err();
        assert!(matches!(err, TaskError::Action(ref m) if m == "rejected"));
        assert!(!*ran.lock().unwrap());
    }

    #[tokio::test]
    async fn test_panicking_action_is_a_failure() {
        let actions = vec![Action::sync(|_| panic!("boom"))];
        let err = run_actions(&actions, &Value::Null).await.unwrap_err();
        assert!(matches!(err, TaskError::Action(ref m) if m == "boom"));
    }
}
