//! Queue enqueue, dequeue and clear

use std::path::Path;

use chrono::Utc;
use log::{debug, info};
use serde_json::Value;

use crate::error::{ServiceError, TaskError};
use crate::files::read_sources;
use crate::fs_util::ensure_dir;
use crate::queue::{after, seconds, QueueMessage, QueueOptions, QueueService, MAX_MESSAGES_PER_GET};
use crate::tasks::actions::run_actions;
use crate::tasks::options::{required, ClearParams, DequeueParams, EnqueueParams};
use crate::tasks::{TaskContext, TaskReport};

/// Out-of-range times surface as an invalid option rather than a remote error.
fn invalid_time(option: &str, err: ServiceError) -> TaskError {
    match err {
        ServiceError::BadRequest(reason) => TaskError::invalid(option, reason),
        other => TaskError::Service(other),
    }
}

fn create_queue(service: &dyn QueueService, queue: &str, options: &QueueOptions) -> Result<(), TaskError> {
    if service.create_queue_if_not_exists(queue, options)? {
        debug!("Queue '{}' created", queue);
    }
    Ok(())
}

/// Message text for a configured message; non-strings are sent as JSON.
pub fn message_text(message: &Value) -> String {
    match message {
        Value::String(text) => text.clone(),
        other => other.to_string(),
    }
}

async fn save_message(dir: &Path, message: &QueueMessage) -> Result<(), TaskError> {
    ensure_dir(dir).await?;
    let path = dir.join(format!("{}.json", message.message_id));
    let json = serde_json::to_string(message).map_err(|source| TaskError::Json {
        path: path.display().to_string(),
        source,
    })?;
    tokio::fs::write(&path, json).await.map_err(|e| TaskError::io(&path, e))
}

pub async fn enqueue(ctx: &TaskContext<'_>) -> Result<TaskReport, TaskError> {
    let params: EnqueueParams = ctx.params()?;
    let queue = required(&params.queue, "queue")?;
    params
        .message_properties
        .validate(Utc::now())
        .map_err(|e| invalid_time("messageProperties", e))?;
    let services = params.service.connect(ctx.state)?;
    let service = services.queue.as_ref();

    let mut messages: Vec<String> = Vec::new();
    messages.extend(params.message.iter().filter(|m| !m.is_null()).map(message_text));
    messages.extend(params.messages.iter().map(message_text));
    let sources = ctx.target.file_sources();
    if !sources.is_empty() {
        messages.extend(read_sources(&sources, ctx.base_dir).await?.into_iter().map(|(_, text)| text));
    }

    create_queue(service, queue, &params.queue_options)?;
    for text in &messages {
        let message = service.create_message(queue, text, &params.message_properties)?;
        debug!("Message {} enqueued to '{}'", message.message_id, queue);
    }

    info!("{} messages(s) enqueued to storage queue {}", messages.len(), queue);
    Ok(TaskReport::processed(messages.len()))
}

/// Gets (or peeks) messages and runs the target actions over each one.
///
/// A leased message is deleted only after every action succeeded; the first
/// failing action aborts the task and leaves the message to reappear.
pub async fn dequeue(ctx: &TaskContext<'_>) -> Result<TaskReport, TaskError> {
    let params: DequeueParams = ctx.params()?;
    let queue = required(&params.queue, "queue")?;
    if !(1..=MAX_MESSAGES_PER_GET).contains(&params.num_of_messages) {
        return Err(TaskError::invalid(
            "numOfMessages",
            format!("must be between 1 and {}", MAX_MESSAGES_PER_GET),
        ));
    }
    let visibility = seconds("visibilityTimeout", params.visibility_timeout)
        .and_then(|visibility| after("visibilityTimeout", Utc::now(), visibility).map(|_| visibility))
        .map_err(|e| invalid_time("visibilityTimeout", e))?;
    let services = params.service.connect(ctx.state)?;
    let service = services.queue.as_ref();

    create_queue(service, queue, &params.queue_options)?;
    let messages = if params.peek_only {
        service.peek_messages(queue, params.num_of_messages)?
    } else {
        service.get_messages(queue, params.num_of_messages, visibility)?
    };
    debug!("{} message(s) received from '{}'", messages.len(), queue);

    let dest = ctx.target.dest.as_deref().map(|d| ctx.resolve(d));
    let mut scheduled = Vec::new();
    for message in &messages {
        if let Some(dir) = &dest {
            save_message(dir, message).await?;
        }

        let payload = serde_json::to_value(message).map_err(|source| TaskError::Json {
            path: message.message_id.clone(),
            source,
        })?;
        scheduled.extend(run_actions(&ctx.actions, &payload).await?);

        if !params.peek_only {
            let receipt = message.pop_receipt.as_deref().unwrap_or_default();
            service.delete_message(queue, &message.message_id, receipt)?;
            debug!("Message '{}' deleted from '{}'", message.message_id, queue);
        }
    }

    info!("{} messages(s) dequeued from storage queue {}", messages.len(), queue);
    Ok(TaskReport {
        processed: messages.len(),
        scheduled,
    })
}

pub async fn clear(ctx: &TaskContext<'_>) -> Result<TaskReport, TaskError> {
    let params: ClearParams = ctx.params()?;
    let queue = required(&params.queue, "queue")?;
    let services = params.service.connect(ctx.state)?;
    let service = services.queue.as_ref();

    create_queue(service, queue, &params.queue_options)?;
    service.clear_messages(queue)?;
    info!("All messages successfully cleared from '{}' Queue.", queue);
    Ok(TaskReport::default())
}
