//! Retry policies applied around every storage service call
//!
//! Only `ServiceError::Transient` failures are retried; everything else is
//! returned on the first occurrence. Service calls and retry waits block, so
//! on a multi-threaded tokio runtime they run under `block_in_place` and the
//! worker's other tasks move to another thread meanwhile.

use std::str::FromStr;
use std::sync::Arc;
use std::thread;
use std::time::Duration;

use chrono::Duration as ChronoDuration;
use log::warn;
use tokio::runtime::{Handle, RuntimeFlavor};

use crate::blob::{BlobItem, BlobProperties, BlobService, ContainerOptions};
use crate::error::{ServiceResult, TaskError};
use crate::queue::{MessageOptions, QueueMessage, QueueOptions, QueueService};
use crate::table::batch::{TableBatch, TableOperation};
use crate::table::entity::TypedEntity;
use crate::table::query::TableQuery;
use crate::table::{TableOptions, TableService};

pub const DEFAULT_RETRY_COUNT: u32 = 3;
pub const DEFAULT_RETRY_INTERVAL: Duration = Duration::from_millis(100);

/// Names accepted by the `retryFilter` option.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum RetryFilter {
    #[default]
    Exponential,
    Linear,
    None,
}

impl FromStr for RetryFilter {
    type Err = TaskError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "ExponentialRetryPolicyFilter" => Ok(RetryFilter::Exponential),
            "LinearRetryPolicyFilter" => Ok(RetryFilter::Linear),
            "NoRetryPolicyFilter" => Ok(RetryFilter::None),
            other => Err(TaskError::invalid("retryFilter", format!("unknown retry filter {}", other))),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct RetryPolicy {
    pub filter: RetryFilter,
    pub retry_count: u32,
    pub interval: Duration,
}

impl RetryPolicy {
    pub fn new(filter: RetryFilter) -> Self {
        Self {
            filter,
            retry_count: DEFAULT_RETRY_COUNT,
            interval: DEFAULT_RETRY_INTERVAL,
        }
    }

    pub fn with_interval(mut self, interval: Duration) -> Self {
        self.interval = interval;
        self
    }

    /// Delay before retry number `retry` (0-based), None when retries are exhausted.
    pub fn delay(&self, retry: u32) -> Option<Duration> {
        if retry >= self.retry_count {
            return None;
        }
        match self.filter {
            RetryFilter::None => None,
            RetryFilter::Linear => Some(self.interval),
            RetryFilter::Exponential => Some(self.interval * 2u32.saturating_pow(retry)),
        }
    }

    /// Runs `call`, retrying transient failures per the policy.
    pub fn run<T>(&self, what: &str, call: impl FnMut() -> ServiceResult<T>) -> ServiceResult<T> {
        off_worker(|| self.run_blocking(what, call))
    }

    fn run_blocking<T>(&self, what: &str, mut call: impl FnMut() -> ServiceResult<T>) -> ServiceResult<T> {
        let mut retry = 0;
        loop {
            match call() {
                Err(e) if e.is_transient() => match self.delay(retry) {
                    Some(delay) => {
                        warn!("{} failed ({}), retrying in {:?}", what, e, delay);
                        thread::sleep(delay);
                        retry += 1;
                    }
                    None => return Err(e),
                },
                result => return result,
            }
        }
    }
}

/// Runs blocking work without holding a tokio worker when one is current.
fn off_worker<R>(work: impl FnOnce() -> R) -> R {
    match Handle::try_current() {
        Ok(handle) if handle.runtime_flavor() == RuntimeFlavor::MultiThread => tokio::task::block_in_place(work),
        _ => work(),
    }
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self::new(RetryFilter::default())
    }
}

/// Blob service wrapper applying a retry policy
pub struct RetryingBlobService {
    inner: Arc<dyn BlobService>,
    policy: RetryPolicy,
}

impl RetryingBlobService {
    pub fn new(inner: Arc<dyn BlobService>, policy: RetryPolicy) -> Self {
        Self { inner, policy }
    }
}

impl BlobService for RetryingBlobService {
    fn create_container_if_not_exists(&self, container: &str, options: &ContainerOptions) -> ServiceResult<bool> {
        self.policy
            .run("create container", || self.inner.create_container_if_not_exists(container, options))
    }

    fn delete_container_if_exists(&self, container: &str) -> ServiceResult<bool> {
        self.policy.run("delete container", || self.inner.delete_container_if_exists(container))
    }

    fn container_exists(&self, container: &str) -> ServiceResult<bool> {
        self.policy.run("container exists", || self.inner.container_exists(container))
    }

    fn put_block_blob(
        &self,
        container: &str,
        name: &str,
        data: &[u8],
        properties: &BlobProperties,
    ) -> ServiceResult<BlobItem> {
        self.policy
            .run("put blob", || self.inner.put_block_blob(container, name, data, properties))
    }

    fn list_blobs(&self, container: &str, prefix: Option<&str>) -> ServiceResult<Vec<BlobItem>> {
        self.policy.run("list blobs", || self.inner.list_blobs(container, prefix))
    }

    fn get_blob(&self, container: &str, name: &str) -> ServiceResult<Vec<u8>> {
        self.policy.run("get blob", || self.inner.get_blob(container, name))
    }
}

/// Queue service wrapper applying a retry policy
pub struct RetryingQueueService {
    inner: Arc<dyn QueueService>,
    policy: RetryPolicy,
}

impl RetryingQueueService {
    pub fn new(inner: Arc<dyn QueueService>, policy: RetryPolicy) -> Self {
        Self { inner, policy }
    }
}

impl QueueService for RetryingQueueService {
    fn create_queue_if_not_exists(&self, queue: &str, options: &QueueOptions) -> ServiceResult<bool> {
        self.policy
            .run("create queue", || self.inner.create_queue_if_not_exists(queue, options))
    }

    fn delete_queue_if_exists(&self, queue: &str) -> ServiceResult<bool> {
        self.policy.run("delete queue", || self.inner.delete_queue_if_exists(queue))
    }

    fn create_message(&self, queue: &str, text: &str, options: &MessageOptions) -> ServiceResult<QueueMessage> {
        self.policy
            .run("create message", || self.inner.create_message(queue, text, options))
    }

    fn get_messages(&self, queue: &str, count: usize, visibility_timeout: ChronoDuration) -> ServiceResult<Vec<QueueMessage>> {
        self.policy
            .run("get messages", || self.inner.get_messages(queue, count, visibility_timeout))
    }

    fn peek_messages(&self, queue: &str, count: usize) -> ServiceResult<Vec<QueueMessage>> {
        self.policy.run("peek messages", || self.inner.peek_messages(queue, count))
    }

    fn delete_message(&self, queue: &str, message_id: &str, pop_receipt: &str) -> ServiceResult<()> {
        self.policy
            .run("delete message", || self.inner.delete_message(queue, message_id, pop_receipt))
    }

    fn clear_messages(&self, queue: &str) -> ServiceResult<()> {
        self.policy.run("clear messages", || self.inner.clear_messages(queue))
    }

    fn approximate_message_count(&self, queue: &str) -> ServiceResult<usize> {
        self.policy
            .run("count messages", || self.inner.approximate_message_count(queue))
    }
}

/// Table service wrapper applying a retry policy
pub struct RetryingTableService {
    inner: Arc<dyn TableService>,
    policy: RetryPolicy,
}

impl RetryingTableService {
    pub fn new(inner: Arc<dyn TableService>, policy: RetryPolicy) -> Self {
        Self { inner, policy }
    }
}

impl TableService for RetryingTableService {
    fn create_table_if_not_exists(&self, table: &str, options: &TableOptions) -> ServiceResult<bool> {
        self.policy.run("create table", || self.inner.create_table_if_not_exists(table, options))
    }

    fn delete_table_if_exists(&self, table: &str) -> ServiceResult<bool> {
        self.policy.run("delete table", || self.inner.delete_table_if_exists(table))
    }

    fn table_exists(&self, table: &str) -> ServiceResult<bool> {
        self.policy.run("table exists", || self.inner.table_exists(table))
    }

    fn execute_operation(&self, table: &str, op: TableOperation, entity: &TypedEntity) -> ServiceResult<()> {
        self.policy
            .run("table operation", || self.inner.execute_operation(table, op, entity))
    }

    fn execute_batch(&self, table: &str, batch: &TableBatch) -> ServiceResult<()> {
        self.policy.run("table batch", || self.inner.execute_batch(table, batch))
    }

    fn query_entities(&self, table: &str, query: &TableQuery) -> ServiceResult<Vec<TypedEntity>> {
        self.policy.run("query entities", || self.inner.query_entities(table, query))
    }
}
