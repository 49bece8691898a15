//! Mock implementation of QueueService trait for testing

use std::collections::HashMap;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Mutex, MutexGuard};

use chrono::{Duration, Utc};

use crate::error::{InjectedFailures, ServiceError, ServiceResult};
use crate::queue::{
    check_pop_receipt, queue_not_found, validate_message_count, validate_queue_name, MessageOptions, QueueMessage,
    QueueOptions, QueueService,
};

#[derive(Default)]
struct MockQueue {
    options: QueueOptions,
    messages: Vec<QueueMessage>,
}

/// In-memory queue service
#[derive(Default)]
pub struct MockQueueStore {
    queues: Mutex<HashMap<String, MockQueue>>,
    failures: InjectedFailures,
    get_calls: AtomicUsize,
    peek_calls: AtomicUsize,
    delete_calls: AtomicUsize,
}

impl MockQueueStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Make the next remote call fail with `error`
    pub fn inject_failure(&self, error: ServiceError) {
        self.failures.push(error);
    }

    pub fn get_calls(&self) -> usize {
        self.get_calls.load(Ordering::SeqCst)
    }

    pub fn peek_calls(&self) -> usize {
        self.peek_calls.load(Ordering::SeqCst)
    }

    pub fn delete_calls(&self) -> usize {
        self.delete_calls.load(Ordering::SeqCst)
    }

    /// Snapshot of every stored message, leased ones included
    pub fn messages(&self, queue: &str) -> Vec<QueueMessage> {
        self.lock()
            .ok()
            .and_then(|q| q.get(queue).map(|q| q.messages.clone()))
            .unwrap_or_default()
    }

    /// Metadata the queue was created with
    pub fn queue_metadata(&self, queue: &str) -> Option<HashMap<String, String>> {
        self.lock().ok()?.get(queue).map(|q| q.options.metadata.clone())
    }

    /// Make every stored message visible again, as if the leases expired
    pub fn expire_leases(&self, queue: &str) {
        if let Ok(mut queues) = self.lock() {
            if let Some(q) = queues.get_mut(queue) {
                let now = Utc::now();
                for message in &mut q.messages {
                    message.time_next_visible = now;
                }
            }
        }
    }

    fn lock(&self) -> ServiceResult<MutexGuard<'_, HashMap<String, MockQueue>>> {
        self.queues
            .lock()
            .map_err(|_| ServiceError::Backend("queue store lock poisoned".to_string()))
    }
}

impl QueueService for MockQueueStore {
    fn create_queue_if_not_exists(&self, queue: &str, options: &QueueOptions) -> ServiceResult<bool> {
        self.failures.check()?;
        validate_queue_name(queue)?;
        let mut queues = self.lock()?;
        if queues.contains_key(queue) {
            return Ok(false);
        }
        queues.insert(
            queue.to_string(),
            MockQueue {
                options: options.clone(),
                messages: Vec::new(),
            },
        );
        Ok(true)
    }

    fn delete_queue_if_exists(&self, queue: &str) -> ServiceResult<bool> {
        self.failures.check()?;
        Ok(self.lock()?.remove(queue).is_some())
    }

    fn create_message(&self, queue: &str, text: &str, options: &MessageOptions) -> ServiceResult<QueueMessage> {
        self.failures.check()?;
        let mut queues = self.lock()?;
        let q = queues.get_mut(queue).ok_or_else(|| queue_not_found(queue))?;
        let message = QueueMessage::new(text, options, Utc::now())?;
        q.messages.push(message.clone());
        Ok(message)
    }

    fn get_messages(&self, queue: &str, count: usize, visibility_timeout: Duration) -> ServiceResult<Vec<QueueMessage>> {
        self.get_calls.fetch_add(1, Ordering::SeqCst);
        self.failures.check()?;
        validate_message_count(count)?;
        let mut queues = self.lock()?;
        let q = queues.get_mut(queue).ok_or_else(|| queue_not_found(queue))?;

        let now = Utc::now();
        q.messages.retain(|m| !m.is_expired(now));
        let mut leased = Vec::new();
        for message in q.messages.iter_mut().filter(|m| m.is_visible(now)).take(count) {
            message.lease(visibility_timeout, now)?;
            leased.push(message.clone());
        }
        Ok(leased)
    }

    fn peek_messages(&self, queue: &str, count: usize) -> ServiceResult<Vec<QueueMessage>> {
        self.peek_calls.fetch_add(1, Ordering::SeqCst);
        self.failures.check()?;
        validate_message_count(count)?;
        let queues = self.lock()?;
        let q = queues.get(queue).ok_or_else(|| queue_not_found(queue))?;

        let now = Utc::now();
        Ok(q.messages
            .iter()
            .filter(|m| m.is_visible(now))
            .take(count)
            .map(QueueMessage::peeked)
            .collect())
    }

    fn delete_message(&self, queue: &str, message_id: &str, pop_receipt: &str) -> ServiceResult<()> {
        self.delete_calls.fetch_add(1, Ordering::SeqCst);
        self.failures.check()?;
        let mut queues = self.lock()?;
        let q = queues.get_mut(queue).ok_or_else(|| queue_not_found(queue))?;
        let index = q
            .messages
            .iter()
            .position(|m| m.message_id == message_id)
            .ok_or_else(|| ServiceError::NotFound(format!("message {} does not exist", message_id)))?;
        check_pop_receipt(&q.messages[index], pop_receipt)?;
        q.messages.remove(index);
        Ok(())
    }

    fn clear_messages(&self, queue: &str) -> ServiceResult<()> {
        self.failures.check()?;
        let mut queues = self.lock()?;
        queues.get_mut(queue).ok_or_else(|| queue_not_found(queue))?.messages.clear();
        Ok(())
    }

    fn approximate_message_count(&self, queue: &str) -> ServiceResult<usize> {
        self.failures.check()?;
        let queues = self.lock()?;
        let q = queues.get(queue).ok_or_else(|| queue_not_found(queue))?;
        let now = Utc::now();
        Ok(q.messages.iter().filter(|m| !m.is_expired(now)).count())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_lease_hides_message_until_expired() {
        let store = MockQueueStore::new();
        store.create_queue_if_not_exists("jobs", &QueueOptions::default()).unwrap();
        store.create_message("jobs", "one", &MessageOptions::default()).unwrap();

        let leased = store.get_messages("jobs", 1, Duration::seconds(30)).unwrap();
        assert_eq!(leased.len(), 1);
        assert!(store.get_messages("jobs", 1, Duration::seconds(30)).unwrap().is_empty());

        store.expire_leases("jobs");
        let again = store.get_messages("jobs", 1, Duration::seconds(30)).unwrap();
        assert_eq!(again[0].dequeue_count, 2);
        assert_eq!(store.get_calls(), 3);
    }

    #[test]
    fn test_stale_pop_receipt_is_rejected() {
        let store = MockQueueStore::new();
        store.create_queue_if_not_exists("jobs", &QueueOptions::default()).unwrap();
        store.create_message("jobs", "one", &MessageOptions::default()).unwrap();

        let first = store.get_messages("jobs", 1, Duration::zero()).unwrap().remove(0);
        let second = store.get_messages("jobs", 1, Duration::zero()).unwrap().remove(0);
        let stale = first.pop_receipt.unwrap();
        assert!(matches!(
            store.delete_message("jobs", &first.message_id, &stale),
            Err(ServiceError::BadRequest(_))
        ));
        store
            .delete_message("jobs", &second.message_id, second.pop_receipt.as_deref().unwrap())
            .unwrap();
        assert_eq!(store.approximate_message_count("jobs").unwrap(), 0);
    }

    #[test]
    fn test_create_keeps_first_options() {
        let store = MockQueueStore::new();
        let mut options = QueueOptions::default();
        options.metadata.insert("owner".into(), "ops".into());
        assert!(store.create_queue_if_not_exists("jobs", &options).unwrap());
        assert!(!store.create_queue_if_not_exists("jobs", &QueueOptions::default()).unwrap());
        assert_eq!(store.queue_metadata("jobs").unwrap()["owner"], "ops");
    }

    #[test]
    fn test_missing_queue() {
        let store = MockQueueStore::new();
        assert!(matches!(
            store.create_message("ghost", "x", &MessageOptions::default()),
            Err(ServiceError::NotFound(_))
        ));
    }
}
