//! Queue Storage Layer Abstraction
//!
//! Messages are leased by `get_messages`: they stay hidden for the visibility
//! timeout and must be deleted with the pop receipt of that lease.

pub mod mock_store;
pub mod sqlite_store;


use std::collections::HashMap;

use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::error::{ServiceError, ServiceResult};

/// Most messages a single get or peek may return.
pub const MAX_MESSAGES_PER_GET: usize = 32;

/// Time to live applied when the message options do not set one (7 days).
pub const DEFAULT_MESSAGE_TTL_SECS: i64 = 7 * 24 * 60 * 60;

/// A queue message as returned by the service and saved to disk.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct QueueMessage {
    #[serde(rename = "messageid")]
    pub message_id: String,
    #[serde(rename = "popreceipt", default, skip_serializing_if = "Option::is_none")]
    pub pop_receipt: Option<String>,
    #[serde(rename = "messagetext")]
    pub message_text: String,
    #[serde(rename = "insertiontime")]
    pub insertion_time: DateTime<Utc>,
    #[serde(rename = "expirationtime")]
    pub expiration_time: DateTime<Utc>,
    #[serde(rename = "timenextvisible")]
    pub time_next_visible: DateTime<Utc>,
    #[serde(rename = "dequeuecount")]
    pub dequeue_count: u32,
}

/// Options used when the queue has to be created.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct QueueOptions {
    #[serde(default)]
    pub metadata: HashMap<String, String>,
}

/// Per-message options, in seconds.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct MessageOptions {
    #[serde(default)]
    pub visibility_timeout: Option<u64>,
    #[serde(default)]
    pub message_ttl: Option<u64>,
}

/// Trait defining the queue service interface
pub trait QueueService: Send + Sync {
    /// Create the queue, returning true when it did not exist before
    fn create_queue_if_not_exists(&self, queue: &str, options: &QueueOptions) -> ServiceResult<bool>;

    fn delete_queue_if_exists(&self, queue: &str) -> ServiceResult<bool>;

    fn create_message(&self, queue: &str, text: &str, options: &MessageOptions) -> ServiceResult<QueueMessage>;

    /// Lease up to `count` visible messages for `visibility_timeout`
    fn get_messages(&self, queue: &str, count: usize, visibility_timeout: Duration) -> ServiceResult<Vec<QueueMessage>>;

    /// Read up to `count` visible messages without leasing them
    fn peek_messages(&self, queue: &str, count: usize) -> ServiceResult<Vec<QueueMessage>>;

    /// Delete a leased message; the pop receipt must match the latest lease
    fn delete_message(&self, queue: &str, message_id: &str, pop_receipt: &str) -> ServiceResult<()>;

    fn clear_messages(&self, queue: &str) -> ServiceResult<()>;

    /// Number of unexpired messages, visible or not
    fn approximate_message_count(&self, queue: &str) -> ServiceResult<usize>;
}

/// Queue names: 3-63 lowercase letters, digits and single hyphens, starting
/// and ending with a letter or digit.
pub fn validate_queue_name(queue: &str) -> ServiceResult<()> {
    let valid = (3..=63).contains(&queue.len())
        && queue.chars().all(|c| c.is_ascii_lowercase() || c.is_ascii_digit() || c == '-')
        && !queue.starts_with('-')
        && !queue.ends_with('-')
        && !queue.contains("--");
    if valid {
        Ok(())
    } else {
        Err(ServiceError::BadRequest(format!("invalid queue name: {}", queue)))
    }
}

pub fn validate_message_count(count: usize) -> ServiceResult<()> {
    if (1..=MAX_MESSAGES_PER_GET).contains(&count) {
        Ok(())
    } else {
        Err(ServiceError::BadRequest(format!(
            "number of messages must be between 1 and {}, got {}",
            MAX_MESSAGES_PER_GET, count
        )))
    }
}

pub(crate) fn queue_not_found(queue: &str) -> ServiceError {
    ServiceError::NotFound(format!("queue {} does not exist", queue))
}

/// `seconds` as a duration; values chrono cannot represent are rejected.
pub fn seconds(option: &str, secs: u64) -> ServiceResult<Duration> {
    i64::try_from(secs)
        .ok()
        .and_then(Duration::try_seconds)
        .ok_or_else(|| ServiceError::BadRequest(format!("{} of {} seconds is out of range", option, secs)))
}

/// `now + delta`, or `BadRequest` naming `option` when the date overflows.
pub fn after(option: &str, now: DateTime<Utc>, delta: Duration) -> ServiceResult<DateTime<Utc>> {
    now.checked_add_signed(delta).ok_or_else(|| {
        ServiceError::BadRequest(format!("{} of {} seconds is out of range", option, delta.num_seconds()))
    })
}

impl MessageOptions {
    /// Rejects a time to live or initial delay that would overflow the message dates.
    pub fn validate(&self, now: DateTime<Utc>) -> ServiceResult<()> {
        if let Some(ttl) = self.message_ttl {
            after("messageTtl", now, seconds("messageTtl", ttl)?)?;
        }
        if let Some(delay) = self.visibility_timeout {
            after("visibilityTimeout", now, seconds("visibilityTimeout", delay)?)?;
        }
        Ok(())
    }
}

impl QueueMessage {
    /// Builds a fresh message inserted at `now`.
    pub fn new(text: &str, options: &MessageOptions, now: DateTime<Utc>) -> ServiceResult<Self> {
        let ttl = match options.message_ttl {
            Some(ttl) => seconds("messageTtl", ttl)?,
            None => Duration::seconds(DEFAULT_MESSAGE_TTL_SECS),
        };
        let delay = seconds("visibilityTimeout", options.visibility_timeout.unwrap_or(0))?;
        Ok(Self {
            message_id: Uuid::new_v4().to_string(),
            pop_receipt: Some(Uuid::new_v4().to_string()),
            message_text: text.to_string(),
            insertion_time: now,
            expiration_time: after("messageTtl", now, ttl)?,
            time_next_visible: after("visibilityTimeout", now, delay)?,
            dequeue_count: 0,
        })
    }

    pub fn is_expired(&self, now: DateTime<Utc>) -> bool {
        self.expiration_time <= now
    }

    pub fn is_visible(&self, now: DateTime<Utc>) -> bool {
        !self.is_expired(now) && self.time_next_visible <= now
    }

    /// Takes a new lease: fresh pop receipt, hidden until `now + visibility`.
    pub fn lease(&mut self, visibility: Duration, now: DateTime<Utc>) -> ServiceResult<()> {
        let next_visible = after("visibilityTimeout", now, visibility)?;
        self.pop_receipt = Some(Uuid::new_v4().to_string());
        self.dequeue_count += 1;
        self.time_next_visible = next_visible;
        Ok(())
    }

    /// Copy handed out by peek: no pop receipt.
    pub fn peeked(&self) -> Self {
        Self {
            pop_receipt: None,
            ..self.clone()
        }
    }
}

/// Checks a delete request against the stored message.
pub(crate) fn check_pop_receipt(stored: &QueueMessage, pop_receipt: &str) -> ServiceResult<()> {
    if stored.pop_receipt.as_deref() == Some(pop_receipt) {
        Ok(())
    } else {
        Err(ServiceError::BadRequest(format!(
            "pop receipt does not match the latest lease of message {}",
            stored.message_id
        )))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_queue_names() {
        assert!(validate_queue_name("jobs-2024").is_ok());
        assert!(validate_queue_name("Jobs").is_err());
        assert!(validate_queue_name("-jobs").is_err());
        assert!(validate_queue_name("jo--bs").is_err());
        assert!(validate_queue_name("jb").is_err());
    }

    #[test]
    fn test_message_count_bounds() {
        assert!(validate_message_count(1).is_ok());
        assert!(validate_message_count(32).is_ok());
        assert!(validate_message_count(0).is_err());
        assert!(validate_message_count(33).is_err());
    }

    #[test]
    fn test_message_lifecycle() {
        let now = Utc::now();
        let mut message = QueueMessage::new("hello", &MessageOptions::default(), now).unwrap();
        assert!(message.is_visible(now));

        let first = message.pop_receipt.clone();
        message.lease(Duration::seconds(5), now).unwrap();
        assert_eq!(message.dequeue_count, 1);
        assert_ne!(message.pop_receipt, first);
        assert!(!message.is_visible(now));
        assert!(message.is_visible(now + Duration::seconds(5)));

        let short = QueueMessage::new("bye", &MessageOptions { message_ttl: Some(1), ..Default::default() }, now).unwrap();
        assert!(short.is_expired(now + Duration::seconds(1)));
    }

    #[test]
    fn test_message_json_field_names() {
        let message = QueueMessage::new("hello", &MessageOptions::default(), Utc::now()).unwrap();
        let value = serde_json::to_value(&message).unwrap();
        for field in ["messageid", "popreceipt", "messagetext", "insertiontime", "expirationtime", "timenextvisible", "dequeuecount"] {
            assert!(value.get(field).is_some(), "missing {}", field);
        }
        assert_eq!(value["messagetext"], json!("hello"));
        assert!(serde_json::to_value(message.peeked()).unwrap().get("popreceipt").is_none());
    }

    #[test]
    fn test_message_options_names() {
        let options: MessageOptions = serde_json::from_value(json!({"visibilityTimeout": 10, "messageTtl": 60})).unwrap();
        assert_eq!(options.visibility_timeout, Some(10));
        assert_eq!(options.message_ttl, Some(60));
    }

    #[test]
    fn test_out_of_range_times_are_rejected() {
        let now = Utc::now();
        let huge = MessageOptions { message_ttl: Some(100_000_000_000_000), ..Default::default() };
        assert!(matches!(huge.validate(now), Err(ServiceError::BadRequest(_))));
        assert!(matches!(QueueMessage::new("x", &huge, now), Err(ServiceError::BadRequest(_))));

        let delayed = MessageOptions { visibility_timeout: Some(u64::MAX), ..Default::default() };
        assert!(delayed.validate(now).is_err());
        assert!(seconds("visibilityTimeout", u64::MAX).is_err());
        assert!(seconds("visibilityTimeout", 30).is_ok());

        let mut message = QueueMessage::new("x", &MessageOptions::default(), now).unwrap();
        let before = message.clone();
        assert!(message.lease(Duration::MAX, now).is_err());
        assert_eq!(message, before);
    }
}
