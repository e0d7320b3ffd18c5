//! Provides an in memory implementation of [`QueueClient`].
//!
//! Currently this is provided for testing purposes and not designed for use in a production
//! system.
//!
//! It is not optimized instead is designed to be a correct implementation of the lease semantics
//! for use in a test setup. Visibility deadlines follow the tokio clock, so tests can use
//! [`tokio::time::pause`] to move through visibility timeouts.
use std::{
    sync::{Arc, RwLock},
    time::Duration,
};

use async_trait::async_trait;
use chrono::{DateTime, TimeDelta, Utc};
use tokio::time::Instant;
use uuid::Uuid;

use super::{QueueClient, QueueError, QueueMessage};

const FAR_FUTURE: Duration = Duration::from_secs(60 * 60 * 24 * 365 * 30);

/// An in memory implementation of [`QueueClient`].
///
/// **This is not designed for use in a production systems.**
#[derive(Clone, Default)]
pub struct InMemoryQueue {
    messages: Arc<RwLock<Vec<StoredMessage>>>,
}

#[derive(Clone)]
struct StoredMessage {
    message: QueueMessage,
    visible_at: Instant,
}

impl StoredMessage {
    fn is_visible(&self, now: Instant) -> bool {
        self.visible_at <= now
    }

    fn hide_for(&mut self, visibility_timeout: Duration) {
        self.visible_at = visible_after(visibility_timeout);
        self.message.next_visible_time = next_visible_time(visibility_timeout);
    }

    fn holds_lease(&self, message: &QueueMessage) -> bool {
        self.message.id == message.id && self.message.pop_receipt == message.pop_receipt
    }
}

fn visible_after(visibility_timeout: Duration) -> Instant {
    let now = Instant::now();
    now.checked_add(visibility_timeout)
        .unwrap_or(now + FAR_FUTURE)
}

fn next_visible_time(visibility_timeout: Duration) -> DateTime<Utc> {
    TimeDelta::from_std(visibility_timeout)
        .ok()
        .and_then(|delta| Utc::now().checked_add_signed(delta))
        .unwrap_or(DateTime::<Utc>::MAX_UTC)
}

fn new_pop_receipt() -> String {
    Uuid::new_v4().to_string()
}

impl InMemoryQueue {
    /// Creates a new instance of [`InMemoryQueue`].
    pub fn new() -> Self {
        Self::default()
    }

    /// A snapshot of every message currently stored, visible or not, in insertion order.
    pub fn messages(&self) -> Result<Vec<QueueMessage>, QueueError> {
        Ok(self
            .messages
            .read()
            .map_err(|_| QueueError::BadState)?
            .iter()
            .map(|stored| stored.message.clone())
            .collect())
    }

    /// The number of messages currently stored, visible or not.
    pub fn len(&self) -> Result<usize, QueueError> {
        Ok(self.messages.read().map_err(|_| QueueError::BadState)?.len())
    }

    pub fn is_empty(&self) -> Result<bool, QueueError> {
        Ok(self.len()? == 0)
    }
}

#[async_trait]
impl QueueClient for InMemoryQueue {
    async fn get_message(
        &self,
        visibility_timeout: Duration,
    ) -> Result<Option<QueueMessage>, QueueError> {
        let now = Instant::now();
        let mut messages = self.messages.write().map_err(|_| QueueError::BadState)?;
        Ok(messages
            .iter_mut()
            .find(|stored| stored.is_visible(now))
            .map(|stored| {
                stored.hide_for(visibility_timeout);
                stored.message.dequeue_count += 1;
                stored.message.pop_receipt = new_pop_receipt();
                stored.message.clone()
            }))
    }

    async fn update_visibility(
        &self,
        message: &QueueMessage,
        visibility_timeout: Duration,
    ) -> Result<String, QueueError> {
        let mut messages = self.messages.write().map_err(|_| QueueError::BadState)?;
        let stored = messages
            .iter_mut()
            .find(|stored| stored.holds_lease(message))
            .ok_or_else(|| QueueError::NotFound(message.id.clone()))?;
        stored.hide_for(visibility_timeout);
        stored.message.pop_receipt = new_pop_receipt();
        Ok(stored.message.pop_receipt.clone())
    }

    async fn delete_message(&self, message: &QueueMessage) -> Result<(), QueueError> {
        let mut messages = self.messages.write().map_err(|_| QueueError::BadState)?;
        let index = messages
            .iter()
            .position(|stored| stored.holds_lease(message))
            .ok_or_else(|| QueueError::NotFound(message.id.clone()))?;
        messages.remove(index);
        Ok(())
    }

    async fn add_message(
        &self,
        body: String,
        initial_visibility_delay: Option<Duration>,
    ) -> Result<String, QueueError> {
        let delay = initial_visibility_delay.unwrap_or(Duration::ZERO);
        let id = Uuid::new_v4().to_string();
        let stored = StoredMessage {
            message: QueueMessage {
                id: id.clone(),
                pop_receipt: String::new(),
                body,
                dequeue_count: 0,
                inserted_at: Utc::now(),
                next_visible_time: next_visible_time(delay),
            },
            visible_at: visible_after(delay),
        };
        self.messages
            .write()
            .map_err(|_| QueueError::BadState)?
            .push(stored);
        Ok(id)
    }
}
