//! The queue abstraction jobs are produced to and consumed from.
//!
//! A [`QueueClient`] offers at-least-once, lease based delivery: fetching a message hides it
//! from other consumers for a visibility timeout, after which it reappears unless it was deleted
//! or its visibility was extended.
//!
//! Currently the crate provides an in memory implementation, [`memory::InMemoryQueue`]. Clients
//! for cloud queue services can be implemented on top of this trait and checked with
//! [`test_suite`](crate::test_suite).
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use thiserror::Error;

pub mod memory;
#[doc(hidden)]
pub mod testing;

/// A client for a lease based message queue.
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait QueueClient: Send + Sync {
    /// Fetches the next visible message, hiding it for `visibility_timeout`.
    async fn get_message(
        &self,
        visibility_timeout: Duration,
    ) -> Result<Option<QueueMessage>, QueueError>;

    /// Makes `message` invisible for `visibility_timeout` from now, returning the new pop
    /// receipt for the message.
    ///
    /// A timeout of zero makes the message visible again immediately.
    async fn update_visibility(
        &self,
        message: &QueueMessage,
        visibility_timeout: Duration,
    ) -> Result<String, QueueError>;

    /// Deletes `message` from the queue.
    async fn delete_message(&self, message: &QueueMessage) -> Result<(), QueueError>;

    /// Adds a new message returning its id. The message is hidden for
    /// `initial_visibility_delay` if given.
    async fn add_message(
        &self,
        body: String,
        initial_visibility_delay: Option<Duration>,
    ) -> Result<String, QueueError>;
}

/// A message fetched from a [`QueueClient`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct QueueMessage {
    pub id: String,
    /// Identifies the current lease on the message. Updates and deletes carrying a stale pop
    /// receipt fail with [`QueueError::NotFound`].
    pub pop_receipt: String,
    pub body: String,
    /// The number of times the message has been fetched from the queue.
    pub dequeue_count: u32,
    pub inserted_at: DateTime<Utc>,
    pub next_visible_time: DateTime<Utc>,
}

#[derive(Debug, Error)]
pub enum QueueError {
    #[error("Message {0} not found")]
    NotFound(String),
    #[error("Queue in bad state")]
    BadState,
    #[error(transparent)]
    Service(Box<dyn std::error::Error + Send + Sync>),
}
