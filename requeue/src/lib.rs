//! A job agent for lease based message queues.
//!
//! Jobs are enqueued as JSON messages naming a [`job::Job`] and carrying its properties. A
//! [`consumer::Consumer`] polls the queue, backing off according to a [`wait::WaitStrategy`]
//! while the queue is empty, and runs each message through a [`context::JobExecutionContext`]
//! that decodes the message, executes the job, keeps the message's lease alive while the job
//! runs, and finally deletes or requeues the message according to the
//! [`settings::ConsumerSettings`].
//!
//! ```
//! # use requeue::prelude::*;
//! # use requeue::queue::memory::InMemoryQueue;
//! # use serde::{Deserialize, Serialize};
//! # use std::sync::Arc;
//! #[derive(Serialize, Deserialize)]
//! struct SendEmail {
//!     #[serde(rename = "To")]
//!     to: String,
//! }
//!
//! #[async_trait::async_trait]
//! impl Job for SendEmail {
//!     const NAME: &'static str = "SendEmail";
//!     async fn execute(&self) -> ExecutionResult {
//!         ExecutionResult::Success
//!     }
//! }
//!
//! # tokio::runtime::Builder::new_current_thread().enable_time().build().unwrap().block_on(async {
//! let queue = Arc::new(InMemoryQueue::new());
//! let registry = Arc::new(JobRegistry::new().with_job::<SendEmail>());
//!
//! Producer::new(queue.clone(), registry.clone())
//!     .job(&SendEmail { to: "someone@example.com".to_owned() })
//!     .enqueue()
//!     .await
//!     .unwrap();
//!
//! let consumer = Consumer::new(queue, registry);
//! let executed = consumer
//!     .one(&NoRetry, &CancellationToken::new())
//!     .await
//!     .unwrap();
//! assert!(executed);
//! # });
//! ```
use std::error::Error as StdError;

use thiserror::Error;

pub mod consumer;
pub mod context;
pub mod job;
pub mod prelude;
pub mod producer;
pub mod queue;
pub mod settings;
pub mod stats;
pub mod testing;
pub mod wait;

use job::{descriptor::DescriptorError, JobFailure};
use queue::QueueError;
use wait::WaitStrategyError;

#[derive(Debug, Error)]
pub enum RequeueError {
    #[error("Message {message_id} does not hold a valid job: {source}")]
    BadFormat {
        message_id: String,
        #[source]
        source: Box<dyn StdError + Send + Sync>,
    },
    #[error("No job registered with name {job_name}")]
    UnknownJob {
        message_id: Option<String>,
        job_name: String,
    },
    #[error("Properties do not fit job {job_name}: {source}")]
    Binding {
        job_name: String,
        #[source]
        source: serde_json::Error,
    },
    #[error("Job {job_name} failed: {source}")]
    JobFailed {
        job_name: String,
        message_id: String,
        #[source]
        source: JobFailure,
    },
    #[error("Job {0} is already registered")]
    DuplicateJob(&'static str),
    #[error("Invalid consumer configuration: {0}")]
    Configuration(String),
    #[error("Error communicating with the queue")]
    Queue(#[from] QueueError),
    #[error("Invalid job descriptor")]
    InvalidDescriptor(#[from] DescriptorError),
    #[error(transparent)]
    WaitStrategy(#[from] WaitStrategyError),
    #[error("No message was dequeued, there is no job to execute")]
    EmptyContext,
    #[error("The dequeued message has already been executed")]
    AlreadyExecuted,
}
