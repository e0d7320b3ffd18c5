//! Enqueuing jobs.
use std::{sync::Arc, time::Duration};

use chrono::TimeDelta;
use tracing::instrument;

use crate::{
    job::{registry::JobFactory, DynJob, JobDescriptor},
    queue::QueueClient,
    RequeueError,
};

/// Writes jobs to a queue.
///
/// # Example
///
/// ```
/// # use requeue::prelude::*;
/// # use requeue::queue::memory::InMemoryQueue;
/// # use serde::{Deserialize, Serialize};
/// # use std::sync::Arc;
/// # #[derive(Serialize, Deserialize)]
/// # struct Cleanup {}
/// # #[async_trait::async_trait]
/// # impl Job for Cleanup {
/// #     const NAME: &'static str = "Cleanup";
/// #     async fn execute(&self) -> ExecutionResult {
/// #         ExecutionResult::Success
/// #     }
/// # }
/// # tokio::runtime::Builder::new_current_thread().enable_time().build().unwrap().block_on(async {
/// let queue = Arc::new(InMemoryQueue::new());
/// let producer = Producer::new(queue, Arc::new(JobRegistry::new().with_job::<Cleanup>()));
///
/// producer
///     .job(&Cleanup {})
///     .schedule_in(chrono::TimeDelta::minutes(5))
///     .enqueue()
///     .await
///     .unwrap();
///
/// producer
///     .descriptor(JobDescriptor::new("Cleanup"))
///     .enqueue()
///     .await
///     .unwrap();
/// # });
/// ```
#[derive(Clone)]
pub struct Producer {
    queue: Arc<dyn QueueClient>,
    factory: Arc<dyn JobFactory>,
}

impl Producer {
    pub fn new(queue: Arc<dyn QueueClient>, factory: Arc<dyn JobFactory>) -> Self {
        Self { queue, factory }
    }

    /// Starts enqueuing `job`, its descriptor is created by the producer's factory.
    pub fn job<'a>(&'a self, job: &'a dyn DynJob) -> EnqueueBuilder<'a> {
        EnqueueBuilder::new(self, Source::Job(job))
    }

    /// Starts enqueuing a prepared descriptor.
    pub fn descriptor(&self, descriptor: JobDescriptor) -> EnqueueBuilder<'_> {
        EnqueueBuilder::new(self, Source::Descriptor(descriptor))
    }
}

enum Source<'a> {
    Job(&'a dyn DynJob),
    Descriptor(JobDescriptor),
}

pub struct EnqueueBuilder<'a> {
    producer: &'a Producer,
    source: Source<'a>,
    initial_visibility_delay: Option<Duration>,
}

impl<'a> EnqueueBuilder<'a> {
    fn new(producer: &'a Producer, source: Source<'a>) -> Self {
        Self {
            producer,
            source,
            initial_visibility_delay: None,
        }
    }

    /// Keeps the message hidden for `initial_visibility_delay` after it is enqueued.
    pub fn with_initial_visibility_delay(self, initial_visibility_delay: Duration) -> Self {
        Self {
            initial_visibility_delay: Some(initial_visibility_delay),
            ..self
        }
    }

    /// Keeps the message hidden for `schedule_in`. Negative values enqueue the job as visible
    /// immediately.
    pub fn schedule_in(self, schedule_in: TimeDelta) -> Self {
        self.with_initial_visibility_delay(schedule_in.to_std().unwrap_or(Duration::ZERO))
    }

    /// Enqueues the job returning the id of the queue message.
    #[instrument(skip(self))]
    pub async fn enqueue(self) -> Result<String, RequeueError> {
        let descriptor = match self.source {
            Source::Job(job) => self.producer.factory.create_descriptor(job)?,
            Source::Descriptor(descriptor) => descriptor,
        };
        let body = descriptor.encode()?;
        let message_id = self
            .producer
            .queue
            .add_message(body, self.initial_visibility_delay)
            .await?;
        tracing::debug!(
            %message_id,
            job = %descriptor.job_name,
            "Enqueued job {} as message {message_id}",
            descriptor.job_name
        );
        Ok(message_id)
    }
}

#[cfg(test)]
mod test {
    use assert_matches::assert_matches;
    use mockall::predicate::*;

    use super::*;
    use crate::{
        job::{
            descriptor::DescriptorError,
            registry::JobRegistry,
            test::{MockJob, UnitJob},
        },
        queue::{memory::InMemoryQueue, MockQueueClient, QueueError},
    };

    fn producer(queue: &InMemoryQueue) -> Producer {
        Producer::new(
            Arc::new(queue.clone()),
            Arc::new(JobRegistry::new().with_job::<MockJob>()),
        )
    }

    #[tokio::test]
    async fn enqueue_job() {
        let queue = InMemoryQueue::new();

        let id = producer(&queue)
            .job(&MockJob {
                id: "42".to_owned(),
            })
            .enqueue()
            .await
            .unwrap();

        let messages = queue.messages().unwrap();
        assert_eq!(messages.len(), 1);
        assert_eq!(messages[0].id, id);
        assert_eq!(messages[0].body, r#"{"Job":"MockJob","Properties":{"Id":"42"}}"#);
    }

    #[tokio::test]
    async fn enqueue_descriptor() {
        let queue = InMemoryQueue::new();

        producer(&queue)
            .descriptor(JobDescriptor::new("Anything").with_property("Key", 1))
            .enqueue()
            .await
            .unwrap();

        let messages = queue.messages().unwrap();
        assert_eq!(messages[0].body, r#"{"Job":"Anything","Properties":{"Key":1}}"#);
    }

    #[tokio::test]
    async fn blank_job_name_is_rejected_before_sending() {
        let mut queue = MockQueueClient::new();
        queue.expect_add_message().never();
        let producer = Producer::new(Arc::new(queue), Arc::new(JobRegistry::new()));

        assert_matches!(
            producer.descriptor(JobDescriptor::new(" ")).enqueue().await,
            Err(RequeueError::InvalidDescriptor(DescriptorError::BlankJobName))
        );
    }

    #[tokio::test]
    async fn unregistered_job_is_rejected() {
        let queue = InMemoryQueue::new();

        assert_matches!(
            producer(&queue).job(&UnitJob).enqueue().await,
            Err(RequeueError::UnknownJob { job_name, .. }) if job_name == "UnitJob"
        );
        assert!(queue.is_empty().unwrap());
    }

    #[tokio::test]
    async fn initial_visibility_delay() {
        let mut queue = MockQueueClient::new();
        queue
            .expect_add_message()
            .with(always(), eq(Some(Duration::from_secs(300))))
            .times(1)
            .returning(|_, _| Ok("1".to_owned()));
        let producer = Producer::new(
            Arc::new(queue),
            Arc::new(JobRegistry::new().with_job::<MockJob>()),
        );

        let id = producer
            .job(&MockJob {
                id: "42".to_owned(),
            })
            .schedule_in(TimeDelta::minutes(5))
            .enqueue()
            .await
            .unwrap();

        assert_eq!(id, "1");
    }

    #[tokio::test]
    async fn queue_errors_propagate() {
        let mut queue = MockQueueClient::new();
        queue
            .expect_add_message()
            .returning(|_, _| Err(QueueError::BadState));
        let producer = Producer::new(Arc::new(queue), Arc::new(JobRegistry::new()));

        assert_matches!(
            producer
                .descriptor(JobDescriptor::new("Anything"))
                .enqueue()
                .await,
            Err(RequeueError::Queue(QueueError::BadState))
        );
    }

    #[tokio::test]
    async fn delayed_message_is_hidden() {
        let queue = InMemoryQueue::new();

        producer(&queue)
            .descriptor(JobDescriptor::new("MockJob").with_property("Id", "42"))
            .with_initial_visibility_delay(Duration::from_secs(60))
            .enqueue()
            .await
            .unwrap();

        assert_eq!(queue.get_message(Duration::from_secs(60)).await.unwrap(), None);
    }
}
