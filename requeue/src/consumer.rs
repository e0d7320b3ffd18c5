//! Polling a queue for jobs.
use std::{collections::HashMap, sync::Arc, time::Duration};

use tokio_util::sync::CancellationToken;
use tracing::instrument;

use crate::{
    context::JobExecutionContext,
    job::registry::JobFactory,
    queue::QueueClient,
    settings::ConsumerSettings,
    stats::{JobPerfSnapshot, PerfStats},
    wait::WaitStrategy,
    RequeueError,
};

/// Consumes jobs from a queue.
///
/// # Example
///
/// Run jobs until shutdown, waiting up to a minute between polls of an empty queue:
///
/// ```no_run
/// # use requeue::prelude::*;
/// # use requeue::queue::memory::InMemoryQueue;
/// # use std::sync::Arc;
/// # async fn run(consumer: Consumer, shutdown: CancellationToken) -> Result<(), RequeueError> {
/// let strategy = ExponentialBackoff::new(6, chrono::TimeDelta::seconds(1))?
///     .with_jitter()
///     .repeat_forever();
/// while !shutdown.is_cancelled() {
///     if let Err(error) = consumer.one(&strategy, &shutdown).await {
///         tracing::error!(?error, "Failed to consume job");
///     }
/// }
/// # Ok(())
/// # }
/// ```
pub struct Consumer {
    queue: Arc<dyn QueueClient>,
    factory: Arc<dyn JobFactory>,
    settings: Arc<ConsumerSettings>,
    perf_stats: Option<Arc<PerfStats>>,
}

impl Consumer {
    pub fn new(queue: Arc<dyn QueueClient>, factory: Arc<dyn JobFactory>) -> Self {
        Self {
            queue,
            factory,
            settings: Default::default(),
            perf_stats: None,
        }
    }

    pub fn with_settings(mut self, settings: ConsumerSettings) -> Self {
        self.settings = Arc::new(settings);
        self
    }

    /// Collects execution statistics per job, see [`Consumer::perf_snapshot`].
    pub fn with_perf_stats(mut self) -> Self {
        self.perf_stats = Some(Default::default());
        self
    }

    pub fn settings(&self) -> &ConsumerSettings {
        &self.settings
    }

    /// Dequeues the next message into a new execution context.
    pub async fn dequeue(&self) -> Result<JobExecutionContext, RequeueError> {
        let context = JobExecutionContext::dequeue(
            self.queue.clone(),
            self.factory.clone(),
            self.settings.clone(),
        )
        .await?;
        Ok(match &self.perf_stats {
            Some(perf_stats) => context.with_perf_stats(perf_stats.clone()),
            None => context,
        })
    }

    /// Consumes a single message, polling the queue until a message is found, the strategy gives
    /// up, or `cancellation_token` is cancelled.
    ///
    /// Returns whether a job was executed successfully. Messages that do not hold a valid job, or
    /// whose job fails with an error, are reported as errors once the message has been finalized.
    #[instrument(skip_all)]
    pub async fn one<S>(
        &self,
        strategy: &S,
        cancellation_token: &CancellationToken,
    ) -> Result<bool, RequeueError>
    where
        S: WaitStrategy + ?Sized,
    {
        let mut attempt: u32 = 1;
        loop {
            if cancellation_token.is_cancelled() {
                tracing::debug!("Consumer cancelled");
                return Ok(false);
            }

            let mut context = self.dequeue().await?;
            if context.is_empty() {
                context.finalize().await?;
                if !strategy.should_retry(attempt) {
                    tracing::trace!(attempt, "Queue empty, giving up");
                    return Ok(false);
                }
                let wait = strategy
                    .wait_time(attempt)?
                    .to_std()
                    .unwrap_or(Duration::ZERO);
                tracing::trace!(attempt, "Queue empty, polling again in {wait:?}");
                tokio::select! {
                    _ = cancellation_token.cancelled() => {
                        tracing::debug!("Consumer cancelled while waiting for messages");
                        return Ok(false);
                    }
                    _ = tokio::time::sleep(wait) => {}
                }
                attempt = attempt.saturating_add(1);
                continue;
            }

            let result = context.execute().await;
            let finalized = context.finalize().await;
            return match (result, finalized) {
                (result, Ok(())) => result,
                (Ok(_), Err(err)) => Err(err),
                (Err(err), Err(finalize_err)) => {
                    tracing::error!(
                        ?finalize_err,
                        "Failed to finalize message after execution error: {finalize_err}"
                    );
                    Err(err)
                }
            };
        }
    }

    /// A point in time copy of the execution statistics, empty unless enabled with
    /// [`Consumer::with_perf_stats`].
    pub fn perf_snapshot(&self) -> HashMap<String, JobPerfSnapshot> {
        self.perf_stats
            .as_ref()
            .map(|perf_stats| perf_stats.snapshot())
            .unwrap_or_default()
    }
}

#[cfg(test)]
mod test {
    use assert_matches::assert_matches;
    use chrono::TimeDelta;
    use uuid::Uuid;

    use super::*;
    use crate::{
        job::{
            registry::JobRegistry,
            test::{MockJob, MockOutcome, OutcomeJob},
            Job, JobDescriptor,
        },
        queue::{memory::InMemoryQueue, MockQueueClient, QueueError, QueueMessage},
        settings::{BadMessagePolicy, FailedJobPolicy, MessageHandling, UnknownJobPolicy},
        wait::{FixedDelay, NoRetry},
    };

    fn consumer(queue: &InMemoryQueue) -> Consumer {
        Consumer::new(
            Arc::new(queue.clone()),
            Arc::new(
                JobRegistry::new()
                    .with_job::<MockJob>()
                    .with_job::<OutcomeJob>(),
            ),
        )
    }

    fn outcome_body(outcome: MockOutcome, key: &str) -> String {
        JobDescriptor::new(OutcomeJob::NAME)
            .with_property("Outcome", serde_json::to_value(outcome).unwrap())
            .with_property("Key", key)
            .encode()
            .unwrap()
    }

    #[tokio::test]
    async fn empty_queue_without_retry() {
        let queue = InMemoryQueue::new();

        let executed = consumer(&queue)
            .one(&NoRetry, &CancellationToken::new())
            .await
            .unwrap();

        assert!(!executed);
    }

    #[tokio::test]
    async fn successful_job() {
        let queue = InMemoryQueue::new();
        let body = format!(
            r#"{{"Job":"MockJob","Properties":{{"Id":"{}"}}}}"#,
            Uuid::new_v4()
        );
        queue.add_message(body, None).await.unwrap();

        let executed = consumer(&queue)
            .one(&NoRetry, &CancellationToken::new())
            .await
            .unwrap();

        assert!(executed);
        assert!(queue.is_empty().unwrap());
    }

    #[tokio::test]
    async fn bad_format_deleted() {
        let queue = InMemoryQueue::new();
        queue.add_message("{".to_owned(), None).await.unwrap();
        let consumer = consumer(&queue).with_settings(
            ConsumerSettings::default().with_bad_message_handling(BadMessagePolicy::delete()),
        );

        assert_matches!(
            consumer.one(&NoRetry, &CancellationToken::new()).await,
            Err(RequeueError::BadFormat { .. })
        );
        assert!(queue.is_empty().unwrap());
    }

    #[tokio::test]
    async fn unknown_job_deleted_on_third_cycle() {
        let queue = InMemoryQueue::new();
        queue
            .add_message(r#"{"Job":"Unregistered"}"#.to_owned(), None)
            .await
            .unwrap();
        let consumer = consumer(&queue).with_settings(
            ConsumerSettings::default()
                .with_unknown_job_handling(UnknownJobPolicy::requeue_then_delete_after(3)),
        );

        for cycle in 1..=3 {
            assert_matches!(
                consumer.one(&NoRetry, &CancellationToken::new()).await,
                Err(RequeueError::UnknownJob { .. })
            );
            let messages = queue.messages().unwrap();
            match cycle {
                3 => assert!(messages.is_empty()),
                _ => assert_eq!(messages[0].dequeue_count, cycle),
            }
        }
        assert!(!consumer
            .one(&NoRetry, &CancellationToken::new())
            .await
            .unwrap());
    }

    #[tokio::test]
    async fn failed_job_per_case_disposition() {
        let queue = InMemoryQueue::new();
        queue
            .add_message(
                outcome_body(MockOutcome::Error("boom".to_owned()), "retry"),
                None,
            )
            .await
            .unwrap();
        let consumer = consumer(&queue).with_settings(
            ConsumerSettings::default().with_failed_job_handling(
                FailedJobPolicy::decide_per_case(|_, descriptor, _| {
                    match descriptor.property("Key").and_then(|key| key.as_str()) {
                        Some("retry") => MessageHandling::Requeue,
                        _ => MessageHandling::Delete,
                    }
                })
                .with_requeue_delay(std::time::Duration::from_secs(60)),
            ),
        );

        assert_matches!(
            consumer.one(&NoRetry, &CancellationToken::new()).await,
            Err(RequeueError::JobFailed { .. })
        );

        let messages = queue.messages().unwrap();
        assert_eq!(messages.len(), 1);
        assert!(messages[0].next_visible_time > chrono::Utc::now() + TimeDelta::seconds(50));
        assert!(!consumer
            .one(&NoRetry, &CancellationToken::new())
            .await
            .unwrap());
    }

    #[tokio::test(start_paused = true)]
    async fn waits_for_a_message() {
        let queue = InMemoryQueue::new();
        let strategy = FixedDelay::new(5, TimeDelta::seconds(10)).unwrap();
        tokio::spawn({
            let queue = queue.clone();
            async move {
                tokio::time::sleep(std::time::Duration::from_secs(25)).await;
                queue
                    .add_message(r#"{"Job":"MockJob","Properties":{"Id":"42"}}"#.to_owned(), None)
                    .await
                    .unwrap();
            }
        });

        let started = tokio::time::Instant::now();
        let executed = consumer(&queue)
            .one(&strategy, &CancellationToken::new())
            .await
            .unwrap();

        assert!(executed);
        let elapsed = started.elapsed();
        assert!(elapsed >= std::time::Duration::from_secs(30));
        assert!(elapsed < std::time::Duration::from_secs(30) + std::time::Duration::from_millis(10));
    }

    #[tokio::test(start_paused = true)]
    async fn gives_up_when_strategy_does() {
        let queue = InMemoryQueue::new();
        let strategy = FixedDelay::new(2, TimeDelta::seconds(10)).unwrap();

        let started = tokio::time::Instant::now();
        let executed = consumer(&queue)
            .one(&strategy, &CancellationToken::new())
            .await
            .unwrap();

        assert!(!executed);
        let elapsed = started.elapsed();
        assert!(elapsed >= std::time::Duration::from_secs(20));
        assert!(elapsed < std::time::Duration::from_secs(20) + std::time::Duration::from_millis(10));
    }

    #[tokio::test(start_paused = true)]
    async fn cancellation_interrupts_the_wait() {
        let queue = InMemoryQueue::new();
        let strategy = FixedDelay::new(5, TimeDelta::hours(1)).unwrap();
        let cancellation_token = CancellationToken::new();
        tokio::spawn({
            let cancellation_token = cancellation_token.clone();
            async move {
                tokio::time::sleep(std::time::Duration::from_secs(1)).await;
                cancellation_token.cancel();
            }
        });

        let started = tokio::time::Instant::now();
        let executed = consumer(&queue)
            .one(&strategy, &cancellation_token)
            .await
            .unwrap();

        assert!(!executed);
        let elapsed = started.elapsed();
        assert!(elapsed >= std::time::Duration::from_secs(1));
        assert!(elapsed < std::time::Duration::from_secs(1) + std::time::Duration::from_millis(10));
    }

    #[tokio::test]
    async fn cancelled_before_polling() {
        let mut queue = MockQueueClient::new();
        queue.expect_get_message().never();
        let cancellation_token = CancellationToken::new();
        cancellation_token.cancel();

        let consumer = Consumer::new(Arc::new(queue), Arc::new(JobRegistry::new()));

        assert!(!consumer
            .one(&NoRetry, &cancellation_token)
            .await
            .unwrap());
    }

    #[tokio::test]
    async fn execution_error_wins_over_finalize_error() {
        let mut queue = MockQueueClient::new();
        queue.expect_get_message().returning(|_| {
            Ok(Some(QueueMessage {
                id: "1".to_owned(),
                pop_receipt: "receipt".to_owned(),
                body: "not json".to_owned(),
                dequeue_count: 1,
                inserted_at: chrono::Utc::now(),
                next_visible_time: chrono::Utc::now(),
            }))
        });
        queue
            .expect_update_visibility()
            .returning(|_, _| Err(QueueError::BadState));
        let consumer = Consumer::new(Arc::new(queue), Arc::new(JobRegistry::new()));

        assert_matches!(
            consumer.one(&NoRetry, &CancellationToken::new()).await,
            Err(RequeueError::BadFormat { .. })
        );
    }

    #[tokio::test]
    async fn queue_errors_propagate() {
        let mut queue = MockQueueClient::new();
        queue
            .expect_get_message()
            .returning(|_| Err(QueueError::BadState));
        let consumer = Consumer::new(Arc::new(queue), Arc::new(JobRegistry::new()));

        assert_matches!(
            consumer.one(&NoRetry, &CancellationToken::new()).await,
            Err(RequeueError::Queue(QueueError::BadState))
        );
    }

    #[tokio::test]
    async fn perf_stats() {
        let queue = InMemoryQueue::new();
        queue
            .add_message(outcome_body(MockOutcome::Success, "a"), None)
            .await
            .unwrap();
        queue
            .add_message(outcome_body(MockOutcome::Panic, "b"), None)
            .await
            .unwrap();
        queue.add_message("bad".to_owned(), None).await.unwrap();
        let consumer = consumer(&queue)
            .with_settings(
                ConsumerSettings::default().with_failed_job_handling(FailedJobPolicy::delete()),
            )
            .with_perf_stats();

        assert!(consumer
            .one(&NoRetry, &CancellationToken::new())
            .await
            .unwrap());
        assert_matches!(
            consumer.one(&NoRetry, &CancellationToken::new()).await,
            Err(RequeueError::JobFailed { .. })
        );
        assert_matches!(
            consumer.one(&NoRetry, &CancellationToken::new()).await,
            Err(RequeueError::BadFormat { .. })
        );

        let snapshot = consumer.perf_snapshot();
        assert_eq!(snapshot.len(), 1);
        assert_eq!(snapshot["OutcomeJob"].success_count, 1);
        assert_eq!(snapshot["OutcomeJob"].failure_count, 1);
        assert_eq!(snapshot["OutcomeJob"].success_rate(), Some(0.5));
    }

    #[tokio::test]
    async fn perf_snapshot_disabled() {
        let queue = InMemoryQueue::new();
        queue
            .add_message(outcome_body(MockOutcome::Success, "a"), None)
            .await
            .unwrap();
        let consumer = consumer(&queue);

        consumer
            .one(&NoRetry, &CancellationToken::new())
            .await
            .unwrap();

        assert!(consumer.perf_snapshot().is_empty());
    }
}
