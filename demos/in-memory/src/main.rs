use std::{sync::Arc, time::Duration};

use async_trait::async_trait;
use chrono::TimeDelta;
use requeue::{prelude::*, queue::memory::InMemoryQueue};
use serde::{Deserialize, Serialize};
use tokio_util::sync::CancellationToken;

#[tokio::main]
pub async fn main() {
    tracing_subscriber::fmt()
        .with_max_level(tracing::Level::DEBUG)
        .init();

    let queue = Arc::new(InMemoryQueue::new());
    let registry = Arc::new(
        JobRegistry::new()
            .with_job::<BasicJob>()
            .with_job::<FlakyJob>(),
    );

    let producer = Producer::new(queue.clone(), registry.clone());
    for (index, text) in ["First job", "Second job"].into_iter().enumerate() {
        let message_id = producer
            .job(&BasicJob {
                text: text.to_owned(),
            })
            .schedule_in(TimeDelta::seconds(index as i64))
            .enqueue()
            .await
            .unwrap();
        println!("Inserted job {message_id}");
    }
    producer.job(&FlakyJob {}).enqueue().await.unwrap();
    producer
        .descriptor(JobDescriptor::new("UnknownJob"))
        .enqueue()
        .await
        .unwrap();
    queue.add_message("not a job".to_owned(), None).await.unwrap();

    let consumer = Consumer::new(queue.clone(), registry)
        .with_settings(
            ConsumerSettings::default()
                .with_visibility_timeout(Duration::from_secs(30))
                .with_bad_message_handling(BadMessagePolicy::delete())
                .with_unknown_job_handling(UnknownJobPolicy::delete())
                .with_failed_job_handling(
                    FailedJobPolicy::requeue_then_delete_after(2)
                        .with_requeue_delay(Duration::from_millis(500)),
                ),
        )
        .with_perf_stats();

    let shutdown = CancellationToken::new();
    tokio::spawn({
        let shutdown = shutdown.clone();
        async move {
            tokio::time::sleep(Duration::from_secs(5)).await;
            shutdown.cancel();
        }
    });

    let strategy = ExponentialBackoff::new(4, TimeDelta::milliseconds(100))
        .unwrap()
        .with_jitter()
        .repeat_forever();
    while !shutdown.is_cancelled() {
        match consumer.one(&strategy, &shutdown).await {
            Ok(true) => println!("Executed a job"),
            Ok(false) => {}
            Err(error) => println!("Failed to consume message: {error}"),
        }
    }

    for (job, stats) in consumer.perf_snapshot() {
        println!(
            "{job}: {} succeeded, {} failed, success rate {:?}",
            stats.success_count,
            stats.failure_count,
            stats.success_rate()
        );
    }
}

#[derive(Serialize, Deserialize)]
struct BasicJob {
    #[serde(rename = "Text")]
    text: String,
}

#[async_trait]
impl Job for BasicJob {
    const NAME: &'static str = "BasicJob";
    async fn execute(&self) -> ExecutionResult {
        println!("{} running, with args: {}", Self::NAME, self.text);
        ExecutionResult::Success
    }
}

#[derive(Serialize, Deserialize)]
struct FlakyJob {}

#[async_trait]
impl Job for FlakyJob {
    const NAME: &'static str = "FlakyJob";
    async fn execute(&self) -> ExecutionResult {
        println!("{} running and failing", Self::NAME);
        ExecutionResult::Failure
    }

    fn timeout(&self) -> Option<Duration> {
        Some(Duration::from_secs(1))
    }
}
