use std::{sync::Arc, time::Duration};

use tokio::{sync::Mutex, task::JoinHandle};
use tokio_util::sync::CancellationToken;
use tracing::Instrument;

use crate::queue::{QueueClient, QueueError, QueueMessage};

/// A background task keeping the lease on a message alive while its job runs.
///
/// The task sleeps for the renewal interval, extends the lease to the full visibility timeout,
/// and repeats until stopped. The message's pop receipt is replaced with the receipt of each
/// renewal.
pub(crate) struct LeaseRenewal {
    cancellation_token: CancellationToken,
    handle: Option<JoinHandle<()>>,
}

impl LeaseRenewal {
    pub(crate) fn spawn(
        queue: Arc<dyn QueueClient>,
        message: Arc<Mutex<QueueMessage>>,
        visibility_timeout: Duration,
        interval: Duration,
    ) -> Self {
        let cancellation_token = CancellationToken::new();
        let handle = tokio::spawn(
            {
                let cancellation_token = cancellation_token.clone();
                async move {
                    loop {
                        tokio::select! {
                            biased;
                            _ = cancellation_token.cancelled() => break,
                            _ = tokio::time::sleep(interval) => {}
                        }
                        if !renew(queue.as_ref(), &message, visibility_timeout).await {
                            break;
                        }
                    }
                    tracing::debug!("Stopped lease renewal");
                }
            }
            .in_current_span(),
        );
        Self {
            cancellation_token,
            handle: Some(handle),
        }
    }

    /// Cancels the renewal and waits for a renewal in flight to complete.
    pub(crate) async fn stop(mut self) {
        self.cancellation_token.cancel();
        if let Some(handle) = self.handle.take() {
            let _ = handle
                .await
                .inspect_err(|err| tracing::error!(?err, "Lease renewal task failed: {err}"));
        }
    }
}

impl Drop for LeaseRenewal {
    fn drop(&mut self) {
        self.cancellation_token.cancel();
    }
}

/// Extends the lease on `message`, returning whether renewal should continue.
async fn renew(
    queue: &dyn QueueClient,
    message: &Mutex<QueueMessage>,
    visibility_timeout: Duration,
) -> bool {
    let mut message = message.lock().await;
    let message_id = message.id.clone();
    match queue.update_visibility(&message, visibility_timeout).await {
        Ok(pop_receipt) => {
            message.pop_receipt = pop_receipt;
            tracing::debug!(
                %message_id,
                "Extended lease on message {message_id} by {visibility_timeout:?}"
            );
            true
        }
        Err(QueueError::NotFound(_)) => {
            tracing::warn!(
                %message_id,
                "Lost the lease on message {message_id}, stopping renewal"
            );
            false
        }
        Err(err) => {
            tracing::error!(
                ?err,
                %message_id,
                "Failed to extend lease on message {message_id}, error: {err}"
            );
            true
        }
    }
}

#[cfg(test)]
mod test {
    use mockall::predicate::*;

    use super::*;
    use crate::queue::{memory::InMemoryQueue, MockQueueClient};

    async fn leased_message(queue: &InMemoryQueue, visibility_timeout: Duration) -> QueueMessage {
        queue.add_message("body".to_owned(), None).await.unwrap();
        queue.get_message(visibility_timeout).await.unwrap().unwrap()
    }

    #[tokio::test(start_paused = true)]
    async fn renews_until_stopped() {
        let queue = InMemoryQueue::new();
        let message = leased_message(&queue, Duration::from_secs(60)).await;
        let receipt = message.pop_receipt.clone();
        let message = Arc::new(Mutex::new(message));

        let renewal = LeaseRenewal::spawn(
            Arc::new(queue.clone()),
            message.clone(),
            Duration::from_secs(60),
            Duration::from_secs(45),
        );
        tokio::time::sleep(Duration::from_secs(100)).await;
        renewal.stop().await;

        // Two renewals took place, the lease is still held.
        assert_ne!(message.lock().await.pop_receipt, receipt);
        assert_eq!(queue.get_message(Duration::from_secs(60)).await.unwrap(), None);
        queue.delete_message(&*message.lock().await).await.unwrap();
    }

    #[tokio::test(start_paused = true)]
    async fn stop_before_first_renewal_does_not_renew() {
        let mut queue = MockQueueClient::new();
        queue.expect_update_visibility().never();
        let message = QueueMessage {
            id: "1".to_owned(),
            pop_receipt: "receipt".to_owned(),
            body: "body".to_owned(),
            dequeue_count: 1,
            inserted_at: chrono::Utc::now(),
            next_visible_time: chrono::Utc::now(),
        };

        let renewal = LeaseRenewal::spawn(
            Arc::new(queue),
            Arc::new(Mutex::new(message)),
            Duration::from_secs(60),
            Duration::from_secs(45),
        );
        tokio::time::sleep(Duration::from_secs(10)).await;
        renewal.stop().await;
    }

    #[tokio::test(start_paused = true)]
    async fn lost_lease_stops_renewal() {
        let mut queue = MockQueueClient::new();
        queue
            .expect_update_visibility()
            .with(always(), eq(Duration::from_secs(60)))
            .times(1)
            .returning(|message, _| Err(QueueError::NotFound(message.id.clone())));
        let message = QueueMessage {
            id: "1".to_owned(),
            pop_receipt: "receipt".to_owned(),
            body: "body".to_owned(),
            dequeue_count: 1,
            inserted_at: chrono::Utc::now(),
            next_visible_time: chrono::Utc::now(),
        };

        let renewal = LeaseRenewal::spawn(
            Arc::new(queue),
            Arc::new(Mutex::new(message)),
            Duration::from_secs(60),
            Duration::from_secs(45),
        );
        tokio::time::sleep(Duration::from_secs(200)).await;
        renewal.stop().await;
    }

    #[tokio::test(start_paused = true)]
    async fn transient_errors_keep_renewing() {
        let mut queue = MockQueueClient::new();
        let mut sequence = mockall::Sequence::new();
        queue
            .expect_update_visibility()
            .times(1)
            .in_sequence(&mut sequence)
            .returning(|_, _| Err(QueueError::BadState));
        queue
            .expect_update_visibility()
            .times(1)
            .in_sequence(&mut sequence)
            .returning(|_, _| Ok("renewed".to_owned()));
        let message = Arc::new(Mutex::new(QueueMessage {
            id: "1".to_owned(),
            pop_receipt: "receipt".to_owned(),
            body: "body".to_owned(),
            dequeue_count: 1,
            inserted_at: chrono::Utc::now(),
            next_visible_time: chrono::Utc::now(),
        }));

        let renewal = LeaseRenewal::spawn(
            Arc::new(queue),
            message.clone(),
            Duration::from_secs(60),
            Duration::from_secs(45),
        );
        tokio::time::sleep(Duration::from_secs(100)).await;
        renewal.stop().await;

        assert_eq!(message.lock().await.pop_receipt, "renewed");
    }
}
