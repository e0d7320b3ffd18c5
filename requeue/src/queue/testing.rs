//! Test suite for ensuring a correct implementation of a queue client.
use std::time::Duration;

use super::*;

const LEASE: Duration = Duration::from_secs(60);
const SHORT_LEASE: Duration = Duration::from_millis(50);
const PAST_SHORT_LEASE: Duration = Duration::from_millis(150);

/// Create test suite for a [`QueueClient`] implementation.
///
/// For queue client implementors, it is useful to include this as part of your test suites.
///
/// # Example
///
/// ```
/// use requeue::test_suite;
/// use requeue::queue::memory::InMemoryQueue;
/// test_suite!(for: InMemoryQueue::new());
/// ```
///
/// If you using a different async test attribute you can configure the marco to use that instead.
///
/// ```ignore
/// use requeue::test_suite;
/// test_suite!(
///     attr: tokio::test(flavor = "multi_thread"),
///     args: (),
///     queue: CloudQueue::connect(&test_queue_name()).await.unwrap()
/// );
/// ```
#[macro_export]
macro_rules! test_suite {
    (for: $queue:expr) => {
        $crate::test_suite!(attr: tokio::test, args: (), queue: $queue);
    };
    (attr: $attr:meta, args: $args:tt, queue: $queue:expr) => {
        #[$attr]
        async fn get_message_from_empty_queue $args {
          let queue = $queue;
          $crate::queue::testing::get_message_from_empty_queue(queue).await;
        }
        #[$attr]
        async fn add_then_get_message $args {
          let queue = $queue;
          $crate::queue::testing::add_then_get_message(queue).await;
        }
        #[$attr]
        async fn get_message_hides_message $args {
          let queue = $queue;
          $crate::queue::testing::get_message_hides_message(queue).await;
        }
        #[$attr]
        async fn initial_visibility_delay_hides_message $args {
          let queue = $queue;
          $crate::queue::testing::initial_visibility_delay_hides_message(queue).await;
        }
        #[$attr]
        async fn expired_lease_makes_message_visible $args {
          let queue = $queue;
          $crate::queue::testing::expired_lease_makes_message_visible(queue).await;
        }
        #[$attr]
        async fn update_visibility_zero_makes_message_visible $args {
          let queue = $queue;
          $crate::queue::testing::update_visibility_zero_makes_message_visible(queue).await;
        }
        #[$attr]
        async fn update_visibility_extends_lease $args {
          let queue = $queue;
          $crate::queue::testing::update_visibility_extends_lease(queue).await;
        }
        #[$attr]
        async fn update_visibility_not_found $args {
          let queue = $queue;
          $crate::queue::testing::update_visibility_not_found(queue).await;
        }
        #[$attr]
        async fn delete_message $args {
          let queue = $queue;
          $crate::queue::testing::delete_message(queue).await;
        }
        #[$attr]
        async fn delete_message_not_found $args {
          let queue = $queue;
          $crate::queue::testing::delete_message_not_found(queue).await;
        }
        #[$attr]
        async fn stale_pop_receipt_not_found $args {
          let queue = $queue;
          $crate::queue::testing::stale_pop_receipt_not_found(queue).await;
        }
    };
}

pub use test_suite;

#[doc(hidden)]
pub async fn get_message_from_empty_queue(queue: impl QueueClient) {
    assert_eq!(queue.get_message(LEASE).await.unwrap(), None);
}

#[doc(hidden)]
pub async fn add_then_get_message(queue: impl QueueClient) {
    let id = queue.add_message("body".to_owned(), None).await.unwrap();

    let message = queue.get_message(LEASE).await.unwrap().unwrap();
    assert_eq!(message.id, id);
    assert_eq!(message.body, "body");
    assert_eq!(message.dequeue_count, 1);
    assert!(message.next_visible_time > message.inserted_at);
}

#[doc(hidden)]
pub async fn get_message_hides_message(queue: impl QueueClient) {
    queue.add_message("body".to_owned(), None).await.unwrap();

    assert!(queue.get_message(LEASE).await.unwrap().is_some());
    assert_eq!(queue.get_message(LEASE).await.unwrap(), None);
}

#[doc(hidden)]
pub async fn initial_visibility_delay_hides_message(queue: impl QueueClient) {
    queue
        .add_message("later".to_owned(), Some(LEASE))
        .await
        .unwrap();
    let id = queue.add_message("now".to_owned(), None).await.unwrap();

    let message = queue.get_message(LEASE).await.unwrap().unwrap();
    assert_eq!(message.id, id);
    assert_eq!(queue.get_message(LEASE).await.unwrap(), None);
}

#[doc(hidden)]
pub async fn expired_lease_makes_message_visible(queue: impl QueueClient) {
    let id = queue.add_message("body".to_owned(), None).await.unwrap();
    queue.get_message(SHORT_LEASE).await.unwrap().unwrap();

    tokio::time::sleep(PAST_SHORT_LEASE).await;

    let message = queue.get_message(LEASE).await.unwrap().unwrap();
    assert_eq!(message.id, id);
    assert_eq!(message.dequeue_count, 2);
}

#[doc(hidden)]
pub async fn update_visibility_zero_makes_message_visible(queue: impl QueueClient) {
    let id = queue.add_message("body".to_owned(), None).await.unwrap();
    let message = queue.get_message(LEASE).await.unwrap().unwrap();

    queue
        .update_visibility(&message, Duration::ZERO)
        .await
        .unwrap();

    let message = queue.get_message(LEASE).await.unwrap().unwrap();
    assert_eq!(message.id, id);
    assert_eq!(message.dequeue_count, 2);
}

#[doc(hidden)]
pub async fn update_visibility_extends_lease(queue: impl QueueClient) {
    queue.add_message("body".to_owned(), None).await.unwrap();
    let mut message = queue.get_message(SHORT_LEASE).await.unwrap().unwrap();

    message.pop_receipt = queue.update_visibility(&message, LEASE).await.unwrap();
    tokio::time::sleep(PAST_SHORT_LEASE).await;

    assert_eq!(queue.get_message(LEASE).await.unwrap(), None);
    // The renewed receipt still holds the lease.
    queue.delete_message(&message).await.unwrap();
}

#[doc(hidden)]
pub async fn update_visibility_not_found(queue: impl QueueClient) {
    queue.add_message("body".to_owned(), None).await.unwrap();
    let mut message = queue.get_message(LEASE).await.unwrap().unwrap();
    message.id = "unknown".to_owned();

    let result = queue.update_visibility(&message, LEASE).await;
    assert!(matches!(result, Err(QueueError::NotFound(_))));
}

#[doc(hidden)]
pub async fn delete_message(queue: impl QueueClient) {
    queue.add_message("body".to_owned(), None).await.unwrap();
    let message = queue.get_message(SHORT_LEASE).await.unwrap().unwrap();

    queue.delete_message(&message).await.unwrap();
    tokio::time::sleep(PAST_SHORT_LEASE).await;

    assert_eq!(queue.get_message(LEASE).await.unwrap(), None);
}

#[doc(hidden)]
pub async fn delete_message_not_found(queue: impl QueueClient) {
    queue.add_message("body".to_owned(), None).await.unwrap();
    let message = queue.get_message(LEASE).await.unwrap().unwrap();
    queue.delete_message(&message).await.unwrap();

    let result = queue.delete_message(&message).await;
    assert!(matches!(result, Err(QueueError::NotFound(_))));
}

#[doc(hidden)]
pub async fn stale_pop_receipt_not_found(queue: impl QueueClient) {
    queue.add_message("body".to_owned(), None).await.unwrap();
    let stale = queue.get_message(SHORT_LEASE).await.unwrap().unwrap();
    tokio::time::sleep(PAST_SHORT_LEASE).await;
    let current = queue.get_message(LEASE).await.unwrap().unwrap();

    let result = queue.delete_message(&stale).await;
    assert!(matches!(result, Err(QueueError::NotFound(_))));
    let result = queue.update_visibility(&stale, Duration::ZERO).await;
    assert!(matches!(result, Err(QueueError::NotFound(_))));

    queue.delete_message(&current).await.unwrap();
}
