//! Helpers for testing.
#![allow(clippy::vec_init_then_push)]

use crate::{job::JobDescriptor, queue::memory::InMemoryQueue};

#[doc(hidden)]
pub use serde_json::to_value;

/// A macro for making assertions about what jobs have been enqueued.
///
/// Facilitates making assertions about the jobs held by an
/// [`InMemoryQueue`](crate::queue::memory::InMemoryQueue), visible or not. Assertions can be based
/// on the job and its properties.
///
/// # Example
///
/// ```
/// # use requeue::prelude::*;
/// # use requeue::testing::assert_enqueued;
/// # use serde::{Deserialize, Serialize};
/// # use std::sync::Arc;
/// # #[derive(Serialize, Deserialize)]
/// # struct SendEmail {
/// #     #[serde(rename = "To")]
/// #     to: String,
/// # }
/// # #[async_trait::async_trait]
/// # impl Job for SendEmail {
/// #     const NAME: &'static str = "SendEmail";
/// #     async fn execute(&self) -> ExecutionResult {
/// #         ExecutionResult::Success
/// #     }
/// # }
/// # tokio::runtime::Builder::new_current_thread().enable_time().build().unwrap().block_on(async {
/// use requeue::queue::memory::InMemoryQueue;
/// let queue = InMemoryQueue::new();
/// let producer = Producer::new(
///     Arc::new(queue.clone()),
///     Arc::new(JobRegistry::new().with_job::<SendEmail>()),
/// );
///
/// producer
///     .job(&SendEmail { to: "a@example.com".to_owned() })
///     .enqueue()
///     .await
///     .unwrap();
/// producer
///     .job(&SendEmail { to: "b@example.com".to_owned() })
///     .enqueue()
///     .await
///     .unwrap();
///
/// assert_enqueued!(
///     to: queue,
///     with_property: "To" => "a@example.com",
///     for_job: SendEmail
/// );
///
/// assert_enqueued!(2 jobs, to: queue, for_job: "SendEmail");
///
/// assert_enqueued!(
///     0 jobs,
///     to: queue,
///     with_property: "To" => "c@example.com",
/// );
/// # });
/// ```
#[macro_export]
macro_rules! assert_enqueued {
    (1 job, to: $queue:ident, $($tail:tt)*) => {
        $crate::assert_enqueued!(@internal 1 to: $queue, $($tail)*);
    };
    ($n:literal jobs, to: $queue:ident, $($tail:tt)*) => {
        $crate::assert_enqueued!(@internal $n to: $queue, $($tail)*);
    };
    (to: $queue:ident, $($tail:tt)*) => {
        $crate::assert_enqueued!(@at_least_one to: $queue, $($tail)*);
    };
    (@at_least_one to: $queue:ident, $($tail:tt)*) => {{
        let mut filters: Vec<Box<dyn Fn(&$crate::job::JobDescriptor) -> bool>> = Vec::new();
        $crate::assert_enqueued!(@filter filters; $($tail)*);
        let all_jobs = $crate::testing::enqueued_jobs(&$queue);
        let jobs = all_jobs
            .iter()
            .filter(|descriptor| filters.iter().all(|filter| filter(*descriptor)))
            .collect::<Vec<_>>();
        assert!(
            !jobs.is_empty(),
            "No jobs enqueued {}\n\nAll enqueued jobs:\n{all_jobs:#?}",
            stringify!($($tail)*)
        );
    }};
    (@internal $n:literal to: $queue:ident, $($tail:tt)*) => {{
        let mut filters: Vec<Box<dyn Fn(&$crate::job::JobDescriptor) -> bool>> = Vec::new();
        $crate::assert_enqueued!(@filter filters; $($tail)*);
        let all_jobs = $crate::testing::enqueued_jobs(&$queue);
        let jobs = all_jobs
            .iter()
            .filter(|descriptor| filters.iter().all(|filter| filter(*descriptor)))
            .collect::<Vec<_>>();
        assert!(
            jobs.len() == $n,
            "Unexpected number of jobs enqueued {},\n\n\
            Expected {} jobs, found {} matching job enqueued:\n\n\
            Matching jobs:\n\
            {jobs:#?}\n\n\
            All enqueued jobs:\n\
            {all_jobs:#?}",
            stringify!($($tail)*),
            $n,
            jobs.len(),
        );
    }};
    (@filter $vec:ident;) => {};
    (@filter $vec:ident; with_property: $name:literal => $value:expr $(, $($tail:tt)*)?) => {
        let expected = $crate::testing::to_value($value).unwrap();
        $vec.push(Box::new(move |descriptor: &$crate::job::JobDescriptor| {
            descriptor.properties.get($name) == Some(&expected)
        }));
        $($crate::assert_enqueued!(@filter $vec; $($tail)*);)?
    };
    (@filter $vec:ident; for_job: $job:literal $(, $($tail:tt)*)?) => {
        $vec.push(Box::new(|descriptor: &$crate::job::JobDescriptor| {
            descriptor.job_name == $job
        }));
        $($crate::assert_enqueued!(@filter $vec; $($tail)*);)?
    };
    (@filter $vec:ident; for_job: $job:path $(, $($tail:tt)*)?) => {
        $vec.push(Box::new(|descriptor: &$crate::job::JobDescriptor| {
            descriptor.job_name == <$job as $crate::job::Job>::NAME
        }));
        $($crate::assert_enqueued!(@filter $vec; $($tail)*);)?
    };
}

pub use assert_enqueued;

/// The descriptors of every job held by `queue`, in enqueue order. Messages that do not hold a
/// valid job are skipped.
#[doc(hidden)]
pub fn enqueued_jobs(queue: &InMemoryQueue) -> Vec<JobDescriptor> {
    queue
        .messages()
        .unwrap_or_default()
        .into_iter()
        .filter_map(|message| {
            JobDescriptor::decode(&message.body)
                .ok()
                .map(|descriptor| descriptor.with_queue_message_id(message.id))
        })
        .collect()
}
