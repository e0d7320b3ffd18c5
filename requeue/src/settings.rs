//! Configuration of a [`Consumer`](crate::consumer::Consumer).
//!
//! Messages that cannot be executed successfully fall into one of three classes: messages that do
//! not hold a valid job, messages naming a job that is not registered, and jobs that failed. Each
//! class has its own [`HandlingPolicy`] deciding whether the message is deleted or returned to the
//! queue.
//!
//! ```
//! # use requeue::prelude::*;
//! # use std::time::Duration;
//! let settings = ConsumerSettings::default()
//!     .with_bad_message_handling(BadMessagePolicy::delete())
//!     .with_unknown_job_handling(
//!         UnknownJobPolicy::requeue_then_delete_after(3).with_requeue_delay(Duration::from_secs(30)),
//!     )
//!     .with_failed_job_handling(FailedJobPolicy::decide_per_case(|_job, _descriptor, failure| {
//!         match failure {
//!             Some(_) => MessageHandling::Delete,
//!             None => MessageHandling::Requeue,
//!         }
//!     }))
//!     .with_visibility_timeout(Duration::from_secs(120));
//!
//! assert_eq!(settings.renewal_interval(), Duration::from_secs(105));
//! ```
use std::{sync::Arc, time::Duration};

use crate::{
    context::Disposition,
    job::{DynJob, JobDescriptor, JobFailure},
    queue::QueueMessage,
    RequeueError,
};

/// How long a dequeued message stays hidden from other consumers.
pub const DEFAULT_VISIBILITY_TIMEOUT: Duration = Duration::from_secs(60);
/// How long before the lease expires that it is renewed.
pub const DEFAULT_RENEWAL_MARGIN: Duration = Duration::from_secs(15);
/// The shortest lease a message can be dequeued with.
pub const MIN_VISIBILITY_TIMEOUT: Duration = Duration::from_secs(1);
pub const DEFAULT_DELETE_THRESHOLD: u32 = 5;

/// What to do with a message that could not be executed successfully.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum MessageHandling {
    /// Return the message to the queue.
    Requeue,
    /// Return the message to the queue until it has been dequeued `threshold` times, then delete
    /// it.
    RequeueThenDeleteAfterThreshold,
    Delete,
    /// Ask the policy's decision function.
    DecidePerCase,
}

pub type BadMessageDecider = dyn Fn(&QueueMessage) -> MessageHandling + Send + Sync;
pub type UnknownJobDecider = dyn Fn(&JobDescriptor) -> MessageHandling + Send + Sync;
pub type FailedJobDecider =
    dyn Fn(&dyn DynJob, &JobDescriptor, Option<&JobFailure>) -> MessageHandling + Send + Sync;

pub type BadMessagePolicy = HandlingPolicy<BadMessageDecider>;
pub type UnknownJobPolicy = HandlingPolicy<UnknownJobDecider>;
pub type FailedJobPolicy = HandlingPolicy<FailedJobDecider>;

/// The handling for one class of unsuccessful messages.
pub struct HandlingPolicy<D: ?Sized> {
    handling: MessageHandling,
    threshold: u32,
    requeue_delay: Duration,
    decide: Option<Arc<D>>,
}

impl<D: ?Sized> Clone for HandlingPolicy<D> {
    fn clone(&self) -> Self {
        Self {
            handling: self.handling,
            threshold: self.threshold,
            requeue_delay: self.requeue_delay,
            decide: self.decide.clone(),
        }
    }
}

impl<D: ?Sized> std::fmt::Debug for HandlingPolicy<D> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("HandlingPolicy")
            .field("handling", &self.handling)
            .field("threshold", &self.threshold)
            .field("requeue_delay", &self.requeue_delay)
            .field("decide", &self.decide.is_some())
            .finish()
    }
}

impl<D: ?Sized> Default for HandlingPolicy<D> {
    fn default() -> Self {
        Self::requeue_then_delete_after(DEFAULT_DELETE_THRESHOLD)
    }
}

impl<D: ?Sized> HandlingPolicy<D> {
    /// A policy with the given handling, the default threshold and no requeue delay.
    ///
    /// Selecting [`MessageHandling::DecidePerCase`] here without a decision function results in
    /// [`RequeueError::Configuration`] when the policy is applied.
    pub fn new(handling: MessageHandling) -> Self {
        Self {
            handling,
            threshold: DEFAULT_DELETE_THRESHOLD,
            requeue_delay: Duration::ZERO,
            decide: None,
        }
    }

    pub fn requeue() -> Self {
        Self::new(MessageHandling::Requeue)
    }

    pub fn delete() -> Self {
        Self::new(MessageHandling::Delete)
    }

    pub fn requeue_then_delete_after(threshold: u32) -> Self {
        Self::new(MessageHandling::RequeueThenDeleteAfterThreshold).with_threshold(threshold)
    }

    pub fn with_threshold(mut self, threshold: u32) -> Self {
        self.threshold = threshold;
        self
    }

    /// How long a requeued message stays hidden before it is retried.
    pub fn with_requeue_delay(mut self, requeue_delay: Duration) -> Self {
        self.requeue_delay = requeue_delay;
        self
    }

    fn with_decider(decide: Arc<D>) -> Self {
        Self {
            decide: Some(decide),
            ..Self::new(MessageHandling::DecidePerCase)
        }
    }

    pub fn handling(&self) -> MessageHandling {
        self.handling
    }

    pub fn threshold(&self) -> u32 {
        self.threshold
    }

    pub fn requeue_delay(&self) -> Duration {
        self.requeue_delay
    }

    /// Resolves the handling of a message that has been dequeued `dequeue_count` times, asking
    /// the decision function through `decide` when the policy decides per case.
    pub(crate) fn disposition(
        &self,
        dequeue_count: u32,
        decide: impl FnOnce(&D) -> MessageHandling,
    ) -> Result<Disposition, RequeueError> {
        let handling = match self.handling {
            MessageHandling::DecidePerCase => {
                let decider = self.decide.as_deref().ok_or_else(|| {
                    RequeueError::Configuration(
                        "handling is DecidePerCase but no decision function was provided"
                            .to_owned(),
                    )
                })?;
                decide(decider)
            }
            handling => handling,
        };
        match handling {
            MessageHandling::Requeue => Ok(Disposition::requeue(self.requeue_delay)),
            MessageHandling::RequeueThenDeleteAfterThreshold if dequeue_count >= self.threshold => {
                Ok(Disposition::delete())
            }
            MessageHandling::RequeueThenDeleteAfterThreshold => {
                Ok(Disposition::requeue(self.requeue_delay))
            }
            MessageHandling::Delete => Ok(Disposition::delete()),
            MessageHandling::DecidePerCase => Err(RequeueError::Configuration(
                "decision function returned DecidePerCase".to_owned(),
            )),
        }
    }
}

impl HandlingPolicy<BadMessageDecider> {
    pub fn decide_per_case(
        decide: impl Fn(&QueueMessage) -> MessageHandling + Send + Sync + 'static,
    ) -> Self {
        Self::with_decider(Arc::new(decide))
    }
}

impl HandlingPolicy<UnknownJobDecider> {
    pub fn decide_per_case(
        decide: impl Fn(&JobDescriptor) -> MessageHandling + Send + Sync + 'static,
    ) -> Self {
        Self::with_decider(Arc::new(decide))
    }
}

impl HandlingPolicy<FailedJobDecider> {
    pub fn decide_per_case(
        decide: impl Fn(&dyn DynJob, &JobDescriptor, Option<&JobFailure>) -> MessageHandling
            + Send
            + Sync
            + 'static,
    ) -> Self {
        Self::with_decider(Arc::new(decide))
    }
}

/// The settings shared by every message a consumer executes.
#[derive(Debug, Clone)]
pub struct ConsumerSettings {
    bad_message_handling: BadMessagePolicy,
    unknown_job_handling: UnknownJobPolicy,
    failed_job_handling: FailedJobPolicy,
    visibility_timeout: Duration,
    renewal_margin: Duration,
}

impl Default for ConsumerSettings {
    fn default() -> Self {
        Self {
            bad_message_handling: Default::default(),
            unknown_job_handling: Default::default(),
            failed_job_handling: Default::default(),
            visibility_timeout: DEFAULT_VISIBILITY_TIMEOUT,
            renewal_margin: DEFAULT_RENEWAL_MARGIN,
        }
    }
}

impl ConsumerSettings {
    pub fn with_bad_message_handling(mut self, policy: BadMessagePolicy) -> Self {
        self.bad_message_handling = policy;
        self
    }

    pub fn with_unknown_job_handling(mut self, policy: UnknownJobPolicy) -> Self {
        self.unknown_job_handling = policy;
        self
    }

    pub fn with_failed_job_handling(mut self, policy: FailedJobPolicy) -> Self {
        self.failed_job_handling = policy;
        self
    }

    /// How long a dequeued message is hidden from other consumers, and how far each lease
    /// renewal extends it. Raised to [`MIN_VISIBILITY_TIMEOUT`] if shorter.
    pub fn with_visibility_timeout(mut self, visibility_timeout: Duration) -> Self {
        if visibility_timeout < MIN_VISIBILITY_TIMEOUT {
            tracing::warn!(
                ?visibility_timeout,
                "Visibility timeout {visibility_timeout:?} is below the minimum, using {MIN_VISIBILITY_TIMEOUT:?}"
            );
        }
        self.visibility_timeout = visibility_timeout.max(MIN_VISIBILITY_TIMEOUT);
        self
    }

    /// How long before the lease would expire that it is renewed.
    pub fn with_renewal_margin(mut self, renewal_margin: Duration) -> Self {
        self.renewal_margin = renewal_margin;
        self
    }

    pub fn bad_message_handling(&self) -> &BadMessagePolicy {
        &self.bad_message_handling
    }

    pub fn unknown_job_handling(&self) -> &UnknownJobPolicy {
        &self.unknown_job_handling
    }

    pub fn failed_job_handling(&self) -> &FailedJobPolicy {
        &self.failed_job_handling
    }

    pub fn visibility_timeout(&self) -> Duration {
        self.visibility_timeout
    }

    pub fn renewal_margin(&self) -> Duration {
        self.renewal_margin
    }

    /// The time between lease renewals.
    pub fn renewal_interval(&self) -> Duration {
        if self.renewal_margin < self.visibility_timeout {
            self.visibility_timeout - self.renewal_margin
        } else {
            self.visibility_timeout / 2
        }
    }
}
