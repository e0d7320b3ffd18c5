//! The lifecycle of a single dequeued message.
//!
//! A [`JobExecutionContext`] is created by dequeuing a message. [`JobExecutionContext::execute`]
//! decodes the message, resolves and runs its job while keeping the message's lease alive, and
//! records what should happen to the message. [`JobExecutionContext::finalize`] applies that
//! decision, deleting the message or returning it to the queue.
//!
//! A context that is dropped without being finalized is finalized in the background on the
//! current tokio runtime, so the recorded decision is applied even if the owning future is
//! cancelled.
use std::{sync::Arc, time::Duration};

use tokio::sync::Mutex;
use tracing::{instrument, Instrument};

use crate::{
    job::{registry::JobFactory, runner, DynJob, JobDescriptor, JobFailure},
    queue::{QueueClient, QueueError, QueueMessage},
    settings::ConsumerSettings,
    stats::PerfStats,
    RequeueError,
};

mod renewal;

use renewal::LeaseRenewal;

/// What happens to a message once its context is finalized.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Disposition {
    pub should_delete: bool,
    /// How long a requeued message stays hidden before it is retried.
    pub requeue_visibility_timeout: Duration,
}

impl Disposition {
    pub const fn delete() -> Self {
        Self {
            should_delete: true,
            requeue_visibility_timeout: Duration::ZERO,
        }
    }

    pub const fn requeue(after: Duration) -> Self {
        Self {
            should_delete: false,
            requeue_visibility_timeout: after,
        }
    }
}

impl Default for Disposition {
    fn default() -> Self {
        Self::requeue(Duration::ZERO)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ContextState {
    /// The queue had no visible message.
    Empty,
    Dequeued,
    Executing,
    Succeeded,
    FailedExecution,
    BadFormat,
    UnknownJob,
}

/// The execution of one dequeued message.
pub struct JobExecutionContext {
    queue: Arc<dyn QueueClient>,
    factory: Arc<dyn JobFactory>,
    settings: Arc<ConsumerSettings>,
    perf_stats: Option<Arc<PerfStats>>,
    message: Option<Arc<Mutex<QueueMessage>>>,
    job: Option<Arc<dyn DynJob>>,
    state: ContextState,
    disposition: Disposition,
    renewal: Option<LeaseRenewal>,
    finalized: bool,
}

impl std::fmt::Debug for JobExecutionContext {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("JobExecutionContext")
            .field("job", &self.job_name())
            .field("state", &self.state)
            .field("disposition", &self.disposition)
            .field("finalized", &self.finalized)
            .finish()
    }
}

impl JobExecutionContext {
    /// Fetches the next visible message, hiding it for the configured visibility timeout.
    #[instrument(skip_all, fields(message_id))]
    pub async fn dequeue(
        queue: Arc<dyn QueueClient>,
        factory: Arc<dyn JobFactory>,
        settings: Arc<ConsumerSettings>,
    ) -> Result<Self, RequeueError> {
        let message = queue.get_message(settings.visibility_timeout()).await?;
        let state = match &message {
            Some(message) => {
                tracing::Span::current().record("message_id", message.id.as_str());
                tracing::debug!(
                    message_id = %message.id,
                    dequeue_count = message.dequeue_count,
                    "Dequeued message {}",
                    message.id
                );
                ContextState::Dequeued
            }
            None => {
                tracing::trace!("No visible message in the queue");
                ContextState::Empty
            }
        };
        Ok(Self {
            queue,
            factory,
            settings,
            perf_stats: None,
            message: message.map(|message| Arc::new(Mutex::new(message))),
            job: None,
            state,
            disposition: Disposition::default(),
            renewal: None,
            finalized: false,
        })
    }

    /// Times the execution of resolved jobs into `perf_stats`.
    pub fn with_perf_stats(mut self, perf_stats: Arc<PerfStats>) -> Self {
        self.perf_stats = Some(perf_stats);
        self
    }

    pub fn is_empty(&self) -> bool {
        self.message.is_none()
    }

    pub fn state(&self) -> ContextState {
        self.state
    }

    /// The name of the resolved job.
    pub fn job_name(&self) -> Option<&'static str> {
        self.job.as_ref().map(|job| job.name())
    }

    pub fn was_successful(&self) -> bool {
        self.state == ContextState::Succeeded
    }

    pub fn should_delete(&self) -> bool {
        self.disposition.should_delete
    }

    pub fn requeue_visibility_timeout(&self) -> Duration {
        self.disposition.requeue_visibility_timeout
    }

    pub fn disposition(&self) -> Disposition {
        self.disposition
    }

    /// Executes the job held by the dequeued message.
    ///
    /// Returns whether the job succeeded. Messages that do not hold a valid job, name an unknown
    /// job, or whose job failed with an error are reported as errors, after the handling of the
    /// message has been decided. The message is only deleted or requeued by
    /// [`finalize`](Self::finalize).
    #[instrument(skip(self), fields(message_id, job))]
    pub async fn execute(&mut self) -> Result<bool, RequeueError> {
        match self.state {
            ContextState::Empty => return Err(RequeueError::EmptyContext),
            ContextState::Dequeued => {}
            _ => return Err(RequeueError::AlreadyExecuted),
        }
        let shared = self.message.clone().ok_or(RequeueError::EmptyContext)?;
        let message = shared.lock().await.clone();
        tracing::Span::current().record("message_id", message.id.as_str());
        self.state = ContextState::Executing;

        let descriptor = match JobDescriptor::decode(&message.body) {
            Ok(descriptor) => descriptor.with_queue_message_id(message.id.clone()),
            Err(error) => return Err(self.handle_bad_message(&message, Box::new(error))),
        };

        let job = match self.factory.create_job(&descriptor) {
            Ok(job) => job,
            Err(RequeueError::UnknownJob { job_name, .. }) => {
                return Err(self.handle_unknown_job(&message, &descriptor, job_name))
            }
            Err(error @ RequeueError::Binding { .. }) => {
                return Err(self.handle_bad_message(&message, Box::new(error)))
            }
            Err(error) => {
                self.state = ContextState::FailedExecution;
                return Err(error);
            }
        };
        tracing::Span::current().record("job", job.name());
        self.job = Some(job.clone());

        self.renewal = Some(LeaseRenewal::spawn(
            self.queue.clone(),
            shared,
            self.settings.visibility_timeout(),
            self.settings.renewal_interval(),
        ));

        let mut measurement = self
            .perf_stats
            .as_ref()
            .map(|perf_stats| perf_stats.measure(job.name()));
        match runner::run_job(job.clone()).await {
            Ok(true) => {
                if let Some(measurement) = measurement.as_mut() {
                    measurement.succeeded();
                }
                tracing::debug!(
                    message_id = %message.id,
                    "Job {} completed successfully",
                    job.name()
                );
                self.state = ContextState::Succeeded;
                self.disposition = Disposition::delete();
                Ok(true)
            }
            Ok(false) => {
                self.handle_failed_job(&message, job.as_ref(), &descriptor, None)?;
                Ok(false)
            }
            Err(failure) => {
                self.handle_failed_job(&message, job.as_ref(), &descriptor, Some(&failure))?;
                Err(RequeueError::JobFailed {
                    job_name: job.name().to_owned(),
                    message_id: message.id.clone(),
                    source: failure,
                })
            }
        }
    }

    fn handle_bad_message(
        &mut self,
        message: &QueueMessage,
        source: Box<dyn std::error::Error + Send + Sync>,
    ) -> RequeueError {
        self.state = ContextState::BadFormat;
        let disposition = self
            .settings
            .bad_message_handling()
            .disposition(message.dequeue_count, |decide| decide(message));
        let error = RequeueError::BadFormat {
            message_id: message.id.clone(),
            source,
        };
        match self.apply(message, disposition) {
            Ok(()) => {
                tracing::warn!(
                    message_id = %message.id,
                    "Message {} does not hold a valid job, it will be {}: {error}",
                    message.id,
                    describe(&self.disposition),
                );
                error
            }
            Err(configuration) => configuration,
        }
    }

    fn handle_unknown_job(
        &mut self,
        message: &QueueMessage,
        descriptor: &JobDescriptor,
        job_name: String,
    ) -> RequeueError {
        self.state = ContextState::UnknownJob;
        let disposition = self
            .settings
            .unknown_job_handling()
            .disposition(message.dequeue_count, |decide| decide(descriptor));
        match self.apply(message, disposition) {
            Ok(()) => {
                tracing::warn!(
                    message_id = %message.id,
                    job = %job_name,
                    "Message {} names unknown job {job_name}, it will be {}",
                    message.id,
                    describe(&self.disposition),
                );
                RequeueError::UnknownJob {
                    message_id: Some(message.id.clone()),
                    job_name,
                }
            }
            Err(configuration) => configuration,
        }
    }

    fn handle_failed_job(
        &mut self,
        message: &QueueMessage,
        job: &dyn DynJob,
        descriptor: &JobDescriptor,
        failure: Option<&JobFailure>,
    ) -> Result<(), RequeueError> {
        self.state = ContextState::FailedExecution;
        let disposition = self
            .settings
            .failed_job_handling()
            .disposition(message.dequeue_count, |decide| {
                decide(job, descriptor, failure)
            });
        self.apply(message, disposition)?;
        match failure {
            Some(failure) => tracing::warn!(
                message_id = %message.id,
                "Job {} failed and will be {}: error type: {}, message: {}",
                job.name(),
                describe(&self.disposition),
                failure.error_type,
                failure.message
            ),
            None => tracing::warn!(
                message_id = %message.id,
                "Job {} did not succeed and will be {}",
                job.name(),
                describe(&self.disposition),
            ),
        }
        Ok(())
    }

    /// Records the decided disposition. A configuration error leaves the default disposition in
    /// place.
    fn apply(
        &mut self,
        message: &QueueMessage,
        disposition: Result<Disposition, RequeueError>,
    ) -> Result<(), RequeueError> {
        let disposition = disposition.inspect_err(|err| {
            tracing::error!(
                ?err,
                message_id = %message.id,
                "Failed to decide the handling of message {}, it will be requeued: {err}",
                message.id
            )
        })?;
        self.disposition = disposition;
        Ok(())
    }

    /// Stops the lease renewal and applies the disposition to the message.
    ///
    /// Finalizing more than once has no further effect. A message that has already been removed
    /// from the queue, or whose lease was lost, is not an error.
    #[instrument(skip(self))]
    pub async fn finalize(&mut self) -> Result<(), RequeueError> {
        match self.take_finalizer() {
            Some(finalizer) => finalizer.run().await,
            None => Ok(()),
        }
    }

    fn take_finalizer(&mut self) -> Option<Finalizer> {
        if self.finalized {
            return None;
        }
        self.finalized = true;
        Some(Finalizer {
            queue: self.queue.clone(),
            message: self.message.clone()?,
            renewal: self.renewal.take(),
            disposition: self.disposition,
        })
    }
}

impl Drop for JobExecutionContext {
    fn drop(&mut self) {
        let Some(finalizer) = self.take_finalizer() else {
            return;
        };
        match tokio::runtime::Handle::try_current() {
            Ok(handle) => {
                tracing::debug!("Execution context dropped before being finalized");
                handle.spawn(
                    async move {
                        let _ = finalizer.run().await.inspect_err(|err| {
                            tracing::error!(?err, "Failed to finalize message: {err}")
                        });
                    }
                    .in_current_span(),
                );
            }
            Err(_) => tracing::warn!(
                "Execution context dropped outside of a tokio runtime, the message will reappear \
                once its lease expires"
            ),
        }
    }
}

struct Finalizer {
    queue: Arc<dyn QueueClient>,
    message: Arc<Mutex<QueueMessage>>,
    renewal: Option<LeaseRenewal>,
    disposition: Disposition,
}

impl Finalizer {
    async fn run(self) -> Result<(), RequeueError> {
        if let Some(renewal) = self.renewal {
            renewal.stop().await;
        }
        let message = self.message.lock().await;
        let result = if self.disposition.should_delete {
            tracing::debug!(message_id = %message.id, "Deleting message {}", message.id);
            self.queue.delete_message(&message).await
        } else {
            let timeout = self.disposition.requeue_visibility_timeout;
            tracing::debug!(
                message_id = %message.id,
                "Requeuing message {} visible in {timeout:?}",
                message.id
            );
            self.queue
                .update_visibility(&message, timeout)
                .await
                .map(drop)
        };
        match result {
            Err(QueueError::NotFound(message_id)) => {
                tracing::debug!(%message_id, "Message {message_id} is no longer held");
                Ok(())
            }
            result => Ok(result?),
        }
    }
}

fn describe(disposition: &Disposition) -> String {
    if disposition.should_delete {
        "deleted".to_owned()
    } else {
        format!(
            "requeued in {:?}",
            disposition.requeue_visibility_timeout
        )
    }
}
