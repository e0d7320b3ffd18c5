use std::{sync::Arc, time::Duration};

use tokio::task::JoinError;
use tracing::Instrument;

use super::{DynJob, ErrorType, ExecutionError, ExecutionResult, JobFailure};

/// Runs a job on its own task, guarding against panics and enforcing the job's timeout.
///
/// Returns whether the job reported success, or the failure that stopped it.
pub(crate) async fn run_job(job: Arc<dyn DynJob>) -> Result<bool, JobFailure> {
    let name = job.name();
    let timeout = job.timeout();
    let blocking = job.is_blocking();

    let fut = async move {
        match timeout {
            Some(timeout) => tokio::time::timeout(timeout, job.execute())
                .await
                .map_err(|_elapsed| timeout),
            None => Ok(job.execute().await),
        }
    }
    .in_current_span();

    let result = if blocking {
        tracing::debug!(job = name, "Executing blocking job {name}");
        tokio::task::spawn_blocking(|| futures::executor::block_on(fut))
    } else {
        tracing::debug!(job = name, "Executing job {name}");
        tokio::spawn(fut)
    };

    match result.await {
        Ok(Ok(ExecutionResult::Success)) => Ok(true),
        Ok(Ok(ExecutionResult::Failure)) => Ok(false),
        Ok(Ok(ExecutionResult::Error { error })) => Err(error.into()),
        Ok(Err(timeout)) => Err(timeout.into()),
        Err(error) => Err(error.into()),
    }
}

impl From<JoinError> for JobFailure {
    fn from(value: JoinError) -> Self {
        let msg = value.to_string();
        let message = match value.try_into_panic() {
            Ok(panic) => panic
                .downcast_ref::<&str>()
                .map(ToString::to_string)
                .or_else(|| panic.downcast_ref::<String>().cloned())
                .unwrap_or(msg),
            Err(_) => msg,
        };
        Self {
            error_type: ErrorType::Panic,
            message,
        }
    }
}

impl From<Box<dyn ExecutionError>> for JobFailure {
    fn from(value: Box<dyn ExecutionError>) -> Self {
        Self {
            error_type: ErrorType::Other(value.error_type().to_owned()),
            message: value.to_string(),
        }
    }
}

impl From<Duration> for JobFailure {
    fn from(value: Duration) -> Self {
        Self {
            error_type: ErrorType::Timeout,
            message: format!("Job failed to complete within timeout: {value:?}"),
        }
    }
}
