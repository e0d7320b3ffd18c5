//! Jobs: the units of work carried by queue messages.
//!
//! A job is any type implementing [`Job`]. Its serialized fields form the `Properties` of the
//! queue message and its [`Job::NAME`] forms the `Job` field, see [`JobDescriptor`].
use std::{any::Any, error::Error, fmt::Display, time::Duration};

use async_trait::async_trait;
use serde::{de::DeserializeOwned, Serialize};
use serde_json::{Map, Value};

pub mod descriptor;
pub mod registry;
pub(crate) mod runner;

pub use descriptor::JobDescriptor;

/// A unit of work that can be enqueued and executed.
#[async_trait]
pub trait Job: Serialize + DeserializeOwned + Send + Sync + 'static {
    /// The name of the job.
    ///
    /// This is used to associate queue messages with this particular job type. It should be
    /// unique amongst the jobs registered with a [`registry::JobRegistry`].
    ///
    /// The motivation for using a static string here is to enable developers to rename their rust
    /// types without breaking messages already sitting in the queue.
    const NAME: &'static str;
    /// This flag should be set to true if the job is computationally expensive.
    ///
    /// Under the covers this results in the job being ran via [`tokio::task::spawn_blocking`].
    /// See it's docs for more details about blocking futures.
    const BLOCKING: bool = false;

    async fn execute(&self) -> ExecutionResult;

    /// An upper bound on the time a single execution may take. Exceeding it counts as a failed
    /// execution.
    fn timeout(&self) -> Option<Duration> {
        None
    }
}

/// The outcome of executing a job.
pub enum ExecutionResult {
    /// The job completed successfully, its message will be deleted.
    Success,
    /// The job did not succeed, but did not raise an error either.
    Failure,
    /// The job failed with an error.
    Error { error: Box<dyn ExecutionError> },
}

impl From<bool> for ExecutionResult {
    fn from(value: bool) -> Self {
        if value {
            Self::Success
        } else {
            Self::Failure
        }
    }
}

impl<T> From<T> for ExecutionResult
where
    T: ExecutionError + 'static,
{
    fn from(value: T) -> Self {
        Self::Error {
            error: Box::new(value),
        }
    }
}

pub trait ExecutionError: Error + Send + Sync {
    fn error_type(&self) -> &'static str;
}

/// Details of a failed job execution, either an error returned by the job, a panic, or a
/// timeout.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("{error_type} error: {message}")]
pub struct JobFailure {
    pub error_type: ErrorType,
    pub message: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum ErrorType {
    Panic,
    Timeout,
    Other(String),
}

impl Display for ErrorType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Panic => write!(f, "panic"),
            Self::Timeout => write!(f, "timeout"),
            Self::Other(error_type) => write!(f, "{error_type}"),
        }
    }
}

/// Object safe view of a [`Job`].
///
/// This is implemented for every [`Job`] and is how jobs are handled once their concrete type
/// has been erased, e.g. by a [`registry::JobFactory`].
#[async_trait]
pub trait DynJob: Send + Sync + 'static {
    fn name(&self) -> &'static str;
    /// The job's properties as they are written to a queue message.
    fn properties(&self) -> Result<Map<String, Value>, serde_json::Error>;
    fn is_blocking(&self) -> bool;
    fn timeout(&self) -> Option<Duration>;
    fn as_any(&self) -> &dyn Any;
    async fn execute(&self) -> ExecutionResult;
}

#[async_trait]
impl<J: Job> DynJob for J {
    fn name(&self) -> &'static str {
        J::NAME
    }

    fn properties(&self) -> Result<Map<String, Value>, serde_json::Error> {
        match serde_json::to_value(self)? {
            Value::Object(properties) => Ok(properties),
            Value::Null => Ok(Map::new()),
            other => Err(serde::ser::Error::custom(format!(
                "job {} must serialize to an object, got {other}",
                J::NAME
            ))),
        }
    }

    fn is_blocking(&self) -> bool {
        J::BLOCKING
    }

    fn timeout(&self) -> Option<Duration> {
        Job::timeout(self)
    }

    fn as_any(&self) -> &dyn Any {
        self
    }

    async fn execute(&self) -> ExecutionResult {
        Job::execute(self).await
    }
}

impl dyn DynJob {
    /// Returns the concrete job if it is of type `J`.
    pub fn downcast_ref<J: Job>(&self) -> Option<&J> {
        self.as_any().downcast_ref()
    }
}

#[cfg(test)]
pub(crate) mod test {
    use serde::{Deserialize, Serialize};

    use super::*;

    /// Executes successfully.
    #[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
    pub(crate) struct MockJob {
        #[serde(rename = "Id")]
        pub id: String,
    }

    #[async_trait]
    impl Job for MockJob {
        const NAME: &'static str = "MockJob";
        async fn execute(&self) -> ExecutionResult {
            ExecutionResult::Success
        }
    }

    #[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
    pub(crate) enum MockOutcome {
        Success,
        Failure,
        Error(String),
        Panic,
        Sleep(std::time::Duration),
        Timeout,
    }

    #[derive(Debug, Clone, Serialize, Deserialize, Hash, PartialEq, Eq)]
    pub(crate) struct MockError(pub String);

    impl std::fmt::Display for MockError {
        fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
            write!(f, "{}", self.0)
        }
    }

    impl Error for MockError {}

    impl ExecutionError for MockError {
        fn error_type(&self) -> &'static str {
            "custom"
        }
    }

    /// Produces whatever outcome its `Outcome` property asks for.
    #[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
    pub(crate) struct OutcomeJob {
        #[serde(rename = "Outcome")]
        pub outcome: MockOutcome,
        #[serde(rename = "Key", default)]
        pub key: Option<String>,
    }

    impl OutcomeJob {
        pub(crate) fn new(outcome: MockOutcome) -> Self {
            Self { outcome, key: None }
        }
    }

    #[async_trait]
    impl Job for OutcomeJob {
        const NAME: &'static str = "OutcomeJob";
        async fn execute(&self) -> ExecutionResult {
            match &self.outcome {
                MockOutcome::Success => ExecutionResult::Success,
                MockOutcome::Failure => ExecutionResult::Failure,
                MockOutcome::Error(message) => MockError(message.clone()).into(),
                MockOutcome::Panic => panic!("job panicked"),
                MockOutcome::Sleep(duration) => {
                    tokio::time::sleep(*duration).await;
                    ExecutionResult::Success
                }
                MockOutcome::Timeout => {
                    tokio::time::sleep(std::time::Duration::from_millis(50)).await;
                    ExecutionResult::Success
                }
            }
        }

        fn timeout(&self) -> Option<std::time::Duration> {
            if matches!(self.outcome, MockOutcome::Timeout) {
                Some(std::time::Duration::from_millis(1))
            } else {
                None
            }
        }
    }

    #[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
    pub(crate) struct UnitJob;

    #[async_trait]
    impl Job for UnitJob {
        const NAME: &'static str = "UnitJob";
        const BLOCKING: bool = true;
        async fn execute(&self) -> ExecutionResult {
            true.into()
        }
    }

    #[test]
    fn properties_of_struct_job() {
        let job = MockJob {
            id: "42".to_owned(),
        };

        let properties = DynJob::properties(&job).unwrap();
        assert_eq!(properties.get("Id"), Some(&Value::String("42".to_owned())));
        assert_eq!(DynJob::name(&job), "MockJob");
        assert!(!job.is_blocking());
    }

    #[test]
    fn properties_of_unit_job_are_empty() {
        let properties = DynJob::properties(&UnitJob).unwrap();
        assert!(properties.is_empty());
        assert!(UnitJob.is_blocking());
    }

    #[test]
    fn downcast_erased_job() {
        let job: Box<dyn DynJob> = Box::new(MockJob {
            id: "42".to_owned(),
        });

        assert_eq!(
            job.downcast_ref::<MockJob>().map(|job| job.id.as_str()),
            Some("42")
        );
        assert!(job.downcast_ref::<UnitJob>().is_none());
    }

    #[test]
    fn execution_result_from_error() {
        let result: ExecutionResult = MockError("boom".to_owned()).into();
        match result {
            ExecutionResult::Error { error } => {
                assert_eq!(error.error_type(), "custom");
                assert_eq!(error.to_string(), "boom");
            }
            _ => panic!("expected an error result"),
        }
    }
}
