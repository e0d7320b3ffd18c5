//! Resolving job descriptors into runnable jobs.
use std::sync::Arc;

use fxhash::FxHashMap;
use serde_json::{Map, Value};

use super::{DynJob, Job, JobDescriptor};
use crate::RequeueError;

/// Converts between [`JobDescriptor`]s and jobs.
pub trait JobFactory: Send + Sync {
    /// Creates the job a descriptor names, binding its properties.
    ///
    /// Fails with [`RequeueError::UnknownJob`] when no job has the descriptor's name, and with
    /// [`RequeueError::Binding`] when the properties do not fit the job.
    fn create_job(&self, descriptor: &JobDescriptor) -> Result<Arc<dyn DynJob>, RequeueError>;

    /// Creates the descriptor used to enqueue a job.
    fn create_descriptor(&self, job: &dyn DynJob) -> Result<JobDescriptor, RequeueError>;
}

type Constructor = fn(Map<String, Value>) -> Result<Arc<dyn DynJob>, serde_json::Error>;

/// A [`JobFactory`] over a fixed set of [`Job`] types, keyed by [`Job::NAME`].
///
/// # Example
///
/// ```
/// # use requeue::prelude::*;
/// # use serde::{Deserialize, Serialize};
/// #[derive(Serialize, Deserialize)]
/// struct Cleanup {}
///
/// #[async_trait::async_trait]
/// impl Job for Cleanup {
///     const NAME: &'static str = "Cleanup";
///     async fn execute(&self) -> ExecutionResult {
///         ExecutionResult::Success
///     }
/// }
///
/// let registry = JobRegistry::new().with_job::<Cleanup>();
/// let job = registry.create_job(&JobDescriptor::new("Cleanup")).unwrap();
/// assert_eq!(job.name(), "Cleanup");
/// ```
#[derive(Clone, Default)]
pub struct JobRegistry {
    constructors: FxHashMap<&'static str, Constructor>,
}

impl std::fmt::Debug for JobRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("JobRegistry")
            .field("jobs", &self.constructors.keys().collect::<Vec<_>>())
            .finish()
    }
}

impl JobRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Registers `J`, replacing any job already registered under the same name.
    pub fn with_job<J: Job>(mut self) -> Self {
        if self.constructors.insert(J::NAME, construct::<J>).is_some() {
            tracing::warn!(job = J::NAME, "Job {} registered more than once", J::NAME);
        }
        self
    }

    /// Registers `J`, failing if a job is already registered under the same name.
    pub fn register<J: Job>(&mut self) -> Result<(), RequeueError> {
        if self.constructors.contains_key(J::NAME) {
            return Err(RequeueError::DuplicateJob(J::NAME));
        }
        self.constructors.insert(J::NAME, construct::<J>);
        Ok(())
    }

    pub fn contains(&self, job_name: &str) -> bool {
        self.constructors.contains_key(job_name)
    }

    pub fn job_names(&self) -> impl Iterator<Item = &'static str> + '_ {
        self.constructors.keys().copied()
    }
}

fn construct<J: Job>(properties: Map<String, Value>) -> Result<Arc<dyn DynJob>, serde_json::Error> {
    let is_empty = properties.is_empty();
    match serde_json::from_value::<J>(Value::Object(properties)) {
        Ok(job) => Ok(Arc::new(job)),
        // Jobs without properties may be unit structs.
        Err(error) if is_empty => serde_json::from_value::<J>(Value::Null)
            .map(|job| Arc::new(job) as Arc<dyn DynJob>)
            .map_err(|_| error),
        Err(error) => Err(error),
    }
}

impl JobFactory for JobRegistry {
    fn create_job(&self, descriptor: &JobDescriptor) -> Result<Arc<dyn DynJob>, RequeueError> {
        let constructor = self.constructors.get(descriptor.job_name.as_str()).ok_or_else(|| {
            RequeueError::UnknownJob {
                message_id: descriptor.queue_message_id.clone(),
                job_name: descriptor.job_name.clone(),
            }
        })?;
        constructor(descriptor.properties.clone()).map_err(|source| RequeueError::Binding {
            job_name: descriptor.job_name.clone(),
            source,
        })
    }

    fn create_descriptor(&self, job: &dyn DynJob) -> Result<JobDescriptor, RequeueError> {
        if !self.contains(job.name()) {
            return Err(RequeueError::UnknownJob {
                message_id: None,
                job_name: job.name().to_owned(),
            });
        }
        let properties = job.properties().map_err(|source| RequeueError::Binding {
            job_name: job.name().to_owned(),
            source,
        })?;
        Ok(JobDescriptor::new(job.name()).with_properties(properties))
    }
}

#[cfg(test)]
mod test {
    use assert_matches::assert_matches;
    use async_trait::async_trait;
    use chrono::{DateTime, TimeZone, Utc};
    use serde::{Deserialize, Serialize};
    use serde_json::json;
    use uuid::Uuid;

    use super::*;
    use crate::job::{
        test::{MockJob, UnitJob},
        ExecutionResult,
    };

    #[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
    struct TypedJob {
        #[serde(rename = "Name")]
        name: String,
        #[serde(rename = "Count")]
        count: i32,
        #[serde(rename = "Total")]
        total: u64,
        #[serde(rename = "Ratio")]
        ratio: f64,
        #[serde(rename = "Enabled")]
        enabled: bool,
        #[serde(rename = "Note")]
        note: Option<String>,
        #[serde(rename = "Limit")]
        limit: Option<i64>,
        #[serde(rename = "Correlation")]
        correlation: Uuid,
        #[serde(rename = "At")]
        at: DateTime<Utc>,
    }

    #[async_trait]
    impl Job for TypedJob {
        const NAME: &'static str = "TypedJob";
        async fn execute(&self) -> ExecutionResult {
            ExecutionResult::Success
        }
    }

    fn registry() -> JobRegistry {
        JobRegistry::new()
            .with_job::<MockJob>()
            .with_job::<TypedJob>()
            .with_job::<UnitJob>()
    }

    #[test]
    fn create_job_binds_properties() {
        let descriptor = JobDescriptor::new("MockJob").with_property("Id", "42");

        let job = registry().create_job(&descriptor).unwrap();

        assert_eq!(
            job.downcast_ref::<MockJob>(),
            Some(&MockJob {
                id: "42".to_owned()
            })
        );
    }

    #[test]
    fn typed_properties_survive_a_trip_through_the_queue_format() {
        let registry = registry();
        let job = TypedJob {
            name: "name".to_owned(),
            count: -3,
            total: u64::MAX,
            ratio: 0.25,
            enabled: true,
            note: Some("note".to_owned()),
            limit: None,
            correlation: Uuid::new_v4(),
            at: Utc.with_ymd_and_hms(2024, 5, 1, 12, 30, 0).unwrap(),
        };

        let body = registry.create_descriptor(&job).unwrap().encode().unwrap();
        let descriptor = JobDescriptor::decode(&body).unwrap();
        let decoded = registry.create_job(&descriptor).unwrap();

        assert_eq!(decoded.downcast_ref::<TypedJob>(), Some(&job));
    }

    #[test]
    fn unit_job_without_properties() {
        let job = registry()
            .create_job(&JobDescriptor::new("UnitJob"))
            .unwrap();

        assert!(job.downcast_ref::<UnitJob>().is_some());
    }

    #[test]
    fn unknown_job() {
        let descriptor = JobDescriptor::new("Missing").with_queue_message_id("1");

        assert_matches!(
            registry().create_job(&descriptor).map(|_| ()),
            Err(RequeueError::UnknownJob { message_id: Some(id), job_name }) if id == "1" && job_name == "Missing"
        );
        assert_matches!(
            JobRegistry::new().create_descriptor(&UnitJob),
            Err(RequeueError::UnknownJob { message_id: None, .. })
        );
    }

    #[test]
    fn binding_failure() {
        let descriptor = JobDescriptor::new("MockJob").with_property("Id", json!({"nested": 1}));

        assert_matches!(
            registry().create_job(&descriptor).map(|_| ()),
            Err(RequeueError::Binding { job_name, .. }) if job_name == "MockJob"
        );
        assert_matches!(
            registry()
                .create_job(&JobDescriptor::new("MockJob"))
                .map(|_| ()),
            Err(RequeueError::Binding { .. })
        );
    }

    #[test]
    fn register_rejects_duplicates() {
        let mut registry = JobRegistry::new();
        registry.register::<MockJob>().unwrap();

        assert_matches!(
            registry.register::<MockJob>(),
            Err(RequeueError::DuplicateJob("MockJob"))
        );
        assert!(registry.contains("MockJob"));
        assert_eq!(registry.job_names().collect::<Vec<_>>(), vec!["MockJob"]);
    }
}
