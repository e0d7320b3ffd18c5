//! Per job performance statistics collected by a consumer.
use std::{
    collections::HashMap,
    sync::{
        atomic::{AtomicU64, Ordering},
        Arc, RwLock,
    },
    time::Duration,
};

use fxhash::FxHashMap;
use tokio::time::Instant;

/// Execution counters for one job name.
#[derive(Debug, Default)]
pub struct JobPerfData {
    success_count: AtomicU64,
    failure_count: AtomicU64,
    success_micros: AtomicU64,
    failure_micros: AtomicU64,
}

impl JobPerfData {
    pub fn record_success(&self, elapsed: Duration) {
        self.success_count.fetch_add(1, Ordering::Relaxed);
        self.success_micros
            .fetch_add(as_micros(elapsed), Ordering::Relaxed);
    }

    pub fn record_failure(&self, elapsed: Duration) {
        self.failure_count.fetch_add(1, Ordering::Relaxed);
        self.failure_micros
            .fetch_add(as_micros(elapsed), Ordering::Relaxed);
    }

    pub fn snapshot(&self) -> JobPerfSnapshot {
        JobPerfSnapshot {
            success_count: self.success_count.load(Ordering::Relaxed),
            failure_count: self.failure_count.load(Ordering::Relaxed),
            total_success_duration: Duration::from_micros(
                self.success_micros.load(Ordering::Relaxed),
            ),
            total_failure_duration: Duration::from_micros(
                self.failure_micros.load(Ordering::Relaxed),
            ),
        }
    }
}

fn as_micros(elapsed: Duration) -> u64 {
    u64::try_from(elapsed.as_micros()).unwrap_or(u64::MAX)
}

/// A point in time copy of a [`JobPerfData`].
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct JobPerfSnapshot {
    pub success_count: u64,
    pub failure_count: u64,
    pub total_success_duration: Duration,
    pub total_failure_duration: Duration,
}

impl JobPerfSnapshot {
    pub fn total_count(&self) -> u64 {
        self.success_count + self.failure_count
    }

    /// The share of executions that succeeded, `None` before the first execution.
    pub fn success_rate(&self) -> Option<f64> {
        match self.total_count() {
            0 => None,
            total => Some(self.success_count as f64 / total as f64),
        }
    }

    pub fn average_success_duration(&self) -> Option<Duration> {
        average(self.total_success_duration, self.success_count)
    }

    pub fn average_failure_duration(&self) -> Option<Duration> {
        average(self.total_failure_duration, self.failure_count)
    }
}

fn average(total: Duration, count: u64) -> Option<Duration> {
    match count {
        0 => None,
        count => Some(Duration::from_micros(as_micros(total) / count)),
    }
}

/// The statistics of every job a consumer has executed, keyed by job name.
#[derive(Debug, Default)]
pub struct PerfStats {
    jobs: RwLock<FxHashMap<String, Arc<JobPerfData>>>,
}

impl PerfStats {
    pub fn new() -> Self {
        Self::default()
    }

    /// The counters for `job_name`, created on first use.
    pub fn job(&self, job_name: &str) -> Arc<JobPerfData> {
        if let Some(data) = self
            .jobs
            .read()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .get(job_name)
        {
            return data.clone();
        }
        self.jobs
            .write()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .entry(job_name.to_owned())
            .or_default()
            .clone()
    }

    pub fn snapshot(&self) -> HashMap<String, JobPerfSnapshot> {
        self.jobs
            .read()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .iter()
            .map(|(name, data)| (name.clone(), data.snapshot()))
            .collect()
    }

    /// Starts timing an execution of `job_name`. The execution counts as failed unless
    /// [`Measurement::succeeded`] is called before the measurement is dropped.
    pub(crate) fn measure(&self, job_name: &str) -> Measurement {
        Measurement {
            data: self.job(job_name),
            started: Instant::now(),
            succeeded: false,
        }
    }
}

pub(crate) struct Measurement {
    data: Arc<JobPerfData>,
    started: Instant,
    succeeded: bool,
}

impl Measurement {
    pub(crate) fn succeeded(&mut self) {
        self.succeeded = true;
    }
}

impl Drop for Measurement {
    fn drop(&mut self) {
        let elapsed = self.started.elapsed();
        if self.succeeded {
            self.data.record_success(elapsed);
        } else {
            self.data.record_failure(elapsed);
        }
    }
}
