//! The purpose of this module is to alleviate the need to import many of the `[requeue]` types.
//!
//! ```
//! # #![allow(unused_imports)]
//! use requeue::prelude::*;
//! ```
pub use crate::consumer::Consumer;
pub use crate::context::{Disposition, JobExecutionContext};
pub use crate::job::registry::{JobFactory, JobRegistry};
pub use crate::job::{DynJob, ExecutionError, ExecutionResult, Job, JobDescriptor, JobFailure};
pub use crate::producer::Producer;
pub use crate::queue::{QueueClient, QueueError, QueueMessage};
pub use crate::settings::{
    BadMessagePolicy, ConsumerSettings, FailedJobPolicy, MessageHandling, UnknownJobPolicy,
};
pub use crate::wait::{
    ExponentialBackoff, FixedDelay, LinearBackoff, NoRetry, RepeatForever, WaitStrategy,
    WaitStrategyError, WithJitter,
};
pub use crate::RequeueError;
pub use tokio_util::sync::CancellationToken;
