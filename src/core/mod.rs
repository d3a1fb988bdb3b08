//! Scheduling core: the pipeline, jobs, workers and the work queue.

pub mod error;
pub mod event;
pub mod job;
pub mod pipeline;
pub mod task;
pub mod worker;
pub mod workqueue;

pub use error::{
    AccountError, AppResult, EventError, LogError, PipelineError, ProxyError, QueueError,
};
pub use event::{handler, Event, Handler};
pub use job::{
    CancelToken, Failure, Job, JobContext, JobError, JobFn, JobId, JobInfo, JobResult, Outcome,
};
pub use pipeline::{ItemId, ItemState, Pipeline, Promotion};
pub use task::Task;
pub use worker::{Spawn, WorkFn, WorkerHandle};
pub use workqueue::{QueueEvents, WorkQueue};
