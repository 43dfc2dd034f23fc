pub mod priority_queue;
pub mod types;


pub use priority_queue::{JobHandle, PriorityJobQueue};
pub use types::{
    AddOptions, DEFAULT_JOB_PRIORITY, JobFailure, QueueConfig, QueueError, QueueMetrics, StopMode,
};
