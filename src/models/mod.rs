//! Data models for Mediaspool

pub mod job;

pub use job::{
    BulkSubmitRequest, Job, JobDetail, JobEvent, JobStatus, JobSummary, SubmitRequest,
    MAX_OUTPUT_LINES, SUBSCRIBER_CAPACITY,
};
