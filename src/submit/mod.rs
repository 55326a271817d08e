pub mod pipeline;
pub mod request;
pub mod runner;

pub use pipeline::{parse_job_id, RetryPolicy, SubmissionPipeline};
pub use request::{Submission, SubmissionKind, SubmitRequest};
pub use runner::{CommandOutput, CommandRunner, ProcessRunner};
