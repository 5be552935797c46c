//! Scheduled delivery of export archives and the HTTP export API.

pub mod api;
pub mod archive;
pub mod config;
pub mod drop_target;
pub mod job;
pub mod metrics_defs;
pub mod scheduler;

pub use job::{JobOutcome, UploadContext, UploadError, UploadReport, upload_all, upload_fresh_data};
pub use scheduler::Scheduler;
