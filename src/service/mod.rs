//! The `NeuralStyleImager` and `NeuralStyleWorker` services: wire types,
//! clients and server.

pub mod client;
pub mod server;
pub mod types;
pub mod worker;

pub use client::{ImagerClient, RemoteCallError};
pub use server::{ImagerHandler, ImagerServer};
pub use types::*;
pub use worker::{WorkerClient, WorkerHandler};

/// Method name for [`CreateJobRequest`].
pub const CREATE_JOB_METHOD: &str = "NeuralStyleImager.CreateJob";

/// Method name for [`CreateFullJobRequest`].
pub const CREATE_FULL_JOB_METHOD: &str = "NeuralStyleImager.CreateFullJob";

pub const REQUEST_JOB_METHOD: &str = "NeuralStyleWorker.RequestJob";
pub const PROGRESS_REPORT_METHOD: &str = "NeuralStyleWorker.ProgressReport";
pub const COMPLETE_JOB_METHOD: &str = "NeuralStyleWorker.CompleteJob";
pub const FAIL_JOB_METHOD: &str = "NeuralStyleWorker.FailJob";
