//! Type definitions for the service.
use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Encoding of an [`InputImage`] payload.
#[derive(Serialize, Deserialize, Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum ImageFormat {
    #[default]
    Jpg,
    Png,
}

impl ImageFormat {
    pub fn extension(self) -> &'static str {
        match self {
            ImageFormat::Jpg => "jpg",
            ImageFormat::Png => "png",
        }
    }
}

/// An encoded image plus its format tag.
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq, Eq, Default)]
pub struct InputImage {
    pub title: String,
    pub format: ImageFormat,
    pub image: Vec<u8>,
}

impl InputImage {
    /// A JPG payload without a title.
    pub fn jpg(image: Vec<u8>) -> Self {
        Self {
            title: String::new(),
            format: ImageFormat::Jpg,
            image,
        }
    }

    pub fn with_title(mut self, title: impl Into<String>) -> Self {
        self.title = title.into();
        self
    }
}

/// Submits a content image to be rendered in every style the server knows.
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq, Eq)]
pub struct CreateJobRequest {
    pub name: String,
    pub content: InputImage,
}

#[derive(Serialize, Deserialize, Debug, Clone, Default, PartialEq, Eq)]
pub struct CreateJobResponse {}

/// Submits a content image together with the style to render it in.
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq, Eq)]
pub struct CreateFullJobRequest {
    pub name: String,
    pub style: InputImage,
    pub content: InputImage,
}

#[derive(Serialize, Deserialize, Debug, Clone, Default, PartialEq, Eq)]
pub struct CreateFullJobResponse {}

/// Asks the imager for the next pending job.
#[derive(Serialize, Deserialize, Debug, Clone, Default, PartialEq, Eq)]
pub struct JobRequest {}

/// A job handed to a worker: one style and one content image.
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq, Eq)]
pub struct WorkerJob {
    pub id: String,
    pub name: String,
    pub style: InputImage,
    pub content: InputImage,
}

/// `None` when nothing is pending.
#[derive(Serialize, Deserialize, Debug, Clone, Default, PartialEq, Eq)]
pub struct JobRequestResponse {
    pub job: Option<WorkerJob>,
}

/// A rendered image for a job; intermediate for progress reports, final
/// for completions.
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq, Eq)]
pub struct JobResult {
    pub id: String,
    pub name: String,
    pub progress_count: u32,
    pub format: ImageFormat,
    pub image: Vec<u8>,
}

#[derive(Serialize, Deserialize, Debug, Clone, Default, PartialEq, Eq)]
pub struct JobProgressResponse {}

#[derive(Serialize, Deserialize, Debug, Clone, Default, PartialEq, Eq)]
pub struct JobResultResponse {}

/// Hands a job back to the pending queue.
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq, Eq)]
pub struct JobFail {
    pub id: String,
    pub name: String,
}

#[derive(Serialize, Deserialize, Debug, Clone, Default, PartialEq, Eq)]
pub struct JobFailResponse {}

/// Reasons an imager refuses a request.
#[derive(Serialize, Deserialize, Error, Debug, Clone, PartialEq, Eq)]
pub enum ImagerError {
    #[error("job name is empty")]
    EmptyName,
    #[error("content image is empty")]
    EmptyImage,
    #[error("style image is empty")]
    EmptyStyle,
    #[error("no job {0} in progress")]
    UnknownJob(String),
}
