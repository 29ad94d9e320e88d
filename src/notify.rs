//! User-facing messages for a submission attempt.

use std::fmt;
use tracing::warn;

use crate::service::{ImagerClient, RemoteCallError};

/// The single message shown after the user presses send.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Notification {
    NoImage,
    ServerNotAvailable,
    Processing,
}

impl Notification {
    pub fn message(self) -> &'static str {
        match self {
            Notification::NoImage => "No image available",
            Notification::ServerNotAvailable => "Server not available",
            Notification::Processing => "Processing images in the server",
        }
    }

    /// Maps a submission outcome. Every failure reads the same to the user.
    pub fn for_outcome(outcome: &Result<(), RemoteCallError>) -> Self {
        match outcome {
            Ok(()) => Notification::Processing,
            Err(_) => Notification::ServerNotAvailable,
        }
    }
}

impl fmt::Display for Notification {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.message())
    }
}

/// Submits `image` under `name` and reports the outcome as one notification.
pub async fn submit_job(client: &ImagerClient, name: &str, image: Option<Vec<u8>>) -> Notification {
    let Some(image) = image.filter(|image| !image.is_empty()) else {
        return Notification::NoImage;
    };

    let outcome = client.create_job(name, image).await;
    if let Err(err) = &outcome {
        warn!(%name, "submission failed: {err}");
    }
    Notification::for_outcome(&outcome)
}
