//! Blocking facade over [`crate::ImagerClient`].
//!
//! Each method blocks the calling thread until the remote call completes.
//! The client owns a single-threaded Tokio runtime, so it must not be
//! created, used or dropped from inside another async runtime.

use tokio::runtime::{Builder, Runtime};

use crate::service::{self, InputImage, RemoteCallError};
use crate::{RpcConfig, RpcError};

pub struct ImagerClient {
    inner: service::ImagerClient,
    runtime: Runtime,
}

impl ImagerClient {
    pub fn new(config: RpcConfig) -> Result<Self, RpcError> {
        let inner = service::ImagerClient::new(config)?;
        let runtime = Builder::new_current_thread().enable_all().build()?;
        Ok(Self { inner, runtime })
    }

    pub fn create_job(&self, name: impl Into<String>, image: Vec<u8>) -> Result<(), RemoteCallError> {
        self.runtime.block_on(self.inner.create_job(name, image))
    }

    pub fn create_full_job(
        &self,
        name: impl Into<String>,
        style: InputImage,
        content: InputImage,
    ) -> Result<(), RemoteCallError> {
        self.runtime
            .block_on(self.inner.create_full_job(name, style, content))
    }

    pub fn shutdown(&self) {
        self.runtime.block_on(self.inner.shutdown())
    }

    pub fn is_closed(&self) -> bool {
        self.inner.is_closed()
    }
}
