//! The `NeuralStyleWorker` side: workers pull pending jobs, report
//! intermediate renders and hand back a result or a failure.

use async_trait::async_trait;
use std::sync::Arc;
use tracing::debug;

use super::client::{invoke, RemoteCallError};
use super::types::*;
use super::{COMPLETE_JOB_METHOD, FAIL_JOB_METHOD, PROGRESS_REPORT_METHOD, REQUEST_JOB_METHOD};
use crate::{RpcClient, RpcConfig, RpcError, RpcServer};

#[async_trait]
pub trait WorkerHandler: Send + Sync + 'static {
    async fn request_job(&self, request: JobRequest) -> Result<JobRequestResponse, ImagerError>;
    async fn progress_report(&self, result: JobResult)
        -> Result<JobProgressResponse, ImagerError>;
    async fn complete_job(&self, result: JobResult) -> Result<JobResultResponse, ImagerError>;
    async fn fail_job(&self, fail: JobFail) -> Result<JobFailResponse, ImagerError>;
}

#[async_trait]
impl<T: WorkerHandler> WorkerHandler for Arc<T> {
    async fn request_job(&self, request: JobRequest) -> Result<JobRequestResponse, ImagerError> {
        (**self).request_job(request).await
    }

    async fn progress_report(
        &self,
        result: JobResult,
    ) -> Result<JobProgressResponse, ImagerError> {
        (**self).progress_report(result).await
    }

    async fn complete_job(&self, result: JobResult) -> Result<JobResultResponse, ImagerError> {
        (**self).complete_job(result).await
    }

    async fn fail_job(&self, fail: JobFail) -> Result<JobFailResponse, ImagerError> {
        (**self).fail_job(fail).await
    }
}

/// Registers the four worker methods on `rpc_server`.
pub(crate) async fn register<W: WorkerHandler>(rpc_server: &RpcServer, handler: Arc<W>) {
    {
        let handler = handler.clone();
        rpc_server
            .register_typed(REQUEST_JOB_METHOD, move |request: JobRequest| {
                let handler = handler.clone();
                async move {
                    handler
                        .request_job(request)
                        .await
                        .map_err(|e| RpcError::Rejected(e.to_string()))
                }
            })
            .await;
    }
    {
        let handler = handler.clone();
        rpc_server
            .register_typed(PROGRESS_REPORT_METHOD, move |result: JobResult| {
                let handler = handler.clone();
                async move {
                    handler
                        .progress_report(result)
                        .await
                        .map_err(|e| RpcError::Rejected(e.to_string()))
                }
            })
            .await;
    }
    {
        let handler = handler.clone();
        rpc_server
            .register_typed(COMPLETE_JOB_METHOD, move |result: JobResult| {
                let handler = handler.clone();
                async move {
                    handler
                        .complete_job(result)
                        .await
                        .map_err(|e| RpcError::Rejected(e.to_string()))
                }
            })
            .await;
    }
    rpc_server
        .register_typed(FAIL_JOB_METHOD, move |fail: JobFail| {
            let handler = handler.clone();
            async move {
                handler
                    .fail_job(fail)
                    .await
                    .map_err(|e| RpcError::Rejected(e.to_string()))
            }
        })
        .await;
}

/// Client a rendering worker uses to talk to the imager.
pub struct WorkerClient {
    inner: RpcClient,
}

impl WorkerClient {
    pub fn new(config: RpcConfig) -> Result<Self, RpcError> {
        Ok(Self {
            inner: RpcClient::new(config)?,
        })
    }

    /// Takes the next pending job, or `None` when the queue is empty.
    pub async fn request_job(&self) -> Result<Option<WorkerJob>, RemoteCallError> {
        let response: JobRequestResponse =
            invoke(&self.inner, REQUEST_JOB_METHOD, &JobRequest {}).await?;
        if let Some(job) = &response.job {
            debug!(id = %job.id, name = %job.name, "received job");
        }
        Ok(response.job)
    }

    pub async fn progress_report(&self, result: JobResult) -> Result<(), RemoteCallError> {
        let _: JobProgressResponse = invoke(&self.inner, PROGRESS_REPORT_METHOD, &result).await?;
        Ok(())
    }

    pub async fn complete_job(&self, result: JobResult) -> Result<(), RemoteCallError> {
        let _: JobResultResponse = invoke(&self.inner, COMPLETE_JOB_METHOD, &result).await?;
        Ok(())
    }

    pub async fn fail_job(
        &self,
        id: impl Into<String>,
        name: impl Into<String>,
    ) -> Result<(), RemoteCallError> {
        let fail = JobFail {
            id: id.into(),
            name: name.into(),
        };
        let _: JobFailResponse = invoke(&self.inner, FAIL_JOB_METHOD, &fail).await?;
        Ok(())
    }

    pub async fn shutdown(&self) {
        self.inner.shutdown().await
    }
}
