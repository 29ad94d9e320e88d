use async_trait::async_trait;
use std::{future::Future, sync::Arc};
use tokio::net::TcpListener;

use super::types::*;
use super::worker::WorkerHandler;
use super::{CREATE_FULL_JOB_METHOD, CREATE_JOB_METHOD};
use crate::{RpcConfig, RpcError, RpcServer};

/// Handler trait that imager implementations provide.
#[async_trait]
pub trait ImagerHandler: Send + Sync + 'static {
    async fn create_job(&self, request: CreateJobRequest) -> Result<CreateJobResponse, ImagerError>;
    async fn create_full_job(
        &self,
        request: CreateFullJobRequest,
    ) -> Result<CreateFullJobResponse, ImagerError>;
}

#[async_trait]
impl<T: ImagerHandler> ImagerHandler for Arc<T> {
    async fn create_job(&self, request: CreateJobRequest) -> Result<CreateJobResponse, ImagerError> {
        (**self).create_job(request).await
    }

    async fn create_full_job(
        &self,
        request: CreateFullJobRequest,
    ) -> Result<CreateFullJobResponse, ImagerError> {
        (**self).create_full_job(request).await
    }
}

/// Registers an [`ImagerHandler`] on an [`RpcServer`] and serves it.
pub struct ImagerServer<H: ImagerHandler> {
    handler: Arc<H>,
    rpc_server: RpcServer,
}

impl<H: ImagerHandler> ImagerServer<H> {
    /// Creates a new server with the given handler and configuration.
    pub fn new(handler: H, config: RpcConfig) -> Self {
        Self {
            handler: Arc::new(handler),
            rpc_server: RpcServer::new(config),
        }
    }

    /// Registers all service methods with the RPC server.
    pub async fn register_all(&self) {
        {
            let handler = self.handler.clone();
            self.rpc_server
                .register_typed(CREATE_JOB_METHOD, move |request: CreateJobRequest| {
                    let handler = handler.clone();
                    async move {
                        handler
                            .create_job(request)
                            .await
                            .map_err(|e| RpcError::Rejected(e.to_string()))
                    }
                })
                .await;
        }
        {
            let handler = self.handler.clone();
            self.rpc_server
                .register_typed(CREATE_FULL_JOB_METHOD, move |request: CreateFullJobRequest| {
                    let handler = handler.clone();
                    async move {
                        handler
                            .create_full_job(request)
                            .await
                            .map_err(|e| RpcError::Rejected(e.to_string()))
                    }
                })
                .await;
        }
    }

    /// Also serves the `NeuralStyleWorker` methods from `worker`.
    pub async fn register_worker<W: WorkerHandler>(&self, worker: W) {
        super::worker::register(&self.rpc_server, Arc::new(worker)).await;
    }

    /// Registers the methods and binds the configured address.
    pub async fn bind(&mut self) -> Result<TcpListener, RpcError> {
        self.register_all().await;
        self.rpc_server.bind().await
    }

    /// Serves `listener` until `shutdown` resolves.
    pub async fn run_until<F>(mut self, listener: TcpListener, shutdown: F) -> Result<(), RpcError>
    where
        F: Future<Output = ()> + Send,
    {
        self.rpc_server.start_until(listener, shutdown).await
    }

    /// Starts the server and begins accepting connections.
    pub async fn serve(mut self) -> Result<(), RpcError> {
        let listener = self.bind().await?;
        self.rpc_server.start(listener).await
    }
}
