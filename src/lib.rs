use async_trait::async_trait;
use bytes::{Bytes, BytesMut};
use futures_util::{SinkExt, StreamExt};
use serde::{Deserialize, Serialize};
use std::{
    collections::HashMap,
    future::Future,
    net::SocketAddr,
    pin::Pin,
    sync::{
        atomic::{AtomicBool, AtomicU64, Ordering},
        Arc,
    },
    time::Duration,
};
use thiserror::Error;
use tokio::{
    net::{TcpListener, TcpStream},
    sync::{Mutex, RwLock},
};
use tokio_util::{
    codec::{Framed, LengthDelimitedCodec},
    sync::CancellationToken,
};
use tracing::{debug, info, warn};

pub mod blocking;
pub mod memory;
pub mod notify;
pub mod service;

#[cfg(test)]
pub(crate) mod test_support;

pub use service::{ImagerClient, RemoteCallError};

pub mod runtime {
    //! Tokio runtime used by the imager server.
    use std::{env, io, thread};
    use tokio::runtime::{Builder, Runtime};

    /// Overrides the number of server worker threads.
    pub const SERVER_THREADS_ENV: &str = "IMAGER_SERVER_THREADS";

    /// Builds the multi-threaded server runtime, sized from
    /// [`SERVER_THREADS_ENV`] or the available parallelism.
    pub fn server_runtime() -> io::Result<Runtime> {
        let threads = env::var(SERVER_THREADS_ENV)
            .ok()
            .and_then(|raw| thread_count(&raw))
            .unwrap_or_else(|| thread::available_parallelism().map_or(1, |n| n.get()));
        tracing::debug!(threads, "building server runtime");
        Builder::new_multi_thread()
            .worker_threads(threads)
            .enable_all()
            .build()
    }

    /// A usable count is a positive integer; anything else falls back.
    fn thread_count(raw: &str) -> Option<usize> {
        raw.trim().parse::<usize>().ok().filter(|&n| n > 0)
    }

}

/// Bound on how long [`RpcClient::shutdown`] waits for in-flight calls.
pub const DEFAULT_SHUTDOWN_GRACE: Duration = Duration::from_secs(5);

/// Largest frame accepted on either side of a connection.
pub const DEFAULT_MAX_FRAME_LENGTH: usize = 16 * 1024 * 1024;

/// Environment variable holding the imager host.
pub const HOST_ENV: &str = "IMAGER_HOST";

/// Environment variable holding the imager port.
pub const PORT_ENV: &str = "IMAGER_PORT";

#[derive(Debug, Error)]
pub enum RpcError {
    #[error("Connection error: {0}")]
    ConnectionError(String),

    #[error("Serialization error: {0}")]
    SerializationError(#[from] bincode::Error),

    #[error("Request timeout")]
    Timeout,

    #[error("Unknown method: {0}")]
    UnknownMethod(String),

    #[error("Request rejected: {0}")]
    Rejected(String),

    #[error("Remote error: {0}")]
    RemoteError(String),

    #[error("Configuration error: {0}")]
    ConfigError(String),

    #[error("IO error: {0}")]
    IoError(#[from] std::io::Error),

    #[error("Channel is shut down")]
    ChannelClosed,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RpcRequest {
    id: u64,
    method: String,
    params: Vec<u8>,
}

impl RpcRequest {
    pub fn new(id: u64, method: String, params: Vec<u8>) -> Self {
        Self { id, method, params }
    }

    pub fn id(&self) -> u64 {
        self.id
    }

    pub fn method(&self) -> &str {
        &self.method
    }

    pub fn params(&self) -> &[u8] {
        &self.params
    }
}

#[derive(Debug, Serialize, Deserialize)]
pub struct RpcResponse {
    id: u64,
    result: Option<Vec<u8>>,
    error: Option<String>,
}

impl RpcResponse {
    pub fn new(id: u64, result: Option<Vec<u8>>, error: Option<String>) -> Self {
        Self { id, result, error }
    }

    pub fn from_result(id: u64, result: Result<Vec<u8>, RpcError>) -> Self {
        match result {
            Ok(data) => Self::new(id, Some(data), None),
            Err(e) => Self::new(id, None, Some(e.to_string())),
        }
    }

    pub fn id(&self) -> u64 {
        self.id
    }

    pub fn result(&self) -> Option<&Vec<u8>> {
        self.result.as_ref()
    }

    pub fn error(&self) -> Option<&String> {
        self.error.as_ref()
    }

    fn into_result(self) -> Result<Vec<u8>, RpcError> {
        match (self.result, self.error) {
            (_, Some(err_msg)) => Err(RpcError::RemoteError(err_msg)),
            (Some(data), None) => Ok(data),
            (None, None) => Err(RpcError::ConnectionError("Invalid response".into())),
        }
    }
}

/// Endpoint and channel settings shared by [`RpcClient`] and [`RpcServer`].
///
/// On the server side `host`/`port` name the bind address and port `0`
/// picks an ephemeral port.
#[derive(Debug, Clone)]
pub struct RpcConfig {
    pub host: String,

    pub port: u16,

    /// Per-call deadline. `None` waits for the response indefinitely.
    pub call_timeout: Option<Duration>,

    pub shutdown_grace: Duration,

    pub max_frame_length: usize,
}

impl RpcConfig {
    pub fn new(host: impl Into<String>, port: u16) -> Self {
        Self {
            host: host.into(),
            port,
            call_timeout: None,
            shutdown_grace: DEFAULT_SHUTDOWN_GRACE,
            max_frame_length: DEFAULT_MAX_FRAME_LENGTH,
        }
    }

    /// Reads the endpoint from [`HOST_ENV`] and [`PORT_ENV`].
    pub fn from_env() -> Result<Self, RpcError> {
        let host = std::env::var(HOST_ENV)
            .map_err(|_| RpcError::ConfigError(format!("{HOST_ENV} is not set")))?;
        let port = std::env::var(PORT_ENV)
            .map_err(|_| RpcError::ConfigError(format!("{PORT_ENV} is not set")))?;
        Ok(Self::new(host, parse_port(&port)?))
    }

    pub fn with_call_timeout(mut self, timeout: Duration) -> Self {
        self.call_timeout = Some(timeout);
        self
    }

    pub fn with_shutdown_grace(mut self, grace: Duration) -> Self {
        self.shutdown_grace = grace;
        self
    }

    pub fn with_max_frame_length(mut self, length: usize) -> Self {
        self.max_frame_length = length;
        self
    }

    /// Checks that the config names a dialable endpoint.
    pub fn validate(&self) -> Result<(), RpcError> {
        if self.host.trim().is_empty() {
            return Err(RpcError::ConfigError("host must not be empty".into()));
        }
        if self.port == 0 {
            return Err(RpcError::ConfigError("port must be in 1..=65535".into()));
        }
        Ok(())
    }

    pub fn address(&self) -> String {
        if self.host.contains(':') && !self.host.starts_with('[') {
            format!("[{}]:{}", self.host, self.port)
        } else {
            format!("{}:{}", self.host, self.port)
        }
    }

    fn codec(&self) -> LengthDelimitedCodec {
        LengthDelimitedCodec::builder()
            .max_frame_length(self.max_frame_length)
            .new_codec()
    }
}

/// Parses a port string, rejecting zero and anything outside `u16`.
pub fn parse_port(raw: &str) -> Result<u16, RpcError> {
    match raw.trim().parse::<u16>() {
        Ok(0) | Err(_) => Err(RpcError::ConfigError(format!("invalid port: {raw:?}"))),
        Ok(port) => Ok(port),
    }
}

type AsyncHandlerFn = Box<
    dyn Fn(Vec<u8>) -> Pin<Box<dyn Future<Output = Result<Vec<u8>, RpcError>> + Send>>
        + Send
        + Sync,
>;

#[async_trait]
pub(crate) trait ChannelAdapter: Send {
    async fn send_frame(&mut self, data: Bytes) -> Result<(), RpcError>;
    async fn receive_frame(&mut self) -> Result<Option<BytesMut>, RpcError>;
    async fn close(&mut self) -> Result<(), RpcError>;
}

pub(crate) struct TcpChannel {
    inner: Framed<TcpStream, LengthDelimitedCodec>,
}

#[async_trait]
impl ChannelAdapter for TcpChannel {
    async fn send_frame(&mut self, data: Bytes) -> Result<(), RpcError> {
        self.inner.send(data).await.map_err(RpcError::from)
    }

    async fn receive_frame(&mut self) -> Result<Option<BytesMut>, RpcError> {
        match self.inner.next().await {
            Some(Ok(frame)) => Ok(Some(frame)),
            Some(Err(err)) => Err(RpcError::ConnectionError(err.to_string())),
            None => Ok(None),
        }
    }

    async fn close(&mut self) -> Result<(), RpcError> {
        SinkExt::<Bytes>::close(&mut self.inner)
            .await
            .map_err(RpcError::from)
    }
}

#[async_trait]
pub(crate) trait Connector: Send + Sync {
    async fn connect(&self, config: &RpcConfig) -> Result<Box<dyn ChannelAdapter>, RpcError>;
}

/// Opens plaintext TCP channels.
pub(crate) struct TcpConnector;

#[async_trait]
impl Connector for TcpConnector {
    async fn connect(&self, config: &RpcConfig) -> Result<Box<dyn ChannelAdapter>, RpcError> {
        let stream = TcpStream::connect((config.host.as_str(), config.port))
            .await
            .map_err(|e| RpcError::ConnectionError(format!("{}: {e}", config.address())))?;
        stream.set_nodelay(true)?;
        Ok(Box::new(TcpChannel {
            inner: Framed::new(stream, config.codec()),
        }))
    }
}

#[derive(Clone)]
pub struct RpcServer {
    pub handlers: Arc<RwLock<HashMap<String, AsyncHandlerFn>>>,

    pub socket_addr: Option<SocketAddr>,

    pub config: RpcConfig,
}

impl RpcServer {
    pub fn new(config: RpcConfig) -> Self {
        Self {
            handlers: Arc::new(RwLock::new(HashMap::new())),
            socket_addr: None,
            config,
        }
    }

    pub async fn register<F, Fut>(&self, method: &str, handler: F)
    where
        F: Fn(Vec<u8>) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<Vec<u8>, RpcError>> + Send + 'static,
    {
        let mut handlers = self.handlers.write().await;
        handlers.insert(
            method.to_string(),
            Box::new(move |params: Vec<u8>| {
                Box::pin(handler(params)) as Pin<Box<dyn Future<Output = _> + Send>>
            }),
        );
    }

    pub async fn register_typed<Req, Resp, F, Fut>(&self, method: &str, handler: F)
    where
        Req: serde::de::DeserializeOwned + Send + 'static,
        Resp: serde::Serialize + Send + 'static,
        F: Fn(Req) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<Resp, RpcError>> + Send + 'static,
    {
        let handler = Arc::new(handler);
        self.register(method, move |params: Vec<u8>| {
            let handler = handler.clone();
            async move {
                let request: Req = bincode::deserialize(&params)?;
                let response = handler(request).await?;
                Ok(bincode::serialize(&response)?)
            }
        })
        .await;
    }

    pub async fn bind(&mut self) -> Result<TcpListener, RpcError> {
        let listener = TcpListener::bind((self.config.host.as_str(), self.config.port))
            .await
            .map_err(|e| {
                RpcError::ConfigError(format!("cannot bind {}: {e}", self.config.address()))
            })?;
        let local_addr = listener.local_addr()?;

        self.socket_addr = Some(local_addr);
        info!(%local_addr, "RPC server listening");
        Ok(listener)
    }

    /// Accepts connections until the listener is dropped with the task.
    pub async fn start(&mut self, listener: TcpListener) -> Result<(), RpcError> {
        self.start_until(listener, std::future::pending()).await
    }

    /// Accepts connections until `shutdown` resolves. Connections already
    /// accepted keep being served by their own tasks.
    pub async fn start_until<F>(&mut self, listener: TcpListener, shutdown: F) -> Result<(), RpcError>
    where
        F: Future<Output = ()> + Send,
    {
        tokio::pin!(shutdown);
        loop {
            tokio::select! {
                _ = &mut shutdown => {
                    info!("RPC server stopped accepting connections");
                    return Ok(());
                }
                accepted = listener.accept() => {
                    match accepted {
                        Ok((stream, peer)) => {
                            debug!(%peer, "accepted connection");
                            let _ = stream.set_nodelay(true);
                            let framed = Framed::new(stream, self.config.codec());
                            tokio::spawn(Self::handle_connection(self.handlers.clone(), framed, peer));
                        }
                        Err(err) => {
                            warn!("accept failed: {err}");
                            tokio::time::sleep(Duration::from_millis(10)).await;
                        }
                    }
                }
            }
        }
    }

    async fn handle_connection(
        handlers: Arc<RwLock<HashMap<String, AsyncHandlerFn>>>,
        mut framed: Framed<TcpStream, LengthDelimitedCodec>,
        peer: SocketAddr,
    ) {
        while let Some(frame) = framed.next().await {
            let frame = match frame {
                Ok(frame) => frame,
                Err(err) => {
                    debug!(%peer, "read failed: {err}");
                    break;
                }
            };

            let response = match Self::dispatch(&handlers, &frame).await {
                Ok(response) => response,
                Err(err) => {
                    warn!(%peer, "dropping connection after undecodable request: {err}");
                    break;
                }
            };

            let data = match bincode::serialize(&response) {
                Ok(data) => data,
                Err(err) => {
                    warn!(%peer, "failed to encode response: {err}");
                    break;
                }
            };

            if let Err(err) = framed.send(Bytes::from(data)).await {
                debug!(%peer, "write failed: {err}");
                break;
            }
        }
        debug!(%peer, "connection closed");
    }

    pub(crate) async fn dispatch(
        handlers: &RwLock<HashMap<String, AsyncHandlerFn>>,
        frame: &[u8],
    ) -> Result<RpcResponse, RpcError> {
        let RpcRequest { id, method, params } = bincode::deserialize(frame)?;
        debug!(id, %method, "dispatching request");

        let pending = {
            let handlers = handlers.read().await;
            handlers.get(&method).map(|handler| handler(params))
        };

        let result = match pending {
            Some(future) => future.await,
            None => Err(RpcError::UnknownMethod(method)),
        };
        Ok(RpcResponse::from_result(id, result))
    }
}

/// Client side of a single plaintext channel.
///
/// The channel is opened on the first call, not at construction, so an
/// unreachable endpoint surfaces as an error from that call. A channel that
/// fails mid-call is discarded and the next call opens a fresh one; the failed
/// call itself is never retried.
pub struct RpcClient {
    config: RpcConfig,
    connector: Arc<dyn Connector>,
    channel: Mutex<Option<Box<dyn ChannelAdapter>>>,
    closed: AtomicBool,
    cancel: CancellationToken,
    next_id: AtomicU64,
}

impl RpcClient {
    pub fn new(config: RpcConfig) -> Result<Self, RpcError> {
        config.validate()?;
        Ok(Self::with_connector(config, Arc::new(TcpConnector)))
    }

    pub(crate) fn with_connector(config: RpcConfig, connector: Arc<dyn Connector>) -> Self {
        Self {
            config,
            connector,
            channel: Mutex::new(None),
            closed: AtomicBool::new(false),
            cancel: CancellationToken::new(),
            next_id: AtomicU64::new(1),
        }
    }

    pub fn config(&self) -> &RpcConfig {
        &self.config
    }

    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst)
    }

    pub async fn call(&self, method: &str, params: Vec<u8>) -> Result<Vec<u8>, RpcError> {
        if self.is_closed() {
            return Err(RpcError::ChannelClosed);
        }

        let id = self.next_id.fetch_add(1, Ordering::SeqCst);
        let req_data = bincode::serialize(&RpcRequest::new(id, method.to_string(), params))?;

        let exchange = self.exchange(id, Bytes::from(req_data));
        let bounded = async {
            match self.config.call_timeout {
                Some(limit) => match tokio::time::timeout(limit, exchange).await {
                    Ok(result) => result,
                    Err(_) => Err(RpcError::Timeout),
                },
                None => exchange.await,
            }
        };

        tokio::select! {
            _ = self.cancel.cancelled() => Err(RpcError::ChannelClosed),
            result = bounded => result,
        }
    }

    async fn exchange(&self, id: u64, frame: Bytes) -> Result<Vec<u8>, RpcError> {
        let mut slot = self.channel.lock().await;
        if self.is_closed() {
            return Err(RpcError::ChannelClosed);
        }

        // Taken out for the duration of the call; a call that errors or is
        // dropped half-way never hands a desynchronised channel back.
        let mut channel = match slot.take() {
            Some(channel) => channel,
            None => {
                debug!(address = %self.config.address(), "opening channel");
                self.connector.connect(&self.config).await?
            }
        };

        channel.send_frame(frame).await?;
        let data = channel.receive_frame().await?.ok_or_else(|| {
            RpcError::ConnectionError("Connection closed before a response arrived".into())
        })?;
        let response: RpcResponse = bincode::deserialize(&data)?;
        if response.id() != id {
            return Err(RpcError::ConnectionError(format!(
                "response id {} does not match request id {id}",
                response.id()
            )));
        }

        *slot = Some(channel);
        response.into_result()
    }

    /// Closes the channel, waiting up to `shutdown_grace` for in-flight
    /// calls. Calls still running after that are cancelled with
    /// [`RpcError::ChannelClosed`]. Calling it again is a no-op.
    pub async fn shutdown(&self) {
        if self.closed.swap(true, Ordering::SeqCst) {
            return;
        }

        let grace = self.config.shutdown_grace;
        let slot = match tokio::time::timeout(grace, self.channel.lock()).await {
            Ok(slot) => Some(slot),
            Err(_) => {
                warn!(?grace, "in-flight calls outlived the shutdown grace, forcing close");
                self.cancel.cancel();
                // A call still holding the lock owns its channel, which goes
                // away with that call.
                self.channel.try_lock().ok()
            }
        };
        self.cancel.cancel();

        if let Some(mut channel) = slot.and_then(|mut slot| slot.take()) {
            if let Err(err) = channel.close().await {
                debug!("channel close reported: {err}");
            }
        }
        info!(address = %self.config.address(), "channel shut down");
    }
}





#[cfg(test)]
mod server_dispatch_tests {
    use super::*;

    #[tokio::test]
    async fn dispatch_routes_to_registered_handler() {
        let server = RpcServer::new(RpcConfig::new("127.0.0.1", 0));
        server
            .register("len", |params| async move { Ok(vec![params.len() as u8]) })
            .await;

        let frame = bincode::serialize(&RpcRequest::new(3, "len".into(), vec![0; 4])).unwrap();
        let response = RpcServer::dispatch(&server.handlers, &frame).await.unwrap();

        assert_eq!(response.id(), 3);
        assert_eq!(response.result(), Some(&vec![4]));
    }

    #[tokio::test]
    async fn dispatch_reports_unknown_method() {
        let server = RpcServer::new(RpcConfig::new("127.0.0.1", 0));

        let frame = bincode::serialize(&RpcRequest::new(9, "missing".into(), vec![])).unwrap();
        let response = RpcServer::dispatch(&server.handlers, &frame).await.unwrap();

        assert_eq!(response.error(), Some(&"Unknown method: missing".to_string()));
    }

    #[tokio::test]
    async fn dispatch_rejects_garbage_frames() {
        let server = RpcServer::new(RpcConfig::new("127.0.0.1", 0));
        let result = RpcServer::dispatch(&server.handlers, &[0xff]).await;
        assert!(matches!(result, Err(RpcError::SerializationError(_))));
    }
}
