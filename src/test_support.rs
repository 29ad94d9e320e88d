//! Channel doubles shared by the unit tests.

use async_trait::async_trait;
use bytes::{Bytes, BytesMut};
use std::sync::{
    atomic::{AtomicUsize, Ordering},
    Arc, Mutex,
};

use crate::{ChannelAdapter, Connector, RpcConfig, RpcError, RpcRequest, RpcResponse};

/// How a mock channel answers each request.
#[derive(Clone, Debug)]
pub enum Responder {
    /// Returns the request params as the result.
    Echo,
    /// Returns an empty result.
    Ack,
    /// Returns the given result bytes.
    Reply(Vec<u8>),
    /// Returns the given error string.
    Fail(String),
    /// Refuses the connection.
    Refuse,
    /// Accepts the request, then closes without answering.
    Close,
    /// Accepts the request and never answers.
    Hang,
}

#[derive(Default)]
struct Log {
    connects: AtomicUsize,
    closes: AtomicUsize,
    sent: Mutex<Vec<RpcRequest>>,
}

/// Connector that hands out [`MockChannel`]s and records traffic.
#[derive(Clone)]
pub struct MockConnector {
    responder: Responder,
    log: Arc<Log>,
}

impl MockConnector {
    pub fn new(responder: Responder) -> Arc<Self> {
        Arc::new(Self {
            responder,
            log: Arc::new(Log::default()),
        })
    }

    pub fn connects(&self) -> usize {
        self.log.connects.load(Ordering::SeqCst)
    }

    pub fn closes(&self) -> usize {
        self.log.closes.load(Ordering::SeqCst)
    }

    pub fn sent(&self) -> Vec<RpcRequest> {
        self.log.sent.lock().unwrap().clone()
    }
}

#[async_trait]
impl Connector for MockConnector {
    async fn connect(&self, config: &RpcConfig) -> Result<Box<dyn ChannelAdapter>, RpcError> {
        self.log.connects.fetch_add(1, Ordering::SeqCst);
        if let Responder::Refuse = self.responder {
            return Err(RpcError::ConnectionError(format!(
                "{}: connection refused",
                config.address()
            )));
        }
        Ok(Box::new(MockChannel {
            responder: self.responder.clone(),
            log: self.log.clone(),
            pending: None,
        }))
    }
}

pub struct MockChannel {
    responder: Responder,
    log: Arc<Log>,
    pending: Option<Bytes>,
}

#[async_trait]
impl ChannelAdapter for MockChannel {
    async fn send_frame(&mut self, data: Bytes) -> Result<(), RpcError> {
        let request: RpcRequest = bincode::deserialize(&data)?;
        self.log.sent.lock().unwrap().push(request.clone());

        let response = match &self.responder {
            Responder::Echo => RpcResponse::new(request.id(), Some(request.params().to_vec()), None),
            Responder::Ack => RpcResponse::new(request.id(), Some(Vec::new()), None),
            Responder::Reply(data) => RpcResponse::new(request.id(), Some(data.clone()), None),
            Responder::Fail(msg) => RpcResponse::new(request.id(), None, Some(msg.clone())),
            Responder::Refuse | Responder::Close | Responder::Hang => return Ok(()),
        };
        self.pending = Some(Bytes::from(bincode::serialize(&response)?));
        Ok(())
    }

    async fn receive_frame(&mut self) -> Result<Option<BytesMut>, RpcError> {
        if let Responder::Hang = self.responder {
            std::future::pending::<()>().await;
        }
        Ok(self.pending.take().map(|frame| BytesMut::from(&frame[..])))
    }

    async fn close(&mut self) -> Result<(), RpcError> {
        self.log.closes.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }
}
