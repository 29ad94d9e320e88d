use serde::{de::DeserializeOwned, Serialize};
use thiserror::Error;
use tracing::debug;

use super::types::*;
use super::{CREATE_FULL_JOB_METHOD, CREATE_JOB_METHOD};
use crate::{RpcClient, RpcConfig, RpcError};

/// The only failure [`ImagerClient`] reports: the remote call did not
/// succeed. The transport-level cause is kept as the source.
#[derive(Debug, Error)]
#[error("remote call failed: {source}")]
pub struct RemoteCallError {
    #[from]
    source: RpcError,
}

impl RemoteCallError {
    pub fn cause(&self) -> &RpcError {
        &self.source
    }
}

/// Client for submitting images to a neural-style imager.
pub struct ImagerClient {
    inner: RpcClient,
}

impl ImagerClient {
    /// Creates a client for the endpoint in `config`. Fails if the host is
    /// empty or the port is zero; no connection is attempted until the first
    /// call.
    pub fn new(config: RpcConfig) -> Result<Self, RpcError> {
        Ok(Self {
            inner: RpcClient::new(config)?,
        })
    }

    pub(crate) fn from_rpc_client(inner: RpcClient) -> Self {
        Self { inner }
    }

    /// Submits `image` as a JPG content image named `name`. Exactly one
    /// remote call is made and nothing is retried.
    pub async fn create_job(
        &self,
        name: impl Into<String>,
        image: Vec<u8>,
    ) -> Result<(), RemoteCallError> {
        let request = CreateJobRequest {
            name: name.into(),
            content: InputImage::jpg(image),
        };
        debug!(name = %request.name, bytes = request.content.image.len(), "submitting job");
        let _: CreateJobResponse = self.invoke(CREATE_JOB_METHOD, &request).await?;
        Ok(())
    }

    /// Submits a content image with its own style image.
    pub async fn create_full_job(
        &self,
        name: impl Into<String>,
        style: InputImage,
        content: InputImage,
    ) -> Result<(), RemoteCallError> {
        let request = CreateFullJobRequest {
            name: name.into(),
            style,
            content,
        };
        debug!(name = %request.name, style = %request.style.title, "submitting full job");
        let _: CreateFullJobResponse = self.invoke(CREATE_FULL_JOB_METHOD, &request).await?;
        Ok(())
    }

    /// Closes the channel, waiting at most the configured grace for
    /// in-flight submissions. Later submissions fail immediately.
    pub async fn shutdown(&self) {
        self.inner.shutdown().await
    }

    pub fn is_closed(&self) -> bool {
        self.inner.is_closed()
    }

    async fn invoke<Req, Resp>(&self, method: &str, request: &Req) -> Result<Resp, RpcError>
    where
        Req: Serialize,
        Resp: DeserializeOwned,
    {
        invoke(&self.inner, method, request).await
    }
}

pub(super) async fn invoke<Req, Resp>(
    client: &RpcClient,
    method: &str,
    request: &Req,
) -> Result<Resp, RpcError>
where
    Req: Serialize,
    Resp: DeserializeOwned,
{
    let params = bincode::serialize(request)?;
    let response_data = client.call(method, params).await?;
    Ok(bincode::deserialize::<Resp>(&response_data)?)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_support::{MockConnector, Responder};

    const JPEG_HEADER: [u8; 4] = [0xFF, 0xD8, 0xFF, 0xE0];

    fn client(responder: Responder) -> (ImagerClient, std::sync::Arc<MockConnector>) {
        let connector = MockConnector::new(responder);
        let rpc = RpcClient::with_connector(RpcConfig::new("imager.test", 8081), connector.clone());
        (ImagerClient::from_rpc_client(rpc), connector)
    }

    #[tokio::test]
    async fn create_job_sends_one_request_with_name_and_bytes() {
        let (client, connector) = client(Responder::Ack);

        client.create_job("sunset", JPEG_HEADER.to_vec()).await.unwrap();

        let sent = connector.sent();
        assert_eq!(sent.len(), 1);
        assert_eq!(sent[0].method(), CREATE_JOB_METHOD);
        let request: CreateJobRequest = bincode::deserialize(sent[0].params()).unwrap();
        assert_eq!(request.name, "sunset");
        assert_eq!(request.content.format, ImageFormat::Jpg);
        assert_eq!(request.content.image, JPEG_HEADER);
        assert!(request.content.title.is_empty());
    }

    #[tokio::test]
    async fn create_full_job_carries_both_images() {
        let (client, connector) = client(Responder::Ack);
        let style = InputImage::jpg(vec![1, 2, 3]).with_title("starry-night");
        let content = InputImage::jpg(JPEG_HEADER.to_vec()).with_title("sunset");

        client
            .create_full_job("sunset", style.clone(), content.clone())
            .await
            .unwrap();

        let sent = connector.sent();
        assert_eq!(sent[0].method(), CREATE_FULL_JOB_METHOD);
        let request: CreateFullJobRequest = bincode::deserialize(sent[0].params()).unwrap();
        assert_eq!(request.style, style);
        assert_eq!(request.content, content);
    }

    #[tokio::test]
    async fn unreachable_endpoint_fails_once_without_retry() {
        let (client, connector) = client(Responder::Refuse);

        let err = client.create_job("sunset", JPEG_HEADER.to_vec()).await.unwrap_err();

        assert!(matches!(err.cause(), RpcError::ConnectionError(_)));
        assert_eq!(connector.connects(), 1);
        assert!(connector.sent().is_empty());
    }

    #[tokio::test]
    async fn server_rejection_is_a_remote_call_error() {
        let (client, _) = client(Responder::Fail("Request rejected: content image is empty".into()));

        let err = client.create_job("sunset", Vec::new()).await.unwrap_err();

        assert!(err.to_string().starts_with("remote call failed"));
        assert!(matches!(err.cause(), RpcError::RemoteError(_)));
    }

    #[tokio::test]
    async fn create_job_after_shutdown_fails_immediately() {
        let (client, connector) = client(Responder::Ack);

        client.shutdown().await;
        let err = client.create_job("sunset", JPEG_HEADER.to_vec()).await.unwrap_err();

        assert!(client.is_closed());
        assert!(matches!(err.cause(), RpcError::ChannelClosed));
        assert_eq!(connector.connects(), 0);
    }

    #[test]
    fn new_rejects_empty_host() {
        assert!(matches!(
            ImagerClient::new(RpcConfig::new("", 8081)),
            Err(RpcError::ConfigError(_))
        ));
    }
}
