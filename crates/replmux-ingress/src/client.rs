//! Ingress client implementation

use reqwest::Client;
use std::net::SocketAddr;
use std::time::Duration;
use tracing::debug;

use crate::{IngressError, IngressResult};

const CONNECT_TIMEOUT: Duration = Duration::from_secs(5);

/// Client for a session's ingress endpoint
#[derive(Debug, Clone)]
pub struct IngressClient {
    client: Client,
    base_url: String,
}

impl IngressClient {
    pub fn new(addr: SocketAddr) -> IngressResult<Self> {
        let client = Client::builder().connect_timeout(CONNECT_TIMEOUT).build()?;

        Ok(Self {
            client,
            base_url: format!("http://{}", addr),
        })
    }

    /// POST `payload` to `/stdin`; non-2xx answers become `Rejected`
    pub async fn send(&self, payload: impl Into<Vec<u8>>) -> IngressResult<()> {
        let payload = payload.into();
        let len = payload.len();

        let response = self
            .client
            .post(format!("{}/stdin", self.base_url))
            .body(payload)
            .send()
            .await?;

        let status = response.status();
        if status.is_success() {
            debug!(bytes = len, "Payload delivered to ingress");
            return Ok(());
        }

        let message = response.text().await.unwrap_or_default();
        Err(IngressError::Rejected {
            status: status.as_u16(),
            message,
        })
    }

    /// Whether the ingress answers its health check
    pub async fn health(&self) -> IngressResult<bool> {
        let response = self
            .client
            .get(format!("{}/health", self.base_url))
            .send()
            .await?;
        Ok(response.status().is_success())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::IngressServer;
    use replmux_stream::{BoxWriter, BroadcastMultiplexer};
    use std::io;
    use std::pin::Pin;
    use std::task::{Context, Poll};
    use tokio::io::{AsyncReadExt, AsyncWrite};
    use tokio_util::sync::CancellationToken;

    struct Unwritable;

    impl AsyncWrite for Unwritable {
        fn poll_write(
            self: Pin<&mut Self>,
            _cx: &mut Context<'_>,
            _buf: &[u8],
        ) -> Poll<io::Result<usize>> {
            Poll::Ready(Err(io::Error::other("nowhere to write")))
        }

        fn poll_flush(self: Pin<&mut Self>, _cx: &mut Context<'_>) -> Poll<io::Result<()>> {
            Poll::Ready(Ok(()))
        }

        fn poll_shutdown(self: Pin<&mut Self>, _cx: &mut Context<'_>) -> Poll<io::Result<()>> {
            Poll::Ready(Ok(()))
        }
    }

    async fn start(mux: &BroadcastMultiplexer, cancel: &CancellationToken) -> SocketAddr {
        let server = IngressServer::bind("127.0.0.1:0".parse().unwrap(), mux.broadcaster())
            .await
            .unwrap();
        let addr = server.local_addr().unwrap();
        tokio::spawn(server.serve(cancel.clone()));
        addr
    }

    #[tokio::test]
    async fn send_round_trip() {
        let mut mux = BroadcastMultiplexer::new(Vec::new(), Vec::new());
        let cancel = CancellationToken::new();
        let addr = start(&mux, &cancel).await;

        let client = IngressClient::new(addr).unwrap();
        assert!(client.health().await.unwrap());
        client.send("1 + 1\n").await.unwrap();

        let mut buf = [0u8; 32];
        let n = mux.read(&mut buf).await.unwrap();
        assert_eq!(&buf[..n], b"1 + 1\n");

        cancel.cancel();
    }

    #[tokio::test]
    async fn server_error_maps_to_rejected() {
        let outputs: Vec<BoxWriter> = vec![Box::new(Unwritable)];
        let mux = BroadcastMultiplexer::new(Vec::new(), outputs);
        let cancel = CancellationToken::new();
        let addr = start(&mux, &cancel).await;

        let err = IngressClient::new(addr).unwrap().send("x").await.unwrap_err();
        match err {
            IngressError::Rejected { status, message } => {
                assert_eq!(status, 500);
                assert!(message.contains("nowhere to write"));
            }
            other => panic!("expected rejection, got {:?}", other),
        }

        cancel.cancel();
    }

    #[tokio::test]
    async fn unreachable_ingress_is_http_error() {
        // Bind then drop to get a port nobody listens on
        let listener = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
        let addr = listener.local_addr().unwrap();
        drop(listener);

        let err = IngressClient::new(addr).unwrap().send("x").await.unwrap_err();
        assert!(matches!(err, IngressError::Http(_)));
    }

    #[tokio::test]
    async fn bind_conflict_is_reported() {
        let mux = BroadcastMultiplexer::new(Vec::new(), Vec::new());
        let holder = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = holder.local_addr().unwrap();

        match IngressServer::bind(addr, mux.broadcaster()).await {
            Err(IngressError::Bind { addr: failed, .. }) => assert_eq!(failed, addr),
            other => panic!("expected bind error, got {:?}", other.map(|_| ())),
        }
    }
}
