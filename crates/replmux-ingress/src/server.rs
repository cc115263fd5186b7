//! Ingress server implementation

use axum::body::Bytes;
use axum::extract::{DefaultBodyLimit, State};
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::routing::{get, post};
use axum::Router;
use std::net::SocketAddr;
use tokio::net::TcpListener;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use replmux_stream::Broadcaster;

use crate::{IngressError, IngressResult};

/// Shared handler state
#[derive(Clone)]
pub struct IngressState {
    pub broadcaster: Broadcaster,
}

/// Routes for the ingress endpoint.
///
/// Bodies are not size limited; the broadcaster's sinks provide the only
/// backpressure.
pub fn build_router(broadcaster: Broadcaster) -> Router {
    Router::new()
        .route("/stdin", post(stdin))
        .route("/health", get(health))
        .layer(DefaultBodyLimit::disable())
        .with_state(IngressState { broadcaster })
}

/// `POST /stdin`: 204 once every participant took the body, 500 otherwise
async fn stdin(State(state): State<IngressState>, body: Bytes) -> Response {
    if body.is_empty() {
        return StatusCode::NO_CONTENT.into_response();
    }

    match state.broadcaster.broadcast(&body).await {
        Ok(()) => {
            debug!(bytes = body.len(), "Ingress payload broadcast");
            StatusCode::NO_CONTENT.into_response()
        }
        Err(e) => {
            warn!(error = %e, "Ingress broadcast failed");
            (StatusCode::INTERNAL_SERVER_ERROR, e.to_string()).into_response()
        }
    }
}

/// `GET /health`
async fn health() -> &'static str {
    "ok"
}

/// Ingress server bound to a TCP address
pub struct IngressServer {
    listener: TcpListener,
    router: Router,
}

impl IngressServer {
    pub async fn bind(addr: SocketAddr, broadcaster: Broadcaster) -> IngressResult<Self> {
        let listener = TcpListener::bind(addr)
            .await
            .map_err(|source| IngressError::Bind { addr, source })?;

        Ok(Self {
            listener,
            router: build_router(broadcaster),
        })
    }

    /// Actual bound address (useful when binding port 0)
    pub fn local_addr(&self) -> IngressResult<SocketAddr> {
        Ok(self.listener.local_addr()?)
    }

    /// Serve until `cancel` fires, then finish in-flight requests
    pub async fn serve(self, cancel: CancellationToken) -> IngressResult<()> {
        let addr = self.local_addr()?;
        info!(addr = %addr, "Ingress listening");

        axum::serve(self.listener, self.router)
            .with_graceful_shutdown(async move { cancel.cancelled().await })
            .await?;

        info!(addr = %addr, "Ingress stopped");
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::body::Body;
    use axum::http::Request;
    use replmux_stream::{BoxWriter, BroadcastMultiplexer};
    use std::io;
    use std::pin::Pin;
    use std::task::{Context, Poll};
    use tokio::io::{AsyncReadExt, AsyncWrite};
    use tower::ServiceExt;

    struct Unwritable;

    impl AsyncWrite for Unwritable {
        fn poll_write(
            self: Pin<&mut Self>,
            _cx: &mut Context<'_>,
            _buf: &[u8],
        ) -> Poll<io::Result<usize>> {
            Poll::Ready(Err(io::Error::new(io::ErrorKind::BrokenPipe, "sink closed")))
        }

        fn poll_flush(self: Pin<&mut Self>, _cx: &mut Context<'_>) -> Poll<io::Result<()>> {
            Poll::Ready(Ok(()))
        }

        fn poll_shutdown(self: Pin<&mut Self>, _cx: &mut Context<'_>) -> Poll<io::Result<()>> {
            Poll::Ready(Ok(()))
        }
    }

    /// Send a request to the router and return (status, body text).
    async fn send_request(router: Router, request: Request<Body>) -> (StatusCode, String) {
        let resp = router.oneshot(request).await.unwrap();
        let status = resp.status();
        let body = axum::body::to_bytes(resp.into_body(), usize::MAX)
            .await
            .unwrap();
        (status, String::from_utf8_lossy(&body).into_owned())
    }

    fn post_stdin(body: &'static str) -> Request<Body> {
        Request::builder()
            .method("POST")
            .uri("/stdin")
            .body(Body::from(body))
            .unwrap()
    }

    #[tokio::test]
    async fn post_stdin_reaches_session() {
        let mut mux = BroadcastMultiplexer::new(Vec::new(), Vec::new());
        let router = build_router(mux.broadcaster());

        let (status, _) = send_request(router, post_stdin("print(42)\n")).await;
        assert_eq!(status, StatusCode::NO_CONTENT);

        let mut buf = [0u8; 64];
        let n = mux.read(&mut buf).await.unwrap();
        assert_eq!(&buf[..n], b"print(42)\n");
    }

    #[tokio::test]
    async fn failed_sink_is_server_error() {
        let outputs: Vec<BoxWriter> = vec![Box::new(Unwritable)];
        let mux = BroadcastMultiplexer::new(Vec::new(), outputs);
        let router = build_router(mux.broadcaster());

        let (status, text) = send_request(router, post_stdin("x")).await;
        assert_eq!(status, StatusCode::INTERNAL_SERVER_ERROR);
        assert!(text.contains("sink[0]: sink closed"), "body: {text}");
    }

    #[tokio::test]
    async fn empty_body_is_accepted() {
        let mux = BroadcastMultiplexer::new(Vec::new(), vec![Box::new(Unwritable) as BoxWriter]);
        let router = build_router(mux.broadcaster());

        let (status, _) = send_request(router, post_stdin("")).await;
        assert_eq!(status, StatusCode::NO_CONTENT);
    }

    #[tokio::test]
    async fn health_returns_ok() {
        let mux = BroadcastMultiplexer::new(Vec::new(), Vec::new());
        let router = build_router(mux.broadcaster());

        let request = Request::builder()
            .uri("/health")
            .body(Body::empty())
            .unwrap();
        let (status, text) = send_request(router, request).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(text, "ok");
    }

    #[tokio::test]
    async fn get_stdin_not_allowed() {
        let mux = BroadcastMultiplexer::new(Vec::new(), Vec::new());
        let router = build_router(mux.broadcaster());

        let request = Request::builder()
            .uri("/stdin")
            .body(Body::empty())
            .unwrap();
        let (status, _) = send_request(router, request).await;
        assert_eq!(status, StatusCode::METHOD_NOT_ALLOWED);
    }
}
