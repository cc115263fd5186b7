//! Integration tests for replmux
//!
//! These tests wire the stream, host and ingress crates together the way
//! `replmux run` does and drive a real `cat` through them.

use replmux_host::{ClientStreams, OrchestratorOptions, ProcessOrchestrator, SessionOutcome};
use replmux_ingress::{IngressClient, IngressServer};
use replmux_stream::{
    BoxReader, BoxWriter, BroadcastMultiplexer, EphemeralPipe, SharedSink, StreamFunnel,
};
use std::io;
use std::pin::Pin;
use std::sync::{Arc, Mutex};
use std::task::{Context, Poll};
use std::time::Duration;
use tokio::io::{AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio_util::sync::CancellationToken;

#[derive(Clone, Default)]
struct Capture(Arc<Mutex<Vec<u8>>>);

impl Capture {
    fn text(&self) -> String {
        String::from_utf8_lossy(&self.0.lock().unwrap()).into_owned()
    }

    async fn wait_for(&self, needle: &str) {
        tokio::time::timeout(Duration::from_secs(5), async {
            while !self.text().contains(needle) {
                tokio::time::sleep(Duration::from_millis(10)).await;
            }
        })
        .await
        .unwrap_or_else(|_| panic!("timed out waiting for {:?}, got {:?}", needle, self.text()));
    }
}

impl AsyncWrite for Capture {
    fn poll_write(
        self: Pin<&mut Self>,
        _cx: &mut Context<'_>,
        buf: &[u8],
    ) -> Poll<io::Result<usize>> {
        self.0.lock().unwrap().extend_from_slice(buf);
        Poll::Ready(Ok(buf.len()))
    }

    fn poll_flush(self: Pin<&mut Self>, _cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        Poll::Ready(Ok(()))
    }

    fn poll_shutdown(self: Pin<&mut Self>, _cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        Poll::Ready(Ok(()))
    }
}

fn cat(cancel: CancellationToken) -> ProcessOrchestrator {
    ProcessOrchestrator::with_options(
        "cat",
        OrchestratorOptions {
            stop_timeout: Duration::from_millis(500),
            drain_timeout: Duration::from_secs(2),
            cancel,
            ..Default::default()
        },
    )
    .unwrap()
}

fn client(input: BoxReader, stdout: &Capture, stderr: &Capture) -> ClientStreams {
    ClientStreams {
        input,
        output: SharedSink::boxed(stdout.clone()),
        error: SharedSink::boxed(stderr.clone()),
    }
}

#[tokio::test]
async fn test_cat_session_through_multiplexer() {
    let (mut writer, reader) = tokio::io::duplex(256);
    let record = Capture::default();
    let outputs: Vec<BoxWriter> = vec![Box::new(record.clone())];

    let inputs: Vec<BoxReader> = vec![Box::new(reader)];
    let mut mux = BroadcastMultiplexer::new(inputs, outputs);
    let listener = mux.listen();

    let stdout = Capture::default();
    let stderr = Capture::default();
    let session = cat(CancellationToken::new())
        .start(client(Box::new(mux), &stdout, &stderr))
        .unwrap();

    writer.write_all(b"a\nb\nc\n").await.unwrap();
    drop(writer);

    let outcome = tokio::time::timeout(Duration::from_secs(10), session.wait())
        .await
        .unwrap()
        .unwrap();
    listener.await.unwrap();

    assert!(
        matches!(outcome, SessionOutcome::InputClosed(_)),
        "unexpected outcome {:?}",
        outcome
    );
    assert_eq!(stdout.text(), "a\nb\nc\n");
    assert_eq!(record.text(), "a\nb\nc\n");
    assert!(stderr.text().is_empty());
}

#[tokio::test]
async fn test_funnel_feeds_orchestrator() {
    let (mut first, first_reader) = tokio::io::duplex(64);
    let (mut second, second_reader) = tokio::io::duplex(64);
    let sources: Vec<BoxReader> = vec![Box::new(first_reader), Box::new(second_reader)];
    let funnel = StreamFunnel::new(sources);

    let stdout = Capture::default();
    let stderr = Capture::default();
    let session = cat(CancellationToken::new())
        .start(client(Box::new(funnel), &stdout, &stderr))
        .unwrap();

    first.write_all(b"from-first\n").await.unwrap();
    drop(first);
    second.write_all(b"from-second\n").await.unwrap();
    drop(second);

    let outcome = tokio::time::timeout(Duration::from_secs(10), session.wait())
        .await
        .unwrap()
        .unwrap();
    assert!(matches!(outcome, SessionOutcome::InputClosed(_)));

    // Cross-source order is arrival order, so only the set of lines is fixed
    let text = stdout.text();
    let mut lines: Vec<&str> = text.lines().collect();
    lines.sort_unstable();
    assert_eq!(lines, vec!["from-first", "from-second"]);
}

#[tokio::test]
async fn test_fifo_writer_reaches_multiplexer() {
    let pipe = EphemeralPipe::create("integration").unwrap();
    let dir = pipe.dir().to_path_buf();

    let inputs: Vec<BoxReader> = vec![Box::new(pipe.try_clone_stream().unwrap())];
    let mut mux = BroadcastMultiplexer::new(inputs, Vec::new());
    let listener = mux.listen();

    // The pipe holds a read-write descriptor, so opening the write end never blocks
    let mut external = tokio::fs::OpenOptions::new()
        .write(true)
        .open(pipe.path())
        .await
        .unwrap();
    external.write_all(b"print('hi')\n").await.unwrap();
    external.flush().await.unwrap();

    let mut buf = [0u8; 64];
    let n = tokio::time::timeout(Duration::from_secs(5), mux.read(&mut buf))
        .await
        .unwrap()
        .unwrap();
    assert_eq!(&buf[..n], b"print('hi')\n");

    drop(external);
    mux.close().await.unwrap();
    listener.await.unwrap();
    assert_eq!(mux.read(&mut buf).await.unwrap(), 0);

    pipe.close().unwrap();
    assert!(!dir.exists());
}

#[tokio::test]
async fn test_ingress_payload_reaches_session() {
    // Keep one input open so the session outlives the HTTP request
    let (writer, reader) = tokio::io::duplex(64);
    let inputs: Vec<BoxReader> = vec![Box::new(reader)];
    let mut mux = BroadcastMultiplexer::new(inputs, Vec::new());
    let listener = mux.listen();

    let cancel = CancellationToken::new();
    let server = IngressServer::bind("127.0.0.1:0".parse().unwrap(), mux.broadcaster())
        .await
        .unwrap();
    let addr = server.local_addr().unwrap();
    let ingress = tokio::spawn(server.serve(cancel.clone()));

    let stdout = Capture::default();
    let stderr = Capture::default();
    let session = cat(cancel.clone())
        .start(client(Box::new(mux), &stdout, &stderr))
        .unwrap();

    IngressClient::new(addr).unwrap().send("1 + 1\n").await.unwrap();
    stdout.wait_for("1 + 1\n").await;

    drop(writer);
    let outcome = tokio::time::timeout(Duration::from_secs(10), session.wait())
        .await
        .unwrap()
        .unwrap();
    assert!(matches!(outcome, SessionOutcome::InputClosed(_)));

    cancel.cancel();
    ingress.await.unwrap().unwrap();
    listener.await.unwrap();
}

#[tokio::test]
async fn test_cancel_stops_interactive_session() {
    let (writer, reader) = tokio::io::duplex(64);
    let cancel = CancellationToken::new();

    let stdout = Capture::default();
    let stderr = Capture::default();
    let session = cat(cancel.clone())
        .start(client(Box::new(reader), &stdout, &stderr))
        .unwrap();

    tokio::time::sleep(Duration::from_millis(50)).await;
    cancel.cancel();

    let outcome = tokio::time::timeout(Duration::from_secs(10), session.wait())
        .await
        .unwrap()
        .unwrap();
    assert!(matches!(outcome, SessionOutcome::Cancelled(_)));
    drop(writer);
}
