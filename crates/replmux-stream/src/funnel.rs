//! Demand-driven fan-in
//!
//! A [`StreamFunnel`] merges any number of sources into one reader. One task
//! per source pushes chunks into an intake channel; a single coordination
//! loop owns the buffered bytes and hands the consumer at most as many bytes
//! as it asked for. Byte order is preserved per source; the interleaving of
//! different sources is first-arrival.
//!
//! Every source task reports its own end to the coordination loop. Once no
//! source is live and the buffer is empty, reads return EOF.

use std::collections::VecDeque;
use std::future::Future;
use std::io;
use std::pin::Pin;
use std::task::{Context, Poll};
use tokio::io::{AsyncRead, AsyncReadExt, ReadBuf};
use tokio::sync::{mpsc, oneshot};
use tokio_util::sync::{CancellationToken, DropGuard};
use tracing::debug;

use replmux_util::Logger;

use crate::{BUF_SIZE, BoxReader, ErrorHandler, MuxError};

/// Upper bound on bytes held for the consumer before sources are paused
const DEFAULT_MAX_BUFFERED: usize = 1024 * 1024;

/// Depth of the source → coordinator channel
const INTAKE_DEPTH: usize = 16;

/// Funnel configuration
#[derive(Debug, Clone)]
pub struct FunnelOptions {
    /// Chunk size for each source read
    pub buffer_size: usize,
    /// Sources stop being drained while this many bytes wait for the consumer
    pub max_buffered: usize,
    pub logger: Logger,
    pub error_handler: ErrorHandler,
    /// Cancelling this token closes the funnel
    pub cancel: CancellationToken,
}

impl Default for FunnelOptions {
    fn default() -> Self {
        Self {
            buffer_size: BUF_SIZE,
            max_buffered: DEFAULT_MAX_BUFFERED,
            logger: Logger::discard(),
            error_handler: ErrorHandler::default(),
            cancel: CancellationToken::new(),
        }
    }
}

enum Intake {
    Chunk(Vec<u8>),
    Finished,
}

struct ReadRequest {
    len: usize,
    reply: oneshot::Sender<Vec<u8>>,
}

/// Consumer side of the funnel.
///
/// Reading takes `&mut self`, so there is never more than one outstanding
/// request. Must be constructed inside a tokio runtime.
pub struct StreamFunnel {
    requests: mpsc::UnboundedSender<ReadRequest>,
    pending: Option<oneshot::Receiver<Vec<u8>>>,
    /// Delivered bytes that did not fit a shrunken read buffer
    leftover: Vec<u8>,
    closed: bool,
    cancel: CancellationToken,
    _guard: DropGuard,
}

impl StreamFunnel {
    pub fn new(sources: Vec<BoxReader>) -> Self {
        Self::with_options(sources, FunnelOptions::default())
    }

    pub fn with_options(sources: Vec<BoxReader>, options: FunnelOptions) -> Self {
        let cancel = options.cancel.child_token();
        let (intake_tx, intake_rx) = mpsc::channel(INTAKE_DEPTH);
        let (request_tx, request_rx) = mpsc::unbounded_channel();
        let live = sources.len();
        let buffer_size = options.buffer_size.max(1);

        for (index, source) in sources.into_iter().enumerate() {
            tokio::spawn(pump(
                index,
                source,
                intake_tx.clone(),
                buffer_size,
                options.logger.child(&format!("source{}", index)),
                options.error_handler.clone(),
                cancel.clone(),
            ));
        }
        drop(intake_tx);

        tokio::spawn(coordinate(
            intake_rx,
            request_rx,
            live,
            options.max_buffered.max(buffer_size),
            options.logger.clone(),
            cancel.clone(),
        ));

        options.logger.log(format!("funnel started with {} sources", live));

        Self {
            requests: request_tx,
            pending: None,
            leftover: Vec::new(),
            closed: false,
            _guard: cancel.clone().drop_guard(),
            cancel,
        }
    }

    /// Stop every source task.
    ///
    /// Bytes already received from sources are still delivered; reads
    /// return EOF once they are consumed.
    pub fn close(&self) {
        self.cancel.cancel();
    }

    fn take_leftover(&mut self, buf: &mut ReadBuf<'_>) {
        let n = self.leftover.len().min(buf.remaining());
        buf.put_slice(&self.leftover[..n]);
        self.leftover.drain(..n);
    }
}

impl AsyncRead for StreamFunnel {
    fn poll_read(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &mut ReadBuf<'_>,
    ) -> Poll<io::Result<()>> {
        let this = self.get_mut();

        // A zero-length request never reaches the coordination loop
        if buf.remaining() == 0 {
            return Poll::Ready(Ok(()));
        }

        if !this.leftover.is_empty() {
            this.take_leftover(buf);
            return Poll::Ready(Ok(()));
        }

        if this.closed {
            return Poll::Ready(Ok(()));
        }

        if this.pending.is_none() {
            let (reply, rx) = oneshot::channel();
            let request = ReadRequest {
                len: buf.remaining(),
                reply,
            };
            if this.requests.send(request).is_err() {
                this.closed = true;
                return Poll::Ready(Ok(()));
            }
            this.pending = Some(rx);
        }

        let Some(rx) = this.pending.as_mut() else {
            return Poll::Ready(Ok(()));
        };

        match Pin::new(rx).poll(cx) {
            Poll::Pending => Poll::Pending,
            Poll::Ready(Ok(bytes)) => {
                this.pending = None;
                if bytes.is_empty() {
                    this.closed = true;
                } else {
                    this.leftover = bytes;
                    this.take_leftover(buf);
                }
                Poll::Ready(Ok(()))
            }
            Poll::Ready(Err(_)) => {
                // Coordination loop is gone (cancelled)
                this.pending = None;
                this.closed = true;
                Poll::Ready(Ok(()))
            }
        }
    }
}

async fn pump(
    index: usize,
    mut source: BoxReader,
    intake: mpsc::Sender<Intake>,
    buffer_size: usize,
    logger: Logger,
    error_handler: ErrorHandler,
    cancel: CancellationToken,
) {
    let mut buf = vec![0u8; buffer_size];

    loop {
        let read = tokio::select! {
            _ = cancel.cancelled() => break,
            read = source.read(&mut buf) => read,
        };

        match read {
            Ok(0) => {
                logger.log("end of stream");
                break;
            }
            Ok(n) => {
                if intake.send(Intake::Chunk(buf[..n].to_vec())).await.is_err() {
                    break;
                }
            }
            Err(e) => {
                logger.log(format!("read failed: {}", e));
                debug!(source = index, error = %e, "Funnel source failed");
                error_handler.report(&MuxError::Stream(e));
                break;
            }
        }
    }

    let _ = intake.send(Intake::Finished).await;
}

async fn coordinate(
    mut intake: mpsc::Receiver<Intake>,
    mut requests: mpsc::UnboundedReceiver<ReadRequest>,
    mut live: usize,
    max_buffered: usize,
    logger: Logger,
    cancel: CancellationToken,
) {
    let mut buffer: VecDeque<u8> = VecDeque::new();
    let mut pending: Option<ReadRequest> = None;

    loop {
        if let Some(request) = pending.take() {
            if !buffer.is_empty() {
                let n = request.len.min(buffer.len());
                let slice: Vec<u8> = buffer.drain(..n).collect();
                if let Err(slice) = request.reply.send(slice) {
                    // Consumer went away mid-request; keep the bytes
                    for b in slice.into_iter().rev() {
                        buffer.push_front(b);
                    }
                }
            } else if live == 0 {
                let _ = request.reply.send(Vec::new());
            } else {
                pending = Some(request);
            }
        }

        tokio::select! {
            _ = cancel.cancelled() => break,

            intake_msg = intake.recv(), if live > 0 && buffer.len() < max_buffered => {
                match intake_msg {
                    Some(Intake::Chunk(bytes)) => buffer.extend(bytes),
                    Some(Intake::Finished) => {
                        live -= 1;
                        if live == 0 {
                            logger.log("all sources finished");
                        }
                    }
                    None => live = 0,
                }
            }

            request = requests.recv(), if pending.is_none() => {
                match request {
                    Some(request) => pending = Some(request),
                    None => break,
                }
            }
        }
    }

    if cancel.is_cancelled() {
        drain(intake, requests, buffer, pending).await;
    }

    logger.log("funnel closed");
}

/// After cancellation: hand out what was already received, then EOF
async fn drain(
    mut intake: mpsc::Receiver<Intake>,
    mut requests: mpsc::UnboundedReceiver<ReadRequest>,
    mut buffer: VecDeque<u8>,
    mut pending: Option<ReadRequest>,
) {
    while let Ok(msg) = intake.try_recv() {
        if let Intake::Chunk(bytes) = msg {
            buffer.extend(bytes);
        }
    }
    drop(intake);

    loop {
        let request = match pending.take() {
            Some(request) => request,
            None => match requests.recv().await {
                Some(request) => request,
                None => return,
            },
        };

        if buffer.is_empty() {
            let _ = request.reply.send(Vec::new());
            return;
        }

        let n = request.len.min(buffer.len());
        let slice: Vec<u8> = buffer.drain(..n).collect();
        if let Err(slice) = request.reply.send(slice) {
            for b in slice.into_iter().rev() {
                buffer.push_front(b);
            }
        }
    }
}
