//! Fan-in plus fan-out with an inline reader tap
//!
//! Every chunk read from any input is written, untransformed, into an
//! internal pipe whose read end is the multiplexer's own `AsyncRead`, and
//! then to every external sink after the optional transform.

use std::borrow::Cow;
use std::fmt;
use std::io;
use std::pin::Pin;
use std::sync::Arc;
use std::task::{Context, Poll};
use tokio::io::{AsyncRead, AsyncReadExt, DuplexStream, ReadBuf};
use tokio::task::{JoinHandle, JoinSet};
use tokio_util::sync::{CancellationToken, DropGuard};
use tracing::warn;

use replmux_util::Logger;

use crate::{
    AggregateError, BUF_SIZE, BoxReader, BoxWriter, ErrorHandler, MuxError, MuxResult,
    Participant, SharedSink, SynchronizedSink,
};

/// Rewrites bytes bound for external sinks
pub type Transform = Arc<dyn Fn(&[u8]) -> Vec<u8> + Send + Sync>;

/// Multiplexer configuration
#[derive(Clone)]
pub struct MultiplexerOptions {
    /// Chunk size for each input read
    pub buffer_size: usize,
    /// Bytes the internal pipe holds before broadcasts wait for the reader
    pub pipe_capacity: usize,
    pub logger: Logger,
    /// Identity when `None`
    pub transform: Option<Transform>,
    pub error_handler: ErrorHandler,
    pub cancel: CancellationToken,
}

impl Default for MultiplexerOptions {
    fn default() -> Self {
        Self {
            buffer_size: BUF_SIZE,
            pipe_capacity: BUF_SIZE * 16,
            logger: Logger::discard(),
            transform: None,
            error_handler: ErrorHandler::default(),
            cancel: CancellationToken::new(),
        }
    }
}

impl fmt::Debug for MultiplexerOptions {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("MultiplexerOptions")
            .field("buffer_size", &self.buffer_size)
            .field("pipe_capacity", &self.pipe_capacity)
            .field("logger", &self.logger)
            .field("transform", &self.transform.is_some())
            .field("error_handler", &self.error_handler)
            .finish()
    }
}

struct Shared {
    tap: SharedSink,
    /// Cancelled by `close`; aborts a tap write the reader is not draining
    closed: CancellationToken,
    outputs: Vec<SharedSink>,
    transform: Option<Transform>,
}

/// Cloneable handle that performs the multiplexer's fan-out
#[derive(Clone)]
pub struct Broadcaster {
    shared: Arc<Shared>,
}

impl Broadcaster {
    /// Write `chunk` to the tap and to every sink.
    ///
    /// Every participant is attempted even after a failure, so delivery may
    /// be partial; the error lists each participant that failed.
    pub async fn broadcast(&self, chunk: &[u8]) -> Result<(), AggregateError> {
        let shared = &self.shared;
        let mut outcomes = Vec::with_capacity(shared.outputs.len() + 1);

        let tapped = tokio::select! {
            biased;
            _ = shared.closed.cancelled() => Err(io::Error::new(
                io::ErrorKind::BrokenPipe,
                "multiplexer closed",
            )),
            written = shared.tap.write(chunk) => written.map(drop),
        };
        outcomes.push((Participant::Tap, tapped));

        let outbound: Cow<'_, [u8]> = match &shared.transform {
            Some(transform) => Cow::Owned(transform(chunk)),
            None => Cow::Borrowed(chunk),
        };
        for (i, sink) in shared.outputs.iter().enumerate() {
            outcomes.push((Participant::Sink(i), sink.write(&outbound).await.map(drop)));
        }

        match AggregateError::from_outcomes(outcomes) {
            Some(err) => Err(err),
            None => Ok(()),
        }
    }

    /// Number of external sinks (the tap is not counted)
    pub fn sink_count(&self) -> usize {
        self.shared.outputs.len()
    }
}

impl fmt::Debug for Broadcaster {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Broadcaster")
            .field("sinks", &self.shared.outputs.len())
            .finish()
    }
}

/// Reads many inputs, broadcasts each chunk, and exposes the merged
/// untransformed stream through `AsyncRead`.
pub struct BroadcastMultiplexer {
    inputs: Vec<BoxReader>,
    reader: DuplexStream,
    shared: Arc<Shared>,
    buffer_size: usize,
    logger: Logger,
    error_handler: ErrorHandler,
    cancel: CancellationToken,
    listening: bool,
    _guard: DropGuard,
}

impl BroadcastMultiplexer {
    pub fn new(inputs: Vec<BoxReader>, outputs: Vec<BoxWriter>) -> Self {
        Self::with_options(inputs, outputs, MultiplexerOptions::default())
    }

    pub fn with_options(
        inputs: Vec<BoxReader>,
        outputs: Vec<BoxWriter>,
        options: MultiplexerOptions,
    ) -> Self {
        let (tap_writer, reader) = tokio::io::duplex(options.pipe_capacity.max(1));
        let cancel = options.cancel.child_token();

        let shared = Arc::new(Shared {
            tap: SynchronizedSink::boxed(tap_writer),
            closed: cancel.clone(),
            outputs: outputs.into_iter().map(SynchronizedSink::new).collect(),
            transform: options.transform,
        });

        Self {
            inputs,
            reader,
            shared,
            buffer_size: options.buffer_size.max(1),
            logger: options.logger,
            error_handler: options.error_handler,
            _guard: cancel.clone().drop_guard(),
            cancel,
            listening: false,
        }
    }

    /// Handle for pushing bytes through the same fan-out from elsewhere
    pub fn broadcaster(&self) -> Broadcaster {
        Broadcaster {
            shared: self.shared.clone(),
        }
    }

    /// Start one task per input.
    ///
    /// The returned task completes after every input finished and the
    /// internal pipe was closed, at which point reads see EOF. Each input's
    /// end, read error or broadcast failure goes to the error handler and
    /// ends only that input's task.
    pub fn listen(&mut self) -> JoinHandle<()> {
        if self.listening {
            warn!("Multiplexer is already listening");
            return tokio::spawn(async {});
        }
        self.listening = true;

        let inputs = std::mem::take(&mut self.inputs);
        let broadcaster = self.broadcaster();
        let buffer_size = self.buffer_size;
        let logger = self.logger.clone();
        let error_handler = self.error_handler.clone();
        let cancel = self.cancel.clone();

        tokio::spawn(async move {
            let mut tasks = JoinSet::new();
            for (index, input) in inputs.into_iter().enumerate() {
                tasks.spawn(pipe_input(
                    input,
                    broadcaster.clone(),
                    buffer_size,
                    logger.child(&format!("input{}", index)),
                    error_handler.clone(),
                    cancel.clone(),
                ));
            }
            logger.log("launched all inputs");
            logger.log("listening");

            while let Some(joined) = tasks.join_next().await {
                if let Err(e) = joined {
                    warn!(error = %e, "Multiplexer input task failed");
                }
            }

            if let Err(e) = broadcaster.shared.tap.shutdown().await {
                error_handler.report(&MuxError::Stream(e));
            }
            logger.log("all streams closed");
        })
    }

    /// Close the internal pipe and stop the input tasks.
    ///
    /// Broadcasts blocked on a full pipe give up, so this never waits on
    /// the reader. Reads drain what is already buffered, then see EOF.
    pub async fn close(&self) -> MuxResult<()> {
        self.cancel.cancel();
        self.shared.tap.shutdown().await?;
        Ok(())
    }
}

impl AsyncRead for BroadcastMultiplexer {
    fn poll_read(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &mut ReadBuf<'_>,
    ) -> Poll<io::Result<()>> {
        Pin::new(&mut self.get_mut().reader).poll_read(cx, buf)
    }
}

async fn pipe_input(
    mut input: BoxReader,
    broadcaster: Broadcaster,
    buffer_size: usize,
    logger: Logger,
    error_handler: ErrorHandler,
    cancel: CancellationToken,
) {
    let mut buf = vec![0u8; buffer_size];

    loop {
        let read = tokio::select! {
            _ = cancel.cancelled() => return,
            read = input.read(&mut buf) => read,
        };

        let n = match read {
            Ok(0) => {
                logger.log("input closed");
                error_handler.report(&MuxError::EndOfStream);
                return;
            }
            Ok(n) => n,
            Err(e) => {
                logger.log(format!("read failed: {}", e));
                error_handler.report(&MuxError::Stream(e));
                return;
            }
        };

        logger.log("read from input");
        let sent = tokio::select! {
            _ = cancel.cancelled() => return,
            sent = broadcaster.broadcast(&buf[..n]) => sent,
        };
        if let Err(e) = sent {
            logger.log(format!("broadcast failed: {}", e));
            error_handler.report(&MuxError::Aggregate(e));
            return;
        }
        logger.log("written to output");
    }
}
