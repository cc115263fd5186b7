//! Stream plumbing for replmux
//!
//! Provides:
//! - `SynchronizedSink`: mutually exclusive writes to a shared sink
//! - `EphemeralPipe`: a session-scoped FIFO in a private temp directory
//! - `StreamFunnel`: demand-driven fan-in of many sources into one reader
//! - `BroadcastMultiplexer`: fan-in plus fan-out to many sinks with a reader tap

mod fifo;
mod funnel;
mod multiplexer;
mod sink;

pub use fifo::*;
pub use funnel::*;
pub use multiplexer::*;
pub use sink::*;

use std::fmt;
use std::sync::Arc;
use thiserror::Error;
use tokio::io::{AsyncRead, AsyncWrite};

/// Chunk size used by every forwarding loop unless overridden
pub const BUF_SIZE: usize = 4096;

/// Type-erased byte source
pub type BoxReader = Box<dyn AsyncRead + Send + Unpin>;

/// Type-erased byte sink
pub type BoxWriter = Box<dyn AsyncWrite + Send + Unpin>;

/// Stream errors
#[derive(Debug, Error)]
pub enum MuxError {
    /// Setup of a temp directory, FIFO or descriptor failed
    #[error("Resource error: {message}: {source}")]
    Resource {
        message: String,
        #[source]
        source: std::io::Error,
    },

    /// Read or write failure on an attached pipe or sink
    #[error("Stream error: {0}")]
    Stream(#[from] std::io::Error),

    #[error(transparent)]
    Aggregate(#[from] AggregateError),

    /// An input reached end-of-stream; reported so callers can track
    /// which sources are still live
    #[error("End of stream")]
    EndOfStream,

    #[error("Stream closed")]
    Closed,
}

impl MuxError {
    pub fn resource(message: impl Into<String>, source: std::io::Error) -> Self {
        Self::Resource {
            message: message.into(),
            source,
        }
    }
}

pub type MuxResult<T> = Result<T, MuxError>;

/// One destination of a broadcast
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Participant {
    /// The multiplexer's own read-side pipe
    Tap,
    /// External sink by index in configuration order
    Sink(usize),
}

impl fmt::Display for Participant {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Participant::Tap => f.write_str("tap"),
            Participant::Sink(i) => write!(f, "sink[{}]", i),
        }
    }
}

/// Every failed write of one broadcast.
///
/// Only constructed when at least one participant failed; the others may
/// have received the chunk.
#[derive(Debug, Error)]
#[error("{} of {} broadcast writes failed: {}", .failures.len(), .attempted, summarize(.failures))]
pub struct AggregateError {
    pub attempted: usize,
    pub failures: Vec<(Participant, std::io::Error)>,
}

impl AggregateError {
    /// Build from per-participant outcomes; `None` when every write succeeded
    pub fn from_outcomes(
        outcomes: Vec<(Participant, std::io::Result<()>)>,
    ) -> Option<Self> {
        let attempted = outcomes.len();
        let failures: Vec<_> = outcomes
            .into_iter()
            .filter_map(|(p, r)| r.err().map(|e| (p, e)))
            .collect();

        if failures.is_empty() {
            None
        } else {
            Some(Self {
                attempted,
                failures,
            })
        }
    }

    pub fn failed(&self, participant: Participant) -> bool {
        self.failures.iter().any(|(p, _)| *p == participant)
    }
}

fn summarize(failures: &[(Participant, std::io::Error)]) -> String {
    failures
        .iter()
        .map(|(p, e)| format!("{}: {}", p, e))
        .collect::<Vec<_>>()
        .join("; ")
}

/// Per-instance error reporting capability for background tasks.
///
/// The default drops every error.
#[derive(Clone, Default)]
pub struct ErrorHandler {
    callback: Option<Arc<dyn Fn(&MuxError) + Send + Sync>>,
}

impl ErrorHandler {
    pub fn new(callback: impl Fn(&MuxError) + Send + Sync + 'static) -> Self {
        Self {
            callback: Some(Arc::new(callback)),
        }
    }

    pub fn report(&self, err: &MuxError) {
        if let Some(callback) = &self.callback {
            callback(err);
        }
    }
}

impl fmt::Debug for ErrorHandler {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.callback.is_some() {
            f.write_str("ErrorHandler(custom)")
        } else {
            f.write_str("ErrorHandler(noop)")
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io;
    use std::sync::Mutex;

    #[test]
    fn aggregate_is_none_when_all_succeed() {
        let outcomes = vec![(Participant::Tap, Ok(())), (Participant::Sink(0), Ok(()))];
        assert!(AggregateError::from_outcomes(outcomes).is_none());
    }

    #[test]
    fn aggregate_collects_every_failure() {
        let outcomes = vec![
            (Participant::Tap, Ok(())),
            (
                Participant::Sink(0),
                Err(io::Error::new(io::ErrorKind::BrokenPipe, "gone")),
            ),
            (Participant::Sink(1), Ok(())),
            (
                Participant::Sink(2),
                Err(io::Error::new(io::ErrorKind::Other, "full")),
            ),
        ];

        let err = AggregateError::from_outcomes(outcomes).unwrap();
        assert_eq!(err.attempted, 4);
        assert_eq!(err.failures.len(), 2);
        assert!(err.failed(Participant::Sink(0)));
        assert!(err.failed(Participant::Sink(2)));
        assert!(!err.failed(Participant::Tap));

        let msg = err.to_string();
        assert!(msg.starts_with("2 of 4 broadcast writes failed"));
        assert!(msg.contains("sink[0]: gone"));
    }

    #[test]
    fn error_handler_default_is_noop() {
        let handler = ErrorHandler::default();
        handler.report(&MuxError::Closed);
    }

    #[test]
    fn error_handler_invokes_callback() {
        let seen = Arc::new(Mutex::new(Vec::new()));
        let sink = seen.clone();
        let handler = ErrorHandler::new(move |e| sink.lock().unwrap().push(e.to_string()));

        handler.report(&MuxError::Closed);

        assert_eq!(seen.lock().unwrap().as_slice(), ["Stream closed"]);
    }
}
