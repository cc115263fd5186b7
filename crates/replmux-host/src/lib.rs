//! Inner process hosting for replmux
//!
//! This crate owns the interactive program whose stdio is multiplexed:
//! - Command line tokenization (quote aware, no shell expansion)
//! - Spawning into a dedicated process group, SIGTERM/SIGKILL of that group
//! - [`ProcessOrchestrator`], which wires the three stdio pipes to client
//!   streams and coordinates shutdown through a single control loop

mod orchestrator;
mod process;
mod status;

pub use orchestrator::*;
pub use process::*;
pub use status::*;

use replmux_stream::MuxError;
use thiserror::Error;

/// Errors from process hosting
#[derive(Debug, Error)]
pub enum HostError {
    #[error("Invalid command: {0}")]
    InvalidCommand(String),

    #[error("Invalid input: {0}")]
    InvalidInput(String),

    #[error("Spawn failed: {0}")]
    SpawnFailed(String),

    #[error("Stop failed: {0}")]
    StopFailed(String),

    /// Read or write failure on one of the session's streams
    #[error("Stream error: {0}")]
    Stream(#[from] std::io::Error),

    #[error(transparent)]
    Mux(#[from] MuxError),

    #[error("Internal error: {0}")]
    Internal(String),
}

pub type HostResult<T> = Result<T, HostError>;
