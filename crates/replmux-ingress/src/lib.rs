//! HTTP ingress for replmux
//!
//! Provides:
//! - `POST /stdin`: the request body is broadcast verbatim into a session
//! - `GET /health`: liveness check
//! - A client used by `replmux send`

mod client;
mod server;

pub use client::*;
pub use server::*;

use std::net::SocketAddr;
use thiserror::Error;

/// Ingress errors
#[derive(Debug, Error)]
pub enum IngressError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("HTTP error: {0}")]
    Http(#[from] reqwest::Error),

    #[error("Ingress rejected payload ({status}): {message}")]
    Rejected { status: u16, message: String },

    #[error("Failed to bind {addr}: {source}")]
    Bind {
        addr: SocketAddr,
        #[source]
        source: std::io::Error,
    },
}

pub type IngressResult<T> = Result<T, IngressError>;
