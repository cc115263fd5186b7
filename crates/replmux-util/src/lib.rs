//! Shared utilities for replmux
//!
//! This crate provides:
//! - ID types (SessionId)
//! - The injectable line logger handed to every stream component
//! - Default paths for the config file and log directory

mod ids;
mod log;
mod paths;

pub use ids::*;
pub use log::*;
pub use paths::*;
