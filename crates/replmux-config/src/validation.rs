//! Configuration validation

use crate::schema::{RawConfig, RawTarget};
use std::collections::HashSet;
use std::net::SocketAddr;
use thiserror::Error;

/// Validation error
#[derive(Debug, Clone, Error)]
pub enum ValidationError {
    #[error("Target '{target}': {message}")]
    TargetError { target: String, message: String },

    #[error("Duplicate target name: {0}")]
    DuplicateTarget(String),

    #[error("default_target '{0}' does not name a configured target")]
    UnknownDefaultTarget(String),

    #[error("Invalid listen address '{value}': {message}")]
    InvalidListenAddr { value: String, message: String },

    #[error("Session config error: {0}")]
    SessionError(String),
}

/// Validate a raw configuration
pub fn validate_config(config: &RawConfig) -> Vec<ValidationError> {
    let mut errors = Vec::new();

    let mut seen_names = HashSet::new();
    for target in &config.targets {
        if !seen_names.insert(target.name.as_str()) {
            errors.push(ValidationError::DuplicateTarget(target.name.clone()));
        }
    }

    for target in &config.targets {
        errors.extend(validate_target(target));
    }

    if let Some(default) = &config.default_target
        && !seen_names.contains(default.as_str())
    {
        errors.push(ValidationError::UnknownDefaultTarget(default.clone()));
    }

    if config.session.buffer_size == Some(0) {
        errors.push(ValidationError::SessionError(
            "buffer_size must be greater than zero".into(),
        ));
    }

    if let Some(addr) = &config.ingress.listen_addr
        && let Err(e) = parse_listen_addr(addr)
    {
        errors.push(e);
    }

    errors
}

fn validate_target(target: &RawTarget) -> Vec<ValidationError> {
    let mut errors = Vec::new();

    if target.name.is_empty() {
        errors.push(ValidationError::TargetError {
            target: target.name.clone(),
            message: "name cannot be empty".into(),
        });
    } else if target.name.contains('/') {
        errors.push(ValidationError::TargetError {
            target: target.name.clone(),
            message: "name cannot contain '/'".into(),
        });
    }

    if let Err(message) = split_command(&target.command) {
        errors.push(ValidationError::TargetError {
            target: target.name.clone(),
            message,
        });
    }

    if let Some(addr) = &target.listen_addr
        && let Err(e) = parse_listen_addr(addr)
    {
        errors.push(e);
    }

    errors
}

/// Tokenize a shell-style command line into program and arguments
pub fn split_command(command: &str) -> Result<Vec<String>, String> {
    let argv = shlex::split(command).ok_or_else(|| "command has unbalanced quoting".to_string())?;
    if argv.is_empty() {
        return Err("command cannot be empty".into());
    }
    Ok(argv)
}

/// Parse a `host:port` socket address
pub fn parse_listen_addr(value: &str) -> Result<SocketAddr, ValidationError> {
    value
        .parse()
        .map_err(|e: std::net::AddrParseError| ValidationError::InvalidListenAddr {
            value: value.to_string(),
            message: e.to_string(),
        })
}
