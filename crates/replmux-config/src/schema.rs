//! Raw configuration schema (as parsed from TOML)

use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::path::PathBuf;

/// Raw configuration as parsed from TOML
#[derive(Debug, Clone, Default, Deserialize, Serialize)]
pub struct RawConfig {
    /// Config schema version
    pub config_version: u32,

    /// Target used when `run`/`send` get no argument
    pub default_target: Option<String>,

    #[serde(default)]
    pub session: RawSessionConfig,

    #[serde(default)]
    pub ingress: RawIngressConfig,

    #[serde(default)]
    pub log: RawLogConfig,

    /// Named inner processes
    #[serde(default)]
    pub targets: Vec<RawTarget>,
}

/// Per-session stream and shutdown tuning
#[derive(Debug, Clone, Default, Deserialize, Serialize)]
pub struct RawSessionConfig {
    /// Chunk size for every forwarding loop (default: 4096)
    pub buffer_size: Option<usize>,

    /// Grace period between stdin close, SIGTERM and SIGKILL (default: 2000)
    pub stop_timeout_ms: Option<u64>,

    /// Time granted to output forwarders after the process exits (default: 500)
    pub drain_timeout_ms: Option<u64>,
}

/// HTTP ingress settings
#[derive(Debug, Clone, Default, Deserialize, Serialize)]
pub struct RawIngressConfig {
    /// Default: true
    pub enabled: Option<bool>,

    /// Default: 127.0.0.1:4000
    pub listen_addr: Option<String>,
}

/// Tagged line log settings
#[derive(Debug, Clone, Default, Deserialize, Serialize)]
pub struct RawLogConfig {
    /// Append tagged lines here; relative paths are under the state directory.
    /// Unset means the line log goes to tracing
    pub file: Option<PathBuf>,

    /// Default: "replmux"
    pub tag: Option<String>,
}

/// Raw target definition
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct RawTarget {
    /// Unique name, also used to name the session FIFO
    pub name: String,

    /// Shell-style command line (quotes honored, no expansion)
    pub command: String,

    /// Ingress address for this target's sessions
    pub listen_addr: Option<String>,

    pub cwd: Option<PathBuf>,

    #[serde(default)]
    pub env: HashMap<String, String>,
}
