//! Validated settings structures

use crate::schema::{RawConfig, RawIngressConfig, RawLogConfig, RawSessionConfig, RawTarget};
use crate::validation::split_command;
use replmux_util::default_log_dir;
use std::collections::HashMap;
use std::net::{Ipv4Addr, SocketAddr};
use std::path::{Path, PathBuf};
use std::time::Duration;

/// Command run when neither an argument nor `default_target` picks one
pub const DEFAULT_COMMAND: &str = "sh";

pub const DEFAULT_BUFFER_SIZE: usize = 4096;
pub const DEFAULT_STOP_TIMEOUT: Duration = Duration::from_millis(2000);
pub const DEFAULT_DRAIN_TIMEOUT: Duration = Duration::from_millis(500);
pub const DEFAULT_LISTEN_ADDR: SocketAddr =
    SocketAddr::new(std::net::IpAddr::V4(Ipv4Addr::LOCALHOST), 4000);
pub const DEFAULT_LOG_TAG: &str = "replmux";

/// Validated settings ready for use by the binary
#[derive(Debug, Clone)]
pub struct Settings {
    pub default_target: Option<String>,
    pub session: SessionSettings,
    pub ingress: IngressSettings,
    pub log: LogSettings,
    pub targets: Vec<Target>,
}

impl Settings {
    /// Convert from raw config (after validation)
    pub fn from_raw(raw: RawConfig) -> Self {
        let default_listen = raw
            .ingress
            .listen_addr
            .as_deref()
            .and_then(|a| a.parse().ok())
            .unwrap_or(DEFAULT_LISTEN_ADDR);

        Self {
            default_target: raw.default_target,
            session: SessionSettings::from_raw(raw.session),
            ingress: IngressSettings::from_raw(raw.ingress),
            log: LogSettings::from_raw(raw.log),
            targets: raw
                .targets
                .into_iter()
                .map(|t| Target::from_raw(t, default_listen))
                .collect(),
        }
    }

    /// Get target by name
    pub fn get_target(&self, name: &str) -> Option<&Target> {
        self.targets.iter().find(|t| t.name == name)
    }

    /// Pick what `run`/`send` operate on.
    ///
    /// A configured name wins; any other argument is taken as a literal
    /// command line. Without an argument, `default_target` is used, then
    /// [`DEFAULT_COMMAND`].
    pub fn resolve_target(&self, arg: Option<&str>) -> Target {
        let chosen = arg.or(self.default_target.as_deref());

        if let Some(name) = chosen
            && let Some(target) = self.get_target(name)
        {
            return target.clone();
        }

        let command = chosen.unwrap_or(DEFAULT_COMMAND);
        Target {
            name: name_for_command(command),
            command: command.to_string(),
            listen_addr: self.ingress.listen_addr,
            cwd: None,
            env: HashMap::new(),
        }
    }
}

impl Default for Settings {
    fn default() -> Self {
        Self::from_raw(RawConfig::default())
    }
}

#[derive(Debug, Clone)]
pub struct SessionSettings {
    pub buffer_size: usize,
    pub stop_timeout: Duration,
    pub drain_timeout: Duration,
}

impl SessionSettings {
    fn from_raw(raw: RawSessionConfig) -> Self {
        Self {
            buffer_size: raw.buffer_size.unwrap_or(DEFAULT_BUFFER_SIZE),
            stop_timeout: raw
                .stop_timeout_ms
                .map(Duration::from_millis)
                .unwrap_or(DEFAULT_STOP_TIMEOUT),
            drain_timeout: raw
                .drain_timeout_ms
                .map(Duration::from_millis)
                .unwrap_or(DEFAULT_DRAIN_TIMEOUT),
        }
    }
}

#[derive(Debug, Clone)]
pub struct IngressSettings {
    pub enabled: bool,
    pub listen_addr: SocketAddr,
}

impl IngressSettings {
    fn from_raw(raw: RawIngressConfig) -> Self {
        Self {
            enabled: raw.enabled.unwrap_or(true),
            listen_addr: raw
                .listen_addr
                .as_deref()
                .and_then(|a| a.parse().ok())
                .unwrap_or(DEFAULT_LISTEN_ADDR),
        }
    }
}

#[derive(Debug, Clone)]
pub struct LogSettings {
    pub file: Option<PathBuf>,
    pub tag: String,
}

impl LogSettings {
    fn from_raw(raw: RawLogConfig) -> Self {
        Self {
            // Relative names land in the state directory
            file: raw.file.map(|file| {
                if file.is_relative() {
                    default_log_dir().join(file)
                } else {
                    file
                }
            }),
            tag: raw.tag.unwrap_or_else(|| DEFAULT_LOG_TAG.to_string()),
        }
    }
}

/// A resolved inner process definition
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Target {
    pub name: String,
    pub command: String,
    pub listen_addr: SocketAddr,
    pub cwd: Option<PathBuf>,
    pub env: HashMap<String, String>,
}

impl Target {
    fn from_raw(raw: RawTarget, default_listen: SocketAddr) -> Self {
        Self {
            listen_addr: raw
                .listen_addr
                .as_deref()
                .and_then(|a| a.parse().ok())
                .unwrap_or(default_listen),
            name: raw.name,
            command: raw.command,
            cwd: raw.cwd,
            env: raw.env,
        }
    }
}

/// Derive a filesystem-safe name from a literal command line
fn name_for_command(command: &str) -> String {
    split_command(command)
        .ok()
        .and_then(|argv| argv.into_iter().next())
        .and_then(|program| {
            Path::new(&program)
                .file_name()
                .map(|n| n.to_string_lossy().into_owned())
        })
        .filter(|name| !name.is_empty())
        .unwrap_or_else(|| DEFAULT_LOG_TAG.to_string())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::parse_config;

    const CONFIG: &str = r#"
        config_version = 1
        default_target = "python"

        [session]
        buffer_size = 1024
        stop_timeout_ms = 100

        [ingress]
        listen_addr = "127.0.0.1:4100"

        [[targets]]
        name = "python"
        command = "python3 -i"
        env = { PYTHONUNBUFFERED = "1" }

        [[targets]]
        name = "node"
        command = "node"
        listen_addr = "127.0.0.1:4200"
        cwd = "/tmp"
    "#;

    #[test]
    fn defaults_apply_to_missing_fields() {
        let settings = Settings::default();
        assert_eq!(settings.session.buffer_size, DEFAULT_BUFFER_SIZE);
        assert_eq!(settings.session.stop_timeout, DEFAULT_STOP_TIMEOUT);
        assert_eq!(settings.session.drain_timeout, DEFAULT_DRAIN_TIMEOUT);
        assert!(settings.ingress.enabled);
        assert_eq!(settings.ingress.listen_addr, DEFAULT_LISTEN_ADDR);
        assert_eq!(settings.log.tag, "replmux");
        assert!(settings.targets.is_empty());
    }

    #[test]
    fn relative_log_file_resolves_to_state_dir() {
        let settings = parse_config(
            r#"
            config_version = 1

            [log]
            file = "session.log"
        "#,
        )
        .unwrap();
        assert_eq!(settings.log.file, Some(default_log_dir().join("session.log")));

        let settings = parse_config(
            r#"
            config_version = 1

            [log]
            file = "/var/tmp/replmux.log"
        "#,
        )
        .unwrap();
        assert_eq!(settings.log.file, Some(PathBuf::from("/var/tmp/replmux.log")));
    }

    #[test]
    fn configured_values_override_defaults() {
        let settings = parse_config(CONFIG).unwrap();
        assert_eq!(settings.session.buffer_size, 1024);
        assert_eq!(settings.session.stop_timeout, Duration::from_millis(100));
        assert_eq!(settings.session.drain_timeout, DEFAULT_DRAIN_TIMEOUT);
        assert_eq!(settings.ingress.listen_addr.port(), 4100);
    }

    #[test]
    fn targets_inherit_ingress_address() {
        let settings = parse_config(CONFIG).unwrap();

        let python = settings.get_target("python").unwrap();
        assert_eq!(python.listen_addr.port(), 4100);
        assert_eq!(python.env.get("PYTHONUNBUFFERED").map(String::as_str), Some("1"));

        let node = settings.get_target("node").unwrap();
        assert_eq!(node.listen_addr.port(), 4200);
        assert_eq!(node.cwd.as_deref(), Some(Path::new("/tmp")));
    }

    #[test]
    fn resolve_named_target() {
        let settings = parse_config(CONFIG).unwrap();
        let target = settings.resolve_target(Some("node"));
        assert_eq!(target.command, "node");
        assert_eq!(target.listen_addr.port(), 4200);
    }

    #[test]
    fn resolve_without_argument_uses_default_target() {
        let settings = parse_config(CONFIG).unwrap();
        assert_eq!(settings.resolve_target(None).name, "python");
    }

    #[test]
    fn resolve_unknown_name_as_literal_command() {
        let settings = parse_config(CONFIG).unwrap();
        let target = settings.resolve_target(Some("/usr/bin/bc -q"));
        assert_eq!(target.command, "/usr/bin/bc -q");
        assert_eq!(target.name, "bc");
        assert_eq!(target.listen_addr.port(), 4100);
        assert!(target.env.is_empty());
    }

    #[test]
    fn resolve_falls_back_to_shell() {
        let target = Settings::default().resolve_target(None);
        assert_eq!(target.command, DEFAULT_COMMAND);
        assert_eq!(target.name, "sh");
        assert_eq!(target.listen_addr, DEFAULT_LISTEN_ADDR);
    }
}
