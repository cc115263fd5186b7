//! Injectable line logger
//!
//! Stream components take a [`Logger`] at construction instead of reaching
//! for process-wide state. The default logger discards everything, so no
//! component needs a real logging backend to function.

use chrono::Local;
use std::fmt;
use std::io::Write;
use std::sync::{Arc, Mutex};

const TIMESTAMP_FORMAT: &str = "%Y/%m/%d %H:%M:%S";

/// Cheap-to-clone line logger with a caller-supplied tag
#[derive(Clone, Default)]
pub struct Logger {
    inner: Option<LoggerInner>,
}

#[derive(Clone)]
struct LoggerInner {
    tag: String,
    target: Arc<Target>,
}

enum Target {
    /// Forward lines to `tracing` at debug level
    Tracing,
    /// Write timestamped, tagged lines to an arbitrary writer
    Writer(Mutex<Box<dyn Write + Send>>),
}

impl Logger {
    /// Logger that drops every line
    pub fn discard() -> Self {
        Self::default()
    }

    /// Logger that forwards every line to `tracing` with a `component` field
    pub fn tracing(tag: impl Into<String>) -> Self {
        Self {
            inner: Some(LoggerInner {
                tag: tag.into(),
                target: Arc::new(Target::Tracing),
            }),
        }
    }

    /// Logger that writes `YYYY/MM/DD HH:MM:SS tag: line` to `writer`
    pub fn to_writer(tag: impl Into<String>, writer: impl Write + Send + 'static) -> Self {
        Self {
            inner: Some(LoggerInner {
                tag: tag.into(),
                target: Arc::new(Target::Writer(Mutex::new(Box::new(writer)))),
            }),
        }
    }

    /// Derive a logger sharing this one's target, tagged `parent.name`
    pub fn child(&self, name: &str) -> Self {
        let inner = self.inner.as_ref().map(|inner| LoggerInner {
            tag: if inner.tag.is_empty() {
                name.to_string()
            } else {
                format!("{}.{}", inner.tag, name)
            },
            target: inner.target.clone(),
        });
        Self { inner }
    }

    pub fn is_enabled(&self) -> bool {
        self.inner.is_some()
    }

    pub fn tag(&self) -> &str {
        self.inner.as_ref().map(|i| i.tag.as_str()).unwrap_or("")
    }

    /// Emit one line. Write failures on the underlying writer are dropped.
    pub fn log(&self, line: impl fmt::Display) {
        let Some(inner) = &self.inner else {
            return;
        };

        match inner.target.as_ref() {
            Target::Tracing => {
                tracing::debug!(component = %inner.tag, "{}", line);
            }
            Target::Writer(writer) => {
                let formatted = format_line(&inner.tag, &line);
                // A poisoned lock only means another writer panicked mid-line
                let mut writer = match writer.lock() {
                    Ok(w) => w,
                    Err(poisoned) => poisoned.into_inner(),
                };
                let _ = writer.write_all(formatted.as_bytes());
                let _ = writer.flush();
            }
        }
    }
}

impl fmt::Debug for Logger {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &self.inner {
            None => f.write_str("Logger(discard)"),
            Some(inner) => match inner.target.as_ref() {
                Target::Tracing => write!(f, "Logger(tracing, {:?})", inner.tag),
                Target::Writer(_) => write!(f, "Logger(writer, {:?})", inner.tag),
            },
        }
    }
}

fn format_line(tag: &str, line: &dyn fmt::Display) -> String {
    let timestamp = Local::now().format(TIMESTAMP_FORMAT);
    if tag.is_empty() {
        format!("{} {}\n", timestamp, line)
    } else {
        format!("{} {}: {}\n", timestamp, tag, line)
    }
}
