use std::path::PathBuf;

use tracing_appender::non_blocking::{NonBlocking, WorkerGuard};
use tracing_appender::rolling::{RollingFileAppender, Rotation};
use tracing_subscriber::{fmt, layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

const DEFAULT_LOG_DIR: &str = "./logs";
const DEFAULT_FILE_PREFIX: &str = "practice-engine.log";

/// Keeps the non-blocking file writer flushing; hold it until shutdown.
pub struct FileLogGuard {
    _guard: WorkerGuard,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FileSink {
    pub dir: PathBuf,
    pub prefix: String,
}

/// Where log output goes. Read from `ENABLE_FILE_LOGS`, `LOG_DIR` and `LOG_FILE_PREFIX`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LogSettings {
    pub filter: String,
    pub file: Option<FileSink>,
}

impl LogSettings {
    pub fn from_env(log_level: &str) -> Self {
        Self::from_lookup(log_level, |key| std::env::var(key).ok())
    }

    fn from_lookup(log_level: &str, lookup: impl Fn(&str) -> Option<String>) -> Self {
        let enabled = lookup("ENABLE_FILE_LOGS").is_some_and(|v| matches!(v.trim(), "true" | "1"));
        let file = enabled.then(|| FileSink {
            dir: lookup("LOG_DIR")
                .map(PathBuf::from)
                .unwrap_or_else(|| PathBuf::from(DEFAULT_LOG_DIR)),
            prefix: lookup("LOG_FILE_PREFIX")
                .filter(|p| !p.trim().is_empty())
                .unwrap_or_else(|| DEFAULT_FILE_PREFIX.to_string()),
        });
        Self {
            filter: log_level.to_string(),
            file,
        }
    }

    fn env_filter(&self) -> EnvFilter {
        EnvFilter::try_new(&self.filter).unwrap_or_else(|_| EnvFilter::new("info"))
    }
}

fn open_file_sink(sink: &FileSink) -> std::io::Result<(NonBlocking, WorkerGuard)> {
    std::fs::create_dir_all(&sink.dir)?;
    let appender = RollingFileAppender::new(Rotation::DAILY, &sink.dir, &sink.prefix);
    Ok(tracing_appender::non_blocking(appender))
}

/// Installs the global subscriber: stdout always, plus a daily rolling file when enabled.
/// A file sink that cannot be opened is reported on stderr and skipped.
pub fn init_tracing(log_level: &str) -> Option<FileLogGuard> {
    let settings = LogSettings::from_env(log_level);

    let mut guard = None;
    let file_layer = match &settings.file {
        Some(sink) => match open_file_sink(sink) {
            Ok((writer, worker_guard)) => {
                guard = Some(FileLogGuard {
                    _guard: worker_guard,
                });
                Some(
                    fmt::layer()
                        .with_writer(writer)
                        .with_ansi(false)
                        .with_target(true),
                )
            }
            Err(err) => {
                eprintln!("failed to create log directory {}: {err}", sink.dir.display());
                None
            }
        },
        None => None,
    };

    tracing_subscriber::registry()
        .with(settings.env_filter())
        .with(fmt::layer().with_target(true))
        .with(file_layer)
        .init();

    guard
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    fn settings(vars: &[(&str, &str)]) -> LogSettings {
        let vars: HashMap<String, String> = vars
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        LogSettings::from_lookup("debug", |key| vars.get(key).cloned())
    }

    #[test]
    fn test_file_sink_disabled_by_default() {
        assert_eq!(settings(&[]).file, None);
        assert_eq!(settings(&[("ENABLE_FILE_LOGS", "yes")]).file, None);
        assert_eq!(settings(&[]).filter, "debug");
    }

    #[test]
    fn test_file_sink_defaults_and_overrides() {
        let default_sink = settings(&[("ENABLE_FILE_LOGS", "1")]).file.expect("sink");
        assert_eq!(default_sink.dir, PathBuf::from("./logs"));
        assert_eq!(default_sink.prefix, "practice-engine.log");

        let custom = settings(&[
            ("ENABLE_FILE_LOGS", "true"),
            ("LOG_DIR", "/var/log/engine"),
            ("LOG_FILE_PREFIX", "trainer.log"),
        ])
        .file
        .expect("sink");
        assert_eq!(custom.dir, PathBuf::from("/var/log/engine"));
        assert_eq!(custom.prefix, "trainer.log");
    }

    #[test]
    fn test_invalid_filter_falls_back() {
        let settings = LogSettings {
            filter: "not a [valid filter".to_string(),
            file: None,
        };
        assert_eq!(settings.env_filter().to_string(), "info");
    }
}
