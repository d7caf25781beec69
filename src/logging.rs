use std::env;
use std::fs::OpenOptions;
use std::io;
use std::path::PathBuf;
use tracing_subscriber::{EnvFilter, fmt, layer::SubscriberExt, util::SubscriberInitExt};

/// Configuration for the logging system
#[derive(Debug, Clone)]
pub struct LogConfig {
    /// Log level filter (e.g., "debug", "info", "warn", "error")
    pub level: String,
    /// Optional log file path. If None, logs only to stderr
    pub file_path: Option<PathBuf>,
    /// Whether to use structured JSON format for logs
    pub json_format: bool,
}

impl Default for LogConfig {
    fn default() -> Self {
        Self {
            level: "info".to_string(),
            file_path: None,
            json_format: false,
        }
    }
}

impl LogConfig {
    /// Create LogConfig from environment variables
    pub fn from_env() -> Self {
        Self::from_lookup(|key| env::var(key).ok())
    }

    fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Self {
        let level = lookup("RUST_LOG").unwrap_or_else(|| "info".to_string());

        let unique = lookup("LDB_LOG_UNIQUE").unwrap_or_default() == "true";
        let file_path = lookup("LDB_LOG_FILE").map(|path| {
            let path_buf = PathBuf::from(path);
            if unique {
                unique_log_path(path_buf, std::process::id())
            } else {
                path_buf
            }
        });

        let json_format = lookup("LDB_LOG_JSON").unwrap_or_default() == "true";

        Self {
            level,
            file_path,
            json_format,
        }
    }

    /// Override values from CLI arguments
    pub fn with_overrides(mut self, level: Option<String>, file_path: Option<PathBuf>) -> Self {
        if let Some(level) = level {
            self.level = level;
        }
        if let Some(file_path) = file_path {
            self.file_path = Some(file_path);
        }
        self
    }
}

/// Insert the process id before the extension: `ldb.log` becomes `ldb.<pid>.log`
fn unique_log_path(mut path_buf: PathBuf, pid: u32) -> PathBuf {
    if let Some(filename) = path_buf.file_stem() {
        let extension = path_buf
            .extension()
            .and_then(|ext| ext.to_str())
            .unwrap_or("");

        let unique_filename = if extension.is_empty() {
            format!("{}.{}", filename.to_string_lossy(), pid)
        } else {
            format!("{}.{}.{}", filename.to_string_lossy(), pid, extension)
        };

        path_buf.set_file_name(unique_filename);
    }
    path_buf
}

/// Initialize the logging system based on configuration
pub fn init_logging(config: LogConfig) -> Result<(), Box<dyn std::error::Error>> {
    // Create environment filter from log level
    let env_filter = EnvFilter::try_new(&config.level).or_else(|_| EnvFilter::try_new("info"))?;

    let subscriber = tracing_subscriber::registry().with(env_filter);

    match (&config.file_path, config.json_format) {
        (Some(file_path), true) => {
            let file = OpenOptions::new()
                .create(true)
                .append(true)
                .open(file_path)?;

            let file_layer = fmt::layer().json().with_writer(file).with_ansi(false);

            subscriber.with(file_layer).init();
        }
        (Some(file_path), false) => {
            let file = OpenOptions::new()
                .create(true)
                .append(true)
                .open(file_path)?;

            let file_layer = fmt::layer()
                .with_writer(file)
                .with_ansi(false)
                .with_target(true)
                .with_thread_ids(true)
                .with_line_number(true);

            subscriber.with(file_layer).init();
        }
        (None, true) => {
            let stderr_layer = fmt::layer().json().with_writer(io::stderr).with_ansi(false);

            subscriber.with(stderr_layer).init();
        }
        // Stderr keeps stdout free for the console
        (None, false) => {
            let stderr_layer = fmt::layer()
                .with_writer(io::stderr)
                .with_ansi(true)
                .with_target(true)
                .with_thread_ids(true)
                .with_line_number(true);

            subscriber.with(stderr_layer).init();
        }
    }

    Ok(())
}

/// Log one line crossing a debugger channel in a single structured event
#[macro_export]
macro_rules! log_wire_message {
    ($level:expr, $channel:expr, $direction:expr, $line:expr) => {
        tracing::event!(
            $level,
            channel = $channel,
            direction = $direction,
            line = ?$line,
            pid = std::process::id(),
            "ldb message"
        );
    };
}

/// Helper function to log performance timing
#[macro_export]
macro_rules! log_timing {
    ($level:expr, $operation:expr, $duration:expr) => {
        tracing::event!(
            $level,
            operation = $operation,
            duration_ms = $duration.as_millis(),
            pid = std::process::id(),
            "Performance timing"
        );
    };
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    fn lookup_from(vars: &[(&str, &str)]) -> impl Fn(&str) -> Option<String> {
        let vars: HashMap<String, String> = vars
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        move |key| vars.get(key).cloned()
    }

    #[test]
    fn test_defaults_without_environment() {
        let config = LogConfig::from_lookup(lookup_from(&[]));

        assert_eq!(config.level, "info");
        assert!(config.file_path.is_none());
        assert!(!config.json_format);
    }

    #[test]
    fn test_environment_values() {
        let config = LogConfig::from_lookup(lookup_from(&[
            ("RUST_LOG", "ldb_client=trace"),
            ("LDB_LOG_FILE", "/tmp/ldb.log"),
            ("LDB_LOG_JSON", "true"),
        ]));

        assert_eq!(config.level, "ldb_client=trace");
        assert_eq!(config.file_path, Some(PathBuf::from("/tmp/ldb.log")));
        assert!(config.json_format);
    }

    #[test]
    fn test_unique_log_file_name() {
        assert_eq!(
            unique_log_path(PathBuf::from("/tmp/ldb.log"), 42),
            PathBuf::from("/tmp/ldb.42.log")
        );
        assert_eq!(
            unique_log_path(PathBuf::from("/tmp/ldb"), 42),
            PathBuf::from("/tmp/ldb.42")
        );

        let config = LogConfig::from_lookup(lookup_from(&[
            ("LDB_LOG_FILE", "/tmp/session.log"),
            ("LDB_LOG_UNIQUE", "true"),
        ]));
        let expected = format!("/tmp/session.{}.log", std::process::id());
        assert_eq!(config.file_path, Some(PathBuf::from(expected)));
    }

    #[test]
    fn test_cli_overrides() {
        let config = LogConfig::default().with_overrides(
            Some("debug".to_string()),
            Some(PathBuf::from("/tmp/override.log")),
        );

        assert_eq!(config.level, "debug");
        assert_eq!(config.file_path, Some(PathBuf::from("/tmp/override.log")));

        let untouched = LogConfig::default().with_overrides(None, None);
        assert_eq!(untouched.level, "info");
        assert!(untouched.file_path.is_none());
    }
}
