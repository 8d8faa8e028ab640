use tracing_appender::non_blocking::WorkerGuard;
use tracing_appender::rolling::{RollingFileAppender, Rotation};
use tracing_subscriber::{fmt, layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

/// Keeps the non-blocking file writer alive; drop flushes pending lines
pub struct FileLogGuard {
    _guard: WorkerGuard,
}

#[derive(Debug, Clone)]
pub struct LogSettings {
    pub file_enabled: bool,
    pub dir: String,
    pub file_prefix: String,
    pub rotation: LogRotation,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LogRotation {
    Hourly,
    Daily,
    Never,
}

impl LogRotation {
    fn parse(value: &str) -> Option<Self> {
        match value.to_ascii_lowercase().as_str() {
            "hourly" => Some(Self::Hourly),
            "daily" => Some(Self::Daily),
            "never" => Some(Self::Never),
            _ => None,
        }
    }

    fn into_rotation(self) -> Rotation {
        match self {
            Self::Hourly => Rotation::HOURLY,
            Self::Daily => Rotation::DAILY,
            Self::Never => Rotation::NEVER,
        }
    }
}

impl LogSettings {
    pub fn from_env() -> Self {
        let file_enabled = std::env::var("ENABLE_FILE_LOGS")
            .map(|v| v == "true" || v == "1")
            .unwrap_or(false);
        let rotation = std::env::var("LOG_ROTATION")
            .ok()
            .as_deref()
            .and_then(LogRotation::parse)
            .unwrap_or(LogRotation::Daily);

        Self {
            file_enabled,
            dir: std::env::var("LOG_DIR").unwrap_or_else(|_| "./logs".to_string()),
            file_prefix: "lumen-core.log".to_string(),
            rotation,
        }
    }
}

/// Install the global subscriber: stdout always, a rolling file when enabled
pub fn init_tracing(log_level: &str) -> Option<FileLogGuard> {
    let settings = LogSettings::from_env();
    let env_filter = EnvFilter::try_new(log_level).unwrap_or_else(|_| EnvFilter::new("info"));
    let stdout_layer = fmt::layer().with_target(true);

    if settings.file_enabled {
        if let Err(err) = std::fs::create_dir_all(&settings.dir) {
            eprintln!("failed to create log directory {}: {err}", settings.dir);
        } else {
            let file_appender = RollingFileAppender::new(
                settings.rotation.into_rotation(),
                &settings.dir,
                &settings.file_prefix,
            );
            let (file_writer, guard) = tracing_appender::non_blocking(file_appender);
            let file_layer = fmt::layer()
                .with_writer(file_writer)
                .with_ansi(false)
                .with_target(true);

            tracing_subscriber::registry()
                .with(env_filter)
                .with(stdout_layer)
                .with(file_layer)
                .init();

            return Some(FileLogGuard { _guard: guard });
        }
    }

    tracing_subscriber::registry()
        .with(env_filter)
        .with(stdout_layer)
        .init();

    None
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_rotation_parse() {
        assert_eq!(LogRotation::parse("HOURLY"), Some(LogRotation::Hourly));
        assert_eq!(LogRotation::parse("daily"), Some(LogRotation::Daily));
        assert_eq!(LogRotation::parse("weekly"), None);
    }
}
