pub mod logging {
    //! Process-wide tracing setup for the `stohb` binary.
    //!
    //! Library code only emits events; installing a subscriber is left to the
    //! host. The CLI resolves a [`LogConfig`] from its flags and environment
    //! and calls [`init`] once at startup.

    use std::fs::OpenOptions;
    use std::path::PathBuf;
    use std::sync::OnceLock;

    use clap::ValueEnum;
    use tracing::level_filters::LevelFilter;
    use tracing_appender::non_blocking::WorkerGuard;
    use tracing_subscriber::layer::SubscriberExt;
    use tracing_subscriber::util::SubscriberInitExt;
    use tracing_subscriber::{EnvFilter, fmt};

    /// Replaces the computed filter entirely when set.
    pub const FILTER_ENV: &str = "STOHB_LOG_FILTER";
    /// Lets transport crates log at trace level alongside ours.
    pub const TRACE_DEPS_ENV: &str = "STOHB_TRACE_DEPS";

    /// Crates whose trace output drowns out session events.
    const NOISY_DEPENDENCIES: &[&str] = &["tungstenite", "tokio_tungstenite", "rustls", "hyper", "mio"];

    #[derive(Clone, Copy, Debug, Default, ValueEnum, PartialEq, Eq, PartialOrd, Ord)]
    pub enum LogLevel {
        Error,
        #[default]
        Warn,
        Info,
        Debug,
        Trace,
    }

    impl From<LogLevel> for LevelFilter {
        fn from(level: LogLevel) -> Self {
            match level {
                LogLevel::Error => LevelFilter::ERROR,
                LogLevel::Warn => LevelFilter::WARN,
                LogLevel::Info => LevelFilter::INFO,
                LogLevel::Debug => LevelFilter::DEBUG,
                LogLevel::Trace => LevelFilter::TRACE,
            }
        }
    }

    #[derive(Clone, Debug, Default, PartialEq, Eq)]
    pub struct LogConfig {
        pub level: LogLevel,
        /// Append to this file instead of writing to stderr.
        pub file: Option<PathBuf>,
        /// Raw `EnvFilter` directives that override `level`.
        pub filter: Option<String>,
        pub trace_dependencies: bool,
    }

    impl LogConfig {
        pub fn new(level: LogLevel, file: Option<PathBuf>) -> Self {
            Self {
                level,
                file,
                ..Self::default()
            }
        }

        /// Pick up [`FILTER_ENV`] and [`TRACE_DEPS_ENV`].
        pub fn with_env_overrides(mut self) -> Self {
            self.filter = std::env::var(FILTER_ENV)
                .ok()
                .filter(|raw| !raw.trim().is_empty());
            self.trace_dependencies = std::env::var(TRACE_DEPS_ENV)
                .map(|raw| !raw.is_empty() && raw != "0")
                .unwrap_or(false);
            self
        }

        /// Filter directives for this config, and whether dependency output
        /// was capped below trace.
        pub fn directives(&self) -> (String, bool) {
            if let Some(filter) = &self.filter {
                return (filter.clone(), false);
            }
            let ours = LevelFilter::from(self.level).to_string().to_lowercase();
            let mut directives = match self.level {
                LogLevel::Debug | LogLevel::Trace => {
                    format!("info,stohb={ours},stohb_core={ours}")
                }
                _ => ours,
            };
            let capped = self.level == LogLevel::Trace && !self.trace_dependencies;
            if capped {
                for krate in NOISY_DEPENDENCIES {
                    directives.push_str(&format!(",{krate}=info"));
                }
            }
            (directives, capped)
        }
    }

    #[derive(thiserror::Error, Debug)]
    pub enum InitError {
        #[error("cannot open log file {path:?}: {source}")]
        Io {
            path: PathBuf,
            source: std::io::Error,
        },
        #[error("invalid log filter {directives:?}: {reason}")]
        Filter { directives: String, reason: String },
        #[error("a global logger is already installed: {0}")]
        Install(String),
    }

    /// Keeps the non-blocking writer flushing for the life of the process.
    static WRITER_GUARD: OnceLock<WorkerGuard> = OnceLock::new();

    /// Install the global subscriber. A second call is a no-op.
    pub fn init(config: &LogConfig) -> Result<(), InitError> {
        if WRITER_GUARD.get().is_some() {
            return Ok(());
        }

        let (directives, capped) = config.directives();
        let filter = EnvFilter::builder()
            .parse(&directives)
            .map_err(|err| InitError::Filter {
                directives: directives.clone(),
                reason: err.to_string(),
            })?;

        let (writer, guard) = match &config.file {
            Some(path) => {
                let file = OpenOptions::new()
                    .create(true)
                    .append(true)
                    .open(path)
                    .map_err(|source| InitError::Io {
                        path: path.clone(),
                        source,
                    })?;
                tracing_appender::non_blocking(file)
            }
            None => tracing_appender::non_blocking(std::io::stderr()),
        };

        let verbose = config.level >= LogLevel::Debug;
        let layer = fmt::layer()
            .with_writer(writer)
            .with_ansi(config.file.is_none())
            .with_target(verbose)
            .with_thread_ids(config.level == LogLevel::Trace);
        tracing_subscriber::registry()
            .with(filter)
            .with(layer)
            .try_init()
            .map_err(|err| InitError::Install(err.to_string()))?;

        let _ = WRITER_GUARD.set(guard);
        if capped {
            tracing::info!(
                target = "stohb::telemetry",
                "dependency traces capped at info; set {TRACE_DEPS_ENV}=1 to lift"
            );
        }
        Ok(())
    }

    #[cfg(test)]
    mod tests {
        use super::*;

        #[test]
        fn trace_caps_transport_crates_unless_asked() {
            let mut config = LogConfig::new(LogLevel::Trace, None);
            let (directives, capped) = config.directives();
            assert!(capped);
            assert!(directives.starts_with("info,stohb=trace,stohb_core=trace"));
            assert!(directives.ends_with(",mio=info"));

            config.trace_dependencies = true;
            let (directives, capped) = config.directives();
            assert!(!capped);
            assert_eq!(directives, "info,stohb=trace,stohb_core=trace");
        }

        #[test]
        fn explicit_filter_wins() {
            let config = LogConfig {
                filter: Some("stohb_core::session=debug".into()),
                ..LogConfig::new(LogLevel::Error, None)
            };
            assert_eq!(
                config.directives(),
                ("stohb_core::session=debug".to_string(), false)
            );
        }

        #[test]
        fn quiet_levels_apply_globally() {
            assert_eq!(LogConfig::default().directives().0, "warn");
            assert_eq!(LogConfig::new(LogLevel::Info, None).directives().0, "info");
            assert!(LogLevel::Trace > LogLevel::Debug);
        }
    }
}
