use std::env;
use std::time::Duration;

use tracing::warn;

use crate::session::ReconnectPolicy;

pub const DEFAULT_SIGNALING_URL: &str = "ws://127.0.0.1:9000";

/// Stohb runtime configuration
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Config {
    /// Base URL of the stohb-road broker
    pub signaling_url: String,
    /// How long a dial may stay unanswered before it is abandoned
    pub dial_timeout: Duration,
    /// Settle delay before a receiver greets a freshly opened channel
    pub greet_delay: Duration,
    pub reconnect: ReconnectPolicy,
    /// Ping interval on the broker socket
    pub heartbeat: Duration,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            signaling_url: DEFAULT_SIGNALING_URL.to_string(),
            dial_timeout: Duration::from_millis(8000),
            greet_delay: Duration::from_millis(500),
            reconnect: ReconnectPolicy::default(),
            heartbeat: Duration::from_secs(30),
        }
    }
}

impl Config {
    /// Load configuration from environment variables
    pub fn from_env() -> Self {
        let defaults = Self::default();
        let signaling_url = env::var("STOHB_SIGNALING_URL")
            .ok()
            .map(|raw| raw.trim().to_string())
            .filter(|raw| !raw.is_empty())
            .map(|raw| normalize_signaling_url(&raw))
            .unwrap_or(defaults.signaling_url);

        let reconnect = ReconnectPolicy {
            max_attempts: env_u32("STOHB_RECONNECT_ATTEMPTS")
                .unwrap_or(defaults.reconnect.max_attempts),
            base_delay: env_millis("STOHB_RECONNECT_BASE_MS")
                .unwrap_or(defaults.reconnect.base_delay),
            ..defaults.reconnect
        };

        Self {
            signaling_url,
            dial_timeout: env_millis("STOHB_DIAL_TIMEOUT_MS").unwrap_or(defaults.dial_timeout),
            greet_delay: env_millis("STOHB_GREET_DELAY_MS").unwrap_or(defaults.greet_delay),
            reconnect,
            heartbeat: env_number("STOHB_HEARTBEAT_SECS")
                .filter(|secs| *secs > 0)
                .map(Duration::from_secs)
                .unwrap_or(defaults.heartbeat),
        }
    }

    /// Override the broker URL, applying the same normalisation as the
    /// environment.
    pub fn with_signaling_url(mut self, url: &str) -> Self {
        self.signaling_url = normalize_signaling_url(url.trim());
        self
    }
}

/// Prefer IPv4 loopback and fill in a missing scheme.
pub fn normalize_signaling_url(raw: &str) -> String {
    let with_scheme = if raw.contains("://") {
        raw.to_string()
    } else {
        let host = raw.split([':', '/']).next().unwrap_or_default();
        let scheme = if is_loopback_host(host) { "ws" } else { "wss" };
        format!("{scheme}://{raw}")
    };
    match with_scheme.split_once("://") {
        Some((scheme, rest)) if rest == "localhost" || rest.starts_with("localhost:") || rest.starts_with("localhost/") => {
            format!("{scheme}://{}", rest.replacen("localhost", "127.0.0.1", 1))
        }
        _ => with_scheme,
    }
}

fn is_loopback_host(host: &str) -> bool {
    host == "localhost" || host == "0.0.0.0" || host.starts_with("127.")
}

fn env_number(name: &str) -> Option<u64> {
    let raw = env::var(name).ok()?;
    match raw.trim().parse::<u64>() {
        Ok(value) => Some(value),
        Err(err) => {
            warn!(target = "stohb::config", var = name, value = %raw, error = %err, "ignoring malformed setting");
            None
        }
    }
}

fn env_u32(name: &str) -> Option<u32> {
    let value = env_number(name)?;
    match u32::try_from(value) {
        Ok(value) => Some(value),
        Err(err) => {
            warn!(target = "stohb::config", var = name, value, error = %err, "ignoring out-of-range setting");
            None
        }
    }
}

fn env_millis(name: &str) -> Option<Duration> {
    env_number(name).map(Duration::from_millis)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Mutex;

    // Environment variable tests must not run in parallel
    static ENV_MUTEX: Mutex<()> = Mutex::new(());

    const VARS: &[&str] = &[
        "STOHB_SIGNALING_URL",
        "STOHB_DIAL_TIMEOUT_MS",
        "STOHB_GREET_DELAY_MS",
        "STOHB_RECONNECT_ATTEMPTS",
        "STOHB_RECONNECT_BASE_MS",
        "STOHB_HEARTBEAT_SECS",
    ];

    fn clear_env() {
        for var in VARS {
            unsafe {
                env::remove_var(var);
            }
        }
    }

    #[test]
    fn test_defaults_when_env_is_empty() {
        let _lock = ENV_MUTEX.lock().unwrap();
        clear_env();
        assert_eq!(Config::from_env(), Config::default());
    }

    #[test]
    fn test_config_from_env_custom() {
        let _lock = ENV_MUTEX.lock().unwrap();
        clear_env();
        unsafe {
            env::set_var("STOHB_SIGNALING_URL", "localhost:9100");
            env::set_var("STOHB_DIAL_TIMEOUT_MS", "5000");
            env::set_var("STOHB_GREET_DELAY_MS", "0");
            env::set_var("STOHB_RECONNECT_ATTEMPTS", "9");
            env::set_var("STOHB_HEARTBEAT_SECS", "10");
        }
        let config = Config::from_env();
        clear_env();

        assert_eq!(config.signaling_url, "ws://127.0.0.1:9100");
        assert_eq!(config.dial_timeout, Duration::from_secs(5));
        assert_eq!(config.greet_delay, Duration::ZERO);
        assert_eq!(config.reconnect.max_attempts, 9);
        assert_eq!(config.reconnect.base_delay, Duration::from_millis(500));
        assert_eq!(config.heartbeat, Duration::from_secs(10));
    }

    #[test]
    fn test_malformed_numbers_fall_back() {
        let _lock = ENV_MUTEX.lock().unwrap();
        clear_env();
        unsafe {
            env::set_var("STOHB_DIAL_TIMEOUT_MS", "soon");
            env::set_var("STOHB_HEARTBEAT_SECS", "0");
            env::set_var("STOHB_RECONNECT_ATTEMPTS", "4294967297");
        }
        let config = Config::from_env();
        clear_env();

        assert_eq!(config.dial_timeout, Config::default().dial_timeout);
        assert_eq!(config.heartbeat, Config::default().heartbeat);
        assert_eq!(
            config.reconnect.max_attempts,
            Config::default().reconnect.max_attempts
        );
    }

    #[test]
    fn test_url_normalisation() {
        assert_eq!(normalize_signaling_url("ws://localhost:9000"), "ws://127.0.0.1:9000");
        assert_eq!(normalize_signaling_url("127.0.0.1:9000"), "ws://127.0.0.1:9000");
        assert_eq!(normalize_signaling_url("relay.example.com"), "wss://relay.example.com");
        assert_eq!(
            normalize_signaling_url("https://relay.example.com/stohb"),
            "https://relay.example.com/stohb"
        );
    }
}
