use std::env;
use std::time::Duration;

pub const DEFAULT_PORT: u16 = 9000;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Config {
    pub port: u16,
    /// Sockets silent for longer than this are dropped
    pub heartbeat_timeout: Duration,
    /// Largest relayed `data` payload, in bytes
    pub max_payload_bytes: usize,
}

impl Config {
    pub fn from_env() -> Self {
        let defaults = Self::default();
        Self {
            port: env::var("STOHB_ROAD_PORT")
                .ok()
                .and_then(|p| p.parse().ok())
                .unwrap_or(defaults.port),
            heartbeat_timeout: env::var("STOHB_ROAD_HEARTBEAT_TIMEOUT_SECS")
                .ok()
                .and_then(|t| t.parse().ok())
                .filter(|secs| *secs > 0)
                .map(Duration::from_secs)
                .unwrap_or(defaults.heartbeat_timeout),
            max_payload_bytes: env::var("STOHB_ROAD_MAX_PAYLOAD_BYTES")
                .ok()
                .and_then(|b| b.parse().ok())
                .filter(|bytes| *bytes > 0)
                .unwrap_or(defaults.max_payload_bytes),
        }
    }
}

impl Default for Config {
    fn default() -> Self {
        Self {
            port: DEFAULT_PORT,
            heartbeat_timeout: Duration::from_secs(120),
            max_payload_bytes: 16 * 1024 * 1024, // 16 MiB, room for full-size photos
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Mutex;

    static ENV_MUTEX: Mutex<()> = Mutex::new(());

    const VARS: &[&str] = &[
        "STOHB_ROAD_PORT",
        "STOHB_ROAD_HEARTBEAT_TIMEOUT_SECS",
        "STOHB_ROAD_MAX_PAYLOAD_BYTES",
    ];

    fn clear_env() {
        for var in VARS {
            env::remove_var(var);
        }
    }

    #[test]
    fn defaults_without_env() {
        let _lock = ENV_MUTEX.lock().unwrap();
        clear_env();
        assert_eq!(Config::from_env(), Config::default());
        assert_eq!(Config::default().port, 9000);
    }

    #[test]
    fn env_overrides_and_rejects_nonsense() {
        let _lock = ENV_MUTEX.lock().unwrap();
        clear_env();
        env::set_var("STOHB_ROAD_PORT", "9100");
        env::set_var("STOHB_ROAD_HEARTBEAT_TIMEOUT_SECS", "0");
        env::set_var("STOHB_ROAD_MAX_PAYLOAD_BYTES", "1048576");
        let config = Config::from_env();
        clear_env();

        assert_eq!(config.port, 9100);
        assert_eq!(config.heartbeat_timeout, Duration::from_secs(120));
        assert_eq!(config.max_payload_bytes, 1024 * 1024);
    }
}
