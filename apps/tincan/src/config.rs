use std::env;
use std::time::Duration;

pub const DEFAULT_RELAY_URL: &str = "ws://127.0.0.1:8000/ws";
pub const DEFAULT_STUN_SERVER: &str = "stun:stun.l.google.com:19302";

/// Runtime configuration, resolved from `TINCAN_*` environment variables
/// with CLI flags layered on top by the binary.
#[derive(Debug, Clone)]
pub struct Config {
    pub relay_url: String,
    pub stun_servers: Vec<String>,
    pub match_timeout: Duration,
    pub negotiation_timeout: Duration,
}

impl Config {
    pub fn from_env() -> Self {
        let relay_url =
            env::var("TINCAN_RELAY_URL").unwrap_or_else(|_| DEFAULT_RELAY_URL.to_string());
        let stun_servers = env::var("TINCAN_STUN_SERVER")
            .map(|raw| {
                raw.split(',')
                    .map(str::trim)
                    .filter(|entry| !entry.is_empty())
                    .map(str::to_string)
                    .collect::<Vec<_>>()
            })
            .ok()
            .filter(|servers| !servers.is_empty())
            .unwrap_or_else(|| vec![DEFAULT_STUN_SERVER.to_string()]);
        let match_timeout = secs_var("TINCAN_MATCH_TIMEOUT_SECS", 90);
        let negotiation_timeout = secs_var("TINCAN_NEGOTIATION_TIMEOUT_SECS", 30);
        Self {
            relay_url,
            stun_servers,
            match_timeout,
            negotiation_timeout,
        }
    }
}

impl Default for Config {
    fn default() -> Self {
        Self {
            relay_url: DEFAULT_RELAY_URL.to_string(),
            stun_servers: vec![DEFAULT_STUN_SERVER.to_string()],
            match_timeout: Duration::from_secs(90),
            negotiation_timeout: Duration::from_secs(30),
        }
    }
}

fn secs_var(var: &str, default: u64) -> Duration {
    Duration::from_secs(
        env::var(var)
            .ok()
            .and_then(|value| value.parse().ok())
            .unwrap_or(default),
    )
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::{LazyLock, Mutex};

    // Environment variable tests must not run in parallel.
    static ENV_MUTEX: LazyLock<Mutex<()>> = LazyLock::new(|| Mutex::new(()));

    const VARS: &[&str] = &[
        "TINCAN_RELAY_URL",
        "TINCAN_STUN_SERVER",
        "TINCAN_MATCH_TIMEOUT_SECS",
        "TINCAN_NEGOTIATION_TIMEOUT_SECS",
    ];

    fn clear_vars() {
        for var in VARS {
            unsafe {
                env::remove_var(var);
            }
        }
    }

    #[test]
    fn defaults_apply_without_env() {
        let _lock = ENV_MUTEX.lock().unwrap();
        clear_vars();
        let config = Config::from_env();
        assert_eq!(config.relay_url, DEFAULT_RELAY_URL);
        assert_eq!(config.stun_servers, vec![DEFAULT_STUN_SERVER.to_string()]);
        assert_eq!(config.match_timeout, Duration::from_secs(90));
    }

    #[test]
    fn env_overrides_are_honored() {
        let _lock = ENV_MUTEX.lock().unwrap();
        clear_vars();
        unsafe {
            env::set_var("TINCAN_RELAY_URL", "wss://relay.example.com/ws");
            env::set_var(
                "TINCAN_STUN_SERVER",
                "stun:one.example.com:3478, stun:two.example.com:3478",
            );
            env::set_var("TINCAN_NEGOTIATION_TIMEOUT_SECS", "5");
        }
        let config = Config::from_env();
        assert_eq!(config.relay_url, "wss://relay.example.com/ws");
        assert_eq!(config.stun_servers.len(), 2);
        assert_eq!(config.stun_servers[1], "stun:two.example.com:3478");
        assert_eq!(config.negotiation_timeout, Duration::from_secs(5));
        clear_vars();
    }

    #[test]
    fn unparseable_timeout_falls_back() {
        let _lock = ENV_MUTEX.lock().unwrap();
        clear_vars();
        unsafe {
            env::set_var("TINCAN_MATCH_TIMEOUT_SECS", "soon");
        }
        let config = Config::from_env();
        assert_eq!(config.match_timeout, Duration::from_secs(90));
        clear_vars();
    }
}
