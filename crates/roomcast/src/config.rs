//! Server-level settings. Room behaviour lives in `RoomConfig`; this only
//! covers the listener and connection timeouts.

use std::time::Duration;

/// Environment variable holding the listen address.
pub const BIND_ENV: &str = "ROOMCAST_BIND";
/// Environment variable holding the idle timeout, in seconds.
pub const IDLE_TIMEOUT_ENV: &str = "ROOM_IDLE_TIMEOUT_SEC";

#[derive(Debug, Clone, PartialEq)]
pub struct ServerConfig {
    pub bind_addr: String,
    /// How long the room may sit with no connected client before the
    /// server shuts it down.
    pub idle_timeout: Duration,
    /// Time a new connection has to send its `JOIN`.
    pub handshake_timeout: Duration,
    /// A connection that sends nothing for this long is dropped. Clients
    /// answer server pings, so a healthy one is never silent this long.
    pub receive_timeout: Duration,
    /// Largest accepted client frame, in bytes.
    pub max_frame: usize,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            bind_addr: "127.0.0.1:8080".to_string(),
            idle_timeout: Duration::from_secs(30 * 60),
            handshake_timeout: Duration::from_secs(5),
            receive_timeout: Duration::from_secs(30),
            max_frame: 64 * 1024,
        }
    }
}

impl ServerConfig {
    /// Defaults overridden by `ROOMCAST_BIND` and `ROOM_IDLE_TIMEOUT_SEC`.
    ///
    /// An unparsable idle timeout is logged and ignored.
    pub fn from_env() -> Self {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Self {
        let mut config = Self::default();
        if let Some(addr) = lookup(BIND_ENV).filter(|a| !a.trim().is_empty()) {
            config.bind_addr = addr.trim().to_string();
        }
        if let Some(raw) = lookup(IDLE_TIMEOUT_ENV) {
            match raw.trim().parse::<u64>() {
                Ok(secs) => config.idle_timeout = Duration::from_secs(secs),
                Err(e) => tracing::warn!(value = %raw, error = %e, "ignoring invalid {IDLE_TIMEOUT_ENV}"),
            }
        }
        config
    }

    pub fn bind(mut self, addr: impl Into<String>) -> Self {
        self.bind_addr = addr.into();
        self
    }

    pub fn idle_timeout(mut self, timeout: Duration) -> Self {
        self.idle_timeout = timeout;
        self
    }

    pub fn handshake_timeout(mut self, timeout: Duration) -> Self {
        self.handshake_timeout = timeout;
        self
    }

    pub fn receive_timeout(mut self, timeout: Duration) -> Self {
        self.receive_timeout = timeout;
        self
    }

    pub fn max_frame(mut self, bytes: usize) -> Self {
        self.max_frame = bytes;
        self
    }
}

#[cfg(test)]
mod tests {
    use std::collections::HashMap;

    use super::*;

    fn lookup(vars: &[(&str, &str)]) -> impl Fn(&str) -> Option<String> {
        let vars: HashMap<String, String> = vars.iter().map(|(k, v)| (k.to_string(), v.to_string())).collect();
        move |key| vars.get(key).cloned()
    }

    #[test]
    fn test_from_lookup_defaults() {
        let config = ServerConfig::from_lookup(lookup(&[]));
        assert_eq!(config, ServerConfig::default());
        assert_eq!(config.idle_timeout, Duration::from_secs(1800));
    }

    #[test]
    fn test_from_lookup_reads_both_variables() {
        let config = ServerConfig::from_lookup(lookup(&[(BIND_ENV, "0.0.0.0:9000"), (IDLE_TIMEOUT_ENV, "60")]));
        assert_eq!(config.bind_addr, "0.0.0.0:9000");
        assert_eq!(config.idle_timeout, Duration::from_secs(60));
    }

    #[test]
    fn test_from_lookup_invalid_idle_timeout_keeps_default() {
        let config = ServerConfig::from_lookup(lookup(&[(IDLE_TIMEOUT_ENV, "soon"), (BIND_ENV, "  ")]));
        assert_eq!(config.idle_timeout, Duration::from_secs(1800));
        assert_eq!(config.bind_addr, "127.0.0.1:8080");
    }

    #[test]
    fn test_builder_methods_override() {
        let config = ServerConfig::default()
            .bind("127.0.0.1:0")
            .receive_timeout(Duration::from_secs(2))
            .handshake_timeout(Duration::from_millis(500));
        assert_eq!(config.bind_addr, "127.0.0.1:0");
        assert_eq!(config.receive_timeout, Duration::from_secs(2));
        assert_eq!(config.handshake_timeout, Duration::from_millis(500));
    }
}
