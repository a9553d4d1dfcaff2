//! Client configuration.

use std::collections::HashMap;
use std::time::Duration;

pub(crate) const DEFAULT_REALTIME_HOST: &str = "realtime.ably.io";

/// Timeouts and retry policy. All fields have production defaults.
#[derive(Debug, Clone)]
pub struct TimingConfig {
    /// Time allowed for the transport to open and deliver CONNECTED.
    pub connect_timeout: Duration,
    /// Time allowed for the server to answer ATTACH or DETACH.
    pub realtime_request_timeout: Duration,
    /// Base delay before reconnecting from DISCONNECTED (scaled by backoff).
    pub disconnected_retry_timeout: Duration,
    /// Delay between reconnect attempts while SUSPENDED.
    pub suspended_retry_timeout: Duration,
    /// Delay before a SUSPENDED channel re-attaches.
    pub channel_retry_timeout: Duration,
    /// Added to the server's max idle interval before declaring the link dead.
    pub heartbeat_margin: Duration,
    /// Used until CONNECTED supplies `maxIdleInterval`.
    pub default_max_idle_interval: Duration,
    /// Used until CONNECTED supplies `connectionStateTtl`.
    pub default_connection_state_ttl: Duration,
    /// Consecutive failed attempts after which DISCONNECTED escalates to SUSPENDED.
    pub max_disconnected_attempts: u32,
}

impl Default for TimingConfig {
    fn default() -> Self {
        Self {
            connect_timeout: Duration::from_secs(30),
            realtime_request_timeout: Duration::from_secs(10),
            disconnected_retry_timeout: Duration::from_secs(15),
            suspended_retry_timeout: Duration::from_secs(30),
            channel_retry_timeout: Duration::from_secs(15),
            heartbeat_margin: Duration::from_secs(10),
            default_max_idle_interval: Duration::from_secs(15),
            default_connection_state_ttl: Duration::from_secs(120),
            max_disconnected_attempts: 40,
        }
    }
}

/// Configuration for [`Realtime::new`](crate::Realtime::new).
#[derive(Debug, Clone)]
pub struct ClientOptions {
    /// API key (`keyName:keySecret`), passed through to the transport.
    pub key: Option<String>,
    /// Pre-issued token, used instead of `key` when set.
    pub token: Option<String>,
    /// Identity used by [`enter`](crate::RealtimePresence::enter) and friends.
    pub client_id: Option<String>,
    /// Ably realtime host. Defaults to `"realtime.ably.io"`.
    pub host: Option<String>,
    /// Use `wss://`. Disable for local test servers.
    pub tls: bool,
    /// Connect as soon as the client is created.
    pub auto_connect: bool,
    /// Queue presence operations while the connection is not CONNECTED.
    pub queue_messages: bool,
    /// Ask the server to echo this connection's own messages.
    pub echo_messages: bool,
    /// Seeds the backoff jitter generator; `None` seeds from OS entropy.
    pub rng_seed: Option<u64>,
    /// Extra query parameters for the transport URL.
    pub transport_params: HashMap<String, String>,
    pub timing: TimingConfig,
}

impl Default for ClientOptions {
    fn default() -> Self {
        Self {
            key: None,
            token: None,
            client_id: None,
            host: None,
            tls: true,
            auto_connect: true,
            queue_messages: true,
            echo_messages: true,
            rng_seed: None,
            transport_params: HashMap::new(),
            timing: TimingConfig::default(),
        }
    }
}

impl ClientOptions {
    /// Options authenticating with an API key.
    pub fn new(key: impl Into<String>) -> Self {
        Self {
            key: Some(key.into()),
            ..Default::default()
        }
    }

    pub fn realtime_host(&self) -> &str {
        self.host.as_deref().unwrap_or(DEFAULT_REALTIME_HOST)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults() {
        let opts = ClientOptions::new("xVLyHw.mDYnFA:secret");
        assert_eq!(opts.key.as_deref(), Some("xVLyHw.mDYnFA:secret"));
        assert!(opts.auto_connect);
        assert!(opts.queue_messages);
        assert!(opts.tls);
        assert_eq!(opts.realtime_host(), "realtime.ably.io");
        assert_eq!(opts.timing.disconnected_retry_timeout, Duration::from_secs(15));
        assert_eq!(opts.timing.max_disconnected_attempts, 40);
    }

    #[test]
    fn custom_host() {
        let opts = ClientOptions {
            host: Some("127.0.0.1:9000".to_string()),
            ..Default::default()
        };
        assert_eq!(opts.realtime_host(), "127.0.0.1:9000");
    }
}
