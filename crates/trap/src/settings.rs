//! Typed view of the endpoint options in a [`Configuration`]

use std::time::Duration;
use trap_core::{
    Configuration, COMPRESSION_ENABLED_DEFAULT, DEFAULT_CHUNK_SIZE, OPTION_CONCURRENT_CONNECTION_WINDOW,
    OPTION_ENABLE_COMPRESSION, OPTION_KEEPALIVE_EXPIRY, OPTION_KEEPALIVE_INTERVAL,
    OPTION_MAX_CHUNK_SIZE, OPTION_RECONNECT_TIMEOUT,
};
use trap_transport::DEFAULT_KEEPALIVE_EXPIRY;

/// How often a client retries transports it has given up on (milliseconds)
pub const OPTION_TRANSPORT_RECOVERY_TIMEOUT: &str = "trap.transport-recovery-timeout";

pub const DEFAULT_KEEPALIVE_INTERVAL: Duration = Duration::from_secs(30);
pub const DEFAULT_RECONNECT_TIMEOUT: Duration = Duration::from_secs(180);
pub const DEFAULT_CONNECTION_WINDOW: Duration = Duration::from_secs(30);
pub const DEFAULT_TRANSPORT_RECOVERY_TIMEOUT: Duration = Duration::from_secs(15 * 60);

/// Endpoint settings
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EndpointSettings {
    /// Keepalive check interval; `None` disables keepalives
    pub keepalive_interval: Option<Duration>,
    /// How long a keepalive probe may take
    pub keepalive_expiry: Duration,
    /// Whether payloads may be compressed
    pub compression: bool,
    /// How long a sleeping endpoint waits for a transport
    pub reconnect_timeout: Duration,
    /// Largest fragment a channel may emit, header included
    pub max_chunk_size: usize,
    /// Window in which concurrent transports of one client share a session
    pub connection_window: Duration,
    /// Interval of the client recovery heartbeat
    pub transport_recovery_timeout: Duration,
}

impl Default for EndpointSettings {
    fn default() -> Self {
        Self {
            keepalive_interval: Some(DEFAULT_KEEPALIVE_INTERVAL),
            keepalive_expiry: DEFAULT_KEEPALIVE_EXPIRY,
            compression: COMPRESSION_ENABLED_DEFAULT,
            reconnect_timeout: DEFAULT_RECONNECT_TIMEOUT,
            max_chunk_size: DEFAULT_CHUNK_SIZE,
            connection_window: DEFAULT_CONNECTION_WINDOW,
            transport_recovery_timeout: DEFAULT_TRANSPORT_RECOVERY_TIMEOUT,
        }
    }
}

fn millis(config: &Configuration, key: &str, current: Duration) -> Duration {
    let value = config.long_option(key, current.as_millis() as i64);
    if value > 0 {
        Duration::from_millis(value as u64)
    } else {
        current
    }
}

impl EndpointSettings {
    pub fn from_configuration(config: &Configuration) -> Self {
        let mut settings = Self::default();
        settings.apply(config);
        settings
    }

    /// Overwrite every setting `config` mentions; the rest stay as they are
    pub fn apply(&mut self, config: &Configuration) {
        if config.contains(OPTION_KEEPALIVE_INTERVAL) {
            let secs = config.long_option(
                OPTION_KEEPALIVE_INTERVAL,
                self.keepalive_interval.map_or(0, |d| d.as_secs() as i64),
            );
            self.keepalive_interval = (secs > 0).then(|| Duration::from_secs(secs as u64));
        }

        self.keepalive_expiry = millis(config, OPTION_KEEPALIVE_EXPIRY, self.keepalive_expiry);
        self.compression = config.bool_option(OPTION_ENABLE_COMPRESSION, self.compression);
        self.reconnect_timeout = millis(config, OPTION_RECONNECT_TIMEOUT, self.reconnect_timeout);
        self.connection_window = millis(
            config,
            OPTION_CONCURRENT_CONNECTION_WINDOW,
            self.connection_window,
        );
        self.transport_recovery_timeout = millis(
            config,
            OPTION_TRANSPORT_RECOVERY_TIMEOUT,
            self.transport_recovery_timeout,
        );

        if config.contains(OPTION_MAX_CHUNK_SIZE) {
            let size = config.int_option(OPTION_MAX_CHUNK_SIZE, self.max_chunk_size as i32);
            self.max_chunk_size = if size <= 0 {
                i32::MAX as usize
            } else {
                size as usize
            };
        }
    }
}
