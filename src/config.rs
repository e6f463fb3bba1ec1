//! Socket and keepalive configuration parsed from environment variables.

use std::time::Duration;

use protocol::Codec;

pub const DEFAULT_HEARTBEAT_INTERVAL_MS: u64 = 20_000;
pub const MIN_HEARTBEAT_INTERVAL_MS: u64 = 10;
pub const DEFAULT_SEND_BUFFER_LIMIT: usize = 100;
pub const DEFAULT_RECONNECT_MIN_MS: u64 = 500;
pub const FLOOR_RECONNECT_MIN_MS: u64 = 100;
pub const DEFAULT_RECONNECT_MAX_MS: u64 = 5_000;

/// Per-socket settings.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SockConfig {
    /// Codec used for outbound frames.
    pub codec: Codec,
    /// Interval between outbound heartbeats. Zero disables them.
    pub heartbeat_interval: Duration,
    /// Frame pairs buffered while no transport is open. Zero disables
    /// buffering.
    pub send_buffer_limit: usize,
    /// Log handler faults and undecodable payloads at `warn` instead of
    /// `debug`.
    pub development_mode: bool,
}

impl Default for SockConfig {
    fn default() -> Self {
        Self {
            codec: Codec::Binary,
            heartbeat_interval: Duration::from_millis(DEFAULT_HEARTBEAT_INTERVAL_MS),
            send_buffer_limit: DEFAULT_SEND_BUFFER_LIMIT,
            development_mode: false,
        }
    }
}

impl SockConfig {
    /// Build socket config from environment variables.
    ///
    /// Optional:
    /// - `GOTALK_PROTOCOL`: `binary` (default) or `text`
    /// - `GOTALK_HEARTBEAT_INTERVAL_MS`: default 20000, 0 disables
    /// - `GOTALK_SEND_BUFFER_LIMIT`: default 100, 0 disables buffering
    /// - `GOTALK_DEV`: `1`/`true` enables development-mode logging
    #[must_use]
    pub fn from_env() -> Self {
        let defaults = Self::default();
        let codec = std::env::var("GOTALK_PROTOCOL")
            .ok()
            .and_then(|raw| match raw.parse::<Codec>() {
                Ok(codec) => Some(codec),
                Err(e) => {
                    tracing::warn!(error = %e, "ignoring GOTALK_PROTOCOL");
                    None
                }
            })
            .unwrap_or(defaults.codec);

        Self {
            codec,
            heartbeat_interval: Duration::from_millis(env_parse(
                "GOTALK_HEARTBEAT_INTERVAL_MS",
                DEFAULT_HEARTBEAT_INTERVAL_MS,
            )),
            send_buffer_limit: env_parse("GOTALK_SEND_BUFFER_LIMIT", DEFAULT_SEND_BUFFER_LIMIT),
            development_mode: env_flag("GOTALK_DEV").unwrap_or(defaults.development_mode),
        }
    }
}

/// Reconnect back-off bounds for a keepalive controller.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct KeepaliveConfig {
    pub min_delay: Duration,
    pub max_delay: Duration,
}

impl Default for KeepaliveConfig {
    fn default() -> Self {
        Self::new(Duration::ZERO, Duration::ZERO)
    }
}

impl KeepaliveConfig {
    /// Normalize back-off bounds. A zero `min_delay` means the default,
    /// anything below 100ms is raised to 100ms. A zero `max_delay`, or one
    /// below `min_delay`, is replaced by the default maximum.
    #[must_use]
    pub fn new(min_delay: Duration, max_delay: Duration) -> Self {
        let floor = Duration::from_millis(FLOOR_RECONNECT_MIN_MS);
        let min_delay = if min_delay.is_zero() {
            Duration::from_millis(DEFAULT_RECONNECT_MIN_MS)
        } else {
            min_delay.max(floor)
        };
        let max_delay = if max_delay.is_zero() || max_delay < min_delay {
            Duration::from_millis(DEFAULT_RECONNECT_MAX_MS)
        } else {
            max_delay
        };
        Self { min_delay, max_delay }
    }

    /// Build keepalive config from environment variables.
    ///
    /// Optional:
    /// - `GOTALK_RECONNECT_MIN_MS`: default 500, floor 100
    /// - `GOTALK_RECONNECT_MAX_MS`: default 5000
    #[must_use]
    pub fn from_env() -> Self {
        Self::new(
            Duration::from_millis(env_parse("GOTALK_RECONNECT_MIN_MS", 0)),
            Duration::from_millis(env_parse("GOTALK_RECONNECT_MAX_MS", 0)),
        )
    }
}

pub(crate) fn env_parse<T>(key: &str, default: T) -> T
where
    T: std::str::FromStr + Copy,
{
    std::env::var(key)
        .ok()
        .and_then(|v| v.trim().parse::<T>().ok())
        .unwrap_or(default)
}

pub(crate) fn env_flag(key: &str) -> Option<bool> {
    let raw = std::env::var(key).ok()?;
    match raw.trim().to_ascii_lowercase().as_str() {
        "1" | "true" | "yes" | "on" => Some(true),
        "0" | "false" | "no" | "off" => Some(false),
        _ => None,
    }
}

#[cfg(test)]
#[path = "config_test.rs"]
mod tests;
