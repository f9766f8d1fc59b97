#![expect(
    clippy::module_name_repetitions,
    reason = "Configuration types intentionally mirror the module name for clarity"
)]

use std::fmt;
use std::str::FromStr;
use std::time::Duration;

use backoff::{ExponentialBackoff, ExponentialBackoffBuilder};
use url::Url;

use crate::error::Error;
use crate::Result;

const DEFAULT_HEARTBEAT_INTERVAL_DURATION: Duration = Duration::from_secs(15);
const DEFAULT_HEARTBEAT_TIMEOUT_DURATION: Duration = Duration::from_secs(45);
const DEFAULT_INITIAL_BACKOFF_DURATION: Duration = Duration::from_secs(1);
const DEFAULT_MAX_BACKOFF_DURATION: Duration = Duration::from_secs(60);
const DEFAULT_BACKOFF_MULTIPLIER: f64 = 2.0;
const DEFAULT_SUSPEND_AFTER: u32 = 5;
const DEFAULT_SUSPENDED_RETRY_DURATION: Duration = Duration::from_secs(30);

/// Default capacity of each channel's subscriber delivery ring.
const DEFAULT_QUEUE_CAPACITY: usize = 1024;

/// Resume position of a previous logical connection: the server-issued
/// connection key plus the serial of the last frame delivered to us.
///
/// Presenting this on connect lets the server resume delivery exactly
/// where it left off, without loss or duplication.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RecoveryKey {
    pub connection_key: String,
    pub connection_serial: i64,
}

impl fmt::Display for RecoveryKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.connection_key, self.connection_serial)
    }
}

impl FromStr for RecoveryKey {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        let (key, serial) = s
            .rsplit_once(':')
            .ok_or_else(|| Error::state(format!("malformed recovery key: {s:?}")))?;
        if key.is_empty() {
            return Err(Error::state(format!("malformed recovery key: {s:?}")));
        }
        let connection_serial = serial
            .parse()
            .map_err(|_| Error::state(format!("malformed recovery key serial: {serial:?}")))?;
        Ok(Self {
            connection_key: key.to_owned(),
            connection_serial,
        })
    }
}

/// Client construction options.
#[non_exhaustive]
#[derive(Debug, Clone)]
pub struct ClientOptions {
    /// Realtime endpoint, e.g. `wss://realtime.example.com`
    pub endpoint: Url,
    /// Capability scope requested from the token provider
    pub capability: String,
    /// Optional client identity stamped on published messages
    pub client_id: Option<String>,
    /// Suppress delivery of this client's own publishes to its subscribers
    pub no_echo: bool,
    /// Resume position of a previous connection, if recovering
    pub recover: Option<RecoveryKey>,
    /// Interval between outbound heartbeat frames
    pub heartbeat_interval: Duration,
    /// Maximum inbound silence before the session is considered dead
    pub heartbeat_timeout: Duration,
    /// Capacity of each subscriber's bounded delivery queue
    pub queue_capacity: usize,
    /// Reconnection strategy configuration
    pub reconnect: ReconnectConfig,
}

impl ClientOptions {
    /// Create options for the given realtime endpoint URL.
    pub fn new(endpoint: &str) -> Result<Self> {
        Ok(Self {
            endpoint: Url::parse(endpoint)?,
            capability: "*".to_owned(),
            client_id: None,
            no_echo: false,
            recover: None,
            heartbeat_interval: DEFAULT_HEARTBEAT_INTERVAL_DURATION,
            heartbeat_timeout: DEFAULT_HEARTBEAT_TIMEOUT_DURATION,
            queue_capacity: DEFAULT_QUEUE_CAPACITY,
            reconnect: ReconnectConfig::default(),
        })
    }

    #[must_use]
    pub fn no_echo(mut self, no_echo: bool) -> Self {
        self.no_echo = no_echo;
        self
    }

    #[must_use]
    pub fn client_id(mut self, client_id: impl Into<String>) -> Self {
        self.client_id = Some(client_id.into());
        self
    }

    #[must_use]
    pub fn recover(mut self, key: RecoveryKey) -> Self {
        self.recover = Some(key);
        self
    }
}

/// Configuration for automatic reconnection behavior.
///
/// The schedule is policy, not protocol: retries back off exponentially
/// from `initial_backoff` up to `max_backoff`; after `suspend_after`
/// consecutive failures the connection is Suspended and keeps retrying at
/// the slower fixed `suspended_retry_interval`.
#[non_exhaustive]
#[derive(Debug, Clone)]
pub struct ReconnectConfig {
    /// Initial backoff duration for the first reconnection attempt
    pub initial_backoff: Duration,
    /// Maximum backoff duration
    pub max_backoff: Duration,
    /// Multiplier for exponential backoff
    pub backoff_multiplier: f64,
    /// Consecutive failed attempts before transitioning to Suspended
    pub suspend_after: u32,
    /// Fixed retry cadence while Suspended
    pub suspended_retry_interval: Duration,
}

impl Default for ReconnectConfig {
    fn default() -> Self {
        Self {
            initial_backoff: DEFAULT_INITIAL_BACKOFF_DURATION,
            max_backoff: DEFAULT_MAX_BACKOFF_DURATION,
            backoff_multiplier: DEFAULT_BACKOFF_MULTIPLIER,
            suspend_after: DEFAULT_SUSPEND_AFTER,
            suspended_retry_interval: DEFAULT_SUSPENDED_RETRY_DURATION,
        }
    }
}

impl From<ReconnectConfig> for ExponentialBackoff {
    fn from(config: ReconnectConfig) -> Self {
        ExponentialBackoffBuilder::default()
            .with_initial_interval(config.initial_backoff)
            .with_max_interval(config.max_backoff)
            .with_multiplier(config.backoff_multiplier)
            .with_max_elapsed_time(None) // The suspend threshold is handled separately
            .build()
    }
}

#[cfg(test)]
mod tests {
    use backoff::backoff::Backoff as _;

    use super::*;

    #[test]
    fn backoff_sequence() {
        let config = ReconnectConfig::default();
        let mut backoff: ExponentialBackoff = config.into();

        // First backoff should be around initial_backoff (with some jitter)
        let first = backoff.next_backoff().unwrap();
        assert!(first >= Duration::from_millis(500) && first <= Duration::from_millis(1500));
    }

    #[test]
    fn backoff_respects_max() {
        let config = ReconnectConfig {
            initial_backoff: Duration::from_secs(1),
            max_backoff: Duration::from_secs(2),
            backoff_multiplier: 3.0,
            ..ReconnectConfig::default()
        };
        let mut backoff: ExponentialBackoff = config.into();

        for _ in 0..10 {
            let _next = backoff.next_backoff();
        }

        let duration = backoff.next_backoff().unwrap();
        assert!(duration <= Duration::from_secs(3));
    }

    #[test]
    fn recovery_key_roundtrip() {
        let key = RecoveryKey {
            connection_key: "conn-key".to_owned(),
            connection_serial: 42,
        };
        let parsed: RecoveryKey = key.to_string().parse().unwrap();
        assert_eq!(parsed, key);
    }

    #[test]
    fn recovery_key_rejects_garbage() {
        assert!("no-separator".parse::<RecoveryKey>().is_err());
        assert!(":5".parse::<RecoveryKey>().is_err());
        assert!("key:not-a-number".parse::<RecoveryKey>().is_err());
    }

    #[test]
    fn options_parse_endpoint() {
        let opts = ClientOptions::new("wss://realtime.example.com").unwrap();
        assert_eq!(opts.endpoint.scheme(), "wss");
        assert!(!opts.no_echo);
        assert!(ClientOptions::new("not a url").is_err());
    }
}
