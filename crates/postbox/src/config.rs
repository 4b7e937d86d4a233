//! Controller configuration.

use std::time::Duration;

use crate::IpcError;

/// Lifetime of an unread message before its sender reclaims it.
pub const RECEIVE_DATA_TIMEOUT: Duration = Duration::from_millis(5_000);

/// Longest wait for a mailbox mutex.
pub const MUTEX_WAIT: Duration = Duration::from_millis(100);

/// Default bound on the serialized mailbox state (1 MiB).
pub const DEFAULT_MAILBOX_CAPACITY: usize = 1 << 20;

/// Environment variables read by [`ControllerConfig::from_env`].
pub const ENV_RECEIVE_TIMEOUT_MS: &str = "POSTBOX_RECEIVE_TIMEOUT_MS";
pub const ENV_MUTEX_WAIT_MS: &str = "POSTBOX_MUTEX_WAIT_MS";
pub const ENV_MAILBOX_CAPACITY: &str = "POSTBOX_MAILBOX_CAPACITY";
pub const ENV_REPORT_LOCK_TIMEOUTS: &str = "POSTBOX_REPORT_LOCK_TIMEOUTS";

/// Configuration for a controller.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ControllerConfig {
    /// Age after which a sender reclaims its unread messages.
    pub receive_data_timeout: Duration,
    /// Bounded wait for any mailbox mutex.
    pub mutex_wait: Duration,
    /// Bound on the serialized size of the local mailbox state.
    pub mailbox_capacity: usize,
    /// Report lock timeouts during `receive` to the error callback.
    pub report_lock_timeouts: bool,
}

impl Default for ControllerConfig {
    fn default() -> Self {
        Self {
            receive_data_timeout: RECEIVE_DATA_TIMEOUT,
            mutex_wait: MUTEX_WAIT,
            mailbox_capacity: DEFAULT_MAILBOX_CAPACITY,
            report_lock_timeouts: false,
        }
    }
}

impl ControllerConfig {
    pub fn with_receive_data_timeout(mut self, timeout: Duration) -> Self {
        self.receive_data_timeout = timeout;
        self
    }

    pub fn with_mutex_wait(mut self, wait: Duration) -> Self {
        self.mutex_wait = wait;
        self
    }

    pub fn with_mailbox_capacity(mut self, capacity: usize) -> Self {
        self.mailbox_capacity = capacity;
        self
    }

    pub fn with_report_lock_timeouts(mut self, report: bool) -> Self {
        self.report_lock_timeouts = report;
        self
    }

    /// Defaults overlaid with `POSTBOX_*` environment variables.
    pub fn from_env() -> Result<Self, IpcError> {
        Self::default().overlay(|key| std::env::var(key).ok())
    }

    /// Overlay values looked up by environment variable name.
    pub fn overlay(mut self, lookup: impl Fn(&str) -> Option<String>) -> Result<Self, IpcError> {
        if let Some(ms) = parse::<u64>(&lookup, ENV_RECEIVE_TIMEOUT_MS)? {
            self.receive_data_timeout = Duration::from_millis(ms);
        }
        if let Some(ms) = parse::<u64>(&lookup, ENV_MUTEX_WAIT_MS)? {
            self.mutex_wait = Duration::from_millis(ms);
        }
        if let Some(capacity) = parse::<usize>(&lookup, ENV_MAILBOX_CAPACITY)? {
            self.mailbox_capacity = capacity;
        }
        if let Some(raw) = lookup(ENV_REPORT_LOCK_TIMEOUTS) {
            self.report_lock_timeouts = match raw.trim().to_ascii_lowercase().as_str() {
                "1" | "true" | "yes" | "on" => true,
                "0" | "false" | "no" | "off" | "" => false,
                _ => {
                    return Err(IpcError::InvalidArgument(format!(
                        "{}: expected a boolean, got {:?}",
                        ENV_REPORT_LOCK_TIMEOUTS, raw
                    )));
                }
            };
        }
        self.validate()?;
        Ok(self)
    }

    /// Check that the values are usable.
    pub fn validate(&self) -> Result<(), IpcError> {
        if self.mailbox_capacity == 0 {
            return Err(IpcError::InvalidArgument(
                "mailbox capacity must be non-zero".into(),
            ));
        }
        if self.mailbox_capacity > u32::MAX as usize {
            return Err(IpcError::InvalidArgument(format!(
                "mailbox capacity {} exceeds {} bytes",
                self.mailbox_capacity,
                u32::MAX
            )));
        }
        Ok(())
    }

    pub(crate) fn receive_data_timeout_millis(&self) -> u64 {
        self.receive_data_timeout.as_millis() as u64
    }
}

fn parse<T: std::str::FromStr>(
    lookup: &impl Fn(&str) -> Option<String>,
    key: &str,
) -> Result<Option<T>, IpcError> {
    match lookup(key) {
        None => Ok(None),
        Some(raw) => raw.trim().parse().map(Some).map_err(|_| {
            IpcError::InvalidArgument(format!("{}: cannot parse {:?}", key, raw))
        }),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    fn env(pairs: &[(&str, &str)]) -> impl Fn(&str) -> Option<String> {
        let map: HashMap<String, String> = pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        move |key| map.get(key).cloned()
    }

    #[test]
    fn defaults_match_protocol_constants() {
        let config = ControllerConfig::default();
        assert_eq!(config.receive_data_timeout, Duration::from_millis(5000));
        assert_eq!(config.mutex_wait, Duration::from_millis(100));
        assert_eq!(config.mailbox_capacity, 1_048_576);
        assert!(!config.report_lock_timeouts);
    }

    #[test]
    fn overlay_reads_every_key() {
        let config = ControllerConfig::default()
            .overlay(env(&[
                (ENV_RECEIVE_TIMEOUT_MS, "250"),
                (ENV_MUTEX_WAIT_MS, " 20 "),
                (ENV_MAILBOX_CAPACITY, "4096"),
                (ENV_REPORT_LOCK_TIMEOUTS, "yes"),
            ]))
            .unwrap();
        assert_eq!(config.receive_data_timeout, Duration::from_millis(250));
        assert_eq!(config.mutex_wait, Duration::from_millis(20));
        assert_eq!(config.mailbox_capacity, 4096);
        assert!(config.report_lock_timeouts);
    }

    #[test]
    fn overlay_rejects_garbage() {
        assert!(
            ControllerConfig::default()
                .overlay(env(&[(ENV_MUTEX_WAIT_MS, "soon")]))
                .is_err()
        );
        assert!(
            ControllerConfig::default()
                .overlay(env(&[(ENV_REPORT_LOCK_TIMEOUTS, "maybe")]))
                .is_err()
        );
        assert!(
            ControllerConfig::default()
                .overlay(env(&[(ENV_MAILBOX_CAPACITY, "0")]))
                .is_err()
        );
    }
}
