//! Supervisor configuration.

use std::time::Duration;

use crate::bridge::codec::DEFAULT_MAX_FRAME_BYTES;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BridgeConfig {
    /// Connections idle longer than this are evicted by the sweep.
    pub stale_threshold: Duration,
    /// Must be non-zero; zero is replaced by the default.
    pub sweep_interval: Duration,
    /// Deadline applied to `invoke` when the caller passes none.
    pub call_timeout: Duration,
    /// Budget for establishing an event-stream subscription.
    pub connect_timeout: Duration,
    pub max_frame_bytes: usize,
    /// Delay between SIGTERM and SIGKILL when closing a stdio child.
    pub kill_grace: Duration,
    pub stderr_tail_lines: usize,
}

impl BridgeConfig {
    pub const DEFAULT_STALE_THRESHOLD: Duration = Duration::from_secs(10 * 60);
    pub const DEFAULT_SWEEP_INTERVAL: Duration = Duration::from_secs(60);
    pub const DEFAULT_CALL_TIMEOUT: Duration = Duration::from_secs(30);
    pub const DEFAULT_CONNECT_TIMEOUT: Duration = Duration::from_secs(30);
    pub const DEFAULT_KILL_GRACE: Duration = Duration::from_secs(2);
    pub const DEFAULT_STDERR_TAIL_LINES: usize = 64;

    /// Defaults with no environment overrides applied.
    pub fn builtin() -> Self {
        Self {
            stale_threshold: Self::DEFAULT_STALE_THRESHOLD,
            sweep_interval: Self::DEFAULT_SWEEP_INTERVAL,
            call_timeout: Self::DEFAULT_CALL_TIMEOUT,
            connect_timeout: Self::DEFAULT_CONNECT_TIMEOUT,
            max_frame_bytes: DEFAULT_MAX_FRAME_BYTES,
            kill_grace: Self::DEFAULT_KILL_GRACE,
            stderr_tail_lines: Self::DEFAULT_STDERR_TAIL_LINES,
        }
    }

    /// Builtin defaults with overrides read through `lookup`.
    ///
    /// Values that fail to parse are ignored with a warning.
    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Self {
        let secs = |name: &str, default: Duration| {
            parse_var::<u64>(&lookup, name)
                .map(Duration::from_secs)
                .unwrap_or(default)
        };

        let builtin = Self::builtin();
        Self {
            stale_threshold: secs("TOOLBRIDGE_STALE_THRESHOLD_SECS", builtin.stale_threshold),
            sweep_interval: nonzero_sweep_interval(
                secs("TOOLBRIDGE_SWEEP_INTERVAL_SECS", builtin.sweep_interval),
                builtin.sweep_interval,
            ),
            call_timeout: secs("TOOLBRIDGE_CALL_TIMEOUT_SECS", builtin.call_timeout),
            connect_timeout: secs("TOOLBRIDGE_CONNECT_TIMEOUT_SECS", builtin.connect_timeout),
            max_frame_bytes: parse_var(&lookup, "TOOLBRIDGE_MAX_FRAME_BYTES")
                .unwrap_or(builtin.max_frame_bytes),
            ..builtin
        }
    }

    pub fn with_stale_threshold(mut self, threshold: Duration) -> Self {
        self.stale_threshold = threshold;
        self
    }

    /// A zero interval is ignored with a warning.
    pub fn with_sweep_interval(mut self, interval: Duration) -> Self {
        self.sweep_interval = nonzero_sweep_interval(interval, self.sweep_interval);
        self
    }

    pub fn with_call_timeout(mut self, timeout: Duration) -> Self {
        self.call_timeout = timeout;
        self
    }

    pub fn with_connect_timeout(mut self, timeout: Duration) -> Self {
        self.connect_timeout = timeout;
        self
    }

    pub fn with_max_frame_bytes(mut self, max: usize) -> Self {
        self.max_frame_bytes = max;
        self
    }

    pub fn with_kill_grace(mut self, grace: Duration) -> Self {
        self.kill_grace = grace;
        self
    }

    pub fn with_stderr_tail_lines(mut self, lines: usize) -> Self {
        self.stderr_tail_lines = lines;
        self
    }
}

/// The sweep timer cannot tick at a zero period.
pub(crate) fn nonzero_sweep_interval(interval: Duration, fallback: Duration) -> Duration {
    if interval.is_zero() {
        tracing::warn!(fallback = ?fallback, "Ignoring zero sweep interval");
        fallback
    } else {
        interval
    }
}

fn parse_var<T: std::str::FromStr>(
    lookup: &impl Fn(&str) -> Option<String>,
    name: &str,
) -> Option<T> {
    let raw = lookup(name)?;
    match raw.trim().parse::<T>() {
        Ok(value) => Some(value),
        Err(_) => {
            tracing::warn!(var = name, value = %raw, "Ignoring unparseable config override");
            None
        }
    }
}

impl Default for BridgeConfig {
    fn default() -> Self {
        Self::from_lookup(|name| std::env::var(name).ok())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    fn lookup(vars: &[(&str, &str)]) -> impl Fn(&str) -> Option<String> {
        let vars: HashMap<String, String> = vars
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        move |name| vars.get(name).cloned()
    }

    #[test]
    fn builtin_defaults() {
        let config = BridgeConfig::from_lookup(lookup(&[]));

        assert_eq!(config, BridgeConfig::builtin());
        assert_eq!(config.stale_threshold, Duration::from_secs(600));
        assert_eq!(config.max_frame_bytes, 8 * 1024 * 1024);
    }

    #[test]
    fn env_overrides_apply() {
        let config = BridgeConfig::from_lookup(lookup(&[
            ("TOOLBRIDGE_STALE_THRESHOLD_SECS", "120"),
            ("TOOLBRIDGE_CALL_TIMEOUT_SECS", " 5 "),
            ("TOOLBRIDGE_MAX_FRAME_BYTES", "1024"),
        ]));

        assert_eq!(config.stale_threshold, Duration::from_secs(120));
        assert_eq!(config.call_timeout, Duration::from_secs(5));
        assert_eq!(config.max_frame_bytes, 1024);
        assert_eq!(config.sweep_interval, BridgeConfig::DEFAULT_SWEEP_INTERVAL);
    }

    #[test]
    fn unparseable_override_falls_back() {
        let config = BridgeConfig::from_lookup(lookup(&[
            ("TOOLBRIDGE_SWEEP_INTERVAL_SECS", "soon"),
            ("TOOLBRIDGE_CONNECT_TIMEOUT_SECS", "-1"),
        ]));

        assert_eq!(config.sweep_interval, BridgeConfig::DEFAULT_SWEEP_INTERVAL);
        assert_eq!(config.connect_timeout, BridgeConfig::DEFAULT_CONNECT_TIMEOUT);
    }

    #[test]
    fn builders_override_fields() {
        let config = BridgeConfig::builtin()
            .with_call_timeout(Duration::from_millis(250))
            .with_kill_grace(Duration::ZERO)
            .with_stderr_tail_lines(4);

        assert_eq!(config.call_timeout, Duration::from_millis(250));
        assert_eq!(config.kill_grace, Duration::ZERO);
        assert_eq!(config.stderr_tail_lines, 4);
    }

    #[test]
    fn zero_sweep_interval_is_ignored() {
        let from_env =
            BridgeConfig::from_lookup(lookup(&[("TOOLBRIDGE_SWEEP_INTERVAL_SECS", "0")]));
        let built = BridgeConfig::builtin()
            .with_sweep_interval(Duration::from_secs(5))
            .with_sweep_interval(Duration::ZERO);

        assert_eq!(from_env.sweep_interval, BridgeConfig::DEFAULT_SWEEP_INTERVAL);
        assert_eq!(built.sweep_interval, Duration::from_secs(5));
    }
}
