use std::str::FromStr;
use std::time::Duration;

use gridlens_core::trend::EfficiencyConfig;

use crate::api::DEFAULT_TIME_RANGE;
use crate::cache::TtlPolicy;
use crate::coalescer::CoalesceConfig;
use crate::poller::DEFAULT_POLL_INTERVAL;
use crate::reconnect::RetryPolicy;

/// Telemetry hub configuration.
///
/// All fields have defaults suitable for local development. Override per
/// hub in code, or via environment variables with [`TelemetryConfig::from_env`].
#[derive(Debug, Clone)]
pub struct TelemetryConfig {
    /// WebSocket push endpoint.
    pub ws_url: String,
    /// Base URL of the REST refetch endpoints.
    pub api_url: String,
    pub ttl: TtlPolicy,
    pub coalesce: CoalesceConfig,
    pub retry: RetryPolicy,
    /// Period of the stale-entry sweep.
    pub poll_interval: Duration,
    /// `timeRange` sent with refetch requests.
    pub time_range: String,
    pub efficiency: EfficiencyConfig,
}

const DEFAULT_WS_URL: &str = "ws://localhost:3000/ws/telemetry";
const DEFAULT_API_URL: &str = "http://localhost:3000/api";

impl Default for TelemetryConfig {
    fn default() -> Self {
        Self {
            ws_url: DEFAULT_WS_URL.into(),
            api_url: DEFAULT_API_URL.into(),
            ttl: TtlPolicy::default(),
            coalesce: CoalesceConfig::default(),
            retry: RetryPolicy::default(),
            poll_interval: DEFAULT_POLL_INTERVAL,
            time_range: DEFAULT_TIME_RANGE.into(),
            efficiency: EfficiencyConfig::default(),
        }
    }
}

impl TelemetryConfig {
    /// Load configuration from environment variables with defaults.
    ///
    /// | Env Var                        | Default                            |
    /// |--------------------------------|------------------------------------|
    /// | `TELEMETRY_WS_URL`             | `ws://localhost:3000/ws/telemetry` |
    /// | `TELEMETRY_API_URL`            | `http://localhost:3000/api`        |
    /// | `TELEMETRY_TTL_GPU_MS`         | `30000`                            |
    /// | `TELEMETRY_TTL_CARBON_MS`      | `60000`                            |
    /// | `TELEMETRY_TTL_SYSTEM_MS`      | `30000`                            |
    /// | `TELEMETRY_COALESCE_WINDOW_MS` | `250` (clamped to 100..=1000)      |
    /// | `TELEMETRY_COALESCE_MAX_WAIT_MS` | four windows                     |
    /// | `TELEMETRY_RETRY_BASE_MS`      | `1000`                             |
    /// | `TELEMETRY_RETRY_MAX_MS`       | `30000`                            |
    /// | `TELEMETRY_RETRY_MULTIPLIER`   | `2.0` (at least 1.0)               |
    /// | `TELEMETRY_RETRY_MAX_ATTEMPTS` | `5`                                |
    /// | `TELEMETRY_POLL_INTERVAL_SECS` | `10`                               |
    /// | `TELEMETRY_TIME_RANGE`         | `1h`                               |
    /// | `EFFICIENCY_TARGET_DAILY_KG`   | `1000`                             |
    /// | `EFFICIENCY_MAX_PUE`           | `2.0`                              |
    /// | `EFFICIENCY_MAX_WUE`           | `2.0`                              |
    ///
    /// Values that fail to parse are logged and replaced by the default.
    pub fn from_env() -> Self {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Same as [`from_env`](Self::from_env) over an arbitrary key lookup.
    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Self {
        let defaults = Self::default();
        let env = Env { lookup: &lookup };

        let ttl = TtlPolicy {
            gpu: env.millis("TELEMETRY_TTL_GPU_MS", defaults.ttl.gpu),
            carbon: env.millis("TELEMETRY_TTL_CARBON_MS", defaults.ttl.carbon),
            system: env.millis("TELEMETRY_TTL_SYSTEM_MS", defaults.ttl.system),
        };

        let mut coalesce = CoalesceConfig::new(
            env.millis("TELEMETRY_COALESCE_WINDOW_MS", defaults.coalesce.window),
        );
        if let Some(max_wait) = env.optional_millis("TELEMETRY_COALESCE_MAX_WAIT_MS") {
            coalesce = coalesce.with_max_wait(max_wait);
        }

        let base_delay = env.millis("TELEMETRY_RETRY_BASE_MS", defaults.retry.base_delay);
        let mut max_delay = env.millis("TELEMETRY_RETRY_MAX_MS", defaults.retry.max_delay);
        if max_delay < base_delay {
            tracing::warn!(
                base_ms = base_delay.as_millis() as u64,
                max_ms = max_delay.as_millis() as u64,
                "TELEMETRY_RETRY_MAX_MS below TELEMETRY_RETRY_BASE_MS; using base",
            );
            max_delay = base_delay;
        }
        let retry = RetryPolicy {
            base_delay,
            max_delay,
            multiplier: env
                .parsed("TELEMETRY_RETRY_MULTIPLIER", defaults.retry.multiplier)
                .max(1.0),
            max_attempts: env
                .parsed("TELEMETRY_RETRY_MAX_ATTEMPTS", defaults.retry.max_attempts)
                .max(1),
        };

        let efficiency = EfficiencyConfig {
            target_daily_rate_kg: env.positive(
                "EFFICIENCY_TARGET_DAILY_KG",
                defaults.efficiency.target_daily_rate_kg,
            ),
            max_pue: env.positive("EFFICIENCY_MAX_PUE", defaults.efficiency.max_pue),
            max_wue: env.positive("EFFICIENCY_MAX_WUE", defaults.efficiency.max_wue),
        };

        let poll_interval = Duration::from_secs(
            env.parsed("TELEMETRY_POLL_INTERVAL_SECS", defaults.poll_interval.as_secs())
                .max(1),
        );

        Self {
            ws_url: env.string("TELEMETRY_WS_URL", defaults.ws_url),
            api_url: env.string("TELEMETRY_API_URL", defaults.api_url),
            ttl,
            coalesce,
            retry,
            poll_interval,
            time_range: env.string("TELEMETRY_TIME_RANGE", defaults.time_range),
            efficiency,
        }
    }
}

struct Env<'a, F: Fn(&str) -> Option<String>> {
    lookup: &'a F,
}

impl<F: Fn(&str) -> Option<String>> Env<'_, F> {
    fn string(&self, key: &str, default: String) -> String {
        match (self.lookup)(key) {
            Some(value) if !value.trim().is_empty() => value.trim().to_string(),
            _ => default,
        }
    }

    fn parsed<T: FromStr + Copy + std::fmt::Display>(&self, key: &str, default: T) -> T {
        let Some(raw) = (self.lookup)(key) else {
            return default;
        };
        match raw.trim().parse() {
            Ok(value) => value,
            Err(_) => {
                tracing::warn!(key, value = %raw, %default, "Invalid value; using default");
                default
            }
        }
    }

    fn millis(&self, key: &str, default: Duration) -> Duration {
        Duration::from_millis(self.parsed(key, default.as_millis() as u64))
    }

    fn optional_millis(&self, key: &str) -> Option<Duration> {
        let raw = (self.lookup)(key)?;
        match raw.trim().parse::<u64>() {
            Ok(ms) => Some(Duration::from_millis(ms)),
            Err(_) => {
                tracing::warn!(key, value = %raw, "Invalid value; ignoring");
                None
            }
        }
    }

    /// A finite value above zero, or `default`.
    fn positive(&self, key: &str, default: f64) -> f64 {
        let value = self.parsed(key, default);
        if value.is_finite() && value > 0.0 {
            value
        } else {
            tracing::warn!(key, %value, %default, "Value must be positive; using default");
            default
        }
    }
}
