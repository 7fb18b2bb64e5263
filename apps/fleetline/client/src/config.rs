use std::env;
use std::time::Duration;

/// Timing knobs for the tracking runtime. Defaults match the production
/// cadence; tests shrink them to keep suites fast.
#[derive(Debug, Clone)]
pub struct TrackingConfig {
    /// Delay between publish cycles.
    pub cycle_interval: Duration,
    /// Per-attempt geolocation timeout.
    pub acquire_timeout: Duration,
    /// Total acquisition attempts per cycle (initial try included).
    pub retry_budget: u32,
    /// Delay between acquisition attempts within a cycle.
    pub retry_delay: Duration,
    /// Budget for the best-effort reverse geocode of a fix.
    pub geocode_timeout: Duration,
    /// Delay before the connection manager retries a failed transport.
    pub reconnect_delay: Duration,
    /// Silence on a driver topic after which the feed is flagged stale.
    pub stale_timeout: Duration,
}

impl TrackingConfig {
    /// Load configuration from environment variables, falling back to the
    /// defaults for anything unset or unparseable.
    pub fn from_env() -> Self {
        let defaults = Self::default();
        Self {
            cycle_interval: env_ms("FLEETLINE_CYCLE_INTERVAL_MS", defaults.cycle_interval),
            acquire_timeout: env_ms("FLEETLINE_ACQUIRE_TIMEOUT_MS", defaults.acquire_timeout),
            retry_budget: env::var("FLEETLINE_RETRY_BUDGET")
                .ok()
                .and_then(|v| v.parse().ok())
                .unwrap_or(defaults.retry_budget),
            retry_delay: env_ms("FLEETLINE_RETRY_DELAY_MS", defaults.retry_delay),
            geocode_timeout: env_ms("FLEETLINE_GEOCODE_TIMEOUT_MS", defaults.geocode_timeout),
            reconnect_delay: env_ms("FLEETLINE_RECONNECT_DELAY_MS", defaults.reconnect_delay),
            stale_timeout: env_ms("FLEETLINE_STALE_TIMEOUT_MS", defaults.stale_timeout),
        }
    }
}

impl Default for TrackingConfig {
    fn default() -> Self {
        Self {
            cycle_interval: Duration::from_millis(5000),
            acquire_timeout: Duration::from_millis(15000),
            retry_budget: 3,
            retry_delay: Duration::from_millis(1000),
            geocode_timeout: Duration::from_millis(5000),
            reconnect_delay: Duration::from_millis(5000),
            stale_timeout: Duration::from_millis(15000),
        }
    }
}

fn env_ms(var: &str, fallback: Duration) -> Duration {
    env::var(var)
        .ok()
        .and_then(|v| v.parse::<u64>().ok())
        .map(Duration::from_millis)
        .unwrap_or(fallback)
}
