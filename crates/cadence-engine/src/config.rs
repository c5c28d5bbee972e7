use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EngineConfig {
    pub data_dir: String,
    #[serde(default)]
    pub recurrence: RecurrenceConfig,
    #[serde(default)]
    pub calendar: CalendarConfig,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            data_dir: "./data".into(),
            recurrence: RecurrenceConfig::default(),
            calendar: CalendarConfig::default(),
        }
    }
}

impl EngineConfig {
    /// Create from environment variables.
    pub fn from_env() -> Self {
        Self {
            data_dir: std::env::var("CADENCE_DATA_DIR").unwrap_or_else(|_| "./data".into()),
            recurrence: RecurrenceConfig::from_env(),
            calendar: CalendarConfig::from_env(),
        }
    }
}

/// Configuration for recurring-instance generation.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RecurrenceConfig {
    /// Whether the rollforward sweep runs at all.
    pub enabled: bool,
    /// How far ahead of "now" an occurrence may be materialized, in days.
    pub lookahead_days: i64,
    /// Catch-up bound: instances spawned per template per sweep.
    pub max_instances_per_tick: usize,
    /// Interval between scheduler ticks in seconds.
    pub tick_interval_secs: u64,
    /// Templates fetched per storage page during a sweep.
    pub page_size: usize,
}

impl Default for RecurrenceConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            lookahead_days: 1,
            max_instances_per_tick: 4,
            tick_interval_secs: 3600,
            page_size: 200,
        }
    }
}

impl RecurrenceConfig {
    pub fn from_env() -> Self {
        let defaults = Self::default();
        Self {
            enabled: env_bool("CADENCE_RECURRENCE_ENABLED", defaults.enabled),
            lookahead_days: env_parse("CADENCE_RECURRENCE_LOOKAHEAD_DAYS", defaults.lookahead_days),
            max_instances_per_tick: env_parse(
                "CADENCE_RECURRENCE_MAX_INSTANCES_PER_TICK",
                defaults.max_instances_per_tick,
            ),
            tick_interval_secs: env_parse(
                "CADENCE_RECURRENCE_TICK_INTERVAL_SECS",
                defaults.tick_interval_secs,
            ),
            page_size: env_parse("CADENCE_RECURRENCE_PAGE_SIZE", defaults.page_size),
        }
    }
}

/// Configuration for the calendar feed.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CalendarConfig {
    /// Host component of VEVENT UIDs.
    pub host: String,
    /// Bearer token for the read-only feed endpoint. Feed is disabled when
    /// unset.
    pub feed_token: Option<String>,
}

impl Default for CalendarConfig {
    fn default() -> Self {
        Self {
            host: "cadence.local".into(),
            feed_token: None,
        }
    }
}

impl CalendarConfig {
    pub fn from_env() -> Self {
        let defaults = Self::default();
        Self {
            host: std::env::var("CADENCE_CALENDAR_HOST").unwrap_or(defaults.host),
            feed_token: std::env::var("CADENCE_CALENDAR_FEED_TOKEN").ok(),
        }
    }
}

fn env_bool(key: &str, default: bool) -> bool {
    std::env::var(key)
        .map(|v| v.eq_ignore_ascii_case("true") || v == "1")
        .unwrap_or(default)
}

fn env_parse<T: std::str::FromStr>(key: &str, default: T) -> T {
    std::env::var(key)
        .ok()
        .and_then(|s| s.parse().ok())
        .unwrap_or(default)
}
