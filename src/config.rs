use std::{env, str::FromStr, time::Duration};

/// Tunables for an ingestion run. Every knob is read from the environment
/// with a conservative default.
#[derive(Debug, Clone)]
pub struct IngestConfig {
    pub classifier_enabled: bool,
    pub classifier_timeout: Duration,
    pub classifier_concurrency: usize,
    pub merge_concurrency: usize,
    pub merge_max_retries: u32,
    pub merge_backoff_base: Duration,
    pub max_feed_items: usize,
}

impl Default for IngestConfig {
    fn default() -> Self {
        Self {
            classifier_enabled: true,
            classifier_timeout: Duration::from_millis(8_000),
            classifier_concurrency: 4,
            merge_concurrency: 8,
            merge_max_retries: 3,
            merge_backoff_base: Duration::from_millis(100),
            max_feed_items: 5_000,
        }
    }
}

impl IngestConfig {
    pub fn from_env() -> Self {
        let defaults = Self::default();
        Self {
            classifier_enabled: env::var("CLASSIFIER_ENABLED")
                .map(|_| parse_env_bool("CLASSIFIER_ENABLED"))
                .unwrap_or(defaults.classifier_enabled),
            classifier_timeout: env_parse::<u64>("CLASSIFIER_TIMEOUT_MS")
                .filter(|v| *v > 0)
                .map(Duration::from_millis)
                .unwrap_or(defaults.classifier_timeout),
            classifier_concurrency: env_parse::<usize>("CLASSIFIER_CONCURRENCY")
                .filter(|v| *v > 0)
                .unwrap_or(defaults.classifier_concurrency),
            merge_concurrency: env_parse::<usize>("MERGE_CONCURRENCY")
                .filter(|v| *v > 0)
                .unwrap_or(defaults.merge_concurrency),
            merge_max_retries: env_parse::<u32>("MERGE_MAX_RETRIES")
                .unwrap_or(defaults.merge_max_retries),
            merge_backoff_base: env_parse::<u64>("MERGE_BACKOFF_BASE_MS")
                .map(Duration::from_millis)
                .unwrap_or(defaults.merge_backoff_base),
            max_feed_items: env_parse::<usize>("MAX_FEED_ITEMS")
                .filter(|v| *v > 0)
                .unwrap_or(defaults.max_feed_items),
        }
    }
}

pub fn env_parse<T: FromStr>(key: &str) -> Option<T> {
    env::var(key).ok().and_then(|v| v.trim().parse::<T>().ok())
}

pub fn parse_env_bool(key: &str) -> bool {
    match env::var(key) {
        Ok(value) => matches!(
            value.trim().to_lowercase().as_str(),
            "1" | "true" | "yes" | "on"
        ),
        Err(_) => false,
    }
}
