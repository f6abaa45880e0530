use serde::{Deserialize, Serialize};
use std::path::Path;
use std::time::Duration;

#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("Failed to read config file: {0}")]
    Io(#[from] std::io::Error),

    #[error("Invalid config file: {0}")]
    Parse(#[from] serde_json::Error),

    #[error("Invalid thresholds: {0}")]
    Thresholds(String),
}

/// Row-count boundaries between execution strategies
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct StrategyThresholds {
    /// Below this: MEMORY
    pub memory: u64,
    /// Below this: HYBRID
    pub hybrid: u64,
    /// Below this: STREAMING, otherwise DISTRIBUTED
    pub streaming: u64,
}

impl Default for StrategyThresholds {
    fn default() -> Self {
        Self {
            memory: 1_000,
            hybrid: 100_000,
            streaming: 1_000_000,
        }
    }
}

/// Engine configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct EngineConfig {
    /// Default result cache TTL
    pub cache_ttl_secs: u64,
    pub cache_max_entries: usize,
    pub cache_max_bytes: usize,
    /// Upper bound on the row-count estimate query
    pub estimate_timeout_ms: u64,
    /// Estimate used when the count query fails or times out
    pub fallback_estimate: u64,
    /// Cursor batch size for STREAMING
    pub stream_chunk_size: usize,
    /// Executions slower than this get an index suggestion
    pub slow_query_ms: u64,
    /// Default memory ceiling split into the strategy budget
    pub memory_ceiling_bytes: usize,
    /// Upper bound on DISTRIBUTED partitions (capped by CPU count)
    pub max_partitions: usize,
    /// Default per-query timeout; `0` disables it
    pub query_timeout_ms: u64,
    pub thresholds: StrategyThresholds,
    /// Field names never treated as relations, in addition to `_`-prefixed ones
    pub reserved_fields: Vec<String>,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            cache_ttl_secs: 300,
            cache_max_entries: 1_000,
            cache_max_bytes: 64 * 1024 * 1024,
            estimate_timeout_ms: 500,
            fallback_estimate: 50_000,
            stream_chunk_size: 1_000,
            slow_query_ms: 1_000,
            memory_ceiling_bytes: 512 * 1024 * 1024,
            max_partitions: num_cpus::get(),
            query_timeout_ms: 30_000,
            thresholds: StrategyThresholds::default(),
            reserved_fields: vec!["__v".to_string(), "_id".to_string()],
        }
    }
}

impl EngineConfig {
    /// Create a config from environment variables, falling back to defaults
    /// POLYQUERY_CACHE_TTL_SECS=300
    /// POLYQUERY_CACHE_MAX_ENTRIES=1000
    /// POLYQUERY_CACHE_MAX_MB=64
    /// POLYQUERY_ESTIMATE_TIMEOUT_MS=500
    /// POLYQUERY_FALLBACK_ESTIMATE=50000
    /// POLYQUERY_STREAM_CHUNK_SIZE=1000
    /// POLYQUERY_SLOW_QUERY_MS=1000
    /// POLYQUERY_MEMORY_CEILING_MB=512
    /// POLYQUERY_MAX_PARTITIONS=8
    /// POLYQUERY_QUERY_TIMEOUT_MS=30000
    /// POLYQUERY_RESERVED_FIELDS=__v,_id,tenantSecret
    pub fn from_env() -> Self {
        let defaults = Self::default();
        let mb = 1024 * 1024;

        let reserved_fields = std::env::var("POLYQUERY_RESERVED_FIELDS")
            .map(|s| {
                s.split(',')
                    .map(str::trim)
                    .filter(|f| !f.is_empty())
                    .map(str::to_string)
                    .collect()
            })
            .unwrap_or(defaults.reserved_fields);

        Self {
            cache_ttl_secs: env_parse("POLYQUERY_CACHE_TTL_SECS").unwrap_or(defaults.cache_ttl_secs),
            cache_max_entries: env_parse("POLYQUERY_CACHE_MAX_ENTRIES")
                .unwrap_or(defaults.cache_max_entries),
            cache_max_bytes: env_parse::<usize>("POLYQUERY_CACHE_MAX_MB")
                .map(|m| m * mb)
                .unwrap_or(defaults.cache_max_bytes),
            estimate_timeout_ms: env_parse("POLYQUERY_ESTIMATE_TIMEOUT_MS")
                .unwrap_or(defaults.estimate_timeout_ms),
            fallback_estimate: env_parse("POLYQUERY_FALLBACK_ESTIMATE")
                .unwrap_or(defaults.fallback_estimate),
            stream_chunk_size: env_parse::<usize>("POLYQUERY_STREAM_CHUNK_SIZE")
                .filter(|n| *n > 0)
                .unwrap_or(defaults.stream_chunk_size),
            slow_query_ms: env_parse("POLYQUERY_SLOW_QUERY_MS").unwrap_or(defaults.slow_query_ms),
            memory_ceiling_bytes: env_parse::<usize>("POLYQUERY_MEMORY_CEILING_MB")
                .map(|m| m * mb)
                .unwrap_or(defaults.memory_ceiling_bytes),
            max_partitions: env_parse::<usize>("POLYQUERY_MAX_PARTITIONS")
                .filter(|n| *n > 0)
                .unwrap_or(defaults.max_partitions),
            query_timeout_ms: env_parse("POLYQUERY_QUERY_TIMEOUT_MS")
                .unwrap_or(defaults.query_timeout_ms),
            thresholds: defaults.thresholds,
            reserved_fields,
        }
    }

    /// Load a JSON config file; missing keys keep their defaults
    pub fn from_file(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        let text = std::fs::read_to_string(path)?;
        let config: Self = serde_json::from_str(&text)?;
        config.validate()?;
        Ok(config)
    }

    /// Thresholds must be strictly increasing
    pub fn validate(&self) -> Result<(), ConfigError> {
        let t = &self.thresholds;
        if t.memory < t.hybrid && t.hybrid < t.streaming {
            Ok(())
        } else {
            Err(ConfigError::Thresholds(format!(
                "expected memory < hybrid < streaming, got {} / {} / {}",
                t.memory, t.hybrid, t.streaming
            )))
        }
    }

    pub fn cache_ttl(&self) -> Duration {
        Duration::from_secs(self.cache_ttl_secs)
    }

    pub fn estimate_timeout(&self) -> Duration {
        Duration::from_millis(self.estimate_timeout_ms)
    }

    pub fn slow_query(&self) -> Duration {
        Duration::from_millis(self.slow_query_ms)
    }

    pub fn query_timeout(&self) -> Option<Duration> {
        (self.query_timeout_ms > 0).then(|| Duration::from_millis(self.query_timeout_ms))
    }
}

fn env_parse<T: std::str::FromStr>(name: &str) -> Option<T> {
    std::env::var(name).ok().and_then(|v| v.trim().parse().ok())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults() {
        let config = EngineConfig::default();
        assert_eq!(config.thresholds.memory, 1_000);
        assert_eq!(config.thresholds.hybrid, 100_000);
        assert_eq!(config.thresholds.streaming, 1_000_000);
        assert_eq!(config.cache_ttl(), Duration::from_secs(300));
        assert!(config.max_partitions >= 1);
    }

    #[test]
    fn test_partial_json_uses_defaults() {
        let config: EngineConfig = serde_json::from_str(r#"{"fallback_estimate": 10}"#).unwrap();
        assert_eq!(config.fallback_estimate, 10);
        assert_eq!(config.stream_chunk_size, 1_000);
        assert_eq!(config.query_timeout(), Some(Duration::from_secs(30)));
    }

    #[test]
    fn test_from_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("polyquery.json");
        std::fs::write(&path, r#"{"stream_chunk_size": 250, "query_timeout_ms": 0}"#).unwrap();

        let config = EngineConfig::from_file(&path).unwrap();
        assert_eq!(config.stream_chunk_size, 250);
        assert_eq!(config.query_timeout(), None);

        std::fs::write(
            &path,
            r#"{"thresholds": {"memory": 10, "hybrid": 5, "streaming": 100}}"#,
        )
        .unwrap();
        assert!(matches!(
            EngineConfig::from_file(&path),
            Err(ConfigError::Thresholds(_))
        ));
        assert!(matches!(
            EngineConfig::from_file(dir.path().join("missing.json")),
            Err(ConfigError::Io(_))
        ));
    }
}
