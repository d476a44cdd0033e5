//! Environment-driven configuration (spec §6.5), one `Config` read once at
//! the composition root and passed down by constructor injection — no
//! global registries, matching spec §9's DI design note.

use std::time::Duration;

use crate::error::FatalConfigError;

const ENV_PREFIX: &str = "ASHAREINSIGHT_";

/// One band of the market-cap / volume tiered scoring in spec §4.9:
/// `[min, max)` CNY maps to `score`.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct ScoreTier {
    pub min: f64,
    pub max: f64,
    pub score: u32,
}

impl ScoreTier {
    pub const fn new(min: f64, max: f64, score: u32) -> Self {
        Self { min, max, score }
    }

    pub fn contains(&self, value: f64) -> bool {
        value >= self.min && value < self.max
    }
}

/// Tunables for the market filter (C10), defaults from spec §4.9.
#[derive(Debug, Clone)]
pub struct MarketFilterConfig {
    pub max_market_cap: Option<f64>,
    pub max_avg_volume_5d: Option<f64>,
    pub market_cap_tiers: Vec<ScoreTier>,
    pub volume_tiers: Vec<ScoreTier>,
    /// Discretization bands for the relevance score `X` itself, used only
    /// when `relevance_mapping_enabled` is set (Open Question #3). `None`
    /// keeps `X` continuous, the default.
    pub relevance_tiers: Option<Vec<ScoreTier>>,
}

impl Default for MarketFilterConfig {
    fn default() -> Self {
        Self {
            max_market_cap: Some(85e8),
            max_avg_volume_5d: Some(2e8),
            market_cap_tiers: vec![
                ScoreTier::new(60e8, 85e8, 1),
                ScoreTier::new(40e8, 60e8, 2),
                ScoreTier::new(0.0, 40e8, 3),
            ],
            volume_tiers: vec![
                ScoreTier::new(1e8, 2e8, 1),
                ScoreTier::new(0.5e8, 1e8, 2),
                ScoreTier::new(0.0, 0.5e8, 3),
            ],
            relevance_tiers: None,
        }
    }
}

#[derive(Debug, Clone)]
pub struct Config {
    pub db_path: std::path::PathBuf,
    pub db_pool_size: usize,
    pub embedding_service_url: String,
    pub rerank_service_url: String,
    pub market_data_provider_url: String,

    pub embedding_timeout: Duration,
    pub rerank_timeout: Duration,
    pub market_data_timeout: Duration,
    pub db_query_timeout: Duration,

    pub embedding_dimensions: usize,
    pub vector_index_m: usize,
    pub vector_index_ef_construction: usize,

    pub retrieval_concurrency: usize,
    pub recall_limit: usize,
    pub cache_ttl: Duration,
    pub cache_capacity: usize,

    pub circuit_breaker_failure_threshold: u32,
    pub circuit_breaker_cooldown: Duration,

    pub fusion_batch_size: usize,
    pub fusion_max_retries: u32,

    pub relevance_mapping_enabled: bool,

    pub http_bind_addr: String,

    pub market_filter: MarketFilterConfig,

    pub retrieval_w1_rerank: f32,
    pub retrieval_w2_importance: f32,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            db_path: "ashareinsight.sqlite3".into(),
            db_pool_size: 4,
            embedding_service_url: "http://localhost:8001".into(),
            rerank_service_url: "http://localhost:8002".into(),
            market_data_provider_url: "http://localhost:8003".into(),
            embedding_timeout: Duration::from_secs(30),
            rerank_timeout: Duration::from_secs(5),
            market_data_timeout: Duration::from_secs(60),
            db_query_timeout: Duration::from_secs(30),
            embedding_dimensions: 2560,
            vector_index_m: 16,
            vector_index_ef_construction: 128,
            retrieval_concurrency: 20,
            recall_limit: 50,
            cache_ttl: Duration::from_secs(5 * 60),
            cache_capacity: 1024,
            circuit_breaker_failure_threshold: 5,
            circuit_breaker_cooldown: Duration::from_secs(60),
            fusion_batch_size: 50,
            fusion_max_retries: 3,
            relevance_mapping_enabled: false,
            http_bind_addr: "0.0.0.0:8080".into(),
            market_filter: MarketFilterConfig::default(),
            retrieval_w1_rerank: 0.7,
            retrieval_w2_importance: 0.3,
        }
    }
}

impl Config {
    /// Reads overrides from `ASHAREINSIGHT_*` environment variables over the
    /// defaults above. Secrets (none in this contract-only surface) would be
    /// read the same way and never logged, per spec §6.5.
    pub fn from_env() -> Result<Self, FatalConfigError> {
        let mut cfg = Config::default();

        if let Some(v) = env_var("DB_PATH") {
            cfg.db_path = v.into();
        }
        if let Some(v) = env_usize("DB_POOL_SIZE")? {
            cfg.db_pool_size = v;
        }
        if let Some(v) = env_var("EMBEDDING_SERVICE_URL") {
            cfg.embedding_service_url = v;
        }
        if let Some(v) = env_var("RERANK_SERVICE_URL") {
            cfg.rerank_service_url = v;
        }
        if let Some(v) = env_var("MARKET_DATA_PROVIDER_URL") {
            cfg.market_data_provider_url = v;
        }
        if let Some(v) = env_duration("EMBEDDING_TIMEOUT_SECS")? {
            cfg.embedding_timeout = v;
        }
        if let Some(v) = env_duration("RERANK_TIMEOUT_SECS")? {
            cfg.rerank_timeout = v;
        }
        if let Some(v) = env_duration("MARKET_DATA_TIMEOUT_SECS")? {
            cfg.market_data_timeout = v;
        }
        if let Some(v) = env_duration("DB_QUERY_TIMEOUT_SECS")? {
            cfg.db_query_timeout = v;
        }
        if let Some(v) = env_usize("EMBEDDING_DIMENSIONS")? {
            cfg.embedding_dimensions = v;
        }
        if let Some(v) = env_usize("VECTOR_INDEX_M")? {
            cfg.vector_index_m = v;
        }
        if let Some(v) = env_usize("VECTOR_INDEX_EF_CONSTRUCTION")? {
            cfg.vector_index_ef_construction = v;
        }
        if let Some(v) = env_usize("RETRIEVAL_CONCURRENCY")? {
            cfg.retrieval_concurrency = v;
        }
        if let Some(v) = env_usize("RECALL_LIMIT")? {
            cfg.recall_limit = v;
        }
        if let Some(v) = env_duration("CACHE_TTL_SECS")? {
            cfg.cache_ttl = v;
        }
        if let Some(v) = env_usize("CACHE_CAPACITY")? {
            cfg.cache_capacity = v;
        }
        if let Some(v) = env_var("HTTP_BIND_ADDR") {
            cfg.http_bind_addr = v;
        }
        if let Some(v) = env_var("RELEVANCE_MAPPING_ENABLED") {
            cfg.relevance_mapping_enabled = v == "1" || v.eq_ignore_ascii_case("true");
        }

        Ok(cfg)
    }

    /// Sanity-checks invariants that `from_env`/`default` cannot enforce by
    /// construction alone — the `w1 + w2 ≈ 1` weighting rule (spec §4.8).
    pub fn validate(&self) -> Result<(), FatalConfigError> {
        let sum = self.retrieval_w1_rerank + self.retrieval_w2_importance;
        if (sum - 1.0).abs() > 0.02 {
            return Err(FatalConfigError::InvalidValue {
                name: "retrieval_w1_rerank + retrieval_w2_importance",
                value: sum.to_string(),
            });
        }
        Ok(())
    }
}

fn env_var(suffix: &'static str) -> Option<String> {
    std::env::var(format!("{ENV_PREFIX}{suffix}")).ok()
}

fn env_usize(suffix: &'static str) -> Result<Option<usize>, FatalConfigError> {
    match env_var(suffix) {
        Some(v) => v
            .parse::<usize>()
            .map(Some)
            .map_err(|_| FatalConfigError::InvalidValue { name: suffix, value: v }),
        None => Ok(None),
    }
}

fn env_duration(suffix: &'static str) -> Result<Option<Duration>, FatalConfigError> {
    Ok(env_usize(suffix)?.map(|secs| Duration::from_secs(secs as u64)))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_match_spec_tunables() {
        let cfg = Config::default();
        assert_eq!(cfg.db_pool_size, 4);
        assert_eq!(cfg.recall_limit, 50);
        assert_eq!(cfg.retrieval_concurrency, 20);
        assert_eq!(cfg.fusion_batch_size, 50);
        assert_eq!(cfg.fusion_max_retries, 3);
        assert_eq!(cfg.circuit_breaker_failure_threshold, 5);
        assert_eq!(cfg.circuit_breaker_cooldown, Duration::from_secs(60));
        assert!(!cfg.relevance_mapping_enabled);
    }

    #[test]
    fn invalid_numeric_env_is_a_fatal_config_error() {
        // SAFETY: test runs single-threaded w.r.t. this env var.
        unsafe { std::env::set_var("ASHAREINSIGHT_RECALL_LIMIT", "not-a-number") };
        let result = Config::from_env();
        unsafe { std::env::remove_var("ASHAREINSIGHT_RECALL_LIMIT") };
        assert!(result.is_err());
    }
}
