//! Configuration file support for the Condense validator
//!
//! Supports both YAML and TOML configuration files.
//!
//! # Example YAML configuration:
//! ```yaml
//! validator:
//!   round_interval_secs: 60
//!   state_dir: /var/lib/condense
//!
//! tiers:
//!   - id: inference_0
//!     min_context_tokens: 256
//!     max_context_tokens: 1536
//!     max_compressed_tokens: 64
//!     model: reference-small
//!     latency_budget_ms: 2000
//!
//! inference:
//!   base_url: http://127.0.0.1:8000
//!
//! consensus:
//!   kind: http
//!   url: http://127.0.0.1:9944/weights
//!
//! miners:
//!   - id: miner-a
//!     endpoint: http://10.0.0.5:8080
//!
//! logging:
//!   level: info
//!   format: json
//! ```

use condense_core::{MinerInfo, Tier, TierTable};
use condense_runtime::aggregation::AggregationConfig;
use condense_runtime::eval_pool::EvaluationPoolConfig;
use condense_runtime::fidelity::EvaluatorConfig;
use condense_runtime::generator::GeneratorConfig;
use condense_runtime::validator::ValidatorConfig;
use indexmap::IndexMap;
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;

/// Main configuration structure
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    /// Round loop settings
    pub validator: ValidatorSection,

    /// Tier table, re-read while the validator runs
    pub tiers: Vec<Tier>,

    /// Task generator settings
    pub generator: GeneratorConfig,

    /// Text sources for task contexts
    pub corpus: CorpusConfig,

    /// Miner dispatch settings
    pub dispatch: DispatchConfig,

    /// Reference model evaluation
    pub evaluation: EvaluatorConfig,

    /// Evaluation worker pool
    pub evaluation_pool: EvaluationPoolConfig,

    /// Score windows and smoothing
    pub aggregation: AggregationConfig,

    /// Reference model endpoint
    pub inference: InferenceConfig,

    /// Where weights are published
    pub consensus: ConsensusConfig,

    /// Miner roster
    pub miners: Vec<MinerInfo>,

    /// Logging configuration
    pub logging: LoggingConfig,

    /// Prometheus endpoint
    pub metrics: MetricsConfig,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            validator: ValidatorSection::default(),
            tiers: default_tiers(),
            generator: GeneratorConfig::default(),
            corpus: CorpusConfig::default(),
            dispatch: DispatchConfig::default(),
            evaluation: EvaluatorConfig::default(),
            evaluation_pool: EvaluationPoolConfig::default(),
            aggregation: AggregationConfig::default(),
            inference: InferenceConfig::default(),
            consensus: ConsensusConfig::default(),
            miners: Vec::new(),
            logging: LoggingConfig::default(),
            metrics: MetricsConfig::default(),
        }
    }
}

/// The two tiers a fresh deployment starts with.
pub fn default_tiers() -> Vec<Tier> {
    vec![
        Tier::new(
            "inference_0",
            (256, 1536),
            64,
            "reference-small",
            Duration::from_secs(2),
        )
        .with_importance(0.4),
        Tier::new(
            "inference_1",
            (1024, 4096),
            256,
            "reference-large",
            Duration::from_secs(4),
        )
        .with_importance(0.6),
    ]
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ValidatorSection {
    /// Seconds between round starts
    pub round_interval_secs: u64,

    /// Seed for task generation; overrides `generator.seed` when set
    #[serde(skip_serializing_if = "Option::is_none")]
    pub seed: Option<u64>,

    /// Directory for persisted weights (enables recovery on restart)
    #[serde(skip_serializing_if = "Option::is_none")]
    pub state_dir: Option<PathBuf>,

    /// Tasks generated per tier per round
    pub tasks_per_tier: usize,

    /// Query miner metadata before each round
    pub refresh_metadata: bool,
}

impl Default for ValidatorSection {
    fn default() -> Self {
        Self {
            round_interval_secs: 60,
            seed: None,
            state_dir: None,
            tasks_per_tier: 1,
            refresh_metadata: true,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct CorpusConfig {
    /// Directories of `.txt` files
    pub dirs: Vec<PathBuf>,

    /// Include the built-in synthetic corpus
    pub synthetic: bool,
}

impl Default for CorpusConfig {
    fn default() -> Self {
        Self {
            dirs: Vec::new(),
            synthetic: true,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct DispatchConfig {
    /// Concurrent requests in flight; miners × tiers when unset
    #[serde(skip_serializing_if = "Option::is_none")]
    pub concurrency: Option<usize>,

    /// Timeout for metadata queries
    pub metadata_timeout_ms: u64,

    /// Largest miner response body accepted
    pub max_response_bytes: usize,
}

impl Default for DispatchConfig {
    fn default() -> Self {
        Self {
            concurrency: None,
            metadata_timeout_ms: 2_000,
            max_response_bytes: condense_runtime::limits::MAX_MINER_RESPONSE_BYTES,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct InferenceConfig {
    /// Engine name for logs
    pub name: String,

    /// Base URL of the inference service
    pub base_url: String,

    /// Request timeout
    pub timeout_ms: u64,

    /// Extra headers sent with every request
    #[serde(skip_serializing_if = "IndexMap::is_empty")]
    pub headers: IndexMap<String, String>,
}

impl Default for InferenceConfig {
    fn default() -> Self {
        Self {
            name: "reference".to_string(),
            base_url: "http://127.0.0.1:8000".to_string(),
            timeout_ms: 60_000,
            headers: IndexMap::new(),
        }
    }
}

/// Weight sink selection
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum ConsensusConfig {
    /// Log weights only
    #[default]
    Log,
    /// Append submissions to a JSON lines file
    File { path: PathBuf },
    /// POST submissions to an HTTP endpoint
    Http {
        url: String,
        #[serde(default = "default_consensus_timeout_ms")]
        timeout_ms: u64,
        #[serde(default, skip_serializing_if = "IndexMap::is_empty")]
        headers: IndexMap<String, String>,
    },
}

fn default_consensus_timeout_ms() -> u64 {
    10_000
}

/// Logging configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct LoggingConfig {
    /// Log level (trace, debug, info, warn, error); `RUST_LOG` wins when set
    pub level: String,

    /// Log format (text, json)
    pub format: String,

    /// Include timestamps
    pub timestamps: bool,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: "info".to_string(),
            format: "text".to_string(),
            timestamps: true,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct MetricsConfig {
    /// Serve `/metrics`
    pub enabled: bool,

    /// Bind address
    pub bind: String,

    /// Metrics port
    pub port: u16,
}

impl Default for MetricsConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            bind: "127.0.0.1".to_string(),
            port: 9090,
        }
    }
}

impl MetricsConfig {
    pub fn addr(&self) -> String {
        format!("{}:{}", self.bind, self.port)
    }
}

impl Config {
    /// Load configuration from a file (YAML or TOML, auto-detected by extension)
    pub fn load<P: AsRef<Path>>(path: P) -> Result<Self, ConfigError> {
        let path = path.as_ref();
        let content = std::fs::read_to_string(path)
            .map_err(|e| ConfigError::IoError(path.to_path_buf(), e.to_string()))?;

        let extension = path
            .extension()
            .and_then(|e| e.to_str())
            .unwrap_or("")
            .to_lowercase();

        match extension.as_str() {
            "yaml" | "yml" => Self::from_yaml(&content),
            "toml" => Self::from_toml(&content),
            _ => Self::from_yaml(&content).or_else(|_| Self::from_toml(&content)),
        }
    }

    /// Parse configuration from YAML string
    pub fn from_yaml(content: &str) -> Result<Self, ConfigError> {
        serde_yaml::from_str(content).map_err(|e| ConfigError::ParseError(e.to_string()))
    }

    /// Parse configuration from TOML string
    pub fn from_toml(content: &str) -> Result<Self, ConfigError> {
        toml::from_str(content).map_err(|e| ConfigError::ParseError(e.to_string()))
    }

    /// Check everything a round depends on. Returns the validated tier table.
    pub fn validate(&self) -> Result<TierTable, ConfigError> {
        let table = TierTable::new(self.tiers.clone())
            .map_err(|e| ConfigError::Invalid(format!("tiers: {}", e)))?;

        if self.validator.round_interval_secs == 0 {
            return Err(ConfigError::Invalid(
                "validator.round_interval_secs must be positive".into(),
            ));
        }
        if self.validator.tasks_per_tier == 0 {
            return Err(ConfigError::Invalid(
                "validator.tasks_per_tier must be positive".into(),
            ));
        }
        if self.corpus.dirs.is_empty() && !self.corpus.synthetic {
            return Err(ConfigError::Invalid(
                "corpus: no directories and synthetic corpus disabled".into(),
            ));
        }
        if !matches!(self.logging.format.as_str(), "text" | "json") {
            return Err(ConfigError::Invalid(format!(
                "logging.format must be text or json, got {}",
                self.logging.format
            )));
        }
        if !(0.0..=1.0).contains(&self.aggregation.smoothing) {
            return Err(ConfigError::Invalid(format!(
                "aggregation.smoothing must lie in [0, 1], got {}",
                self.aggregation.smoothing
            )));
        }

        check_url("inference.base_url", &self.inference.base_url)?;
        if let ConsensusConfig::Http { url, .. } = &self.consensus {
            check_url("consensus.url", url)?;
        }

        let mut seen = std::collections::HashSet::new();
        for miner in &self.miners {
            if !seen.insert(&miner.id) {
                return Err(ConfigError::Invalid(format!(
                    "miners: duplicate id {}",
                    miner.id
                )));
            }
            check_url(&format!("miners.{}", miner.id), &miner.endpoint)?;
        }

        Ok(table)
    }

    /// Generator settings with the validator seed applied.
    pub fn generator_config(&self) -> GeneratorConfig {
        let mut generator = self.generator.clone();
        if self.validator.seed.is_some() {
            generator.seed = self.validator.seed;
        }
        generator
    }

    pub fn validator_config(&self) -> ValidatorConfig {
        ValidatorConfig {
            tasks_per_tier: self.validator.tasks_per_tier,
            dispatch_concurrency: self.dispatch.concurrency,
            metadata_timeout_ms: self.dispatch.metadata_timeout_ms,
        }
    }

    pub fn round_interval(&self) -> Duration {
        Duration::from_secs(self.validator.round_interval_secs)
    }

    /// Create an example configuration
    pub fn example() -> Self {
        let mut headers = IndexMap::new();
        headers.insert(
            "authorization".to_string(),
            "Bearer your-inference-token".to_string(),
        );

        Self {
            validator: ValidatorSection {
                round_interval_secs: 60,
                seed: None,
                state_dir: Some(PathBuf::from("/var/lib/condense")),
                tasks_per_tier: 1,
                refresh_metadata: true,
            },
            corpus: CorpusConfig {
                dirs: vec![PathBuf::from("/var/lib/condense/corpus")],
                synthetic: true,
            },
            inference: InferenceConfig {
                base_url: "http://inference:8000".to_string(),
                headers,
                ..Default::default()
            },
            consensus: ConsensusConfig::Http {
                url: "http://consensus:9944/weights".to_string(),
                timeout_ms: default_consensus_timeout_ms(),
                headers: IndexMap::new(),
            },
            miners: vec![
                MinerInfo::new("miner-a", "http://10.0.0.5:8080"),
                MinerInfo::new("miner-b", "http://10.0.0.6:8080"),
            ],
            logging: LoggingConfig {
                level: "info".to_string(),
                format: "json".to_string(),
                timestamps: true,
            },
            metrics: MetricsConfig {
                enabled: true,
                bind: "0.0.0.0".to_string(),
                port: 9090,
            },
            ..Default::default()
        }
    }

    /// Generate example YAML configuration
    pub fn example_yaml() -> String {
        serde_yaml::to_string(&Self::example()).unwrap_or_default()
    }

    /// Generate example TOML configuration
    pub fn example_toml() -> String {
        toml::to_string_pretty(&Self::example()).unwrap_or_default()
    }
}

fn check_url(field: &str, url: &str) -> Result<(), ConfigError> {
    let url = url.trim();
    if url.starts_with("http://") || url.starts_with("https://") {
        Ok(())
    } else {
        Err(ConfigError::Invalid(format!(
            "{}: expected an http(s) URL, got {:?}",
            field, url
        )))
    }
}

/// Configuration error types
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("Failed to read config file {0}: {1}")]
    IoError(PathBuf, String),

    #[error("Failed to parse config: {0}")]
    ParseError(String),

    #[error("Invalid config: {0}")]
    Invalid(String),
}
