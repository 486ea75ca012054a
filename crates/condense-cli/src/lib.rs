//! Condense CLI library - configuration and wiring for the `condense` binary
//!
//! Turns a [`config::Config`] into a running [`Validator`]: HTTP connectors,
//! corpus sources, weight sink and state store, plus logging setup and
//! config hot reload.

pub mod config;

use anyhow::{Context, Result};
use condense_core::{MinerInfo, WhitespaceTokenizer};
use condense_runtime::benchmark::{run_generation_benchmark, BenchmarkReport};
use condense_runtime::connector::{HttpInferenceEngine, HttpMinerTransport, HttpWeightSink};
use condense_runtime::corpus::{CorpusSource, FileCorpus, SyntheticCorpus};
use condense_runtime::generator::TaskGenerator;
use condense_runtime::metrics::ValidatorMetrics;
use condense_runtime::persistence::{FileWeightStore, WeightStore};
use condense_runtime::publisher::{JsonlFileSink, LogSink, WeightSink};
use condense_runtime::registry::{ReloadReport, TierRegistry};
use condense_runtime::validator::Validator;
use config::{Config, ConfigError, ConsensusConfig, LoggingConfig};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::{Duration, SystemTime};
use tracing::info;
use tracing_subscriber::EnvFilter;

/// Install the global tracing subscriber. `RUST_LOG` overrides the level.
pub fn init_logging(config: &LoggingConfig) -> Result<()> {
    let filter = EnvFilter::try_from_default_env()
        .or_else(|_| EnvFilter::try_new(&config.level))
        .with_context(|| format!("invalid log level {:?}", config.level))?;
    let builder = tracing_subscriber::fmt().with_env_filter(filter);

    let installed = match (config.format.as_str(), config.timestamps) {
        ("json", true) => builder.json().try_init(),
        ("json", false) => builder.json().without_time().try_init(),
        (_, true) => builder.try_init(),
        (_, false) => builder.without_time().try_init(),
    };
    installed.map_err(|e| anyhow::anyhow!("failed to install subscriber: {}", e))
}

/// Corpus sources named by the config, in order: directories, then synthetic.
pub fn build_sources(config: &Config) -> Result<Vec<Arc<dyn CorpusSource>>, ConfigError> {
    let mut sources: Vec<Arc<dyn CorpusSource>> = Vec::new();
    for dir in &config.corpus.dirs {
        let corpus = FileCorpus::load_dir(dir)
            .map_err(|e| ConfigError::Invalid(format!("corpus {}: {}", dir.display(), e)))?;
        info!(corpus = corpus.name(), paragraphs = corpus.len(), "Loaded corpus");
        sources.push(Arc::new(corpus));
    }
    if config.corpus.synthetic {
        sources.push(Arc::new(SyntheticCorpus::new()));
    }
    if sources.is_empty() {
        return Err(ConfigError::Invalid("no corpus sources configured".into()));
    }
    Ok(sources)
}

pub fn build_generator(config: &Config) -> Result<TaskGenerator, ConfigError> {
    Ok(TaskGenerator::new(
        config.generator_config(),
        build_sources(config)?,
        Arc::new(WhitespaceTokenizer),
    ))
}

pub fn build_sink(consensus: &ConsensusConfig) -> Result<Arc<dyn WeightSink>> {
    Ok(match consensus {
        ConsensusConfig::Log => Arc::new(LogSink::new("log")),
        ConsensusConfig::File { path } => Arc::new(
            JsonlFileSink::new("file", path)
                .with_context(|| format!("opening weight file {}", path.display()))?,
        ),
        ConsensusConfig::Http {
            url,
            timeout_ms,
            headers,
        } => {
            let mut sink = HttpWeightSink::new(
                "http",
                url,
                Some(Duration::from_millis(*timeout_ms)),
            )?;
            for (k, v) in headers {
                sink = sink.with_header(k, v);
            }
            Arc::new(sink)
        }
    })
}

/// Wire a validator from config against `registry`. State is restored from
/// `validator.state_dir` when one is configured.
pub fn build_validator(
    config: &Config,
    registry: Arc<TierRegistry>,
    metrics: ValidatorMetrics,
) -> Result<Validator> {
    let transport = HttpMinerTransport::new(Duration::from_millis(
        config.dispatch.metadata_timeout_ms,
    ))?
    .with_max_response_bytes(config.dispatch.max_response_bytes);

    let mut engine = HttpInferenceEngine::new(
        config.inference.name.clone(),
        &config.inference.base_url,
        Some(Duration::from_millis(config.inference.timeout_ms)),
    )?;
    for (k, v) in &config.inference.headers {
        engine = engine.with_header(k, v);
    }

    let mut builder = Validator::builder(
        registry,
        Arc::new(transport),
        Arc::new(engine),
        build_sink(&config.consensus)?,
    )
    .config(config.validator_config())
    .generator(build_generator(config)?)
    .evaluator(config.evaluation.clone())
    .pool(config.evaluation_pool.clone())
    .aggregation(config.aggregation.clone())
    .metrics(metrics);

    if let Some(dir) = &config.validator.state_dir {
        let store = FileWeightStore::open(dir)
            .with_context(|| format!("opening state dir {}", dir.display()))?;
        builder = builder.store(Arc::new(store) as Arc<dyn WeightStore>);
    }

    let mut validator = builder.build();
    if validator.restore()? {
        info!(round = validator.round(), "Resuming from persisted state");
    }
    Ok(validator)
}

/// Generation benchmark over the configured tiers and corpus.
pub fn benchmark(config: &Config, count: usize, keep_samples: bool) -> Result<BenchmarkReport> {
    let table = config.validate()?;
    let tiers: Vec<_> = table.iter().cloned().collect();
    let mut generator = build_generator(config)?;
    Ok(run_generation_benchmark(
        &mut generator,
        &tiers,
        count,
        keep_samples,
    ))
}

/// Re-reads the config file when its modification time changes.
pub struct ConfigWatcher {
    path: PathBuf,
    last_modified: Option<SystemTime>,
}

impl ConfigWatcher {
    /// Starts from the file's current modification time, so the first poll
    /// reports no change.
    pub fn new(path: impl Into<PathBuf>) -> Self {
        let path = path.into();
        let last_modified = modified(&path);
        Self {
            path,
            last_modified,
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// The freshly loaded config if the file changed since the last poll.
    pub fn poll(&mut self) -> Result<Option<Config>, ConfigError> {
        let current = modified(&self.path);
        if current.is_none() || current == self.last_modified {
            return Ok(None);
        }
        self.last_modified = current;
        Config::load(&self.path).map(Some)
    }
}

fn modified(path: &Path) -> Option<SystemTime> {
    std::fs::metadata(path).and_then(|m| m.modified()).ok()
}

/// Swap the config's tier table into `registry`. A table that fails
/// validation is refused and the live one stays; the registry logs either way.
pub fn reload_tiers(registry: &TierRegistry, config: &Config) -> Option<ReloadReport> {
    registry
        .reload(config.tiers.clone())
        .ok()
        .filter(|report| !report.is_noop())
}

/// Apply a re-read config: validate it as a whole, swap its tier table into
/// `registry` and hand back its miner roster. An invalid config changes
/// nothing.
pub fn apply_reload(registry: &TierRegistry, fresh: Config) -> Result<Vec<MinerInfo>, ConfigError> {
    fresh.validate()?;
    reload_tiers(registry, &fresh);
    info!(miners = fresh.miners.len(), "Applied reloaded configuration");
    Ok(fresh.miners)
}
