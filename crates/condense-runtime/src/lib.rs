//! Condense Runtime - validator engine for the Condense benchmark
//!
//! Async side of the validator: the tier registry, task generation, dispatch
//! to miners, fidelity evaluation, score aggregation and weight publishing,
//! plus the HTTP connectors, metrics and state persistence they rely on.

pub mod aggregation;
pub mod benchmark;
pub mod circuit_breaker;
pub mod connector;
pub mod corpus;
pub mod dispatch;
pub mod eval_pool;
pub mod fidelity;
pub mod generator;
pub mod inference;
pub mod limits;
pub mod metrics;
pub mod persistence;
pub mod publisher;
pub mod registry;
pub mod validator;
pub mod window;

pub use aggregation::{trimmed_mean, AggregationConfig, ScoreAggregator};
pub use benchmark::{run_generation_benchmark, BenchmarkReport, TierBenchmark};
pub use circuit_breaker::{CircuitBreaker, CircuitBreakerConfig};
pub use connector::{ConnectorError, HttpInferenceEngine, HttpMinerTransport, HttpWeightSink};
pub use corpus::{CorpusError, CorpusSource, FileCorpus, SyntheticCorpus};
pub use dispatch::{DispatchOutcome, Dispatched, Dispatcher, MinerTransport, TransportError};
pub use eval_pool::{
    BackpressureStrategy, EvaluationJob, EvaluationPool, EvaluationPoolConfig,
    EvaluationPoolMetrics, PoolError,
};
pub use fidelity::{
    likelihood_ratio, score_answer, EvaluationError, EvaluatorConfig, FidelityEvaluator,
    ProbeThresholds,
};
pub use generator::{GenerationError, GeneratorConfig, ProbeMix, TaskGenerator};
pub use inference::{GenerationParams, InferenceEngine, InferenceError, ModelInput};
pub use metrics::{MetricsServer, ValidatorMetrics};
pub use persistence::{
    FileWeightStore, MemoryWeightStore, StoreError, ValidatorSnapshot, WeightStore,
};
pub use publisher::{
    IncentivePublisher, JsonlFileSink, LogSink, PublishError, PublishReceipt, WeightSink,
    WeightSubmission,
};
pub use registry::{RegistryError, ReloadReport, TierRegistry};
pub use validator::{RoundReport, Validator, ValidatorBuilder, ValidatorConfig, ValidatorError};
pub use window::{ScoreWindow, WindowPolicy, WindowSet};
