//! Prometheus metrics for the validator

use prometheus::{
    Counter, CounterVec, Gauge, GaugeVec, Histogram, HistogramOpts, HistogramVec, Opts, Registry,
};
use std::sync::Arc;
use tokio::io::AsyncWriteExt;
use tokio::net::TcpListener;
use tracing::{error, info};

/// Metrics collection for validator rounds
#[derive(Clone)]
pub struct ValidatorMetrics {
    registry: Arc<Registry>,
    pub dispatch_total: CounterVec,
    pub response_time: HistogramVec,
    pub evaluation_duration: HistogramVec,
    pub evaluation_failures: CounterVec,
    pub fidelity: HistogramVec,
    pub tiers_skipped: CounterVec,
    pub miner_weight: GaugeVec,
    pub rounds_total: Counter,
    pub round_duration: Histogram,
    pub publish_failures: Counter,
    pub eval_queue_depth: Gauge,
}

impl ValidatorMetrics {
    pub fn new() -> Self {
        let registry = Registry::new();

        let dispatch_total = CounterVec::new(
            Opts::new(
                "condense_dispatch_total",
                "Compression requests by tier and outcome",
            ),
            &["tier", "outcome"],
        )
        .expect("failed to create dispatch_total counter");

        let response_time = HistogramVec::new(
            HistogramOpts::new(
                "condense_response_time_seconds",
                "Miner response time for fulfilled requests",
            )
            .buckets(vec![0.05, 0.1, 0.25, 0.5, 1.0, 2.0, 4.0, 8.0, 16.0]),
            &["tier"],
        )
        .expect("failed to create response_time histogram");

        let evaluation_duration = HistogramVec::new(
            HistogramOpts::new(
                "condense_evaluation_duration_seconds",
                "Reference model evaluation time per artifact",
            )
            .buckets(vec![0.01, 0.05, 0.1, 0.5, 1.0, 2.5, 5.0, 10.0, 30.0]),
            &["tier"],
        )
        .expect("failed to create evaluation_duration histogram");

        let evaluation_failures = CounterVec::new(
            Opts::new(
                "condense_evaluation_failures_total",
                "Evaluations excluded because the reference model call failed",
            ),
            &["tier"],
        )
        .expect("failed to create evaluation_failures counter");

        let fidelity = HistogramVec::new(
            HistogramOpts::new("condense_fidelity", "Fidelity score by tier and probe kind")
                .buckets(vec![0.0, 0.1, 0.25, 0.5, 0.75, 0.9, 1.0]),
            &["tier", "probe"],
        )
        .expect("failed to create fidelity histogram");

        let tiers_skipped = CounterVec::new(
            Opts::new(
                "condense_tiers_skipped_total",
                "Rounds in which a tier was skipped because no task could be generated",
            ),
            &["tier"],
        )
        .expect("failed to create tiers_skipped counter");

        let miner_weight = GaugeVec::new(
            Opts::new("condense_miner_weight", "Last published weight per miner"),
            &["miner"],
        )
        .expect("failed to create miner_weight gauge");

        let rounds_total = Counter::new("condense_rounds_total", "Completed validator rounds")
            .expect("failed to create rounds_total counter");

        let round_duration = Histogram::with_opts(
            HistogramOpts::new("condense_round_duration_seconds", "Wall time per round")
                .buckets(vec![1.0, 5.0, 10.0, 30.0, 60.0, 120.0, 300.0]),
        )
        .expect("failed to create round_duration histogram");

        let publish_failures = Counter::new(
            "condense_publish_failures_total",
            "Weight submissions rejected by the consensus sink",
        )
        .expect("failed to create publish_failures counter");

        let eval_queue_depth = Gauge::new(
            "condense_eval_queue_depth",
            "Artifacts waiting for reference model evaluation",
        )
        .expect("failed to create eval_queue_depth gauge");

        registry
            .register(Box::new(dispatch_total.clone()))
            .expect("failed to register dispatch_total");
        registry
            .register(Box::new(response_time.clone()))
            .expect("failed to register response_time");
        registry
            .register(Box::new(evaluation_duration.clone()))
            .expect("failed to register evaluation_duration");
        registry
            .register(Box::new(evaluation_failures.clone()))
            .expect("failed to register evaluation_failures");
        registry
            .register(Box::new(fidelity.clone()))
            .expect("failed to register fidelity");
        registry
            .register(Box::new(tiers_skipped.clone()))
            .expect("failed to register tiers_skipped");
        registry
            .register(Box::new(miner_weight.clone()))
            .expect("failed to register miner_weight");
        registry
            .register(Box::new(rounds_total.clone()))
            .expect("failed to register rounds_total");
        registry
            .register(Box::new(round_duration.clone()))
            .expect("failed to register round_duration");
        registry
            .register(Box::new(publish_failures.clone()))
            .expect("failed to register publish_failures");
        registry
            .register(Box::new(eval_queue_depth.clone()))
            .expect("failed to register eval_queue_depth");

        Self {
            registry: Arc::new(registry),
            dispatch_total,
            response_time,
            evaluation_duration,
            evaluation_failures,
            fidelity,
            tiers_skipped,
            miner_weight,
            rounds_total,
            round_duration,
            publish_failures,
            eval_queue_depth,
        }
    }

    pub fn record_dispatch(&self, tier: &str, outcome: &str, response_secs: Option<f64>) {
        self.dispatch_total
            .with_label_values(&[tier, outcome])
            .inc();
        if let Some(secs) = response_secs {
            self.response_time.with_label_values(&[tier]).observe(secs);
        }
    }

    pub fn record_evaluation(&self, tier: &str, probe: &str, fidelity: f64, duration_secs: f64) {
        self.evaluation_duration
            .with_label_values(&[tier])
            .observe(duration_secs);
        self.fidelity
            .with_label_values(&[tier, probe])
            .observe(fidelity);
    }

    pub fn record_evaluation_failure(&self, tier: &str) {
        self.evaluation_failures.with_label_values(&[tier]).inc();
    }

    pub fn record_skipped_tier(&self, tier: &str) {
        self.tiers_skipped.with_label_values(&[tier]).inc();
    }

    pub fn record_round(&self, duration_secs: f64) {
        self.rounds_total.inc();
        self.round_duration.observe(duration_secs);
    }

    pub fn set_weights<'a>(&self, weights: impl IntoIterator<Item = (&'a str, f64)>) {
        self.miner_weight.reset();
        for (miner, w) in weights {
            self.miner_weight.with_label_values(&[miner]).set(w);
        }
    }

    /// Get Prometheus text output
    pub fn gather(&self) -> String {
        use prometheus::Encoder;
        let encoder = prometheus::TextEncoder::new();
        let metric_families = self.registry.gather();
        let mut buffer = Vec::new();
        if encoder.encode(&metric_families, &mut buffer).is_err() {
            return String::new();
        }
        String::from_utf8(buffer).unwrap_or_default()
    }
}

impl Default for ValidatorMetrics {
    fn default() -> Self {
        Self::new()
    }
}

/// Plain HTTP server answering every connection with the metrics text
pub struct MetricsServer {
    metrics: ValidatorMetrics,
    addr: String,
}

impl MetricsServer {
    pub fn new(metrics: ValidatorMetrics, addr: impl Into<String>) -> Self {
        Self {
            metrics,
            addr: addr.into(),
        }
    }

    pub async fn run(&self) -> anyhow::Result<()> {
        let listener = TcpListener::bind(&self.addr).await?;
        info!("Metrics server listening on http://{}/metrics", self.addr);

        loop {
            let (mut socket, _addr) = listener.accept().await?;
            let body = self.metrics.gather();
            let response = format!(
                "HTTP/1.1 200 OK\r\nContent-Type: text/plain; version=0.0.4; charset=utf-8\r\nContent-Length: {}\r\n\r\n{}",
                body.len(),
                body
            );
            if let Err(e) = socket.write_all(response.as_bytes()).await {
                error!("Failed to write metrics response: {}", e);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_metrics_output() {
        let metrics = ValidatorMetrics::new();
        metrics.record_dispatch("inference_0", "fulfilled", Some(0.5));
        metrics.record_dispatch("inference_0", "timed_out", None);
        metrics.record_evaluation("inference_0", "fact_lookup", 1.0, 0.2);
        metrics.record_round(12.0);

        let output = metrics.gather();
        assert!(output.contains("condense_dispatch_total"));
        assert!(output.contains("condense_response_time_seconds"));
        assert!(output.contains("condense_fidelity"));
        assert!(output.contains("condense_rounds_total 1"));
    }

    #[test]
    fn test_set_weights_replaces_previous() {
        let metrics = ValidatorMetrics::default();
        metrics.set_weights(vec![("a", 0.7), ("b", 0.3)]);
        metrics.set_weights(vec![("c", 1.0)]);
        let output = metrics.gather();
        assert!(output.contains("condense_miner_weight{miner=\"c\"} 1"));
        assert!(!output.contains("miner=\"a\""));
    }
}
