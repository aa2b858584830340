//! Prometheus metrics recording and endpoint.

use metrics_exporter_prometheus::{PrometheusBuilder, PrometheusHandle};

use murmur_agent::JobOutcome;

/// Install the Prometheus metrics recorder and return the handle for rendering.
pub fn install_prometheus_recorder() -> anyhow::Result<PrometheusHandle> {
    Ok(PrometheusBuilder::new().install_recorder()?)
}

/// Record a new voice connection.
pub fn record_voice_connect() {
    metrics::gauge!("voice_connections_active").increment(1.0);
}

/// Record a voice disconnection.
pub fn record_voice_disconnect() {
    metrics::gauge!("voice_connections_active").decrement(1.0);
}

/// Record a pipeline job being queued.
pub fn record_job_started() {
    metrics::gauge!("pipeline_jobs_active").increment(1.0);
}

/// Record the end of a pipeline job, however it ended.
pub fn record_job_finished(outcome: &JobOutcome) {
    metrics::gauge!("pipeline_jobs_active").decrement(1.0);
    let labels = [("outcome", outcome.label())];
    metrics::counter!("pipeline_jobs_total", &labels).increment(1);
    match outcome {
        JobOutcome::Completed(report) => {
            metrics::counter!("audio_chunks_sent_total").increment(u64::from(report.chunks_sent));
            if report.llm_failed {
                record_error("provider");
            }
        }
        JobOutcome::Panicked => record_error("pipeline_panic"),
        JobOutcome::Cancelled => {}
    }
}

/// Record an error of a given kind.
pub fn record_error(kind: &str) {
    let labels = [("kind", kind.to_string())];
    metrics::counter!("errors_total", &labels).increment(1);
}
