use std::collections::BTreeMap;
use std::fmt::Write as _;
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use serde::Serialize;
use tracing::{debug, info};

use crate::outcome::RunResult;

#[derive(Debug, Default, Serialize, Clone)]
pub struct MetricsSnapshot {
    pub stages: BTreeMap<String, StageMetrics>,
    pub total_duration_ms: f64,
    pub stage_failures: u64,
    pub post_action_failures: u64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub result: Option<RunResult>,
}

#[derive(Debug, Default, Serialize, Clone)]
pub struct StageMetrics {
    pub calls: u64,
    pub failures: u64,
    pub total_duration_ms: f64,
    pub max_duration_ms: f64,
}

#[derive(Debug, Default, Clone)]
pub struct MetricsCollector {
    inner: Arc<Mutex<MetricsSnapshot>>,
}

impl MetricsCollector {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn start_stage(&self, stage_name: &str) -> StageTimer {
        StageTimer {
            stage: stage_name.to_string(),
            started_at: Instant::now(),
            collector: self.inner.clone(),
            recorded: false,
        }
    }

    pub fn record_total_duration(&self, duration: Duration) {
        if let Ok(mut guard) = self.inner.lock() {
            guard.total_duration_ms = duration.as_secs_f64() * 1_000.0;
        }
    }

    pub fn record_stage_failure(&self, stage_name: &str) {
        if let Ok(mut guard) = self.inner.lock() {
            guard.stage_failures += 1;
            guard.stages.entry(stage_name.to_string()).or_default().failures += 1;
        }
    }

    pub fn record_post_action_failure(&self) {
        if let Ok(mut guard) = self.inner.lock() {
            guard.post_action_failures += 1;
        }
    }

    pub fn record_result(&self, result: RunResult) {
        if let Ok(mut guard) = self.inner.lock() {
            guard.result = Some(result);
        }
    }

    pub fn snapshot(&self) -> MetricsSnapshot {
        self.inner.lock().map(|g| g.clone()).unwrap_or_default()
    }

    pub fn reset(&self) {
        if let Ok(mut guard) = self.inner.lock() {
            *guard = MetricsSnapshot::default();
        }
    }
}

/// Records one call of a stage when dropped.
pub struct StageTimer {
    stage: String,
    started_at: Instant,
    collector: Arc<Mutex<MetricsSnapshot>>,
    recorded: bool,
}

impl StageTimer {
    fn record(&mut self) {
        if self.recorded {
            return;
        }
        let duration_ms = self.started_at.elapsed().as_secs_f64() * 1_000.0;
        if let Ok(mut guard) = self.collector.lock() {
            let metrics = guard.stages.entry(self.stage.clone()).or_default();
            metrics.calls += 1;
            metrics.total_duration_ms += duration_ms;
            if duration_ms > metrics.max_duration_ms {
                metrics.max_duration_ms = duration_ms;
            }
        }
        debug!(
            stage = self.stage.as_str(),
            duration_ms, "Stage duration recorded"
        );
        self.recorded = true;
    }
}

impl Drop for StageTimer {
    fn drop(&mut self) {
        self.record();
    }
}

pub fn log_snapshot(snapshot: &MetricsSnapshot) {
    info!(
        total_duration_ms = snapshot.total_duration_ms,
        stage_count = snapshot.stages.len(),
        stage_failures = snapshot.stage_failures,
        post_action_failures = snapshot.post_action_failures,
        result = snapshot.result.map(|r| r.as_str()).unwrap_or("unknown"),
        "Pipeline metrics summary"
    );
    for (stage, metrics) in &snapshot.stages {
        info!(
            stage = stage.as_str(),
            calls = metrics.calls,
            failures = metrics.failures,
            total_ms = metrics.total_duration_ms,
            max_ms = metrics.max_duration_ms,
            "Stage metrics"
        );
    }
}

impl MetricsSnapshot {
    pub fn to_prometheus(&self) -> String {
        let mut output = String::new();
        output.push_str("# HELP stagehand_stage_failures_total Stages that did not pass\n");
        output.push_str("# TYPE stagehand_stage_failures_total counter\n");
        let _ = writeln!(output, "stagehand_stage_failures_total {}", self.stage_failures);
        output.push_str(
            "# HELP stagehand_post_action_failures_total Post action commands that failed\n",
        );
        output.push_str("# TYPE stagehand_post_action_failures_total counter\n");
        let _ = writeln!(
            output,
            "stagehand_post_action_failures_total {}",
            self.post_action_failures
        );
        output.push_str("# HELP stagehand_stage_calls_total Stage invocation count\n");
        output.push_str("# TYPE stagehand_stage_calls_total counter\n");
        output.push_str(
            "# HELP stagehand_stage_duration_seconds_total Accumulated stage duration in seconds\n",
        );
        output.push_str("# TYPE stagehand_stage_duration_seconds_total counter\n");
        output.push_str(
            "# HELP stagehand_stage_duration_seconds_max Maximum stage duration in seconds\n",
        );
        output.push_str("# TYPE stagehand_stage_duration_seconds_max gauge\n");
        for (stage, metrics) in &self.stages {
            let label = escape_label(stage);
            let _ = writeln!(
                output,
                "stagehand_stage_calls_total{{stage=\"{label}\"}} {}",
                metrics.calls
            );
            let _ = writeln!(
                output,
                "stagehand_stage_duration_seconds_total{{stage=\"{label}\"}} {:.6}",
                metrics.total_duration_ms / 1_000.0
            );
            let _ = writeln!(
                output,
                "stagehand_stage_duration_seconds_max{{stage=\"{label}\"}} {:.6}",
                metrics.max_duration_ms / 1_000.0
            );
        }
        output.push_str("# HELP stagehand_pipeline_duration_seconds Total pipeline duration\n");
        output.push_str("# TYPE stagehand_pipeline_duration_seconds gauge\n");
        let _ = writeln!(
            output,
            "stagehand_pipeline_duration_seconds {:.6}",
            self.total_duration_ms / 1_000.0
        );
        if let Some(result) = self.result {
            output.push_str("# HELP stagehand_run_result Final result of the run\n");
            output.push_str("# TYPE stagehand_run_result gauge\n");
            let _ = writeln!(
                output,
                "stagehand_run_result{{result=\"{}\"}} 1",
                result.as_str()
            );
        }
        output
    }
}

fn escape_label(value: &str) -> String {
    value
        .replace('\\', "\\\\")
        .replace('"', "\\\"")
        .replace('\n', "\\n")
}
