use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::time::{Duration, Instant};

use chrono::Utc;
use tracing::{Instrument, error, info, info_span, instrument, warn};
use uuid::Uuid;

use crate::artifacts::{ArtifactCollector, ArtifactSet};
use crate::cancel::AbortSignal;
use crate::environment::{Environment, RUN_RESULT_VAR};
use crate::error::PipelineError;
use crate::observability::MetricsCollector;
use crate::outcome::{PostActionRecord, RunReport, RunResult, StageRecord, StageStatus, millis};
use crate::pipeline::{Pipeline, ReportSpec, Stage};
use crate::report::{CoverageSummary, TestSummary, collect_coverage, collect_junit};
use crate::runner::{CommandRequest, ProcessOutput, ProcessRunner, Shell, ShellRunner};

/// Per-run settings that do not come from the pipeline file.
#[derive(Debug, Clone)]
pub struct RunOptions {
    pub workspace: PathBuf,
    pub overrides: BTreeMap<String, String>,
    /// Replaces the pipeline's `timeout_secs` when set.
    pub timeout: Option<Duration>,
    pub run_id: Option<String>,
    pub abort: AbortSignal,
    pub metrics: MetricsCollector,
}

impl RunOptions {
    pub fn new(workspace: impl Into<PathBuf>) -> Self {
        Self {
            workspace: workspace.into(),
            overrides: BTreeMap::new(),
            timeout: None,
            run_id: None,
            abort: AbortSignal::new(),
            metrics: MetricsCollector::new(),
        }
    }

    pub fn with_var(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.overrides.insert(key.into(), value.into());
        self
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = Some(timeout);
        self
    }

    pub fn with_run_id(mut self, run_id: impl Into<String>) -> Self {
        self.run_id = Some(run_id.into());
        self
    }

    pub fn with_abort(mut self, abort: AbortSignal) -> Self {
        self.abort = abort;
        self
    }

    pub fn with_metrics(mut self, metrics: MetricsCollector) -> Self {
        self.metrics = metrics;
        self
    }
}

/// A stage as it would run, after variable substitution.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PlannedStage {
    pub name: String,
    pub command: String,
    pub best_effort: bool,
    pub working_dir: PathBuf,
    pub shell: Result<Shell, String>,
}

pub struct StageSequencer<R = ShellRunner> {
    runner: R,
    options: RunOptions,
}

impl StageSequencer<ShellRunner> {
    pub fn new(options: RunOptions) -> Self {
        Self::with_runner(ShellRunner::new(), options)
    }
}

impl<R: ProcessRunner> StageSequencer<R> {
    pub fn with_runner(runner: R, options: RunOptions) -> Self {
        Self { runner, options }
    }

    pub fn runner(&self) -> &R {
        &self.runner
    }

    pub fn options(&self) -> &RunOptions {
        &self.options
    }

    pub fn plan(&self, pipeline: &Pipeline) -> Vec<PlannedStage> {
        let env = self.environment(pipeline, "dry-run");
        pipeline
            .stages
            .iter()
            .map(|stage| {
                let stage_env = env.overlay(&stage.environment);
                PlannedStage {
                    name: stage.name.clone(),
                    command: stage_env.substitute(&stage.command),
                    best_effort: stage.best_effort,
                    working_dir: self.working_dir(stage, &stage_env),
                    shell: resolve_shell(stage.shell.as_deref().or(pipeline.shell.as_deref())),
                }
            })
            .collect()
    }

    /// Runs the pipeline to completion. Never fails: every problem is
    /// folded into the returned report.
    #[instrument(skip_all, fields(pipeline = %pipeline.name))]
    pub async fn run(&self, pipeline: &Pipeline) -> RunReport {
        let metrics = &self.options.metrics;
        metrics.reset();
        let started = Instant::now();
        let started_at = Utc::now();
        let run_id = self
            .options
            .run_id
            .clone()
            .unwrap_or_else(|| Uuid::new_v4().to_string());
        let env = self.environment(pipeline, &run_id);
        let budget = self.options.timeout.unwrap_or_else(|| pipeline.timeout());
        let deadline = started.checked_add(budget);
        info!(
            run_id = %run_id,
            stages = pipeline.stages.len(),
            budget_secs = budget.as_secs(),
            "Starting pipeline"
        );

        let mut records = Vec::with_capacity(pipeline.stages.len());
        let mut halt: Option<PipelineError> = None;
        for stage in &pipeline.stages {
            if let Some(reason) = self.check_before_stage(stage, deadline, budget) {
                halt = Some(reason);
                break;
            }
            let remaining = deadline.map(|at| at.saturating_duration_since(Instant::now()));
            let record = self.run_stage(pipeline, stage, &env, remaining).await;
            if record.status.is_failure() {
                metrics.record_stage_failure(&stage.name);
            }
            let stop = halt_reason(&record, budget);
            records.push(record);
            if let Some(err) = stop {
                error!(error = %err, "Stopping main sequence");
                halt = Some(err);
                break;
            }
        }
        let skipped: Vec<String> = pipeline.stages[records.len()..]
            .iter()
            .map(|stage| stage.name.clone())
            .collect();
        if !skipped.is_empty() {
            info!(skipped = ?skipped, "Remaining stages skipped");
        }

        let (tests, coverage, report_errors) = match &pipeline.reports {
            Some(spec) => self.collect_reports(spec, &env, &self.archive_root(pipeline)),
            None => (None, None, Vec::new()),
        };

        let abort_reason = self.options.abort.is_aborted().then(|| {
            self.options
                .abort
                .reason()
                .unwrap_or_else(|| "abort requested".to_string())
        });
        let (result, failure_reason) = finalize(
            abort_reason,
            halt.as_ref(),
            tests.as_ref(),
            coverage.as_ref(),
            pipeline.reports.as_ref(),
        );
        info!(result = %result, reason = ?failure_reason, "Run result decided");

        let (artifacts, archive_errors) = self.archive(pipeline, &env, &run_id);

        let post_env = env.overlay(&BTreeMap::from([(
            RUN_RESULT_VAR.to_string(),
            result.as_str().to_string(),
        )]));
        let post_actions = self.run_post_actions(pipeline, result, &post_env).await;

        let duration = started.elapsed();
        metrics.record_total_duration(duration);
        metrics.record_result(result);
        info!(
            result = %result,
            duration_ms = millis(duration),
            "Pipeline finished"
        );

        RunReport {
            pipeline: pipeline.name.clone(),
            run_id,
            started_at,
            result,
            failure_reason,
            stages: records,
            skipped,
            tests,
            coverage,
            report_errors,
            artifacts,
            archive_errors,
            post_actions,
            duration_ms: millis(duration),
        }
    }

    fn environment(&self, pipeline: &Pipeline, run_id: &str) -> Environment {
        Environment::resolve(
            &self.options.workspace,
            run_id,
            &pipeline.name,
            &pipeline.environment,
            &self.options.overrides,
        )
    }

    /// Shared by every run; excluded from report and artifact globs.
    fn archive_root(&self, pipeline: &Pipeline) -> PathBuf {
        self.options.workspace.join(&pipeline.archive_dir)
    }

    fn working_dir(&self, stage: &Stage, env: &Environment) -> PathBuf {
        match &stage.working_dir {
            Some(dir) => self
                .options
                .workspace
                .join(env.substitute(&dir.to_string_lossy())),
            None => self.options.workspace.clone(),
        }
    }

    fn check_before_stage(
        &self,
        stage: &Stage,
        deadline: Option<Instant>,
        budget: Duration,
    ) -> Option<PipelineError> {
        if self.options.abort.is_aborted() {
            return Some(PipelineError::AbortRequested {
                stage: stage.name.clone(),
            });
        }
        if let Some(at) = deadline
            && Instant::now() >= at
        {
            return Some(PipelineError::TimeoutExceeded {
                stage: stage.name.clone(),
                budget_secs: budget.as_secs(),
            });
        }
        None
    }

    async fn run_stage(
        &self,
        pipeline: &Pipeline,
        stage: &Stage,
        env: &Environment,
        remaining: Option<Duration>,
    ) -> StageRecord {
        let span = info_span!("stage", stage = %stage.name);
        async {
            let stage_env = env.overlay(&stage.environment);
            let shell = match resolve_shell(stage.shell.as_deref().or(pipeline.shell.as_deref())) {
                Ok(shell) => shell,
                Err(reason) => {
                    error!(%reason, "Cannot start stage");
                    let output = ProcessOutput::spawn_failed(reason);
                    let status = classify(&output, stage.best_effort);
                    return StageRecord::from_output(
                        &stage.name,
                        stage.best_effort,
                        status,
                        &output,
                    );
                }
            };
            let request = CommandRequest {
                label: stage.name.clone(),
                script: stage_env.substitute(&stage.command),
                shell,
                working_dir: self.working_dir(stage, &stage_env),
                env: stage_env.vars().clone(),
                timeout: remaining,
            };

            info!(best_effort = stage.best_effort, "Starting stage");
            let output = {
                let _timer = self.options.metrics.start_stage(&stage.name);
                self.runner.execute(&request, &self.options.abort).await
            };
            let status = classify(&output, stage.best_effort);
            let duration_ms = millis(output.duration);
            match status {
                StageStatus::Passed => info!(duration_ms, "Stage passed"),
                StageStatus::TolerantFailure => warn!(
                    exit_code = ?output.exit_code,
                    error = ?output.spawn_error,
                    duration_ms,
                    "Best-effort stage failed, continuing"
                ),
                _ => error!(
                    status = ?status,
                    exit_code = ?output.exit_code,
                    error = ?output.spawn_error,
                    duration_ms,
                    "Stage failed"
                ),
            }
            StageRecord::from_output(&stage.name, stage.best_effort, status, &output)
        }
        .instrument(span)
        .await
    }

    fn collect_reports(
        &self,
        spec: &ReportSpec,
        env: &Environment,
        archive_root: &Path,
    ) -> (Option<TestSummary>, Option<CoverageSummary>, Vec<String>) {
        let workspace = &self.options.workspace;
        let excluded = [archive_root.to_path_buf()];
        let mut errors = Vec::new();

        let junit: Vec<String> = spec.junit.iter().map(|p| env.substitute(p)).collect();
        let tests = if junit.is_empty() {
            None
        } else {
            let collected = collect_junit(workspace, &junit, &excluded);
            errors.extend(collected.errors.iter().map(ToString::to_string));
            if let Some(summary) = &collected.summary {
                info!(
                    passed = summary.passed,
                    failed = summary.failed,
                    errored = summary.errored,
                    skipped = summary.skipped,
                    "Test results"
                );
            }
            collected.summary
        };

        let coverage_patterns: Vec<String> =
            spec.coverage.iter().map(|p| env.substitute(p)).collect();
        let coverage = if coverage_patterns.is_empty() {
            None
        } else {
            let collected = collect_coverage(workspace, &coverage_patterns, &excluded);
            errors.extend(collected.errors.iter().map(ToString::to_string));
            if let Some(summary) = &collected.summary {
                info!(line_percent = summary.line_percent(), "Coverage results");
            }
            collected.summary
        };

        (tests, coverage, errors)
    }

    fn archive(
        &self,
        pipeline: &Pipeline,
        env: &Environment,
        run_id: &str,
    ) -> (ArtifactSet, Vec<String>) {
        let mut artifacts = ArtifactSet::default();
        let mut errors = Vec::new();
        if pipeline.artifacts.is_empty() {
            return (artifacts, errors);
        }

        let archive_root = self.archive_root(pipeline);
        let collector =
            ArtifactCollector::new(self.options.workspace.clone(), archive_root.join(run_id))
                .excluding(archive_root);
        for spec in &pipeline.artifacts {
            let patterns: Vec<String> = spec.patterns.iter().map(|p| env.substitute(p)).collect();
            match collector.archive(&patterns, spec.allow_empty, spec.fingerprint) {
                Ok(set) => artifacts.merge(set),
                Err(err) => {
                    warn!(error = %err, "Artifact archiving failed");
                    errors.push(err.to_string());
                }
            }
        }
        if !artifacts.is_empty() {
            info!(
                destination = %collector.destination().display(),
                files = artifacts.file_count(),
                "Artifacts stored"
            );
        }
        (artifacts, errors)
    }

    async fn run_post_actions(
        &self,
        pipeline: &Pipeline,
        result: RunResult,
        env: &Environment,
    ) -> Vec<PostActionRecord> {
        // post actions must run to completion even after an abort
        let abort = AbortSignal::new();
        let mut records = Vec::new();
        let slots = [
            ("always", pipeline.post.always.as_slice()),
            (result.as_str(), pipeline.post.branch(result)),
        ];
        for (slot, commands) in slots {
            for command in commands {
                let record = self
                    .run_post_action(pipeline, slot, command, env, &abort)
                    .await;
                records.push(record);
            }
        }
        records
    }

    async fn run_post_action(
        &self,
        pipeline: &Pipeline,
        slot: &str,
        command: &str,
        env: &Environment,
        abort: &AbortSignal,
    ) -> PostActionRecord {
        let output = match resolve_shell(pipeline.shell.as_deref()) {
            Ok(shell) => {
                let request = CommandRequest {
                    label: format!("post:{slot}"),
                    script: env.substitute(command),
                    shell,
                    working_dir: self.options.workspace.clone(),
                    env: env.vars().clone(),
                    timeout: Some(pipeline.post_timeout()),
                };
                self.runner.execute(&request, abort).await
            }
            Err(reason) => ProcessOutput::spawn_failed(reason),
        };

        let error = post_action_error(&output, pipeline.post_timeout());
        if let Some(reason) = &error {
            let err = PipelineError::PostActionError {
                command: command.to_string(),
                reason: reason.clone(),
            };
            warn!(slot, error = %err, "Post action failed");
            self.options.metrics.record_post_action_failure();
        }
        PostActionRecord {
            slot: slot.to_string(),
            command: command.to_string(),
            exit_code: output.exit_code,
            duration_ms: millis(output.duration),
            error,
        }
    }
}

fn resolve_shell(name: Option<&str>) -> Result<Shell, String> {
    name.map_or(Ok(Shell::default()), |name| name.parse())
}

fn classify(output: &ProcessOutput, best_effort: bool) -> StageStatus {
    if output.aborted {
        StageStatus::Aborted
    } else if output.timed_out {
        StageStatus::TimedOut
    } else if output.success() {
        StageStatus::Passed
    } else if best_effort {
        StageStatus::TolerantFailure
    } else if output.spawn_error.is_some() {
        StageStatus::SpawnError
    } else {
        StageStatus::Failed
    }
}

fn halt_reason(record: &StageRecord, budget: Duration) -> Option<PipelineError> {
    let stage = record.name.clone();
    match record.status {
        StageStatus::Passed | StageStatus::TolerantFailure => None,
        StageStatus::Failed => Some(match record.exit_code {
            Some(code) => PipelineError::StageFailure { stage, code },
            None => PipelineError::StageTerminated { stage },
        }),
        StageStatus::SpawnError => Some(PipelineError::SpawnFailure {
            stage,
            reason: record.error.clone().unwrap_or_default(),
        }),
        StageStatus::TimedOut => Some(PipelineError::TimeoutExceeded {
            stage,
            budget_secs: budget.as_secs(),
        }),
        StageStatus::Aborted => Some(PipelineError::AbortRequested { stage }),
    }
}

fn finalize(
    abort_reason: Option<String>,
    halt: Option<&PipelineError>,
    tests: Option<&TestSummary>,
    coverage: Option<&CoverageSummary>,
    reports: Option<&ReportSpec>,
) -> (RunResult, Option<String>) {
    if let Some(reason) = abort_reason {
        let detail = match halt {
            Some(err @ PipelineError::AbortRequested { .. }) => format!("{err} ({reason})"),
            _ => format!("run aborted ({reason})"),
        };
        return (RunResult::Aborted, Some(detail));
    }
    if let Some(err) = halt {
        return (RunResult::Failure, Some(err.to_string()));
    }
    if let Some(tests) = tests
        && tests.has_failures()
    {
        let policy = reports.map(|spec| spec.failing_tests).unwrap_or_default();
        return (
            policy.result(),
            Some(format!(
                "{} failed and {} errored test case(s)",
                tests.failed, tests.errored
            )),
        );
    }
    if let Some(min_line_rate) = reports.and_then(|spec| spec.min_line_rate)
        && let Some(coverage) = coverage
        && coverage.line_rate < min_line_rate
    {
        return (
            RunResult::Unstable,
            Some(format!(
                "line coverage {:.1}% is below the required {:.1}%",
                coverage.line_percent(),
                min_line_rate * 100.0
            )),
        );
    }
    (RunResult::Success, None)
}

fn post_action_error(output: &ProcessOutput, budget: Duration) -> Option<String> {
    if output.success() {
        return None;
    }
    Some(if let Some(reason) = &output.spawn_error {
        reason.clone()
    } else if output.timed_out {
        format!("timed out after {}s", budget.as_secs())
    } else {
        match output.exit_code {
            Some(code) => format!("exited with code {code}"),
            None => "terminated by signal".to_string(),
        }
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    fn failing_tests() -> TestSummary {
        TestSummary {
            files: 1,
            passed: 3,
            failed: 1,
            ..TestSummary::default()
        }
    }

    #[test]
    fn abort_outranks_stage_failure() {
        let halt = PipelineError::StageFailure {
            stage: "build".into(),
            code: 2,
        };
        let (result, _) = finalize(Some("ctrl-c".into()), Some(&halt), None, None, None);
        assert_eq!(result, RunResult::Aborted);
    }

    #[test]
    fn failing_tests_follow_policy() {
        let tests = failing_tests();
        let (result, _) = finalize(None, None, Some(&tests), None, None);
        assert_eq!(result, RunResult::Unstable);

        let strict = ReportSpec {
            failing_tests: crate::pipeline::FailingTestsPolicy::Failure,
            ..ReportSpec::default()
        };
        let (result, reason) = finalize(None, None, Some(&tests), None, Some(&strict));
        assert_eq!(result, RunResult::Failure);
        assert!(reason.unwrap().contains("1 failed"));
    }

    #[test]
    fn coverage_gate_marks_unstable() {
        let coverage = CoverageSummary {
            files: 1,
            line_rate: 0.5,
            branch_rate: None,
            lines_covered: Some(5),
            lines_valid: Some(10),
        };
        let spec = ReportSpec {
            min_line_rate: Some(0.8),
            ..ReportSpec::default()
        };
        let (result, reason) = finalize(None, None, None, Some(&coverage), Some(&spec));
        assert_eq!(result, RunResult::Unstable);
        assert!(reason.unwrap().contains("50.0%"));
    }

    #[test]
    fn signal_termination_has_its_own_reason() {
        let output = ProcessOutput {
            exit_code: None,
            ..ProcessOutput::default()
        };
        let record = StageRecord::from_output("serve", false, StageStatus::Failed, &output);
        let err = halt_reason(&record, Duration::from_secs(60)).unwrap();
        assert!(matches!(err, PipelineError::StageTerminated { .. }));
        assert_eq!(err.to_string(), "stage 'serve' was terminated by a signal");
    }

    #[test]
    fn best_effort_spawn_error_is_tolerated() {
        let output = ProcessOutput::spawn_failed("no shell");
        assert_eq!(classify(&output, true), StageStatus::TolerantFailure);
        assert_eq!(classify(&output, false), StageStatus::SpawnError);
    }
}
