use std::collections::BTreeMap;
use std::env;
use std::fs::{self, File};
use std::path::{Path, PathBuf};
use std::process::ExitCode;
use std::time::Duration;

use anyhow::{Context, Result, anyhow, bail};
use clap::{Parser, Subcommand, ValueHint};
use serde_json::to_writer_pretty;
use stagehand::cancel::AbortSignal;
use stagehand::observability::{MetricsCollector, log_snapshot};
use stagehand::outcome::{RunReport, RunResult};
use stagehand::pipeline::Pipeline;
use stagehand::presets::generate_preset;
use stagehand::report::{collect_coverage, collect_junit};
use stagehand::sequencer::{RunOptions, StageSequencer};
use stagehand::validation::validate_pipeline;
use tracing::{error, info, warn};
use tracing_subscriber::{EnvFilter, prelude::*};

fn main() -> Result<ExitCode> {
    let cli = Cli::parse();
    configure_tracing()?;

    match cli.command {
        Commands::Run {
            pipeline,
            workspace,
            vars,
            timeout_secs,
            dry_run,
            summary_json,
            metrics_json,
            metrics_prometheus,
            print_metrics,
        } => run_pipeline(RunArgs {
            pipeline,
            workspace,
            vars: vars.into_iter().collect(),
            timeout: timeout_secs.map(Duration::from_secs),
            dry_run,
            summary_json,
            metrics_json,
            metrics_prometheus,
            print_metrics,
        }),
        Commands::Validate { pipelines } => {
            validate_pipelines(&pipelines).map(|_| ExitCode::SUCCESS)
        }
        Commands::Init {
            preset,
            output,
            force,
        } => init_pipeline(&preset, output, force).map(|_| ExitCode::SUCCESS),
        Commands::Report {
            junit,
            coverage,
            base,
        } => summarize_reports(&junit, &coverage, &base),
    }
}

fn configure_tracing() -> Result<()> {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));

    tracing_subscriber::registry()
        .with(filter)
        .with(tracing_subscriber::fmt::layer().with_writer(std::io::stderr))
        .try_init()
        .map_err(|err| anyhow!(err.to_string()))?;

    Ok(())
}

struct RunArgs {
    pipeline: PathBuf,
    workspace: Option<PathBuf>,
    vars: BTreeMap<String, String>,
    timeout: Option<Duration>,
    dry_run: bool,
    summary_json: Option<PathBuf>,
    metrics_json: Option<PathBuf>,
    metrics_prometheus: Option<PathBuf>,
    print_metrics: bool,
}

fn run_pipeline(args: RunArgs) -> Result<ExitCode> {
    let pipeline = Pipeline::load(&args.pipeline)?;
    let known_vars: Vec<String> = args.vars.keys().cloned().collect();
    let report = validate_pipeline(&pipeline, &known_vars);
    for warning in &report.warnings {
        warn!(file = %args.pipeline.display(), "{warning}");
    }
    if !report.is_ok() {
        for error_msg in &report.errors {
            error!(file = %args.pipeline.display(), "{error_msg}");
        }
        bail!(
            "Pipeline validation failed with {} error(s)",
            report.errors.len()
        );
    }

    let workspace = resolve_workspace(args.workspace)?;
    let abort = AbortSignal::new();
    let metrics = MetricsCollector::new();
    let mut options = RunOptions::new(workspace)
        .with_abort(abort.clone())
        .with_metrics(metrics.clone());
    options.overrides = args.vars;
    options.timeout = args.timeout;
    let sequencer = StageSequencer::new(options);

    if args.dry_run {
        println!(
            "Pipeline '{}' ({} stage(s), timeout {}s)",
            pipeline.name,
            pipeline.stages.len(),
            args.timeout.map_or(pipeline.timeout_secs, |t| t.as_secs())
        );
        for (idx, stage) in sequencer.plan(&pipeline).iter().enumerate() {
            let marker = if stage.best_effort { " (best effort)" } else { "" };
            println!("{:>2}. {}{marker}", idx + 1, stage.name);
            println!("    cwd: {}", stage.working_dir.display());
            match &stage.shell {
                Ok(shell) => println!("    {}: {}", shell.name(), stage.command),
                Err(err) => println!("    {err}"),
            }
        }
        return Ok(ExitCode::SUCCESS);
    }

    let runtime = tokio::runtime::Builder::new_current_thread()
        .enable_all()
        .build()
        .context("Failed to start async runtime")?;
    let run_report = runtime.block_on(async {
        let signal = abort.clone();
        tokio::spawn(async move {
            if tokio::signal::ctrl_c().await.is_ok() {
                warn!("Interrupt received, aborting run");
                signal.abort("interrupted");
            }
        });
        sequencer.run(&pipeline).await
    });

    print_summary(&run_report);

    if let Some(path) = &args.summary_json {
        write_json(path, &run_report)?;
        info!(summary = %path.display(), "Run summary written");
    }

    if args.print_metrics || args.metrics_json.is_some() || args.metrics_prometheus.is_some() {
        let snapshot = metrics.snapshot();
        if args.print_metrics {
            log_snapshot(&snapshot);
        }
        if let Some(path) = &args.metrics_json {
            write_json(path, &snapshot)?;
            info!(metrics = %path.display(), "Metrics JSON written");
        }
        if let Some(path) = &args.metrics_prometheus {
            ensure_parent(path)?;
            fs::write(path, snapshot.to_prometheus()).with_context(|| {
                format!("Failed to write Prometheus metrics: {}", path.display())
            })?;
            info!(metrics = %path.display(), "Prometheus metrics written");
        }
    }

    Ok(exit_code(run_report.result))
}

fn resolve_workspace(workspace: Option<PathBuf>) -> Result<PathBuf> {
    let current = env::current_dir().context("Failed to determine current directory")?;
    let path = match workspace {
        Some(dir) if dir.is_absolute() => dir,
        Some(dir) => current.join(dir),
        None => current,
    };
    if !path.is_dir() {
        bail!("Workspace '{}' is not a directory", path.display());
    }
    path.canonicalize()
        .with_context(|| format!("Failed to resolve workspace: {}", path.display()))
}

fn print_summary(report: &RunReport) {
    println!(
        "Pipeline '{}' finished: {} ({:.1}s)",
        report.pipeline,
        report.result.as_str().to_uppercase(),
        report.duration_ms / 1_000.0
    );
    for stage in &report.stages {
        println!(
            "  [{}] {} ({:.1}s)",
            stage.status.as_str(),
            stage.name,
            stage.duration_ms / 1_000.0
        );
    }
    for name in &report.skipped {
        println!("  [skipped] {name}");
    }
    if let Some(tests) = &report.tests {
        println!(
            "  tests: {} passed, {} failed, {} errored, {} skipped",
            tests.passed, tests.failed, tests.errored, tests.skipped
        );
    }
    if let Some(coverage) = &report.coverage {
        println!("  line coverage: {:.1}%", coverage.line_percent());
    }
    if !report.artifacts.is_empty() {
        println!("  artifacts: {} file(s)", report.artifacts.file_count());
    }
    let post_failures = report.post_failures().count();
    if post_failures > 0 {
        println!("  post actions failed: {post_failures}");
    }
    if let Some(reason) = &report.failure_reason {
        println!("  reason: {reason}");
    }
}

fn validate_pipelines(pipelines: &[PathBuf]) -> Result<()> {
    if pipelines.is_empty() {
        bail!("No pipeline files supplied for validation");
    }

    let mut failures = 0usize;
    for path in pipelines {
        match Pipeline::load(path) {
            Ok(pipeline) => {
                let report = validate_pipeline(&pipeline, &[]);
                for warning in &report.warnings {
                    warn!(file = %path.display(), "{warning}");
                }
                if report.is_ok() {
                    info!(file = %path.display(), "Pipeline validation passed");
                } else {
                    failures += 1;
                    for error_msg in &report.errors {
                        error!(file = %path.display(), "{error_msg}");
                    }
                }
            }
            Err(err) => {
                failures += 1;
                error!(file = %path.display(), "Failed to load pipeline: {err:#}");
            }
        }
    }

    if failures > 0 {
        bail!("Validation failed for {failures} pipeline(s)");
    }
    Ok(())
}

fn init_pipeline(preset: &str, output: Option<PathBuf>, force: bool) -> Result<()> {
    let destination = output.unwrap_or_else(|| PathBuf::from(format!("pipelines/{preset}.yaml")));
    if destination.exists() && !force {
        bail!(
            "Refusing to overwrite existing file '{}' (use --force)",
            destination.display()
        );
    }
    let generated = generate_preset(preset, &destination)?;
    info!(
        preset = %preset,
        path = %generated.display(),
        "Preset pipeline generated"
    );
    Ok(())
}

fn summarize_reports(junit: &[String], coverage: &[String], base: &Path) -> Result<ExitCode> {
    if junit.is_empty() && coverage.is_empty() {
        bail!("Supply at least one --junit or --coverage pattern");
    }

    let tests = collect_junit(base, junit, &[]);
    let coverage = collect_coverage(base, coverage, &[]);
    for err in tests.errors.iter().chain(coverage.errors.iter()) {
        warn!("{err}");
    }
    if tests.summary.is_none() && coverage.summary.is_none() {
        bail!("No readable reports matched under {}", base.display());
    }

    let mut result = RunResult::Success;
    if let Some(summary) = &tests.summary {
        println!(
            "tests: {} passed, {} failed, {} errored, {} skipped ({} file(s))",
            summary.passed, summary.failed, summary.errored, summary.skipped, summary.files
        );
        for case in &summary.failing_cases {
            println!("  failing: {case}");
        }
        if summary.has_failures() {
            result = RunResult::Unstable;
        }
    }
    if let Some(summary) = &coverage.summary {
        match summary.branch_rate {
            Some(branch) => println!(
                "coverage: {:.1}% lines, {:.1}% branches ({} file(s))",
                summary.line_percent(),
                branch * 100.0,
                summary.files
            ),
            None => println!(
                "coverage: {:.1}% lines ({} file(s))",
                summary.line_percent(),
                summary.files
            ),
        }
    }

    Ok(exit_code(result))
}

fn exit_code(result: RunResult) -> ExitCode {
    ExitCode::from(u8::try_from(result.exit_code()).unwrap_or(1))
}

fn ensure_parent(path: &Path) -> Result<()> {
    if let Some(parent) = path.parent()
        && !parent.as_os_str().is_empty()
    {
        fs::create_dir_all(parent)
            .with_context(|| format!("Failed to create directory: {}", parent.display()))?;
    }
    Ok(())
}

fn write_json<T: serde::Serialize>(path: &Path, value: &T) -> Result<()> {
    ensure_parent(path)?;
    let file =
        File::create(path).with_context(|| format!("Failed to create file: {}", path.display()))?;
    to_writer_pretty(file, value)
        .with_context(|| format!("Failed to write JSON: {}", path.display()))
}

fn parse_var(raw: &str) -> Result<(String, String), String> {
    let (key, value) = raw
        .split_once('=')
        .ok_or_else(|| format!("expected NAME=VALUE, got '{raw}'"))?;
    let key = key.trim();
    if key.is_empty() {
        return Err(format!("variable name missing in '{raw}'"));
    }
    Ok((key.to_string(), value.to_string()))
}

#[derive(Parser)]
#[command(
    name = "stagehand",
    version,
    about = "Runs sequential CI pipelines defined in YAML"
)]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Execute a pipeline in a workspace.
    Run {
        #[arg(value_hint = ValueHint::FilePath)]
        pipeline: PathBuf,
        #[arg(long, env = "STAGEHAND_WORKSPACE", value_hint = ValueHint::DirPath)]
        workspace: Option<PathBuf>,
        #[arg(long = "var", value_name = "NAME=VALUE", value_parser = parse_var)]
        vars: Vec<(String, String)>,
        #[arg(long = "timeout-secs", env = "STAGEHAND_TIMEOUT_SECS")]
        timeout_secs: Option<u64>,
        #[arg(long)]
        dry_run: bool,
        #[arg(long = "summary-json")]
        summary_json: Option<PathBuf>,
        #[arg(long = "metrics-json")]
        metrics_json: Option<PathBuf>,
        #[arg(long = "metrics-prometheus")]
        metrics_prometheus: Option<PathBuf>,
        #[arg(long)]
        print_metrics: bool,
    },
    /// Check pipeline files without running them.
    Validate {
        #[arg(required = true)]
        pipelines: Vec<PathBuf>,
    },
    /// Write a starter pipeline.
    Init {
        #[arg(long, value_parser = ["python", "rust"])]
        preset: String,
        #[arg(long)]
        output: Option<PathBuf>,
        #[arg(long)]
        force: bool,
    },
    /// Summarise JUnit and Cobertura reports.
    Report {
        #[arg(long)]
        junit: Vec<String>,
        #[arg(long)]
        coverage: Vec<String>,
        #[arg(long, default_value = ".", value_hint = ValueHint::DirPath)]
        base: PathBuf,
    },
}
