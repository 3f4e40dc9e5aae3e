use std::collections::BTreeMap;
use std::fs;
use std::path::{Path, PathBuf};

use anyhow::{Context, Result};

use crate::pipeline::{ArtifactSpec, Pipeline, PostActions, ReportSpec, Stage};

pub const PRESETS: &[&str] = &["python", "rust"];

pub fn preset(name: &str) -> Result<Pipeline> {
    match name {
        "python" => Ok(python_preset()),
        "rust" => Ok(rust_preset()),
        other => anyhow::bail!(
            "Unknown preset '{other}'. Available presets: {}",
            PRESETS.join(", ")
        ),
    }
}

pub fn generate_preset(name: &str, destination: &Path) -> Result<PathBuf> {
    let pipeline = preset(name)?;

    let rendered = serde_yaml::to_string(&pipeline)?;
    if let Some(parent) = destination.parent()
        && !parent.as_os_str().is_empty()
    {
        fs::create_dir_all(parent)
            .with_context(|| format!("Failed to create directory: {}", parent.display()))?;
    }
    fs::write(destination, rendered)
        .with_context(|| format!("Failed to write preset pipeline: {}", destination.display()))?;

    Ok(destination.to_path_buf())
}

/// Virtualenv setup, pytest with JUnit and Cobertura output, archived
/// reports. Test failures mark the run unstable rather than failed.
fn python_preset() -> Pipeline {
    let mut pipeline = Pipeline::new(
        "python-ci",
        vec![
            Stage::new(
                "setup-environment",
                "python${PYTHON_VERSION} -m venv ${VENV_DIR}",
            ),
            Stage::new(
                "install-dependencies",
                ". ${VENV_DIR}/bin/activate && pip install --upgrade pip && pip install -r requirements.txt pytest pytest-cov",
            ),
            Stage::new(
                "run-tests",
                ". ${VENV_DIR}/bin/activate && mkdir -p ${REPORTS_DIR} && pytest --junitxml=${REPORTS_DIR}/junit.xml --cov=. --cov-report=xml:${REPORTS_DIR}/coverage.xml",
            )
            .best_effort(),
            Stage::new(
                "coverage-html",
                ". ${VENV_DIR}/bin/activate && coverage html -d ${REPORTS_DIR}/htmlcov",
            )
            .best_effort(),
        ],
    );
    pipeline.environment = vars(&[
        ("PYTHON_VERSION", "3"),
        ("VENV_DIR", "${WORKSPACE}/.venv"),
        ("REPORTS_DIR", "${WORKSPACE}/reports"),
    ]);
    pipeline.reports = Some(ReportSpec {
        junit: vec!["reports/junit.xml".into()],
        coverage: vec!["reports/coverage.xml".into()],
        ..ReportSpec::default()
    });
    pipeline.artifacts = vec![ArtifactSpec {
        patterns: vec!["reports/*.xml".into(), "reports/htmlcov/**/*".into()],
        allow_empty: true,
        fingerprint: true,
    }];
    pipeline.post = PostActions {
        always: vec!["echo \"Pipeline ${PIPELINE_NAME} finished: ${RUN_RESULT}\"".into()],
        success: vec!["echo 'All tests passed'".into()],
        failure: vec!["echo 'Build failed' >&2".into()],
        unstable: vec!["echo 'Some tests failed' >&2".into()],
        ..PostActions::default()
    };
    pipeline
}

fn rust_preset() -> Pipeline {
    let mut pipeline = Pipeline::new(
        "rust-ci",
        vec![
            Stage::new("fmt", "cargo fmt --all -- --check").best_effort(),
            Stage::new("build", "cargo build --locked ${CARGO_FLAGS}"),
            Stage::new("test", "cargo test --locked ${CARGO_FLAGS}"),
            Stage::new("clippy", "cargo clippy --locked -- -D warnings").best_effort(),
        ],
    );
    pipeline.environment = vars(&[("CARGO_FLAGS", "--all-targets")]);
    pipeline.timeout_secs = 1_800;
    pipeline.artifacts = vec![ArtifactSpec {
        patterns: vec!["target/release/*".into()],
        allow_empty: true,
        fingerprint: true,
    }];
    pipeline.post = PostActions {
        always: vec!["echo \"Pipeline ${PIPELINE_NAME} finished: ${RUN_RESULT}\"".into()],
        ..PostActions::default()
    };
    pipeline
}

fn vars(entries: &[(&str, &str)]) -> BTreeMap<String, String> {
    entries
        .iter()
        .map(|(k, v)| (k.to_string(), v.to_string()))
        .collect()
}
