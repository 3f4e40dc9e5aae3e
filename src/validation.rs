use std::collections::{BTreeSet, HashSet};

use serde::Serialize;

use crate::environment::{
    PIPELINE_NAME_VAR, RUN_ID_VAR, RUN_RESULT_VAR, WORKSPACE_VAR, references,
};
use crate::pipeline::Pipeline;
use crate::runner::Shell;

#[derive(Debug, Default, Serialize)]
pub struct ValidationReport {
    pub errors: Vec<String>,
    pub warnings: Vec<String>,
}

impl ValidationReport {
    pub fn is_ok(&self) -> bool {
        self.errors.is_empty()
    }

    pub fn merge(&mut self, other: ValidationReport) {
        self.errors.extend(other.errors);
        self.warnings.extend(other.warnings);
    }
}

/// Static checks over a loaded pipeline. `known_vars` lists variables that
/// will be supplied at run time (for example `--var` overrides).
pub fn validate_pipeline(pipeline: &Pipeline, known_vars: &[String]) -> ValidationReport {
    let mut report = ValidationReport::default();

    if pipeline.version != 1 {
        report
            .errors
            .push(format!("Unsupported pipeline version: {}", pipeline.version));
    }

    if pipeline.name.trim().is_empty() {
        report.errors.push("Pipeline name cannot be empty".into());
    }

    if pipeline.timeout_secs == 0 {
        report
            .errors
            .push("timeout_secs must be greater than zero".into());
    }
    if pipeline.post_timeout_secs == 0 {
        report
            .errors
            .push("post_timeout_secs must be greater than zero".into());
    }

    if let Some(shell) = &pipeline.shell
        && let Err(err) = shell.parse::<Shell>()
    {
        report.errors.push(format!("Pipeline {err}"));
    }

    if pipeline.stages.is_empty() {
        report
            .errors
            .push("Pipeline must contain at least one stage".into());
    }

    let mut seen = HashSet::new();
    for (idx, stage) in pipeline.stages.iter().enumerate() {
        let label = format!("Stage {} ('{}')", idx + 1, stage.name);
        if stage.name.trim().is_empty() {
            report
                .errors
                .push(format!("Stage {} has an empty name", idx + 1));
        } else if !seen.insert(stage.name.as_str()) {
            report
                .errors
                .push(format!("{label}: duplicate stage name"));
        }
        if stage.command.trim().is_empty() {
            report.errors.push(format!("{label}: command cannot be empty"));
        }
        if let Some(shell) = &stage.shell
            && let Err(err) = shell.parse::<Shell>()
        {
            report.errors.push(format!("{label}: {err}"));
        }
        if let Some(dir) = &stage.working_dir
            && dir.is_absolute()
        {
            report.warnings.push(format!(
                "{label}: working_dir '{}' is absolute and escapes the workspace",
                dir.display()
            ));
        }
    }

    for (slot, commands) in pipeline.post.slots() {
        for command in commands {
            if command.trim().is_empty() {
                report
                    .errors
                    .push(format!("Post action in '{slot}' cannot be empty"));
            }
        }
    }

    report.merge(validate_patterns(pipeline));
    report.merge(validate_references(pipeline, known_vars));

    report
}

fn validate_patterns(pipeline: &Pipeline) -> ValidationReport {
    let mut report = ValidationReport::default();

    let mut check = |kind: &str, pattern: &str| {
        if pattern.trim().is_empty() {
            report.errors.push(format!("{kind} pattern cannot be empty"));
        } else if let Err(err) = glob::Pattern::new(pattern) {
            report.errors.push(format!(
                "{kind} pattern '{pattern}' is not a valid glob: {err}"
            ));
        }
    };

    for (idx, spec) in pipeline.artifacts.iter().enumerate() {
        if spec.patterns.is_empty() {
            check(&format!("Artifact entry {}", idx + 1), "");
        }
        for pattern in &spec.patterns {
            check("Artifact", pattern);
        }
    }

    if let Some(reports) = &pipeline.reports {
        for pattern in &reports.junit {
            check("JUnit report", pattern);
        }
        for pattern in &reports.coverage {
            check("Coverage report", pattern);
        }
        if let Some(rate) = reports.min_line_rate
            && !(0.0..=1.0).contains(&rate)
        {
            report.errors.push(format!(
                "min_line_rate must be between 0.0 and 1.0, got {rate}"
            ));
        }
        if reports.min_line_rate.is_some() && reports.coverage.is_empty() {
            report
                .warnings
                .push("min_line_rate is set but no coverage reports are configured".into());
        }
    }

    report
}

/// Undefined `${NAME}` references only warn: the shell may still resolve
/// them from the inherited environment.
fn validate_references(pipeline: &Pipeline, known_vars: &[String]) -> ValidationReport {
    let mut report = ValidationReport::default();

    let mut defined: BTreeSet<&str> = [WORKSPACE_VAR, RUN_ID_VAR, PIPELINE_NAME_VAR]
        .into_iter()
        .collect();
    defined.extend(pipeline.environment.keys().map(String::as_str));
    defined.extend(known_vars.iter().map(String::as_str));

    let mut warn_undefined = |context: &str, text: &str, extra: &BTreeSet<&str>| {
        for name in references(text) {
            if !defined.contains(name.as_str()) && !extra.contains(name.as_str()) {
                report.warnings.push(format!(
                    "{context} references undefined variable '${{{name}}}'"
                ));
            }
        }
    };

    let none = BTreeSet::new();
    for value in pipeline.environment.values() {
        warn_undefined("Pipeline environment", value, &none);
    }
    for stage in &pipeline.stages {
        let local: BTreeSet<&str> = stage.environment.keys().map(String::as_str).collect();
        let context = format!("Stage '{}'", stage.name);
        warn_undefined(&context, &stage.command, &local);
        for value in stage.environment.values() {
            warn_undefined(&context, value, &local);
        }
    }

    let post_only: BTreeSet<&str> = [RUN_RESULT_VAR].into_iter().collect();
    for (slot, commands) in pipeline.post.slots() {
        for command in commands {
            warn_undefined(&format!("Post action in '{slot}'"), command, &post_only);
        }
    }

    report
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn merge_keeps_both_sides() {
        let mut report = ValidationReport {
            errors: vec!["a".into()],
            warnings: vec![],
        };
        report.merge(ValidationReport {
            errors: vec!["b".into()],
            warnings: vec!["w".into()],
        });
        assert_eq!(report.errors.len(), 2);
        assert_eq!(report.warnings.len(), 1);
        assert!(!report.is_ok());
    }
}
