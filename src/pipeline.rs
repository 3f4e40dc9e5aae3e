use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};

use crate::outcome::RunResult;

const DEFAULT_TIMEOUT_SECS: u64 = 3_600;
const DEFAULT_POST_TIMEOUT_SECS: u64 = 600;

/// A pipeline definition as loaded from YAML. Stage order in the file is
/// execution order.
#[derive(Debug, Clone, PartialEq, Deserialize, Serialize)]
pub struct Pipeline {
    pub version: u32,
    #[serde(default = "default_name")]
    pub name: String,
    #[serde(default = "default_timeout_secs")]
    pub timeout_secs: u64,
    #[serde(default = "default_post_timeout_secs")]
    pub post_timeout_secs: u64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub shell: Option<String>,
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub environment: BTreeMap<String, String>,
    pub stages: Vec<Stage>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub reports: Option<ReportSpec>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub artifacts: Vec<ArtifactSpec>,
    #[serde(default, skip_serializing_if = "PostActions::is_empty")]
    pub post: PostActions,
    #[serde(default = "default_archive_dir")]
    pub archive_dir: PathBuf,
}

fn default_name() -> String {
    "pipeline".to_string()
}

fn default_timeout_secs() -> u64 {
    DEFAULT_TIMEOUT_SECS
}

fn default_post_timeout_secs() -> u64 {
    DEFAULT_POST_TIMEOUT_SECS
}

fn default_archive_dir() -> PathBuf {
    PathBuf::from(".stagehand/archive")
}

impl Pipeline {
    pub fn new(name: impl Into<String>, stages: Vec<Stage>) -> Self {
        Self {
            version: 1,
            name: name.into(),
            timeout_secs: DEFAULT_TIMEOUT_SECS,
            post_timeout_secs: DEFAULT_POST_TIMEOUT_SECS,
            shell: None,
            environment: BTreeMap::new(),
            stages,
            reports: None,
            artifacts: Vec::new(),
            post: PostActions::default(),
            archive_dir: default_archive_dir(),
        }
    }

    pub fn load(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read pipeline file: {}", path.display()))?;
        Self::from_yaml(&content)
            .with_context(|| format!("Failed to parse pipeline YAML: {}", path.display()))
    }

    pub fn from_yaml(content: &str) -> Result<Self> {
        Ok(serde_yaml::from_str(content)?)
    }

    pub fn timeout(&self) -> Duration {
        Duration::from_secs(self.timeout_secs)
    }

    pub fn post_timeout(&self) -> Duration {
        Duration::from_secs(self.post_timeout_secs)
    }

    pub fn stage(&self, name: &str) -> Option<&Stage> {
        self.stages.iter().find(|stage| stage.name == name)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Deserialize, Serialize)]
pub struct Stage {
    pub name: String,
    pub command: String,
    /// A failing best-effort stage is recorded but does not stop the run.
    #[serde(default, skip_serializing_if = "std::ops::Not::not")]
    pub best_effort: bool,
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub environment: BTreeMap<String, String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub working_dir: Option<PathBuf>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub shell: Option<String>,
}

impl Stage {
    pub fn new(name: impl Into<String>, command: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            command: command.into(),
            best_effort: false,
            environment: BTreeMap::new(),
            working_dir: None,
            shell: None,
        }
    }

    pub fn best_effort(mut self) -> Self {
        self.best_effort = true;
        self
    }

    pub fn with_env(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.environment.insert(key.into(), value.into());
        self
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Deserialize, Serialize)]
pub struct PostActions {
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub always: Vec<String>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub success: Vec<String>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub failure: Vec<String>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub unstable: Vec<String>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub aborted: Vec<String>,
}

impl PostActions {
    /// Commands for the outcome-specific slot. Exactly one slot applies to
    /// any run result.
    pub fn branch(&self, result: RunResult) -> &[String] {
        match result {
            RunResult::Success => &self.success,
            RunResult::Unstable => &self.unstable,
            RunResult::Failure => &self.failure,
            RunResult::Aborted => &self.aborted,
        }
    }

    pub fn is_empty(&self) -> bool {
        self.always.is_empty()
            && self.success.is_empty()
            && self.failure.is_empty()
            && self.unstable.is_empty()
            && self.aborted.is_empty()
    }

    pub(crate) fn slots(&self) -> [(&'static str, &[String]); 5] {
        [
            ("always", self.always.as_slice()),
            ("success", self.success.as_slice()),
            ("failure", self.failure.as_slice()),
            ("unstable", self.unstable.as_slice()),
            ("aborted", self.aborted.as_slice()),
        ]
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Deserialize, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum FailingTestsPolicy {
    #[default]
    Unstable,
    Failure,
}

impl FailingTestsPolicy {
    pub fn result(self) -> RunResult {
        match self {
            FailingTestsPolicy::Unstable => RunResult::Unstable,
            FailingTestsPolicy::Failure => RunResult::Failure,
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Deserialize, Serialize)]
pub struct ReportSpec {
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub junit: Vec<String>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub coverage: Vec<String>,
    #[serde(default)]
    pub failing_tests: FailingTestsPolicy,
    /// Coverage below this line rate (0.0 to 1.0) marks the run unstable.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub min_line_rate: Option<f64>,
}

#[derive(Debug, Clone, PartialEq, Eq, Deserialize, Serialize)]
pub struct ArtifactSpec {
    pub patterns: Vec<String>,
    #[serde(default)]
    pub allow_empty: bool,
    #[serde(default = "default_fingerprint")]
    pub fingerprint: bool,
}

fn default_fingerprint() -> bool {
    true
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_fill_optional_fields() {
        let pipeline = Pipeline::from_yaml(
            r#"
version: 1
stages:
  - name: build
    command: make
"#,
        )
        .unwrap();
        assert_eq!(pipeline.name, "pipeline");
        assert_eq!(pipeline.timeout(), Duration::from_secs(3_600));
        assert_eq!(pipeline.post_timeout(), Duration::from_secs(600));
        assert!(!pipeline.stages[0].best_effort);
        assert!(pipeline.post.is_empty());
    }

    #[test]
    fn branch_follows_result() {
        let post = PostActions {
            success: vec!["ok".into()],
            failure: vec!["bad".into()],
            unstable: vec!["flaky".into()],
            ..PostActions::default()
        };
        assert_eq!(post.branch(RunResult::Unstable), ["flaky".to_string()]);
        assert!(post.branch(RunResult::Aborted).is_empty());
    }
}
