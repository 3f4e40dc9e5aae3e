use std::collections::{BTreeMap, BTreeSet};
use std::path::Path;

use once_cell::sync::Lazy;
use regex::{Captures, Regex};

static REFERENCE: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"\$\{([A-Za-z_][A-Za-z0-9_]*)\}").expect("reference pattern is valid")
});

const MAX_EXPANSION_PASSES: usize = 8;

pub const WORKSPACE_VAR: &str = "WORKSPACE";
pub const RUN_ID_VAR: &str = "RUN_ID";
pub const PIPELINE_NAME_VAR: &str = "PIPELINE_NAME";
/// Only visible to post actions.
pub const RUN_RESULT_VAR: &str = "RUN_RESULT";

/// Immutable set of named variables visible to every stage of a run.
///
/// Values are substituted into command strings (`${NAME}`) and exported to
/// the spawned process environment. References to unknown names are left
/// untouched so the shell can resolve them from its own environment.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Environment {
    vars: BTreeMap<String, String>,
}

impl Environment {
    /// Builds the run environment: built-ins first, then pipeline
    /// variables, then command-line overrides. Later layers win, and values
    /// may reference any other variable in the final map.
    pub fn resolve(
        workspace: &Path,
        run_id: &str,
        pipeline_name: &str,
        pipeline_vars: &BTreeMap<String, String>,
        overrides: &BTreeMap<String, String>,
    ) -> Self {
        let mut vars = BTreeMap::new();
        vars.insert(
            WORKSPACE_VAR.to_string(),
            workspace.to_string_lossy().to_string(),
        );
        vars.insert(RUN_ID_VAR.to_string(), run_id.to_string());
        vars.insert(PIPELINE_NAME_VAR.to_string(), pipeline_name.to_string());
        vars.extend(pipeline_vars.iter().map(|(k, v)| (k.clone(), v.clone())));
        vars.extend(overrides.iter().map(|(k, v)| (k.clone(), v.clone())));

        let mut env = Self { vars };
        env.expand_values();
        env
    }

    /// Returns a copy with `extra` layered on top. Extra values are expanded
    /// against the current variables.
    pub fn overlay(&self, extra: &BTreeMap<String, String>) -> Self {
        if extra.is_empty() {
            return self.clone();
        }
        let mut vars = self.vars.clone();
        for (key, value) in extra {
            vars.insert(key.clone(), self.substitute(value));
        }
        Self { vars }
    }

    pub fn get(&self, name: &str) -> Option<&str> {
        self.vars.get(name).map(String::as_str)
    }

    pub fn vars(&self) -> &BTreeMap<String, String> {
        &self.vars
    }

    pub fn substitute(&self, input: &str) -> String {
        REFERENCE
            .replace_all(input, |caps: &Captures| match self.vars.get(&caps[1]) {
                Some(value) => value.clone(),
                None => caps[0].to_string(),
            })
            .into_owned()
    }

    fn expand_values(&mut self) {
        for _ in 0..MAX_EXPANSION_PASSES {
            let mut changed = false;
            let snapshot = self.clone();
            for value in self.vars.values_mut() {
                if !REFERENCE.is_match(value) {
                    continue;
                }
                let expanded = snapshot.substitute(value);
                if expanded != *value {
                    *value = expanded;
                    changed = true;
                }
            }
            if !changed {
                break;
            }
        }
    }
}

impl FromIterator<(String, String)> for Environment {
    fn from_iter<T: IntoIterator<Item = (String, String)>>(iter: T) -> Self {
        Self {
            vars: iter.into_iter().collect(),
        }
    }
}

/// Names referenced with `${NAME}` syntax inside `input`.
pub fn references(input: &str) -> BTreeSet<String> {
    REFERENCE
        .captures_iter(input)
        .map(|caps| caps[1].to_string())
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::path::PathBuf;

    fn vars(pairs: &[(&str, &str)]) -> BTreeMap<String, String> {
        pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect()
    }

    #[test]
    fn substitutes_known_and_keeps_unknown() {
        let env: Environment = vec![("VENV_DIR".to_string(), "venv".to_string())]
            .into_iter()
            .collect();
        assert_eq!(
            env.substitute(". ${VENV_DIR}/bin/activate && echo ${HOME}"),
            ". venv/bin/activate && echo ${HOME}"
        );
    }

    #[test]
    fn overrides_win_and_values_expand() {
        let env = Environment::resolve(
            &PathBuf::from("/work"),
            "run-1",
            "ci",
            &vars(&[
                ("REPORTS_DIR", "${WORKSPACE}/reports"),
                ("PYTHON_VERSION", "3.10"),
            ]),
            &vars(&[("PYTHON_VERSION", "3.12")]),
        );
        assert_eq!(env.get("REPORTS_DIR"), Some("/work/reports"));
        assert_eq!(env.get("PYTHON_VERSION"), Some("3.12"));
        assert_eq!(env.get(RUN_ID_VAR), Some("run-1"));
    }

    #[test]
    fn self_reference_terminates() {
        let env = Environment::resolve(
            &PathBuf::from("/w"),
            "r",
            "p",
            &vars(&[("LOOP", "${LOOP}x")]),
            &BTreeMap::new(),
        );
        assert!(env.get("LOOP").is_some_and(|v| v.ends_with('x')));
    }

    #[test]
    fn collects_references() {
        let names = references("${A} $B ${C_1} ${A}");
        assert_eq!(
            names.into_iter().collect::<Vec<_>>(),
            vec!["A".to_string(), "C_1".to_string()]
        );
    }
}
