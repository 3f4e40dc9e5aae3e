#![allow(dead_code)]

use std::collections::{BTreeMap, HashMap};
use std::sync::Mutex;
use std::time::Duration;

use async_trait::async_trait;
use stagehand::cancel::AbortSignal;
use stagehand::runner::{CommandRequest, ProcessOutput, ProcessRunner};

/// What the scripted runner does when it sees a given command string.
#[derive(Debug, Clone, Copy)]
pub enum Behavior {
    Exit(i32),
    Sleep(Duration),
    SpawnError,
    /// Fires the run's abort signal while the command is "running".
    Interrupt,
}

#[derive(Debug, Clone)]
pub struct Call {
    pub label: String,
    pub script: String,
    pub env: BTreeMap<String, String>,
    pub timeout: Option<Duration>,
}

/// Deterministic `ProcessRunner`: commands exit 0 unless a behavior was
/// registered for their exact (substituted) text.
#[derive(Default)]
pub struct ScriptedRunner {
    behaviors: HashMap<String, Behavior>,
    calls: Mutex<Vec<Call>>,
}

impl ScriptedRunner {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn on(mut self, script: &str, behavior: Behavior) -> Self {
        self.behaviors.insert(script.to_string(), behavior);
        self
    }

    pub fn calls(&self) -> Vec<Call> {
        self.calls.lock().unwrap().clone()
    }

    pub fn scripts(&self) -> Vec<String> {
        self.calls().into_iter().map(|call| call.script).collect()
    }

    pub fn count(&self, script: &str) -> usize {
        self.calls()
            .iter()
            .filter(|call| call.script == script)
            .count()
    }
}

#[async_trait]
impl ProcessRunner for ScriptedRunner {
    async fn execute(&self, request: &CommandRequest, abort: &AbortSignal) -> ProcessOutput {
        self.calls.lock().unwrap().push(Call {
            label: request.label.clone(),
            script: request.script.clone(),
            env: request.env.clone(),
            timeout: request.timeout,
        });

        let behavior = self
            .behaviors
            .get(&request.script)
            .copied()
            .unwrap_or(Behavior::Exit(0));
        match behavior {
            Behavior::Exit(code) => ProcessOutput {
                exit_code: Some(code),
                stdout: format!("ran {}", request.script),
                ..ProcessOutput::default()
            },
            Behavior::SpawnError => ProcessOutput::spawn_failed("scripted spawn failure"),
            Behavior::Interrupt => {
                abort.abort("scripted interrupt");
                ProcessOutput {
                    aborted: true,
                    ..ProcessOutput::default()
                }
            }
            Behavior::Sleep(duration) => {
                let limit = request.timeout.unwrap_or(Duration::MAX);
                if duration <= limit {
                    tokio::time::sleep(duration).await;
                    ProcessOutput {
                        exit_code: Some(0),
                        duration,
                        ..ProcessOutput::default()
                    }
                } else {
                    tokio::time::sleep(limit).await;
                    ProcessOutput {
                        timed_out: true,
                        duration: limit,
                        ..ProcessOutput::default()
                    }
                }
            }
        }
    }
}

pub fn junit(passed: usize, failed: usize) -> String {
    let mut xml = String::from("<?xml version=\"1.0\"?>\n<testsuite name=\"suite\">\n");
    for idx in 0..passed {
        xml.push_str(&format!(
            "  <testcase classname=\"tests.ok\" name=\"case_{idx}\"/>\n"
        ));
    }
    for idx in 0..failed {
        xml.push_str(&format!(
            "  <testcase classname=\"tests.bad\" name=\"case_{idx}\">\n    <failure message=\"assert 1 == 2\">Traceback</failure>\n  </testcase>\n"
        ));
    }
    xml.push_str("</testsuite>\n");
    xml
}
