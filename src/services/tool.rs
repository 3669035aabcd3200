//! External compute programs.
//!
//! Each program is run as `sh -c "<tool_command> <program>"`:
//! - the invocation is passed as JSON on stdin and summarized in `FLORA_*` env vars
//! - stdout lines `artifact:<kind>:<path>` name produced artifacts
//! - every other non-empty stdout line is a diagnostic message
//! - a non-zero exit is an opaque failure of the enclosing task

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::process::Stdio;
use std::time::Duration;
use tokio::io::AsyncWriteExt;
use tokio::process::Command;
use tokio::time::timeout;
use tracing::debug;

use super::store::StoreConnection;
use crate::config::AttributeBag;
use crate::errors::ExternalToolError;
use crate::jobs::JobKind;
use crate::phase::PhaseName;
use crate::units::{UnitId, encode_unit_names};

/// A file produced by a program.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ArtifactHandle {
    pub kind: String,
    pub path: PathBuf,
    pub size: u64,
}

impl ArtifactHandle {
    pub fn new(kind: impl Into<String>, path: PathBuf, size: u64) -> Self {
        Self {
            kind: kind.into(),
            path,
            size,
        }
    }
}

/// Everything a program needs: which store, which units, which parameters.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ToolInvocation {
    pub program: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub job: Option<JobKind>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub phase: Option<PhaseName>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub store: Option<StoreConnection>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub secondary_store: Option<StoreConnection>,
    /// Encoded unit names, see [`encode_unit_names`].
    pub units: String,
    pub params: serde_json::Map<String, serde_json::Value>,
}

impl ToolInvocation {
    pub fn new(program: impl Into<String>) -> Self {
        Self {
            program: program.into(),
            job: None,
            phase: None,
            store: None,
            secondary_store: None,
            units: encode_unit_names([]),
            params: serde_json::Map::new(),
        }
    }

    /// An invocation of the program a job kind runs, if it runs one.
    pub fn for_job(kind: JobKind) -> Option<Self> {
        let mut invocation = Self::new(kind.program()?);
        invocation.job = Some(kind);
        invocation.phase = Some(kind.phase());
        Some(invocation)
    }

    pub fn with_store(mut self, store: Option<&StoreConnection>) -> Self {
        self.store = store.cloned();
        self
    }

    pub fn with_secondary_store(mut self, store: Option<&StoreConnection>) -> Self {
        self.secondary_store = store.cloned();
        self
    }

    pub fn with_units(mut self, ids: impl IntoIterator<Item = UnitId>) -> Self {
        self.units = encode_unit_names(ids);
        self
    }

    /// Merge a phase bag into the parameters. Explicit params set later win.
    pub fn with_params(mut self, bag: &AttributeBag) -> Self {
        if let serde_json::Value::Object(map) = bag.to_json() {
            for (key, value) in map {
                self.params.entry(key).or_insert(value);
            }
        }
        self
    }

    pub fn with_param(mut self, key: impl Into<String>, value: impl Into<serde_json::Value>) -> Self {
        self.params.insert(key.into(), value.into());
        self
    }
}

/// Diagnostics and artifacts of one program run.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct ToolOutput {
    pub messages: Vec<String>,
    pub artifacts: Vec<ArtifactHandle>,
}

impl ToolOutput {
    pub fn artifact(&self, kind: &str) -> Option<&ArtifactHandle> {
        self.artifacts.iter().find(|a| a.kind == kind)
    }

    /// Parse program stdout. Relative artifact paths resolve against `base`.
    pub fn parse(program: &str, stdout: &str, base: &Path) -> Result<Self, ExternalToolError> {
        let mut output = ToolOutput::default();
        for line in stdout.lines().map(str::trim).filter(|l| !l.is_empty()) {
            let Some(rest) = line.strip_prefix("artifact:") else {
                output.messages.push(line.to_string());
                continue;
            };
            let (kind, path) = rest
                .split_once(':')
                .filter(|(k, p)| !k.is_empty() && !p.is_empty())
                .ok_or_else(|| ExternalToolError::Protocol {
                    program: program.to_string(),
                    message: format!("malformed artifact line '{}'", line),
                })?;
            let path = PathBuf::from(path);
            let path = if path.is_absolute() {
                path
            } else {
                base.join(path)
            };
            let size = std::fs::metadata(&path).map(|m| m.len()).unwrap_or(0);
            output.artifacts.push(ArtifactHandle::new(kind, path, size));
        }
        Ok(output)
    }
}

/// A black-box compute program runner.
#[async_trait]
pub trait ComputeTool: Send + Sync {
    async fn run(&self, invocation: &ToolInvocation) -> Result<ToolOutput, ExternalToolError>;
}

/// Runs programs as shell subprocesses.
pub struct ProcessTool {
    command: String,
    working_dir: PathBuf,
    timeout: Option<Duration>,
}

impl ProcessTool {
    pub fn new(command: impl Into<String>, working_dir: impl AsRef<Path>) -> Self {
        Self {
            command: command.into(),
            working_dir: working_dir.as_ref().to_path_buf(),
            timeout: None,
        }
    }

    pub fn with_timeout(mut self, timeout: Option<Duration>) -> Self {
        self.timeout = timeout;
        self
    }
}

#[async_trait]
impl ComputeTool for ProcessTool {
    async fn run(&self, invocation: &ToolInvocation) -> Result<ToolOutput, ExternalToolError> {
        let program = invocation.program.clone();
        let command_line = format!("{} {}", self.command, program);
        let payload = serde_json::to_string(invocation).map_err(|e| ExternalToolError::Protocol {
            program: program.clone(),
            message: format!("failed to serialize invocation: {}", e),
        })?;

        debug!(program = %program, units = %invocation.units, "spawning tool");

        let mut child = Command::new("sh")
            .arg("-c")
            .arg(&command_line)
            .current_dir(&self.working_dir)
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true)
            .env("FLORA_PROGRAM", &program)
            .env(
                "FLORA_JOB",
                invocation.job.map(|k| k.name()).unwrap_or_default(),
            )
            .env(
                "FLORA_PHASE",
                invocation.phase.map(|p| p.as_str()).unwrap_or_default(),
            )
            .env(
                "FLORA_STORE",
                invocation.store.as_ref().map(|s| s.as_str()).unwrap_or_default(),
            )
            .env(
                "FLORA_SECONDARY_STORE",
                invocation
                    .secondary_store
                    .as_ref()
                    .map(|s| s.as_str())
                    .unwrap_or_default(),
            )
            .env("FLORA_UNITS", &invocation.units)
            .spawn()
            .map_err(|source| ExternalToolError::Spawn {
                program: program.clone(),
                source,
            })?;

        // Feed stdin while stdout and stderr drain, so neither side blocks on a full pipe.
        let stdin = child.stdin.take();
        let feed = async move {
            if let Some(mut stdin) = stdin {
                // A program that ignores stdin may close it early; that is not a failure.
                let _ = stdin.write_all(payload.as_bytes()).await;
            }
        };
        let waited = async move {
            let ((), output) = tokio::join!(feed, child.wait_with_output());
            output
        };
        let output = match self.timeout {
            Some(limit) => match timeout(limit, waited).await {
                Ok(result) => result,
                Err(_) => {
                    return Err(ExternalToolError::TimedOut {
                        program,
                        secs: limit.as_secs(),
                    });
                }
            },
            None => waited.await,
        }
        .map_err(|source| ExternalToolError::Spawn {
            program: program.clone(),
            source,
        })?;

        if !output.status.success() {
            return Err(ExternalToolError::NonZeroExit {
                program,
                code: output.status.code().unwrap_or(-1),
                stderr: String::from_utf8_lossy(&output.stderr).trim().to_string(),
            });
        }

        ToolOutput::parse(
            &program,
            &String::from_utf8_lossy(&output.stdout),
            &self.working_dir,
        )
    }
}

/// Accepts every invocation and produces nothing.
#[derive(Debug, Clone, Copy, Default)]
pub struct DryRunTool;

#[async_trait]
impl ComputeTool for DryRunTool {
    async fn run(&self, _invocation: &ToolInvocation) -> Result<ToolOutput, ExternalToolError> {
        Ok(ToolOutput::default())
    }
}
