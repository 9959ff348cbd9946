//! Client-side facade: one call in, one result out.
//!
//! Owns the response-to-result mapping and the recovery policy: transport
//! faults retire the worker so the next call respawns, while a reply that
//! merely answers the wrong request is reported in the result.

use std::path::PathBuf;
use std::sync::Arc;

use thiserror::Error;

use crate::bridge::channel::ChannelError;
use crate::bridge::protocol::{Method, Request, RequestId, Response};
use crate::supervisor::{ProcessSupervisor, SpawnError, WorkerLaunch};

#[derive(Debug, Error)]
pub enum DispatchError {
    /// No worker channel could be obtained for the workspace.
    #[error("worker unavailable: {0}")]
    Unavailable(#[from] SpawnError),

    /// The conversation died mid-exchange. The worker entry is retired and
    /// the next call starts over with a fresh worker.
    #[error("worker channel lost: {0}")]
    Channel(#[from] ChannelError),
}

/// Parameters of one tool invocation.
#[derive(Debug, Clone)]
pub struct ToolCall {
    pub module: String,
    pub argv: Vec<String>,
    pub use_stdin: bool,
    pub cwd: PathBuf,
    pub source: Option<String>,
}

impl ToolCall {
    pub fn new(module: impl Into<String>, cwd: impl Into<PathBuf>) -> Self {
        Self {
            module: module.into(),
            argv: Vec::new(),
            use_stdin: false,
            cwd: cwd.into(),
            source: None,
        }
    }

    pub fn with_argv(mut self, argv: Vec<String>) -> Self {
        self.argv = argv;
        self
    }

    /// Feed `source` to the tool over captured stdin.
    pub fn with_stdin_source(mut self, source: impl Into<String>) -> Self {
        self.use_stdin = true;
        self.source = Some(source.into());
        self
    }
}

/// What a tool run produced, as callers consume it.
#[derive(Debug, Clone, PartialEq)]
pub struct ExecutionResult {
    pub stdout: String,
    pub stderr: String,
    /// True when `stderr` carries a fault report rather than ordinary tool
    /// output.
    pub exception: bool,
}

/// Executes tool calls against supervised workers.
pub struct Dispatcher {
    supervisor: Arc<ProcessSupervisor>,
}

impl Dispatcher {
    pub fn new(supervisor: Arc<ProcessSupervisor>) -> Self {
        Self { supervisor }
    }

    pub fn supervisor(&self) -> &Arc<ProcessSupervisor> {
        &self.supervisor
    }

    /// Runs one tool call on the workspace's worker, starting or restarting
    /// the worker as needed. Blocks until the worker replies; calls for the
    /// same workspace queue behind each other.
    pub async fn run(
        &self,
        workspace: &str,
        launch: &WorkerLaunch,
        call: ToolCall,
    ) -> Result<ExecutionResult, DispatchError> {
        let channel = self.supervisor.get_or_start(workspace, launch).await?;

        let request = Request {
            id: RequestId::new(),
            method: Method::Run,
            module: Some(call.module),
            argv: call.argv,
            use_stdin: call.use_stdin,
            cwd: Some(call.cwd),
            source: call.source,
        };

        tracing::debug!(workspace = %workspace, id = %request.id, "Dispatching run");
        let response = match channel.exchange(&request).await {
            Ok(response) => response,
            Err(e) => {
                tracing::warn!(workspace = %workspace, error = %e, "Exchange failed, retiring worker");
                self.supervisor.retire(workspace, &channel).await;
                return Err(e.into());
            }
        };

        if response.id != request.id {
            // The worker answered, just not what we asked. Report it in the
            // result rather than tearing the session down.
            tracing::warn!(
                workspace = %workspace,
                expected = %request.id,
                received = %response.id,
                "Response id mismatch"
            );
            return Ok(ExecutionResult {
                stdout: String::new(),
                stderr: describe_mismatch(&request),
                exception: false,
            });
        }

        Ok(result_from_response(response))
    }
}

fn result_from_response(response: Response) -> ExecutionResult {
    ExecutionResult {
        stdout: response.result.unwrap_or_default(),
        stderr: response.error.unwrap_or_default(),
        exception: response.exception.unwrap_or(false),
    }
}

fn describe_mismatch(request: &Request) -> String {
    let rendered =
        serde_json::to_string_pretty(request).unwrap_or_else(|_| format!("{request:?}"));
    format!("invalid response for request: {rendered}")
}
