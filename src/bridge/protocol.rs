//! Wire protocol types for the dispatcher-worker exchange.
//!
//! One request kind (`run`, plus the `exit` signal) and one response shape.
//! The exchange is strictly request/reply: a worker never speaks unprompted.

use std::path::PathBuf;

use serde::{Deserialize, Serialize};

/// Correlates a response with the request that produced it.
///
/// Minted as UUID v4 but carried as an opaque string: a peer echoing an id
/// we did not mint must still deserialize cleanly.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct RequestId(String);

impl RequestId {
    pub fn new() -> Self {
        Self(uuid::Uuid::new_v4().to_string())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl Default for RequestId {
    fn default() -> Self {
        Self::new()
    }
}

impl From<String> for RequestId {
    fn from(s: String) -> Self {
        Self(s)
    }
}

impl From<&str> for RequestId {
    fn from(s: &str) -> Self {
        Self(s.to_string())
    }
}

impl std::fmt::Display for RequestId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Request verbs a worker understands.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Method {
    Run,
    Exit,
    /// Catch-all so an unrecognized verb is reported over the channel
    /// instead of failing the decode.
    #[serde(other)]
    Unknown,
}

fn is_false(flag: &bool) -> bool {
    !*flag
}

/// A tool invocation (or the exit signal) sent to a worker.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Request {
    pub id: RequestId,
    pub method: Method,

    /// Registered tool entry point to run. Required for `run`.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub module: Option<String>,

    /// Argument vector the tool sees, verbatim.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub argv: Vec<String>,

    /// Feed `source` to the tool over captured stdin.
    #[serde(rename = "useStdin", default, skip_serializing_if = "is_false")]
    pub use_stdin: bool,

    /// Directory to run in. Absent means the worker's own directory.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub cwd: Option<PathBuf>,

    /// Document text for stdin-fed tools.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub source: Option<String>,
}

impl Request {
    /// A `run` request with a fresh id and empty optionals.
    pub fn run(module: impl Into<String>) -> Self {
        Self {
            id: RequestId::new(),
            method: Method::Run,
            module: Some(module.into()),
            argv: Vec::new(),
            use_stdin: false,
            cwd: None,
            source: None,
        }
    }

    /// The shutdown signal. Serializes as a bare `{id, method: "exit"}`.
    pub fn exit() -> Self {
        Self {
            id: RequestId::new(),
            method: Method::Exit,
            module: None,
            argv: Vec::new(),
            use_stdin: false,
            cwd: None,
            source: None,
        }
    }
}

/// A worker's reply. At most one of `result`/`error` is set; `exception`
/// accompanies `error` and tells a fault apart from ordinary tool stderr.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Response {
    pub id: RequestId,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub result: Option<String>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub exception: Option<bool>,
}

impl Response {
    /// Successful completion with captured stdout.
    pub fn result(id: RequestId, result: impl Into<String>) -> Self {
        Self {
            id,
            result: Some(result.into()),
            error: None,
            exception: None,
        }
    }

    /// Error text (tool stderr or a formatted fault).
    pub fn error(id: RequestId, error: impl Into<String>, exception: bool) -> Self {
        Self {
            id,
            result: None,
            error: Some(error.into()),
            exception: Some(exception),
        }
    }

    /// A run that produced no output at all.
    pub fn empty(id: RequestId) -> Self {
        Self {
            id,
            result: None,
            error: None,
            exception: None,
        }
    }
}
