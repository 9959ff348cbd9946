//! toolbridge: out-of-process tool execution over framed JSON RPC.

pub mod bridge;
pub mod dispatcher;
pub mod harness;
pub mod supervisor;
pub mod worker;

pub use dispatcher::{DispatchError, Dispatcher, ExecutionResult, ToolCall};

pub use supervisor::{ProcessSupervisor, SpawnError, WorkerChannel, WorkerLaunch};

pub use harness::{
    Fault, RunError, RunOutput, ToolFn, ToolOutcome, ToolRegistry, run_callback, run_command,
    run_module,
};
pub use worker::{run_loop, serve_stdio};
