//! Isolated execution of tool entry points.
//!
//! The harness runs a tool as if it were the whole program: the ambient
//! argument vector and stdio are swapped out for the duration of the call,
//! the working directory is switched under a process-wide lock, and
//! everything is restored on every exit path. A tool that errors or panics
//! produces a recorded fault, never a crash of the host.

pub mod ambient;
pub mod registry;

pub use registry::{ToolFn, ToolOutcome, ToolRegistry};

use std::io::{self, Write};
use std::panic::{AssertUnwindSafe, catch_unwind};
use std::path::{Path, PathBuf};
use std::process::{Command, Stdio};

use thiserror::Error;

use ambient::{ArgvGuard, CwdGuard, StreamGuard, StreamKind, VirtualStream, cwd_lock};

/// Environment failures before or around the tool itself. Reported to peers
/// the same way recorded faults are.
#[derive(Debug, Error)]
pub enum RunError {
    #[error("unknown tool {0:?}")]
    UnknownTool(String),

    #[error("empty command line")]
    EmptyCommand,

    #[error("cannot enter {path:?}: {source}")]
    Chdir {
        path: PathBuf,
        #[source]
        source: io::Error,
    },

    #[error("cannot spawn {command:?}: {source}")]
    Spawn {
        command: String,
        #[source]
        source: io::Error,
    },

    #[error(transparent)]
    Io(#[from] io::Error),
}

/// Why a tool run ended abnormally.
#[derive(Debug, Clone, PartialEq)]
pub enum Fault {
    /// The tool returned an error.
    Failed { message: String },
    /// The tool panicked.
    Panicked { message: String },
}

impl std::fmt::Display for Fault {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Fault::Failed { message } => write!(f, "{message}"),
            Fault::Panicked { message } => write!(f, "tool panicked: {message}"),
        }
    }
}

/// Captured output of one run.
#[derive(Debug)]
pub struct RunOutput {
    pub stdout: String,
    pub stderr: String,
    /// Present when the tool ended by error or panic instead of returning.
    /// Output written before the fault is still captured.
    pub fault: Option<Fault>,
}

/// Runs a registered tool under full ambient isolation.
///
/// `argv` is the complete vector the tool sees, including its `argv[0]`.
/// `source` is fed through captured stdin when `use_stdin` is set.
pub fn run_module(
    registry: &ToolRegistry,
    module: &str,
    argv: Vec<String>,
    use_stdin: bool,
    cwd: &Path,
    source: Option<&str>,
) -> Result<RunOutput, RunError> {
    let tool = registry
        .get(module)
        .ok_or_else(|| RunError::UnknownTool(module.to_string()))?;
    run_isolated(argv, use_stdin, cwd, source, || tool())
}

/// Same isolation for an arbitrary callback.
pub fn run_callback<F>(
    f: F,
    argv: Vec<String>,
    use_stdin: bool,
    cwd: &Path,
    source: Option<&str>,
) -> Result<RunOutput, RunError>
where
    F: FnOnce() -> anyhow::Result<ToolOutcome>,
{
    run_isolated(argv, use_stdin, cwd, source, f)
}

fn run_isolated<F>(
    argv: Vec<String>,
    use_stdin: bool,
    cwd: &Path,
    source: Option<&str>,
    f: F,
) -> Result<RunOutput, RunError>
where
    F: FnOnce() -> anyhow::Result<ToolOutcome>,
{
    // Held for the whole run: the directory is process state, and ambient
    // substitution must not interleave between same-process runs.
    let _serial = cwd_lock();
    let _dir = CwdGuard::enter(cwd).map_err(|source| RunError::Chdir {
        path: cwd.to_path_buf(),
        source,
    })?;

    let stdout = VirtualStream::new();
    let stderr = VirtualStream::new();
    let _argv = ArgvGuard::install(argv);
    let _out = StreamGuard::capture(StreamKind::Stdout, stdout.clone());
    let _err = StreamGuard::capture(StreamKind::Stderr, stderr.clone());
    let _in = match source {
        Some(text) if use_stdin => Some(StreamGuard::capture(
            StreamKind::Stdin,
            VirtualStream::preloaded(text),
        )),
        _ => None,
    };

    let fault = match catch_unwind(AssertUnwindSafe(f)) {
        Ok(Ok(ToolOutcome::Completed)) => None,
        Ok(Ok(ToolOutcome::Exit(code))) => {
            tracing::debug!(code, "Tool requested early exit");
            None
        }
        Ok(Err(error)) => {
            let message = format!("{error:#}");
            tracing::debug!(error = %message, "Tool returned error");
            Some(Fault::Failed { message })
        }
        Err(panic) => {
            let message = panic_message(panic.as_ref());
            tracing::warn!(error = %message, "Tool panicked");
            Some(Fault::Panicked { message })
        }
    };

    Ok(RunOutput {
        stdout: stdout.contents(),
        stderr: stderr.contents(),
        fault,
    })
}

fn panic_message(payload: &(dyn std::any::Any + Send)) -> String {
    if let Some(s) = payload.downcast_ref::<&str>() {
        (*s).to_string()
    } else if let Some(s) = payload.downcast_ref::<String>() {
        s.clone()
    } else {
        "non-string panic payload".to_string()
    }
}

/// Runs `argv` as a real subprocess in `cwd`, capturing its output.
///
/// For tools that exist as separate executables rather than registered entry
/// points. No fault is recorded; a nonzero exit status shows up as whatever
/// the tool wrote to stderr, matching how the in-process paths report.
pub fn run_command(
    argv: &[String],
    use_stdin: bool,
    cwd: &Path,
    source: Option<&str>,
) -> Result<RunOutput, RunError> {
    let (program, args) = argv.split_first().ok_or(RunError::EmptyCommand)?;

    let mut command = Command::new(program);
    command
        .args(args)
        .current_dir(cwd)
        .stdout(Stdio::piped())
        .stderr(Stdio::piped())
        .stdin(if use_stdin {
            Stdio::piped()
        } else {
            Stdio::null()
        });

    tracing::debug!(command = %program, cwd = %cwd.display(), "Running external tool");
    let mut child = command.spawn().map_err(|source| RunError::Spawn {
        command: program.clone(),
        source,
    })?;

    if use_stdin {
        if let (Some(mut stdin), Some(text)) = (child.stdin.take(), source) {
            // The tool may exit without draining its stdin.
            if let Err(e) = stdin.write_all(text.as_bytes()) {
                if e.kind() != io::ErrorKind::BrokenPipe {
                    let _ = child.kill();
                    let _ = child.wait();
                    return Err(e.into());
                }
            }
        }
    }

    let output = child.wait_with_output()?;
    Ok(RunOutput {
        stdout: String::from_utf8_lossy(&output.stdout).into_owned(),
        stderr: String::from_utf8_lossy(&output.stderr).into_owned(),
        fault: None,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use super::ambient::{StreamSlot, current_slot};

    fn here() -> PathBuf {
        std::env::current_dir().unwrap()
    }

    #[test]
    fn captures_stdout_and_stderr() {
        let output = run_callback(
            || {
                write!(ambient::stdout(), "to out")?;
                write!(ambient::stderr(), "to err")?;
                Ok(ToolOutcome::Completed)
            },
            vec!["tool".into()],
            false,
            &here(),
            None,
        )
        .unwrap();

        assert_eq!(output.stdout, "to out");
        assert_eq!(output.stderr, "to err");
        assert!(output.fault.is_none());
    }

    #[test]
    fn argv_is_installed_for_the_run_and_restored() {
        let output = run_callback(
            || {
                write!(ambient::stdout(), "{}", ambient::argv().join(" "))?;
                Ok(ToolOutcome::Completed)
            },
            vec!["tool".into(), "--flag".into(), "value".into()],
            false,
            &here(),
            None,
        )
        .unwrap();
        assert_eq!(output.stdout, "tool --flag value");

        // Once we hold the run lock no other run is in flight, so the
        // ambient vector must be back to the real process arguments.
        let _serial = cwd_lock();
        assert_eq!(ambient::argv(), std::env::args().collect::<Vec<_>>());
    }

    #[test]
    fn stdin_preload_feeds_the_tool() {
        let output = run_callback(
            || {
                let mut text = String::new();
                std::io::Read::read_to_string(&mut ambient::stdin(), &mut text)?;
                write!(ambient::stdout(), "read: {text}")?;
                Ok(ToolOutcome::Completed)
            },
            vec!["tool".into()],
            true,
            &here(),
            Some("line one\nline two"),
        )
        .unwrap();

        assert_eq!(output.stdout, "read: line one\nline two");
    }

    #[test]
    fn stdin_stays_passthrough_without_source() {
        let output = run_callback(
            || {
                assert!(matches!(
                    current_slot(StreamKind::Stdin),
                    StreamSlot::Passthrough
                ));
                Ok(ToolOutcome::Completed)
            },
            vec!["tool".into()],
            true,
            &here(),
            None,
        )
        .unwrap();

        assert!(output.fault.is_none());
    }

    #[test]
    fn early_exit_keeps_partial_output_and_restores() {
        let dir = tempfile::tempdir().unwrap();
        let before = here();

        let output = run_callback(
            || {
                write!(ambient::stdout(), "partial")?;
                Ok(ToolOutcome::Exit(2))
            },
            vec!["tool".into()],
            false,
            dir.path(),
            None,
        )
        .unwrap();

        assert_eq!(output.stdout, "partial");
        assert!(output.fault.is_none());

        let _serial = cwd_lock();
        assert_eq!(ambient::argv(), std::env::args().collect::<Vec<_>>());
        assert!(matches!(
            current_slot(StreamKind::Stdout),
            StreamSlot::Passthrough
        ));
        assert_eq!(std::env::current_dir().unwrap(), before);
    }

    #[test]
    fn tool_error_becomes_fault_and_restores() {
        let dir = tempfile::tempdir().unwrap();
        let before = here();

        let output = run_callback(
            || {
                write!(ambient::stdout(), "before the error")?;
                Err(anyhow::anyhow!("boom"))
            },
            vec!["tool".into()],
            false,
            dir.path(),
            None,
        )
        .unwrap();

        assert_eq!(output.stdout, "before the error");
        match output.fault {
            Some(Fault::Failed { message }) => assert!(message.contains("boom")),
            other => panic!("expected failure fault, got {other:?}"),
        }

        let _serial = cwd_lock();
        assert_eq!(ambient::argv(), std::env::args().collect::<Vec<_>>());
        assert!(matches!(
            current_slot(StreamKind::Stdout),
            StreamSlot::Passthrough
        ));
        assert_eq!(std::env::current_dir().unwrap(), before);
    }

    #[test]
    fn panic_becomes_fault_and_state_restores() {
        let output = run_callback(
            || panic!("kaboom"),
            vec!["tool".into()],
            false,
            &here(),
            None,
        )
        .unwrap();

        match output.fault {
            Some(Fault::Panicked { message }) => assert!(message.contains("kaboom")),
            other => panic!("expected panic fault, got {other:?}"),
        }

        let _serial = cwd_lock();
        assert_eq!(ambient::argv(), std::env::args().collect::<Vec<_>>());
        assert!(matches!(
            current_slot(StreamKind::Stdout),
            StreamSlot::Passthrough
        ));
    }

    #[test]
    fn switches_directory_for_the_run() {
        let dir = tempfile::tempdir().unwrap();
        let before = here();

        let output = run_callback(
            || {
                write!(
                    ambient::stdout(),
                    "{}",
                    std::env::current_dir().unwrap().display()
                )?;
                Ok(ToolOutcome::Completed)
            },
            vec!["tool".into()],
            false,
            dir.path(),
            None,
        )
        .unwrap();

        assert!(ambient::same_path(
            Path::new(&output.stdout),
            dir.path()
        ));

        let _serial = cwd_lock();
        assert_eq!(std::env::current_dir().unwrap(), before);
    }

    #[test]
    fn unknown_tool_is_a_run_error() {
        let registry = ToolRegistry::new();
        let err =
            run_module(&registry, "missing", vec!["x".into()], false, &here(), None).unwrap_err();

        assert!(matches!(err, RunError::UnknownTool(name) if name == "missing"));
    }

    #[test]
    fn run_module_dispatches_by_name() {
        let mut registry = ToolRegistry::new();
        registry.register("greet", || {
            write!(ambient::stdout(), "hi from {}", ambient::argv()[0])?;
            Ok(ToolOutcome::Completed)
        });

        let output = run_module(
            &registry,
            "greet",
            vec!["greet".into()],
            false,
            &here(),
            None,
        )
        .unwrap();

        assert_eq!(output.stdout, "hi from greet");
    }

    #[test]
    fn run_command_captures_output() {
        let output =
            run_command(&["echo".into(), "hello".into()], false, &here(), None).unwrap();

        assert_eq!(output.stdout, "hello\n");
        assert_eq!(output.stderr, "");
        assert!(output.fault.is_none());
    }

    #[test]
    fn run_command_feeds_stdin() {
        let output = run_command(&["cat".into()], true, &here(), Some("piped text")).unwrap();

        assert_eq!(output.stdout, "piped text");
    }

    #[test]
    fn run_command_runs_in_requested_directory() {
        let dir = tempfile::tempdir().unwrap();
        let output = run_command(&["pwd".into()], false, dir.path(), None).unwrap();

        assert!(ambient::same_path(
            Path::new(output.stdout.trim_end()),
            dir.path()
        ));
    }

    #[test]
    fn run_command_reports_spawn_failure() {
        let err = run_command(
            &["definitely-not-a-real-tool".into()],
            false,
            &here(),
            None,
        )
        .unwrap_err();

        assert!(matches!(err, RunError::Spawn { .. }));
    }

    #[test]
    fn empty_command_is_rejected() {
        assert!(matches!(
            run_command(&[], false, &here(), None),
            Err(RunError::EmptyCommand)
        ));
    }
}
