//! Standalone worker binary: serves the command loop on stdio with a
//! registry of built-in tools.
//!
//! Stdout belongs to the frame stream, so logging goes to stderr.

use std::io::{Read, Write};
use std::sync::Arc;

use tracing_subscriber::{EnvFilter, fmt, layer::SubscriberExt, util::SubscriberInitExt};

use toolbridge::harness::ambient;
use toolbridge::{ToolOutcome, ToolRegistry, serve_stdio};

fn init_tracing() {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    let subscriber = tracing_subscriber::registry()
        .with(filter)
        .with(fmt::layer().with_writer(std::io::stderr));
    let _ = subscriber.try_init();
}

/// Tools every worker ships with. Small on purpose: enough to exercise
/// argv, stdin, cwd, and each failure path end to end.
fn builtin_registry() -> ToolRegistry {
    let mut registry = ToolRegistry::new();

    registry.register("echo_argv", || {
        write!(ambient::stdout(), "ran {}", ambient::argv().join(" "))?;
        Ok(ToolOutcome::Completed)
    });

    registry.register("upper", || {
        let mut text = String::new();
        ambient::stdin().read_to_string(&mut text)?;
        write!(ambient::stdout(), "{}", text.to_uppercase())?;
        Ok(ToolOutcome::Completed)
    });

    registry.register("pwd", || {
        let dir = std::env::current_dir()?;
        writeln!(ambient::stdout(), "{}", dir.display())?;
        Ok(ToolOutcome::Completed)
    });

    registry.register("halt", || {
        write!(ambient::stdout(), "stopping early")?;
        Ok(ToolOutcome::Exit(0))
    });

    registry.register("fail", || anyhow::bail!("fail tool always fails"));

    registry.register("panic", || panic!("panic tool panicked"));

    // Kills the whole worker mid-request. The dispatcher side sees the
    // channel drop and respawns on the next call.
    registry.register("die", || std::process::exit(1));

    registry
}

#[tokio::main]
async fn main() {
    init_tracing();
    serve_stdio(Arc::new(builtin_registry())).await;
}
