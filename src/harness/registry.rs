//! Named tool entry points.

use std::collections::HashMap;

/// How a tool finished when it finished on purpose.
///
/// `Exit` is the programmatic stop signal command-line tools use to bail out
/// early with a status code. It is ordinary completion, not a fault: output
/// written before the exit is kept.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ToolOutcome {
    Completed,
    Exit(i32),
}

/// A tool entry point. Tools take no parameters: they read their argument
/// vector and stdio through [`crate::harness::ambient`], exactly as they
/// would read `env::args` and `io::stdin` when run standalone.
pub type ToolFn = Box<dyn Fn() -> anyhow::Result<ToolOutcome> + Send + Sync>;

/// Registry mapping module names to tool entry points. The harness runs
/// tools by name the way a shell runs executables by path.
#[derive(Default)]
pub struct ToolRegistry {
    tools: HashMap<String, ToolFn>,
}

impl ToolRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register<F>(&mut self, name: impl Into<String>, tool: F)
    where
        F: Fn() -> anyhow::Result<ToolOutcome> + Send + Sync + 'static,
    {
        self.tools.insert(name.into(), Box::new(tool));
    }

    pub fn get(&self, name: &str) -> Option<&ToolFn> {
        self.tools.get(name)
    }
}
