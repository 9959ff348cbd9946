//! Ambient process state and its scoped substitution.
//!
//! Tools read their argument vector and stdio through this module instead of
//! `std::env` / `std::io` directly, which lets the harness swap in-memory
//! capture buffers in for the duration of a run. Outside a run every accessor
//! passes through to the real process state, so a tool behaves identically
//! when executed standalone.

use std::io::{self, Cursor, Read, Write};
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

static AMBIENT: Mutex<AmbientState> = Mutex::new(AmbientState {
    argv: None,
    stdin: StreamSlot::Passthrough,
    stdout: StreamSlot::Passthrough,
    stderr: StreamSlot::Passthrough,
});

/// Serializes harness invocations. The working directory is process-wide
/// state, so the lock spans the whole run, not just the chdir itself.
static CWD_LOCK: Mutex<()> = Mutex::new(());

pub(crate) fn cwd_lock() -> MutexGuard<'static, ()> {
    CWD_LOCK.lock().unwrap_or_else(PoisonError::into_inner)
}

/// A panic inside a capturing tool can poison the state lock. The state
/// itself stays coherent (slots are swapped whole), so recover the guard.
fn state() -> MutexGuard<'static, AmbientState> {
    AMBIENT.lock().unwrap_or_else(PoisonError::into_inner)
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum StreamKind {
    Stdin,
    Stdout,
    Stderr,
}

#[derive(Clone)]
pub(crate) enum StreamSlot {
    /// The real process stream.
    Passthrough,
    /// A harness-installed capture buffer.
    Captured(VirtualStream),
}

struct AmbientState {
    /// Replacement argument vector; `None` means the real `env::args`.
    argv: Option<Vec<String>>,
    stdin: StreamSlot,
    stdout: StreamSlot,
    stderr: StreamSlot,
}

impl AmbientState {
    fn slot_mut(&mut self, kind: StreamKind) -> &mut StreamSlot {
        match kind {
            StreamKind::Stdin => &mut self.stdin,
            StreamKind::Stdout => &mut self.stdout,
            StreamKind::Stderr => &mut self.stderr,
        }
    }
}

pub(crate) fn current_slot(kind: StreamKind) -> StreamSlot {
    state().slot_mut(kind).clone()
}

/// Shared in-memory stream standing in for a real stdio handle.
///
/// Clones share one buffer and one cursor position; reads and writes both
/// advance it, like a seekable file.
#[derive(Clone, Default)]
pub(crate) struct VirtualStream {
    inner: Arc<Mutex<Cursor<Vec<u8>>>>,
}

impl VirtualStream {
    pub(crate) fn new() -> Self {
        Self::default()
    }

    /// Preloaded with `content`, positioned at the start.
    pub(crate) fn preloaded(content: &str) -> Self {
        Self {
            inner: Arc::new(Mutex::new(Cursor::new(content.as_bytes().to_vec()))),
        }
    }

    /// Everything in the buffer, lossily decoded. Leaves the position alone.
    pub(crate) fn contents(&self) -> String {
        String::from_utf8_lossy(self.lock().get_ref()).into_owned()
    }

    fn lock(&self) -> MutexGuard<'_, Cursor<Vec<u8>>> {
        self.inner.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

impl Read for VirtualStream {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        self.lock().read(buf)
    }
}

impl Write for VirtualStream {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        self.lock().write(buf)
    }

    fn flush(&mut self) -> io::Result<()> {
        Ok(())
    }
}

/// Installs a replacement argument vector, restoring the previous value on
/// drop (including unwind).
pub(crate) struct ArgvGuard {
    saved: Option<Vec<String>>,
}

impl ArgvGuard {
    pub(crate) fn install(argv: Vec<String>) -> Self {
        let saved = std::mem::replace(&mut state().argv, Some(argv));
        Self { saved }
    }
}

impl Drop for ArgvGuard {
    fn drop(&mut self) {
        state().argv = self.saved.take();
    }
}

/// Installs a capture buffer in one stream slot, restoring the previous
/// slot on drop.
pub(crate) struct StreamGuard {
    kind: StreamKind,
    saved: Option<StreamSlot>,
}

impl StreamGuard {
    pub(crate) fn capture(kind: StreamKind, stream: VirtualStream) -> Self {
        let saved = std::mem::replace(state().slot_mut(kind), StreamSlot::Captured(stream));
        Self {
            kind,
            saved: Some(saved),
        }
    }
}

impl Drop for StreamGuard {
    fn drop(&mut self) {
        if let Some(saved) = self.saved.take() {
            *state().slot_mut(self.kind) = saved;
        }
    }
}

/// Changes into `target` unless the process is already there, restoring the
/// previous directory on drop. Callers must hold the directory lock.
pub(crate) struct CwdGuard {
    restore: Option<PathBuf>,
}

impl CwdGuard {
    pub(crate) fn enter(target: &Path) -> io::Result<Self> {
        let current = std::env::current_dir()?;
        if same_path(&current, target) {
            return Ok(Self { restore: None });
        }
        std::env::set_current_dir(target)?;
        Ok(Self {
            restore: Some(current),
        })
    }
}

impl Drop for CwdGuard {
    fn drop(&mut self) {
        if let Some(previous) = self.restore.take() {
            if let Err(e) = std::env::set_current_dir(&previous) {
                tracing::error!(
                    path = %previous.display(),
                    error = %e,
                    "Failed to restore working directory"
                );
            }
        }
    }
}

/// Path equality after filesystem normalization, so `dir` and `dir/sub/..`
/// (or a symlink to `dir`) compare equal.
pub fn same_path(a: &Path, b: &Path) -> bool {
    if a == b {
        return true;
    }
    matches!((a.canonicalize(), b.canonicalize()), (Ok(a), Ok(b)) if a == b)
}

/// The ambient argument vector: the installed one inside a harness run, the
/// real process arguments otherwise.
pub fn argv() -> Vec<String> {
    state()
        .argv
        .clone()
        .unwrap_or_else(|| std::env::args().collect())
}

pub fn stdout() -> AmbientStdout {
    AmbientStdout
}

pub fn stderr() -> AmbientStderr {
    AmbientStderr
}

pub fn stdin() -> AmbientStdin {
    AmbientStdin
}

/// Writer resolving to the ambient stdout slot on every use.
pub struct AmbientStdout;

impl Write for AmbientStdout {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        match current_slot(StreamKind::Stdout) {
            StreamSlot::Captured(mut stream) => stream.write(buf),
            StreamSlot::Passthrough => io::stdout().write(buf),
        }
    }

    fn flush(&mut self) -> io::Result<()> {
        match current_slot(StreamKind::Stdout) {
            StreamSlot::Captured(mut stream) => stream.flush(),
            StreamSlot::Passthrough => io::stdout().flush(),
        }
    }
}

/// Writer resolving to the ambient stderr slot on every use.
pub struct AmbientStderr;

impl Write for AmbientStderr {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        match current_slot(StreamKind::Stderr) {
            StreamSlot::Captured(mut stream) => stream.write(buf),
            StreamSlot::Passthrough => io::stderr().write(buf),
        }
    }

    fn flush(&mut self) -> io::Result<()> {
        match current_slot(StreamKind::Stderr) {
            StreamSlot::Captured(mut stream) => stream.flush(),
            StreamSlot::Passthrough => io::stderr().flush(),
        }
    }
}

/// Reader resolving to the ambient stdin slot on every use.
pub struct AmbientStdin;

impl Read for AmbientStdin {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        match current_slot(StreamKind::Stdin) {
            StreamSlot::Captured(mut stream) => stream.read(buf),
            StreamSlot::Passthrough => io::stdin().read(buf),
        }
    }
}
