//! Subprocess seam: locating binaries and launching engines.
//!
//! The supervisor only talks to [`ProcessLauncher`] and [`ChildControl`], so
//! tests can script engine behaviour without spawning anything.

use async_trait::async_trait;
use std::io;
use std::path::{Path, PathBuf};
use std::process::Stdio;
use tokio::io::{AsyncRead, AsyncWrite};
use tracing::debug;

/// Handle to a running engine process.
#[async_trait]
pub trait ChildControl: Send {
    /// Waits for exit. `None` means the process was ended by a signal.
    async fn wait(&mut self) -> io::Result<Option<i32>>;

    /// Asks the process to stop (SIGTERM on unix).
    fn terminate(&mut self) -> io::Result<()>;

    /// Forces the process down.
    async fn kill(&mut self) -> io::Result<()>;
}

/// A launched process with its pipes taken.
pub struct LaunchedProcess {
    /// Engine stdin; `None` if the launcher did not pipe it.
    pub stdin: Option<Box<dyn AsyncWrite + Send + Unpin>>,
    /// NDJSON event stream.
    pub stdout: Box<dyn AsyncRead + Send + Unpin>,
    /// Diagnostics.
    pub stderr: Box<dyn AsyncRead + Send + Unpin>,
    /// Process control.
    pub child: Box<dyn ChildControl>,
}

/// Finds and starts engine binaries.
#[async_trait]
pub trait ProcessLauncher: Send + Sync {
    /// Resolves `binary` to an executable path, or `None` when it is not
    /// installed.
    fn locate(&self, binary: &str) -> Option<PathBuf>;

    /// Starts `program` with `args`, every stdio stream piped.
    async fn launch(&self, program: &Path, args: &[String]) -> io::Result<LaunchedProcess>;
}

/// Real launcher backed by `tokio::process::Command` and the `which` crate.
#[derive(Debug, Default, Clone)]
pub struct TokioLauncher {
    working_dir: Option<PathBuf>,
}

impl TokioLauncher {
    /// Launches in the current directory.
    pub fn new() -> Self {
        Self::default()
    }

    /// Launches engines inside `dir`.
    pub fn with_working_dir(dir: impl Into<PathBuf>) -> Self {
        Self {
            working_dir: Some(dir.into()),
        }
    }
}

#[async_trait]
impl ProcessLauncher for TokioLauncher {
    fn locate(&self, binary: &str) -> Option<PathBuf> {
        which::which(binary).ok()
    }

    async fn launch(&self, program: &Path, args: &[String]) -> io::Result<LaunchedProcess> {
        let mut cmd = tokio::process::Command::new(program);
        cmd.args(args)
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);
        if let Some(dir) = &self.working_dir {
            cmd.current_dir(dir);
        }

        debug!(program = %program.display(), args = ?args, "spawning engine");
        let mut child = cmd.spawn()?;

        let stdout = child
            .stdout
            .take()
            .ok_or_else(|| io::Error::other("stdout was not piped"))?;
        let stderr = child
            .stderr
            .take()
            .ok_or_else(|| io::Error::other("stderr was not piped"))?;
        let stdin = child
            .stdin
            .take()
            .map(|s| Box::new(s) as Box<dyn AsyncWrite + Send + Unpin>);

        Ok(LaunchedProcess {
            stdin,
            stdout: Box::new(stdout),
            stderr: Box::new(stderr),
            child: Box::new(TokioChild(child)),
        })
    }
}

struct TokioChild(tokio::process::Child);

#[async_trait]
impl ChildControl for TokioChild {
    async fn wait(&mut self) -> io::Result<Option<i32>> {
        Ok(self.0.wait().await?.code())
    }

    #[cfg(unix)]
    fn terminate(&mut self) -> io::Result<()> {
        let Some(pid) = self.0.id() else {
            // Already reaped.
            return Ok(());
        };
        let pid = libc::pid_t::try_from(pid).map_err(io::Error::other)?;
        // SAFETY: signalling a pid we spawned and have not reaped yet.
        let rc = unsafe { libc::kill(pid, libc::SIGTERM) };
        if rc == 0 {
            Ok(())
        } else {
            Err(io::Error::last_os_error())
        }
    }

    #[cfg(not(unix))]
    fn terminate(&mut self) -> io::Result<()> {
        self.0.start_kill()
    }

    async fn kill(&mut self) -> io::Result<()> {
        self.0.kill().await
    }
}
