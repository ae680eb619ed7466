//! Host execution clients.
//!
//! Everything the stage executor needs to talk to one host lives behind
//! [`ExecutionClient`]: running a shell command with live streaming and
//! capture, probing a TCP port, copying files in both directions. Two
//! variants exist, a local subprocess client and an SSH client, selected
//! by whether the host has a network address.

use std::io::{Read, Write};
use std::path::Path;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use bench_config::Host;
use thiserror::Error;

pub mod capture;
pub mod local;
pub mod retry;
pub mod ssh;

pub use capture::{CaptureBuffer, Fanout};
pub use local::LocalClient;
pub use retry::call_with_retry;
pub use ssh::SshClient;

#[derive(Debug, Error)]
pub enum ExecError {
    #[error("empty command")]
    EmptyCommand,
    #[error("failed to connect to {addr}: {source}")]
    Connect {
        addr: String,
        #[source]
        source: std::io::Error,
    },
    #[error("authentication failed for {user}@{addr}: {message}")]
    Auth {
        user: String,
        addr: String,
        message: String,
    },
    #[error("failed to open session: {0}")]
    Session(String),
    #[error("operation cancelled")]
    Cancelled,
    #[error("deadline exceeded")]
    DeadlineExceeded,
    #[error("invalid port '{0}'")]
    InvalidPort(String),
    #[error("{0} is not installed on the remote host")]
    ProbeMissing(&'static str),
    #[error(transparent)]
    Io(#[from] std::io::Error),
    #[error("ssh: {0}")]
    Ssh(#[from] ssh2::Error),
}

pub type Result<T> = std::result::Result<T, ExecError>;

/// Cancellation token with an optional deadline, checked at every
/// suspension point. Cloning shares the cancellation flag; deriving a
/// child with [`Context::with_timeout`] keeps the sooner deadline.
#[derive(Debug, Clone, Default)]
pub struct Context {
    cancelled: Arc<AtomicBool>,
    deadline: Option<Instant>,
}

impl Context {
    pub fn background() -> Context {
        Context::default()
    }

    /// The shared flag, for wiring into a signal handler.
    pub fn cancel_flag(&self) -> Arc<AtomicBool> {
        Arc::clone(&self.cancelled)
    }

    pub fn cancel(&self) {
        self.cancelled.store(true, Ordering::SeqCst);
    }

    /// Child context whose deadline is the sooner of the current one and
    /// `timeout` from now.
    pub fn with_timeout(&self, timeout: Duration) -> Context {
        let candidate = Instant::now() + timeout;
        let deadline = match self.deadline {
            Some(existing) if existing < candidate => existing,
            _ => candidate,
        };
        Context {
            cancelled: Arc::clone(&self.cancelled),
            deadline: Some(deadline),
        }
    }

    pub fn is_cancelled(&self) -> bool {
        self.cancelled.load(Ordering::SeqCst)
    }

    /// The reason this context is done, if it is.
    pub fn err(&self) -> Option<ExecError> {
        if self.is_cancelled() {
            return Some(ExecError::Cancelled);
        }
        if let Some(deadline) = self.deadline {
            if Instant::now() >= deadline {
                return Some(ExecError::DeadlineExceeded);
            }
        }
        None
    }

    /// Sleep for `duration`, returning early with an error when the
    /// context is done.
    pub fn sleep(&self, duration: Duration) -> Result<()> {
        let wake = Instant::now() + duration;
        loop {
            if let Some(err) = self.err() {
                return Err(err);
            }
            let now = Instant::now();
            if now >= wake {
                return Ok(());
            }
            std::thread::sleep((wake - now).min(Duration::from_millis(50)));
        }
    }
}

/// A live output sink shared between the caller and the stream copiers.
/// The fan-out writer de-duplicates sinks by pointer identity so a sink
/// passed for both stdout and stderr receives every byte exactly once.
pub type SharedSink = Arc<Mutex<dyn Write + Send>>;

/// How a command should be executed by an [`ExecutionClient`].
pub struct CommandRequest {
    /// Shell or binary invocation to run.
    pub command: String,
    /// Optional live stdout sink.
    pub stdout: Option<SharedSink>,
    /// Optional live stderr sink.
    pub stderr: Option<SharedSink>,
    /// Optional stdin source.
    pub stdin: Option<Box<dyn Read + Send>>,
    /// Request a PTY when supported. The PTY path merges stdout and stderr
    /// into one stream, like a hardware TTY.
    pub use_pty: bool,
    /// When set, no combined output is retained; live sinks still stream.
    pub disable_capture: bool,
}

impl CommandRequest {
    pub fn new(command: impl Into<String>) -> CommandRequest {
        CommandRequest {
            command: command.into(),
            ..CommandRequest::default()
        }
    }
}

impl Default for CommandRequest {
    fn default() -> CommandRequest {
        CommandRequest {
            command: String::new(),
            stdout: None,
            stderr: None,
            stdin: None,
            use_pty: false,
            disable_capture: false,
        }
    }
}

/// Outcome of a command invocation. A non-zero exit code is not an error
/// at this layer; callers decide whether to treat it as one.
#[derive(Debug, Default)]
pub struct CommandResult {
    /// Combined stdout+stderr, empty when capture was disabled.
    pub output: String,
    pub exit_code: i32,
}

/// Capability set every host variant provides.
pub trait ExecutionClient: Send {
    fn run_command(&mut self, ctx: &Context, req: CommandRequest) -> Result<CommandResult>;

    /// Whether a TCP port on the host is accepting connections.
    fn check_port(&mut self, ctx: &Context, port: &str, timeout: Duration) -> Result<bool>;

    /// Copy a file from the host into `local`, creating parent directories
    /// and overwriting any existing file.
    fn copy_from_host(&mut self, ctx: &Context, remote: &str, local: &Path) -> Result<()>;

    /// Copy a local file onto the host with mode 0755.
    fn copy_to_host(&mut self, ctx: &Context, local: &Path, remote: &str) -> Result<()>;

    /// Release session resources.
    fn close(&mut self) -> Result<()>;
}

/// Open the right client variant for a host: local when it has no network
/// address, SSH otherwise.
pub fn open_client(host: &Host) -> Result<Box<dyn ExecutionClient>> {
    if host.is_local() {
        Ok(Box::new(LocalClient::new()))
    } else {
        Ok(Box::new(SshClient::connect(host)?))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn context_reports_cancellation() {
        let ctx = Context::background();
        assert!(ctx.err().is_none());
        ctx.cancel();
        assert!(matches!(ctx.err(), Some(ExecError::Cancelled)));
    }

    #[test]
    fn child_context_keeps_sooner_deadline() {
        let ctx = Context::background().with_timeout(Duration::from_millis(10));
        let child = ctx.with_timeout(Duration::from_secs(60));
        std::thread::sleep(Duration::from_millis(20));
        assert!(matches!(child.err(), Some(ExecError::DeadlineExceeded)));
    }

    #[test]
    fn cancellation_propagates_to_children() {
        let ctx = Context::background();
        let child = ctx.with_timeout(Duration::from_secs(60));
        ctx.cancel();
        assert!(matches!(child.err(), Some(ExecError::Cancelled)));
    }

    #[test]
    fn sleep_aborts_early_when_cancelled() {
        let ctx = Context::background();
        let flag = ctx.cancel_flag();
        let handle = std::thread::spawn(move || {
            std::thread::sleep(Duration::from_millis(60));
            flag.store(true, std::sync::atomic::Ordering::SeqCst);
        });
        let start = Instant::now();
        let err = ctx.sleep(Duration::from_secs(10)).expect_err("must abort");
        assert!(matches!(err, ExecError::Cancelled));
        assert!(start.elapsed() < Duration::from_secs(2));
        handle.join().unwrap();
    }
}
