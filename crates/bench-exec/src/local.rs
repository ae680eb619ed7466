//! Local execution client: a subprocess shell with live streaming, capture
//! and process-group termination on cancellation.

use std::fs;
use std::io;
use std::net::{SocketAddr, TcpStream};
use std::os::unix::fs::PermissionsExt;
use std::os::unix::process::CommandExt;
use std::path::Path;
use std::process::{Child, Command, Stdio};
use std::time::{Duration, Instant};

use portable_pty::{native_pty_system, CommandBuilder, PtySize};

use crate::capture::{CaptureBuffer, Fanout};
use crate::{CommandRequest, CommandResult, Context, ExecError, ExecutionClient, Result};

/// How long a cancelled command gets to exit after SIGINT before its
/// process group is killed.
pub const TERMINATION_GRACE: Duration = Duration::from_secs(2);

const WAIT_POLL_INTERVAL: Duration = Duration::from_millis(50);

#[derive(Default)]
pub struct LocalClient;

impl LocalClient {
    pub fn new() -> LocalClient {
        LocalClient
    }
}

impl ExecutionClient for LocalClient {
    fn run_command(&mut self, ctx: &Context, req: CommandRequest) -> Result<CommandResult> {
        if req.command.trim().is_empty() {
            return Err(ExecError::EmptyCommand);
        }
        if req.use_pty {
            run_with_pty(ctx, req)
        } else {
            run_piped(ctx, req)
        }
    }

    fn check_port(&mut self, ctx: &Context, port: &str, timeout: Duration) -> Result<bool> {
        if let Some(err) = ctx.err() {
            return Err(err);
        }
        let port: u16 = port
            .trim()
            .parse()
            .map_err(|_| ExecError::InvalidPort(port.to_string()))?;
        let addr = SocketAddr::from(([127, 0, 0, 1], port));
        Ok(TcpStream::connect_timeout(&addr, timeout).is_ok())
    }

    fn copy_from_host(&mut self, ctx: &Context, remote: &str, local: &Path) -> Result<()> {
        if let Some(err) = ctx.err() {
            return Err(err);
        }
        if let Some(parent) = local.parent() {
            fs::create_dir_all(parent)?;
        }
        fs::copy(remote, local)?;
        Ok(())
    }

    fn copy_to_host(&mut self, ctx: &Context, local: &Path, remote: &str) -> Result<()> {
        if let Some(err) = ctx.err() {
            return Err(err);
        }
        let dest = Path::new(remote);
        if let Some(parent) = dest.parent() {
            fs::create_dir_all(parent)?;
        }
        fs::copy(local, dest)?;
        fs::set_permissions(dest, fs::Permissions::from_mode(0o755))?;
        Ok(())
    }

    fn close(&mut self) -> Result<()> {
        Ok(())
    }
}

fn run_piped(ctx: &Context, req: CommandRequest) -> Result<CommandResult> {
    let mut cmd = Command::new("sh");
    cmd.arg("-c").arg(&req.command);
    // New process group so cancellation can signal the whole tree.
    cmd.process_group(0);
    cmd.stdout(Stdio::piped());
    cmd.stderr(Stdio::piped());
    cmd.stdin(if req.stdin.is_some() {
        Stdio::piped()
    } else {
        Stdio::null()
    });

    let mut child = cmd.spawn()?;
    let group = child.id() as i32;

    let capture = (!req.disable_capture).then(CaptureBuffer::new);
    let capture_sink = capture.as_ref().map(|c| c.sink());
    let mut stdout_dest = Fanout::new(vec![req.stdout.clone(), capture_sink.clone()]);
    let mut stderr_dest = Fanout::new(vec![req.stderr.clone(), capture_sink]);

    let stdout_pipe = child.stdout.take();
    let stderr_pipe = child.stderr.take();
    let stdin_pipe = child.stdin.take();
    let stdin_src = req.stdin;

    let exit_code = std::thread::scope(|scope| {
        if let (Some(mut src), Some(mut dst)) = (stdin_src, stdin_pipe) {
            scope.spawn(move || {
                let _ = io::copy(&mut src, &mut dst);
            });
        }
        if let Some(mut pipe) = stdout_pipe {
            scope.spawn(move || {
                let _ = io::copy(&mut pipe, &mut stdout_dest);
            });
        }
        if let Some(mut pipe) = stderr_pipe {
            scope.spawn(move || {
                let _ = io::copy(&mut pipe, &mut stderr_dest);
            });
        }
        wait_with_cancellation(ctx, &mut child, group)
    })?;

    let output = capture.map(CaptureBuffer::into_string).unwrap_or_default();
    Ok(CommandResult { output, exit_code })
}

fn run_with_pty(ctx: &Context, req: CommandRequest) -> Result<CommandResult> {
    let pty = native_pty_system();
    let (cols, rows) = pty_dimensions();
    let pair = pty
        .openpty(PtySize {
            rows,
            cols,
            pixel_width: 0,
            pixel_height: 0,
        })
        .map_err(|e| ExecError::Session(e.to_string()))?;

    let mut builder = CommandBuilder::new("sh");
    builder.arg("-c");
    builder.arg(&req.command);
    if let Ok(cwd) = std::env::current_dir() {
        builder.cwd(cwd);
    }

    let mut child = pair
        .slave
        .spawn_command(builder)
        .map_err(|e| ExecError::Session(e.to_string()))?;
    drop(pair.slave);

    let capture = (!req.disable_capture).then(CaptureBuffer::new);
    let capture_sink = capture.as_ref().map(|c| c.sink());
    // The TTY merges stdout and stderr; fan the single stream out to both
    // sinks plus the capture, de-duplicated.
    let mut combined = Fanout::new(vec![req.stdout.clone(), req.stderr.clone(), capture_sink]);

    let mut reader = pair
        .master
        .try_clone_reader()
        .map_err(|e| ExecError::Session(e.to_string()))?;
    let writer = pair
        .master
        .take_writer()
        .map_err(|e| ExecError::Session(e.to_string()))?;
    let stdin_src = req.stdin;

    let exit_code = std::thread::scope(|scope| {
        let copier = scope.spawn(move || {
            let _ = io::copy(&mut reader, &mut combined);
        });
        if let Some(mut src) = stdin_src {
            let mut writer = writer;
            scope.spawn(move || {
                let _ = io::copy(&mut src, &mut writer);
            });
        } else {
            drop(writer);
        }
        let result = wait_pty_child(ctx, child.as_mut());
        drop(pair.master);
        let _ = copier.join();
        result
    })?;

    let output = capture.map(CaptureBuffer::into_string).unwrap_or_default();
    Ok(CommandResult { output, exit_code })
}

/// Poll the child until it exits, honouring cancellation: SIGINT to the
/// process group, then SIGKILL after the grace period.
fn wait_with_cancellation(ctx: &Context, child: &mut Child, group: i32) -> Result<i32> {
    let mut cancelled: Option<(ExecError, Instant)> = None;
    let mut hard_killed = false;
    loop {
        if let Some(status) = child.try_wait()? {
            return match cancelled {
                Some((err, _)) => Err(err),
                None => Ok(status.code().unwrap_or(-1)),
            };
        }
        match &cancelled {
            None => {
                if let Some(err) = ctx.err() {
                    signal_group(group, libc::SIGINT);
                    cancelled = Some((err, Instant::now()));
                }
            }
            Some((_, since)) => {
                if !hard_killed && since.elapsed() >= TERMINATION_GRACE {
                    signal_group(group, libc::SIGKILL);
                    hard_killed = true;
                }
            }
        }
        std::thread::sleep(WAIT_POLL_INTERVAL);
    }
}

fn wait_pty_child(ctx: &Context, child: &mut dyn portable_pty::Child) -> Result<i32> {
    let mut cancelled: Option<(ExecError, Instant)> = None;
    let mut hard_killed = false;
    loop {
        if let Some(status) = child.try_wait()? {
            return match cancelled {
                Some((err, _)) => Err(err),
                None => Ok(status.exit_code() as i32),
            };
        }
        match &cancelled {
            None => {
                if let Some(err) = ctx.err() {
                    if let Some(pid) = child.process_id() {
                        signal_group(pid as i32, libc::SIGINT);
                    }
                    cancelled = Some((err, Instant::now()));
                }
            }
            Some((_, since)) => {
                if !hard_killed && since.elapsed() >= TERMINATION_GRACE {
                    let _ = child.kill();
                    hard_killed = true;
                }
            }
        }
        std::thread::sleep(WAIT_POLL_INTERVAL);
    }
}

/// Signal the process group; fall back to the single process when group
/// signalling is unsupported.
fn signal_group(pid: i32, signal: i32) {
    let rc = unsafe { libc::kill(-pid, signal) };
    if rc != 0 {
        unsafe {
            libc::kill(pid, signal);
        }
    }
}

/// Current terminal dimensions, with a conservative fallback when stdout
/// is not a terminal.
pub(crate) fn pty_dimensions() -> (u16, u16) {
    match terminal_size::terminal_size() {
        Some((terminal_size::Width(w), terminal_size::Height(h))) => (w, h),
        None => (80, 40),
    }
}
