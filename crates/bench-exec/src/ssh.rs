//! SSH execution client backed by libssh2: one authenticated session per
//! host, exec channels for commands, SCP channels for file transfer.
//!
//! Host keys are deliberately accepted without verification; this is a
//! documented security relaxation of the tool, not an oversight. Keep the
//! hosts you point it at trusted.

use std::fs;
use std::io::{self, Read, Write};
use std::net::TcpStream;
use std::path::Path;
use std::time::Duration;

use bench_config::Host;
use tracing::debug;

use crate::capture::{CaptureBuffer, Fanout};
use crate::{CommandRequest, CommandResult, Context, ExecError, ExecutionClient, Result};

pub const DEFAULT_SSH_PORT: u16 = 22;

const STREAM_POLL_INTERVAL: Duration = Duration::from_millis(10);

pub struct SshClient {
    session: ssh2::Session,
    addr: String,
}

impl SshClient {
    /// Connect and authenticate. Key-based auth is tried first (with the
    /// passphrase when configured), then password auth.
    pub fn connect(host: &Host) -> Result<SshClient> {
        let port = host.port.unwrap_or(DEFAULT_SSH_PORT);
        let addr = format!("{}:{}", host.ip, port);

        let tcp = TcpStream::connect(&addr).map_err(|source| ExecError::Connect {
            addr: addr.clone(),
            source,
        })?;

        let mut session = ssh2::Session::new().map_err(|e| ExecError::Session(e.to_string()))?;
        session.set_tcp_stream(tcp);
        session
            .handshake()
            .map_err(|e| ExecError::Session(e.to_string()))?;

        let auth_err = |message: String| ExecError::Auth {
            user: host.username.clone(),
            addr: addr.clone(),
            message,
        };

        if !host.key_file.is_empty() {
            let passphrase =
                (!host.key_password.is_empty()).then_some(host.key_password.as_str());
            session
                .userauth_pubkey_file(
                    &host.username,
                    None,
                    Path::new(&host.key_file),
                    passphrase,
                )
                .map_err(|e| auth_err(e.to_string()))?;
        } else if !host.password.is_empty() {
            session
                .userauth_password(&host.username, &host.password)
                .map_err(|e| auth_err(e.to_string()))?;
        } else {
            return Err(auth_err("no key_file or password configured".to_string()));
        }

        if !session.authenticated() {
            return Err(auth_err("authentication rejected".to_string()));
        }

        debug!(addr = %addr, "ssh session established");
        Ok(SshClient { session, addr })
    }

    /// Whether a binary resolves on the remote PATH.
    fn command_exists(&mut self, ctx: &Context, binary: &str) -> Result<bool> {
        let result = self.run_command(
            ctx,
            CommandRequest {
                command: format!("which {binary}"),
                disable_capture: true,
                ..CommandRequest::default()
            },
        )?;
        Ok(result.exit_code == 0)
    }
}

impl ExecutionClient for SshClient {
    fn run_command(&mut self, ctx: &Context, req: CommandRequest) -> Result<CommandResult> {
        if req.command.trim().is_empty() {
            return Err(ExecError::EmptyCommand);
        }

        let mut channel = self
            .session
            .channel_session()
            .map_err(|e| ExecError::Session(e.to_string()))?;

        if req.use_pty {
            let (cols, rows) = super::local::pty_dimensions();
            channel.request_pty("xterm-256color", None, Some((cols as u32, rows as u32, 0, 0)))?;
        }

        channel.exec(&req.command)?;

        if let Some(mut stdin) = req.stdin {
            io::copy(&mut stdin, &mut channel)?;
            channel.send_eof()?;
        }

        let capture = (!req.disable_capture).then(CaptureBuffer::new);
        let capture_sink = capture.as_ref().map(|c| c.sink());
        // A remote PTY merges stderr into the main stream, so the combined
        // destination fans out to both sinks.
        let (mut stdout_dest, mut stderr_dest) = if req.use_pty {
            (
                Fanout::new(vec![req.stdout.clone(), req.stderr.clone(), capture_sink]),
                Fanout::new(vec![]),
            )
        } else {
            (
                Fanout::new(vec![req.stdout.clone(), capture_sink.clone()]),
                Fanout::new(vec![req.stderr.clone(), capture_sink]),
            )
        };

        // Poll both streams without blocking so cancellation is observed
        // between reads.
        self.session.set_blocking(false);
        let mut buf = [0u8; 8192];
        let mut done_reason: Option<ExecError> = None;
        loop {
            if let Some(err) = ctx.err() {
                done_reason = Some(err);
                break;
            }

            let mut progressed = false;
            match channel.read(&mut buf) {
                Ok(0) => {}
                Ok(n) => {
                    let _ = stdout_dest.write_all(&buf[..n]);
                    progressed = true;
                }
                Err(e) if e.kind() == io::ErrorKind::WouldBlock => {}
                Err(e) => {
                    self.session.set_blocking(true);
                    return Err(e.into());
                }
            }
            match channel.stderr().read(&mut buf) {
                Ok(0) => {}
                Ok(n) => {
                    let _ = stderr_dest.write_all(&buf[..n]);
                    progressed = true;
                }
                Err(e) if e.kind() == io::ErrorKind::WouldBlock => {}
                Err(e) => {
                    self.session.set_blocking(true);
                    return Err(e.into());
                }
            }

            if channel.eof() && !progressed {
                break;
            }
            if !progressed {
                std::thread::sleep(STREAM_POLL_INTERVAL);
            }
        }
        self.session.set_blocking(true);

        if let Some(err) = done_reason {
            // Active termination: libssh2 exposes no signal delivery, so
            // tearing down the exec channel is what stops the remote
            // command. The caller closes the session unconditionally.
            let _ = channel.close();
            debug!(addr = %self.addr, "remote command cancelled, channel closed");
            return Err(err);
        }

        channel.close()?;
        channel.wait_close()?;
        let exit_code = channel.exit_status()?;

        let output = capture.map(CaptureBuffer::into_string).unwrap_or_default();
        Ok(CommandResult { output, exit_code })
    }

    fn check_port(&mut self, ctx: &Context, port: &str, timeout: Duration) -> Result<bool> {
        // The probe runs remotely and needs netcat; surface that preflight
        // failure explicitly instead of reporting the port as closed.
        if !self.command_exists(ctx, "nc")? {
            return Err(ExecError::ProbeMissing("nc"));
        }

        let probe_ctx = ctx.with_timeout(timeout);
        let result = self.run_command(
            &probe_ctx,
            CommandRequest {
                command: format!("nc -z localhost {port}"),
                disable_capture: true,
                ..CommandRequest::default()
            },
        );
        match result {
            Ok(res) => Ok(res.exit_code == 0),
            // The attempt timing out means "not reachable yet"; the retry
            // loop decides whether to try again.
            Err(ExecError::DeadlineExceeded) => Ok(false),
            Err(err) => Err(err),
        }
    }

    fn copy_from_host(&mut self, ctx: &Context, remote: &str, local: &Path) -> Result<()> {
        if let Some(err) = ctx.err() {
            return Err(err);
        }
        if let Some(parent) = local.parent() {
            fs::create_dir_all(parent)?;
        }

        let (mut channel, stat) = self.session.scp_recv(Path::new(remote))?;
        let mut file = fs::File::create(local)?;
        io::copy(&mut (&mut channel).take(stat.size()), &mut file)?;

        channel.send_eof()?;
        channel.wait_eof()?;
        channel.close()?;
        channel.wait_close()?;
        Ok(())
    }

    fn copy_to_host(&mut self, ctx: &Context, local: &Path, remote: &str) -> Result<()> {
        if let Some(err) = ctx.err() {
            return Err(err);
        }
        let mut file = fs::File::open(local)?;
        let size = file.metadata()?.len();

        // Scripts land executable.
        let mut channel = self.session.scp_send(Path::new(remote), 0o755, size, None)?;
        io::copy(&mut file, &mut channel)?;

        channel.send_eof()?;
        channel.wait_eof()?;
        channel.close()?;
        channel.wait_close()?;
        Ok(())
    }

    fn close(&mut self) -> Result<()> {
        let _ = self.session.disconnect(None, "closing", None);
        Ok(())
    }
}
