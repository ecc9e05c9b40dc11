//! The PTY process supervisor.
//!
//! Owns one child process and the PTY master it runs under: spawn, write,
//! signal, the read pump, and cleanup. `login` and `run` differ only in how
//! the child is spawned and which output channel they report.

use std::io::{Read, Write};
use std::sync::Arc;
use std::thread;
use std::thread::JoinHandle;

use portable_pty::{native_pty_system, Child, CommandBuilder, MasterPty, PtySize};
use tokio::sync::mpsc::UnboundedSender;
use tokio::task;

use super::error::SpawnError;
use crate::protocol::Writer;

/// Read pump chunk size.
const READ_CHUNK_BYTES: usize = 256;

/// Output channel used for `login`'s read pump.
pub const LOGIN_CHANNEL: i32 = -1;
/// Output channel used for `run`'s read pump.
pub const RUN_CHANNEL: i32 = 1;

/// Reads the agent's own controlling terminal size via `TIOCGWINSZ`,
/// falling back to 80x24 when the agent isn't attached to one (e.g. under
/// test). New PTYs inherit this size at open time, and the resize
/// propagator re-queries it on every `SIGWINCH`.
pub fn current_winsize() -> PtySize {
    let mut ws: libc::winsize = unsafe { std::mem::zeroed() };
    let rc = unsafe { libc::ioctl(libc::STDIN_FILENO, libc::TIOCGWINSZ, &mut ws) };
    if rc != 0 || ws.ws_row == 0 || ws.ws_col == 0 {
        return PtySize {
            rows: 24,
            cols: 80,
            pixel_width: 0,
            pixel_height: 0,
        };
    }
    PtySize {
        rows: ws.ws_row,
        cols: ws.ws_col,
        pixel_width: ws.ws_xpixel,
        pixel_height: ws.ws_ypixel,
    }
}

/// Looks up the user's login shell from the password database entry for
/// the effective uid, falling back to `/bin/sh` if that path isn't
/// executable.
fn guess_login_shell() -> String {
    unsafe {
        let pw = libc::getpwuid(libc::geteuid());
        if !pw.is_null() && !(*pw).pw_shell.is_null() && libc::access((*pw).pw_shell, libc::X_OK) == 0 {
            return std::ffi::CStr::from_ptr((*pw).pw_shell)
                .to_string_lossy()
                .into_owned();
        }
    }
    "/bin/sh".to_string()
}

/// One PTY-backed child process plus its read pump.
pub struct PtyProcess {
    pub pid: i32,
    /// The request id that minted this process; reused as the `%output`
    /// envelope id for every chunk its read pump emits.
    pub identifier: u64,
    pub channel: i32,
    pub description: String,
    pub return_code: Option<i32>,
    master: Box<dyn MasterPty + Send>,
    writer: Box<dyn Write + Send>,
    child: Option<Box<dyn Child + Send + Sync>>,
    reader_handle: Option<JoinHandle<()>>,
}

impl PtyProcess {
    /// Used by `login`: a PTY running the user's login shell, `argv[0]`
    /// prefixed with `-` to mark it as a login shell, full environment
    /// inherited, `cwd` expanded for `~` and environment variables.
    pub fn spawn_login(
        identifier: u64,
        cwd: &str,
        extra_args: &[String],
        writer: Arc<Writer>,
        completed: UnboundedSender<i32>,
    ) -> Result<PtyProcess, SpawnError> {
        let expanded_cwd = shellexpand::full(cwd)
            .map(|c| c.into_owned())
            .unwrap_or_else(|_| cwd.to_string());

        let pty_system = native_pty_system();
        let pair = pty_system
            .openpty(current_winsize())
            .map_err(|e| SpawnError::OpenPty(e.to_string()))?;

        let shell = guess_login_shell();
        let mut cmd = if extra_args.is_empty() {
            // Only `new_default_prog()` makes portable-pty prefix argv[0]
            // with `-` for a login shell; it panics on any `.arg()` call
            // afterward, so this branch covers the no-extra-args case.
            // `new_default_prog()` would otherwise pick its shell from
            // `$SHELL` before falling back to the password database;
            // overriding its `SHELL` env var forces the same
            // `guess_login_shell()` passwd-db lookup used everywhere else
            // in this module, so `login` doesn't depend on what happens to
            // be inherited from the caller's environment.
            let mut cmd = CommandBuilder::new_default_prog();
            cmd.env("SHELL", &shell);
            cmd
        } else {
            // `new()`/`from_argv()` use `args[0]` for both PATH resolution
            // and argv[0], so a literal "-bash" would fail to resolve.
            // With trailing args we fall back to a plain (non-login) argv0;
            // portable-pty's public CommandBuilder has no way to combine a
            // dash-prefixed argv0 with extra arguments (see DESIGN.md's
            // Open Question decisions).
            let mut cmd = CommandBuilder::new(&shell);
            cmd.args(extra_args);
            cmd
        };
        cmd.cwd(&expanded_cwd);

        let description = format!("login({expanded_cwd})");
        let spawn_result = pair.slave.spawn_command(cmd);
        drop(pair.slave);
        let child = spawn_result.map_err(|e| SpawnError::Spawn(e.to_string()))?;

        Self::finish_spawn(
            identifier,
            LOGIN_CHANNEL,
            description,
            pair.master,
            child,
            writer,
            completed,
        )
    }

    /// Used by `run`: a PTY running `command` via the user's shell's `-c`
    /// flag, with `LANG=C` forced.
    pub fn spawn_run(
        identifier: u64,
        command: &str,
        writer: Arc<Writer>,
        completed: UnboundedSender<i32>,
    ) -> Result<PtyProcess, SpawnError> {
        let pty_system = native_pty_system();
        let pair = pty_system
            .openpty(current_winsize())
            .map_err(|e| SpawnError::OpenPty(e.to_string()))?;

        let shell = guess_login_shell();
        let mut cmd = CommandBuilder::new(shell);
        cmd.arg("-c");
        cmd.arg(command);
        cmd.env("LANG", "C");

        let description = format!("run({command})");
        let spawn_result = pair.slave.spawn_command(cmd);
        drop(pair.slave);
        let child = spawn_result.map_err(|e| SpawnError::Spawn(e.to_string()))?;

        Self::finish_spawn(
            identifier,
            RUN_CHANNEL,
            description,
            pair.master,
            child,
            writer,
            completed,
        )
    }

    fn finish_spawn(
        identifier: u64,
        channel: i32,
        description: String,
        master: Box<dyn MasterPty + Send>,
        mut child: Box<dyn Child + Send + Sync>,
        writer: Arc<Writer>,
        completed: UnboundedSender<i32>,
    ) -> Result<PtyProcess, SpawnError> {
        let pid = child.process_id().ok_or(SpawnError::NoPid)? as i32;
        let pty_writer = master
            .take_writer()
            .map_err(|e| SpawnError::TakeWriter(e.to_string()))?;
        let reader = master
            .try_clone_reader()
            .map_err(|e| SpawnError::CloneReader(e.to_string()))?;

        let reader_handle = start_reader_thread(reader, identifier, pid, channel, writer, completed);

        log::info!("spawned pid {pid}: {description}");
        Ok(PtyProcess {
            pid,
            identifier,
            channel,
            description,
            return_code: None,
            master,
            writer: pty_writer,
            child: Some(child),
            reader_handle: Some(reader_handle),
        })
    }

    /// Writes bytes to the PTY master unbuffered; partial writes aren't
    /// surfaced.
    pub fn write(&mut self, data: &[u8]) -> std::io::Result<()> {
        self.writer.write_all(data)
    }

    /// Delivers an OS signal directly to the child pid.
    pub fn signal(&self, signal: i32) {
        let rc = unsafe { libc::kill(self.pid, signal) };
        if rc != 0 {
            log::warn!("signal {signal} to pid {} failed: {}", self.pid, std::io::Error::last_os_error());
        }
    }

    pub fn resize(&self, size: PtySize) {
        if let Err(e) = self.master.resize(size) {
            log::warn!("resize of pid {} failed: {e}", self.pid);
        }
    }

    /// Idempotent teardown:
    /// 1. if `return_code` is unset, SIGKILL and wait for exit;
    /// 2. drop the writer (and master) to force the read pump's EOF;
    /// 3. join the read-pump thread.
    ///
    /// Returns the process's final exit code.
    pub async fn cleanup(&mut self) -> i32 {
        if self.return_code.is_none() {
            self.signal(libc::SIGKILL);
            self.return_code = Some(match self.child.take() {
                Some(mut child) => match task::spawn_blocking(move || child.wait()).await {
                    Ok(Ok(status)) => status.exit_code() as i32,
                    Ok(Err(e)) => {
                        log::warn!("wait on pid {} failed: {e}", self.pid);
                        -1
                    }
                    Err(e) => {
                        log::warn!("wait task for pid {} panicked: {e}", self.pid);
                        -1
                    }
                },
                None => -1,
            });
        }

        // Dropping the writer closes our end of the pty, which is what
        // ultimately wakes the blocked reader thread with an EOF.
        self.writer = Box::new(std::io::sink());

        if let Some(handle) = self.reader_handle.take() {
            if let Err(e) = task::spawn_blocking(move || handle.join()).await {
                log::warn!("joining read pump for pid {} failed: {e}", self.pid);
            }
        }

        self.return_code.unwrap_or(-1)
    }
}

/// Blocking read loop run on its own OS thread: loops reading up to
/// [`READ_CHUNK_BYTES`] at a time from the PTY master and emits a framed
/// `%output` chunk for each non-empty read. On EOF or an I/O error the pump
/// exits without emitting an output frame and schedules the pid for
/// teardown.
fn start_reader_thread(
    mut reader: Box<dyn Read + Send>,
    identifier: u64,
    pid: i32,
    channel: i32,
    writer: Arc<Writer>,
    completed: UnboundedSender<i32>,
) -> JoinHandle<()> {
    thread::spawn(move || {
        let mut buf = [0u8; READ_CHUNK_BYTES];
        loop {
            match reader.read(&mut buf) {
                Ok(0) => {
                    log::debug!("pid {pid}: read pump reached EOF");
                    break;
                }
                Ok(n) => writer.output(identifier, pid, channel, &buf[..n]),
                Err(e) => {
                    // A signal (SIGCHLD from reaping, our own SIGWINCH) can
                    // interrupt the blocking read without the pty actually
                    // being done; retry instead of treating it as EOF.
                    let raw = e.raw_os_error().unwrap_or(0);
                    if raw == libc::EAGAIN || raw == libc::EINTR {
                        continue;
                    }
                    log::debug!("pid {pid}: read pump error treated as EOF: {e}");
                    break;
                }
            }
        }
        if completed.send(pid).is_err() {
            log::debug!("pid {pid}: completed channel closed, agent is shutting down");
        }
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn current_winsize_never_reports_a_zero_dimension() {
        let size = current_winsize();
        assert!(size.rows > 0);
        assert!(size.cols > 0);
    }

    #[test]
    fn guess_login_shell_returns_an_absolute_path() {
        let shell = guess_login_shell();
        assert!(shell.starts_with('/'));
    }
}
