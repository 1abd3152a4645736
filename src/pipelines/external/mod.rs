// SPDX-License-Identifier: GPL-3.0-only

//! Helper-process stage
//!
//! Image bytes are piped through an external program, one process per image:
//!
//! ```text
//!            ┌──────────── helper ────────────┐
//! upstream ─▶│ stdin ──▶ /bin/sh -c "prog…" ──▶│ stdout ─▶ downstream
//!            │                    └──────────▶│ stderr ─▶ log
//!            └────────────────────────────────┘
//! ```
//!
//! All three pipes are non-blocking. A pump step polls them once, drains
//! stderr into a message buffer, forwards whatever stdout has, and writes as
//! much input as stdin takes. Between unproductive steps the stage waits for
//! readiness for at most the configured helper wait, so a slow helper never
//! stalls the caller for longer than that at a time.
//!
//! At end-of-image stdin is closed and stdout is drained until the helper
//! closes it. The exit status decides whether downstream sees end-of-image or
//! end-of-file. Helpers are never signalled; an abandoned helper is starved by
//! closing its pipes and then reaped.

mod pipes;
mod probe;

pub use pipes::host_pipe_capacity;
pub use probe::helper_available;

use crate::config::PipelineConfig;
use crate::constants::{
    DEFAULT_HELPER_WAIT, DEFAULT_SHELL, FALLBACK_PIPE_CAPACITY, MAX_HELPER_READ_BUFFER,
};
use crate::errors::{PipelineError, PipelineResult};
use crate::pipelines::context::Context;
use crate::pipelines::filters::Identity;
use crate::pipelines::marker::{Marker, SequenceState};
use crate::pipelines::stage::{Counting, Output, Stage, Transform};
use pipes::{READABLE, WRITABLE};
use std::io::{ErrorKind, Read, Write};
use std::os::unix::io::{AsRawFd, RawFd};
use std::os::unix::process::ExitStatusExt;
use std::process::{Child, ChildStderr, ChildStdin, ChildStdout, Command, ExitStatus, Stdio};
use std::time::Duration;
use tracing::{debug, error, info, warn};

const STDERR_CHUNK: usize = 4096;

/// Longest wait for diagnostics between exit checks while reaping
const REAP_POLL_MS: libc::c_int = 50;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Pipe {
    Input,
    Output,
    Diagnostics,
}

/// One running helper process and its pipes
struct Helper {
    command: String,
    child: Child,
    stdin: Option<ChildStdin>,
    stdout: Option<ChildStdout>,
    stderr: Option<ChildStderr>,
    buf: Vec<u8>,
    message: Vec<u8>,
    /// First I/O breakdown on a pipe
    broken: Option<String>,
    reaped: bool,
}

impl Helper {
    fn spawn(shell: &str, command: &str) -> PipelineResult<Self> {
        let mut child = Command::new(shell)
            .arg("-c")
            .arg(command)
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .spawn()
            .map_err(|source| PipelineError::Spawn {
                command: command.to_string(),
                source,
            })?;

        let mut helper = Self {
            command: command.to_string(),
            stdin: child.stdin.take(),
            stdout: child.stdout.take(),
            stderr: child.stderr.take(),
            child,
            buf: Vec::new(),
            message: Vec::new(),
            broken: None,
            reaped: false,
        };

        // On failure the helper is dropped, which closes the pipes and reaps
        helper.prepare()?;
        Ok(helper)
    }

    fn prepare(&mut self) -> PipelineResult<()> {
        let fds: Vec<RawFd> = [
            self.stdin.as_ref().map(AsRawFd::as_raw_fd),
            self.stdout.as_ref().map(AsRawFd::as_raw_fd),
            self.stderr.as_ref().map(AsRawFd::as_raw_fd),
        ]
        .into_iter()
        .flatten()
        .collect();

        for fd in fds {
            pipes::set_nonblocking(fd)?;
            pipes::set_cloexec(fd)?;
        }

        let capacity = self
            .stdout
            .as_ref()
            .and_then(|out| pipes::pipe_capacity(out.as_raw_fd()))
            .unwrap_or(FALLBACK_PIPE_CAPACITY)
            .min(MAX_HELPER_READ_BUFFER);
        self.buf = read_buffer(capacity);
        Ok(())
    }

    /// Whether the helper still takes input
    fn accepts_input(&self) -> bool {
        self.stdin.is_some()
    }

    /// Poll all open pipes once and service whichever are ready
    ///
    /// Returns how much of `input` the helper took.
    fn step(
        &mut self,
        input: &[u8],
        timeout_ms: libc::c_int,
        out: &mut dyn Output,
    ) -> PipelineResult<usize> {
        let mut roles = Vec::with_capacity(3);
        let mut fds = Vec::with_capacity(3);

        if let Some(err) = &self.stderr {
            roles.push(Pipe::Diagnostics);
            fds.push(pipes::interest(err.as_raw_fd(), libc::POLLIN));
        }
        if let Some(stdout) = &self.stdout {
            roles.push(Pipe::Output);
            fds.push(pipes::interest(stdout.as_raw_fd(), libc::POLLIN));
        }
        if let Some(stdin) = &self.stdin
            && !input.is_empty()
        {
            roles.push(Pipe::Input);
            fds.push(pipes::interest(stdin.as_raw_fd(), libc::POLLOUT));
        }

        if pipes::poll(&mut fds, timeout_ms)? == 0 {
            return Ok(0);
        }

        let mut taken = 0;
        for (role, fd) in roles.iter().zip(&fds) {
            match role {
                Pipe::Diagnostics if fd.revents & READABLE != 0 => self.drain_stderr(),
                Pipe::Output if fd.revents & READABLE != 0 => self.drain_stdout(out)?,
                Pipe::Input if fd.revents & WRITABLE != 0 => taken = self.feed(input),
                _ => {}
            }
        }
        Ok(taken)
    }

    fn drain_stdout(&mut self, out: &mut dyn Output) -> PipelineResult<()> {
        let Some(stdout) = self.stdout.as_mut() else {
            return Ok(());
        };

        let mut closed = false;
        loop {
            match stdout.read(&mut self.buf) {
                Ok(0) => {
                    debug!(command = %self.command, "Helper closed its output");
                    closed = true;
                    break;
                }
                Ok(n) => out.write_all(&self.buf[..n])?,
                Err(e) if e.kind() == ErrorKind::WouldBlock => break,
                Err(e) if e.kind() == ErrorKind::Interrupted => continue,
                Err(e) => {
                    error!(command = %self.command, error = %e, "Reading helper output failed");
                    self.broken.get_or_insert_with(|| format!("reading output: {e}"));
                    closed = true;
                    break;
                }
            }
        }

        if closed {
            self.stdout = None;
        }
        Ok(())
    }

    fn drain_stderr(&mut self) {
        let Some(stderr) = self.stderr.as_mut() else {
            return;
        };

        let mut chunk = [0u8; STDERR_CHUNK];
        let mut closed = false;
        loop {
            match stderr.read(&mut chunk) {
                Ok(0) => {
                    closed = true;
                    break;
                }
                Ok(n) => self.message.extend_from_slice(&chunk[..n]),
                Err(e) if e.kind() == ErrorKind::WouldBlock => break,
                Err(e) if e.kind() == ErrorKind::Interrupted => continue,
                Err(e) => {
                    warn!(command = %self.command, error = %e, "Reading helper diagnostics failed");
                    closed = true;
                    break;
                }
            }
        }

        if closed {
            self.stderr = None;
        }
    }

    fn feed(&mut self, input: &[u8]) -> usize {
        let Some(stdin) = self.stdin.as_mut() else {
            return 0;
        };

        let failure = loop {
            match stdin.write(input) {
                Ok(n) => return n,
                Err(e) if e.kind() == ErrorKind::WouldBlock => return 0,
                Err(e) if e.kind() == ErrorKind::Interrupted => continue,
                Err(e) => break e,
            }
        };

        error!(command = %self.command, error = %failure, "Helper stopped accepting input");
        self.broken
            .get_or_insert_with(|| format!("writing input: {failure}"));
        self.stdin = None;
        0
    }

    /// Close stdin, drain stdout until the helper closes it, then reap
    ///
    /// Returns the failure reason, `None` for a clean exit.
    fn finish(&mut self, out: &mut dyn Output) -> PipelineResult<Option<String>> {
        self.stdin = None;
        while self.stdout.is_some() {
            self.step(&[], -1, out)?;
        }
        Ok(self.reap())
    }

    /// Close stdin and stdout, wait for the exit and flush diagnostics
    fn reap(&mut self) -> Option<String> {
        self.stdin = None;
        self.stdout = None;

        let status = self.wait_exit();
        self.reaped = true;

        self.drain_stderr();
        self.stderr = None;

        let reason = match status {
            Ok(status) if status.success() => self.broken.take(),
            Ok(status) => Some(describe_exit(status)),
            Err(e) => Some(format!("waiting for helper: {e}")),
        };
        self.flush_message(reason.is_some());
        reason
    }

    /// Wait for the exit while keeping stderr drained
    ///
    /// A helper blocked on a full stderr pipe never exits, so diagnostics are
    /// read until the pipe closes or the child is gone.
    fn wait_exit(&mut self) -> std::io::Result<ExitStatus> {
        loop {
            self.drain_stderr();
            let Some(fd) = self.stderr.as_ref().map(AsRawFd::as_raw_fd) else {
                break;
            };
            if let Some(status) = self.child.try_wait()? {
                return Ok(status);
            }

            let mut fds = [pipes::interest(fd, libc::POLLIN)];
            if let Err(e) = pipes::poll(&mut fds, REAP_POLL_MS) {
                warn!(command = %self.command, error = %e, "Polling helper diagnostics failed");
                self.stderr = None;
            }
        }

        loop {
            match self.child.wait() {
                Err(e) if e.kind() == ErrorKind::Interrupted => continue,
                result => return result,
            }
        }
    }

    fn flush_message(&mut self, failed: bool) {
        if self.message.is_empty() {
            return;
        }
        let text = String::from_utf8_lossy(&self.message);
        let text = text.trim_end();
        if failed {
            warn!(command = %self.command, stderr = %text, "Helper diagnostics");
        } else {
            info!(command = %self.command, stderr = %text, "Helper diagnostics");
        }
        self.message.clear();
    }
}

impl Drop for Helper {
    fn drop(&mut self) {
        if !self.reaped {
            debug!(command = %self.command, "Reaping dropped helper");
            let _ = self.reap();
        }
    }
}

/// Allocate the stdout read buffer, settling for the fallback size if needed
fn read_buffer(capacity: usize) -> Vec<u8> {
    let mut buf = Vec::new();
    let size = if buf.try_reserve_exact(capacity).is_ok() {
        capacity
    } else {
        warn!(
            capacity,
            fallback = FALLBACK_PIPE_CAPACITY,
            "Helper read buffer allocation failed"
        );
        FALLBACK_PIPE_CAPACITY
    };
    buf.resize(size, 0);
    buf
}

/// Describe an unsuccessful exit status
fn describe_exit(status: ExitStatus) -> String {
    match (status.code(), status.signal()) {
        (_, Some(signal)) if status.core_dumped() => {
            format!("killed by signal {signal} (core dumped)")
        }
        (_, Some(signal)) => format!("killed by signal {signal}"),
        (Some(code), None) => format!("exit status {code}"),
        (None, None) => status.to_string(),
    }
}

/// Stage running an external program for every image
///
/// The hooks `T` shape the outgoing context and may add command line
/// arguments; the bytes themselves are transformed by the helper, so
/// [`Transform::transform`] and [`Transform::flush`] are not consulted.
pub struct ExternalProcess<T: Transform = Identity> {
    program: String,
    shell: String,
    wait: Duration,
    hooks: T,
    state: SequenceState,
    output: Context,
    helper: Option<Helper>,
}

impl ExternalProcess<Identity> {
    /// Run `program` as a plain filter
    pub fn new(program: impl Into<String>) -> Self {
        Self::with_hooks(program, Identity)
    }
}

impl<T: Transform> ExternalProcess<T> {
    /// Run `program`, consulting `hooks` for contexts and arguments
    pub fn with_hooks(program: impl Into<String>, hooks: T) -> Self {
        Self {
            program: program.into(),
            shell: DEFAULT_SHELL.to_string(),
            wait: DEFAULT_HELPER_WAIT,
            hooks,
            state: SequenceState::default(),
            output: Context::default(),
            helper: None,
        }
    }

    /// Shell used to interpret the command line
    pub fn with_shell(mut self, shell: impl Into<String>) -> Self {
        self.shell = shell.into();
        self
    }

    /// Longest readiness wait between unproductive pump steps
    pub fn with_wait(mut self, wait: Duration) -> Self {
        self.wait = wait;
        self
    }

    /// Take shell and wait from `config`
    pub fn configured(self, config: &PipelineConfig) -> Self {
        self.with_shell(config.shell.clone())
            .with_wait(Duration::from_millis(config.helper_wait_ms))
    }

    /// Whether a helper process is alive for the current image
    pub fn is_running(&self) -> bool {
        self.helper.is_some()
    }

    /// Command line for an image described by `ctx`
    pub fn command_line(&self, ctx: &Context) -> String {
        let mut command = self.program.trim().to_string();
        for arg in self.hooks.arguments(ctx) {
            command.push(' ');
            command.push_str(&arg);
        }
        command
    }

    /// One non-blocking pump step
    ///
    /// Returns how much of `data` the helper took; zero means the caller
    /// keeps the bytes and tries again later. Without a running helper the
    /// bytes are dropped.
    pub fn step(&mut self, data: &[u8], out: &mut dyn Output) -> PipelineResult<usize> {
        let Some(helper) = self.helper.as_mut() else {
            return Ok(data.len());
        };
        helper.step(
            data,
            0,
            &mut Counting {
                out,
                ctx: &mut self.output,
            },
        )
    }

    fn wait_ms(&self) -> libc::c_int {
        self.wait.as_millis().min(libc::c_int::MAX as u128) as libc::c_int
    }

    fn begin_image(&mut self, ctx: &Context, out: &mut dyn Output) -> PipelineResult<()> {
        if self.helper.is_some() {
            warn!(program = %self.program, "Helper of the previous image still running");
            self.abandon();
        }

        self.output = self.hooks.estimate(ctx);
        self.output.reset_counters();

        let command = self.command_line(ctx);
        match Helper::spawn(&self.shell, &command) {
            Ok(helper) => {
                info!(
                    command = %command,
                    pid = helper.child.id(),
                    buffer = helper.buf.len(),
                    "Helper started"
                );
                self.helper = Some(helper);
                out.mark(Marker::BeginImage, &self.output)
            }
            Err(e) => {
                error!(command = %command, error = %e, "Helper could not be started");
                self.hooks.abort();
                self.state.advance(Marker::EndOfFile);
                out.mark(Marker::EndOfFile, &self.output)?;
                Err(e)
            }
        }
    }

    fn end_image(&mut self, out: &mut dyn Output) -> PipelineResult<()> {
        let Some(mut helper) = self.helper.take() else {
            warn!(program = %self.program, "End-of-image without a running helper");
            return out.mark(Marker::EndImage, &self.output);
        };

        let outcome = helper.finish(&mut Counting {
            out: &mut *out,
            ctx: &mut self.output,
        });

        match outcome {
            Ok(None) => {
                let mut finished = self.hooks.finalize(&self.output);
                finished.reconcile();
                debug!(
                    command = %helper.command,
                    octets_out = finished.octets_seen(),
                    "Helper finished"
                );
                self.output = finished;
                out.mark(Marker::EndImage, &self.output)
            }
            Ok(Some(reason)) => {
                error!(command = %helper.command, %reason, "Helper failed");
                self.hooks.abort();
                self.state.advance(Marker::EndOfFile);
                out.mark(Marker::EndOfFile, &self.output)?;
                Err(PipelineError::HelperFailed {
                    command: helper.command.clone(),
                    reason,
                })
            }
            Err(e) => {
                self.hooks.abort();
                Err(e)
            }
        }
    }

    /// Starve and reap the helper after upstream gave up on the image
    fn abandon(&mut self) {
        if let Some(mut helper) = self.helper.take() {
            info!(command = %helper.command, "Abandoning helper");
            if let Some(reason) = helper.reap() {
                debug!(command = %helper.command, %reason, "Abandoned helper ended");
            }
        }
    }
}

impl<T: Transform> Stage for ExternalProcess<T> {
    fn name(&self) -> &str {
        &self.program
    }

    fn mark(&mut self, marker: Marker, ctx: &Context, out: &mut dyn Output) -> PipelineResult<()> {
        let previous = self.state;
        if !self.state.advance(marker) {
            error!(
                stage = %self.program,
                %marker,
                state = ?previous,
                "Out-of-order marker"
            );
        }

        match marker {
            Marker::BeginSequence => {
                self.hooks.begin_sequence(ctx);
                out.mark(marker, ctx)
            }
            Marker::BeginImage => self.begin_image(ctx, out),
            Marker::EndImage => self.end_image(out),
            Marker::EndSequence => out.mark(marker, ctx),
            Marker::EndOfFile => {
                if previous == SequenceState::ImageOpen {
                    self.abandon();
                    self.hooks.abort();
                }
                out.mark(marker, &self.output)
            }
        }
    }

    fn write(&mut self, data: &[u8], out: &mut dyn Output) -> PipelineResult<usize> {
        if !self.state.accepts_payload() {
            warn!(
                stage = %self.program,
                state = ?self.state,
                len = data.len(),
                "Payload outside of an image"
            );
        }

        let wait_ms = self.wait_ms();
        let Some(helper) = self.helper.as_mut() else {
            debug!(stage = %self.program, len = data.len(), "No helper running; payload dropped");
            return Ok(data.len());
        };

        let mut rest = data;
        let mut timeout = 0;
        while !rest.is_empty() {
            let taken = helper.step(
                rest,
                timeout,
                &mut Counting {
                    out: &mut *out,
                    ctx: &mut self.output,
                },
            )?;
            rest = &rest[taken..];

            if !helper.accepts_input() {
                if !rest.is_empty() {
                    debug!(
                        command = %helper.command,
                        dropped = rest.len(),
                        "Helper input closed; payload discarded"
                    );
                }
                break;
            }
            timeout = if taken == 0 { wait_ms } else { 0 };
        }
        Ok(data.len())
    }
}
