//! Local process launching for the SSH executor. Every remote step is one
//! `ssh` process; tests swap the runner for scripted output.

use std::ffi::OsString;
use std::process::{Command, Output, Stdio};

use thiserror::Error;

/// Exit code `ssh` reports when the connection itself failed.
pub const SSH_CONNECT_FAILURE: i32 = 255;

/// What a finished process left behind.
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct ProcessOutput {
    /// Exit code, or `None` when the process was killed by a signal.
    pub exit_code: Option<i32>,
    /// Standard output, lossily decoded.
    pub stdout: String,
    /// Standard error, lossily decoded.
    pub stderr: String,
}

impl ProcessOutput {
    /// `true` for a zero exit code.
    #[must_use]
    pub const fn succeeded(&self) -> bool {
        matches!(self.exit_code, Some(0))
    }

    /// `true` when `ssh` could not reach the host at all.
    #[must_use]
    pub const fn connection_failed(&self) -> bool {
        matches!(self.exit_code, Some(SSH_CONNECT_FAILURE))
    }

    /// The most useful line of output for an error message: stderr when the
    /// process wrote any, stdout otherwise.
    #[must_use]
    pub fn diagnostic(&self) -> &str {
        let stderr = self.stderr.trim();
        if stderr.is_empty() {
            self.stdout.trim()
        } else {
            stderr
        }
    }

    /// Exit status as shown in messages, `signal` when there was no code.
    #[must_use]
    pub fn exit_label(&self) -> String {
        self.exit_code
            .map_or_else(|| String::from("signal"), |code| code.to_string())
    }
}

impl From<Output> for ProcessOutput {
    fn from(output: Output) -> Self {
        Self {
            exit_code: output.status.code(),
            stdout: String::from_utf8_lossy(&output.stdout).into_owned(),
            stderr: String::from_utf8_lossy(&output.stderr).into_owned(),
        }
    }
}

/// A process could not be started.
#[derive(Clone, Debug, Error, Eq, PartialEq)]
#[error("cannot launch {program}: {message}")]
pub struct LaunchError {
    /// Program that failed to start.
    pub program: String,
    /// Operating system error text.
    pub message: String,
}

/// Runs a program to completion and captures its output.
pub trait ProcessRunner {
    /// Runs `program` with `args` and waits for it to exit.
    ///
    /// # Errors
    ///
    /// Returns [`LaunchError`] when the process cannot be started.
    fn run(&self, program: &str, args: &[OsString]) -> Result<ProcessOutput, LaunchError>;
}

/// Runs programs on the local host with stdin closed, so a remote shell
/// can never wait on a prompt.
#[derive(Clone, Copy, Debug, Default)]
pub struct SystemRunner;

impl ProcessRunner for SystemRunner {
    fn run(&self, program: &str, args: &[OsString]) -> Result<ProcessOutput, LaunchError> {
        Command::new(program)
            .args(args)
            .stdin(Stdio::null())
            .output()
            .map(ProcessOutput::from)
            .map_err(|err| LaunchError {
                program: program.to_owned(),
                message: err.to_string(),
            })
    }
}
