//! Running the external tools the process-backed transports wrap.

use std::io::Write;
use std::path::Path;
use std::process::{Command, Output, Stdio};

use crate::error::{ForemanError, Result};

/// Best message for a failed command: stderr, stdout, or the exit code.
pub fn format_command_error(output: &Output) -> String {
    let stderr = String::from_utf8_lossy(&output.stderr).trim().to_string();
    let stdout = String::from_utf8_lossy(&output.stdout).trim().to_string();

    match (stderr.is_empty(), stdout.is_empty()) {
        (true, true) => format!(
            "Command failed with exit code {}",
            output.status.code().unwrap_or(-1)
        ),
        (true, false) => stdout,
        (false, true) => stderr,
        (false, false) => format!("{}\n{}", stderr, stdout),
    }
}

/// A program invocation.
#[derive(Debug, Clone)]
pub struct Invocation<'a> {
    program: &'a str,
    args: Vec<String>,
    stdin: Option<&'a str>,
    cwd: Option<&'a Path>,
}

impl<'a> Invocation<'a> {
    pub fn new(program: &'a str) -> Self {
        Self {
            program,
            args: Vec::new(),
            stdin: None,
            cwd: None,
        }
    }

    pub fn arg(mut self, arg: impl Into<String>) -> Self {
        self.args.push(arg.into());
        self
    }

    pub fn args<I, S>(mut self, args: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.args.extend(args.into_iter().map(Into::into));
        self
    }

    pub fn stdin(mut self, input: &'a str) -> Self {
        self.stdin = Some(input);
        self
    }

    pub fn current_dir(mut self, dir: &'a Path) -> Self {
        self.cwd = Some(dir);
        self
    }

    fn command_error(&self, message: impl Into<String>) -> ForemanError {
        ForemanError::Command {
            program: self.program.to_string(),
            message: message.into(),
        }
    }

    /// Runs to completion and returns the raw output, whatever the exit code.
    pub fn output(&self) -> Result<Output> {
        log::debug!("running {} {}", self.program, self.args.join(" "));
        let mut cmd = Command::new(self.program);
        cmd.args(&self.args)
            .stdin(if self.stdin.is_some() {
                Stdio::piped()
            } else {
                Stdio::null()
            })
            .stdout(Stdio::piped())
            .stderr(Stdio::piped());
        if let Some(dir) = self.cwd {
            cmd.current_dir(dir);
        }

        let mut child = cmd.spawn().map_err(|e| self.command_error(e.to_string()))?;
        if let Some(input) = self.stdin {
            let mut pipe = child
                .stdin
                .take()
                .ok_or_else(|| self.command_error("stdin was not captured"))?;
            pipe.write_all(input.as_bytes())
                .map_err(|e| self.command_error(e.to_string()))?;
        }
        child
            .wait_with_output()
            .map_err(|e| self.command_error(e.to_string()))
    }

    /// Runs and returns stdout; a non-zero exit is a `Command` error.
    pub fn run(&self) -> Result<String> {
        let output = self.output()?;
        if output.status.success() {
            Ok(String::from_utf8_lossy(&output.stdout).into_owned())
        } else {
            Err(self.command_error(format_command_error(&output)))
        }
    }

    /// Runs and reports only whether the program exited successfully.
    pub fn succeeds(&self) -> bool {
        self.output().map(|o| o.status.success()).unwrap_or(false)
    }
}
