use std::io;
use std::process::{Command, Output};

use thiserror::Error;
use tracing::debug;

#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error(
    "{context}: `{}` {} stdout='{}' stderr='{}'",
    render_command(.program, .args),
    render_status(.status),
    trimmed(.stdout),
    trimmed(.stderr)
)]
pub struct CommandFailure {
    pub context: String,
    pub program: String,
    pub args: Vec<String>,
    pub status: Option<i32>,
    pub stdout: String,
    pub stderr: String,
}

impl CommandFailure {
    pub fn from_output(command: &Command, context: &str, output: &Output) -> Self {
        let (program, args) = split_command(command);
        Self {
            context: context.to_string(),
            program,
            args,
            status: output.status.code(),
            stdout: String::from_utf8_lossy(&output.stdout).into_owned(),
            stderr: String::from_utf8_lossy(&output.stderr).into_owned(),
        }
    }

    pub fn spawn(command: &Command, context: &str, err: &io::Error) -> Self {
        let (program, args) = split_command(command);
        Self {
            context: context.to_string(),
            program,
            args,
            status: None,
            stdout: String::new(),
            stderr: format!("command failed to start: {err}"),
        }
    }

    /// Failure with an explicit exit status, for executors that do not spawn
    /// a process.
    pub fn exited(command: &Command, context: &str, status: i32, stderr: &str) -> Self {
        let (program, args) = split_command(command);
        Self {
            context: context.to_string(),
            program,
            args,
            status: Some(status),
            stdout: String::new(),
            stderr: stderr.to_string(),
        }
    }
}

/// Seam between rollback logic and the volume manager, bootloader and
/// package tools. Returns captured stdout on success.
pub trait CommandExecutor {
    fn execute(&mut self, command: &mut Command, context: &str) -> Result<String, CommandFailure>;
}

impl<F> CommandExecutor for F
where
    F: FnMut(&mut Command, &str) -> Result<String, CommandFailure>,
{
    fn execute(&mut self, command: &mut Command, context: &str) -> Result<String, CommandFailure> {
        self(command, context)
    }
}

#[derive(Debug, Default, Clone, Copy)]
pub struct SystemExecutor;

impl CommandExecutor for SystemExecutor {
    fn execute(&mut self, command: &mut Command, context: &str) -> Result<String, CommandFailure> {
        run_command(command, context)
    }
}

pub fn run_command(command: &mut Command, context: &str) -> Result<String, CommandFailure> {
    debug!(command = %command_line(command).join(" "), "running external command");
    let output = command
        .output()
        .map_err(|err| CommandFailure::spawn(command, context, &err))?;
    if output.status.success() {
        return Ok(String::from_utf8_lossy(&output.stdout).into_owned());
    }

    Err(CommandFailure::from_output(command, context, &output))
}

pub fn command_line(command: &Command) -> Vec<String> {
    let (program, args) = split_command(command);
    std::iter::once(program).chain(args).collect()
}

fn split_command(command: &Command) -> (String, Vec<String>) {
    let program = command.get_program().to_string_lossy().into_owned();
    let args = command
        .get_args()
        .map(|arg| arg.to_string_lossy().into_owned())
        .collect();
    (program, args)
}

fn render_command(program: &str, args: &[String]) -> String {
    std::iter::once(program)
        .chain(args.iter().map(String::as_str))
        .collect::<Vec<_>>()
        .join(" ")
}

fn trimmed(value: &str) -> &str {
    value.trim()
}

fn render_status(status: &Option<i32>) -> String {
    match status {
        Some(code) => format!("exited with status {code}"),
        None => "did not run".to_string(),
    }
}
