use log::{debug, trace};
use std::fmt;
use std::process::Command;

use crate::utils::error::{FirewallError, FirewallResult};

/// An external command: program plus argument vector.
///
/// Arguments are handed to the program verbatim, never through a shell, so a value
/// cannot break out of its argument slot.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CommandLine {
    program: String,
    args: Vec<String>,
}

impl CommandLine {
    /// Create a command with no arguments
    pub fn new(program: impl Into<String>) -> Self {
        Self {
            program: program.into(),
            args: Vec::new(),
        }
    }

    /// Append one argument
    pub fn arg(mut self, arg: impl Into<String>) -> Self {
        self.args.push(arg.into());
        self
    }

    /// Append several arguments
    pub fn args<I, S>(mut self, args: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.args.extend(args.into_iter().map(Into::into));
        self
    }

    pub fn program(&self) -> &str {
        &self.program
    }

    pub fn arg_list(&self) -> &[String] {
        &self.args
    }
}

impl fmt::Display for CommandLine {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.program)?;
        for arg in &self.args {
            if arg.is_empty() || arg.contains(char::is_whitespace) {
                write!(f, " '{}'", arg)?;
            } else {
                write!(f, " {}", arg)?;
            }
        }
        Ok(())
    }
}

/// Executes external commands on behalf of the text backend and the list scripts
pub trait CommandRunner {
    /// Run the command to completion and return its standard output
    fn run(&mut self, command: &CommandLine) -> FirewallResult<String>;
}

/// Runs commands as child processes and waits for them
#[derive(Debug, Default, Clone, Copy)]
pub struct ProcessRunner;

impl CommandRunner for ProcessRunner {
    fn run(&mut self, command: &CommandLine) -> FirewallResult<String> {
        debug!("Executing: {}", command);

        let output = Command::new(command.program())
            .args(command.arg_list())
            .output()
            .map_err(|e| FirewallError::ExecutionError {
                command: command.to_string(),
                detail: e.to_string(),
            })?;

        if !output.status.success() {
            let stderr = String::from_utf8_lossy(&output.stderr);
            return Err(FirewallError::ExecutionError {
                command: command.to_string(),
                detail: format!("{} ({})", stderr.trim(), output.status),
            });
        }

        let stdout = String::from_utf8_lossy(&output.stdout).into_owned();
        trace!("Command output: {}", stdout.trim_end());
        Ok(stdout)
    }
}

/// Records commands instead of running them.
///
/// Used by the dry-run backend to show what would be executed, and by tests.
/// Canned replies are matched by argument prefix, e.g. `["list", "tables"]`.
#[derive(Debug, Default)]
pub struct RecordingRunner {
    /// Every command handed to `run`, in order
    pub commands: Vec<CommandLine>,
    replies: Vec<(Vec<String>, String)>,
    failures: Vec<Vec<String>>,
}

impl RecordingRunner {
    pub fn new() -> Self {
        Self::default()
    }

    /// Reply with `stdout` to commands whose arguments start with `prefix`
    pub fn reply(mut self, prefix: &[&str], stdout: &str) -> Self {
        self.replies
            .push((prefix.iter().map(|s| s.to_string()).collect(), stdout.to_string()));
        self
    }

    /// Fail commands whose arguments start with `prefix`
    pub fn fail_on(mut self, prefix: &[&str]) -> Self {
        self.failures
            .push(prefix.iter().map(|s| s.to_string()).collect());
        self
    }

    fn matches(prefix: &[String], command: &CommandLine) -> bool {
        command.arg_list().len() >= prefix.len()
            && prefix.iter().zip(command.arg_list()).all(|(p, a)| p == a)
    }
}

impl CommandRunner for RecordingRunner {
    fn run(&mut self, command: &CommandLine) -> FirewallResult<String> {
        self.commands.push(command.clone());

        if self.failures.iter().any(|p| Self::matches(p, command)) {
            return Err(FirewallError::ExecutionError {
                command: command.to_string(),
                detail: "exit status: 1".to_string(),
            });
        }

        Ok(self
            .replies
            .iter()
            .find(|(prefix, _)| Self::matches(prefix, command))
            .map(|(_, stdout)| stdout.clone())
            .unwrap_or_default())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn display_quotes_arguments_with_spaces() {
        let cmd = CommandLine::new("script.sh")
            .arg("whitelist")
            .arg("add")
            .arg("pass tcp any any");
        assert_eq!(cmd.to_string(), "script.sh whitelist add 'pass tcp any any'");
    }

    #[test]
    fn recording_runner_replies_by_prefix() {
        let mut runner = RecordingRunner::new().reply(&["list", "tables"], "table ip filter\n");
        let out = runner
            .run(&CommandLine::new("nft").args(["list", "tables", "ip"]))
            .unwrap();
        assert_eq!(out, "table ip filter\n");
        let out = runner
            .run(&CommandLine::new("nft").args(["flush", "ruleset"]))
            .unwrap();
        assert!(out.is_empty());
        assert_eq!(runner.commands.len(), 2);
    }

    #[test]
    fn missing_program_is_an_execution_error() {
        let err = ProcessRunner
            .run(&CommandLine::new("/nonexistent/nft-policy-test-binary"))
            .unwrap_err();
        assert!(matches!(err, FirewallError::ExecutionError { .. }));
    }
}
