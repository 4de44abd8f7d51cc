//! External tool execution
//!
//! Every disk inspection, table edit, format, mount and unmount is a blocking
//! external-process invocation. They all go through the `CommandRunner` trait so
//! the planners and the orchestration never touch `std::process` directly.
//!
//! # Architecture Rule
//!
//! `SystemRunner` is the only place that spawns processes. It:
//!
//! - spawns each tool in its own process group and registers its PID
//! - refuses new commands once the session has been interrupted, unless it is
//!   the cleanup runner used for the final unmount
//! - in dry-run mode, prints destructive commands instead of running them while
//!   read-only queries still execute so the preview is realistic
//! - never logs stdin (LUKS passphrases travel there)

use crate::error::{LayoutError, Result};
use crate::process_guard::{self, IsolatedSpawn, ToolRegistry};
use std::fmt;
use std::io::Write;
use std::process::{Command, Stdio};
use tracing::{debug, info};

/// A single external tool invocation.
#[derive(Clone, PartialEq, Eq)]
pub struct ToolCommand {
    program: String,
    args: Vec<String>,
    stdin: Option<String>,
    read_only: bool,
    interactive: bool,
}

impl ToolCommand {
    /// A command that changes system state (skipped under dry-run).
    pub fn new(program: impl Into<String>) -> Self {
        Self {
            program: program.into(),
            args: Vec::new(),
            stdin: None,
            read_only: false,
            interactive: false,
        }
    }

    /// A query that never changes state (executed even under dry-run).
    pub fn query(program: impl Into<String>) -> Self {
        Self {
            read_only: true,
            ..Self::new(program)
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

    /// Feed `input` on stdin. Never logged.
    pub fn stdin(mut self, input: impl Into<String>) -> Self {
        self.stdin = Some(input.into());
        self
    }

    /// Inherit the terminal (external partition editor).
    pub fn interactive(mut self) -> Self {
        self.interactive = true;
        self
    }

    pub fn program(&self) -> &str {
        &self.program
    }

    pub fn get_args(&self) -> &[String] {
        &self.args
    }

    pub fn stdin_data(&self) -> Option<&str> {
        self.stdin.as_deref()
    }

    pub fn is_read_only(&self) -> bool {
        self.read_only
    }

    pub fn is_interactive(&self) -> bool {
        self.interactive
    }

    /// `program arg1 arg2 ...` as it would be typed in a shell.
    pub fn command_line(&self) -> String {
        if self.args.is_empty() {
            self.program.clone()
        } else {
            format!("{} {}", self.program, self.args.join(" "))
        }
    }
}

// Manual Debug keeps stdin out of logs and panic messages.
impl fmt::Debug for ToolCommand {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ToolCommand")
            .field("command", &self.command_line())
            .field("stdin", &self.stdin.as_ref().map(|_| "<redacted>"))
            .field("read_only", &self.read_only)
            .field("interactive", &self.interactive)
            .finish()
    }
}

impl fmt::Display for ToolCommand {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.command_line())
    }
}

/// Output from a tool execution.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct CommandOutput {
    /// Standard output.
    pub stdout: String,
    /// Standard error.
    pub stderr: String,
    /// Exit code (None if terminated by signal).
    pub exit_code: Option<i32>,
    /// Whether the tool exited successfully (exit code 0).
    pub success: bool,
}

impl CommandOutput {
    /// A successful execution with the given stdout.
    pub fn ok(stdout: impl Into<String>) -> Self {
        Self {
            stdout: stdout.into(),
            stderr: String::new(),
            exit_code: Some(0),
            success: true,
        }
    }

    /// A failed execution with the given exit code and stderr.
    pub fn failed(code: i32, stderr: impl Into<String>) -> Self {
        Self {
            stdout: String::new(),
            stderr: stderr.into(),
            exit_code: Some(code),
            success: false,
        }
    }

    /// Check if the tool succeeded and return an error if not.
    pub fn ensure_success(&self, command: &ToolCommand) -> Result<()> {
        if self.success {
            Ok(())
        } else {
            Err(LayoutError::Tool {
                command: command.command_line(),
                code: self.exit_code.unwrap_or(-1),
                stderr: self.stderr.trim().to_string(),
            })
        }
    }
}

/// Seam between the layout logic and the operating system.
pub trait CommandRunner {
    /// Execute a command and report its outcome, successful or not.
    ///
    /// Returns `Err` only when the command could not be run at all.
    fn execute(&self, command: &ToolCommand) -> Result<CommandOutput>;

    /// Execute a command that must succeed.
    fn run(&self, command: &ToolCommand) -> Result<CommandOutput> {
        let output = self.execute(command)?;
        output.ensure_success(command)?;
        Ok(output)
    }

    /// Execute a command whose exit status is the answer (probes like `isLuks`).
    fn check(&self, command: &ToolCommand) -> Result<bool> {
        Ok(self.execute(command)?.success)
    }

    /// Whether destructive commands are only being previewed.
    fn is_dry_run(&self) -> bool {
        false
    }
}

/// Production runner backed by `std::process::Command`.
#[derive(Debug, Clone, Copy, Default)]
pub struct SystemRunner {
    pub dry_run: bool,
    /// Keeps running after an interrupt (best-effort unmount on the way out).
    cleanup: bool,
}

impl SystemRunner {
    pub fn new(dry_run: bool) -> Self {
        Self {
            dry_run,
            cleanup: false,
        }
    }

    /// Same runner, but not stopped by the interrupt flag.
    pub fn for_cleanup(&self) -> Self {
        Self {
            cleanup: true,
            ..*self
        }
    }

    fn refuse(&self) -> bool {
        !self.cleanup && process_guard::interrupted()
    }

    fn print_dry_run(&self, command: &ToolCommand) {
        match command.stdin_data() {
            // Multi-line stdin is a table script; single-line stdin is a passphrase.
            Some(input) if input.contains('\n') => {
                println!("[DRY RUN] --- BEGIN COMMAND ---");
                println!("> {}", command.command_line());
                println!("{}", input.trim());
                println!("[DRY RUN] --- END COMMAND ---");
            }
            Some(_) => println!("[DRY RUN] <secret> | {}", command.command_line()),
            None => println!("[DRY RUN] {}", command.command_line()),
        }
    }
}

impl CommandRunner for SystemRunner {
    fn is_dry_run(&self) -> bool {
        self.dry_run
    }

    fn execute(&self, command: &ToolCommand) -> Result<CommandOutput> {
        if self.refuse() {
            return Err(LayoutError::Interrupted);
        }

        if self.dry_run && !command.is_read_only() {
            info!("dry-run: skipping `{}`", command.command_line());
            self.print_dry_run(command);
            return Ok(CommandOutput::ok(""));
        }

        info!("exec: {}", command.command_line());

        let mut cmd = Command::new(command.program());
        cmd.args(command.get_args());
        if command.is_interactive() {
            cmd.stdin(Stdio::inherit())
                .stdout(Stdio::inherit())
                .stderr(Stdio::inherit());
        } else {
            cmd.stdin(if command.stdin_data().is_some() {
                Stdio::piped()
            } else {
                Stdio::null()
            })
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .isolate();
        }

        let mut child = cmd.spawn()?;
        let pid = child.id();
        if let Ok(mut registry) = ToolRegistry::global().lock() {
            registry.track(pid);
        }

        if let (Some(input), Some(mut stdin)) = (command.stdin_data(), child.stdin.take()) {
            stdin.write_all(input.as_bytes())?;
        }

        let waited = child.wait_with_output();

        if let Ok(mut registry) = ToolRegistry::global().lock() {
            registry.forget(pid);
        }
        let output = waited?;

        let result = CommandOutput {
            stdout: String::from_utf8_lossy(&output.stdout).to_string(),
            stderr: String::from_utf8_lossy(&output.stderr).to_string(),
            exit_code: output.status.code(),
            success: output.status.success(),
        };

        if result.success {
            debug!("`{}` succeeded", command.program());
        } else {
            debug!(
                "`{}` exited with {:?}: {}",
                command.program(),
                result.exit_code,
                result.stderr.trim()
            );
        }

        if self.refuse() {
            return Err(LayoutError::Interrupted);
        }

        Ok(result)
    }
}
