//! Test doubles for the runner and prompter seams
//!
//! `FakeRunner` simulates just enough of the system for the layout logic:
//! mount tables, LUKS headers and mappings, active swap, canned stdout for
//! inspection commands, and injected failures. It records every command line
//! it receives. `ScriptedPrompter` replays a queue of answers and fails loudly
//! when the script and the questions drift apart.
//!
//! Nothing here touches a real block device.

use crate::command_runner::{CommandOutput, CommandRunner, ToolCommand};
use crate::error::{LayoutError, Result};
use crate::prompt::Prompter;
use std::cell::RefCell;
use std::collections::{BTreeMap, BTreeSet, VecDeque};

#[derive(Debug, Default)]
struct FakeState {
    log: Vec<String>,
    stdin_log: Vec<Option<String>>,
    responses: Vec<(String, CommandOutput)>,
    /// prefix, output, remaining hits (None = forever)
    failures: Vec<(String, CommandOutput, Option<usize>)>,
    /// (source, target) in mount order
    mounts: Vec<(String, String)>,
    ghost_targets: BTreeSet<String>,
    luks_devices: BTreeSet<String>,
    /// mapper name -> backing device
    mappers: BTreeMap<String, String>,
    swaps: BTreeSet<String>,
}

/// In-memory `CommandRunner`.
#[derive(Debug, Default)]
pub struct FakeRunner {
    state: RefCell<FakeState>,
}

impl FakeRunner {
    pub fn new() -> Self {
        Self::default()
    }

    /// Answer commands whose line starts with `prefix` with `stdout`.
    /// Later registrations win over earlier ones.
    pub fn respond(self, prefix: &str, stdout: &str) -> Self {
        self.state
            .borrow_mut()
            .responses
            .push((prefix.to_string(), CommandOutput::ok(stdout)));
        self
    }

    /// Fail commands whose line starts with `prefix`.
    pub fn fail(self, prefix: &str, code: i32, stderr: &str) -> Self {
        self.state
            .borrow_mut()
            .failures
            .push((prefix.to_string(), CommandOutput::failed(code, stderr), None));
        self
    }

    /// Fail the first `times` commands whose line starts with `prefix`.
    pub fn fail_times(self, prefix: &str, times: usize, code: i32, stderr: &str) -> Self {
        self.state
            .borrow_mut()
            .failures
            .push((prefix.to_string(), CommandOutput::failed(code, stderr), Some(times)));
        self
    }

    /// Pretend `device` already carries a LUKS header.
    pub fn with_luks(self, device: &str) -> Self {
        self.state.borrow_mut().luks_devices.insert(device.to_string());
        self
    }

    /// Pretend `device` is already mounted at `target`.
    pub fn with_mount(self, device: &str, target: &str) -> Self {
        self.state
            .borrow_mut()
            .mounts
            .push((device.to_string(), target.to_string()));
        self
    }

    /// Mounts at `target` succeed but never become visible.
    pub fn ghost_mount(self, target: &str) -> Self {
        self.state.borrow_mut().ghost_targets.insert(target.to_string());
        self
    }

    /// Replace canned stdout for `prefix` on an already-built runner.
    pub fn set_response(&self, prefix: &str, stdout: &str) {
        self.state
            .borrow_mut()
            .responses
            .push((prefix.to_string(), CommandOutput::ok(stdout)));
    }

    /// Every command line received, in order.
    pub fn commands(&self) -> Vec<String> {
        self.state.borrow().log.clone()
    }

    /// Stdin fed to the command at position `n` of `commands()`.
    pub fn stdin_of(&self, n: usize) -> Option<String> {
        self.state.borrow().stdin_log.get(n).cloned().flatten()
    }

    pub fn mounted_targets(&self) -> Vec<String> {
        self.state
            .borrow()
            .mounts
            .iter()
            .map(|(_, target)| target.clone())
            .collect()
    }

    pub fn mapper_is_open(&self, name: &str) -> bool {
        self.state.borrow().mappers.contains_key(name)
    }

    pub fn active_swaps(&self) -> Vec<String> {
        self.state.borrow().swaps.iter().cloned().collect()
    }

    fn simulate(state: &mut FakeState, command: &ToolCommand) -> CommandOutput {
        let args: Vec<&str> = command.get_args().iter().map(String::as_str).collect();
        match command.program() {
            "mount" => {
                let mut positional = Vec::new();
                let mut iter = args.iter();
                while let Some(arg) = iter.next() {
                    match *arg {
                        "--mkdir" => {}
                        "-o" => {
                            iter.next();
                        }
                        other => positional.push(other.to_string()),
                    }
                }
                let [source, target] = positional.as_slice() else {
                    return CommandOutput::failed(1, "mount: bad usage");
                };
                if !state.ghost_targets.contains(target) {
                    state.mounts.push((source.clone(), target.clone()));
                }
                CommandOutput::ok("")
            }
            "umount" => {
                let recursive = args.contains(&"-R");
                let Some(target) = args.iter().rev().find(|a| !a.starts_with('-')) else {
                    return CommandOutput::failed(1, "umount: bad usage");
                };
                let nested = format!("{}/", target.trim_end_matches('/'));
                let before = state.mounts.len();
                state.mounts.retain(|(_, t)| {
                    let hit = t.as_str() == *target || (recursive && t.starts_with(&nested));
                    !hit
                });
                if state.mounts.len() == before {
                    CommandOutput::failed(32, format!("umount: {}: not mounted.", target))
                } else {
                    CommandOutput::ok("")
                }
            }
            "findmnt" => {
                let source = args
                    .iter()
                    .position(|a| *a == "-S")
                    .and_then(|i| args.get(i + 1));
                let targets: Vec<&str> = state
                    .mounts
                    .iter()
                    .filter(|(s, _)| Some(&s.as_str()) == source)
                    .map(|(_, t)| t.as_str())
                    .collect();
                if targets.is_empty() {
                    CommandOutput::failed(1, "")
                } else {
                    CommandOutput::ok(format!("{}\n", targets.join("\n")))
                }
            }
            "cryptsetup" => {
                let Some(pos) = args.iter().position(|a| {
                    matches!(*a, "isLuks" | "luksFormat" | "open" | "close" | "status")
                }) else {
                    return CommandOutput::ok("");
                };
                let operands: Vec<&str> = args[pos + 1..]
                    .iter()
                    .copied()
                    .filter(|a| !a.starts_with('-'))
                    .collect();
                match (args[pos], operands.as_slice()) {
                    ("isLuks", [device, ..]) => {
                        if state.luks_devices.contains(*device) {
                            CommandOutput::ok("")
                        } else {
                            CommandOutput::failed(1, "")
                        }
                    }
                    ("luksFormat", [device, ..]) => {
                        state.luks_devices.insert(device.to_string());
                        CommandOutput::ok("")
                    }
                    ("open", [device, name, ..]) => {
                        if !state.luks_devices.contains(*device) {
                            CommandOutput::failed(1, format!("Device {} is not a valid LUKS device.", device))
                        } else if state.mappers.contains_key(*name) {
                            CommandOutput::failed(5, format!("Device {} already exists.", name))
                        } else {
                            state.mappers.insert(name.to_string(), device.to_string());
                            CommandOutput::ok("")
                        }
                    }
                    ("close", [name, ..]) => {
                        let mapper = format!("/dev/mapper/{}", name);
                        if state.mounts.iter().any(|(s, _)| *s == mapper) {
                            CommandOutput::failed(5, format!("Device {} is still in use.", name))
                        } else if state.mappers.remove(*name).is_some() {
                            CommandOutput::ok("")
                        } else {
                            CommandOutput::failed(4, format!("Device {} is not active.", name))
                        }
                    }
                    ("status", [name, ..]) => {
                        if state.mappers.contains_key(*name) {
                            CommandOutput::ok(format!("/dev/mapper/{} is active.\n", name))
                        } else {
                            CommandOutput::failed(4, format!("/dev/mapper/{} is inactive.\n", name))
                        }
                    }
                    _ => CommandOutput::failed(1, "cryptsetup: bad usage"),
                }
            }
            "swapon" => {
                if let Some(device) = args.last() {
                    state.swaps.insert(device.to_string());
                }
                CommandOutput::ok("")
            }
            "swapoff" => {
                state.swaps.clear();
                CommandOutput::ok("")
            }
            _ => CommandOutput::ok(""),
        }
    }
}

impl CommandRunner for FakeRunner {
    fn execute(&self, command: &ToolCommand) -> Result<CommandOutput> {
        let mut state = self.state.borrow_mut();
        let line = command.command_line();
        state.log.push(line.clone());
        state.stdin_log.push(command.stdin_data().map(str::to_string));

        if let Some((_, output, remaining)) = state
            .failures
            .iter_mut()
            .find(|(p, _, remaining)| line.starts_with(p.as_str()) && *remaining != Some(0))
        {
            if let Some(n) = remaining {
                *n -= 1;
            }
            return Ok(output.clone());
        }
        if let Some((_, output)) = state
            .responses
            .iter()
            .rev()
            .find(|(p, _)| line.starts_with(p.as_str()))
        {
            return Ok(output.clone());
        }
        Ok(Self::simulate(&mut state, command))
    }
}

// ============================================================================
// Scripted prompter
// ============================================================================

/// One queued answer.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Answer {
    Confirm(bool),
    Select(usize),
    Input(String),
    Password(String),
}

/// Replays queued answers in order.
#[derive(Debug, Default)]
pub struct ScriptedPrompter {
    answers: RefCell<VecDeque<Answer>>,
    questions: RefCell<Vec<String>>,
    notifications: RefCell<Vec<String>>,
}

impl ScriptedPrompter {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn confirm(self, answer: bool) -> Self {
        self.push(Answer::Confirm(answer))
    }

    pub fn select(self, index: usize) -> Self {
        self.push(Answer::Select(index))
    }

    pub fn input(self, text: &str) -> Self {
        self.push(Answer::Input(text.to_string()))
    }

    pub fn password(self, secret: &str) -> Self {
        self.push(Answer::Password(secret.to_string()))
    }

    fn push(self, answer: Answer) -> Self {
        self.answers.borrow_mut().push_back(answer);
        self
    }

    pub fn is_exhausted(&self) -> bool {
        self.answers.borrow().is_empty()
    }

    /// Every question asked so far, in order.
    pub fn questions(&self) -> Vec<String> {
        self.questions.borrow().clone()
    }

    /// Every message passed to `notify`.
    pub fn notifications(&self) -> Vec<String> {
        self.notifications.borrow().clone()
    }

    fn next(&self, question: &str, expected: &str) -> Result<Answer> {
        self.questions.borrow_mut().push(question.to_string());
        self.answers.borrow_mut().pop_front().ok_or_else(|| {
            LayoutError::prompt(format!("no scripted {} answer for '{}'", expected, question))
        })
    }

    fn mismatch(question: &str, expected: &str, got: &Answer) -> LayoutError {
        LayoutError::prompt(format!(
            "'{}' expects a {} answer, script has {:?}",
            question, expected, got
        ))
    }
}

impl Prompter for ScriptedPrompter {
    fn confirm(&self, question: &str, _default: bool) -> Result<bool> {
        match self.next(question, "confirm")? {
            Answer::Confirm(answer) => Ok(answer),
            other => Err(Self::mismatch(question, "confirm", &other)),
        }
    }

    fn select(&self, question: &str, items: &[String], _default: usize) -> Result<usize> {
        match self.next(question, "select")? {
            Answer::Select(index) if index < items.len() => Ok(index),
            Answer::Select(index) => Err(LayoutError::prompt(format!(
                "'{}' has {} items, script picked {}",
                question,
                items.len(),
                index
            ))),
            other => Err(Self::mismatch(question, "select", &other)),
        }
    }

    fn input(&self, question: &str, default: Option<&str>) -> Result<String> {
        match self.next(question, "input")? {
            Answer::Input(text) if text.is_empty() => Ok(default.unwrap_or_default().to_string()),
            Answer::Input(text) => Ok(text),
            other => Err(Self::mismatch(question, "input", &other)),
        }
    }

    fn password(&self, question: &str) -> Result<String> {
        match self.next(question, "password")? {
            Answer::Password(secret) => Ok(secret),
            other => Err(Self::mismatch(question, "password", &other)),
        }
    }

    fn notify(&self, message: &str) -> Result<()> {
        self.notifications.borrow_mut().push(message.to_string());
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_fake_mount_table() {
        let runner = FakeRunner::new();
        runner
            .run(&ToolCommand::new("mount").args(["--mkdir", "/dev/sda2", "/mnt"]))
            .unwrap();
        runner
            .run(&ToolCommand::new("mount").args(["--mkdir", "-o", "subvol=@/var", "/dev/sda2", "/mnt/var"]))
            .unwrap();
        assert_eq!(runner.mounted_targets(), vec!["/mnt", "/mnt/var"]);

        let out = runner
            .run(&ToolCommand::query("findmnt").args(["-n", "-o", "TARGET", "-S", "/dev/sda2"]))
            .unwrap();
        assert_eq!(out.stdout, "/mnt\n/mnt/var\n");

        runner.run(&ToolCommand::new("umount").args(["-R", "/mnt"])).unwrap();
        assert!(runner.mounted_targets().is_empty());
        assert!(runner.run(&ToolCommand::new("umount").arg("/mnt")).is_err());
    }

    #[test]
    fn test_fake_luks_lifecycle() {
        let runner = FakeRunner::new();
        let open = ToolCommand::new("cryptsetup").args(["open", "/dev/sda3", "root", "--key-file=-"]);
        assert!(runner.run(&open).is_err());

        runner
            .run(&ToolCommand::new("cryptsetup").args(["-q", "--type", "luks2", "luksFormat", "/dev/sda3", "--key-file=-"]))
            .unwrap();
        runner.run(&open).unwrap();
        assert!(runner.mapper_is_open("root"));
        runner.run(&ToolCommand::new("cryptsetup").args(["close", "root"])).unwrap();
        assert!(!runner.mapper_is_open("root"));
    }

    #[test]
    fn test_failures_take_precedence() {
        let runner = FakeRunner::new()
            .respond("lsblk", "{}")
            .fail("lsblk -J", 1, "boom");
        let out = runner.execute(&ToolCommand::query("lsblk").arg("-J")).unwrap();
        assert!(!out.success);
        assert_eq!(runner.commands(), vec!["lsblk -J"]);
    }

    #[test]
    fn test_scripted_prompter_mismatch() {
        let prompter = ScriptedPrompter::new().confirm(true);
        assert!(Prompter::input(&prompter, "name?", None).is_err());
        assert!(prompter.is_exhausted());
        assert!(Prompter::confirm(&prompter, "again?", true).is_err());
    }
}
