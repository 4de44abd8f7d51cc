//! Interrupt handling for the external tools a session runs
//!
//! sfdisk, mkfs, cryptsetup and mount all write to the target disk from a
//! child process. An interrupted session must stop those children, refuse to
//! start new ones and leave the control thread free to unmount what it
//! mounted.
//!
//! Each tool is spawned as the leader of its own process group and tracked in
//! [`ToolRegistry`] until it is reaped. The first SIGINT, SIGTERM or SIGHUP
//! raises the [`interrupted`] flag and stops every tracked group. A second
//! signal exits on the spot.

use nix::errno::Errno;
use nix::sys::prctl;
use nix::sys::signal::{killpg, Signal};
use nix::unistd::{setpgid, Pid};
use std::collections::BTreeSet;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Mutex, OnceLock};
use std::time::{Duration, Instant};
use tracing::{debug, info, warn};

static REGISTRY: OnceLock<Mutex<ToolRegistry>> = OnceLock::new();
static INTERRUPTED: AtomicBool = AtomicBool::new(false);

/// Grace period before SIGKILL when the session ends normally.
const SESSION_END_GRACE: Duration = Duration::from_secs(5);
/// Grace period before SIGKILL after a termination signal.
const SIGNAL_GRACE: Duration = Duration::from_secs(3);
const POLL_INTERVAL: Duration = Duration::from_millis(100);

/// True once the session has received a termination signal.
pub fn interrupted() -> bool {
    INTERRUPTED.load(Ordering::SeqCst)
}

/// Process groups of tool invocations that have not been reaped yet.
///
/// Group ids equal the leader's pid because every tool is spawned through
/// [`IsolatedSpawn::isolate`].
#[derive(Debug, Default)]
pub struct ToolRegistry {
    groups: BTreeSet<i32>,
    stopping: bool,
}

impl ToolRegistry {
    pub fn global() -> &'static Mutex<ToolRegistry> {
        REGISTRY.get_or_init(|| Mutex::new(ToolRegistry::default()))
    }

    pub fn track(&mut self, pid: u32) {
        if let Ok(pgid) = i32::try_from(pid) {
            self.groups.insert(pgid);
            debug!("tracking tool group {}", pgid);
        }
    }

    pub fn forget(&mut self, pid: u32) {
        if let Ok(pgid) = i32::try_from(pid) {
            self.groups.remove(&pgid);
        }
    }

    /// Stops every tracked group: SIGTERM, then SIGKILL for whatever is
    /// still running after `grace`. Only the first call does anything.
    pub fn stop_all(&mut self, grace: Duration) {
        if std::mem::replace(&mut self.stopping, true) {
            return;
        }
        let groups = std::mem::take(&mut self.groups);
        if groups.is_empty() {
            return;
        }

        info!("stopping {} running tool(s)", groups.len());
        for &pgid in &groups {
            signal_group(pgid, Signal::SIGTERM);
        }

        let deadline = Instant::now() + grace;
        while groups.iter().any(|&pgid| leader_running(pgid)) {
            if Instant::now() >= deadline {
                for &pgid in groups.iter().filter(|&&pgid| leader_running(pgid)) {
                    warn!("tool group {} ignored SIGTERM, killing it", pgid);
                    signal_group(pgid, Signal::SIGKILL);
                }
                return;
            }
            std::thread::sleep(POLL_INTERVAL);
        }
        debug!("all tool groups exited");
    }
}

fn signal_group(pgid: i32, signal: Signal) {
    match killpg(Pid::from_raw(pgid), signal) {
        Ok(()) | Err(Errno::ESRCH) => {}
        Err(e) => warn!("cannot send {} to tool group {}: {}", signal.as_str(), pgid, e),
    }
}

/// A leader that exited but was not reaped yet counts as gone.
fn leader_running(pid: i32) -> bool {
    let Ok(stat) = std::fs::read_to_string(format!("/proc/{}/stat", pid)) else {
        return false;
    };
    // The command name sits in parentheses and may itself contain spaces.
    let state = stat
        .rsplit_once(')')
        .and_then(|(_, rest)| rest.split_whitespace().next());
    !matches!(state, None | Some("Z") | Some("X"))
}

/// Held by `main` for the whole session; stops leftover tools when dropped.
#[derive(Debug, Default)]
pub struct SessionGuard;

impl SessionGuard {
    pub fn new() -> Self {
        Self
    }
}

impl Drop for SessionGuard {
    fn drop(&mut self) {
        if let Ok(mut registry) = ToolRegistry::global().lock() {
            registry.stop_all(SESSION_END_GRACE);
        }
    }
}

/// Routes SIGINT, SIGTERM and SIGHUP to a watcher thread.
///
/// The first signal raises [`interrupted`] and stops running tools; the runner
/// then refuses new commands while cleanup unmounts. The second one exits
/// with status 128 + signal number.
pub fn install_signal_handlers() -> std::io::Result<()> {
    use signal_hook::consts::signal::{SIGHUP, SIGINT, SIGTERM};
    use signal_hook::iterator::Signals;

    let mut signals = Signals::new([SIGINT, SIGTERM, SIGHUP])?;
    std::thread::spawn(move || {
        for sig in signals.forever() {
            let name = Signal::try_from(sig).map(Signal::as_str).unwrap_or("signal");
            if INTERRUPTED.swap(true, Ordering::SeqCst) {
                warn!("second {}, exiting without cleanup", name);
                std::process::exit(128 + sig);
            }
            info!("{} received, stopping running tools", name);
            if let Ok(mut registry) = ToolRegistry::global().lock() {
                registry.stop_all(SIGNAL_GRACE);
            }
        }
    });
    Ok(())
}

/// Spawn configuration for tools that must not outlive the session.
pub trait IsolatedSpawn {
    /// Puts the child in a fresh process group and has the kernel send it
    /// SIGTERM if this process dies first.
    fn isolate(&mut self) -> &mut Self;
}

impl IsolatedSpawn for std::process::Command {
    fn isolate(&mut self) -> &mut Self {
        use std::os::unix::process::CommandExt;
        // SAFETY: the hook only issues the setpgid and prctl syscalls, both
        // async-signal-safe, and touches no memory shared with the parent.
        unsafe {
            self.pre_exec(|| {
                setpgid(Pid::from_raw(0), Pid::from_raw(0))?;
                prctl::set_pdeathsig(Signal::SIGTERM)?;
                Ok(())
            });
        }
        self
    }
}
