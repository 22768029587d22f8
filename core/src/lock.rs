use crate::exec::KILL_GRACE;
use crate::identity::Identity;
use crate::state::{LockEntry, StateStore};
use anyhow::Result;
use std::time::{Duration, Instant};
use tracing::{debug, warn};

/// Backoff between liveness checks while waiting out a signalled holder.
const POLL_INTERVAL: Duration = Duration::from_millis(100);

/// How long to wait for a SIGKILLed holder to disappear before giving up.
const KILL_CONFIRM: Duration = Duration::from_millis(500);

/// Result of a lock acquisition attempt.
#[derive(Debug, PartialEq, Eq)]
pub enum Acquire {
    /// The lock was written; the caller may run the command.
    Granted,
    /// Another invocation holds the lock; the command must not run.
    Conflict(Conflict),
}

/// Why acquisition was refused. On any conflict no command is executed and
/// the holder's lock is left untouched.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Conflict {
    /// Holder alive and within its own timeout; a success interval is
    /// configured, so a recent success already satisfies the alerting
    /// contract.
    WithinSuccessInterval,
    /// Holder alive and within its own timeout; no success interval is
    /// configured.
    WithinTimeoutPeriod,
    /// Holder overran its declared timeout but this identity has never
    /// succeeded; refused without attempting termination.
    NeverSucceeded,
    /// A stuck holder survived the full termination escalation.
    CannotKill,
}

impl Conflict {
    /// Human-readable reason for logs and stderr.
    pub fn reason(&self) -> &'static str {
        match self {
            Conflict::WithinSuccessInterval => "within success interval",
            Conflict::WithinTimeoutPeriod => "within timeout period but not success interval",
            Conflict::NeverSucceeded => "never run successfully; overlapping invocation",
            Conflict::CannotKill => "cannot kill",
        }
    }
}

/// Try to take the run lock for `id`, declaring `declared_timeout` as our
/// own wall-clock ceiling.
///
/// The whole decision, including the kill escalation against a stuck
/// holder, runs under the identity's exclusive store guard, so two racing
/// invocations serialize here and at most one is granted.
pub fn acquire(
    store: &StateStore,
    id: &Identity,
    declared_timeout: Option<Duration>,
    grace_configured: bool,
) -> Result<Acquire> {
    let guard = store.lock(id)?;
    let mut record = guard.read()?.unwrap_or_default();
    let now = crate::now_ms();

    if let Some(holder) = record.lock.clone() {
        let alive = pid_alive(holder.pid);
        let overrun = holder
            .timeout_ms
            .is_some_and(|t| now.saturating_sub(holder.started_ms) > t);

        if !overrun {
            if alive {
                debug!(pid = holder.pid, "holder alive and within its timeout");
                return Ok(Acquire::Conflict(if grace_configured {
                    Conflict::WithinSuccessInterval
                } else {
                    Conflict::WithinTimeoutPeriod
                }));
            }
            // Crashed without releasing; nothing to overlap with.
            warn!(pid = holder.pid, "clearing lock held by dead process");
        } else {
            if record.last_success_ms.is_none() {
                return Ok(Acquire::Conflict(Conflict::NeverSucceeded));
            }
            warn!(pid = holder.pid, "holder overran its timeout, reclaiming");
            if !terminate_holder(holder.pid) {
                return Ok(Acquire::Conflict(Conflict::CannotKill));
            }
        }
    }

    record.lock = Some(LockEntry {
        pid: std::process::id(),
        started_ms: now,
        timeout_ms: declared_timeout.map(|d| d.as_millis() as u64),
    });
    guard.write(&record)?;
    Ok(Acquire::Granted)
}

/// Clear the lock field unconditionally. Called exactly once per run that
/// reached the execution supervisor, whatever the outcome.
pub fn release(store: &StateStore, id: &Identity) -> Result<()> {
    let guard = store.lock(id)?;
    if let Some(mut record) = guard.read()? {
        record.lock = None;
        guard.write(&record)?;
    }
    Ok(())
}

/// Graceful-then-forceful termination of a stuck holder. Returns `true`
/// once the process is gone, `false` if it survived the escalation.
fn terminate_holder(pid: u32) -> bool {
    if !pid_alive(pid) {
        return true;
    }
    send_term(pid);
    if wait_gone(pid, KILL_GRACE) {
        return true;
    }
    warn!(pid, "holder ignored graceful termination, killing");
    send_kill(pid);
    wait_gone(pid, KILL_CONFIRM)
}

fn wait_gone(pid: u32, window: Duration) -> bool {
    let deadline = Instant::now() + window;
    loop {
        if !pid_alive(pid) {
            return true;
        }
        if Instant::now() >= deadline {
            return false;
        }
        std::thread::sleep(POLL_INTERVAL);
    }
}

#[cfg(unix)]
fn pid_alive(pid: u32) -> bool {
    use nix::errno::Errno;
    use nix::sys::signal::kill;
    use nix::unistd::Pid;
    match kill(Pid::from_raw(pid as i32), None) {
        Ok(()) => true,
        // Exists but not signalable by us: treat as alive.
        Err(Errno::EPERM) => true,
        Err(_) => false,
    }
}

#[cfg(not(unix))]
fn pid_alive(_pid: u32) -> bool {
    true
}

#[cfg(unix)]
fn send_term(pid: u32) {
    use nix::sys::signal::{kill, Signal};
    use nix::unistd::Pid;
    let _ = kill(Pid::from_raw(pid as i32), Signal::SIGTERM);
}

#[cfg(not(unix))]
fn send_term(_pid: u32) {}

#[cfg(unix)]
fn send_kill(pid: u32) {
    use nix::sys::signal::{kill, Signal};
    use nix::unistd::Pid;
    let _ = kill(Pid::from_raw(pid as i32), Signal::SIGKILL);
}

#[cfg(not(unix))]
fn send_kill(_pid: u32) {}
