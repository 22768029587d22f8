use std::process::Stdio;
use std::sync::{Arc, Mutex};
use std::time::Duration;
use thiserror::Error;
use tokio::io::AsyncReadExt;
use tokio::process::{Child, Command};
use tokio::time::timeout;
use tracing::{debug, warn};

/// Fixed window between graceful and forceful termination. Independent of
/// the configured wall-clock timeout: a command that ignores SIGTERM delays
/// the caller by exactly this much, never longer.
pub const KILL_GRACE: Duration = Duration::from_secs(2);

/// How a supervised run ended.
#[derive(Debug, PartialEq, Eq)]
pub enum RunOutcome {
    /// The command exited on its own.
    Completed {
        /// Exit code; `None` if the command died to a signal.
        code: Option<i32>,
        /// Captured standard output.
        stdout: Vec<u8>,
        /// Captured standard error.
        stderr: Vec<u8>,
    },
    /// The command overran the wall-clock ceiling and was terminated.
    /// Output captured before termination is preserved.
    TimedOut {
        /// Captured standard output.
        stdout: Vec<u8>,
        /// Captured standard error.
        stderr: Vec<u8>,
    },
}

/// The command could not be run at all.
#[derive(Debug, Error)]
pub enum SpawnError {
    /// OS-level exec failure (missing executable, permissions, ...).
    #[error("cannot run {program}: {source}")]
    Spawn {
        /// The program that failed to start.
        program: String,
        /// Underlying OS error.
        #[source]
        source: std::io::Error,
    },
    /// Waiting on the child failed.
    #[error("wait for {program}: {source}")]
    Wait {
        /// The program being waited on.
        program: String,
        /// Underlying OS error.
        #[source]
        source: std::io::Error,
    },
    /// The argument vector was empty.
    #[error("no command provided")]
    EmptyCommand,
}

type OutBuf = Arc<Mutex<Vec<u8>>>;

/// Run `argv` once, enforcing `ceiling` as a wall-clock limit.
///
/// The child gets its own process group so the timeout signals cover shell
/// pipelines and subshells. On timeout: SIGTERM the group, wait
/// [`KILL_GRACE`], SIGKILL the group unconditionally and return without
/// waiting further. A SIGTERM/SIGINT delivered to the wrapper itself is
/// forwarded to the group best-effort.
pub async fn run(argv: &[String], ceiling: Option<Duration>) -> Result<RunOutcome, SpawnError> {
    let Some(program) = argv.first().cloned() else {
        return Err(SpawnError::EmptyCommand);
    };
    let mut cmd = Command::new(&program);
    cmd.args(&argv[1..])
        .stdin(Stdio::null())
        .stdout(Stdio::piped())
        .stderr(Stdio::piped());
    #[cfg(unix)]
    cmd.process_group(0);

    let mut child = cmd
        .spawn()
        .map_err(|source| SpawnError::Spawn { program: program.clone(), source })?;
    let pgid = child.id().map(|p| p as i32);
    debug!(pid = ?child.id(), "spawned");

    let stdout = drain(child.stdout.take());
    let stderr = drain(child.stderr.take());
    let forwarder = spawn_signal_forwarder(pgid);

    let waited = match ceiling {
        None => Some(wait(&mut child, &program).await?),
        Some(limit) => match timeout(limit, child.wait()).await {
            Ok(res) => Some(res.map_err(|source| SpawnError::Wait {
                program: program.clone(),
                source,
            })?),
            Err(_) => None,
        },
    };

    let outcome = match waited {
        Some(status) => {
            // Pipes are at EOF once the child is gone; finish draining.
            stdout.1.await.ok();
            stderr.1.await.ok();
            RunOutcome::Completed {
                code: status.code(),
                stdout: snapshot(&stdout.0),
                stderr: snapshot(&stderr.0),
            }
        }
        None => {
            warn!(limit = ?ceiling, "wall-clock ceiling reached, terminating");
            signal_group(&mut child, false);
            if timeout(KILL_GRACE, child.wait()).await.is_err() {
                warn!("graceful termination ignored, killing process group");
                signal_group(&mut child, true);
                let _ = child.try_wait();
            }
            // Bounded drain so an unkillable child cannot hold us here.
            let _ = timeout(Duration::from_millis(200), stdout.1).await;
            let _ = timeout(Duration::from_millis(200), stderr.1).await;
            RunOutcome::TimedOut {
                stdout: snapshot(&stdout.0),
                stderr: snapshot(&stderr.0),
            }
        }
    };

    forwarder.abort();
    Ok(outcome)
}

async fn wait(child: &mut Child, program: &str) -> Result<std::process::ExitStatus, SpawnError> {
    child.wait().await.map_err(|source| SpawnError::Wait {
        program: program.to_string(),
        source,
    })
}

/// Accumulate a pipe into a shared buffer so partial output survives a
/// mid-stream kill.
fn drain<R>(src: Option<R>) -> (OutBuf, tokio::task::JoinHandle<()>)
where
    R: tokio::io::AsyncRead + Unpin + Send + 'static,
{
    let buf: OutBuf = Arc::new(Mutex::new(Vec::new()));
    let sink = Arc::clone(&buf);
    let task = tokio::spawn(async move {
        let Some(mut src) = src else { return };
        let mut chunk = [0u8; 4096];
        loop {
            match src.read(&mut chunk).await {
                Ok(0) | Err(_) => break,
                Ok(n) => {
                    if let Ok(mut b) = sink.lock() {
                        b.extend_from_slice(&chunk[..n]);
                    }
                }
            }
        }
    });
    (buf, task)
}

fn snapshot(buf: &OutBuf) -> Vec<u8> {
    buf.lock().map(|b| b.clone()).unwrap_or_default()
}

fn signal_group(child: &mut Child, forceful: bool) {
    #[cfg(unix)]
    {
        use nix::sys::signal::{killpg, Signal};
        use nix::unistd::Pid;
        if let Some(pid) = child.id().filter(|&p| p > 0) {
            let sig = if forceful { Signal::SIGKILL } else { Signal::SIGTERM };
            let _ = killpg(Pid::from_raw(pid as i32), sig);
        }
    }
    #[cfg(not(unix))]
    {
        if forceful {
            let _ = child.start_kill();
        }
    }
}

/// Forward a termination signal aimed at the wrapper to the child's group,
/// once. Resource hygiene only; classification still follows the child's
/// resulting exit.
#[cfg(unix)]
fn spawn_signal_forwarder(pgid: Option<i32>) -> tokio::task::JoinHandle<()> {
    tokio::spawn(async move {
        use tokio::signal::unix::{signal, SignalKind};
        let (Ok(mut term), Ok(mut int)) =
            (signal(SignalKind::terminate()), signal(SignalKind::interrupt()))
        else {
            return;
        };
        tokio::select! {
            _ = term.recv() => {}
            _ = int.recv() => {}
        }
        use nix::sys::signal::{killpg, Signal};
        use nix::unistd::Pid;
        if let Some(p) = pgid.filter(|&p| p > 0) {
            let _ = killpg(Pid::from_raw(p), Signal::SIGTERM);
        }
    })
}

#[cfg(not(unix))]
fn spawn_signal_forwarder(_pgid: Option<i32>) -> tokio::task::JoinHandle<()> {
    tokio::spawn(async {})
}
