use anyhow::Result;
use clap::Parser;
use std::io::Write;
use std::process::ExitCode;
use std::time::Duration;
use tracing::debug;

use warden_core::exec::{self, RunOutcome};
use warden_core::identity::Identity;
use warden_core::lock::{self, Acquire, Conflict};
use warden_core::policy::{self, Disposition};
use warden_core::state::StateStore;
use warden_core::{logx, now_ms, paths};

mod journal;
use journal::Journal;

// Exit classification; a compatibility surface.
const EXIT_OK: u8 = 0;
const EXIT_EXEC: u8 = 1;
const EXIT_ALARM: u8 = 101;
const EXIT_NO_BASELINE: u8 = 102;
const EXIT_NO_COMMAND: u8 = 103;
const EXIT_LOCKED_WITHIN_GRACE: u8 = 104;
const EXIT_CANNOT_KILL: u8 = 106;
const EXIT_STUCK_NEVER_RAN: u8 = 107;
const EXIT_LOCKED: u8 = 108;

#[derive(Parser)]
#[command(
    name = env!("CARGO_PKG_NAME"),
    version,
    about = "Run a command under a lock, a wall-clock ceiling, and a dead-man's-switch alert policy"
)]
struct Cli {
    /// Wall-clock timeout for the command (e.g. 30s, 5m); absent = unbounded
    #[arg(short = 't', value_name = "DURATION", value_parser = parse_duration)]
    timeout: Option<Duration>,

    /// Success interval: tolerate failures while the last success is at most
    /// this old
    #[arg(short = 'X', value_name = "DURATION", value_parser = parse_duration)]
    success_interval: Option<Duration>,

    /// Suppress output even where it would otherwise be surfaced
    #[arg(short = 'q')]
    quiet: bool,

    /// Emit run-outcome messages to the system log
    #[arg(short = 'l')]
    syslog: bool,

    /// Emit system-log messages at debug verbosity
    #[arg(short = 'd')]
    syslog_debug: bool,

    /// Increase diagnostic verbosity (-v info, -vv debug)
    #[arg(short = 'v', action = clap::ArgAction::Count)]
    verbose: u8,

    /// Persist state records in a human-readable encoding
    #[arg(short = 'r')]
    readable: bool,

    /// Explicit identity for locking and state, instead of the command-line
    /// digest
    #[arg(long = "id", value_name = "NAME")]
    id: Option<String>,

    /// The command to run and its arguments
    #[arg(value_name = "COMMAND", trailing_var_arg = true, allow_hyphen_values = true)]
    command: Vec<String>,
}

/// Durations are `<integer>` followed by `s` or `m`; anything else is a
/// fatal argument error (clap reports it with exit code 2).
fn parse_duration(s: &str) -> Result<Duration, String> {
    let err = || format!("invalid duration '{s}' (expected forms like 0s, 2s, 1m)");
    let unit = s.chars().last().ok_or_else(err)?;
    let digits = &s[..s.len() - unit.len_utf8()];
    // Digits only: u64::parse alone would also admit a leading '+'.
    if digits.is_empty() || !digits.bytes().all(|b| b.is_ascii_digit()) {
        return Err(err());
    }
    let n: u64 = digits.parse().map_err(|_| err())?;
    match unit {
        's' => Ok(Duration::from_secs(n)),
        'm' => Ok(Duration::from_secs(n * 60)),
        _ => Err(err()),
    }
}

fn main() -> ExitCode {
    let cli = Cli::parse();
    logx::init(cli.verbose);
    match run(cli) {
        Ok(code) => ExitCode::from(code),
        Err(e) => {
            eprintln!("warden: {e:#}");
            ExitCode::from(EXIT_EXEC)
        }
    }
}

#[tokio::main(flavor = "current_thread")]
async fn run(cli: Cli) -> Result<u8> {
    let mut journal = Journal::open(cli.syslog, cli.syslog_debug);

    if cli.command.is_empty() {
        eprintln!("warden: no command provided");
        return Ok(EXIT_NO_COMMAND);
    }
    let command_line = cli.command.join(" ");

    let id = match &cli.id {
        Some(name) => Identity::named(name),
        None => Identity::of_command(&cli.command),
    };
    debug!(%id, command = %command_line, "resolved identity");
    journal.detail(&format!("identity {id} for: {command_line}"));

    let store = StateStore::open(&paths::state_dir()?, cli.readable)?;

    match lock::acquire(&store, &id, cli.timeout, cli.success_interval.is_some())? {
        Acquire::Granted => {}
        Acquire::Conflict(conflict) => {
            journal.outcome(&format!("not running ({}): {command_line}", conflict.reason()));
            if !cli.quiet {
                eprintln!("warden: not running: {}", conflict.reason());
            }
            return Ok(conflict_exit(conflict));
        }
    }

    let outcome = match exec::run(&cli.command, cli.timeout).await {
        Ok(outcome) => outcome,
        Err(e) => {
            // The command never started; the lock we took must still go.
            lock::release(&store, &id)?;
            journal.outcome(&format!("{e}"));
            if !cli.quiet {
                eprintln!("warden: {e}");
            }
            return Ok(EXIT_EXEC);
        }
    };

    let last_success = store.lock(&id)?.read()?.unwrap_or_default().last_success_ms;
    let grace_ms = cli.success_interval.map(|d| d.as_millis() as u64).unwrap_or(0);
    let disposition = policy::classify(&outcome, last_success, grace_ms, now_ms());
    policy::settle(&store, &id, disposition)?;

    report(&cli, &mut journal, &command_line, disposition, &outcome);
    Ok(disposition_exit(disposition))
}

fn conflict_exit(conflict: Conflict) -> u8 {
    match conflict {
        Conflict::WithinSuccessInterval => EXIT_LOCKED_WITHIN_GRACE,
        Conflict::WithinTimeoutPeriod => EXIT_LOCKED,
        Conflict::NeverSucceeded => EXIT_STUCK_NEVER_RAN,
        Conflict::CannotKill => EXIT_CANNOT_KILL,
    }
}

fn disposition_exit(disposition: Disposition) -> u8 {
    match disposition {
        Disposition::Clean | Disposition::Suppressed => EXIT_OK,
        Disposition::NoBaseline => EXIT_NO_BASELINE,
        Disposition::Stale | Disposition::Timeout => EXIT_ALARM,
    }
}

fn report(
    cli: &Cli,
    journal: &mut Journal,
    command_line: &str,
    disposition: Disposition,
    outcome: &RunOutcome,
) {
    let summary = match disposition {
        Disposition::Clean => format!("ok: {command_line}"),
        Disposition::Suppressed => format!("failed within success interval: {command_line}"),
        Disposition::NoBaseline => {
            format!("failed, no successful run on record: {command_line}")
        }
        Disposition::Stale => format!("failed beyond success interval: {command_line}"),
        Disposition::Timeout => format!("timed out: {command_line}"),
    };
    journal.outcome(&summary);

    if !disposition.surfaces_failure() || cli.quiet {
        return;
    }
    let (stdout, stderr) = match outcome {
        RunOutcome::Completed { stdout, stderr, .. } => (stdout, stderr),
        RunOutcome::TimedOut { stdout, stderr } => (stdout, stderr),
    };
    let _ = std::io::stdout().write_all(stdout);
    let _ = std::io::stderr().write_all(stderr);
    match (disposition, outcome) {
        (Disposition::Timeout, _) => {
            eprintln!("warden: command timed out and was terminated");
        }
        (Disposition::NoBaseline, RunOutcome::Completed { code, .. }) => {
            eprintln!(
                "warden: command failed ({}) and no prior success is on record",
                describe_exit(*code)
            );
        }
        (_, RunOutcome::Completed { code, .. }) => {
            eprintln!("warden: command failed ({})", describe_exit(*code));
        }
        _ => {}
    }
}

fn describe_exit(code: Option<i32>) -> String {
    match code {
        Some(c) => format!("exit {c}"),
        None => "killed by signal".to_string(),
    }
}
