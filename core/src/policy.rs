use crate::exec::RunOutcome;
use crate::identity::Identity;
use crate::state::StateStore;
use anyhow::Result;
use tracing::debug;

/// Final classification of a run that reached the execution supervisor.
///
/// A small decision tree over success history and grace configuration,
/// evaluated once per run by [`classify`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Disposition {
    /// The run satisfied the success predicate. Silent, exit 0,
    /// `last_success` advances.
    Clean,
    /// The run failed but a success lies within the configured interval.
    /// Tolerated: silent, exit 0, `last_success` unchanged.
    Suppressed,
    /// The run failed and no success has ever been recorded, so a grace
    /// period cannot be evaluated.
    NoBaseline,
    /// The run failed and the last success is older than the configured
    /// interval. The failure is surfaced.
    Stale,
    /// The run overran its wall-clock ceiling. Surfaced; success history is
    /// not consulted.
    Timeout,
}

impl Disposition {
    /// Whether the run's captured output and failure detail are surfaced to
    /// the caller.
    pub fn surfaces_failure(&self) -> bool {
        matches!(self, Disposition::NoBaseline | Disposition::Stale | Disposition::Timeout)
    }
}

/// Success predicate and grace evaluation.
///
/// A completed run is a success iff its exit code is zero and both captured
/// streams are empty: the tool is meant to run silently, and any output is a
/// signal something needs attention.
pub fn classify(
    outcome: &RunOutcome,
    last_success_ms: Option<u64>,
    grace_ms: u64,
    now_ms: u64,
) -> Disposition {
    match outcome {
        RunOutcome::TimedOut { .. } => Disposition::Timeout,
        RunOutcome::Completed { code, stdout, stderr } => {
            if *code == Some(0) && stdout.is_empty() && stderr.is_empty() {
                return Disposition::Clean;
            }
            match last_success_ms {
                None => Disposition::NoBaseline,
                Some(success_ms) => {
                    let elapsed = now_ms.saturating_sub(success_ms);
                    debug!(elapsed, grace_ms, "failure against success history");
                    if elapsed <= grace_ms {
                        Disposition::Suppressed
                    } else {
                        Disposition::Stale
                    }
                }
            }
        }
    }
}

/// Apply the classification to persistent state in one transaction: advance
/// `last_success` on [`Disposition::Clean`], and release the lock whatever
/// the disposition was.
pub fn settle(store: &StateStore, id: &Identity, disposition: Disposition) -> Result<()> {
    let guard = store.lock(id)?;
    let mut record = guard.read()?.unwrap_or_default();
    if disposition == Disposition::Clean {
        record.mark_success(crate::now_ms());
    }
    record.lock = None;
    guard.write(&record)
}
