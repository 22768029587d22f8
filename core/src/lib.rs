#![deny(missing_docs)]
//! warden_core: shared building blocks for the warden cron guard
//! (identity, state store, lock manager, execution supervisor, alert policy).

/// Job identity derivation (command-line digest or explicit name).
pub mod identity;
/// Per-user state directory resolution.
pub mod paths;
/// Persistent per-identity state records with flock-guarded mutation.
pub mod state;
/// Mutual exclusion with staleness detection and forced reclaim.
pub mod lock;
/// Child process supervision with wall-clock timeout and signal escalation.
pub mod exec;
/// Outcome classification against success history.
pub mod policy;
/// Tracing/log initialization helpers.
pub mod logx;

/// Milliseconds since the Unix epoch.
pub fn now_ms() -> u64 {
    std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .unwrap_or_default()
        .as_millis() as u64
}
