use anyhow::{Context, Result};
use directories::ProjectDirs;
use std::fs;
use std::path::PathBuf;

/// Environment override for the state directory. Intended for tests and for
/// operators who want state somewhere other than the per-user default.
pub const STATE_DIR_ENV: &str = "WARDEN_STATE_DIR";

/// Resolve the per-user state directory, creating it if needed.
///
/// `$WARDEN_STATE_DIR` wins when set and non-empty; otherwise the platform's
/// per-user data-local directory for `warden`.
pub fn state_dir() -> Result<PathBuf> {
    let dir = match std::env::var_os(STATE_DIR_ENV) {
        Some(v) if !v.is_empty() => PathBuf::from(v),
        _ => {
            let pd = ProjectDirs::from("com", "local", "warden")
                .ok_or_else(|| anyhow::anyhow!("failed to resolve a home directory"))?;
            pd.data_local_dir().to_path_buf()
        }
    };
    fs::create_dir_all(&dir)
        .with_context(|| format!("create state dir {}", dir.display()))?;
    Ok(dir)
}

#[cfg(test)]
mod tests {
    use super::*;

    // Mutates process-global env; keep this the only test in the crate that
    // touches WARDEN_STATE_DIR, since the harness runs tests on parallel
    // threads.
    #[test]
    fn env_override_wins_and_is_created() {
        let tmp = tempfile::tempdir().unwrap();
        let want = tmp.path().join("nested").join("state");
        let previous = std::env::var_os(STATE_DIR_ENV);
        std::env::set_var(STATE_DIR_ENV, &want);
        let got = state_dir();
        match previous {
            Some(v) => std::env::set_var(STATE_DIR_ENV, v),
            None => std::env::remove_var(STATE_DIR_ENV),
        }
        assert_eq!(got.unwrap(), want);
        assert!(want.is_dir());
    }
}
