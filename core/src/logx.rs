use tracing_subscriber::{fmt, EnvFilter};

/// Initialize `tracing` once. Respects `RUST_LOG`; falls back to a level
/// derived from the `-v` count (0 warn, 1 info, 2+ debug). Diagnostics go to
/// stderr so they never count as command output.
pub fn init(verbosity: u8) {
    let default_level = match verbosity {
        0 => "warn",
        1 => "info",
        _ => "debug",
    };
    if std::env::var_os("RUST_LOG").is_none() {
        std::env::set_var("RUST_LOG", default_level);
    }
    let _ = fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .with_target(true)
        .with_writer(std::io::stderr)
        .try_init();
}
