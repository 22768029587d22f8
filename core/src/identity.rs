use sha2::{Digest, Sha256};
use std::fmt;

/// Stable fingerprint keying all locking and state lookups for a job.
///
/// Two invocations with textually identical command lines map to the same
/// identity; an explicit name (see [`Identity::named`]) overrides that.
#[derive(Clone, PartialEq, Eq, Hash)]
pub struct Identity(String);

impl Identity {
    /// Derive an identity from the full argument vector of the command to
    /// run (program + arguments, order-preserving).
    pub fn of_command(argv: &[String]) -> Identity {
        Identity(digest("cmd", &argv.join(" ")))
    }

    /// Derive an identity from a caller-supplied name. Named identities live
    /// in their own digest domain so they can never collide with a command
    /// digest.
    pub fn named(name: &str) -> Identity {
        Identity(digest("name", name))
    }

    /// Hex form, usable as a file name.
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for Identity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl fmt::Debug for Identity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Identity({})", &self.0[..12.min(self.0.len())])
    }
}

fn digest(domain: &str, text: &str) -> String {
    let mut h = Sha256::new();
    h.update(domain.as_bytes());
    h.update([0u8]);
    h.update(text.as_bytes());
    let out = h.finalize();
    let mut s = String::with_capacity(out.len() * 2);
    for b in out {
        use fmt::Write;
        let _ = write!(s, "{b:02x}");
    }
    s
}

#[cfg(test)]
mod tests {
    use super::*;

    fn argv(parts: &[&str]) -> Vec<String> {
        parts.iter().map(|s| s.to_string()).collect()
    }

    #[test]
    fn same_command_same_identity() {
        let a = Identity::of_command(&argv(&["backup", "-x", "/home"]));
        let b = Identity::of_command(&argv(&["backup", "-x", "/home"]));
        assert_eq!(a, b);
    }

    #[test]
    fn argument_order_matters() {
        let a = Identity::of_command(&argv(&["backup", "-x", "/home"]));
        let b = Identity::of_command(&argv(&["backup", "/home", "-x"]));
        assert_ne!(a, b);
    }

    #[test]
    fn fixed_length_hex() {
        let id = Identity::of_command(&argv(&["true"]));
        assert_eq!(id.as_str().len(), 64);
        assert!(id.as_str().chars().all(|c| c.is_ascii_hexdigit()));
    }

    #[test]
    fn named_identity_is_a_distinct_domain() {
        let by_name = Identity::named("true");
        let by_cmd = Identity::of_command(&argv(&["true"]));
        assert_ne!(by_name, by_cmd);
        assert_eq!(Identity::named("nightly"), Identity::named("nightly"));
    }
}
