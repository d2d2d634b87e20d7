//! Mode resolution: `BOOTSTRAP | APPLY | TEARDOWN`.

use std::fmt;

use crate::config::Config;

/// Controller operating mode.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Mode {
    /// Observer collects edges; reconciliation is skipped.
    Bootstrap,
    /// Reconciliation runs against the frozen edge set.
    Apply,
    /// Namespace is being deleted; desired policy set is always empty.
    Teardown,
}

impl fmt::Display for Mode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Mode::Bootstrap => "BOOTSTRAP",
            Mode::Apply => "APPLY",
            Mode::Teardown => "TEARDOWN",
        })
    }
}

impl Mode {
    fn from_str(s: &str) -> Option<Mode> {
        match s {
            "BOOTSTRAP" => Some(Mode::Bootstrap),
            "APPLY" => Some(Mode::Apply),
            _ => None,
        }
    }
}

/// Resolve the mode from, in order: env override, namespace annotation,
/// default `BOOTSTRAP`. A namespace with a deletion timestamp always
/// resolves to `TEARDOWN`, overriding everything else.
pub fn resolve_mode(config: &Config, namespace_annotation: Option<&str>, being_deleted: bool) -> Mode {
    if being_deleted {
        return Mode::Teardown;
    }
    if let Some(v) = config.mode_override.as_deref().and_then(Mode::from_str) {
        return v;
    }
    if let Some(v) = namespace_annotation.and_then(Mode::from_str) {
        return v;
    }
    Mode::Bootstrap
}

#[cfg(test)]
mod tests {
    use super::*;

    fn cfg(mode_override: Option<&str>) -> Config {
        let mut c = Config::from_env();
        c.mode_override = mode_override.map(str::to_string);
        c
    }

    #[test]
    fn defaults_to_bootstrap() {
        assert_eq!(resolve_mode(&cfg(None), None, false), Mode::Bootstrap);
    }

    #[test]
    fn env_override_wins_over_annotation() {
        assert_eq!(
            resolve_mode(&cfg(Some("APPLY")), Some("BOOTSTRAP"), false),
            Mode::Apply
        );
    }

    #[test]
    fn annotation_used_when_no_env() {
        assert_eq!(resolve_mode(&cfg(None), Some("APPLY"), false), Mode::Apply);
    }

    #[test]
    fn invalid_values_are_ignored() {
        assert_eq!(resolve_mode(&cfg(Some("bogus")), Some("also-bogus"), false), Mode::Bootstrap);
    }

    #[test]
    fn deletion_always_wins() {
        assert_eq!(resolve_mode(&cfg(Some("APPLY")), Some("APPLY"), true), Mode::Teardown);
    }
}
