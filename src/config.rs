//! Process configuration, assembled once at startup from the environment.
//!
//! No other module reads `std::env` directly; everything needed downstream
//! is threaded through a [`Config`] value so components stay pure/testable.

use std::time::Duration;

const DEFAULT_NAMESPACE: &str = "trirematics";
const DEFAULT_LOOP_SECONDS: u64 = 5;
const DEFAULT_FLOW_STREAM_ADDR: &str = "http://127.0.0.1:4245";
const DEFAULT_OBSERVED_PATH: &str = "policyBundle/roles.observed.json";
const DEFAULT_FROZEN_PATH: &str = "policyBundle/roles.frozen.json";

/// Controller-wide configuration, read once at process start.
#[derive(Debug, Clone)]
pub struct Config {
    /// Target namespace the controller observes and reconciles.
    pub namespace: String,
    /// Reconcile tick period.
    pub loop_interval: Duration,
    /// Mode override from `CONTROLLER_MODE`/`MODE`, if recognized.
    pub mode_override: Option<String>,
    /// Whether to emit the infra policy family.
    pub manage_infra: bool,
    /// Whether to emit the safety policy family.
    pub enable_safety: bool,
    /// Whether to derive stable ports from Services/Endpoints/containerPorts.
    pub derive_ports: bool,
    /// Extra observer diagnostics.
    pub hubble_debug: bool,
    /// Flow-telemetry gRPC endpoint.
    pub flow_stream_addr: String,
    /// Path to the observed edge-set document.
    pub observed_path: String,
    /// Path to the frozen edge-set document.
    pub frozen_path: String,
}

impl Config {
    /// Build configuration from the process environment.
    pub fn from_env() -> Self {
        Self {
            namespace: env_or("NAMESPACE", DEFAULT_NAMESPACE),
            loop_interval: Duration::from_secs(env_u64("LOOP_SECONDS", DEFAULT_LOOP_SECONDS)),
            mode_override: env_mode_override(),
            manage_infra: env_flag("CONTROLLER_MANAGE_INFRA"),
            enable_safety: env_flag("CONTROLLER_ENABLE_SAFETY"),
            derive_ports: env_flag_default("CONTROLLER_DERIVE_PORTS", true),
            hubble_debug: env_flag("HUBBLE_DEBUG"),
            flow_stream_addr: env_or("FLOW_STREAM_ADDR", DEFAULT_FLOW_STREAM_ADDR),
            observed_path: env_or("OBSERVED_PATH", DEFAULT_OBSERVED_PATH),
            frozen_path: env_or("FROZEN_PATH", DEFAULT_FROZEN_PATH),
        }
    }
}

fn env_or(key: &str, default: &str) -> String {
    std::env::var(key).unwrap_or_else(|_| default.to_string())
}

fn env_u64(key: &str, default: u64) -> u64 {
    std::env::var(key)
        .ok()
        .and_then(|v| v.parse().ok())
        .unwrap_or(default)
}

fn env_flag(key: &str) -> bool {
    std::env::var(key).map(|v| v == "1").unwrap_or(false)
}

fn env_flag_default(key: &str, default: bool) -> bool {
    match std::env::var(key) {
        Ok(v) => v == "1",
        Err(_) => default,
    }
}

fn env_mode_override() -> Option<String> {
    std::env::var("CONTROLLER_MODE")
        .or_else(|_| std::env::var("MODE"))
        .ok()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_without_env() {
        // SAFETY: test runs single-threaded per-process env access; no
        // parallel test in this module mutates these keys.
        for k in [
            "NAMESPACE",
            "LOOP_SECONDS",
            "CONTROLLER_MODE",
            "MODE",
            "CONTROLLER_MANAGE_INFRA",
            "CONTROLLER_ENABLE_SAFETY",
            "CONTROLLER_DERIVE_PORTS",
            "HUBBLE_DEBUG",
        ] {
            std::env::remove_var(k);
        }
        let cfg = Config::from_env();
        assert_eq!(cfg.namespace, "trirematics");
        assert_eq!(cfg.loop_interval, Duration::from_secs(5));
        assert_eq!(cfg.mode_override, None);
        assert!(!cfg.manage_infra);
        assert!(!cfg.enable_safety);
        assert!(cfg.derive_ports);
        assert!(!cfg.hubble_debug);
    }

    #[test]
    fn derive_ports_can_be_disabled() {
        std::env::set_var("CONTROLLER_DERIVE_PORTS", "0");
        let cfg = Config::from_env();
        assert!(!cfg.derive_ports);
        std::env::remove_var("CONTROLLER_DERIVE_PORTS");
    }
}
