//! Orchestrator configuration.
//!
//! The orchestrator itself takes a plain [`OrchestratorConfig`] value; the
//! embedding application decides where that value comes from. `from_env`
//! covers the common case of deriving it from the process environment.

use serde::{Deserialize, Serialize};
use std::path::PathBuf;

/// Default first port the allocator scans from.
pub const DEFAULT_PORT_START: u16 = 8101;

/// Configuration for an [`Orchestrator`](crate::Orchestrator) and its
/// runtime backends.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct OrchestratorConfig {
    /// First host port the allocator scans from.
    pub port_start: u16,

    /// Clustered/CI execution: bind the workload's own port instead of the
    /// fixed internal port, leave the host IP unbound, and dial the
    /// container's hostname rather than loopback.
    pub clustered: bool,

    /// Replacement bind-mount source used in clustered runs, where the
    /// caller-supplied mounts are not visible to the daemon.
    pub cluster_bind_source: Option<String>,

    /// Mount target inside the workload for `cluster_bind_source`.
    pub cluster_bind_target: Option<String>,

    /// Docker network joined by workloads in clustered runs.
    pub cluster_network: Option<String>,

    /// Expose an auxiliary debug port (`44XX`, from the last two digits of
    /// the allocated port) on each workload.
    pub debug_ports: bool,

    /// Log level forwarded to version-1 workloads in their boot command.
    pub log_level: Option<String>,

    /// Directory the subprocess backend stores converted images in.
    pub image_dir: PathBuf,
}

impl Default for OrchestratorConfig {
    fn default() -> Self {
        Self {
            port_start: DEFAULT_PORT_START,
            clustered: false,
            cluster_bind_source: None,
            cluster_bind_target: None,
            cluster_network: None,
            debug_ports: false,
            log_level: None,
            image_dir: PathBuf::from("./"),
        }
    }
}

impl OrchestratorConfig {
    /// Build a configuration from the process environment.
    ///
    /// Recognized variables:
    /// - `CONDUCTOR_PORT_START` — overrides the port scan start
    /// - `CONDUCTOR_CLUSTERED` or `CI` — enables clustered execution
    /// - `CONDUCTOR_CLUSTER_VOLUME` / `CONDUCTOR_CLUSTER_TARGET` — clustered bind mount
    /// - `CONDUCTOR_CLUSTER_NETWORK` — clustered docker network
    /// - `CONDUCTOR_DEBUG_PORTS` — expose the auxiliary debug port
    /// - `CONDUCTOR_LOG_LEVEL` — workload boot log level
    /// - `CONDUCTOR_IMAGE_DIR` — subprocess backend image directory
    pub fn from_env() -> Self {
        let mut config = Self::default();

        if let Some(port) = env_var("CONDUCTOR_PORT_START").and_then(|v| v.parse().ok()) {
            config.port_start = port;
        }
        config.clustered =
            env_var("CONDUCTOR_CLUSTERED").is_some() || env_var("CI").is_some();
        config.cluster_bind_source = env_var("CONDUCTOR_CLUSTER_VOLUME");
        config.cluster_bind_target = env_var("CONDUCTOR_CLUSTER_TARGET");
        config.cluster_network = env_var("CONDUCTOR_CLUSTER_NETWORK");
        config.debug_ports = env_var("CONDUCTOR_DEBUG_PORTS").is_some();
        config.log_level = env_var("CONDUCTOR_LOG_LEVEL");
        if let Some(dir) = env_var("CONDUCTOR_IMAGE_DIR") {
            config.image_dir = PathBuf::from(dir);
        }

        config
    }

    /// The clustered replacement mount as a `source:target` bind spec, when
    /// both halves are configured.
    pub fn cluster_bind(&self) -> Option<String> {
        match (&self.cluster_bind_source, &self.cluster_bind_target) {
            (Some(source), Some(target)) => Some(format!("{}:{}", source, target)),
            _ => None,
        }
    }
}

/// Read an environment variable, treating empty values as unset.
fn env_var(name: &str) -> Option<String> {
    match std::env::var(name) {
        Ok(value) if !value.is_empty() => Some(value),
        _ => None,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_config() {
        let config = OrchestratorConfig::default();
        assert_eq!(config.port_start, DEFAULT_PORT_START);
        assert!(!config.clustered);
        assert!(config.cluster_bind().is_none());
        assert_eq!(config.image_dir, PathBuf::from("./"));
    }

    #[test]
    fn cluster_bind_needs_both_halves() {
        let mut config = OrchestratorConfig::default();
        config.cluster_bind_source = Some("shared-volume".to_string());
        assert!(config.cluster_bind().is_none());

        config.cluster_bind_target = Some("/input".to_string());
        assert_eq!(config.cluster_bind().as_deref(), Some("shared-volume:/input"));
    }
}
