//! Fluent construction of an [`Orchestrator`].
//!
//! The default build wires both runtime backends from the configuration.
//! Tests inject their own [`RuntimeProvider`] implementations to exercise
//! the lifecycle without a container runtime on the machine.

use crate::config::OrchestratorConfig;
use crate::orchestrator::Orchestrator;
use crate::runtime::{DaemonRuntime, ProviderKind, RuntimeProvider, SubprocessRuntime};
use std::collections::HashMap;
use std::sync::Arc;

pub struct OrchestratorBuilder {
    config: OrchestratorConfig,
    providers: HashMap<ProviderKind, Arc<dyn RuntimeProvider>>,
    active: ProviderKind,
}

impl OrchestratorBuilder {
    pub fn new() -> Self {
        Self {
            config: OrchestratorConfig::default(),
            providers: HashMap::new(),
            active: ProviderKind::Docker,
        }
    }

    pub fn config(mut self, config: OrchestratorConfig) -> Self {
        self.config = config;
        self
    }

    /// Replace the provider for `kind` (test injection, custom backends).
    pub fn provider(mut self, kind: ProviderKind, provider: Arc<dyn RuntimeProvider>) -> Self {
        self.providers.insert(kind, provider);
        self
    }

    /// Select the provider active at construction. Defaults to the daemon
    /// backend.
    pub fn active_provider(mut self, kind: ProviderKind) -> Self {
        self.active = kind;
        self
    }

    pub fn build(mut self) -> Orchestrator {
        let mut subprocess_backend = None;

        self.providers
            .entry(ProviderKind::Docker)
            .or_insert_with(|| Arc::new(DaemonRuntime::new(self.config.clone())));

        if !self.providers.contains_key(&ProviderKind::Subprocess) {
            let backend = Arc::new(SubprocessRuntime::new(
                self.config.image_dir.clone(),
                self.config.log_level.clone(),
            ));
            subprocess_backend = Some(Arc::clone(&backend));
            self.providers.insert(ProviderKind::Subprocess, backend);
        }

        Orchestrator::from_parts(self.config, self.providers, self.active, subprocess_backend)
    }
}

impl Default for OrchestratorBuilder {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_build_wires_both_backends() {
        let orchestrator = OrchestratorBuilder::new().build();
        assert_eq!(orchestrator.active_provider(), ProviderKind::Docker);
        assert!(orchestrator.set_provider("subprocess").is_ok());
        assert_eq!(orchestrator.active_provider(), ProviderKind::Subprocess);
    }

    #[test]
    fn unknown_provider_name_is_rejected() {
        let orchestrator = OrchestratorBuilder::new().build();
        assert!(orchestrator.set_provider("lxc").is_err());
        assert_eq!(orchestrator.active_provider(), ProviderKind::Docker);
    }
}
