//! `(provider, action)` lookup table built once at startup.
//!
//! The [`CapabilityRegistry`] is the single enforcement point keeping a
//! provider's declared supported actions and its implemented methods in sync.

use std::collections::HashMap;
use std::sync::Arc;

use thiserror::Error;
use tracing::{debug, instrument};

use crate::validation::ValidationError;

use super::{Action, ProviderCapability, TargetSpec};

/// Errors raised while building the registry.
#[derive(Debug, Clone, Error)]
pub enum RegistryError {
    /// Targets configuration could not be read or parsed.
    #[error("invalid targets configuration: {0}")]
    Config(String),

    /// Two targets share a name.
    #[error("duplicate target name '{0}' in targets configuration")]
    DuplicateTarget(String),

    /// A target declares actions but no capability was supplied for it.
    #[error("target '{0}' declares supported actions but has no registered capability")]
    MissingCapability(String),

    /// A target declares an action its capability does not implement.
    #[error("{provider} does not have a corresponding implementation for the action {action}")]
    MissingImplementation {
        /// Provider name.
        provider: String,
        /// The declared but unimplemented action.
        action: Action,
    },
}

/// Maps `(provider name, action)` pairs to capability implementations.
pub struct CapabilityRegistry {
    entries: HashMap<(String, Action), Arc<dyn ProviderCapability>>,
    targets: HashMap<String, TargetSpec>,
}

impl CapabilityRegistry {
    /// Builds the registry from declared targets and capability instances.
    ///
    /// Capabilities without a matching target are ignored; a target that
    /// declares no actions may omit its capability.
    ///
    /// # Errors
    ///
    /// Returns [`RegistryError::DuplicateTarget`], [`RegistryError::MissingCapability`]
    /// or [`RegistryError::MissingImplementation`] when declarations and
    /// implementations disagree.
    #[instrument(skip_all, fields(targets = targets.len(), capabilities = capabilities.len()))]
    pub fn build(
        targets: Vec<TargetSpec>,
        capabilities: Vec<Arc<dyn ProviderCapability>>,
    ) -> Result<Self, RegistryError> {
        let by_name: HashMap<String, Arc<dyn ProviderCapability>> = capabilities
            .into_iter()
            .map(|capability| (capability.name().to_string(), capability))
            .collect();

        let mut entries = HashMap::new();
        let mut target_map = HashMap::new();

        for target in targets {
            if target_map.contains_key(&target.name) {
                return Err(RegistryError::DuplicateTarget(target.name));
            }

            let declared = target.supported_actions.declared();
            if !declared.is_empty() {
                let Some(capability) = by_name.get(&target.name) else {
                    return Err(RegistryError::MissingCapability(target.name));
                };
                let implemented = capability.implemented_actions();
                for action in declared {
                    if !implemented.contains(&action) {
                        return Err(RegistryError::MissingImplementation {
                            provider: target.name,
                            action,
                        });
                    }
                    debug!(provider = %target.name, %action, "registering capability");
                    entries.insert((target.name.clone(), action), Arc::clone(capability));
                }
            }

            target_map.insert(target.name.clone(), target);
        }

        Ok(Self {
            entries,
            targets: target_map,
        })
    }

    /// Resolves the capability registered for `(provider, action)`.
    ///
    /// # Errors
    ///
    /// Returns [`ValidationError::UnknownProvider`] when the name is not
    /// configured and [`ValidationError::UnsupportedAction`] when the action is
    /// not declared, or (defensively) no longer implemented.
    pub fn resolve(
        &self,
        provider: &str,
        action: Action,
    ) -> Result<Arc<dyn ProviderCapability>, ValidationError> {
        if !self.targets.contains_key(provider) {
            return Err(ValidationError::UnknownProvider {
                name: provider.to_string(),
            });
        }

        let unsupported = || ValidationError::UnsupportedAction {
            provider: provider.to_string(),
            action,
        };

        let capability = self
            .entries
            .get(&(provider.to_string(), action))
            .ok_or_else(unsupported)?;

        if !capability.implemented_actions().contains(&action) {
            return Err(unsupported());
        }
        Ok(Arc::clone(capability))
    }

    /// Returns the declared spec for a provider.
    #[must_use]
    pub fn target(&self, provider: &str) -> Option<&TargetSpec> {
        self.targets.get(provider)
    }

    /// Returns the configured provider names, sorted.
    #[must_use]
    pub fn provider_names(&self) -> Vec<&str> {
        let mut names: Vec<&str> = self.targets.keys().map(String::as_str).collect();
        names.sort_unstable();
        names
    }
}

impl std::fmt::Debug for CapabilityRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CapabilityRegistry")
            .field("providers", &self.provider_names())
            .field("entry_count", &self.entries.len())
            .finish()
    }
}
