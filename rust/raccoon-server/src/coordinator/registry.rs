//! The fixed set of training groups.

use std::collections::{BTreeSet, HashMap};

use thiserror::Error;

use raccoon_core::ModelInitializer;

use crate::{
    coordinator::{group::GroupState, CoordinatorError},
    settings::GroupSettings,
};

#[derive(Debug, Error)]
/// Errors which can occur while building a [`GroupRegistry`].
pub enum RegistryError {
    #[error("group {0} is registered twice")]
    DuplicateGroup(String),
}

#[derive(Debug, Default)]
/// A registry of the training groups, keyed by name.
///
/// Groups are registered at startup only: once the registry is shared, lookups go through a
/// shared reference and the set of groups is fixed.
pub struct GroupRegistry {
    groups: HashMap<String, GroupState>,
}

impl GroupRegistry {
    /// Creates an empty registry.
    pub fn new() -> Self {
        Self::default()
    }

    /// Creates a registry holding one initialized group per entry of `groups`.
    ///
    /// # Errors
    /// Fails if two entries share a name.
    pub fn from_settings<I>(groups: &[GroupSettings], initializer: &I) -> Result<Self, RegistryError>
    where
        I: ModelInitializer + ?Sized,
    {
        let mut registry = Self::new();
        for settings in groups {
            let weights = initializer.init_weights(settings.input_dim, settings.output_dim);
            debug!(
                "initialized group {} with {} tensors ({} scalars)",
                settings.name,
                weights.len(),
                weights.scalar_count()
            );
            registry.insert(GroupState::with_weights(settings.name.clone(), weights))?;
        }
        Ok(registry)
    }

    /// Registers a group.
    ///
    /// # Errors
    /// Fails if a group with the same name is already registered.
    pub fn insert(&mut self, group: GroupState) -> Result<(), RegistryError> {
        if self.groups.contains_key(group.name()) {
            return Err(RegistryError::DuplicateGroup(group.name().to_string()));
        }
        self.groups.insert(group.name().to_string(), group);
        Ok(())
    }

    /// Looks up a group by name.
    ///
    /// # Errors
    /// Fails if no group with this name is registered.
    pub fn get(&self, name: &str) -> Result<&GroupState, CoordinatorError> {
        self.groups
            .get(name)
            .ok_or_else(|| CoordinatorError::UnknownGroup(name.to_string()))
    }

    /// Gets the names of all registered groups, in ascending order.
    pub fn all_names(&self) -> BTreeSet<String> {
        self.groups.keys().cloned().collect()
    }

    pub fn len(&self) -> usize {
        self.groups.len()
    }

    pub fn is_empty(&self) -> bool {
        self.groups.is_empty()
    }
}
