//! Per-type hook registry.
//!
//! The registry maps an entity type to the [`HookSet`] it declared. It is
//! filled once per type at initialization and read on every mutation event
//! to decide which phases the event subscribes to.
//!
//! ```ignore
//! let registry = HookRegistry::global();
//! registry.register::<Invoice>(HookSet::from_names(&["after_commit_from_insert"])?);
//! ```

use std::any::TypeId;
use std::sync::{Arc, OnceLock};

use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use smallvec::SmallVec;
use tracing::debug;

use crate::core::{HookSet, HookSlot, MutationKind, Phase};
use crate::entity::CommitHooks;
use crate::error::HookConfigError;

static GLOBAL: OnceLock<Arc<HookRegistry>> = OnceLock::new();

#[derive(Debug, Clone, Copy)]
struct Registration {
    type_name: &'static str,
    hooks: HookSet,
}

/// Table of entity type to declared hooks.
#[derive(Debug, Default)]
pub struct HookRegistry {
    types: DashMap<TypeId, Registration>,
}

impl HookRegistry {
    /// Create an empty registry.
    pub fn new() -> Self {
        Self {
            types: DashMap::new(),
        }
    }

    /// The process-wide registry.
    pub fn global() -> Arc<HookRegistry> {
        GLOBAL.get_or_init(|| Arc::new(HookRegistry::new())).clone()
    }

    /// Register the hooks for `T`.
    ///
    /// # Panics
    ///
    /// Panics if `T` is already registered. Use [`try_register`](Self::try_register)
    /// for a non-panicking version.
    pub fn register<T: CommitHooks>(&self, hooks: HookSet) {
        if let Err(err) = self.try_register::<T>(hooks) {
            panic!("{}", err);
        }
    }

    /// Register the hooks for `T`, failing if it is already registered.
    pub fn try_register<T: CommitHooks>(&self, hooks: HookSet) -> Result<(), HookConfigError> {
        let type_name = std::any::type_name::<T>();
        match self.types.entry(TypeId::of::<T>()) {
            Entry::Occupied(_) => Err(HookConfigError::AlreadyRegistered { type_name }),
            Entry::Vacant(slot) => {
                slot.insert(Registration { type_name, hooks });
                debug!(entity = type_name, hooks = hooks.len(), "registered commit hooks");
                Ok(())
            }
        }
    }

    /// Register the hooks for `T` by conventional method name.
    pub fn register_names<T: CommitHooks, S: AsRef<str>>(
        &self,
        names: &[S],
    ) -> Result<(), HookConfigError> {
        let hooks = HookSet::from_names(names)?;
        self.try_register::<T>(hooks)
    }

    /// Declared hooks for a type. Empty for unregistered types.
    pub fn hooks_for(&self, type_id: TypeId) -> HookSet {
        self.types
            .get(&type_id)
            .map(|entry| entry.hooks)
            .unwrap_or_default()
    }

    /// Whether the type declared `slot`.
    pub fn is_declared(&self, type_id: TypeId, slot: HookSlot) -> bool {
        self.hooks_for(type_id).contains(slot)
    }

    /// Phases a mutation of `kind` on this type must be tracked for.
    pub fn phases_for(&self, type_id: TypeId, kind: MutationKind) -> SmallVec<[Phase; 3]> {
        self.hooks_for(type_id).phases_for(kind)
    }

    pub fn is_registered(&self, type_id: TypeId) -> bool {
        self.types.contains_key(&type_id)
    }

    /// Number of registered types.
    pub fn len(&self) -> usize {
        self.types.len()
    }

    pub fn is_empty(&self) -> bool {
        self.types.is_empty()
    }
}
