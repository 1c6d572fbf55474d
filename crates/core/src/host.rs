//! Interface to the host entity store.
//!
//! The sync layer never owns entities. It reads and writes them through this
//! trait, and relies on the host to report which components changed or were
//! removed since the trackers were last cleared.

use crate::components::{ComponentMap, ComponentValue};
use crate::registry::{ComponentError, NetComponent};
use std::fmt::Debug;
use std::hash::Hash;

/// Host entity storage with per-component change tracking.
pub trait EntityStore {
    /// Local entity handle.
    type Entity: Copy + Eq + Ord + Hash + Debug;

    /// Entities carrying every listed component, in handle order.
    fn query(&self, components: &[&str]) -> Vec<Self::Entity>;

    /// Entities whose `component` was inserted or written since the last
    /// [`EntityStore::clear_trackers`].
    fn query_changed(&self, component: &str) -> Vec<Self::Entity>;

    /// Entities that lost `component` (or were despawned while holding it)
    /// since the last [`EntityStore::clear_trackers`].
    fn query_removed(&self, component: &str) -> Vec<Self::Entity>;

    /// Returns true if the entity is alive.
    fn contains(&self, entity: Self::Entity) -> bool;

    /// Read a component.
    fn get(&self, entity: Self::Entity, component: &str) -> Option<&ComponentValue>;

    /// Write a component, marking it changed. Returns false if the entity is gone.
    fn set(&mut self, entity: Self::Entity, component: &str, value: ComponentValue) -> bool;

    /// Remove a component, marking it removed.
    fn remove(&mut self, entity: Self::Entity, component: &str) -> Option<ComponentValue>;

    /// Spawn an entity with the given components, all marked changed.
    fn spawn(&mut self, components: ComponentMap) -> Self::Entity;

    /// Despawn an entity; its components are reported as removed.
    fn despawn(&mut self, entity: Self::Entity) -> bool;

    /// Parent link, if any.
    fn parent(&self, entity: Self::Entity) -> Option<Self::Entity>;

    /// Set or clear the parent link.
    fn set_parent(&mut self, entity: Self::Entity, parent: Option<Self::Entity>);

    /// Forget change and removal reports.
    fn clear_trackers(&mut self);
}

/// Typed accessors over [`EntityStore`].
pub trait EntityStoreExt: EntityStore {
    /// Read and parse a typed component.
    fn get_typed<T: NetComponent>(&self, entity: Self::Entity) -> Option<Result<T, ComponentError>> {
        self.get(entity, T::NAME).map(T::from_value)
    }

    /// Write a typed component.
    fn set_typed<T: NetComponent>(&mut self, entity: Self::Entity, component: &T) -> bool {
        self.set(entity, T::NAME, component.to_value())
    }
}

impl<S: EntityStore + ?Sized> EntityStoreExt for S {}
