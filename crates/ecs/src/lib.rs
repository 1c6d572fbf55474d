#![warn(missing_docs)]
//! Reference host entity store backed by a `bevy_ecs` world.
//!
//! Replicated entities carry their dynamic components in a single
//! [`HostComponents`] table. Change and removal reports are tracked per
//! component name and cleared explicitly once per tick, the same way an
//! engine clears its change flags after all systems ran.

use bevy_ecs::component::Component;
use bevy_ecs::entity::Entity;
use bevy_ecs::world::World;
use netsync_core::{ComponentMap, ComponentValue, EntityStore};
use std::collections::{BTreeMap, BTreeSet};

/// Dynamic component table of a host entity.
#[derive(Component, Debug, Default, Clone)]
pub struct HostComponents(pub ComponentMap);

/// Parent link of a host entity.
#[derive(Component, Debug, Clone, Copy)]
pub struct HostParent(pub Entity);

/// `bevy_ecs`-backed [`EntityStore`].
#[derive(Default)]
pub struct HostWorld {
    world: World,
    changed: BTreeMap<String, BTreeSet<Entity>>,
    removed: BTreeMap<String, BTreeSet<Entity>>,
}

impl HostWorld {
    /// Create an empty world.
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of live entities.
    pub fn len(&self) -> usize {
        self.world.entities().len() as usize
    }

    /// Returns true if no entity is alive.
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Underlying `bevy_ecs` world.
    pub fn world(&self) -> &World {
        &self.world
    }

    /// Live children of `parent`.
    pub fn children(&self, parent: Entity) -> Vec<Entity> {
        let mut children: Vec<Entity> = self
            .world
            .iter_entities()
            .filter(|e| e.get::<HostParent>().map(|p| p.0) == Some(parent))
            .map(|e| e.id())
            .collect();
        children.sort();
        children
    }

    fn mark_changed(&mut self, entity: Entity, component: &str) {
        self.changed
            .entry(component.to_string())
            .or_default()
            .insert(entity);
    }

    fn mark_removed(&mut self, entity: Entity, component: &str) {
        if let Some(changed) = self.changed.get_mut(component) {
            changed.remove(&entity);
        }
        self.removed
            .entry(component.to_string())
            .or_default()
            .insert(entity);
    }
}

impl EntityStore for HostWorld {
    type Entity = Entity;

    fn query(&self, components: &[&str]) -> Vec<Entity> {
        let mut entities: Vec<Entity> = self
            .world
            .iter_entities()
            .filter(|e| {
                e.get::<HostComponents>()
                    .map(|c| components.iter().all(|name| c.0.contains(name)))
                    .unwrap_or(false)
            })
            .map(|e| e.id())
            .collect();
        entities.sort();
        entities
    }

    fn query_changed(&self, component: &str) -> Vec<Entity> {
        self.changed
            .get(component)
            .map(|set| {
                set.iter()
                    .copied()
                    .filter(|e| self.world.get_entity(*e).is_some())
                    .collect()
            })
            .unwrap_or_default()
    }

    fn query_removed(&self, component: &str) -> Vec<Entity> {
        self.removed
            .get(component)
            .map(|set| set.iter().copied().collect())
            .unwrap_or_default()
    }

    fn contains(&self, entity: Entity) -> bool {
        self.world.get_entity(entity).is_some()
    }

    fn get(&self, entity: Entity, component: &str) -> Option<&ComponentValue> {
        self.world
            .get::<HostComponents>(entity)
            .and_then(|c| c.0.get(component))
    }

    fn set(&mut self, entity: Entity, component: &str, value: ComponentValue) -> bool {
        let Some(mut components) = self.world.get_mut::<HostComponents>(entity) else {
            return false;
        };
        components.0.insert(component, value);
        self.mark_changed(entity, component);
        true
    }

    fn remove(&mut self, entity: Entity, component: &str) -> Option<ComponentValue> {
        let removed = self
            .world
            .get_mut::<HostComponents>(entity)
            .and_then(|mut c| c.0.remove(component));
        if removed.is_some() {
            self.mark_removed(entity, component);
        }
        removed
    }

    fn spawn(&mut self, components: ComponentMap) -> Entity {
        let names: Vec<String> = components.names().map(str::to_string).collect();
        let entity = self.world.spawn(HostComponents(components)).id();
        for name in names {
            self.mark_changed(entity, &name);
        }
        tracing::trace!(?entity, "host entity spawned");
        entity
    }

    fn despawn(&mut self, entity: Entity) -> bool {
        let names: Vec<String> = match self.world.get::<HostComponents>(entity) {
            Some(c) => c.0.names().map(str::to_string).collect(),
            None => Vec::new(),
        };
        if !self.world.despawn(entity) {
            return false;
        }
        for name in names {
            self.mark_removed(entity, &name);
        }
        tracing::trace!(?entity, "host entity despawned");
        true
    }

    fn parent(&self, entity: Entity) -> Option<Entity> {
        self.world.get::<HostParent>(entity).map(|p| p.0)
    }

    fn set_parent(&mut self, entity: Entity, parent: Option<Entity>) {
        let Some(mut entity_mut) = self.world.get_entity_mut(entity) else {
            return;
        };
        match parent {
            Some(parent) => {
                entity_mut.insert(HostParent(parent));
            }
            None => {
                entity_mut.remove::<HostParent>();
            }
        }
    }

    fn clear_trackers(&mut self) {
        self.changed.clear();
        self.removed.clear();
    }
}
