//! Visual smoothing of remote entity transforms.

use crate::config::InterpolationConfig;
use netsync_core::{EntityStore, EntityStoreExt, NetId, Transform};
use std::collections::BTreeMap;
use tracing::trace;

/// Distance below which an entity counts as arrived.
const ARRIVAL_EPSILON: f32 = 1e-4;

/// Where a remote entity is heading.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct InterpolationTarget<E> {
    /// Local handle.
    pub entity: E,
    /// Target transform.
    pub target: Transform,
    /// Sender tick the target was taken at.
    pub timestamp: u64,
}

/// Interpolator for smooth remote entity movement.
pub struct Interpolator<E> {
    targets: BTreeMap<NetId, InterpolationTarget<E>>,
    latest: BTreeMap<NetId, u64>,
    config: InterpolationConfig,
}

impl<E: Copy + Ord + std::fmt::Debug> Interpolator<E> {
    /// Create a new interpolator.
    pub fn new(config: InterpolationConfig) -> Self {
        Self {
            targets: BTreeMap::new(),
            latest: BTreeMap::new(),
            config,
        }
    }

    /// Replace the target of `net_id`. Targets older than the freshest one
    /// seen are ignored; returns false for those.
    pub fn set_target(&mut self, net_id: NetId, entity: E, target: Transform, timestamp: u64) -> bool {
        if self.latest.get(&net_id).is_some_and(|latest| timestamp < *latest) {
            trace!(%net_id, timestamp, "ignoring stale interpolation target");
            return false;
        }
        self.latest.insert(net_id, timestamp);
        self.targets.insert(
            net_id,
            InterpolationTarget {
                entity,
                target,
                timestamp,
            },
        );
        true
    }

    /// Active target of `net_id`.
    pub fn target(&self, net_id: NetId) -> Option<&InterpolationTarget<E>> {
        self.targets.get(&net_id)
    }

    /// Move every entity toward its target. Arrived entities and entities
    /// that no longer exist lose their target. Returns how many moved.
    pub fn advance<S>(&mut self, world: &mut S, dt: f32) -> usize
    where
        S: EntityStore<Entity = E>,
    {
        let factor = (self.config.lerp_speed * dt).clamp(0.0, 1.0);
        let mut moved = 0;
        let mut finished = Vec::new();

        for (net_id, target) in &self.targets {
            let current = match world.get_typed::<Transform>(target.entity) {
                Some(Ok(current)) => current,
                _ => {
                    finished.push(*net_id);
                    continue;
                }
            };
            let goal = target.target;
            let distance = current.position.distance(goal.position);

            let next = if distance > self.config.snap_threshold {
                trace!(%net_id, distance, "snapping to interpolation target");
                goal
            } else {
                Transform {
                    position: current.position.lerp(goal.position, factor),
                    rotation: current.rotation.slerp(goal.rotation, factor),
                    scale: current.scale.lerp(goal.scale, factor),
                }
            };
            let arrived = next.position.distance(goal.position) < ARRIVAL_EPSILON
                && next.rotation.angle_between(goal.rotation) < ARRIVAL_EPSILON
                && next.scale.distance(goal.scale) < ARRIVAL_EPSILON;

            let next = if arrived { goal } else { next };
            if next != current {
                world.set_typed(target.entity, &next);
                moved += 1;
            }
            if arrived {
                finished.push(*net_id);
            }
        }

        for net_id in finished {
            self.targets.remove(&net_id);
        }
        moved
    }

    /// Forget `net_id` entirely.
    pub fn remove(&mut self, net_id: NetId) {
        self.targets.remove(&net_id);
        self.latest.remove(&net_id);
    }

    /// Number of active targets.
    pub fn len(&self) -> usize {
        self.targets.len()
    }

    /// Returns true if nothing is interpolating.
    pub fn is_empty(&self) -> bool {
        self.targets.is_empty()
    }
}
