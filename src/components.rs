use bevy::prelude::*;

use crate::registry::AppliedOutlineTargets;

/// Hard limit on instances per draw when grouping surfaces for the
/// instanced strategy.
pub const MAX_INSTANCES_PER_DRAW: usize = 1023;

/// Which edge-detection algorithm drives the outline pipeline.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Reflect)]
pub enum OutlineAlgorithm {
    /// Separable multi-iteration blur followed by edge isolation and an
    /// additive combine. Softer edges, supports per-target colors.
    #[default]
    Blur,
    /// Single full-screen neighborhood kernel over the mask buffer.
    /// One draw, no intermediate buffers, no iteration parameter.
    Convolution,
}

/// How outlined surfaces reach the mask buffer.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Reflect)]
pub enum DrawStrategy {
    /// Walk the camera's target list and issue one draw per surface,
    /// with the target color bound per draw.
    #[default]
    ExplicitSurface,
    /// Let the renderer filter surfaces by the camera's outline layer
    /// bit instead of walking the target list.
    FilteredDrawList,
    /// Batch surfaces sharing a mesh into instanced draws. Incomplete:
    /// grouping works, but drawing falls back to per-surface draws.
    Instanced,
}

/// Component that marks an entity (and its mesh descendants) for outlining.
///
/// The entity's drawable surfaces are resolved lazily the first time the
/// target is registered to a camera: every descendant carrying a mesh is
/// collected. Register the target via [`OutlineCamera::add_target`].
#[derive(Component, Clone, Reflect)]
#[reflect(Component)]
pub struct OutlineTarget {
    /// Outline color for every surface of this target. HDR values are
    /// allowed and survive into the mask buffer untouched.
    pub color: LinearRgba,
    /// Resolved surface entities, in child-traversal order. Empty until
    /// first registration.
    #[reflect(ignore)]
    pub(crate) surfaces: Vec<Entity>,
}

impl Default for OutlineTarget {
    fn default() -> Self {
        Self {
            color: LinearRgba::new(0.0, 1.0, 1.0, 1.0),
            surfaces: Vec::new(),
        }
    }
}

impl OutlineTarget {
    pub fn new(color: impl Into<LinearRgba>) -> Self {
        Self {
            color: color.into(),
            surfaces: Vec::new(),
        }
    }

    /// The surfaces this target resolved to, if any yet.
    pub fn surfaces(&self) -> &[Entity] {
        &self.surfaces
    }
}

/// Marker placed on each resolved surface entity while its target is
/// registered to at least one camera. Records the owning target so the
/// filtered draw-list strategy can look up the target color.
///
/// A surface is assumed to belong to exactly one target. Nesting one
/// target root under another makes the shared surfaces keep whichever
/// target registered last as owner, so the filtered strategy would read
/// that target's color for all of them. Registry-driven strategies are
/// unaffected, they resolve colors through each camera's own target
/// list.
#[derive(Component, Clone, Copy)]
pub struct OutlineSurface {
    pub(crate) owner: Entity,
}

impl OutlineSurface {
    /// The target entity this surface belongs to.
    pub fn owner(&self) -> Entity {
        self.owner
    }
}

/// Per-camera outline configuration and target registry.
///
/// Add this to any camera that should render outlines. Targets are kept
/// in insertion order; registering a target sets this camera's layer bit
/// on all of the target's surfaces, deregistering clears it again.
#[derive(Component, Clone, Reflect)]
#[reflect(Component)]
#[require(AppliedOutlineTargets)]
pub struct OutlineCamera {
    /// Whether the effect runs for this camera at all.
    pub enabled: bool,
    pub algorithm: OutlineAlgorithm,
    pub strategy: DrawStrategy,
    /// Render layer index reserved for this camera's mask extraction.
    /// Cameras running the effect concurrently must use distinct layers.
    pub layer: usize,
    /// Screen-space blur sample offset. Sensible range 0.001..=0.005.
    pub sampler_area: f32,
    /// Outline color used by the convolution algorithm (the blur
    /// algorithm takes colors from each target instead).
    pub color: LinearRgba,
    iterations: u32,
    downsample: u32,
    strength: f32,
    #[reflect(ignore)]
    targets: Vec<Entity>,
}

impl Default for OutlineCamera {
    fn default() -> Self {
        Self {
            enabled: true,
            algorithm: OutlineAlgorithm::default(),
            strategy: DrawStrategy::default(),
            layer: 31,
            sampler_area: 0.001,
            color: LinearRgba::new(0.0, 1.0, 1.0, 1.0),
            iterations: 1,
            downsample: 0,
            strength: 1.0,
            targets: Vec::new(),
        }
    }
}

impl OutlineCamera {
    /// Registers a target. Idempotent: a target already present is left
    /// where it is and `false` is returned.
    pub fn add_target(&mut self, target: Entity) -> bool {
        if self.targets.contains(&target) {
            return false;
        }
        self.targets.push(target);
        true
    }

    /// Deregisters a target, preserving the relative order of the rest.
    /// Returns `false` if the target was never registered.
    pub fn remove_target(&mut self, target: Entity) -> bool {
        let Some(index) = self.targets.iter().position(|t| *t == target) else {
            return false;
        };
        self.targets.remove(index);
        true
    }

    /// Registered targets in insertion order. This order is the draw
    /// order of the mask-extraction pass.
    pub fn targets(&self) -> &[Entity] {
        &self.targets
    }

    /// Whether the pipeline should run for this camera this frame.
    pub fn is_active(&self) -> bool {
        self.enabled && !self.targets.is_empty()
    }

    /// Blur iteration count, clamped to 1..=4.
    pub fn iterations(&self) -> u32 {
        self.iterations
    }

    pub fn set_iterations(&mut self, iterations: u32) {
        self.iterations = iterations.clamp(1, 4);
    }

    /// Resolution divisor exponent, clamped to 0..=2 (full, half,
    /// quarter resolution).
    pub fn downsample(&self) -> u32 {
        self.downsample
    }

    pub fn set_downsample(&mut self, downsample: u32) {
        self.downsample = downsample.min(2);
    }

    /// Blend strength of the edge buffer in the combine pass, clamped
    /// to 0.0..=10.0.
    pub fn strength(&self) -> f32 {
        self.strength
    }

    pub fn set_strength(&mut self, strength: f32) {
        self.strength = strength.clamp(0.0, 10.0);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use bevy::ecs::world::World;

    fn entities(world: &mut World, count: usize) -> Vec<Entity> {
        (0..count).map(|_| world.spawn_empty().id()).collect()
    }

    #[test]
    fn add_target_is_idempotent() {
        let mut world = World::new();
        let e = entities(&mut world, 2);
        let mut camera = OutlineCamera::default();

        assert!(camera.add_target(e[0]));
        assert!(camera.add_target(e[1]));
        assert!(!camera.add_target(e[0]));
        assert_eq!(camera.targets(), &[e[0], e[1]]);
    }

    #[test]
    fn remove_absent_target_is_noop() {
        let mut world = World::new();
        let e = entities(&mut world, 1);
        let mut camera = OutlineCamera::default();
        assert!(!camera.remove_target(e[0]));
        assert!(camera.targets().is_empty());
    }

    #[test]
    fn removal_preserves_relative_order() {
        let mut world = World::new();
        let e = entities(&mut world, 4);
        let mut camera = OutlineCamera::default();
        for target in &e {
            camera.add_target(*target);
        }

        assert!(camera.remove_target(e[1]));
        assert_eq!(camera.targets(), &[e[0], e[2], e[3]]);
    }

    #[test]
    fn empty_registry_deactivates_camera() {
        let mut world = World::new();
        let e = entities(&mut world, 1);
        let mut camera = OutlineCamera::default();
        assert!(!camera.is_active());

        camera.add_target(e[0]);
        assert!(camera.is_active());

        camera.enabled = false;
        assert!(!camera.is_active());
    }

    #[test]
    fn bounded_parameters_clamp() {
        let mut camera = OutlineCamera::default();

        camera.set_iterations(0);
        assert_eq!(camera.iterations(), 1);
        camera.set_iterations(9);
        assert_eq!(camera.iterations(), 4);

        camera.set_downsample(5);
        assert_eq!(camera.downsample(), 2);

        camera.set_strength(-1.0);
        assert_eq!(camera.strength(), 0.0);
        camera.set_strength(25.0);
        assert_eq!(camera.strength(), 10.0);
    }
}
