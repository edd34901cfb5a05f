//! Target registration side effects.
//!
//! The ordered target list lives on [`OutlineCamera`]; this module owns
//! the systems that reconcile that list against the scene: resolving a
//! target's drawable surfaces the first time it is registered anywhere,
//! and setting/clearing the camera's render-layer bit on each surface's
//! [`RenderLayers`] field. The layer field belongs to the renderer; the
//! registry only issues read-modify-writes through it.

use bevy::{camera::visibility::RenderLayers, prelude::*};

use crate::components::{OutlineCamera, OutlineSurface, OutlineTarget};

/// Bookkeeping of which targets (and which of their surfaces) a camera
/// has currently applied its layer bit to. Required alongside
/// [`OutlineCamera`] so reconciliation can undo bits for targets that
/// left the registry or despawned.
#[derive(Component, Default)]
pub struct AppliedOutlineTargets {
    pub(crate) layer: usize,
    pub(crate) entries: Vec<(Entity, Vec<Entity>)>,
}

impl AppliedOutlineTargets {
    fn is_applied(&self, target: Entity) -> bool {
        self.entries.iter().any(|(entry, _)| *entry == target)
    }
}

/// Collects the drawable surfaces of a target: the target entity itself
/// plus every descendant that carries a mesh, in depth-first child
/// order. Text and UI overlays carry no `Mesh3d` and fall out here.
fn resolve_surfaces(
    root: Entity,
    children: &Query<&Children>,
    meshes: &Query<(), With<Mesh3d>>,
) -> Vec<Entity> {
    let mut surfaces = Vec::new();
    let mut stack = vec![root];
    while let Some(entity) = stack.pop() {
        if meshes.contains(entity) {
            surfaces.push(entity);
        }
        if let Ok(direct) = children.get(entity) {
            // Reverse so the stack pops in child order.
            stack.extend(direct.iter().rev());
        }
    }
    surfaces
}

/// Applies registry membership to the scene once per frame: newly
/// registered targets get the camera's layer bit ORed into each surface
/// and an [`OutlineSurface`] marker; deregistered or despawned targets
/// get the bit cleared again.
pub fn sync_outline_layers(
    mut commands: Commands,
    mut cameras: Query<(Entity, &OutlineCamera, &mut AppliedOutlineTargets)>,
    mut targets: Query<&mut OutlineTarget>,
    children: Query<&Children>,
    meshes: Query<(), With<Mesh3d>>,
    mut layers: Query<&mut RenderLayers>,
) {
    let camera_layers: Vec<(Entity, usize)> = cameras
        .iter()
        .map(|(entity, camera, _)| (entity, camera.layer))
        .collect();

    for (camera_entity, camera, mut applied) in &mut cameras {
        // A layer reassignment invalidates every applied bit.
        if applied.layer != camera.layer && !applied.entries.is_empty() {
            let stale_layer = applied.layer;
            for (_, surfaces) in applied.entries.drain(..) {
                for surface in surfaces {
                    clear_surface(
                        &mut commands,
                        &mut layers,
                        &camera_layers,
                        camera_entity,
                        surface,
                        stale_layer,
                    );
                }
            }
        }
        applied.layer = camera.layer;

        // Targets that left the registry or despawned.
        let mut removed = Vec::new();
        applied.entries.retain(|(target, surfaces)| {
            if camera.targets().contains(target) && targets.contains(*target) {
                return true;
            }
            removed.push(surfaces.clone());
            false
        });
        for surfaces in removed {
            for surface in surfaces {
                clear_surface(
                    &mut commands,
                    &mut layers,
                    &camera_layers,
                    camera_entity,
                    surface,
                    camera.layer,
                );
            }
        }

        // Newly registered targets, in registry order.
        for &target_entity in camera.targets() {
            if applied.is_applied(target_entity) {
                continue;
            }
            let Ok(mut target) = targets.get_mut(target_entity) else {
                continue;
            };
            if target.surfaces.is_empty() {
                target.surfaces = resolve_surfaces(target_entity, &children, &meshes);
            }
            let surfaces = target.surfaces.clone();
            for &surface in &surfaces {
                if let Ok(mut field) = layers.get_mut(surface) {
                    *field = field.clone().with(camera.layer);
                } else if let Ok(mut surface_commands) = commands.get_entity(surface) {
                    surface_commands.insert(RenderLayers::default().with(camera.layer));
                }
                if let Ok(mut surface_commands) = commands.get_entity(surface) {
                    surface_commands.insert(OutlineSurface {
                        owner: target_entity,
                    });
                }
            }
            applied.entries.push((target_entity, surfaces));
        }
    }
}

/// Clears `layer` from a surface's `RenderLayers` and drops the
/// [`OutlineSurface`] marker unless another outline camera still claims
/// the surface.
fn clear_surface(
    commands: &mut Commands,
    layers: &mut Query<&mut RenderLayers>,
    camera_layers: &[(Entity, usize)],
    camera_entity: Entity,
    surface: Entity,
    layer: usize,
) {
    let mut still_claimed = false;
    if let Ok(mut field) = layers.get_mut(surface) {
        *field = field.clone().without(layer);
        still_claimed = camera_layers
            .iter()
            .any(|(other, other_layer)| {
                *other != camera_entity && field.intersects(&RenderLayers::layer(*other_layer))
            });
    }
    if !still_claimed {
        if let Ok(mut surface_commands) = commands.get_entity(surface) {
            surface_commands.remove::<OutlineSurface>();
        }
    }
}

/// Undoes layer bits when an [`OutlineCamera`] component is removed
/// while its entity lives on.
pub fn cleanup_removed_cameras(
    mut commands: Commands,
    mut removed: RemovedComponents<OutlineCamera>,
    mut applied_query: Query<&mut AppliedOutlineTargets>,
    mut layers: Query<&mut RenderLayers>,
) {
    for camera_entity in removed.read() {
        let Ok(mut applied) = applied_query.get_mut(camera_entity) else {
            continue;
        };
        let layer = applied.layer;
        for (_, surfaces) in applied.entries.drain(..) {
            for surface in surfaces {
                if let Ok(mut field) = layers.get_mut(surface) {
                    *field = field.clone().without(layer);
                }
                if let Ok(mut surface_commands) = commands.get_entity(surface) {
                    surface_commands.remove::<OutlineSurface>();
                }
            }
        }
        if let Ok(mut camera_commands) = commands.get_entity(camera_entity) {
            camera_commands.remove::<AppliedOutlineTargets>();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::components::OutlineCamera;

    fn test_app() -> App {
        let mut app = App::new();
        app.add_systems(Update, (sync_outline_layers, cleanup_removed_cameras).chain());
        app
    }

    fn spawn_target_with_surfaces(app: &mut App, surface_count: usize) -> (Entity, Vec<Entity>) {
        let target = app
            .world_mut()
            .spawn(OutlineTarget::new(LinearRgba::RED))
            .id();
        let surfaces: Vec<Entity> = (0..surface_count)
            .map(|_| {
                app.world_mut()
                    .spawn((Mesh3d(Handle::default()), ChildOf(target)))
                    .id()
            })
            .collect();
        (target, surfaces)
    }

    fn spawn_camera(app: &mut App, layer: usize) -> Entity {
        let mut camera = OutlineCamera::default();
        camera.layer = layer;
        app.world_mut()
            .spawn((camera, AppliedOutlineTargets::default()))
            .id()
    }

    fn surface_has_layer(app: &App, surface: Entity, layer: usize) -> bool {
        app.world()
            .get::<RenderLayers>(surface)
            .is_some_and(|field| field.intersects(&RenderLayers::layer(layer)))
    }

    #[test]
    fn registering_sets_layer_bit_and_marker() {
        let mut app = test_app();
        let (target, surfaces) = spawn_target_with_surfaces(&mut app, 2);
        let camera = spawn_camera(&mut app, 5);

        app.world_mut()
            .get_mut::<OutlineCamera>(camera)
            .unwrap()
            .add_target(target);
        app.update();

        for &surface in &surfaces {
            assert!(surface_has_layer(&app, surface, 5));
            assert_eq!(
                app.world()
                    .get::<OutlineSurface>(surface)
                    .map(|marker| marker.owner()),
                Some(target)
            );
        }
        // Lazy resolution filled the target's surface list.
        assert_eq!(
            app.world().get::<OutlineTarget>(target).unwrap().surfaces(),
            surfaces.as_slice()
        );
    }

    #[test]
    fn double_registration_changes_nothing() {
        let mut app = test_app();
        let (target, surfaces) = spawn_target_with_surfaces(&mut app, 1);
        let camera = spawn_camera(&mut app, 5);

        for _ in 0..2 {
            app.world_mut()
                .get_mut::<OutlineCamera>(camera)
                .unwrap()
                .add_target(target);
            app.update();
        }

        let applied = app.world().get::<AppliedOutlineTargets>(camera).unwrap();
        assert_eq!(applied.entries.len(), 1);
        assert!(surface_has_layer(&app, surfaces[0], 5));
    }

    #[test]
    fn deregistering_clears_layer_bit() {
        let mut app = test_app();
        let (target, surfaces) = spawn_target_with_surfaces(&mut app, 2);
        let camera = spawn_camera(&mut app, 5);

        app.world_mut()
            .get_mut::<OutlineCamera>(camera)
            .unwrap()
            .add_target(target);
        app.update();

        app.world_mut()
            .get_mut::<OutlineCamera>(camera)
            .unwrap()
            .remove_target(target);
        app.update();

        for &surface in &surfaces {
            assert!(!surface_has_layer(&app, surface, 5));
            assert!(app.world().get::<OutlineSurface>(surface).is_none());
            // The renderer's own layer membership survives.
            assert!(surface_has_layer(&app, surface, 0));
        }
    }

    #[test]
    fn shared_surface_keeps_other_cameras_bit() {
        let mut app = test_app();
        let (target, surfaces) = spawn_target_with_surfaces(&mut app, 1);
        let camera_a = spawn_camera(&mut app, 3);
        let camera_b = spawn_camera(&mut app, 4);

        for camera in [camera_a, camera_b] {
            app.world_mut()
                .get_mut::<OutlineCamera>(camera)
                .unwrap()
                .add_target(target);
        }
        app.update();
        assert!(surface_has_layer(&app, surfaces[0], 3));
        assert!(surface_has_layer(&app, surfaces[0], 4));

        app.world_mut()
            .get_mut::<OutlineCamera>(camera_a)
            .unwrap()
            .remove_target(target);
        app.update();

        assert!(!surface_has_layer(&app, surfaces[0], 3));
        assert!(surface_has_layer(&app, surfaces[0], 4));
        // Still claimed by camera B, so the marker stays.
        assert!(app.world().get::<OutlineSurface>(surfaces[0]).is_some());
    }

    #[test]
    fn despawned_target_is_cleaned_up() {
        let mut app = test_app();
        let (target, surfaces) = spawn_target_with_surfaces(&mut app, 1);
        let camera = spawn_camera(&mut app, 5);

        app.world_mut()
            .get_mut::<OutlineCamera>(camera)
            .unwrap()
            .add_target(target);
        app.update();

        // Despawn only the target root; surfaces despawn with it as
        // children, so reconciliation must not touch freed entities.
        app.world_mut().entity_mut(target).despawn();
        app.world_mut()
            .get_mut::<OutlineCamera>(camera)
            .unwrap()
            .remove_target(target);
        app.update();

        assert!(app.world().get_entity(surfaces[0]).is_err());
        assert!(app
            .world()
            .get::<AppliedOutlineTargets>(camera)
            .unwrap()
            .entries
            .is_empty());
    }

    #[test]
    fn removing_camera_component_clears_bits() {
        let mut app = test_app();
        let (target, surfaces) = spawn_target_with_surfaces(&mut app, 1);
        let camera = spawn_camera(&mut app, 5);

        app.world_mut()
            .get_mut::<OutlineCamera>(camera)
            .unwrap()
            .add_target(target);
        app.update();
        assert!(surface_has_layer(&app, surfaces[0], 5));

        app.world_mut().entity_mut(camera).remove::<OutlineCamera>();
        app.update();

        assert!(!surface_has_layer(&app, surfaces[0], 5));
        assert!(app.world().get::<OutlineSurface>(surfaces[0]).is_none());
    }

    #[test]
    fn non_mesh_children_are_not_surfaces() {
        let mut app = test_app();
        let target = app
            .world_mut()
            .spawn(OutlineTarget::default())
            .id();
        let mesh_child = app
            .world_mut()
            .spawn((Mesh3d(Handle::default()), ChildOf(target)))
            .id();
        let _bare_child = app.world_mut().spawn(ChildOf(target)).id();
        let camera = spawn_camera(&mut app, 5);

        app.world_mut()
            .get_mut::<OutlineCamera>(camera)
            .unwrap()
            .add_target(target);
        app.update();

        assert_eq!(
            app.world().get::<OutlineTarget>(target).unwrap().surfaces(),
            &[mesh_child]
        );
    }
}
