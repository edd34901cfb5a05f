//! # Bevy Blur Outline
//!
//! Silhouette-based object outlining for Bevy 0.18, driven per camera.
//!
//! A camera carrying [`OutlineCamera`] owns a registry of outline
//! targets. Each target ([`OutlineTarget`]) colors every mesh in its
//! hierarchy; the effect extracts those silhouettes into an offscreen
//! mask, blurs it, isolates the blur ring around the sharp mask and
//! adds it back over the scene. A cheaper single-pass convolution
//! algorithm is available as an alternative.
//!
//! ## Quick Start
//!
//! ```no_run
//! use bevy::prelude::*;
//! use bevy_blur_outline::prelude::*;
//!
//! fn main() {
//!     App::new()
//!         .add_plugins((DefaultPlugins, OutlinePlugin))
//!         .add_systems(Startup, setup)
//!         .run();
//! }
//!
//! fn setup(
//!     mut commands: Commands,
//!     mut meshes: ResMut<Assets<Mesh>>,
//!     mut materials: ResMut<Assets<StandardMaterial>>,
//! ) {
//!     // Spawn a cube outlined in orange
//!     let cube = commands
//!         .spawn((
//!             Mesh3d(meshes.add(Cuboid::default())),
//!             MeshMaterial3d(materials.add(Color::srgb(0.8, 0.2, 0.2))),
//!             OutlineTarget::new(LinearRgba::new(1.0, 0.5, 0.0, 1.0)),
//!         ))
//!         .id();
//!
//!     let mut outline = OutlineCamera::default();
//!     outline.add_target(cube);
//!
//!     commands.spawn((
//!         Camera3d::default(),
//!         Transform::from_xyz(0.0, 2.0, 5.0).looking_at(Vec3::ZERO, Vec3::Y),
//!         outline,
//!     ));
//! }
//! ```

mod components;
mod node;
mod pipeline;
mod pool;
mod registry;
mod silhouette;

pub mod prelude {
    pub use crate::components::{
        DrawStrategy, OutlineAlgorithm, OutlineCamera, OutlineSurface, OutlineTarget,
    };
    pub use crate::OutlinePlugin;
}

pub use components::*;
pub use pool::{
    downsampled_resolution, GpuRenderTarget, OutlineTargetPool, RenderTargetPool, TargetDescriptor,
};
pub use registry::AppliedOutlineTargets;

use bevy::{
    asset::embedded_asset,
    core_pipeline::core_3d::graph::{Core3d, Node3d},
    prelude::*,
    render::{
        render_graph::{RenderGraphExt, ViewNodeRunner},
        render_resource::SpecializedMeshPipelines,
        ExtractSchedule, Render, RenderApp, RenderSystems,
    },
};

use node::{prepare_outline_bind_groups, prepare_outline_textures, OutlineNode, OutlineNodeLabel};
use pipeline::{prepare_outline_uniforms, OutlinePipelines};
use registry::{cleanup_removed_cameras, sync_outline_layers};
use silhouette::{
    extract_outline_cameras, prepare_silhouette_view_bind_groups, queue_mask_draws,
    SilhouettePipeline,
};

/// Plugin that enables per-camera blur outlining.
pub struct OutlinePlugin;

impl Plugin for OutlinePlugin {
    fn build(&self, app: &mut App) {
        // Embed shaders
        embedded_asset!(app, "shaders/silhouette.wgsl");
        embedded_asset!(app, "shaders/blur.wgsl");
        embedded_asset!(app, "shaders/edge_isolate.wgsl");
        embedded_asset!(app, "shaders/combine.wgsl");
        embedded_asset!(app, "shaders/convolution.wgsl");
        embedded_asset!(app, "shaders/blit.wgsl");

        app.register_type::<OutlineTarget>()
            .register_type::<OutlineCamera>()
            .add_systems(
                PostUpdate,
                (sync_outline_layers, cleanup_removed_cameras).chain(),
            );

        let Some(render_app) = app.get_sub_app_mut(RenderApp) else {
            return;
        };

        render_app
            .init_resource::<SpecializedMeshPipelines<SilhouettePipeline>>()
            .add_systems(ExtractSchedule, extract_outline_cameras)
            .add_systems(
                Render,
                (
                    queue_mask_draws.in_set(RenderSystems::Queue),
                    (prepare_outline_textures, prepare_outline_uniforms)
                        .in_set(RenderSystems::PrepareResources),
                    (prepare_silhouette_view_bind_groups, prepare_outline_bind_groups)
                        .in_set(RenderSystems::PrepareBindGroups),
                ),
            )
            .add_render_graph_node::<ViewNodeRunner<OutlineNode>>(Core3d, OutlineNodeLabel)
            .add_render_graph_edges(
                Core3d,
                (
                    Node3d::Tonemapping,
                    OutlineNodeLabel,
                    Node3d::EndMainPassPostProcessing,
                ),
            );
    }

    fn finish(&self, app: &mut App) {
        let Some(render_app) = app.get_sub_app_mut(RenderApp) else {
            return;
        };

        render_app
            .init_resource::<SilhouettePipeline>()
            .init_resource::<OutlinePipelines>();
    }
}
