//! Example showing bevy_blur_outline working with egui.
//!
//! Run with: cargo run --example with_egui

use bevy::prelude::*;
use bevy_blur_outline::prelude::*;
use bevy_egui::{egui, EguiContexts, EguiPlugin, EguiPrimaryContextPass};

fn main() {
    App::new()
        .add_plugins((DefaultPlugins, EguiPlugin::default(), OutlinePlugin))
        .init_resource::<OutlineConfig>()
        .add_systems(Startup, setup)
        .add_systems(EguiPrimaryContextPass, ui_system)
        .add_systems(Update, (update_outlines, rotate_cube))
        .run();
}

#[derive(Resource)]
struct OutlineConfig {
    color: [f32; 4],
    sampler_area: f32,
    iterations: u32,
    downsample: u32,
    strength: f32,
    convolution: bool,
    enabled: bool,
}

impl Default for OutlineConfig {
    fn default() -> Self {
        Self {
            color: [1.0, 0.5, 0.0, 1.0],
            sampler_area: 0.001,
            iterations: 1,
            downsample: 0,
            strength: 1.0,
            convolution: false,
            enabled: true,
        }
    }
}

#[derive(Component)]
struct OutlinedCube;

fn setup(
    mut commands: Commands,
    mut meshes: ResMut<Assets<Mesh>>,
    mut materials: ResMut<Assets<StandardMaterial>>,
) {
    // Cube with outline
    let cube = commands
        .spawn((
            Mesh3d(meshes.add(Cuboid::new(2.0, 2.0, 2.0))),
            MeshMaterial3d(materials.add(Color::srgb(0.8, 0.2, 0.2))),
            Transform::from_xyz(0.0, 1.0, 0.0),
            OutlineTarget::new(LinearRgba::new(1.0, 0.5, 0.0, 1.0)),
            OutlinedCube,
        ))
        .id();

    // Ground plane
    commands.spawn((
        Mesh3d(meshes.add(Plane3d::default().mesh().size(10.0, 10.0))),
        MeshMaterial3d(materials.add(Color::srgb(0.3, 0.3, 0.3))),
    ));

    // Light
    commands.spawn((
        DirectionalLight {
            illuminance: 10000.0,
            shadows_enabled: true,
            ..default()
        },
        Transform::from_xyz(4.0, 8.0, 4.0).looking_at(Vec3::ZERO, Vec3::Y),
    ));

    // Camera with the cube registered
    let mut outline = OutlineCamera::default();
    outline.add_target(cube);

    commands.spawn((
        Camera3d::default(),
        Transform::from_xyz(0.0, 5.0, 8.0).looking_at(Vec3::ZERO, Vec3::Y),
        outline,
    ));
}

fn ui_system(mut contexts: EguiContexts, mut config: ResMut<OutlineConfig>) -> Result {
    egui::Window::new("Outline Settings").show(contexts.ctx_mut()?, |ui| {
        ui.checkbox(&mut config.enabled, "Enable Outlines");
        ui.checkbox(&mut config.convolution, "Convolution Algorithm");
        ui.add(
            egui::Slider::new(&mut config.sampler_area, 0.001..=0.005)
                .text("Sampler Area")
                .logarithmic(true),
        );
        ui.add(egui::Slider::new(&mut config.iterations, 1..=4).text("Iterations"));
        ui.add(egui::Slider::new(&mut config.downsample, 0..=2).text("Downsample"));
        ui.add(egui::Slider::new(&mut config.strength, 0.0..=10.0).text("Strength"));
        ui.color_edit_button_rgba_unmultiplied(&mut config.color);
    });
    Ok(())
}

fn update_outlines(
    config: Res<OutlineConfig>,
    mut targets: Query<&mut OutlineTarget, With<OutlinedCube>>,
    mut cameras: Query<&mut OutlineCamera>,
) {
    if !config.is_changed() {
        return;
    }

    let color = LinearRgba::new(
        config.color[0],
        config.color[1],
        config.color[2],
        config.color[3],
    );

    for mut target in targets.iter_mut() {
        target.color = color;
    }

    for mut camera in cameras.iter_mut() {
        camera.enabled = config.enabled;
        camera.algorithm = if config.convolution {
            OutlineAlgorithm::Convolution
        } else {
            OutlineAlgorithm::Blur
        };
        camera.sampler_area = config.sampler_area;
        camera.color = color;
        camera.set_iterations(config.iterations);
        camera.set_downsample(config.downsample);
        camera.set_strength(config.strength);
    }
}

fn rotate_cube(time: Res<Time>, mut query: Query<&mut Transform, With<OutlinedCube>>) {
    for mut transform in query.iter_mut() {
        transform.rotate_y(time.delta_secs() * 0.5);
    }
}
