//! Basic example showing how to use bevy_blur_outline.
//!
//! Run with: cargo run --example basic

use bevy::prelude::*;
use bevy_blur_outline::prelude::*;

fn main() {
    App::new()
        .add_plugins((DefaultPlugins, OutlinePlugin))
        .add_systems(Startup, setup)
        .add_systems(Update, rotate_cubes)
        .run();
}

fn setup(
    mut commands: Commands,
    mut meshes: ResMut<Assets<Mesh>>,
    mut materials: ResMut<Assets<StandardMaterial>>,
) {
    // Cube with the default cyan outline
    let cyan_cube = commands
        .spawn((
            Mesh3d(meshes.add(Cuboid::new(1.0, 1.0, 1.0))),
            MeshMaterial3d(materials.add(Color::srgb(0.8, 0.2, 0.2))),
            Transform::from_xyz(-2.0, 0.5, 0.0),
            OutlineTarget::default(),
            Rotates,
        ))
        .id();

    // Cube with an orange outline
    let orange_cube = commands
        .spawn((
            Mesh3d(meshes.add(Cuboid::new(1.0, 1.0, 1.0))),
            MeshMaterial3d(materials.add(Color::srgb(0.2, 0.8, 0.2))),
            Transform::from_xyz(0.0, 0.5, 0.0),
            OutlineTarget::new(LinearRgba::new(1.0, 0.5, 0.0, 1.0)),
            Rotates,
        ))
        .id();

    // Parent with a mesh child; outlining the parent outlines the
    // whole hierarchy
    let parent = commands
        .spawn((
            Transform::from_xyz(2.0, 0.5, 0.0),
            Visibility::default(),
            OutlineTarget::new(LinearRgba::WHITE),
            Rotates,
        ))
        .with_children(|children| {
            children.spawn((
                Mesh3d(meshes.add(Sphere::new(0.6))),
                MeshMaterial3d(materials.add(Color::srgb(0.2, 0.2, 0.8))),
            ));
        })
        .id();

    // Cube without outline for comparison
    commands.spawn((
        Mesh3d(meshes.add(Cuboid::new(1.0, 1.0, 1.0))),
        MeshMaterial3d(materials.add(Color::srgb(0.5, 0.5, 0.5))),
        Transform::from_xyz(4.0, 0.5, 0.0),
    ));

    // Ground plane
    commands.spawn((
        Mesh3d(meshes.add(Plane3d::default().mesh().size(20.0, 20.0))),
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

    // Camera with the three targets registered
    let mut outline = OutlineCamera::default();
    outline.add_target(cyan_cube);
    outline.add_target(orange_cube);
    outline.add_target(parent);

    commands.spawn((
        Camera3d::default(),
        Transform::from_xyz(0.0, 5.0, 10.0).looking_at(Vec3::ZERO, Vec3::Y),
        outline,
    ));
}

#[derive(Component)]
struct Rotates;

fn rotate_cubes(time: Res<Time>, mut query: Query<&mut Transform, With<Rotates>>) {
    for mut transform in query.iter_mut() {
        transform.rotate_y(time.delta_secs() * 0.5);
    }
}
