// physics.rs - Collision grid and surface materials
//
// Collision comes from the depth band around the horizon: each column is
// a ray that is free up to the nearest surface and blocked there. Materials
// come from clustering the panorama colours.

use ndarray::{Array2, Array3};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::f32::consts::TAU;

use super::Pose;
use super::geometry::{self, Equirect};
use super::navigation::{GridFrame, OccupancyGrid};
use crate::color::{self, Color};
use crate::config::GeneratorSettings;

pub const GRAVITY: f32 = -9.81;

/// Elevation band (radians) scanned for obstacles at body height
const OBSTACLE_BAND: f32 = 0.18;

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct Material {
    pub color: [u8; 3],
    /// Fraction of sampled panorama pixels in this cluster
    pub coverage: f32,
    pub properties: BTreeMap<String, f32>,
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct PhysicsData {
    pub gravity: f32,
    /// World y of the floor plane
    pub floor_height: f32,
    /// World y of the ceiling plane
    pub ceiling_height: f32,
    pub collision_map: OccupancyGrid,
    /// Coverage-weighted mean of the material properties, each in [0, 1]
    pub material_properties: BTreeMap<String, f32>,
    pub materials: Vec<Material>,
}

pub fn generate_physics(
    pano: &Array3<u8>,
    depth: &Array2<f32>,
    pose: &Pose,
    settings: &GeneratorSettings,
) -> PhysicsData {
    let collision_map = collision_from_depth(depth, pose, settings);

    let pixels = color::sample_pixels(pano.view(), 2);
    let total = pixels.len().max(1) as f32;
    let materials: Vec<Material> = color::kmeans(&pixels, settings.material_clusters, 8)
        .into_iter()
        .map(|(c, n)| Material {
            color: c.to_rgb(),
            coverage: n as f32 / total,
            properties: surface_properties(c),
        })
        .collect();

    let mut material_properties = BTreeMap::new();
    for m in &materials {
        for (name, v) in &m.properties {
            *material_properties.entry(name.clone()).or_insert(0.0) += v * m.coverage;
        }
    }
    for v in material_properties.values_mut() {
        *v = (*v).clamp(0.0, 1.0);
    }

    tracing::debug!(
        materials = materials.len(),
        blocked = collision_map.count(super::navigation::CellState::Blocked),
        "physics generated"
    );

    PhysicsData {
        gravity: GRAVITY,
        floor_height: pose.position[1] - settings.camera_height,
        ceiling_height: pose.position[1] - settings.camera_height + settings.ceiling_height,
        collision_map,
        material_properties,
        materials,
    }
}

/// Top-down occupancy around the pose from the horizon band of `depth`
pub fn collision_from_depth(depth: &Array2<f32>, pose: &Pose, settings: &GeneratorSettings) -> OccupancyGrid {
    let (h, w) = depth.dim();
    let eq = Equirect::new(h, w);
    let center = [pose.position[0], pose.position[2]];

    let open = settings.max_depth * 0.999;
    let horizon = geometry::horizon_distances(depth, OBSTACLE_BAND);

    // Enough rays that neighbours stay within a cell of each other at max range
    let per_column = ((TAU * settings.max_depth) / (settings.cell_size * w as f32))
        .ceil()
        .clamp(1.0, 16.0) as usize;

    let rays: Vec<(f32, f32)> = (0..w * per_column)
        .map(|i| {
            let x = i / per_column;
            let t = (i % per_column) as f32 / per_column as f32;
            let d = horizon[x] * (1.0 - t) + horizon[(x + 1) % w] * t;
            let az = eq.azimuth(x as f32 + t) + pose.yaw;
            let d = if d >= open { settings.max_depth } else { d };
            (az, d)
        })
        .collect();

    let frame = GridFrame::centred(center, settings.max_depth, settings.cell_size);
    let mut grid = OccupancyGrid::new(frame);
    grid.carve(center, &rays, settings.max_depth);
    grid
}

/// Heuristic physical response of a surface from its colour
pub fn surface_properties(c: Color) -> BTreeMap<String, f32> {
    let lum = c.luminance();
    let sat = c.saturation();

    let roughness = 0.3 + 0.5 * (1.0 - lum) + 0.2 * (1.0 - sat);
    let friction = 0.25 + 0.6 * roughness;
    let restitution = 0.1 + 0.4 * (1.0 - roughness) + 0.2 * sat;
    let hardness = 0.4 + 0.4 * (1.0 - sat) - 0.2 * lum;

    [
        ("albedo", lum),
        ("friction", friction),
        ("hardness", hardness),
        ("restitution", restitution),
        ("roughness", roughness),
    ]
    .into_iter()
    .map(|(k, v)| (k.to_string(), v.clamp(0.0, 1.0)))
    .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::environment::navigation::CellState;

    #[test]
    fn surface_properties_are_unit_interval() {
        for rgb in [[0u8, 0, 0], [255, 255, 255], [255, 0, 0], [12, 200, 90]] {
            let props = surface_properties(Color::from_array(rgb));
            assert_eq!(props.len(), 5);
            assert!(props.values().all(|v| (0.0..=1.0).contains(v)), "{rgb:?}: {props:?}");
        }
    }

    #[test]
    fn constant_wall_ring_blocks_at_that_distance() {
        let settings = GeneratorSettings { cell_size: 0.25, ..Default::default() };
        let (h, w) = (32, 64);
        let eq = Equirect::new(h, w);
        let depth = Array2::from_shape_fn((h, w), |(y, _)| 3.0 / eq.elevation(y as f32).cos().max(0.05));
        let pose = Pose::default();

        let grid = collision_from_depth(&depth, &pose, &settings);
        let f = grid.frame;
        assert_eq!(grid.get(f.world_to_cell(0.0, 0.0).unwrap()), CellState::Free);
        let a = eq.azimuth(32.0);
        let wall = f.world_to_cell(3.0 * a.sin(), 3.0 * a.cos()).unwrap();
        assert_eq!(grid.get(wall), CellState::Blocked);
        assert_eq!(grid.get(f.world_to_cell(0.1, 5.0).unwrap()), CellState::Unknown);
    }

    #[test]
    fn physics_uses_earth_gravity() {
        let settings = GeneratorSettings::default();
        let pano = Array3::from_shape_fn((16, 32, 3), |(y, x, c)| ((x * 8 + y + c * 40) % 256) as u8);
        let depth = Array2::from_elem((16, 32), 4.0f32);
        let physics = generate_physics(&pano, &depth, &Pose::default(), &settings);

        assert_eq!(physics.gravity, GRAVITY);
        assert!(!physics.materials.is_empty());
        assert!(physics.material_properties.values().all(|v| (0.0..=1.0).contains(v)));
        assert!((physics.floor_height + settings.camera_height).abs() < 1e-6);
    }
}
