// environment/ - Single image to navigable environment
//
// Pipeline:
//   1. Validate the RGB input
//   2. Synthesize a 360 degree panorama around it
//   3. Estimate metric depth (ONNX model or room prior)
//   4. Derive physics: collision grid, gravity, materials
//   5. Derive the walkable navigation grid

pub mod depth;
pub mod geometry;
pub mod navigation;
pub mod panorama;
pub mod physics;
pub mod storage;
pub mod update;

use ndarray::{Array2, Array3, ArrayView3};
use serde::{Deserialize, Serialize};
use std::path::Path;

use crate::config::Settings;
use crate::config::GeneratorSettings;
use crate::error::{GenexError, Result};

pub use depth::DepthEstimator;
pub use navigation::{Cell, CellState, GridFrame, NavigationMap, OccupancyGrid};
pub use physics::{Material, PhysicsData};
pub use update::Action;

/// Viewpoint of a panorama: position in metres and yaw in radians
#[derive(Clone, Copy, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct Pose {
    pub position: [f32; 3],
    pub yaw: f32,
}

#[derive(Clone, Debug, PartialEq)]
pub struct Environment {
    pub id: String,
    /// Where `panorama` and `depth_map` are seen from
    pub pose: Pose,
    /// (H, 2H, 3) equirectangular RGB
    pub panorama: Array3<u8>,
    /// (H, 2H) metres along each pixel ray
    pub depth_map: Array2<f32>,
    pub physics_data: PhysicsData,
    pub navigation_map: NavigationMap,
}

pub struct EnvironmentGenerator {
    settings: GeneratorSettings,
    depth: DepthEstimator,
}

impl EnvironmentGenerator {
    pub fn new(settings: &Settings) -> Self {
        Self {
            settings: settings.generator.clone(),
            depth: DepthEstimator::new(settings.model_paths.depth_estimator.clone()),
        }
    }

    pub fn settings(&self) -> &GeneratorSettings {
        &self.settings
    }

    /// Build an environment from an (H, W, 3) RGB array
    pub fn generate_environment(&self, image: ArrayView3<u8>) -> Result<Environment> {
        let (h, w, channels) = image.dim();
        if channels != 3 {
            return Err(GenexError::InvalidImage(format!("expected 3 colour channels, got {channels}")));
        }
        if h == 0 || w == 0 {
            return Err(GenexError::InvalidImage(format!("image has no pixels ({w}x{h})")));
        }

        let id = uuid::Uuid::new_v4().simple().to_string();
        tracing::info!(%id, width = w, height = h, "generating environment");

        let pose = Pose::default();
        let (panorama, placement) = panorama::generate_panorama(image, &self.settings)?;
        let depth_map = self.depth.estimate(&panorama, &placement, &self.settings);
        let physics_data = physics::generate_physics(&panorama, &depth_map, &pose, &self.settings);
        let navigation_map = self.create_navigation_map(&physics_data, &pose);

        tracing::info!(
            %id,
            walkable = navigation_map.walkable_count(),
            regions = navigation_map.regions.len(),
            "environment generated"
        );

        Ok(Environment { id, pose, panorama, depth_map, physics_data, navigation_map })
    }

    /// Decode image bytes (any format the `image` crate reads) and generate
    pub fn generate_from_bytes(&self, bytes: &[u8]) -> Result<Environment> {
        let rgb = decode_image(bytes)?;
        self.generate_environment(rgb.view())
    }

    fn create_navigation_map(&self, physics: &PhysicsData, pose: &Pose) -> NavigationMap {
        let grid = &physics.collision_map;
        let spawn = grid
            .frame
            .world_to_cell(pose.position[0], pose.position[2])
            .unwrap_or([grid.frame.width / 2, grid.frame.height / 2]);
        NavigationMap::from_occupancy(grid, spawn)
    }

    /// New environment after `action`; the input is left untouched
    pub fn update_environment(&self, current: &Environment, action: &Action) -> Result<Environment> {
        tracing::debug!(id = %current.id, ?action, "updating environment");
        update::apply(current, action, &self.settings)
    }

    pub fn save_environment(&self, env: &Environment, dir: &Path) -> Result<()> {
        storage::save(env, dir)
    }

    pub fn load_environment(&self, dir: &Path) -> Result<Environment> {
        storage::load(dir)
    }
}

/// Decode an encoded image into an (H, W, 3) RGB array
pub fn decode_image(bytes: &[u8]) -> Result<Array3<u8>> {
    let img = image::load_from_memory(bytes).map_err(|e| GenexError::UnsupportedInput(e.to_string()))?;
    let rgb = img.to_rgb8();
    let (w, h) = rgb.dimensions();
    Array3::from_shape_vec((h as usize, w as usize, 3), rgb.into_raw())
        .map_err(|e| GenexError::InvalidImage(e.to_string()))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn small_generator() -> EnvironmentGenerator {
        let mut settings = Settings::default();
        settings.generator.panorama_height = 32;
        settings.model_paths.depth_estimator = None;
        EnvironmentGenerator::new(&settings)
    }

    #[test]
    fn spawn_is_walkable_in_generated_room() {
        let img = Array3::from_shape_fn((24, 32, 3), |(y, x, c)| ((x * 9 + y * 5 + c * 60) % 256) as u8);
        let env = small_generator().generate_environment(img.view()).unwrap();

        assert!(env.navigation_map.is_walkable(env.navigation_map.spawn));
        assert_eq!(env.panorama.dim(), (32, 64, 3));
        assert_eq!(env.depth_map.dim(), (32, 64));
        assert_eq!(env.id.len(), 32);
    }

    #[test]
    fn four_channel_array_is_rejected() {
        let img = Array3::<u8>::zeros((8, 8, 4));
        let err = small_generator().generate_environment(img.view()).unwrap_err();
        assert!(matches!(err, GenexError::InvalidImage(_)));
    }

    #[test]
    fn decode_rejects_garbage() {
        assert!(matches!(decode_image(b"not an image"), Err(GenexError::UnsupportedInput(_))));
    }
}
