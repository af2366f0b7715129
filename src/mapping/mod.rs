// mapping/ - Semantic 3D map from an exploration trajectory
//
// Pipeline:
//   1. Back-project the depth map and keep what the trajectory observed
//   2. Voxel-downsample into a labelled point cloud
//   3. Mesh each surface class
//   4. Annotate classes with extent and colour palette
//   5. Plan paths over the observed floor

pub mod cloud;
pub mod mesh;
pub mod ply;

use serde::{Deserialize, Serialize};
use std::fs;
use std::path::Path;

use crate::agent::ExplorationState;
use crate::color::{self, Color};
use crate::config::{MappingSettings, Settings};
use crate::environment::Environment;
use crate::error::{GenexError, Result};

pub use cloud::{Feature, PointCloud, SurfaceClass, Voxel};
pub use mesh::Mesh;

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct Bounds {
    pub min: [f32; 3],
    pub max: [f32; 3],
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct PaletteEntry {
    pub color: [u8; 3],
    /// Fraction of the class's points closest to this colour
    pub share: f32,
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct Annotation {
    pub label: SurfaceClass,
    pub point_count: usize,
    pub area: f32,
    pub bounds: Bounds,
    pub centroid: [f32; 3],
    pub palette: Vec<PaletteEntry>,
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct NavigationPath {
    /// "trajectory" for the first-to-last path, otherwise the class name
    pub target: String,
    pub from: [f32; 3],
    pub to: [f32; 3],
    /// Cell centres at floor height
    pub waypoints: Vec<[f32; 3]>,
    pub length: f32,
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct SemanticMap {
    pub point_cloud: PointCloud,
    pub meshes: Vec<Mesh>,
    pub annotations: Vec<Annotation>,
    pub navigation_paths: Vec<NavigationPath>,
}

/// Everything but the point cloud, which lives in its own PLY file
#[derive(Serialize, Deserialize)]
struct MapRecord {
    meshes: Vec<Mesh>,
    annotations: Vec<Annotation>,
    navigation_paths: Vec<NavigationPath>,
}

pub struct MappingTask {
    settings: MappingSettings,
}

impl MappingTask {
    pub fn new(settings: &Settings) -> Self {
        Self { settings: settings.mapping.clone() }
    }

    pub fn create_map(&self, env: &Environment, trajectory: &[ExplorationState]) -> Result<SemanticMap> {
        if trajectory.is_empty() {
            return Err(GenexError::EmptyExploration);
        }
        let voxel_size = self.settings.voxel_size;

        let features = cloud::extract_features(env, trajectory, &self.settings);
        let voxels = cloud::generate_point_cloud(&features, voxel_size);
        let meshes = mesh::create_meshes(&voxels, voxel_size);
        let annotations = self.add_semantic_annotations(&voxels, &meshes);
        let navigation_paths = self.generate_navigation_paths(env, trajectory, &voxels, &annotations);

        tracing::info!(
            id = %env.id,
            states = trajectory.len(),
            features = features.len(),
            points = voxels.len(),
            paths = navigation_paths.len(),
            "map created"
        );

        Ok(SemanticMap {
            point_cloud: PointCloud::from(voxels.as_slice()),
            meshes,
            annotations,
            navigation_paths,
        })
    }

    fn add_semantic_annotations(&self, voxels: &[Voxel], meshes: &[Mesh]) -> Vec<Annotation> {
        SurfaceClass::ALL
            .iter()
            .filter_map(|&label| {
                let members: Vec<&Voxel> = voxels.iter().filter(|v| v.label == label).collect();
                if members.is_empty() {
                    return None;
                }

                let mut min = [f32::INFINITY; 3];
                let mut max = [f32::NEG_INFINITY; 3];
                let mut sum = [0.0f64; 3];
                for v in &members {
                    for k in 0..3 {
                        min[k] = min[k].min(v.position[k]);
                        max[k] = max[k].max(v.position[k]);
                        sum[k] += v.position[k] as f64;
                    }
                }
                let n = members.len();
                let centroid = sum.map(|s| (s / n as f64) as f32);

                let colors: Vec<Color> = members.iter().map(|v| Color::from_array(v.color)).collect();
                let palette = color::kmeans(&colors, self.settings.palette_size, 8)
                    .into_iter()
                    .map(|(c, count)| PaletteEntry { color: c.to_rgb(), share: count as f32 / n as f32 })
                    .collect();

                Some(Annotation {
                    label,
                    point_count: n,
                    area: meshes.iter().find(|m| m.label == label).map_or(0.0, |m| m.area),
                    bounds: Bounds { min, max },
                    centroid,
                    palette,
                })
            })
            .collect()
    }

    fn generate_navigation_paths(
        &self,
        env: &Environment,
        trajectory: &[ExplorationState],
        voxels: &[Voxel],
        annotations: &[Annotation],
    ) -> Vec<NavigationPath> {
        let nav = &env.navigation_map;
        let frame = &nav.frame;

        // Cells under observed floor, widened by one cell to close sampling gaps
        let mut observed = vec![false; frame.len()];
        let mut mark = |x: f32, z: f32| {
            if let Some(cell) = frame.world_to_cell(x, z) {
                observed[frame.index(cell)] = true;
                for n in frame.neighbours(cell) {
                    observed[frame.index(n)] = true;
                }
            }
        };
        for v in voxels.iter().filter(|v| v.label == SurfaceClass::Floor) {
            mark(v.position[0], v.position[2]);
        }
        for s in trajectory {
            mark(s.position[0], s.position[2]);
        }

        let floor_y = env.physics_data.floor_height;
        let plan = |from: [f32; 3], to: [f32; 3], target: &str| -> Option<NavigationPath> {
            let start = nav.nearest_walkable(frame.world_to_cell(from[0], from[2])?)?;
            let goal = nav.nearest_walkable(frame.world_to_cell(to[0], to[2])?)?;
            let path = nav
                .find_path_with(start, goal, |c| nav.is_walkable(c) && observed[frame.index(c)])
                .or_else(|| {
                    tracing::debug!(to = target, "no path over observed floor, using all walkable cells");
                    nav.find_path(start, goal)
                })?;
            Some(NavigationPath {
                target: target.to_string(),
                from,
                to,
                waypoints: path.iter().map(|&c| lift(frame.cell_center(c), floor_y)).collect(),
                length: nav.path_length(&path),
            })
        };

        let mut paths = Vec::new();
        let first = trajectory[0].position;
        let last = trajectory[trajectory.len() - 1].position;
        paths.extend(plan(first, last, "trajectory"));

        for a in annotations.iter().filter(|a| a.label != SurfaceClass::Floor) {
            paths.extend(plan(last, a.centroid, a.label.name()));
        }
        paths
    }

    pub fn save_map(&self, map: &SemanticMap, dir: &Path) -> Result<()> {
        fs::create_dir_all(dir)?;
        fs::write(dir.join("points.ply"), ply::encode(&map.point_cloud))?;
        let record = MapRecord {
            meshes: map.meshes.clone(),
            annotations: map.annotations.clone(),
            navigation_paths: map.navigation_paths.clone(),
        };
        fs::write(dir.join("map.json"), serde_json::to_vec(&record)?)?;
        tracing::info!(path = %dir.display(), points = map.point_cloud.len(), "map saved");
        Ok(())
    }

    pub fn load_map(&self, dir: &Path) -> Result<SemanticMap> {
        let point_cloud = ply::decode(&fs::read(dir.join("points.ply"))?)?;
        let record: MapRecord = serde_json::from_slice(&fs::read(dir.join("map.json"))?)?;
        Ok(SemanticMap {
            point_cloud,
            meshes: record.meshes,
            annotations: record.annotations,
            navigation_paths: record.navigation_paths,
        })
    }
}

fn lift(p: [f32; 2], y: f32) -> [f32; 3] {
    [p[0], y, p[1]]
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::agent::{Observation, yaw_quaternion};
    use crate::environment::EnvironmentGenerator;
    use ndarray::Array3;

    fn setup() -> (Settings, Environment) {
        let mut settings = Settings::default();
        settings.generator.panorama_height = 48;
        settings.model_paths.depth_estimator = None;
        let img = Array3::from_shape_fn((30, 40, 3), |(y, x, c)| ((x * 5 + y * 11 + c * 70) % 256) as u8);
        let env = EnvironmentGenerator::new(&settings).generate_environment(img.view()).unwrap();
        (settings, env)
    }

    fn state_at(env: &Environment, dx: f32, dz: f32) -> ExplorationState {
        let spawn = env.navigation_map.frame.cell_center(env.navigation_map.spawn);
        ExplorationState::new([spawn[0] + dx, 0.0, spawn[1] + dz], yaw_quaternion(0.0), Observation::default(), vec![], 1.0)
    }

    #[test]
    fn empty_trajectory_is_rejected() {
        let (settings, env) = setup();
        let task = MappingTask::new(&settings);
        assert!(matches!(task.create_map(&env, &[]), Err(GenexError::EmptyExploration)));
    }

    #[test]
    fn map_has_floor_mesh_and_trajectory_path() {
        let (settings, env) = setup();
        let task = MappingTask::new(&settings);
        let map = task.create_map(&env, &[state_at(&env, 0.0, 0.0), state_at(&env, 0.0, 0.0)]).unwrap();

        assert!(!map.point_cloud.is_empty());
        assert_eq!(map.point_cloud.points.len(), map.point_cloud.labels.len());
        assert!(map.meshes.iter().any(|m| m.label == SurfaceClass::Floor && m.area > 0.0));
        let floor = map.annotations.iter().find(|a| a.label == SurfaceClass::Floor).unwrap();
        assert!(floor.centroid[1] < 0.0);
        assert!(!floor.palette.is_empty());

        let path = map.navigation_paths.iter().find(|p| p.target == "trajectory").unwrap();
        assert_eq!(path.waypoints.len(), 1);
        assert_eq!(path.length, 0.0);
    }

    #[test]
    fn saved_map_loads_back() {
        let (settings, env) = setup();
        let task = MappingTask::new(&settings);
        let map = task.create_map(&env, &[state_at(&env, 0.0, 0.0)]).unwrap();

        let dir = tempfile::tempdir().unwrap();
        task.save_map(&map, dir.path()).unwrap();
        assert_eq!(task.load_map(dir.path()).unwrap(), map);
    }
}
