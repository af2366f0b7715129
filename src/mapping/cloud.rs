// cloud.rs - Observed surface samples and their voxel downsampling

use serde::{Deserialize, Serialize};
use std::collections::HashMap;

use crate::agent::ExplorationState;
use crate::config::MappingSettings;
use crate::environment::Environment;
use crate::environment::geometry::{back_project, compute_normals};

/// Surface category of a point
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SurfaceClass {
    Floor,
    Ceiling,
    Wall,
    Object,
}

impl SurfaceClass {
    pub const ALL: [SurfaceClass; 4] = [SurfaceClass::Floor, SurfaceClass::Ceiling, SurfaceClass::Wall, SurfaceClass::Object];

    /// Classify by the viewer-facing normal and whether the point lies above
    /// the viewpoint
    pub fn classify(normal: [f32; 3], above_eye: bool) -> Self {
        let ny = normal[1];
        if ny > 0.8 && !above_eye {
            SurfaceClass::Floor
        } else if ny < -0.8 && above_eye {
            SurfaceClass::Ceiling
        } else if ny.abs() < 0.3 {
            SurfaceClass::Wall
        } else {
            SurfaceClass::Object
        }
    }

    pub fn name(self) -> &'static str {
        match self {
            SurfaceClass::Floor => "floor",
            SurfaceClass::Ceiling => "ceiling",
            SurfaceClass::Wall => "wall",
            SurfaceClass::Object => "object",
        }
    }

    pub fn to_u8(self) -> u8 {
        self as u8
    }

    pub fn from_u8(v: u8) -> Option<Self> {
        Self::ALL.get(v as usize).copied()
    }
}

/// One back-projected depth sample
#[derive(Clone, Copy, Debug)]
pub struct Feature {
    pub position: [f32; 3],
    pub color: [u8; 3],
    pub normal: [f32; 3],
    pub label: SurfaceClass,
}

/// Downsampled cloud. The vectors run in parallel.
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct PointCloud {
    pub points: Vec<[f32; 3]>,
    pub colors: Vec<[u8; 3]>,
    pub normals: Vec<[f32; 3]>,
    pub labels: Vec<SurfaceClass>,
}

impl PointCloud {
    pub fn len(&self) -> usize {
        self.points.len()
    }

    pub fn is_empty(&self) -> bool {
        self.points.is_empty()
    }
}

/// Occupied voxel with averaged contents
#[derive(Clone, Debug)]
pub struct Voxel {
    pub key: [i64; 3],
    pub position: [f32; 3],
    pub color: [u8; 3],
    pub normal: [f32; 3],
    pub label: SurfaceClass,
}

/// Samples every `sample_stride` pixels of the depth map that lie within
/// `observation_radius` (horizontally) of a trajectory position
pub fn extract_features(env: &Environment, trajectory: &[ExplorationState], settings: &MappingSettings) -> Vec<Feature> {
    let eye = env.pose.position;
    let points = back_project(&env.depth_map, eye, env.pose.yaw);
    let normals = compute_normals(&points, eye);
    let (h, w, _) = points.dim();
    let stride = settings.sample_stride.max(1);
    let r2 = settings.observation_radius * settings.observation_radius;

    let mut features = Vec::new();
    for y in (0..h).step_by(stride) {
        for x in (0..w).step_by(stride) {
            let p = [points[[y, x, 0]], points[[y, x, 1]], points[[y, x, 2]]];
            let observed = trajectory.iter().any(|s| {
                let dx = p[0] - s.position[0];
                let dz = p[2] - s.position[2];
                dx * dx + dz * dz <= r2
            });
            if !observed {
                continue;
            }

            let n = [normals[[y, x, 0]], normals[[y, x, 1]], normals[[y, x, 2]]];
            features.push(Feature {
                position: p,
                color: [env.panorama[[y, x, 0]], env.panorama[[y, x, 1]], env.panorama[[y, x, 2]]],
                normal: n,
                label: SurfaceClass::classify(n, p[1] > eye[1]),
            });
        }
    }
    features
}

#[derive(Default)]
struct Accumulator {
    position: [f64; 3],
    color: [u32; 3],
    normal: [f32; 3],
    votes: [usize; 4],
    count: usize,
}

/// Voxel-grid downsample. Positions, colours and normals are averaged; the
/// label is the majority vote (ties go to the earlier class).
pub fn generate_point_cloud(features: &[Feature], voxel_size: f32) -> Vec<Voxel> {
    let mut cells: HashMap<[i64; 3], Accumulator> = HashMap::new();
    for f in features {
        let key = voxel_key(f.position, voxel_size);
        let acc = cells.entry(key).or_default();
        for k in 0..3 {
            acc.position[k] += f.position[k] as f64;
            acc.color[k] += f.color[k] as u32;
            acc.normal[k] += f.normal[k];
        }
        acc.votes[f.label as usize] += 1;
        acc.count += 1;
    }

    let mut voxels: Vec<Voxel> = cells
        .into_iter()
        .map(|(key, acc)| {
            let n = acc.count as f64;
            let len = acc.normal.iter().map(|v| v * v).sum::<f32>().sqrt();
            let normal = if len > 1e-6 { acc.normal.map(|v| v / len) } else { [0.0, 1.0, 0.0] };
            let label = (0..4)
                .max_by_key(|&i| (acc.votes[i], std::cmp::Reverse(i)))
                .and_then(|i| SurfaceClass::from_u8(i as u8))
                .unwrap_or(SurfaceClass::Object);
            Voxel {
                key,
                position: acc.position.map(|v| (v / n) as f32),
                color: acc.color.map(|v| (v as f64 / n).round() as u8),
                normal,
                label,
            }
        })
        .collect();

    // Stable output independent of hash order
    voxels.sort_by_key(|v| v.key);
    voxels
}

pub fn voxel_key(p: [f32; 3], voxel_size: f32) -> [i64; 3] {
    p.map(|v| (v / voxel_size).floor() as i64)
}

impl From<&[Voxel]> for PointCloud {
    fn from(voxels: &[Voxel]) -> Self {
        Self {
            points: voxels.iter().map(|v| v.position).collect(),
            colors: voxels.iter().map(|v| v.color).collect(),
            normals: voxels.iter().map(|v| v.normal).collect(),
            labels: voxels.iter().map(|v| v.label).collect(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn feature(p: [f32; 3], c: u8, label: SurfaceClass) -> Feature {
        Feature { position: p, color: [c, c, c], normal: [0.0, 1.0, 0.0], label }
    }

    #[test]
    fn classification_by_normal() {
        assert_eq!(SurfaceClass::classify([0.0, 1.0, 0.0], false), SurfaceClass::Floor);
        assert_eq!(SurfaceClass::classify([0.0, -1.0, 0.0], true), SurfaceClass::Ceiling);
        assert_eq!(SurfaceClass::classify([1.0, 0.0, 0.0], false), SurfaceClass::Wall);
        assert_eq!(SurfaceClass::classify([0.0, 0.6, 0.8], false), SurfaceClass::Object);
        // An upward face above the eye is not floor
        assert_eq!(SurfaceClass::classify([0.0, 1.0, 0.0], true), SurfaceClass::Object);
    }

    #[test]
    fn voxels_average_and_vote() {
        let features = [
            feature([0.01, 0.01, 0.01], 10, SurfaceClass::Floor),
            feature([0.03, 0.03, 0.03], 20, SurfaceClass::Floor),
            feature([0.05, 0.05, 0.05], 30, SurfaceClass::Wall),
            feature([1.05, 0.05, 0.05], 90, SurfaceClass::Wall),
        ];
        let voxels = generate_point_cloud(&features, 0.1);
        assert_eq!(voxels.len(), 2);

        let first = &voxels[0];
        assert_eq!(first.key, [0, 0, 0]);
        assert!((first.position[0] - 0.03).abs() < 1e-6);
        assert_eq!(first.color, [20, 20, 20]);
        assert_eq!(first.label, SurfaceClass::Floor);
        assert_eq!(voxels[1].label, SurfaceClass::Wall);
    }

    #[test]
    fn class_codes_round_trip() {
        for c in SurfaceClass::ALL {
            assert_eq!(SurfaceClass::from_u8(c.to_u8()), Some(c));
        }
        assert_eq!(SurfaceClass::from_u8(9), None);
    }
}
