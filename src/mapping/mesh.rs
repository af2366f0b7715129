// mesh.rs - Per-class surface meshes from occupied voxels
//
// Each voxel contributes one square through its centre, perpendicular to
// the dominant axis of its normal. Corners sit on the voxel lattice so
// neighbouring quads share vertices.

use serde::{Deserialize, Serialize};
use std::collections::HashMap;

use super::cloud::{SurfaceClass, Voxel};

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct Mesh {
    pub label: SurfaceClass,
    pub vertices: Vec<[f32; 3]>,
    /// Counter-clockwise seen from the side the normal points to
    pub triangles: Vec<[u32; 3]>,
    /// Square metres
    pub area: f32,
}

/// Builds one mesh per surface class present in `voxels`
pub fn create_meshes(voxels: &[Voxel], voxel_size: f32) -> Vec<Mesh> {
    SurfaceClass::ALL
        .iter()
        .filter_map(|&label| {
            let members: Vec<&Voxel> = voxels.iter().filter(|v| v.label == label).collect();
            if members.is_empty() {
                None
            } else {
                Some(build(label, &members, voxel_size))
            }
        })
        .collect()
}

fn build(label: SurfaceClass, voxels: &[&Voxel], voxel_size: f32) -> Mesh {
    let mut index: HashMap<[i64; 3], u32> = HashMap::new();
    let mut vertices = Vec::new();
    let mut triangles = Vec::with_capacity(voxels.len() * 2);

    // Lattice coordinates are doubled so voxel centres are integral
    let mut vertex = |p: [i64; 3]| -> u32 {
        *index.entry(p).or_insert_with(|| {
            vertices.push(p.map(|v| v as f32 * 0.5 * voxel_size));
            (vertices.len() - 1) as u32
        })
    };

    for v in voxels {
        let axis = dominant_axis(v.normal);
        let (u, w) = ((axis + 1) % 3, (axis + 2) % 3);
        let base = v.key.map(|k| k * 2);

        let corner = |du: i64, dw: i64| {
            let mut p = base;
            p[axis] += 1;
            p[u] += du * 2;
            p[w] += dw * 2;
            p
        };
        let quad = [
            vertex(corner(0, 0)),
            vertex(corner(1, 0)),
            vertex(corner(1, 1)),
            vertex(corner(0, 1)),
        ];

        // (u, w, axis) is right handed, so this winding faces +axis
        if v.normal[axis] >= 0.0 {
            triangles.push([quad[0], quad[1], quad[2]]);
            triangles.push([quad[0], quad[2], quad[3]]);
        } else {
            triangles.push([quad[0], quad[2], quad[1]]);
            triangles.push([quad[0], quad[3], quad[2]]);
        }
    }

    Mesh {
        label,
        vertices,
        triangles,
        area: voxels.len() as f32 * voxel_size * voxel_size,
    }
}

fn dominant_axis(n: [f32; 3]) -> usize {
    let a = n.map(f32::abs);
    if a[0] >= a[1] && a[0] >= a[2] {
        0
    } else if a[1] >= a[2] {
        1
    } else {
        2
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn floor_voxel(x: i64, z: i64) -> Voxel {
        Voxel {
            key: [x, -8, z],
            position: [x as f32 * 0.2 + 0.1, -1.5, z as f32 * 0.2 + 0.1],
            color: [100, 100, 100],
            normal: [0.0, 1.0, 0.0],
            label: SurfaceClass::Floor,
        }
    }

    #[test]
    fn adjacent_quads_share_vertices() {
        let voxels = [floor_voxel(0, 0), floor_voxel(1, 0), floor_voxel(0, 1), floor_voxel(1, 1)];
        let meshes = create_meshes(&voxels, 0.2);
        assert_eq!(meshes.len(), 1);

        let m = &meshes[0];
        assert_eq!(m.label, SurfaceClass::Floor);
        assert_eq!(m.triangles.len(), 8);
        // 2x2 quads on a lattice: 3x3 corners
        assert_eq!(m.vertices.len(), 9);
        assert!((m.area - 0.16).abs() < 1e-6);
        // Floor quads lie mid-voxel
        assert!(m.vertices.iter().all(|v| (v[1] - (-7.5 * 0.2)).abs() < 1e-5));
    }

    #[test]
    fn upward_normals_wind_counter_clockwise_from_above() {
        let meshes = create_meshes(&[floor_voxel(0, 0)], 0.2);
        let m = &meshes[0];
        let [a, b, c] = m.triangles[0].map(|i| m.vertices[i as usize]);
        let e1 = [b[0] - a[0], b[1] - a[1], b[2] - a[2]];
        let e2 = [c[0] - a[0], c[1] - a[1], c[2] - a[2]];
        let ny = e1[2] * e2[0] - e1[0] * e2[2];
        assert!(ny > 0.0);
    }
}
