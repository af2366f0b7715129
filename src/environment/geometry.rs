// geometry.rs - Equirectangular projection and derived geometry
//
// World frame: x right, y up, z forward. Column 0 looks backwards
// (azimuth -pi), the centre column looks along +z, row 0 is straight up.

use ndarray::{Array2, Array3};
use std::f32::consts::{FRAC_PI_2, PI, TAU};

/// Pixel <-> direction mapping for a `height x (2 * height)` panorama
#[derive(Clone, Copy, Debug, PartialEq)]
pub struct Equirect {
    pub width: usize,
    pub height: usize,
}

impl Equirect {
    pub fn new(height: usize, width: usize) -> Self {
        Self { width, height }
    }

    /// Azimuth of a column centre relative to the view yaw
    #[inline]
    pub fn azimuth(&self, col: f32) -> f32 {
        (col + 0.5) / self.width as f32 * TAU - PI
    }

    /// Elevation of a row centre, +pi/2 at the top
    #[inline]
    pub fn elevation(&self, row: f32) -> f32 {
        FRAC_PI_2 - (row + 0.5) / self.height as f32 * PI
    }

    /// Unit world direction of pixel (row, col) for a view rotated by `yaw`
    #[inline]
    pub fn direction(&self, row: usize, col: usize, yaw: f32) -> [f32; 3] {
        let phi = self.azimuth(col as f32) + yaw;
        let theta = self.elevation(row as f32);
        let (st, ct) = theta.sin_cos();
        let (sp, cp) = phi.sin_cos();
        [ct * sp, st, ct * cp]
    }

    /// Fractional (row, col) hit by world direction `dir`. Columns wrap into [0, width).
    pub fn project(&self, dir: [f32; 3], yaw: f32) -> Option<(f32, f32)> {
        let len = norm(dir);
        if len < 1e-6 {
            return None;
        }
        let phi = wrap_angle(dir[0].atan2(dir[2]) - yaw);
        let theta = (dir[1] / len).clamp(-1.0, 1.0).asin();

        let col = ((phi + PI) / TAU * self.width as f32 - 0.5).rem_euclid(self.width as f32);
        let row = ((FRAC_PI_2 - theta) / PI * self.height as f32 - 0.5)
            .clamp(0.0, self.height as f32 - 1.0);
        Some((row, col))
    }

    /// Rounded pixel hit by `dir`
    pub fn pixel(&self, dir: [f32; 3], yaw: f32) -> Option<(usize, usize)> {
        let (row, col) = self.project(dir, yaw)?;
        let r = (row.round() as usize).min(self.height - 1);
        let c = (col.round() as usize) % self.width;
        Some((r, c))
    }

    /// Row whose centre is closest to elevation `theta`
    pub fn row_of(&self, theta: f32) -> usize {
        let row = (FRAC_PI_2 - theta) / PI * self.height as f32 - 0.5;
        (row.round().max(0.0) as usize).min(self.height - 1)
    }
}

/// Wrap an angle into (-pi, pi]
pub fn wrap_angle(a: f32) -> f32 {
    let w = (a + PI).rem_euclid(TAU) - PI;
    if w <= -PI { w + TAU } else { w }
}

#[inline]
pub fn norm(v: [f32; 3]) -> f32 {
    (v[0] * v[0] + v[1] * v[1] + v[2] * v[2]).sqrt()
}

#[inline]
pub fn sub(a: [f32; 3], b: [f32; 3]) -> [f32; 3] {
    [a[0] - b[0], a[1] - b[1], a[2] - b[2]]
}

#[inline]
pub fn cross(a: [f32; 3], b: [f32; 3]) -> [f32; 3] {
    [
        a[1] * b[2] - a[2] * b[1],
        a[2] * b[0] - a[0] * b[2],
        a[0] * b[1] - a[1] * b[0],
    ]
}

#[inline]
pub fn dot(a: [f32; 3], b: [f32; 3]) -> f32 {
    a[0] * b[0] + a[1] * b[1] + a[2] * b[2]
}

/// World-space point of every depth pixel, shaped (H, W, 3)
pub fn back_project(depth: &Array2<f32>, position: [f32; 3], yaw: f32) -> Array3<f32> {
    let (h, w) = depth.dim();
    let eq = Equirect::new(h, w);
    let mut points = Array3::<f32>::zeros((h, w, 3));

    for y in 0..h {
        for x in 0..w {
            let d = depth[[y, x]];
            let dir = eq.direction(y, x, yaw);
            for k in 0..3 {
                points[[y, x, k]] = position[k] + dir[k] * d;
            }
        }
    }

    points
}

/// Surface normals from back-projected points using central differences.
/// Columns wrap, rows clamp. Normals face the viewer at `position`.
pub fn compute_normals(points: &Array3<f32>, position: [f32; 3]) -> Array3<f32> {
    let (h, w, _) = points.dim();
    let mut normals = Array3::<f32>::zeros((h, w, 3));
    if h < 2 || w < 2 {
        return normals;
    }

    let at = |y: usize, x: usize| [points[[y, x, 0]], points[[y, x, 1]], points[[y, x, 2]]];

    for y in 0..h {
        let (ya, yb) = (y.saturating_sub(1), (y + 1).min(h - 1));
        for x in 0..w {
            let (xa, xb) = ((x + w - 1) % w, (x + 1) % w);

            let du = sub(at(y, xb), at(y, xa));
            let dv = sub(at(yb, x), at(ya, x));
            let mut n = cross(du, dv);
            let len = norm(n);
            if len < 1e-9 {
                continue;
            }
            n = [n[0] / len, n[1] / len, n[2] / len];

            // Face the viewer
            let to_point = sub(at(y, x), position);
            if dot(n, to_point) > 0.0 {
                n = [-n[0], -n[1], -n[2]];
            }
            for k in 0..3 {
                normals[[y, x, k]] = n[k];
            }
        }
    }

    normals
}

/// Per-column horizontal distance to the nearest surface in the band of
/// rows within `band` radians of the horizon
pub fn horizon_distances(depth: &Array2<f32>, band: f32) -> Vec<f32> {
    let (h, w) = depth.dim();
    let eq = Equirect::new(h, w);
    let top = eq.row_of(band);
    let bottom = eq.row_of(-band).max(top);

    (0..w)
        .map(|x| {
            (top..=bottom)
                .map(|y| depth[[y, x]] * eq.elevation(y as f32).cos())
                .fold(f32::MAX, f32::min)
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn centre_column_faces_forward() {
        let eq = Equirect::new(64, 128);
        let d = eq.direction(32, 64, 0.0);
        assert!(d[2] > 0.99, "{d:?}");
        assert!(d[0].abs() < 0.05);
    }

    #[test]
    fn project_inverts_direction() {
        let eq = Equirect::new(64, 128);
        for &(row, col, yaw) in &[(10usize, 3usize, 0.0f32), (40, 100, 1.2), (63, 127, -2.5)] {
            let dir = eq.direction(row, col, yaw);
            let (r, c) = eq.pixel(dir, yaw).unwrap();
            assert_eq!((r, c), (row, col));
        }
    }

    #[test]
    fn wrap_angle_stays_in_range() {
        for a in [-10.0f32, -PI, 0.0, PI, 7.0] {
            let w = wrap_angle(a);
            assert!(w > -PI - 1e-6 && w <= PI + 1e-6, "{a} -> {w}");
        }
    }

    #[test]
    fn floor_points_get_upward_normals() {
        // Depth of a flat floor 1.5 m below the camera, walls far away
        let (h, w) = (32, 64);
        let eq = Equirect::new(h, w);
        let depth = Array2::from_shape_fn((h, w), |(y, _)| {
            let theta = eq.elevation(y as f32);
            if theta < -0.3 { 1.5 / (-theta).sin() } else { 10.0 }
        });
        let points = back_project(&depth, [0.0; 3], 0.0);
        let normals = compute_normals(&points, [0.0; 3]);
        let y = h - 4;
        assert!(normals[[y, 10, 1]] > 0.95, "{}", normals[[y, 10, 1]]);
    }
}
