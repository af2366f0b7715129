// update.rs - Apply agent actions to an environment view
//
// Moving re-renders the panorama from the new position: every pixel is
// lifted to 3D with its depth, splatted into the new view through a
// z-buffer, and remaining holes take the nearest filled pixel in their row.
// A move whose warp lands every pixel where it was leaves the view as is.
// Rotating rolls the columns.

use ndarray::{Array2, Array3};
use serde::{Deserialize, Serialize};
use std::f32::consts::TAU;

use super::geometry::{self, Equirect, norm, wrap_angle};
use super::{Environment, Pose};
use crate::config::GeneratorSettings;
use crate::error::{GenexError, Result};

/// Clearance kept from floor and ceiling when moving vertically
const HEAD_ROOM: f32 = 0.1;

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum Action {
    /// Translate by `magnitude` metres along `direction` (need not be unit length)
    Move { direction: [f32; 3], magnitude: f32 },
    /// Turn in place by `yaw` radians, positive towards +x
    Rotate { yaw: f32 },
}

pub fn apply(env: &Environment, action: &Action, settings: &GeneratorSettings) -> Result<Environment> {
    match *action {
        Action::Move { direction, magnitude } => {
            if !magnitude.is_finite() || magnitude < 0.0 {
                return Err(GenexError::InvalidAction(format!("magnitude must be finite and non-negative, got {magnitude}")));
            }
            let len = norm(direction);
            if !len.is_finite() || len < 1e-6 {
                return Err(GenexError::InvalidAction("move direction must be a non-zero vector".into()));
            }
            let dir = [direction[0] / len, direction[1] / len, direction[2] / len];
            let target = clip_move(env, dir, magnitude);

            if norm(geometry::sub(target, env.pose.position)) < 1e-4 {
                tracing::debug!("move blocked, view unchanged");
                return Ok(env.clone());
            }

            let (panorama, depth_map) = reproject(env, target, settings);
            if panorama == env.panorama {
                tracing::debug!("move below warp resolution, view unchanged");
                return Ok(env.clone());
            }
            Ok(Environment {
                pose: Pose { position: target, yaw: env.pose.yaw },
                panorama,
                depth_map,
                ..env.clone()
            })
        }
        Action::Rotate { yaw } => {
            if !yaw.is_finite() {
                return Err(GenexError::InvalidAction("rotation must be finite".into()));
            }
            let w = env.panorama.dim().1;
            let shift = (yaw * w as f32 / TAU).round() as isize;
            Ok(Environment {
                pose: Pose {
                    position: env.pose.position,
                    yaw: wrap_angle(env.pose.yaw + shift as f32 * TAU / w as f32),
                },
                panorama: roll_columns3(&env.panorama, shift),
                depth_map: roll_columns2(&env.depth_map, shift),
                ..env.clone()
            })
        }
    }
}

/// Furthest point along the move that stays on walkable ground
fn clip_move(env: &Environment, dir: [f32; 3], magnitude: f32) -> [f32; 3] {
    let start = env.pose.position;
    let nav = &env.navigation_map;
    let physics = &env.physics_data;

    // Only the horizontal run is checked against the grid
    let horizontal = dir[0].hypot(dir[2]);
    let run = magnitude * horizontal;
    let mut offset = [0.0f32; 2];
    if run > 1e-6 {
        let heading = [dir[0] / horizontal, dir[2] / horizontal];
        let step = nav.frame.cell_size * 0.25;
        let steps = (run / step).ceil() as usize;
        for s in 1..=steps {
            let t = (s as f32 * step).min(run);
            let (x, z) = (start[0] + heading[0] * t, start[2] + heading[1] * t);
            if !nav.is_walkable_at(x, z) {
                break;
            }
            offset = [heading[0] * t, heading[1] * t];
        }
    }

    let lo = physics.floor_height + HEAD_ROOM;
    let hi = (physics.ceiling_height - HEAD_ROOM).max(lo);
    [
        start[0] + offset[0],
        (start[1] + dir[1] * magnitude).clamp(lo, hi),
        start[2] + offset[1],
    ]
}

/// Forward-warp panorama and depth into a view at `target`
pub fn reproject(env: &Environment, target: [f32; 3], settings: &GeneratorSettings) -> (Array3<u8>, Array2<f32>) {
    let (h, w, _) = env.panorama.dim();
    let eq = Equirect::new(h, w);
    let yaw = env.pose.yaw;
    let origin = env.pose.position;

    let mut pano = Array3::<u8>::zeros((h, w, 3));
    let mut zbuf = Array2::<f32>::from_elem((h, w), f32::INFINITY);

    for y in 0..h {
        for x in 0..w {
            let d = env.depth_map[[y, x]];
            let dir = eq.direction(y, x, yaw);
            let point = [origin[0] + dir[0] * d, origin[1] + dir[1] * d, origin[2] + dir[2] * d];
            let v = geometry::sub(point, target);
            let nd = norm(v);
            let Some((ny, nx)) = eq.pixel(v, yaw) else { continue };

            if nd < zbuf[[ny, nx]] {
                zbuf[[ny, nx]] = nd;
                for k in 0..3 {
                    pano[[ny, nx, k]] = env.panorama[[y, x, k]];
                }
            }
        }
    }

    fill_holes(&mut pano, &mut zbuf);
    zbuf.mapv_inplace(|d| d.clamp(settings.min_depth, settings.max_depth));
    (pano, zbuf)
}

/// Copy the nearest filled pixel of the same row (columns wrap) into every
/// hole; rows with nothing filled copy the nearest filled row
fn fill_holes(pano: &mut Array3<u8>, zbuf: &mut Array2<f32>) {
    let (h, w) = zbuf.dim();
    let mut row_filled = vec![false; h];

    for y in 0..h {
        let filled: Vec<usize> = (0..w).filter(|&x| zbuf[[y, x]].is_finite()).collect();
        if filled.is_empty() {
            continue;
        }
        row_filled[y] = true;

        for x in 0..w {
            if zbuf[[y, x]].is_finite() {
                continue;
            }
            let src = filled
                .iter()
                .copied()
                .min_by_key(|&f| {
                    let d = f.abs_diff(x);
                    d.min(w - d)
                })
                .unwrap_or(x);
            zbuf[[y, x]] = zbuf[[y, src]];
            for k in 0..3 {
                pano[[y, x, k]] = pano[[y, src, k]];
            }
        }
    }

    for y in 0..h {
        if row_filled[y] {
            continue;
        }
        let Some(src) = (0..h).filter(|&r| row_filled[r]).min_by_key(|&r| r.abs_diff(y)) else {
            return;
        };
        for x in 0..w {
            zbuf[[y, x]] = zbuf[[src, x]];
            for k in 0..3 {
                pano[[y, x, k]] = pano[[src, x, k]];
            }
        }
    }
}

fn roll_columns3(a: &Array3<u8>, shift: isize) -> Array3<u8> {
    let (h, w, c) = a.dim();
    Array3::from_shape_fn((h, w, c), |(y, x, k)| a[[y, (x as isize + shift).rem_euclid(w as isize) as usize, k]])
}

fn roll_columns2(a: &Array2<f32>, shift: isize) -> Array2<f32> {
    let (h, w) = a.dim();
    Array2::from_shape_fn((h, w), |(y, x)| a[[y, (x as isize + shift).rem_euclid(w as isize) as usize]])
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn action_json_uses_type_tag() {
        let a: Action = serde_json::from_str(r#"{"type":"move","direction":[1.0,0.0,0.0],"magnitude":1.0}"#).unwrap();
        assert_eq!(a, Action::Move { direction: [1.0, 0.0, 0.0], magnitude: 1.0 });
        let r: Action = serde_json::from_str(r#"{"type":"rotate","yaw":0.5}"#).unwrap();
        assert_eq!(r, Action::Rotate { yaw: 0.5 });
    }

    fn generated() -> (GeneratorSettings, Environment) {
        let mut settings = crate::config::Settings::default();
        settings.generator.panorama_height = 32;
        settings.model_paths.depth_estimator = None;
        let img = Array3::from_shape_fn((24, 32, 3), |(y, x, c)| ((x * 13 + y * 29 + c * 90) % 256) as u8);
        let env = super::super::EnvironmentGenerator::new(&settings).generate_environment(img.view()).unwrap();
        (settings.generator, env)
    }

    #[test]
    fn huge_vertical_move_only_changes_height() {
        let (settings, env) = generated();
        let up = Action::Move { direction: [0.0, 1.0, 0.0], magnitude: 1e9 };
        let moved = apply(&env, &up, &settings).unwrap();

        let p = moved.pose.position;
        assert_eq!([p[0], p[2]], [env.pose.position[0], env.pose.position[2]]);
        assert_eq!(p[1], env.physics_data.ceiling_height - HEAD_ROOM);
    }

    #[test]
    fn move_below_warp_resolution_is_a_no_op() {
        let (settings, env) = generated();
        let nudge = Action::Move { direction: [1.0, 0.0, 0.0], magnitude: 1e-3 };
        assert_eq!(apply(&env, &nudge, &settings).unwrap(), env);

        let step = Action::Move { direction: [1.0, 0.0, 0.0], magnitude: 0.2 };
        let moved = apply(&env, &step, &settings).unwrap();
        assert_ne!(moved.pose, env.pose);
        assert_ne!(moved.panorama, env.panorama);
        assert_ne!(moved.depth_map, env.depth_map);
    }

    #[test]
    fn roll_then_unroll_is_identity() {
        let a = Array2::from_shape_fn((3, 8), |(y, x)| (y * 8 + x) as f32);
        let back = roll_columns2(&roll_columns2(&a, 3), -3);
        assert_eq!(a, back);
    }

    #[test]
    fn holes_take_nearest_neighbour() {
        let mut pano = Array3::<u8>::zeros((2, 4, 3));
        let mut zbuf = Array2::from_elem((2, 4), f32::INFINITY);
        zbuf[[0, 1]] = 2.0;
        pano[[0, 1, 0]] = 77;

        fill_holes(&mut pano, &mut zbuf);
        assert!(zbuf.iter().all(|d| *d == 2.0));
        assert!((0..4).all(|x| pano[[1, x, 0]] == 77));
    }
}
