// perception.rs - Range sensing and imagined rollouts on the grid
//
// The agent remembers which cells it has seen. Real sensing reads the
// environment's collision grid; imagination reads a belief in which seen
// cells are what they are and unseen cells are assumed open.

use std::f32::consts::TAU;

use super::state::ImaginedState;
use crate::config::AgentSettings;
use crate::environment::{Cell, CellState, Environment, GridFrame};

/// Cells the agent has seen
pub struct Memory {
    pub known: Vec<bool>,
    pub count: usize,
    /// Scratch marks for counting distinct cells in one rollout
    stamp: Vec<u32>,
    epoch: u32,
}

impl Memory {
    pub fn new(frame: &GridFrame) -> Self {
        Self { known: vec![false; frame.len()], count: 0, stamp: vec![0; frame.len()], epoch: 0 }
    }

    /// Mark a cell seen, true if it was new
    fn see(&mut self, i: usize) -> bool {
        if self.known[i] {
            return false;
        }
        self.known[i] = true;
        self.count += 1;
        true
    }
}

/// Walk a ray through the grid until `visit` returns false. Returns the
/// distance to the stopping cell's centre, or `range` if none stopped it.
fn cast(frame: &GridFrame, from: [f32; 2], azimuth: f32, range: f32, mut visit: impl FnMut(Cell) -> bool) -> f32 {
    let (s, c) = azimuth.sin_cos();
    let end = [from[0] + s * range, from[1] + c * range];
    for cell in frame.trace(from, end) {
        if !visit(cell) {
            let p = frame.cell_center(cell);
            return ((p[0] - from[0]).powi(2) + (p[1] - from[1]).powi(2)).sqrt().min(range);
        }
    }
    range
}

/// Sense from `position` against the true collision grid. Returns the ray
/// ranges and the number of newly seen cells.
pub fn sense(env: &Environment, memory: &mut Memory, position: [f32; 3], rays: usize, range: f32) -> (Vec<f32>, usize) {
    let grid = &env.physics_data.collision_map;
    let frame = grid.frame;
    let from = [position[0], position[2]];
    let rays = rays.max(1);

    let mut fresh = 0;
    let ranges: Vec<f32> = (0..rays)
        .map(|k| {
            let az = k as f32 / rays as f32 * TAU;
            cast(&frame, from, az, range, |cell| {
                if memory.see(frame.index(cell)) {
                    fresh += 1;
                }
                grid.get(cell) == CellState::Free
            })
        })
        .collect();

    // The cells around the agent are always in view
    if let Some(here) = frame.world_to_cell(from[0], from[1]) {
        for cell in std::iter::once(here).chain(frame.neighbours(here)) {
            if memory.see(frame.index(cell)) {
                fresh += 1;
            }
        }
    }

    (ranges, fresh)
}

/// Believed walkability of a cell: seen cells use the navigation grid,
/// unseen cells are open
pub fn believed_open(env: &Environment, memory: &Memory, cell: Cell) -> bool {
    let nav = &env.navigation_map;
    cell[0] < nav.frame.width
        && cell[1] < nav.frame.height
        && (!memory.known[nav.frame.index(cell)] || nav.is_walkable(cell))
}

pub fn believed_walkable(env: &Environment, memory: &Memory, x: f32, z: f32) -> bool {
    env.navigation_map
        .frame
        .world_to_cell(x, z)
        .is_some_and(|cell| believed_open(env, memory, cell))
}

/// Roll `horizon` steps along `heading` through the belief and predict how
/// many unseen cells a half-resolution sensor sweep would reveal there
pub fn imagine(
    env: &Environment,
    memory: &mut Memory,
    position: [f32; 3],
    heading: f32,
    settings: &AgentSettings,
) -> ImaginedState {
    let step = settings.step_length;
    let (s, c) = heading.sin_cos();
    let fine = env.navigation_map.frame.cell_size * 0.25;
    let total = step * settings.horizon.max(1) as f32;
    let samples = (total / fine).ceil() as usize;

    let mut travelled = 0.0f32;
    let mut blocked = false;
    for i in 1..=samples {
        let t = (i as f32 * fine).min(total);
        if !believed_walkable(env, memory, position[0] + s * t, position[2] + c * t) {
            blocked = true;
            break;
        }
        travelled = t;
    }

    let end = [position[0] + s * travelled, position[1], position[2] + c * travelled];
    let predicted_gain = if travelled < step * 0.5 {
        0
    } else {
        predict_gain(env, memory, end, (settings.rays / 2).max(8), settings.sensor_range)
    };

    ImaginedState { heading, position: end, predicted_gain, blocked }
}

fn predict_gain(env: &Environment, memory: &mut Memory, at: [f32; 3], rays: usize, range: f32) -> usize {
    let grid = &env.physics_data.collision_map;
    let frame = grid.frame;
    let from = [at[0], at[2]];

    memory.epoch = memory.epoch.wrapping_add(1);
    if memory.epoch == 0 {
        memory.stamp.fill(0);
        memory.epoch = 1;
    }
    let epoch = memory.epoch;

    let mut gain = 0;
    for k in 0..rays.max(1) {
        let az = k as f32 / rays.max(1) as f32 * TAU;
        cast(&frame, from, az, range, |cell| {
            let i = frame.index(cell);
            if memory.known[i] {
                return grid.cells[i] == CellState::Free;
            }
            if memory.stamp[i] != epoch {
                memory.stamp[i] = epoch;
                gain += 1;
            }
            true
        });
    }
    gain
}

/// Seen walkable cell next to an unseen one
pub fn is_frontier(env: &Environment, memory: &Memory, cell: Cell) -> bool {
    let nav = &env.navigation_map;
    let frame = &nav.frame;
    memory.known[frame.index(cell)]
        && nav.is_walkable(cell)
        && frame.neighbours(cell).any(|n| !memory.known[frame.index(n)])
}
