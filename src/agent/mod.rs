// agent/ - Imagination-guided exploration of a generated environment
//
// Each step the agent imagines a short rollout along a fan of headings,
// scores them by expected discovery, goal progress and turning, then walks
// one step along the winner. When no heading looks useful it follows an A*
// path to the goal or to the nearest frontier.

pub mod perception;
pub mod state;

use serde::{Deserialize, Serialize};
use std::f32::consts::{PI, TAU};
use std::fs;
use std::path::Path;

use crate::config::{AgentSettings, Settings};
use crate::environment::geometry::wrap_angle;
use crate::environment::{Cell, Environment};
use crate::error::{GenexError, Result};
use perception::Memory;

pub use state::{ExplorationState, Goal, ImaginedState, Observation, yaw_quaternion};

/// Consecutive steps without movement before the agent gives up
const STALL_LIMIT: usize = 3;
const DEFAULT_SEED: u32 = 0xDEADBEEF;

/// Weights of the heading scorer
#[derive(Clone, Copy, Debug, PartialEq, Serialize, Deserialize)]
pub struct PolicyWeights {
    pub explore: f32,
    pub goal: f32,
    pub turn_penalty: f32,
}

#[derive(Serialize, Deserialize)]
struct AgentSnapshot {
    policy: PolicyWeights,
    rng: u32,
    episodes: u64,
}

pub struct ExplorationAgent {
    settings: AgentSettings,
    policy: PolicyWeights,
    rng: u32,
    episodes: u64,
}

/// Bookkeeping for a single run
struct Episode<'a> {
    env: &'a Environment,
    memory: Memory,
    /// Cells reachable from the spawn in the true navigation map
    reachable: Vec<bool>,
    reachable_count: usize,
    target: Option<Target>,
    steps: usize,
    stalled: usize,
}

struct Target {
    position: [f32; 3],
    /// Walkable cell the agent heads for
    cell: Cell,
    tolerance: f32,
}

/// Motion chosen for one step
struct Step {
    heading: f32,
    distance: f32,
    predicted_gain: usize,
}

impl ExplorationAgent {
    pub fn new(settings: &Settings) -> Self {
        let agent = &settings.agent;
        Self {
            settings: agent.clone(),
            policy: PolicyWeights {
                explore: agent.explore_weight,
                goal: agent.goal_weight,
                turn_penalty: agent.turn_penalty,
            },
            rng: if agent.seed == 0 { DEFAULT_SEED } else { agent.seed },
            episodes: 0,
        }
    }

    pub fn policy(&self) -> PolicyWeights {
        self.policy
    }

    /// Completed runs since construction or the last loaded snapshot
    pub fn episodes(&self) -> u64 {
        self.episodes
    }

    /// Explore `env` from its spawn cell, optionally steering for `goal`.
    /// Returns one state per step taken.
    pub fn explore(&mut self, env: &Environment, goal: Option<&Goal>) -> Result<Vec<ExplorationState>> {
        let nav = &env.navigation_map;
        let target = goal.map(|g| self.resolve_goal(env, g)).transpose()?;

        if !nav.is_walkable(nav.spawn) {
            tracing::warn!(id = %env.id, "environment has no walkable spawn, nothing to explore");
            self.episodes += 1;
            return Ok(Vec::new());
        }

        let reachable = nav.reachable_from(nav.spawn);
        let reachable_count = reachable.iter().filter(|&&r| r).count();
        let mut ep = Episode {
            env,
            memory: Memory::new(&nav.frame),
            reachable,
            reachable_count,
            target,
            steps: 0,
            stalled: 0,
        };

        let spawn = nav.frame.cell_center(nav.spawn);
        let position = [spawn[0], env.pose.position[1], spawn[1]];
        let observations = self.sense(&mut ep, position);
        let mut current = ExplorationState::new(position, yaw_quaternion(env.pose.yaw), observations, Vec::new(), 1.0);

        tracing::info!(
            id = %env.id,
            goal = ep.target.is_some(),
            reachable = ep.reachable_count,
            "exploration started"
        );

        let mut trajectory = Vec::new();
        while !self.exploration_complete(&ep, &current) {
            let imagined = self.imagine_future_states(&mut ep, &current);
            let Some(step) = self.select_action(&ep, &current, &imagined) else {
                tracing::debug!(steps = ep.steps, "no reachable frontier left");
                break;
            };
            current = self.execute_action(&mut ep, &current, step, imagined);
            trajectory.push(current.clone());
        }

        self.episodes += 1;
        tracing::info!(
            id = %env.id,
            steps = trajectory.len(),
            coverage = current.observations.coverage,
            "exploration finished"
        );
        Ok(trajectory)
    }

    fn resolve_goal(&self, env: &Environment, goal: &Goal) -> Result<Target> {
        let nav = &env.navigation_map;
        let [x, _, z] = goal.position;
        let cell = nav
            .frame
            .world_to_cell(x, z)
            .ok_or_else(|| GenexError::InvalidGoal(format!("({x:.2}, {z:.2}) lies outside the environment")))?;
        let cell = nav
            .nearest_walkable(cell)
            .ok_or_else(|| GenexError::InvalidGoal("no walkable ground near the goal".into()))?;
        Ok(Target {
            position: goal.position,
            cell,
            tolerance: goal.tolerance.unwrap_or(self.settings.goal_tolerance),
        })
    }

    fn sense(&self, ep: &mut Episode, position: [f32; 3]) -> Observation {
        let (ranges, newly_observed) =
            perception::sense(ep.env, &mut ep.memory, position, self.settings.rays, self.settings.sensor_range);

        let seen = ep
            .reachable
            .iter()
            .zip(&ep.memory.known)
            .filter(|&(&r, &k)| r && k)
            .count();
        let coverage = if ep.reachable_count == 0 { 1.0 } else { seen as f32 / ep.reachable_count as f32 };

        Observation { ranges, newly_observed, observed: ep.memory.count, coverage }
    }

    fn imagine_future_states(&self, ep: &mut Episode, current: &ExplorationState) -> Vec<ImaginedState> {
        let n = self.settings.headings.max(1);
        let base = current.yaw();
        (0..n)
            .map(|k| {
                let heading = wrap_angle(base + k as f32 / n as f32 * TAU);
                perception::imagine(ep.env, &mut ep.memory, current.position, heading, &self.settings)
            })
            .collect()
    }

    fn select_action(&mut self, ep: &Episode, current: &ExplorationState, imagined: &[ImaginedState]) -> Option<Step> {
        let reach = self.settings.step_length * self.settings.horizon.max(1) as f32;
        let yaw = current.yaw();
        let max_gain = imagined.iter().map(|s| s.predicted_gain).max().unwrap_or(0);
        let here_to_goal = ep.target.as_ref().map(|t| self.believed_distance(ep, current.position, t.cell));

        let mut best: Option<(f32, &ImaginedState)> = None;
        for s in imagined {
            if horizontal_distance(current.position, s.position) < self.settings.step_length * 0.5 {
                continue;
            }
            let progress = match (&ep.target, here_to_goal) {
                (Some(t), Some(from)) if from.is_finite() => {
                    let to = self.believed_distance(ep, s.position, t.cell);
                    if to.is_finite() { ((from - to) / reach).clamp(-1.0, 1.0) } else { -1.0 }
                }
                _ => 0.0,
            };
            // With a goal only headings that close in on it are worth taking
            let useful = if ep.target.is_some() { progress > 1e-3 } else { s.predicted_gain > 0 };
            if !useful {
                continue;
            }

            let gain = if max_gain > 0 { s.predicted_gain as f32 / max_gain as f32 } else { 0.0 };
            let turn = wrap_angle(s.heading - yaw).abs() / PI;
            let score = self.policy.explore * gain + self.policy.goal * progress - self.policy.turn_penalty * turn
                + self.rand() * 1e-3;

            if best.is_none_or(|(b, _)| score > b) {
                best = Some((score, s));
            }
        }

        if let Some((_, s)) = best {
            return Some(Step { heading: s.heading, distance: self.settings.step_length, predicted_gain: s.predicted_gain });
        }

        if let Some(t) = &ep.target {
            let memory = &ep.memory;
            if let Some(step) =
                self.follow_path(ep, current.position, t.cell, |c| perception::believed_open(ep.env, memory, c))
            {
                return Some(step);
            }
        }

        let frontier = self.nearest_frontier(ep, current.position)?;
        tracing::trace!(?frontier, "heading for frontier");
        let nav = &ep.env.navigation_map;
        let memory = &ep.memory;
        self.follow_path(ep, current.position, frontier, |c| {
            memory.known[nav.frame.index(c)] && nav.is_walkable(c)
        })
    }

    /// Believed shortest path length from `from` to `goal`, infinite when the
    /// belief has no path
    fn believed_distance(&self, ep: &Episode, from: [f32; 3], goal: Cell) -> f32 {
        let nav = &ep.env.navigation_map;
        let Some(start) = nav.frame.world_to_cell(from[0], from[2]) else {
            return f32::INFINITY;
        };
        nav.find_path_with(start, goal, |c| perception::believed_open(ep.env, &ep.memory, c))
            .map_or(f32::INFINITY, |path| nav.path_length(&path))
    }

    /// One step along an A* path: aim at the furthest waypoint within a step
    /// that is in line of sight over `passable` cells
    fn follow_path(&self, ep: &Episode, from: [f32; 3], goal: Cell, passable: impl Fn(Cell) -> bool) -> Option<Step> {
        let frame = &ep.env.navigation_map.frame;
        let here = frame.world_to_cell(from[0], from[2])?;
        let path = ep.env.navigation_map.find_path_with(here, goal, &passable)?;
        if path.len() < 2 {
            return None;
        }

        let origin = [from[0], from[2]];
        let dist = |p: [f32; 2]| ((p[0] - origin[0]).powi(2) + (p[1] - origin[1]).powi(2)).sqrt();
        let mut waypoint = frame.cell_center(path[1]);
        for &cell in &path[2..] {
            let p = frame.cell_center(cell);
            if dist(p) > self.settings.step_length {
                break;
            }
            if frame.trace(origin, p).into_iter().all(&passable) {
                waypoint = p;
            }
        }

        let d = dist(waypoint);
        if d < 1e-4 {
            return None;
        }
        Some(Step {
            heading: (waypoint[0] - origin[0]).atan2(waypoint[1] - origin[1]),
            distance: d.min(self.settings.step_length),
            predicted_gain: 0,
        })
    }

    /// Closest frontier cell over known walkable ground
    fn nearest_frontier(&self, ep: &Episode, from: [f32; 3]) -> Option<Cell> {
        let nav = &ep.env.navigation_map;
        let frame = &nav.frame;
        let start = frame.world_to_cell(from[0], from[2])?;

        let mut seen = vec![false; frame.len()];
        let mut queue = std::collections::VecDeque::from([start]);
        seen[frame.index(start)] = true;
        while let Some(cell) = queue.pop_front() {
            if perception::is_frontier(ep.env, &ep.memory, cell) {
                return Some(cell);
            }
            for n in frame.neighbours(cell) {
                let i = frame.index(n);
                if !seen[i] && ep.memory.known[i] && nav.walkable[i] {
                    seen[i] = true;
                    queue.push_back(n);
                }
            }
        }
        None
    }

    fn execute_action(
        &self,
        ep: &mut Episode,
        current: &ExplorationState,
        step: Step,
        imagined: Vec<ImaginedState>,
    ) -> ExplorationState {
        let env = ep.env;
        let nav = &env.navigation_map;
        let start = current.position;
        let (s, c) = step.heading.sin_cos();
        let fine = nav.frame.cell_size * 0.25;
        let samples = (step.distance / fine).ceil() as usize;

        let mut reached = 0.0f32;
        for i in 1..=samples {
            let t = (i as f32 * fine).min(step.distance);
            let p = [start[0] + s * t, start[1], start[2] + c * t];
            if !nav.is_walkable_at(p[0], p[2]) {
                break;
            }
            reached = t;
            if ep.target.as_ref().is_some_and(|target| arrived(target, p, &nav.frame)) {
                break;
            }
        }

        let position = [start[0] + s * reached, start[1], start[2] + c * reached];
        ep.steps += 1;
        ep.stalled = if reached < 1e-3 { ep.stalled + 1 } else { 0 };

        let observations = self.sense(ep, position);
        let predicted = step.predicted_gain as f32;
        let actual = observations.newly_observed as f32;
        let confidence = 1.0 - (predicted - actual).abs() / predicted.max(actual).max(1.0);

        tracing::debug!(
            step = ep.steps,
            heading = step.heading,
            moved = reached,
            new_cells = observations.newly_observed,
            coverage = observations.coverage,
            "step"
        );
        ExplorationState::new(position, yaw_quaternion(step.heading), observations, imagined, confidence)
    }

    fn exploration_complete(&self, ep: &Episode, current: &ExplorationState) -> bool {
        if ep.steps >= self.settings.max_steps || ep.stalled >= STALL_LIMIT {
            return true;
        }
        if let Some(target) = &ep.target {
            return arrived(target, current.position, &ep.env.navigation_map.frame);
        }
        // Always take at least one step so a run yields a trajectory
        ep.steps > 0 && current.observations.coverage >= self.settings.coverage_target
    }

    pub fn save_state(&self, path: &Path) -> Result<()> {
        let snapshot = AgentSnapshot { policy: self.policy, rng: self.rng, episodes: self.episodes };
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent)?;
        }
        fs::write(path, serde_json::to_vec_pretty(&snapshot)?)?;
        tracing::info!(path = %path.display(), episodes = self.episodes, "agent state saved");
        Ok(())
    }

    pub fn load_state(&mut self, path: &Path) -> Result<()> {
        let snapshot: AgentSnapshot = serde_json::from_slice(&fs::read(path)?)?;
        self.policy = snapshot.policy;
        self.rng = if snapshot.rng == 0 { DEFAULT_SEED } else { snapshot.rng };
        self.episodes = snapshot.episodes;
        tracing::info!(path = %path.display(), episodes = self.episodes, "agent state loaded");
        Ok(())
    }

    /// xorshift32 in [0, 1]
    fn rand(&mut self) -> f32 {
        self.rng ^= self.rng << 13;
        self.rng ^= self.rng >> 17;
        self.rng ^= self.rng << 5;
        self.rng as f32 / u32::MAX as f32
    }
}

fn horizontal_distance(a: [f32; 3], b: [f32; 3]) -> f32 {
    ((a[0] - b[0]).powi(2) + (a[2] - b[2]).powi(2)).sqrt()
}

fn arrived(target: &Target, p: [f32; 3], frame: &crate::environment::GridFrame) -> bool {
    let cell = frame.cell_center(target.cell);
    horizontal_distance(p, target.position) <= target.tolerance
        || horizontal_distance(p, [cell[0], 0.0, cell[1]]) <= target.tolerance
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::environment::{CellState, EnvironmentGenerator, GridFrame, NavigationMap, OccupancyGrid, PhysicsData, Pose};
    use ndarray::{Array2, Array3};
    use std::collections::BTreeMap;

    fn setup() -> (Settings, Environment) {
        let mut settings = Settings::default();
        settings.generator.panorama_height = 32;
        settings.model_paths.depth_estimator = None;
        settings.agent.sensor_range = 1.5;
        settings.agent.max_steps = 60;
        let img = Array3::from_shape_fn((24, 32, 3), |(y, x, c)| ((x * 7 + y * 3 + c * 50) % 256) as u8);
        let env = EnvironmentGenerator::new(&settings).generate_environment(img.view()).unwrap();
        (settings, env)
    }

    #[test]
    fn trajectory_respects_state_invariants() {
        let (settings, env) = setup();
        let mut agent = ExplorationAgent::new(&settings);
        let trajectory = agent.explore(&env, None).unwrap();

        assert!(!trajectory.is_empty());
        assert!(trajectory.len() <= settings.agent.max_steps);
        for s in &trajectory {
            let n: f32 = s.orientation.iter().map(|v| v * v).sum::<f32>().sqrt();
            assert!((n - 1.0).abs() < 1e-4);
            assert!((0.0..=1.0).contains(&s.confidence));
            assert!(env.navigation_map.is_walkable_at(s.position[0], s.position[2]));
        }
        for w in trajectory.windows(2) {
            assert!(w[1].observations.coverage >= w[0].observations.coverage);
        }
        assert_eq!(agent.episodes(), 1);
    }

    /// Walled 6x6 room whose walkable floor is the 2x2 centre
    fn closed_room() -> Environment {
        let frame = GridFrame { cell_size: 0.25, origin: [-0.75, -0.75], width: 6, height: 6 };
        let mut grid = OccupancyGrid::new(frame);
        for i in 0..frame.len() {
            let [x, z] = frame.cell_at(i);
            let wall = x == 0 || z == 0 || x == 5 || z == 5;
            grid.cells[i] = if wall { CellState::Blocked } else { CellState::Free };
        }
        let navigation_map = NavigationMap::from_occupancy(&grid, [2, 2]);
        Environment {
            id: "room".into(),
            pose: Pose::default(),
            panorama: Array3::zeros((4, 8, 3)),
            depth_map: Array2::from_elem((4, 8), 1.0),
            physics_data: PhysicsData {
                gravity: -9.81,
                floor_height: -1.5,
                ceiling_height: 1.3,
                collision_map: grid,
                material_properties: BTreeMap::new(),
                materials: Vec::new(),
            },
            navigation_map,
        }
    }

    #[test]
    fn fully_seen_room_stops_without_frontier() {
        let mut settings = Settings::default();
        settings.agent.coverage_target = 1.5;
        settings.agent.max_steps = 50;
        settings.agent.step_length = 2.0;
        settings.agent.sensor_range = 3.0;
        settings.agent.rays = 64;
        let env = closed_room();
        assert_eq!(env.navigation_map.walkable_count(), 4);

        let mut agent = ExplorationAgent::new(&settings);
        let trajectory = agent.explore(&env, None).unwrap();
        assert!(trajectory.len() < settings.agent.max_steps);
        assert!(trajectory.is_empty());
        assert_eq!(agent.episodes(), 1);
    }

    #[test]
    fn goal_outside_grid_is_rejected() {
        let (settings, env) = setup();
        let mut agent = ExplorationAgent::new(&settings);
        let goal = Goal { position: [500.0, 0.0, 500.0], tolerance: None };
        assert!(matches!(agent.explore(&env, Some(&goal)), Err(GenexError::InvalidGoal(_))));
    }

    #[test]
    fn rng_state_survives_save_and_load() {
        let (settings, env) = setup();
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("agent.json");

        let mut agent = ExplorationAgent::new(&settings);
        agent.explore(&env, None).unwrap();
        agent.save_state(&path).unwrap();
        let expected = agent.explore(&env, None).unwrap();

        let mut restored = ExplorationAgent::new(&settings);
        restored.load_state(&path).unwrap();
        assert_eq!(restored.episodes(), 1);
        assert_eq!(restored.explore(&env, None).unwrap(), expected);
    }
}
