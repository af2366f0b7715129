// navigation.rs - Top-down occupancy and walkable grids
//
// Both grids share one layout: cell (i, j) covers world
// x in [origin[0] + i * cell_size, ...), z in [origin[1] + j * cell_size, ...).
// Storage is row-major over j.

use serde::{Deserialize, Serialize};
use std::cmp::Ordering;
use std::collections::{BinaryHeap, VecDeque};

pub type Cell = [usize; 2];

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(into = "u8", try_from = "u8")]
pub enum CellState {
    Free,
    Blocked,
    Unknown,
}

impl From<CellState> for u8 {
    fn from(s: CellState) -> u8 {
        match s {
            CellState::Free => 0,
            CellState::Blocked => 1,
            CellState::Unknown => 2,
        }
    }
}

impl TryFrom<u8> for CellState {
    type Error = String;
    fn try_from(v: u8) -> Result<Self, Self::Error> {
        match v {
            0 => Ok(CellState::Free),
            1 => Ok(CellState::Blocked),
            2 => Ok(CellState::Unknown),
            other => Err(format!("invalid cell state {other}")),
        }
    }
}

/// Shared grid layout
#[derive(Clone, Copy, Debug, PartialEq, Serialize, Deserialize)]
pub struct GridFrame {
    pub cell_size: f32,
    /// World (x, z) of the corner of cell (0, 0)
    pub origin: [f32; 2],
    pub width: usize,
    pub height: usize,
}

impl GridFrame {
    /// Square grid of `2 * ceil(radius / cell_size)` cells centred on (x, z)
    pub fn centred(center: [f32; 2], radius: f32, cell_size: f32) -> Self {
        let half = (radius / cell_size).ceil().max(1.0) as usize;
        let n = half * 2;
        Self {
            cell_size,
            origin: [center[0] - half as f32 * cell_size, center[1] - half as f32 * cell_size],
            width: n,
            height: n,
        }
    }

    #[inline]
    pub fn len(&self) -> usize {
        self.width * self.height
    }

    #[inline]
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    #[inline]
    pub fn index(&self, cell: Cell) -> usize {
        cell[1] * self.width + cell[0]
    }

    #[inline]
    pub fn cell_at(&self, index: usize) -> Cell {
        [index % self.width, index / self.width]
    }

    /// Cell containing world (x, z), if inside the grid
    pub fn world_to_cell(&self, x: f32, z: f32) -> Option<Cell> {
        let i = ((x - self.origin[0]) / self.cell_size).floor();
        let j = ((z - self.origin[1]) / self.cell_size).floor();
        if i < 0.0 || j < 0.0 || i >= self.width as f32 || j >= self.height as f32 {
            return None;
        }
        Some([i as usize, j as usize])
    }

    /// World (x, z) of the cell centre
    pub fn cell_center(&self, cell: Cell) -> [f32; 2] {
        [
            self.origin[0] + (cell[0] as f32 + 0.5) * self.cell_size,
            self.origin[1] + (cell[1] as f32 + 0.5) * self.cell_size,
        ]
    }

    /// 8-connected neighbours inside the grid
    pub fn neighbours(&self, cell: Cell) -> impl Iterator<Item = Cell> + '_ {
        const OFFSETS: [(isize, isize); 8] = [(-1, -1), (0, -1), (1, -1), (-1, 0), (1, 0), (-1, 1), (0, 1), (1, 1)];
        OFFSETS.iter().filter_map(move |&(dx, dy)| {
            let x = cell[0] as isize + dx;
            let y = cell[1] as isize + dy;
            if x < 0 || y < 0 || x >= self.width as isize || y >= self.height as isize {
                None
            } else {
                Some([x as usize, y as usize])
            }
        })
    }

    /// Cells crossed by the segment from world `from` towards `to`, sampled
    /// at half-cell steps, in order and without repeats
    pub fn trace(&self, from: [f32; 2], to: [f32; 2]) -> Vec<Cell> {
        let (dx, dz) = (to[0] - from[0], to[1] - from[1]);
        let len = (dx * dx + dz * dz).sqrt();
        let steps = (len / (self.cell_size * 0.5)).ceil().max(1.0) as usize;
        let mut cells: Vec<Cell> = Vec::with_capacity(steps + 1);

        for s in 0..=steps {
            let t = s as f32 / steps as f32;
            let Some(c) = self.world_to_cell(from[0] + dx * t, from[1] + dz * t) else { break };
            if cells.last() != Some(&c) {
                cells.push(c);
            }
        }
        cells
    }
}

/// Free / blocked / unknown cells seen from the capture point
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct OccupancyGrid {
    pub frame: GridFrame,
    pub cells: Vec<CellState>,
}

impl OccupancyGrid {
    pub fn new(frame: GridFrame) -> Self {
        Self { cells: vec![CellState::Unknown; frame.len()], frame }
    }

    #[inline]
    pub fn get(&self, cell: Cell) -> CellState {
        self.cells[self.frame.index(cell)]
    }

    #[inline]
    pub fn set(&mut self, cell: Cell, state: CellState) {
        let i = self.frame.index(cell);
        self.cells[i] = state;
    }

    pub fn count(&self, state: CellState) -> usize {
        self.cells.iter().filter(|&&c| c == state).count()
    }

    /// Mark free cells along each (azimuth, distance) ray from `center`,
    /// then the blocked cell where the ray ends. Rays at `max_range` end in
    /// open space and mark nothing blocked.
    pub fn carve(&mut self, center: [f32; 2], rays: &[(f32, f32)], max_range: f32) {
        let margin = self.frame.cell_size * 0.5;

        for &(azimuth, dist) in rays {
            let (s, c) = azimuth.sin_cos();
            let reach = (dist - margin).max(0.0);
            let end = [center[0] + s * reach, center[1] + c * reach];
            for cell in self.frame.trace(center, end) {
                if self.get(cell) == CellState::Unknown {
                    self.set(cell, CellState::Free);
                }
            }
        }

        for &(azimuth, dist) in rays {
            if dist >= max_range {
                continue;
            }
            let (s, c) = azimuth.sin_cos();
            if let Some(cell) = self.frame.world_to_cell(center[0] + s * dist, center[1] + c * dist) {
                self.set(cell, CellState::Blocked);
            }
        }
    }
}

/// Connected walkable component
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct Region {
    pub cells: usize,
    /// First cell of the region in scan order
    pub seed: Cell,
}

/// Walkable cells for an agent of one cell radius
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct NavigationMap {
    pub frame: GridFrame,
    pub walkable: Vec<bool>,
    pub spawn: Cell,
    /// Largest first
    pub regions: Vec<Region>,
}

impl NavigationMap {
    /// Free cells with no blocked neighbour are walkable. `spawn` is moved to
    /// the nearest walkable cell when it lands on an unwalkable one.
    pub fn from_occupancy(grid: &OccupancyGrid, spawn: Cell) -> Self {
        let frame = grid.frame;
        let walkable: Vec<bool> = (0..frame.len())
            .map(|i| {
                let cell = frame.cell_at(i);
                grid.cells[i] == CellState::Free
                    && frame.neighbours(cell).all(|n| grid.get(n) != CellState::Blocked)
            })
            .collect();

        let mut map = Self { frame, walkable, spawn, regions: Vec::new() };
        if let Some(s) = map.nearest_walkable(spawn) {
            map.spawn = s;
        }
        map.regions = map.flood_regions();
        map
    }

    #[inline]
    pub fn is_walkable(&self, cell: Cell) -> bool {
        cell[0] < self.frame.width && cell[1] < self.frame.height && self.walkable[self.frame.index(cell)]
    }

    pub fn walkable_count(&self) -> usize {
        self.walkable.iter().filter(|&&w| w).count()
    }

    /// Walkable check at world (x, z)
    pub fn is_walkable_at(&self, x: f32, z: f32) -> bool {
        self.frame.world_to_cell(x, z).is_some_and(|c| self.is_walkable(c))
    }

    /// Breadth-first search for the closest walkable cell
    pub fn nearest_walkable(&self, from: Cell) -> Option<Cell> {
        if from[0] >= self.frame.width || from[1] >= self.frame.height {
            return None;
        }
        let mut seen = vec![false; self.frame.len()];
        let mut queue = VecDeque::from([from]);
        seen[self.frame.index(from)] = true;

        while let Some(cell) = queue.pop_front() {
            if self.is_walkable(cell) {
                return Some(cell);
            }
            for n in self.frame.neighbours(cell) {
                let i = self.frame.index(n);
                if !seen[i] {
                    seen[i] = true;
                    queue.push_back(n);
                }
            }
        }
        None
    }

    /// Cells reachable from `from` over walkable cells, as a mask
    pub fn reachable_from(&self, from: Cell) -> Vec<bool> {
        let mut mask = vec![false; self.frame.len()];
        if !self.is_walkable(from) {
            return mask;
        }
        let mut queue = VecDeque::from([from]);
        mask[self.frame.index(from)] = true;
        while let Some(cell) = queue.pop_front() {
            for n in self.frame.neighbours(cell) {
                let i = self.frame.index(n);
                if !mask[i] && self.walkable[i] && self.diagonal_clear(cell, n, |c| self.is_walkable(c)) {
                    mask[i] = true;
                    queue.push_back(n);
                }
            }
        }
        mask
    }

    fn flood_regions(&self) -> Vec<Region> {
        let mut labelled = vec![false; self.frame.len()];
        let mut regions = Vec::new();

        for i in 0..self.frame.len() {
            if !self.walkable[i] || labelled[i] {
                continue;
            }
            let seed = self.frame.cell_at(i);
            let mask = self.reachable_from(seed);
            let mut cells = 0;
            for (j, &m) in mask.iter().enumerate() {
                if m {
                    labelled[j] = true;
                    cells += 1;
                }
            }
            regions.push(Region { cells, seed });
        }

        regions.sort_by(|a, b| b.cells.cmp(&a.cells));
        regions
    }

    /// Shortest path over walkable cells
    pub fn find_path(&self, start: Cell, goal: Cell) -> Option<Vec<Cell>> {
        self.find_path_with(start, goal, |c| self.is_walkable(c))
    }

    /// A* over 8-connected cells accepted by `passable`. Diagonal moves may
    /// not cut a corner. Returns the path including both ends.
    pub fn find_path_with(&self, start: Cell, goal: Cell, passable: impl Fn(Cell) -> bool) -> Option<Vec<Cell>> {
        let frame = &self.frame;
        if !passable(start) || !passable(goal) {
            return None;
        }
        if start == goal {
            return Some(vec![start]);
        }

        let mut g = vec![f32::INFINITY; frame.len()];
        let mut came_from = vec![usize::MAX; frame.len()];
        let mut closed = vec![false; frame.len()];
        let mut open = BinaryHeap::new();

        let si = frame.index(start);
        g[si] = 0.0;
        open.push(OpenNode { f: octile(start, goal), index: si });

        while let Some(OpenNode { index, .. }) = open.pop() {
            if closed[index] {
                continue;
            }
            closed[index] = true;
            let cell = frame.cell_at(index);

            if cell == goal {
                let mut path = vec![cell];
                let mut i = index;
                while came_from[i] != usize::MAX {
                    i = came_from[i];
                    path.push(frame.cell_at(i));
                }
                path.reverse();
                return Some(path);
            }

            for n in frame.neighbours(cell) {
                let ni = frame.index(n);
                if closed[ni] || !passable(n) || !self.diagonal_clear(cell, n, &passable) {
                    continue;
                }
                let step = if n[0] != cell[0] && n[1] != cell[1] { std::f32::consts::SQRT_2 } else { 1.0 };
                let cost = g[index] + step;
                if cost < g[ni] {
                    g[ni] = cost;
                    came_from[ni] = index;
                    open.push(OpenNode { f: cost + octile(n, goal), index: ni });
                }
            }
        }

        None
    }

    fn diagonal_clear(&self, a: Cell, b: Cell, passable: impl Fn(Cell) -> bool) -> bool {
        if a[0] == b[0] || a[1] == b[1] {
            return true;
        }
        passable([b[0], a[1]]) && passable([a[0], b[1]])
    }

    /// Path length in metres
    pub fn path_length(&self, path: &[Cell]) -> f32 {
        path.windows(2)
            .map(|w| {
                let a = self.frame.cell_center(w[0]);
                let b = self.frame.cell_center(w[1]);
                ((a[0] - b[0]).powi(2) + (a[1] - b[1]).powi(2)).sqrt()
            })
            .sum()
    }
}

fn octile(a: Cell, b: Cell) -> f32 {
    let dx = a[0].abs_diff(b[0]) as f32;
    let dy = a[1].abs_diff(b[1]) as f32;
    dx.max(dy) + (std::f32::consts::SQRT_2 - 1.0) * dx.min(dy)
}

#[derive(PartialEq)]
struct OpenNode {
    f: f32,
    index: usize,
}

impl Eq for OpenNode {}

impl Ord for OpenNode {
    // Min-heap on f, ties on index
    fn cmp(&self, other: &Self) -> Ordering {
        other.f.total_cmp(&self.f).then_with(|| other.index.cmp(&self.index))
    }
}

impl PartialOrd for OpenNode {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    /// 10x10 room with a wall at x = 5 except a gap at y = 8
    fn walled_room() -> OccupancyGrid {
        let frame = GridFrame { cell_size: 1.0, origin: [0.0, 0.0], width: 10, height: 10 };
        let mut grid = OccupancyGrid::new(frame);
        for i in 0..frame.len() {
            let [x, y] = frame.cell_at(i);
            let border = x == 0 || y == 0 || x == 9 || y == 9;
            let wall = x == 5 && y != 8;
            grid.cells[i] = if border || wall { CellState::Blocked } else { CellState::Free };
        }
        grid
    }

    #[test]
    fn cell_states_serialize_as_numbers() {
        let json = serde_json::to_string(&vec![CellState::Free, CellState::Blocked, CellState::Unknown]).unwrap();
        assert_eq!(json, "[0,1,2]");
        assert!(serde_json::from_str::<CellState>("7").is_err());
    }

    #[test]
    fn world_to_cell_round_trips_centres() {
        let frame = GridFrame::centred([0.0, 0.0], 2.0, 0.5);
        assert_eq!((frame.width, frame.height), (8, 8));
        let c = frame.cell_center([3, 5]);
        assert_eq!(frame.world_to_cell(c[0], c[1]), Some([3, 5]));
        assert_eq!(frame.world_to_cell(10.0, 0.0), None);
    }

    #[test]
    fn walkable_cells_keep_clear_of_walls() {
        let nav = NavigationMap::from_occupancy(&walled_room(), [2, 2]);
        assert!(nav.is_walkable([2, 2]));
        assert!(!nav.is_walkable([1, 1]));
        assert!(!nav.is_walkable([4, 3]));
        assert!(!nav.is_walkable([6, 3]));
    }

    #[test]
    fn unwalkable_spawn_moves_to_nearest_walkable() {
        let nav = NavigationMap::from_occupancy(&walled_room(), [1, 1]);
        assert_eq!(nav.spawn, [2, 2]);
    }

    #[test]
    fn path_goes_through_the_gap() {
        let mut grid = walled_room();
        // Widen the gap so the inflated map stays connected
        grid.set([5, 7], CellState::Free);
        grid.set([5, 6], CellState::Free);
        let nav = NavigationMap::from_occupancy(&grid, [2, 2]);

        let path = nav.find_path([2, 2], [7, 2]).expect("path exists");
        assert_eq!(path.first(), Some(&[2, 2]));
        assert_eq!(path.last(), Some(&[7, 2]));
        assert!(path.iter().all(|&c| nav.is_walkable(c)));
        assert!(path.iter().any(|c| c[0] == 5 && c[1] == 7));
        assert!(nav.path_length(&path) > 5.0);
    }

    #[test]
    fn sealed_wall_has_no_path_and_two_regions() {
        let nav = NavigationMap::from_occupancy(&walled_room(), [2, 2]);
        assert_eq!(nav.find_path([2, 2], [7, 2]), None);
        assert_eq!(nav.regions.len(), 2);
        assert!(nav.regions[0].cells >= nav.regions[1].cells);
    }

    #[test]
    fn carve_marks_free_then_blocked() {
        let frame = GridFrame::centred([0.0, 0.0], 4.0, 0.5);
        let mut grid = OccupancyGrid::new(frame);
        grid.carve([0.0, 0.0], &[(0.0, 2.0), (std::f32::consts::PI, 4.0)], 4.0);

        assert_eq!(grid.get(frame.world_to_cell(0.1, 1.0).unwrap()), CellState::Free);
        assert_eq!(grid.get(frame.world_to_cell(0.0, 2.0).unwrap()), CellState::Blocked);
        assert_eq!(grid.get(frame.world_to_cell(-0.1, -3.0).unwrap()), CellState::Free);
        assert_eq!(grid.count(CellState::Blocked), 1);
    }
}
