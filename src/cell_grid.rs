use crate::config::CellSettings;
use crate::matrix_operations::Camera;
use cgmath::{Point3, Vector2};

pub const GRID_SIDE: i32 = 3;
pub const CELL_COUNT: usize = 9;

/// Added before the floor-mod so that cell coordinate (0, 0) lands in the
/// middle slot (index 4).
pub const INDEX_OFFSET: i32 = 1;

/// Maps an unbounded cell coordinate onto its slot in the 3×3 ring.
///
/// Uses `rem_euclid`, never `%`: negative coordinates must wrap the same way
/// positive ones do.
pub fn cell_index(coord: Vector2<i32>) -> usize {
    let col = (coord.x + INDEX_OFFSET).rem_euclid(GRID_SIDE);
    let row = GRID_SIDE - 1 - (coord.y + INDEX_OFFSET).rem_euclid(GRID_SIDE);
    (GRID_SIDE * row + col) as usize
}

pub fn slot_column(index: usize) -> usize {
    index % GRID_SIDE as usize
}

pub fn slot_row(index: usize) -> usize {
    index / GRID_SIDE as usize
}

/// One reusable deformation slot.
#[derive(Clone, Debug)]
pub struct Cell {
    pub index: usize,
    /// Grid coordinate this slot currently represents.
    pub coord: Vector2<i32>,
    /// Planar world centre (x, z).
    pub center: Vector2<f32>,
    pub camera: Camera,
    pub update_enabled: bool,
}

/// Parameters a shader needs to locate the slot covering a world position.
#[derive(Clone, Copy, Debug, PartialEq)]
pub struct ToroidalMap {
    pub active_coord: Vector2<i32>,
    pub active_index: usize,
    pub cell_size: f32,
}

impl ToroidalMap {
    pub fn coord_for_world(&self, p: Vector2<f32>) -> Vector2<i32> {
        Vector2::new(
            (p.x / self.cell_size + 0.5).floor() as i32,
            (p.y / self.cell_size + 0.5).floor() as i32,
        )
    }

    /// Slot and in-cell uv for `p`, or `None` outside the 3×3 window.
    pub fn locate(&self, p: Vector2<f32>) -> Option<(usize, Vector2<f32>)> {
        let coord = self.coord_for_world(p);
        let delta = coord - self.active_coord;
        if delta.x.abs() > 1 || delta.y.abs() > 1 {
            return None;
        }
        let corner = Vector2::new(
            (coord.x as f32 - 0.5) * self.cell_size,
            (coord.y as f32 - 0.5) * self.cell_size,
        );
        let uv = (p - corner) / self.cell_size;
        Some((cell_index(coord), uv))
    }
}

/// Result of a cell boundary crossing.
#[derive(Clone, Debug, PartialEq)]
pub struct CellStep {
    pub step: Vector2<i32>,
    pub previous_active: usize,
    pub active: usize,
    /// Slots moved onto a new leading-edge cell; their contents are stale.
    pub recentered: Vec<usize>,
}

pub struct DeformationCellGrid {
    cells: Vec<Cell>,
    cell_coord: Vector2<i32>,
    active: usize,
    settings: CellSettings,
    capture_altitude: f32,
}

impl DeformationCellGrid {
    pub fn new(settings: &CellSettings, viewer: Vector2<f32>, viewer_altitude: f32) -> Self {
        let size = settings.cell_size;
        let cell_coord = Vector2::new(
            (viewer.x / size + 0.5).floor() as i32,
            (viewer.y / size + 0.5).floor() as i32,
        );
        let capture_altitude = viewer_altitude + settings.capture_lift;
        let mut cells: Vec<Option<Cell>> = vec![None; CELL_COUNT];
        for dy in -1..=1 {
            for dx in -1..=1 {
                let coord = cell_coord + Vector2::new(dx, dy);
                let index = cell_index(coord);
                let center = Vector2::new(coord.x as f32 * size, coord.y as f32 * size);
                cells[index] = Some(Cell {
                    index,
                    coord,
                    center,
                    camera: capture_camera(settings, center, capture_altitude),
                    update_enabled: false,
                });
            }
        }
        let mut cells: Vec<Cell> = cells.into_iter().flatten().collect();
        let active = cell_index(cell_coord);
        cells[active].update_enabled = true;
        Self {
            cells,
            cell_coord,
            active,
            settings: settings.clone(),
            capture_altitude,
        }
    }

    pub fn cells(&self) -> &[Cell] {
        &self.cells
    }

    pub fn cell_coord(&self) -> Vector2<i32> {
        self.cell_coord
    }

    pub fn active_index(&self) -> usize {
        self.active
    }

    pub fn active_cell(&self) -> &Cell {
        &self.cells[self.active]
    }

    pub fn cell_size(&self) -> f32 {
        self.settings.cell_size
    }

    pub fn capture_altitude(&self) -> f32 {
        self.capture_altitude
    }

    pub fn toroidal_map(&self) -> ToroidalMap {
        ToroidalMap {
            active_coord: self.cell_coord,
            active_index: self.active,
            cell_size: self.settings.cell_size,
        }
    }

    /// Lifts every capture camera to `viewer_altitude` plus the configured
    /// lift.
    pub fn set_capture_altitude(&mut self, viewer_altitude: f32) {
        let altitude = viewer_altitude + self.settings.capture_lift;
        if altitude == self.capture_altitude {
            return;
        }
        self.capture_altitude = altitude;
        for cell in &mut self.cells {
            cell.camera = capture_camera(&self.settings, cell.center, altitude);
        }
    }

    fn axis_step(&self, offset: f32) -> i32 {
        let half = self.settings.cell_size / 2.0;
        if offset > half {
            1
        } else if offset < -half {
            -1
        } else {
            0
        }
    }

    /// Steps the active cell by at most one on each axis when the viewer
    /// leaves the active cell, recentring the trailing column and/or row onto
    /// the new leading edge.
    pub fn update(&mut self, viewer: Vector2<f32>) -> Option<CellStep> {
        let center = self.cells[self.active].center;
        let offset = viewer - center;
        let step = Vector2::new(self.axis_step(offset.x), self.axis_step(offset.y));
        if step == Vector2::new(0, 0) {
            return None;
        }

        let previous_active = self.active;
        let previous_coord = self.cell_coord;
        self.cells[previous_active].update_enabled = false;
        self.cell_coord += step;
        self.active = cell_index(self.cell_coord);
        self.cells[self.active].update_enabled = true;

        let mut recentered = Vec::new();
        let span = GRID_SIDE;
        if step.x != 0 {
            let trailing = cell_index(Vector2::new(previous_coord.x - step.x, previous_coord.y));
            let column = slot_column(trailing);
            for row in 0..span as usize {
                let index = row * span as usize + column;
                self.translate(index, Vector2::new(span * step.x, 0));
                recentered.push(index);
            }
        }
        if step.y != 0 {
            let trailing = cell_index(Vector2::new(previous_coord.x, previous_coord.y - step.y));
            let row = slot_row(trailing);
            for column in 0..span as usize {
                let index = row * span as usize + column;
                self.translate(index, Vector2::new(0, span * step.y));
                if !recentered.contains(&index) {
                    recentered.push(index);
                }
            }
        }

        log::debug!(
            "cell step {:?}: active slot {} -> {}, recentred {:?}",
            step,
            previous_active,
            self.active,
            recentered
        );
        Some(CellStep {
            step,
            previous_active,
            active: self.active,
            recentered,
        })
    }

    fn translate(&mut self, index: usize, by: Vector2<i32>) {
        let size = self.settings.cell_size;
        let cell = &mut self.cells[index];
        cell.coord += by;
        cell.center = Vector2::new(cell.coord.x as f32 * size, cell.coord.y as f32 * size);
        cell.camera = capture_camera(&self.settings, cell.center, self.capture_altitude);
    }
}

fn capture_camera(settings: &CellSettings, center: Vector2<f32>, altitude: f32) -> Camera {
    Camera::top_down(
        Point3::new(center.x, altitude, center.y),
        settings.cell_size / 2.0,
        settings.capture_near,
        settings.capture_far,
    )
}

#[cfg(test)]
mod tests {
    use super::*;
    use rand::{Rng, SeedableRng};
    use rand_chacha::ChaCha8Rng;
    use std::collections::HashMap;

    fn settings() -> CellSettings {
        CellSettings {
            cell_size: 64.0,
            ..Default::default()
        }
    }

    fn slow_mod3(mut v: i32) -> i32 {
        while v < 0 {
            v += 3;
        }
        while v >= 3 {
            v -= 3;
        }
        v
    }

    #[test]
    fn origin_maps_to_centre_slot() {
        assert_eq!(cell_index(Vector2::new(0, 0)), 4);
        let grid = DeformationCellGrid::new(&settings(), Vector2::new(0.0, 0.0), 0.0);
        assert_eq!(grid.active_index(), 4);
        for (i, cell) in grid.cells().iter().enumerate() {
            assert_eq!(cell.index, i);
            assert_eq!(cell_index(cell.coord), i);
        }
    }

    #[test]
    fn index_is_bijective_over_residues() {
        let mut seen = [false; CELL_COUNT];
        for x in 0..3 {
            for y in 0..3 {
                let index = cell_index(Vector2::new(x, y));
                assert!(!seen[index]);
                seen[index] = true;
                for (kx, ky) in [(-3, 0), (0, -3), (300, -3000), (-999, 6)] {
                    assert_eq!(cell_index(Vector2::new(x + kx, y + ky)), index);
                }
            }
        }
        assert!(seen.iter().all(|s| *s));
    }

    #[test]
    fn crossing_east_edge_recentres_trailing_column() {
        let mut grid = DeformationCellGrid::new(&settings(), Vector2::new(0.0, 0.0), 0.0);
        assert_eq!(grid.update(Vector2::new(32.0, 0.0)), None);
        let step = grid.update(Vector2::new(33.0, 0.0)).unwrap();
        assert_eq!(step.step, Vector2::new(1, 0));
        assert_eq!(grid.cell_coord(), Vector2::new(1, 0));
        assert_eq!(step.previous_active, 4);
        assert_eq!(step.active, 5);

        // Column 0 held x = -1, on the far side from the crossed edge; it now
        // holds the new leading column x = 2.
        assert_eq!(step.recentered, vec![0, 3, 6]);
        for index in [0, 3, 6] {
            let cell = &grid.cells()[index];
            assert_eq!(cell.coord.x, 2);
            assert_eq!(cell.center.x, 128.0);
            assert_eq!(cell.camera.position.x, 128.0);
        }
        for index in [1, 2, 4, 5, 7, 8] {
            assert!(grid.cells()[index].coord.x <= 1);
        }
    }

    #[test]
    fn exactly_one_slot_updates() {
        let mut grid = DeformationCellGrid::new(&settings(), Vector2::new(0.0, 0.0), 0.0);
        let path = [(40.0, 0.0), (40.0, -40.0), (-30.0, -40.0), (-100.0, 100.0)];
        for (x, y) in path {
            while grid.update(Vector2::new(x, y)).is_some() {}
            let enabled: Vec<usize> = grid
                .cells()
                .iter()
                .filter(|c| c.update_enabled)
                .map(|c| c.index)
                .collect();
            assert_eq!(enabled, vec![grid.active_index()]);
        }
    }

    #[test]
    fn diagonal_step_recentres_row_and_column_once() {
        let mut grid = DeformationCellGrid::new(&settings(), Vector2::new(0.0, 0.0), 0.0);
        let step = grid.update(Vector2::new(-40.0, 40.0)).unwrap();
        assert_eq!(step.step, Vector2::new(-1, 1));
        assert_eq!(step.recentered.len(), 5);
        assert_eq!(grid.active_index(), cell_index(Vector2::new(-1, 1)));
    }

    #[test]
    fn random_walk_matches_brute_force_map() {
        let mut rng = ChaCha8Rng::seed_from_u64(7);
        let size = 64.0;
        let mut grid = DeformationCellGrid::new(&settings(), Vector2::new(0.0, 0.0), 0.0);
        let mut coord = Vector2::new(0, 0);
        for _ in 0..10_000 {
            let axis = rng.random_range(0..2);
            let sign = if rng.random_bool(0.5) { 1 } else { -1 };
            if axis == 0 {
                coord.x += sign;
            } else {
                coord.y += sign;
            }
            let viewer = Vector2::new(coord.x as f32 * size, coord.y as f32 * size);
            let step = grid.update(viewer).unwrap();
            assert_eq!(step.step.x.abs() + step.step.y.abs(), 1);
            assert_eq!(grid.cell_coord(), coord);

            let brute = |c: Vector2<i32>| -> usize {
                let col = slow_mod3(c.x + 1);
                let row = 2 - slow_mod3(c.y + 1);
                (3 * row + col) as usize
            };
            assert_eq!(grid.active_index(), brute(coord));

            let mut covered: HashMap<(i32, i32), usize> = HashMap::new();
            for cell in grid.cells() {
                covered.insert((cell.coord.x, cell.coord.y), cell.index);
                assert_eq!(cell.index, brute(cell.coord));
            }
            for dy in -1..=1 {
                for dx in -1..=1 {
                    let neighbour = (coord.x + dx, coord.y + dy);
                    assert_eq!(
                        covered.get(&neighbour),
                        Some(&brute(Vector2::new(neighbour.0, neighbour.1)))
                    );
                }
            }
        }
    }

    #[test]
    fn locate_returns_slot_and_uv() {
        let grid = DeformationCellGrid::new(&settings(), Vector2::new(0.0, 0.0), 0.0);
        let map = grid.toroidal_map();
        let (slot, uv) = map.locate(Vector2::new(-64.0, 16.0)).unwrap();
        assert_eq!(slot, cell_index(Vector2::new(-1, 0)));
        assert!((uv.x - 0.5).abs() < 1e-6 && (uv.y - 0.75).abs() < 1e-6);
        assert_eq!(map.locate(Vector2::new(200.0, 0.0)), None);
    }
}
