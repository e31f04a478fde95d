//! Proximity grid for neighbour queries in crowd simulation
//!
//! Agents are registered by the bounds of their footprint on the XZ plane.
//! The grid is rebuilt every update, so it only supports adding items and
//! clearing; there is no per-item removal.

use std::collections::HashMap;

/// 2D spatial hash of item ids
#[derive(Debug, Clone)]
pub struct ProximityGrid {
    cell_size: f32,
    inv_cell_size: f32,
    cells: HashMap<(i32, i32), Vec<usize>>,
    bounds: Option<[i32; 4]>,
}

impl ProximityGrid {
    /// Creates a grid; `cell_size` is clamped to a small positive value
    pub fn new(cell_size: f32) -> Self {
        let cell_size = if cell_size.is_finite() { cell_size.max(0.01) } else { 1.0 };
        Self {
            cell_size,
            inv_cell_size: 1.0 / cell_size,
            cells: HashMap::new(),
            bounds: None,
        }
    }

    pub fn cell_size(&self) -> f32 {
        self.cell_size
    }

    pub fn clear(&mut self) {
        self.cells.clear();
        self.bounds = None;
    }

    #[inline]
    fn cell_range(&self, minx: f32, miny: f32, maxx: f32, maxy: f32) -> (i32, i32, i32, i32) {
        (
            (minx * self.inv_cell_size).floor() as i32,
            (miny * self.inv_cell_size).floor() as i32,
            (maxx * self.inv_cell_size).floor() as i32,
            (maxy * self.inv_cell_size).floor() as i32,
        )
    }

    /// Registers `id` in every cell its bounds touch
    pub fn add_item(&mut self, id: usize, minx: f32, miny: f32, maxx: f32, maxy: f32) {
        let (iminx, iminy, imaxx, imaxy) = self.cell_range(minx, miny, maxx, maxy);

        for y in iminy..=imaxy {
            for x in iminx..=imaxx {
                self.cells.entry((x, y)).or_default().push(id);
            }
        }

        self.bounds = Some(match self.bounds {
            Some([bx0, by0, bx1, by1]) => [bx0.min(iminx), by0.min(iminy), bx1.max(imaxx), by1.max(imaxy)],
            None => [iminx, iminy, imaxx, imaxy],
        });
    }

    /// Returns up to `max_ids` distinct ids registered in cells overlapping the bounds
    pub fn query_items(&self, minx: f32, miny: f32, maxx: f32, maxy: f32, max_ids: usize) -> Vec<usize> {
        let mut ids = Vec::new();
        let Some([bx0, by0, bx1, by1]) = self.bounds else {
            return ids;
        };

        let (iminx, iminy, imaxx, imaxy) = self.cell_range(minx, miny, maxx, maxy);
        for y in iminy.max(by0)..=imaxy.min(by1) {
            for x in iminx.max(bx0)..=imaxx.min(bx1) {
                let Some(items) = self.cells.get(&(x, y)) else {
                    continue;
                };
                for &id in items {
                    if ids.contains(&id) {
                        continue;
                    }
                    if ids.len() >= max_ids {
                        return ids;
                    }
                    ids.push(id);
                }
            }
        }
        ids
    }

    /// Number of items registered in the cell containing (x, y)
    pub fn item_count_at(&self, x: f32, y: f32) -> usize {
        let key = (
            (x * self.inv_cell_size).floor() as i32,
            (y * self.inv_cell_size).floor() as i32,
        );
        self.cells.get(&key).map_or(0, Vec::len)
    }

    /// Cell bounds of everything registered since the last clear
    pub fn bounds(&self) -> Option<[i32; 4]> {
        self.bounds
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_query_finds_overlapping_items() {
        let mut grid = ProximityGrid::new(1.0);
        grid.add_item(0, -0.3, -0.3, 0.3, 0.3);
        grid.add_item(1, 5.0, 5.0, 5.5, 5.5);

        let mut near = grid.query_items(-1.0, -1.0, 1.0, 1.0, 32);
        near.sort_unstable();
        assert_eq!(near, vec![0]);

        let mut all = grid.query_items(-10.0, -10.0, 10.0, 10.0, 32);
        all.sort_unstable();
        assert_eq!(all, vec![0, 1]);
    }

    #[test]
    fn test_items_spanning_cells_are_reported_once() {
        let mut grid = ProximityGrid::new(1.0);
        grid.add_item(7, -0.5, -0.5, 0.5, 0.5);
        assert_eq!(grid.item_count_at(-0.2, -0.2), 1);
        assert_eq!(grid.item_count_at(0.2, 0.2), 1);
        assert_eq!(grid.query_items(-2.0, -2.0, 2.0, 2.0, 32), vec![7]);
        assert_eq!(grid.bounds(), Some([-1, -1, 0, 0]));
    }

    #[test]
    fn test_query_limit_and_clear() {
        let mut grid = ProximityGrid::new(2.0);
        for id in 0..10 {
            grid.add_item(id, 0.1, 0.1, 0.2, 0.2);
        }
        assert_eq!(grid.query_items(0.0, 0.0, 1.0, 1.0, 4).len(), 4);

        grid.clear();
        assert!(grid.query_items(0.0, 0.0, 1.0, 1.0, 4).is_empty());
        assert_eq!(grid.item_count_at(0.1, 0.1), 0);
    }
}
