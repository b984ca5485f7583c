//! Proximity grid for neighbour queries in crowd simulation
//!
//! Agents are inserted with their XZ bounding box into every cell the box
//! overlaps. The grid is rebuilt from scratch every tick, so it never tracks
//! movement of individual items.

use std::collections::HashMap;

use crowd_common::Vec3;

/// Grid cell coordinates
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
struct GridCoord {
    x: i32,
    z: i32,
}

impl GridCoord {
    fn from_world(x: f32, z: f32, inv_cell_size: f32) -> Self {
        Self {
            x: (x * inv_cell_size).floor() as i32,
            z: (z * inv_cell_size).floor() as i32,
        }
    }
}

/// Proximity grid for efficient spatial queries
#[derive(Debug)]
pub struct ProximityGrid {
    cells: HashMap<GridCoord, Vec<usize>>,
    cell_size: f32,
    inv_cell_size: f32,
    item_count: usize,
}

impl ProximityGrid {
    /// Creates a new proximity grid
    pub fn new(cell_size: f32) -> Self {
        // Minimum cell size to avoid division by zero
        let cell_size = cell_size.max(0.1);
        Self {
            cells: HashMap::new(),
            cell_size,
            inv_cell_size: 1.0 / cell_size,
            item_count: 0,
        }
    }

    /// Clears all items but keeps cell allocations
    pub fn clear(&mut self) {
        for items in self.cells.values_mut() {
            items.clear();
        }
        self.item_count = 0;
    }

    /// Adds an item covering the XZ box `[min, max]`
    pub fn add_item(&mut self, id: usize, min: Vec3, max: Vec3) {
        let lo = GridCoord::from_world(min.x, min.z, self.inv_cell_size);
        let hi = GridCoord::from_world(max.x, max.z, self.inv_cell_size);
        for z in lo.z..=hi.z {
            for x in lo.x..=hi.x {
                self.cells.entry(GridCoord { x, z }).or_default().push(id);
            }
        }
        self.item_count += 1;
    }

    /// Returns the unique items stored in cells overlapping `[min, max]`,
    /// at most `max_items` of them.
    pub fn query_items(&self, min: Vec3, max: Vec3, max_items: usize) -> Vec<usize> {
        let lo = GridCoord::from_world(min.x, min.z, self.inv_cell_size);
        let hi = GridCoord::from_world(max.x, max.z, self.inv_cell_size);
        let mut result = Vec::new();
        for z in lo.z..=hi.z {
            for x in lo.x..=hi.x {
                let Some(items) = self.cells.get(&GridCoord { x, z }) else {
                    continue;
                };
                for &id in items {
                    if result.contains(&id) {
                        continue;
                    }
                    if result.len() >= max_items {
                        return result;
                    }
                    result.push(id);
                }
            }
        }
        result
    }

    /// Number of items stored in the cell containing `pos`
    pub fn item_count_at(&self, pos: Vec3) -> usize {
        self.cells
            .get(&GridCoord::from_world(pos.x, pos.z, self.inv_cell_size))
            .map_or(0, Vec::len)
    }

    pub fn item_count(&self) -> usize {
        self.item_count
    }

    pub fn cell_size(&self) -> f32 {
        self.cell_size
    }
}
