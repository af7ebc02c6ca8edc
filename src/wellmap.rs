//! Typed well-plate grid.
//!
//! The map is keyed `(row, col)` with 1-based indices; row 0 and column 0
//! are unused sentinels so the stored grid is `(rows+1) × (cols+1)`. The
//! convention is fixed: the column index drives X, the row index drives Y.
//! Cells hold nominal positions from the plate geometry until a successful
//! alignment snaps them to the measured stage position, so later visits
//! start closer to the target.

use crate::config::PlateGeometry;
use serde::{Deserialize, Serialize};

/// Physical stage position in millimetres from the home position.
#[derive(Debug, Clone, Copy, PartialEq, Default)]
pub struct PlatePosition {
    pub x_mm: f64,
    pub y_mm: f64,
}

impl PlatePosition {
    pub fn new(x_mm: f64, y_mm: f64) -> Self {
        Self { x_mm, y_mm }
    }

    /// Euclidean distance to another position.
    pub fn distance_to(&self, other: &PlatePosition) -> f64 {
        let dx = self.x_mm - other.x_mm;
        let dy = self.y_mm - other.y_mm;
        (dx * dx + dy * dy).sqrt()
    }
}

/// One well to visit during a batch run. Insertion order in the target
/// list is the visiting order.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WellTarget {
    pub row: usize,
    pub col: usize,
    pub label: String,
    #[serde(default)]
    pub description: String,
}

/// Grid of physical well positions.
#[derive(Debug, Clone)]
pub struct WellMap {
    rows: usize,
    cols: usize,
    cells: Vec<PlatePosition>,
}

impl WellMap {
    /// Populate the grid from plate geometry constants.
    pub fn from_geometry(geometry: &PlateGeometry) -> Self {
        let rows = geometry.rows;
        let cols = geometry.columns;
        let mut cells = vec![PlatePosition::default(); (rows + 1) * (cols + 1)];
        for row in 1..=rows {
            for col in 1..=cols {
                cells[row * (cols + 1) + col] = PlatePosition::new(
                    geometry.origin_x_mm + (col as f64 - 1.0) * geometry.col_pitch_mm,
                    geometry.origin_y_mm + (row as f64 - 1.0) * geometry.row_pitch_mm,
                );
            }
        }
        Self { rows, cols, cells }
    }

    pub fn rows(&self) -> usize {
        self.rows
    }

    pub fn cols(&self) -> usize {
        self.cols
    }

    fn index(&self, row: usize, col: usize) -> Option<usize> {
        if row == 0 || col == 0 || row > self.rows || col > self.cols {
            return None;
        }
        Some(row * (self.cols + 1) + col)
    }

    /// Stored position for a well; `None` for sentinel or out-of-range
    /// indices.
    pub fn position(&self, row: usize, col: usize) -> Option<PlatePosition> {
        self.index(row, col).map(|i| self.cells[i])
    }

    /// Snap a cell to the measured stage position after a successful
    /// alignment. Returns false for invalid indices.
    pub fn set_measured(&mut self, row: usize, col: usize, pos: PlatePosition) -> bool {
        match self.index(row, col) {
            Some(i) => {
                self.cells[i] = pos;
                true
            }
            None => false,
        }
    }
}
