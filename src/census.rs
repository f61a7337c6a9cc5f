// Per image cell census: count labeled cells whose centroid falls outside
// the exclusion mask, and measure the non-excluded area.

use ndarray::{Array2, ArrayView2};
use std::collections::BTreeMap;

use crate::errors::PairError;

pub type LabelGrid = Array2<i64>;
pub type Label = i64;

#[derive(Copy, Clone, Debug, PartialEq)]
pub struct CensusStats {
    pub valid_cells: u64,
    pub area_um2: f64,
    pub density: f64,
}

#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub struct Centroid {
    pub label: Label,
    pub row: usize,
    pub col: usize,
}

pub fn density(cells: u64, area_um2: f64) -> f64 {
    if area_um2 > 0.0 {
        cells as f64 / area_um2
    } else {
        0.0
    }
}

/// Centroid of every positive label, truncated to an integer pixel.
///
/// Truncation (not rounding) is deliberate: it decides which cells on the
/// edge of an excluded region count, and changing it shifts counts. The
/// point need not lie inside the label's own pixels for concave or
/// disconnected shapes.
pub fn label_centroids(cell_mask: ArrayView2<Label>) -> Vec<Centroid> {
    // label -> (sum of rows, sum of cols, pixel count)
    let mut sums: BTreeMap<Label, (u64, u64, u64)> = BTreeMap::new();
    for ((i, j), &label) in cell_mask.indexed_iter() {
        if label > 0 {
            let entry = sums.entry(label).or_insert((0, 0, 0));
            entry.0 += i as u64;
            entry.1 += j as u64;
            entry.2 += 1;
        }
    }

    // integer division of non-negative sums is the truncated mean
    sums.into_iter()
        .map(|(label, (sum_i, sum_j, n))| Centroid {
            label,
            row: (sum_i / n) as usize,
            col: (sum_j / n) as usize,
        })
        .collect()
}

pub fn count_valid_cells(cell_mask: ArrayView2<Label>, exclusion_mask: ArrayView2<Label>) -> u64 {
    label_centroids(cell_mask)
        .iter()
        .filter(|c| {
            let excluded = exclusion_mask[[c.row, c.col]] != 0;
            if excluded {
                log::trace!("Cell {} excluded at ({}, {})", c.label, c.row, c.col);
            }
            !excluded
        })
        .count() as u64
}

pub fn non_excluded_area(exclusion_mask: ArrayView2<Label>, pixel_size: f64) -> f64 {
    let npixels = exclusion_mask.iter().filter(|&&v| v == 0).count();
    npixels as f64 * pixel_size * pixel_size
}

pub fn compute(
    cell_mask: &LabelGrid,
    exclusion_mask: &LabelGrid,
    pixel_size: f64,
) -> Result<CensusStats, PairError> {
    if cell_mask.dim() != exclusion_mask.dim() {
        return Err(PairError::DimensionMismatch {
            cell: cell_mask.dim(),
            exclusion: exclusion_mask.dim(),
        });
    }

    let valid_cells = count_valid_cells(cell_mask.view(), exclusion_mask.view());
    let area_um2 = non_excluded_area(exclusion_mask.view(), pixel_size);

    Ok(CensusStats {
        valid_cells,
        area_um2,
        density: density(valid_cells, area_um2),
    })
}
