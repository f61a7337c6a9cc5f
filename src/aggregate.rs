// Combine per image census results into report rows, either summed per
// group or listed per file.

use clap::ValueEnum;
use std::collections::HashMap;

use crate::census::{density, CensusStats};
use crate::errors::AggregateError;
use crate::pathkeys::PathKeys;

#[derive(Copy, Clone, Debug, PartialEq, Eq, ValueEnum)]
pub enum AggregationMode {
    Grouped,
    PerFile,
}

/// Result for one successfully processed file pair.
#[derive(Clone, Debug, PartialEq)]
pub struct CellRecord {
    pub group_key: String,
    pub identity: PathKeys,
    pub stats: CensusStats,
}

#[derive(Copy, Clone, Debug, Default, PartialEq)]
pub struct GroupTotals {
    pub total_cells: u64,
    pub total_area_um2: f64,
}

impl GroupTotals {
    fn add(&mut self, cells: u64, area_um2: f64) {
        self.total_cells += cells;
        self.total_area_um2 += area_um2;
    }

    pub fn density(&self) -> f64 {
        density(self.total_cells, self.total_area_um2)
    }
}

#[derive(Clone, Debug, PartialEq)]
pub struct ReportRow {
    pub identity: Vec<String>,
    pub cells: u64,
    pub area_um2: f64,
    pub density: f64,
}

pub enum Aggregator {
    Grouped {
        // keys in order of first appearance
        order: Vec<String>,
        groups: HashMap<String, GroupTotals>,
    },
    PerFile {
        records: Vec<CellRecord>,
    },
}

impl Aggregator {
    pub fn new(mode: AggregationMode) -> Aggregator {
        match mode {
            AggregationMode::Grouped => Aggregator::Grouped {
                order: Vec::new(),
                groups: HashMap::new(),
            },
            AggregationMode::PerFile => Aggregator::PerFile {
                records: Vec::new(),
            },
        }
    }

    pub fn mode(&self) -> AggregationMode {
        match self {
            Aggregator::Grouped { .. } => AggregationMode::Grouped,
            Aggregator::PerFile { .. } => AggregationMode::PerFile,
        }
    }

    pub fn len(&self) -> usize {
        match self {
            Aggregator::Grouped { order, .. } => order.len(),
            Aggregator::PerFile { records } => records.len(),
        }
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn add(&mut self, record: CellRecord) {
        match self {
            Aggregator::Grouped { order, groups } => {
                let totals = groups.entry(record.group_key.clone()).or_insert_with(|| {
                    order.push(record.group_key.clone());
                    GroupTotals::default()
                });
                totals.add(record.stats.valid_cells, record.stats.area_um2);
            }
            Aggregator::PerFile { records } => records.push(record),
        }
    }

    /// Fold another partial aggregate into this one. Groups new to `self`
    /// are appended after existing ones, in `other`'s order, so merging the
    /// partials of consecutive runs of pairs keeps first-seen order.
    pub fn merge(&mut self, other: Aggregator) -> Result<(), AggregateError> {
        match (self, other) {
            (
                Aggregator::Grouped { order, groups },
                Aggregator::Grouped {
                    order: other_order,
                    groups: mut other_groups,
                },
            ) => {
                for key in other_order {
                    let Some(part) = other_groups.remove(&key) else {
                        continue;
                    };
                    let totals = groups.entry(key.clone()).or_insert_with(|| {
                        order.push(key);
                        GroupTotals::default()
                    });
                    totals.add(part.total_cells, part.total_area_um2);
                }
                Ok(())
            }
            (
                Aggregator::PerFile { records },
                Aggregator::PerFile {
                    records: other_records,
                },
            ) => {
                records.extend(other_records);
                Ok(())
            }
            (this, other) => Err(AggregateError::ModeMismatch {
                this: this.mode(),
                other: other.mode(),
            }),
        }
    }

    /// Produce report rows. Group density is computed here, once, from the
    /// summed totals; it is not an average of per file densities.
    pub fn finish(self) -> Vec<ReportRow> {
        match self {
            Aggregator::Grouped { order, groups } => order
                .into_iter()
                .map(|key| {
                    let totals = groups.get(&key).copied().unwrap_or_default();
                    ReportRow {
                        identity: vec![key],
                        cells: totals.total_cells,
                        area_um2: totals.total_area_um2,
                        density: totals.density(),
                    }
                })
                .collect(),
            Aggregator::PerFile { records } => records
                .into_iter()
                .map(|record| ReportRow {
                    identity: record.identity.values(),
                    cells: record.stats.valid_cells,
                    area_um2: record.stats.area_um2,
                    density: record.stats.density,
                })
                .collect(),
        }
    }
}
