// Per file pair processing and the batch run over all discovered pairs.
//
// Each pair moves Discovered -> MaskLoaded -> StatsComputed -> Recorded, or
// stops as Skipped (no exclusion file under the skip policy) or Failed
// (unreadable mask, dimension mismatch). Pairs are attempted exactly once
// and a failure never stops the batch.

use clap::ValueEnum;
use indicatif::{ProgressBar, ProgressStyle};
use rayon::prelude::*;

use crate::aggregate::{AggregationMode, Aggregator, CellRecord};
use crate::census::{self, LabelGrid};
use crate::discover::MaskPair;
use crate::errors::{AggregateError, PairError};
use crate::masks::{load_mask, MaskRole};
use crate::pathkeys::{group_key, path_segments, PathKeyExtractor};

/// What to do with a cell mask that has no exclusion file at the mirrored path.
#[derive(Copy, Clone, Debug, PartialEq, Eq, ValueEnum)]
pub enum MissingExclusionPolicy {
    /// Skip the image with a warning.
    Skip,
    /// Treat as an all zero exclusion mask, i.e. nothing is excluded.
    Empty,
}

#[derive(Clone, Debug)]
pub struct RunConfig {
    pub pixel_size_um: f64,
    pub mode: AggregationMode,
    pub missing_exclusion: MissingExclusionPolicy,
    pub show_progress: bool,
}

impl Default for RunConfig {
    fn default() -> Self {
        RunConfig {
            pixel_size_um: 2.0,
            mode: AggregationMode::Grouped,
            missing_exclusion: MissingExclusionPolicy::Skip,
            show_progress: false,
        }
    }
}

#[derive(Debug)]
pub enum PairOutcome {
    Recorded(CellRecord),
    Skipped(PairError),
    Failed(PairError),
}

#[derive(Copy, Clone, Debug, Default, PartialEq, Eq)]
pub struct RunSummary {
    pub discovered: usize,
    pub recorded: usize,
    pub skipped: usize,
    pub failed: usize,
}

pub fn process_pair(
    pair: &MaskPair,
    config: &RunConfig,
    extractor: &PathKeyExtractor,
) -> PairOutcome {
    match census_pair(pair, config, extractor) {
        Ok(record) => PairOutcome::Recorded(record),
        Err(err @ PairError::MissingExclusionFile(_)) => PairOutcome::Skipped(err),
        Err(err) => PairOutcome::Failed(err),
    }
}

fn census_pair(
    pair: &MaskPair,
    config: &RunConfig,
    extractor: &PathKeyExtractor,
) -> Result<CellRecord, PairError> {
    let has_exclusion = pair.exclude_path.is_file();
    if !has_exclusion && config.missing_exclusion == MissingExclusionPolicy::Skip {
        return Err(PairError::MissingExclusionFile(pair.exclude_path.clone()));
    }

    let cell_mask = load_mask(&pair.cell_path, MaskRole::Labels).map_err(|source| PairError::MaskDecodeFailure {
        path: pair.cell_path.clone(),
        source,
    })?;

    let exclusion_mask = if has_exclusion {
        load_mask(&pair.exclude_path, MaskRole::Exclusion).map_err(|source| PairError::MaskDecodeFailure {
            path: pair.exclude_path.clone(),
            source,
        })?
    } else {
        LabelGrid::zeros(cell_mask.dim())
    };

    let stats = census::compute(&cell_mask, &exclusion_mask, config.pixel_size_um)?;

    let segments = path_segments(&pair.relative_path);
    Ok(CellRecord {
        group_key: group_key(&segments),
        identity: extractor.extract(&segments),
        stats,
    })
}

fn progress_bar(len: usize, show: bool) -> ProgressBar {
    if !show {
        return ProgressBar::hidden();
    }
    let pb = ProgressBar::new(len as u64);
    if let Ok(style) = ProgressStyle::with_template(
        "{msg} {wide_bar} {pos}/{len} [{elapsed_precise}]",
    ) {
        pb.set_style(style);
    }
    pb.set_message("Counting cells");
    pb
}

// Aggregate and counts for a contiguous run of pairs.
struct Partial {
    aggregator: Aggregator,
    summary: RunSummary,
}

impl Partial {
    fn new(mode: AggregationMode) -> Partial {
        Partial {
            aggregator: Aggregator::new(mode),
            summary: RunSummary::default(),
        }
    }

    fn record(mut self, pair: &MaskPair, outcome: PairOutcome) -> Partial {
        self.summary.discovered += 1;
        match outcome {
            PairOutcome::Recorded(record) => {
                log::debug!(
                    "{}: {} cells, {:.2} µm²",
                    pair.relative_path.display(),
                    record.stats.valid_cells,
                    record.stats.area_um2
                );
                self.aggregator.add(record);
                self.summary.recorded += 1;
            }
            PairOutcome::Skipped(err) => {
                log::warn!("Skipping {}: {}", pair.cell_path.display(), err);
                self.summary.skipped += 1;
            }
            PairOutcome::Failed(err) => {
                log::warn!("Error processing {}: {}", pair.cell_path.display(), err);
                self.summary.failed += 1;
            }
        }
        self
    }

    fn merge(mut self, other: Partial) -> Result<Partial, AggregateError> {
        self.aggregator.merge(other.aggregator)?;
        self.summary.discovered += other.summary.discovered;
        self.summary.recorded += other.summary.recorded;
        self.summary.skipped += other.summary.skipped;
        self.summary.failed += other.summary.failed;
        Ok(self)
    }
}

/// Process every pair in parallel. Each worker folds its contiguous share of
/// pairs into a partial aggregate and the partials are reduced left to right,
/// so the report does not depend on the number of threads.
pub fn run(
    pairs: &[MaskPair],
    config: &RunConfig,
    extractor: &PathKeyExtractor,
) -> Result<(Aggregator, RunSummary), AggregateError> {
    let pb = progress_bar(pairs.len(), config.show_progress);
    let result = pairs
        .par_iter()
        .try_fold(
            || Partial::new(config.mode),
            |partial, pair| {
                let outcome = process_pair(pair, config, extractor);
                pb.inc(1);
                Ok::<_, AggregateError>(partial.record(pair, outcome))
            },
        )
        .try_reduce(|| Partial::new(config.mode), Partial::merge);
    pb.finish_and_clear();

    let partial = result?;
    Ok((partial.aggregator, partial.summary))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::discover::discover_mask_pairs;
    use crate::pathkeys::PathKeys;
    use ndarray::s;
    use ndarray_npy::write_npy;
    use std::fs::create_dir_all;
    use std::path::Path;
    use tempfile::TempDir;

    struct Fixture {
        cells: TempDir,
        exclude: TempDir,
    }

    impl Fixture {
        fn new() -> Fixture {
            Fixture {
                cells: tempfile::tempdir().unwrap(),
                exclude: tempfile::tempdir().unwrap(),
            }
        }

        fn write(root: &Path, relative: &str, grid: &LabelGrid) {
            let path = root.join(relative);
            create_dir_all(path.parent().unwrap()).unwrap();
            write_npy(&path, grid).unwrap();
        }

        fn cell(&self, relative: &str, grid: &LabelGrid) {
            Fixture::write(self.cells.path(), relative, grid);
        }

        fn exclusion(&self, relative: &str, grid: &LabelGrid) {
            Fixture::write(self.exclude.path(), relative, grid);
        }

        fn pairs(&self) -> Vec<MaskPair> {
            discover_mask_pairs(self.cells.path(), self.exclude.path()).unwrap()
        }
    }

    fn square_cell() -> LabelGrid {
        let mut cells = LabelGrid::zeros((10, 10));
        cells.slice_mut(s![0..3, 0..3]).fill(1);
        cells
    }

    fn config(mode: AggregationMode, missing_exclusion: MissingExclusionPolicy) -> RunConfig {
        RunConfig {
            mode,
            missing_exclusion,
            ..RunConfig::default()
        }
    }

    #[test]
    fn test_missing_exclusion_skip() {
        let fx = Fixture::new();
        fx.cell("a/img_seg.npy", &square_cell());

        let pairs = fx.pairs();
        let cfg = config(AggregationMode::PerFile, MissingExclusionPolicy::Skip);
        let outcome = process_pair(&pairs[0], &cfg, &PathKeyExtractor::new(None));
        assert!(matches!(
            outcome,
            PairOutcome::Skipped(PairError::MissingExclusionFile(_))
        ));

        let (agg, summary) = run(&pairs, &cfg, &PathKeyExtractor::new(None)).unwrap();
        assert!(agg.is_empty());
        assert_eq!(summary.skipped, 1);
    }

    #[test]
    fn test_missing_exclusion_empty() {
        let fx = Fixture::new();
        fx.cell("a/img_seg.npy", &square_cell());

        let pairs = fx.pairs();
        let cfg = config(AggregationMode::PerFile, MissingExclusionPolicy::Empty);
        match process_pair(&pairs[0], &cfg, &PathKeyExtractor::new(None)) {
            PairOutcome::Recorded(record) => {
                assert_eq!(record.stats.valid_cells, 1);
                assert_eq!(record.stats.area_um2, 400.0);
                assert_eq!(record.group_key, "a");
                assert_eq!(
                    record.identity,
                    PathKeys::Fallback {
                        parent_folder: "a".to_string(),
                        file_path: "a/img_seg.npy".to_string(),
                    }
                );
            }
            other => panic!("expected a record, got {:?}", other),
        }
    }

    #[test]
    fn test_exclusion_applied() {
        let fx = Fixture::new();
        let mut exclusion = LabelGrid::zeros((10, 10));
        exclusion[[1, 1]] = 1;
        fx.cell("a/img_seg.npy", &square_cell());
        fx.exclusion("a/img_seg.npy", &exclusion);

        let cfg = config(AggregationMode::PerFile, MissingExclusionPolicy::Skip);
        let (agg, summary) = run(&fx.pairs(), &cfg, &PathKeyExtractor::new(None)).unwrap();
        assert_eq!(summary.recorded, 1);
        let rows = agg.finish();
        assert_eq!(rows[0].cells, 0);
        assert_eq!(rows[0].area_um2, 396.0);
    }

    #[test]
    fn test_failures_do_not_stop_batch() {
        let fx = Fixture::new();
        fx.cell("a/1_seg.npy", &square_cell());
        fx.exclusion("a/1_seg.npy", &LabelGrid::zeros((5, 5)));
        fx.cell("a/2_seg.npy", &square_cell());
        std::fs::write(fx.exclude.path().join("a/2_seg.npy"), b"garbage").unwrap();
        fx.cell("a/3_seg.npy", &square_cell());
        fx.exclusion("a/3_seg.npy", &LabelGrid::zeros((10, 10)));

        let pairs = fx.pairs();
        let cfg = config(AggregationMode::Grouped, MissingExclusionPolicy::Skip);
        let extractor = PathKeyExtractor::new(None);

        assert!(matches!(
            process_pair(&pairs[0], &cfg, &extractor),
            PairOutcome::Failed(PairError::DimensionMismatch { .. })
        ));
        assert!(matches!(
            process_pair(&pairs[1], &cfg, &extractor),
            PairOutcome::Failed(PairError::MaskDecodeFailure { .. })
        ));

        let (agg, summary) = run(&pairs, &cfg, &extractor).unwrap();
        assert_eq!(
            summary,
            RunSummary {
                discovered: 3,
                recorded: 1,
                skipped: 0,
                failed: 2,
            }
        );
        let rows = agg.finish();
        assert_eq!(rows.len(), 1);
        assert_eq!(rows[0].identity, vec!["a".to_string()]);
        assert_eq!(rows[0].cells, 1);
        assert_eq!(rows[0].area_um2, 400.0);
    }

    #[test]
    fn test_grouped_run_with_columns() {
        let fx = Fixture::new();
        for name in ["p1/m1/x_seg.npy", "p1/m2/y_seg.npy", "p2/m1/z_seg.npy"] {
            fx.cell(name, &square_cell());
            fx.exclusion(name, &LabelGrid::zeros((10, 10)));
        }

        let cfg = config(AggregationMode::Grouped, MissingExclusionPolicy::Skip);
        let extractor = PathKeyExtractor::new(Some(vec!["gene".to_string()]));
        let (agg, _) = run(&fx.pairs(), &cfg, &extractor).unwrap();
        let rows = agg.finish();
        assert_eq!(rows.len(), 2);
        assert_eq!(rows[0].identity, vec!["p1".to_string()]);
        assert_eq!(rows[0].cells, 2);
        assert_eq!(rows[0].area_um2, 800.0);
        assert!((rows[0].density - 0.0025).abs() < 1e-12);
        assert_eq!(rows[1].identity, vec!["p2".to_string()]);
    }

    #[test]
    fn test_per_file_rows_follow_discovery_order() {
        let fx = Fixture::new();
        let names = ["c/3_seg.npy", "a/1_seg.npy", "b/2_seg.npy", "a/0_seg.npy"];
        for name in names {
            fx.cell(name, &square_cell());
        }

        let cfg = config(AggregationMode::PerFile, MissingExclusionPolicy::Empty);
        let extractor = PathKeyExtractor::new(Some(vec!["group".to_string(), "image".to_string()]));
        let (agg, _) = run(&fx.pairs(), &cfg, &extractor).unwrap();
        let identities: Vec<Vec<String>> = agg.finish().into_iter().map(|r| r.identity).collect();
        assert_eq!(
            identities,
            vec![
                vec!["a".to_string(), "0".to_string()],
                vec!["a".to_string(), "1".to_string()],
                vec!["b".to_string(), "2".to_string()],
                vec!["c".to_string(), "3".to_string()],
            ]
        );
    }

    const CELLPOSE_SEG: &[u8] = include_bytes!("testdata/cellpose_seg_p4.npy");
    const CELLPOSE_SEG_P3: &[u8] = include_bytes!("testdata/cellpose_seg_p3.npy");
    const CELLPOSE_EXCLUDE: &[u8] = include_bytes!("testdata/cellpose_exclude_p4.npy");

    impl Fixture {
        fn raw(root: &Path, relative: &str, bytes: &[u8]) {
            let path = root.join(relative);
            create_dir_all(path.parent().unwrap()).unwrap();
            std::fs::write(&path, bytes).unwrap();
        }
    }

    #[test]
    fn test_cellpose_seg_files() {
        let fx = Fixture::new();
        Fixture::raw(fx.cells.path(), "a/img_seg.npy", CELLPOSE_SEG);
        Fixture::raw(fx.cells.path(), "b/img_seg.npy", CELLPOSE_SEG_P3);
        Fixture::raw(fx.exclude.path(), "a/img_seg.npy", CELLPOSE_EXCLUDE);

        let pairs = fx.pairs();
        let cfg = config(AggregationMode::PerFile, MissingExclusionPolicy::Empty);
        let extractor = PathKeyExtractor::new(None);

        // the exclusion dict marks (1, 1), the centroid of label 1
        match process_pair(&pairs[0], &cfg, &extractor) {
            PairOutcome::Recorded(record) => {
                assert_eq!(record.stats.valid_cells, 1);
                assert_eq!(record.stats.area_um2, 396.0);
            }
            other => panic!("expected a record, got {:?}", other),
        }
        match process_pair(&pairs[1], &cfg, &extractor) {
            PairOutcome::Recorded(record) => {
                assert_eq!(record.stats.valid_cells, 2);
                assert_eq!(record.stats.area_um2, 400.0);
            }
            other => panic!("expected a record, got {:?}", other),
        }
    }

    #[test]
    fn test_thread_count_does_not_change_report() {
        let fx = Fixture::new();
        for i in 0..40 {
            let name = format!("g{}/{}_seg.npy", i % 7, i);
            let mut cells = square_cell();
            cells[[9, 9]] = (i % 3) as i64 + 2;
            fx.cell(&name, &cells);
            if i % 5 != 0 {
                fx.exclusion(&name, &LabelGrid::zeros((10, 10)));
            }
        }
        let pairs = fx.pairs();
        let extractor = PathKeyExtractor::new(None);

        for mode in [AggregationMode::Grouped, AggregationMode::PerFile] {
            let cfg = config(mode, MissingExclusionPolicy::Skip);
            let run_with = |nthreads: usize| {
                rayon::ThreadPoolBuilder::new()
                    .num_threads(nthreads)
                    .build()
                    .unwrap()
                    .install(|| run(&pairs, &cfg, &extractor).unwrap())
            };
            let (serial, serial_summary) = run_with(1);
            let (parallel, parallel_summary) = run_with(8);
            assert_eq!(serial_summary, parallel_summary);
            assert_eq!(
                serial_summary,
                RunSummary {
                    discovered: 40,
                    recorded: 32,
                    skipped: 8,
                    failed: 0,
                }
            );
            assert_eq!(serial.finish(), parallel.finish());
        }
    }
}
