use clap::Parser;
use std::path::{Path, PathBuf};

mod aggregate;
mod census;
mod discover;
mod errors;
mod masks;
mod output;
mod pathkeys;
mod pickle;
mod pipeline;
mod schemas;

use aggregate::{AggregationMode, Aggregator};
use discover::discover_mask_pairs;
use errors::{ConfigError, ReportError};
use output::{determine_format, write_report};
use pathkeys::PathKeyExtractor;
use pipeline::{MissingExclusionPolicy, RunConfig};
use schemas::{OutputFormat, ReportLayout};

#[derive(Parser, Debug)]
#[command(name = "cellcount")]
#[command(version)]
#[command(about = "Count segmented cells outside excluded regions and report cell density.")]
struct Args {
    /// Directory containing the cell segmentation (*_seg.npy / *_seg.npz) files.
    #[arg(long)]
    cells: PathBuf,

    /// Directory containing the exclusion masks, mirroring the layout of --cells.
    #[arg(long)]
    exclude: PathBuf,

    /// Size of a pixel in micrometers (µm).
    #[arg(long, default_value_t = 2.0)]
    pixel_size: f64,

    /// Names for the path segments (directories, then file name), comma separated.
    #[arg(long, value_delimiter = ',', num_args = 1..)]
    columns: Option<Vec<String>>,

    /// Aggregation mode. Defaults to per-file when --columns is given, grouped otherwise.
    #[arg(long, value_enum)]
    mode: Option<AggregationMode>,

    #[arg(long, value_enum, default_value_t = MissingExclusionPolicy::Skip)]
    missing_exclusion: MissingExclusionPolicy,

    #[arg(short, long, default_value = "cell_count_results.xlsx")]
    output: String,

    #[arg(long, value_enum, default_value_t = OutputFormat::Infer)]
    output_fmt: OutputFormat,

    #[arg(short = 't', long, default_value = None)]
    nthreads: Option<usize>,

    #[arg(long, default_value_t = false)]
    no_progress: bool,

    #[arg(short, long, action = clap::ArgAction::Count)]
    verbose: u8,
}

fn init_logging(verbose: u8) {
    let level = match verbose {
        0 => "info",
        1 => "debug",
        _ => "trace",
    };
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or(level))
        .format_timestamp(Some(env_logger::fmt::TimestampPrecision::Seconds))
        .init();
}

fn resolve_mode(mode: Option<AggregationMode>, columns: &Option<Vec<String>>) -> AggregationMode {
    match (mode, columns) {
        (Some(mode), _) => mode,
        (None, Some(_)) => AggregationMode::PerFile,
        (None, None) => AggregationMode::Grouped,
    }
}

fn check_config(args: &Args) -> Result<OutputFormat, ConfigError> {
    if !args.pixel_size.is_finite() || args.pixel_size <= 0.0 {
        return Err(ConfigError::InvalidPixelSize(args.pixel_size));
    }
    if !args.cells.is_dir() {
        return Err(ConfigError::MissingDirectory(args.cells.clone()));
    }
    // every exclusion file would be missing anyway
    if !args.exclude.is_dir() && args.missing_exclusion == MissingExclusionPolicy::Skip {
        return Err(ConfigError::MissingDirectory(args.exclude.clone()));
    }
    determine_format(&args.output, args.output_fmt)
}

fn run(args: Args) -> Result<(), Box<dyn std::error::Error>> {
    let output_fmt = check_config(&args)?;

    if let Some(nthreads) = args.nthreads {
        if let Err(err) = rayon::ThreadPoolBuilder::new()
            .num_threads(nthreads)
            .build_global()
        {
            log::warn!("Unable to configure {} threads: {}", nthreads, err);
        }
    }
    log::debug!("Using {} threads", rayon::current_num_threads());

    let mode = resolve_mode(args.mode, &args.columns);
    if mode == AggregationMode::Grouped && args.columns.is_some() {
        log::warn!("Grouping by top-level folder; --columns is ignored in grouped mode");
    }

    let pairs = discover_mask_pairs(&args.cells, &args.exclude).map_err(|source| {
        ConfigError::Scan {
            path: args.cells.clone(),
            source,
        }
    })?;
    log::info!("Found {} cell mask files", pairs.len());

    let config = RunConfig {
        pixel_size_um: args.pixel_size,
        mode,
        missing_exclusion: args.missing_exclusion,
        show_progress: !args.no_progress,
    };
    let extractor = PathKeyExtractor::new(args.columns);
    let (aggregator, summary) = pipeline::run(&pairs, &config, &extractor)?;

    log::info!(
        "Processed {} files: {} recorded, {} skipped, {} failed",
        summary.discovered,
        summary.recorded,
        summary.skipped,
        summary.failed
    );

    let layout = ReportLayout::new(mode, extractor.columns());
    save_results(aggregator, &layout, &args.output, output_fmt)?;

    Ok(())
}

/// Write the report unless nothing was recorded. Returns the number of rows
/// written, or `None` when no file was produced.
fn save_results(
    aggregator: Aggregator,
    layout: &ReportLayout,
    output: &str,
    fmt: OutputFormat,
) -> Result<Option<usize>, ReportError> {
    if aggregator.is_empty() {
        log::warn!("No data processed. No output file generated.");
        return Ok(None);
    }

    let rows = aggregator.finish();
    if let Err(err) = write_report(Path::new(output), fmt, layout, &rows) {
        log::error!(
            "Unable to save results to {}; no output file was written ({} rows computed)",
            output,
            rows.len()
        );
        return Err(err);
    }
    log::info!("Results saved to {}", output);

    Ok(Some(rows.len()))
}

fn main() {
    let args = Args::parse();
    init_logging(args.verbose);

    if let Err(err) = run(args) {
        log::error!("{}", err);
        std::process::exit(1);
    }
}
