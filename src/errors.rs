// Error types shared by mask loading, per-file processing and report output.

use ndarray_npy::{ReadNpyError, ReadNpzError};
use std::path::PathBuf;
use thiserror::Error;

use crate::aggregate::AggregationMode;
use crate::pickle::PickleError;

/// Failure to turn a mask file into a usable 2-D integer grid.
#[derive(Error, Debug)]
pub enum MaskError {
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("unsupported mask file extension: {0:?}")]
    UnsupportedExtension(String),

    /// Object arrays (a dictionary saved with `np.save`) are stored as a
    /// pickle after the npy header.
    #[error("unable to unpickle object array: {0}")]
    Pickle(#[from] PickleError),

    #[error("malformed npy header")]
    BadHeader,

    #[error("expected a 2-D grid, found shape {0:?}")]
    NotAGrid(Vec<usize>),

    #[error("array data does not match its shape: {0}")]
    Shape(#[from] ndarray::ShapeError),

    #[error("unsupported array element type")]
    UnsupportedDtype,

    #[error("npy decode error: {0}")]
    Npy(#[from] ReadNpyError),

    #[error("npz decode error: {0}")]
    Npz(#[from] ReadNpzError),

    #[error("missing key '{0}' in mask bundle")]
    MissingKey(String),

    #[error("mask value {0} does not fit in a signed 64-bit label")]
    ValueOutOfRange(u64),
}

impl MaskError {
    // True when the stored element type simply differs from the one requested.
    pub fn is_wrong_descriptor(&self) -> bool {
        matches!(
            self,
            MaskError::Npy(ReadNpyError::WrongDescriptor(_))
                | MaskError::Npz(ReadNpzError::Npy(ReadNpyError::WrongDescriptor(_)))
        )
    }
}

/// Per file pair failures. None of these abort a run.
#[derive(Error, Debug)]
pub enum PairError {
    #[error("no matching exclusion file at {}", .0.display())]
    MissingExclusionFile(PathBuf),

    #[error("unable to read mask {}: {source}", .path.display())]
    MaskDecodeFailure {
        path: PathBuf,
        #[source]
        source: MaskError,
    },

    #[error("dimension mismatch: cell mask is {}x{}, exclusion mask is {}x{}", .cell.0, .cell.1, .exclusion.0, .exclusion.1)]
    DimensionMismatch {
        cell: (usize, usize),
        exclusion: (usize, usize),
    },
}

/// Problems detected before any file is processed.
#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("directory not found: {}", .0.display())]
    MissingDirectory(PathBuf),

    #[error("pixel size must be a positive finite number, got {0}")]
    InvalidPixelSize(f64),

    #[error("unknown output format for: {0}")]
    UnknownOutputFormat(String),

    #[error("unable to scan {}: {source}", .path.display())]
    Scan {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
}

/// Partial aggregates that can not be combined.
#[derive(Error, Debug)]
pub enum AggregateError {
    #[error("can not merge a {other:?} aggregate into a {this:?} aggregate")]
    ModeMismatch {
        this: AggregationMode,
        other: AggregationMode,
    },
}

/// The report could not be persisted.
#[derive(Error, Debug)]
pub enum ReportError {
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("CSV error: {0}")]
    Csv(#[from] csv::Error),

    #[error("arrow error: {0}")]
    Arrow(#[from] arrow::error::ArrowError),

    #[error("parquet error: {0}")]
    Parquet(#[from] parquet::errors::ParquetError),

    #[error("xlsx error: {0}")]
    Xlsx(#[from] rust_xlsxwriter::XlsxError),
}
