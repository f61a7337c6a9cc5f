// Derive report identity columns and grouping keys from a mask file's
// location relative to the scanned root.

use itertools::Itertools;
use std::path::{Component, Path};

pub const SEG_SUFFIX: &str = "_seg";

#[derive(Clone, Debug, PartialEq, Eq)]
pub enum PathKeys {
    // One value per configured column name, in column order.
    Columns(Vec<String>),
    Fallback {
        parent_folder: String,
        file_path: String,
    },
}

impl PathKeys {
    pub fn values(&self) -> Vec<String> {
        match self {
            PathKeys::Columns(values) => values.clone(),
            PathKeys::Fallback {
                parent_folder,
                file_path,
            } => vec![parent_folder.clone(), file_path.clone()],
        }
    }
}

pub struct PathKeyExtractor {
    columns: Option<Vec<String>>,
}

impl PathKeyExtractor {
    pub fn new(columns: Option<Vec<String>>) -> PathKeyExtractor {
        PathKeyExtractor { columns }
    }

    pub fn columns(&self) -> Option<&[String]> {
        self.columns.as_deref()
    }

    /// Map path segments (directories followed by the filename) to identity
    /// values. With explicit columns, segment `i` fills column `i`; missing
    /// segments become empty strings and surplus segments are dropped.
    pub fn extract(&self, segments: &[String]) -> PathKeys {
        match &self.columns {
            Some(columns) => {
                let values = flat_segments(segments)
                    .into_iter()
                    .pad_using(columns.len(), |_| String::new())
                    .take(columns.len())
                    .collect();
                PathKeys::Columns(values)
            }
            None => {
                let parent_folder = if segments.len() > 1 {
                    segments[segments.len() - 2].clone()
                } else {
                    String::new()
                };
                PathKeys::Fallback {
                    parent_folder,
                    file_path: segments.iter().join("/"),
                }
            }
        }
    }
}

// Directories verbatim, then the filename without extension and `_seg`.
fn flat_segments(segments: &[String]) -> Vec<String> {
    match segments.split_last() {
        Some((filename, dirs)) => {
            let mut flat = dirs.to_vec();
            flat.push(strip_seg_suffix(filename).to_string());
            flat
        }
        None => Vec::new(),
    }
}

pub fn strip_seg_suffix(filename: &str) -> &str {
    let stem = match filename.rfind('.') {
        Some(pos) if pos > 0 => &filename[..pos],
        _ => filename,
    };
    stem.strip_suffix(SEG_SUFFIX).unwrap_or(stem)
}

/// Grouping key for grouped aggregation: the top-level segment of the path.
/// For files directly under the root this is the filename itself.
pub fn group_key(segments: &[String]) -> String {
    segments.first().cloned().unwrap_or_default()
}

pub fn path_segments(relative_path: &Path) -> Vec<String> {
    relative_path
        .components()
        .filter_map(|c| match c {
            Component::Normal(part) => Some(part.to_string_lossy().into_owned()),
            _ => None,
        })
        .collect()
}
