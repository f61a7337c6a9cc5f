// Find cell mask files and their mirrored exclusion mask paths.

use std::fs;
use std::io;
use std::path::{Path, PathBuf};

use crate::pathkeys::SEG_SUFFIX;

const MASK_EXTENSIONS: [&str; 2] = ["npy", "npz"];

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct MaskPair {
    pub relative_path: PathBuf,
    pub cell_path: PathBuf,
    pub exclude_path: PathBuf,
}

pub fn is_cell_mask_file(name: &str) -> bool {
    // hidden files, including macOS "._" resource forks
    if name.starts_with('.') {
        return false;
    }
    MASK_EXTENSIONS.iter().any(|ext| {
        name.strip_suffix(ext)
            .and_then(|rest| rest.strip_suffix('.'))
            .is_some_and(|stem| stem.ends_with(SEG_SUFFIX))
    })
}

/// Every cell mask under `cells_root`, sorted by relative path, paired with
/// the same relative path under `exclude_root`.
pub fn discover_mask_pairs(cells_root: &Path, exclude_root: &Path) -> io::Result<Vec<MaskPair>> {
    let mut relative_paths = Vec::new();
    walk(cells_root, Path::new(""), &mut relative_paths)?;
    relative_paths.sort();

    Ok(relative_paths
        .into_iter()
        .map(|relative_path| MaskPair {
            cell_path: cells_root.join(&relative_path),
            exclude_path: exclude_root.join(&relative_path),
            relative_path,
        })
        .collect())
}

fn walk(dir: &Path, prefix: &Path, out: &mut Vec<PathBuf>) -> io::Result<()> {
    for entry in fs::read_dir(dir)? {
        let entry = entry?;
        let file_name = entry.file_name();
        let name = file_name.to_string_lossy();
        if name.starts_with('.') {
            continue;
        }

        let path = entry.path();
        let relative = prefix.join(&file_name);
        if path.is_dir() {
            walk(&path, &relative, out)?;
        } else if is_cell_mask_file(&name) {
            out.push(relative);
        }
    }
    Ok(())
}
