use crate::CoaccessError;
use std::ffi::OsString;
use std::fs;
use std::path::{Path, PathBuf};

/// Locations of every stage output for one run, all under the output directory.
#[derive(Clone, Debug)]
pub struct RunLayout {
    pub base_dir: PathBuf,
    pub year: i32,
}

impl RunLayout {
    pub fn new(base_dir: impl Into<PathBuf>, year: i32) -> Self {
        Self {
            base_dir: base_dir.into(),
            year,
        }
    }

    /// Normalized, unsorted triples.
    pub fn normalized_path(&self) -> PathBuf {
        self.base_dir.join(format!("{}_phase1.txt", self.year))
    }

    /// Sorted, deduplicated triples.
    pub fn deduplicated_path(&self) -> PathBuf {
        self.base_dir.join(format!("{}_phase3.txt", self.year))
    }

    /// Scratch space for external sort runs.
    pub fn sort_dir(&self) -> PathBuf {
        self.base_dir.join(format!("{}_sort", self.year))
    }

    /// Per-document neighbor shards written by the aggregator.
    pub fn shard_dir(&self) -> PathBuf {
        self.base_dir.join(format!("{}_split1", self.year))
    }

    /// Final ranked output.
    pub fn final_dir(&self) -> PathBuf {
        self.base_dir.join(self.year.to_string())
    }

    pub fn report_path(&self) -> PathBuf {
        self.base_dir.join(format!("{}_report.json", self.year))
    }
}

/// `path` with `.tmp` appended to its file name.
pub fn temp_path(path: &Path) -> PathBuf {
    let mut name = path
        .file_name()
        .map(OsString::from)
        .unwrap_or_default();
    name.push(".tmp");
    path.with_file_name(name)
}

/// Remove whatever a crashed run left at the temporary path for `path`.
pub fn clear_temp(path: &Path) -> Result<PathBuf, CoaccessError> {
    let tmp = temp_path(path);
    if tmp.is_dir() {
        fs::remove_dir_all(&tmp)?;
    } else if tmp.exists() {
        fs::remove_file(&tmp)?;
    }
    Ok(tmp)
}

/// A stage output must not already exist; runs are never mixed.
pub fn ensure_absent(path: &Path) -> Result<(), CoaccessError> {
    if path.exists() {
        return Err(CoaccessError::ResourceExists(path.to_path_buf()));
    }
    Ok(())
}

/// Move a finished temporary output into place.
pub fn publish(tmp: &Path, path: &Path) -> Result<(), CoaccessError> {
    ensure_absent(path)?;
    fs::rename(tmp, path)?;
    Ok(())
}
