use crate::CoaccessError;
use rustc_hash::FxHashSet;
use std::fs::File;
use std::io::{BufRead, BufReader};
use std::path::Path;
use tracing::info;

/// Set of valid document ids. Only documents on this list ever reach the
/// intermediate files, and therefore the output.
#[derive(Debug, Default, Clone)]
pub struct AllowList {
    ids: FxHashSet<String>,
}

impl AllowList {
    /// Read a newline-delimited id list. Lines are trimmed; blank lines are ignored.
    pub fn load(path: &Path) -> Result<Self, CoaccessError> {
        if !path.is_file() {
            return Err(CoaccessError::Config(format!(
                "allow-list file {} does not exist",
                path.display()
            )));
        }
        info!(path = %path.display(), "reading valid document ids");
        let reader = BufReader::new(File::open(path)?);
        let mut ids = FxHashSet::default();
        for line in reader.lines() {
            let line = line?;
            let id = line.trim();
            if !id.is_empty() {
                ids.insert(id.to_string());
            }
        }
        info!(size = ids.len(), "allow-list loaded");
        Ok(Self { ids })
    }

    pub fn contains(&self, id: &str) -> bool {
        self.ids.contains(id)
    }

    pub fn len(&self) -> usize {
        self.ids.len()
    }

    pub fn is_empty(&self) -> bool {
        self.ids.is_empty()
    }
}

impl<S: Into<String>> FromIterator<S> for AllowList {
    fn from_iter<I: IntoIterator<Item = S>>(iter: I) -> Self {
        Self {
            ids: iter.into_iter().map(Into::into).collect(),
        }
    }
}
