use crate::CoaccessError;
use flate2::read::GzDecoder;
use serde::Deserialize;
use serde_json::Value;
use std::fs::{self, File};
use std::io::BufReader;
use std::path::{Path, PathBuf};

#[derive(Debug, Deserialize)]
struct DayArchive {
    entries: Vec<Value>,
}

/// One usage-log entry with only the fields the normalizer cares about.
/// A field that is absent or of an unusable type is `None`.
#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct RawEntry {
    pub arxiv_id: Option<String>,
    pub utc: Option<i64>,
    pub cookie_hash: Option<String>,
    pub ip_hash: Option<String>,
}

impl RawEntry {
    /// `None` when the entry is not a JSON object at all.
    pub fn from_value(value: &Value) -> Option<Self> {
        let obj = value.as_object()?;
        Some(Self {
            arxiv_id: obj.get("arxiv_id").and_then(Value::as_str).map(str::to_string),
            utc: obj.get("utc").and_then(parse_utc),
            cookie_hash: obj.get("cookie_hash").and_then(hash_text),
            ip_hash: obj.get("ip_hash").and_then(hash_text),
        })
    }

    /// Cookie hash first, IP hash as fallback.
    pub fn user_key(&self) -> Option<&str> {
        self.cookie_hash.as_deref().or(self.ip_hash.as_deref())
    }
}

fn parse_utc(value: &Value) -> Option<i64> {
    match value {
        Value::Number(n) => n.as_i64().or_else(|| n.as_f64().and_then(truncate_seconds)),
        Value::String(s) => {
            let s = s.trim();
            s.parse().ok().or_else(|| s.parse::<f64>().ok().and_then(truncate_seconds))
        }
        _ => None,
    }
}

/// Fractional seconds are dropped; non-finite or out-of-range values are unusable.
fn truncate_seconds(secs: f64) -> Option<i64> {
    (secs.is_finite() && secs.abs() < i64::MAX as f64).then(|| secs.trunc() as i64)
}

fn hash_text(value: &Value) -> Option<String> {
    match value {
        Value::String(s) => Some(s.clone()),
        Value::Number(n) => Some(n.to_string()),
        _ => None,
    }
}

/// Entries of one day file; `None` marks an entry that was not an object.
pub fn read_day_file(path: &Path) -> Result<Vec<Option<RawEntry>>, CoaccessError> {
    let decoder = GzDecoder::new(BufReader::new(File::open(path)?));
    let archive: DayArchive = serde_json::from_reader(decoder).map_err(|e| {
        CoaccessError::Data(format!("{} is not a gzip JSON day file: {}", path.display(), e))
    })?;
    Ok(archive.entries.iter().map(RawEntry::from_value).collect())
}

/// Regular files directly under `dir`, in file-name order.
pub fn list_day_files(dir: &Path) -> Result<Vec<PathBuf>, CoaccessError> {
    if !dir.is_dir() {
        return Err(CoaccessError::Config(format!(
            "input directory {} does not exist",
            dir.display()
        )));
    }
    let mut files = Vec::new();
    for entry in fs::read_dir(dir)? {
        let path = entry?.path();
        if path.is_file() {
            files.push(path);
        }
    }
    files.sort();
    Ok(files)
}
