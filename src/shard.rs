use crate::CoaccessError;
use rustc_hash::{FxHashSet, FxHasher};
use serde::Serialize;
use std::collections::BTreeMap;
use std::fmt;
use std::fs::{self, OpenOptions};
use std::hash::Hasher;
use std::io::{BufRead, BufReader, BufWriter, Write};
use std::path::{Path, PathBuf};
use std::str::FromStr;

/// Shard name for ids that have no prefix separator.
const NO_PREFIX_SHARD: &str = "_";

/// Maps a document id to the shard holding its neighbor log.
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize)]
#[serde(rename_all = "kebab-case")]
pub enum ShardScheme {
    /// Text before the last `.`, `@` or `/` (`1401.1234` -> `1401`, `hep-th/9901001` -> `hep-th`).
    #[default]
    Prefix,
    /// FxHash of the id modulo `buckets`.
    Hash { buckets: usize },
}

impl ShardScheme {
    pub fn shard_for(&self, key: &str) -> String {
        match self {
            ShardScheme::Prefix => match key.rfind(['.', '@', '/']) {
                Some(idx) if !matches!(&key[..idx], "" | "." | "..") => escape_key(&key[..idx]),
                _ => NO_PREFIX_SHARD.to_string(),
            },
            ShardScheme::Hash { buckets } => {
                let mut hasher = FxHasher::default();
                hasher.write(key.as_bytes());
                format!("{:04}", hasher.finish() % (*buckets as u64))
            }
        }
    }
}

impl FromStr for ShardScheme {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        if s == "prefix" {
            return Ok(ShardScheme::Prefix);
        }
        let buckets = s
            .strip_prefix("hash:")
            .ok_or_else(|| format!("unknown shard scheme '{}' (expected 'prefix' or 'hash:N')", s))?
            .parse::<usize>()
            .map_err(|e| format!("invalid bucket count in '{}': {}", s, e))?;
        if buckets == 0 {
            return Err("hash bucket count must be positive".to_string());
        }
        Ok(ShardScheme::Hash { buckets })
    }
}

impl fmt::Display for ShardScheme {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ShardScheme::Prefix => write!(f, "prefix"),
            ShardScheme::Hash { buckets } => write!(f, "hash:{}", buckets),
        }
    }
}

/// Storage-safe form of a document id: slashes become `@`.
pub fn escape_key(key: &str) -> String {
    key.replace('/', "@")
}

pub fn unescape_key(name: &str) -> String {
    name.replace('@', "/")
}

/// Keyed append-only store of neighbor observations, one log per document.
pub trait ShardStore {
    fn scheme(&self) -> &ShardScheme;

    /// Append `neighbors` to the log of `key`, returning the number written.
    fn append(&mut self, key: &str, neighbors: &[&str]) -> Result<u64, CoaccessError>;

    /// All shard names, sorted.
    fn shards(&self) -> Result<Vec<String>, CoaccessError>;

    /// Document ids in `shard`, sorted by their escaped form.
    fn keys(&self, shard: &str) -> Result<Vec<String>, CoaccessError>;

    /// Visit every neighbor logged for `key`, in append order.
    fn for_each_neighbor(&self, key: &str, f: &mut dyn FnMut(&str)) -> Result<(), CoaccessError>;
}

/// `<root>/<shard>/<escaped-key>` files opened in append mode.
pub struct FsShardStore {
    root: PathBuf,
    scheme: ShardScheme,
    created_dirs: FxHashSet<String>,
}

impl FsShardStore {
    pub fn new(root: impl Into<PathBuf>, scheme: ShardScheme) -> Result<Self, CoaccessError> {
        let root = root.into();
        fs::create_dir_all(&root)?;
        Ok(Self {
            root,
            scheme,
            created_dirs: FxHashSet::default(),
        })
    }

    /// Open an existing store for reading.
    pub fn open(root: impl Into<PathBuf>, scheme: ShardScheme) -> Result<Self, CoaccessError> {
        let root = root.into();
        if !root.is_dir() {
            return Err(CoaccessError::Data(format!(
                "shard directory {} does not exist",
                root.display()
            )));
        }
        Ok(Self {
            root,
            scheme,
            created_dirs: FxHashSet::default(),
        })
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    fn key_path(&self, key: &str) -> PathBuf {
        self.root
            .join(self.scheme.shard_for(key))
            .join(escape_key(key))
    }
}

fn sorted_entries(dir: &Path, want_dirs: bool) -> Result<Vec<String>, CoaccessError> {
    let mut names = Vec::new();
    for entry in fs::read_dir(dir)? {
        let entry = entry?;
        if entry.file_type()?.is_dir() != want_dirs {
            continue;
        }
        if let Some(name) = entry.file_name().to_str() {
            names.push(name.to_string());
        }
    }
    names.sort();
    Ok(names)
}

impl ShardStore for FsShardStore {
    fn scheme(&self) -> &ShardScheme {
        &self.scheme
    }

    fn append(&mut self, key: &str, neighbors: &[&str]) -> Result<u64, CoaccessError> {
        let shard = self.scheme.shard_for(key);
        if !self.created_dirs.contains(&shard) {
            fs::create_dir_all(self.root.join(&shard))?;
            self.created_dirs.insert(shard);
        }
        let file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(self.key_path(key))?;
        let mut writer = BufWriter::new(file);
        for neighbor in neighbors {
            writeln!(writer, "{}", neighbor)?;
        }
        writer.flush()?;
        Ok(neighbors.len() as u64)
    }

    fn shards(&self) -> Result<Vec<String>, CoaccessError> {
        sorted_entries(&self.root, true)
    }

    fn keys(&self, shard: &str) -> Result<Vec<String>, CoaccessError> {
        Ok(sorted_entries(&self.root.join(shard), false)?
            .iter()
            .map(|name| unescape_key(name))
            .collect())
    }

    fn for_each_neighbor(&self, key: &str, f: &mut dyn FnMut(&str)) -> Result<(), CoaccessError> {
        let reader = BufReader::new(fs::File::open(self.key_path(key))?);
        for line in reader.lines() {
            let line = line?;
            let neighbor = line.trim();
            if !neighbor.is_empty() {
                f(neighbor);
            }
        }
        Ok(())
    }
}

/// In-memory store with the same addressing; keys are kept by escaped name.
#[derive(Debug, Default)]
pub struct MemoryShardStore {
    scheme: ShardScheme,
    shards: BTreeMap<String, BTreeMap<String, Vec<String>>>,
}

impl MemoryShardStore {
    pub fn new(scheme: ShardScheme) -> Self {
        Self {
            scheme,
            shards: BTreeMap::new(),
        }
    }

    pub fn neighbors(&self, key: &str) -> Option<&[String]> {
        self.shards
            .get(&self.scheme.shard_for(key))?
            .get(&escape_key(key))
            .map(Vec::as_slice)
    }
}

impl ShardStore for MemoryShardStore {
    fn scheme(&self) -> &ShardScheme {
        &self.scheme
    }

    fn append(&mut self, key: &str, neighbors: &[&str]) -> Result<u64, CoaccessError> {
        let log = self
            .shards
            .entry(self.scheme.shard_for(key))
            .or_default()
            .entry(escape_key(key))
            .or_default();
        log.extend(neighbors.iter().map(|n| n.to_string()));
        Ok(neighbors.len() as u64)
    }

    fn shards(&self) -> Result<Vec<String>, CoaccessError> {
        Ok(self.shards.keys().cloned().collect())
    }

    fn keys(&self, shard: &str) -> Result<Vec<String>, CoaccessError> {
        Ok(self
            .shards
            .get(shard)
            .map(|keys| keys.keys().map(|name| unescape_key(name)).collect())
            .unwrap_or_default())
    }

    fn for_each_neighbor(&self, key: &str, f: &mut dyn FnMut(&str)) -> Result<(), CoaccessError> {
        let log = self.neighbors(key).ok_or_else(|| {
            CoaccessError::Data(format!("no neighbor log for {}", key))
        })?;
        for neighbor in log {
            f(neighbor);
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_prefix_scheme() {
        let scheme = ShardScheme::Prefix;
        assert_eq!(scheme.shard_for("1401.1234"), "1401");
        assert_eq!(scheme.shard_for("1401.1234v2"), "1401");
        assert_eq!(scheme.shard_for("hep-th/9901001"), "hep-th");
        assert_eq!(scheme.shard_for("math.GT/0309136"), "math.GT");
        assert_eq!(scheme.shard_for("cat@001"), "cat");
        assert_eq!(scheme.shard_for("noseparator"), "_");
        assert_eq!(scheme.shard_for(".hidden"), "_");
        assert_eq!(scheme.shard_for("..x"), "_");
        assert_eq!(scheme.shard_for("../x"), "_");
        assert_eq!(scheme.shard_for("./x"), "_");
        assert_eq!(scheme.shard_for("a/../x"), "a@..");
    }

    #[test]
    fn test_hash_scheme_is_stable_and_bounded() {
        let scheme = ShardScheme::Hash { buckets: 16 };
        let a = scheme.shard_for("1401.1234");
        assert_eq!(a, scheme.shard_for("1401.1234"));
        for id in ["a", "b", "hep-th/9901001", "1401.0001"] {
            let shard: u64 = scheme.shard_for(id).parse().unwrap();
            assert!(shard < 16);
        }
    }

    #[test]
    fn test_scheme_parse_and_display() {
        assert_eq!("prefix".parse::<ShardScheme>().unwrap(), ShardScheme::Prefix);
        assert_eq!(
            "hash:32".parse::<ShardScheme>().unwrap(),
            ShardScheme::Hash { buckets: 32 }
        );
        assert!("hash:0".parse::<ShardScheme>().is_err());
        assert!("hash:x".parse::<ShardScheme>().is_err());
        assert!("modulo".parse::<ShardScheme>().is_err());
        assert_eq!(ShardScheme::Hash { buckets: 8 }.to_string(), "hash:8");
    }

    #[test]
    fn test_escape_roundtrip() {
        assert_eq!(escape_key("hep-th/9901001"), "hep-th@9901001");
        assert_eq!(unescape_key("hep-th@9901001"), "hep-th/9901001");
    }

    #[test]
    fn test_fs_store_appends_across_calls() {
        let temp_dir = tempfile::tempdir().unwrap();
        let root = temp_dir.path().join("split");
        let mut store = FsShardStore::new(&root, ShardScheme::Prefix).unwrap();

        store.append("hep-th/9901001", &["1401.0001", "1401.0002"]).unwrap();
        store.append("hep-th/9901001", &["1401.0001"]).unwrap();
        store.append("1401.0001", &["hep-th/9901001"]).unwrap();

        assert_eq!(
            fs::read_to_string(root.join("hep-th").join("hep-th@9901001")).unwrap(),
            "1401.0001\n1401.0002\n1401.0001\n"
        );
        assert_eq!(store.shards().unwrap(), vec!["1401", "hep-th"]);
        assert_eq!(store.keys("hep-th").unwrap(), vec!["hep-th/9901001"]);

        let reopened = FsShardStore::open(&root, ShardScheme::Prefix).unwrap();
        let mut seen = Vec::new();
        reopened
            .for_each_neighbor("hep-th/9901001", &mut |n: &str| seen.push(n.to_string()))
            .unwrap();
        assert_eq!(seen, vec!["1401.0001", "1401.0002", "1401.0001"]);
    }

    #[test]
    fn test_open_missing_root_fails() {
        let temp_dir = tempfile::tempdir().unwrap();
        assert!(FsShardStore::open(temp_dir.path().join("nope"), ShardScheme::Prefix).is_err());
    }

    #[test]
    fn test_memory_store_matches_addressing() {
        let mut store = MemoryShardStore::new(ShardScheme::Prefix);
        store.append("1401.0001", &["a", "b"]).unwrap();
        store.append("1401.0001", &["a"]).unwrap();
        assert_eq!(store.shards().unwrap(), vec!["1401"]);
        assert_eq!(store.keys("1401").unwrap(), vec!["1401.0001"]);
        assert_eq!(store.neighbors("1401.0001").unwrap(), ["a", "b", "a"]);
        assert!(store.keys("missing").unwrap().is_empty());
    }
}
