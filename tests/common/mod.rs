#![allow(dead_code)]

use coaccess::config::PipelineConfig;
use coaccess::external_sort::SortConfig;
use flate2::write::GzEncoder;
use flate2::Compression;
use serde_json::{json, Value};
use std::collections::BTreeMap;
use std::fs::{self, File};
use std::io::Write;
use std::path::{Path, PathBuf};

pub const A: &str = "1401.0001";
pub const B: &str = "1401.0002";
pub const C: &str = "hep-th/9901001";

pub fn view(user: &str, document: &str, utc: i64) -> Value {
    json!({"arxiv_id": document, "utc": utc, "cookie_hash": user})
}

pub fn write_day_file(path: &Path, entries: Vec<Value>) {
    let mut encoder = GzEncoder::new(File::create(path).unwrap(), Compression::default());
    encoder
        .write_all(serde_json::to_string(&json!({ "entries": entries })).unwrap().as_bytes())
        .unwrap();
    encoder.finish().unwrap();
}

/// Archive, allow-list and output directory for one year under a temp root.
pub struct Fixture {
    pub root: PathBuf,
    pub input_root: PathBuf,
    pub output_dir: PathBuf,
    pub allow_list: PathBuf,
}

impl Fixture {
    pub fn new(root: &Path, allowed: &[String]) -> Self {
        let input_root = root.join("usage");
        let output_dir = root.join("out");
        fs::create_dir_all(input_root.join("2014")).unwrap();
        fs::create_dir_all(&output_dir).unwrap();
        let allow_list = root.join("allow.txt");
        fs::write(&allow_list, allowed.join("\n") + "\n").unwrap();
        Self {
            root: root.to_path_buf(),
            input_root,
            output_dir,
            allow_list,
        }
    }

    pub fn day(&self, name: &str, entries: Vec<Value>) {
        write_day_file(&self.input_root.join("2014").join(name), entries);
    }

    /// Small budgets so every run exercises multi-run sorting and repeated flushes.
    pub fn config(&self) -> PipelineConfig {
        let mut config = PipelineConfig::new(2014, &self.output_dir, &self.allow_list);
        config.input_root = self.input_root.clone();
        config.sort = SortConfig {
            run_budget_bytes: 256,
            fan_in: 2,
        };
        config.flush_budget = 4;
        config.workers = 2;
        config
    }

    pub fn final_dir(&self) -> PathBuf {
        self.output_dir.join("2014")
    }
}

/// The three-session scenario: [A,B], [A,B,C], [B,C], with a repeated view of A by u1.
pub fn three_sessions(fixture: &Fixture) {
    fixture.day(
        "140101.json.gz",
        vec![
            view("u1", A, 100),
            view("u2", A, 110),
            view("u2", B, 120),
            view("u3", B, 130),
        ],
    );
    fixture.day(
        "140102.json.gz",
        vec![
            view("u1", B, 200),
            view("u1", A, 250),
            view("u2", C, 210),
            view("u3", C, 220),
            json!({"arxiv_id": "0000.0000", "utc": 1, "cookie_hash": "u9"}),
            json!({"arxiv_id": A, "utc": 5}),
            json!("not an object"),
        ],
    );
}

/// Every file under `dir`, keyed by path relative to `dir`.
pub fn read_tree(dir: &Path) -> BTreeMap<PathBuf, String> {
    let mut files = BTreeMap::new();
    let mut stack = vec![dir.to_path_buf()];
    while let Some(current) = stack.pop() {
        for entry in fs::read_dir(&current).unwrap() {
            let path = entry.unwrap().path();
            if path.is_dir() {
                stack.push(path);
            } else {
                let relative = path.strip_prefix(dir).unwrap().to_path_buf();
                files.insert(relative, fs::read_to_string(&path).unwrap());
            }
        }
    }
    files
}

/// `neighbor count` lines of one per-document output file.
pub fn ranking(path: &Path) -> Vec<(String, u64)> {
    fs::read_to_string(path)
        .unwrap()
        .lines()
        .map(|line| {
            let (neighbor, count) = line.rsplit_once(' ').unwrap();
            (neighbor.to_string(), count.parse().unwrap())
        })
        .collect()
}
