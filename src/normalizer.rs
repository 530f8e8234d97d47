use crate::allow_list::AllowList;
use crate::archive::{self, RawEntry};
use crate::cancel::CancelToken;
use crate::event::{is_line_safe, AccessEvent};
use crate::layout;
use crate::CoaccessError;
use rayon::prelude::*;
use serde::Serialize;
use std::fs::{self, File};
use std::io::{self, BufWriter, Write};
use std::path::{Path, PathBuf};
use tracing::{debug, info};

/// Per-reason record counts for one or more day files.
#[derive(Debug, Default, Clone, PartialEq, Eq, Serialize)]
pub struct NormalizeStats {
    pub files: usize,
    pub entries: u64,
    pub emitted: u64,
    pub missing_fields: u64,
    pub unknown_document: u64,
    pub no_identity: u64,
    pub malformed: u64,
}

impl NormalizeStats {
    pub fn merge(&mut self, other: &NormalizeStats) {
        self.files += other.files;
        self.entries += other.entries;
        self.emitted += other.emitted;
        self.missing_fields += other.missing_fields;
        self.unknown_document += other.unknown_document;
        self.no_identity += other.no_identity;
        self.malformed += other.malformed;
    }

    pub fn skipped(&self) -> u64 {
        self.missing_fields + self.unknown_document + self.no_identity + self.malformed
    }
}

/// Resolves raw log entries into `(user, document, timestamp)` triples.
pub struct Normalizer<'a> {
    allow_list: &'a AllowList,
    workers: usize,
    cancel: CancelToken,
}

impl<'a> Normalizer<'a> {
    pub fn new(allow_list: &'a AllowList, workers: usize, cancel: CancelToken) -> Self {
        Self {
            allow_list,
            workers: workers.max(1),
            cancel,
        }
    }

    /// Apply the record-level policy to one entry, counting the reason for any drop.
    pub fn normalize_entry(
        &self,
        entry: Option<&RawEntry>,
        stats: &mut NormalizeStats,
    ) -> Option<AccessEvent> {
        stats.entries += 1;
        let Some(entry) = entry else {
            stats.malformed += 1;
            return None;
        };
        let (Some(document_id), Some(timestamp)) = (entry.arxiv_id.as_deref(), entry.utc) else {
            stats.missing_fields += 1;
            return None;
        };
        if !self.allow_list.contains(document_id) {
            stats.unknown_document += 1;
            return None;
        }
        let Some(user_key) = entry.user_key() else {
            stats.no_identity += 1;
            return None;
        };
        if !is_line_safe(user_key) || !is_line_safe(document_id) {
            stats.malformed += 1;
            return None;
        }
        stats.emitted += 1;
        Some(AccessEvent::new(user_key, document_id, timestamp))
    }

    /// Normalize one day file, writing triples to `out`.
    pub fn normalize_file<W: Write>(
        &self,
        day_file: &Path,
        out: &mut W,
    ) -> Result<NormalizeStats, CoaccessError> {
        let mut stats = NormalizeStats {
            files: 1,
            ..Default::default()
        };
        for entry in archive::read_day_file(day_file)? {
            if let Some(event) = self.normalize_entry(entry.as_ref(), &mut stats) {
                writeln!(out, "{}", event)?;
            }
        }
        debug!(
            file = %day_file.display(),
            entries = stats.entries,
            emitted = stats.emitted,
            "day file normalized"
        );
        Ok(stats)
    }

    /// Normalize every day file into one flat file at `output`.
    ///
    /// Day files are processed in parallel, each into its own part file; parts
    /// are concatenated in input order so the output does not depend on scheduling.
    pub fn run(&self, day_files: &[PathBuf], output: &Path) -> Result<NormalizeStats, CoaccessError> {
        info!(files = day_files.len(), output = %output.display(), "normalizing access records");

        layout::ensure_absent(output)?;
        let tmp = layout::clear_temp(output)?;
        let parts_dir = layout::clear_temp(&tmp)?;
        fs::create_dir_all(&parts_dir)?;

        let pool = rayon::ThreadPoolBuilder::new()
            .num_threads(self.workers)
            .build()
            .map_err(|e| CoaccessError::Config(format!("failed to build worker pool: {}", e)))?;

        let results: Vec<Result<Option<NormalizeStats>, CoaccessError>> = pool.install(|| {
            day_files
                .par_iter()
                .enumerate()
                .map(|(idx, day_file)| {
                    if self.cancel.is_cancelled() {
                        return Ok(None);
                    }
                    let part = parts_dir.join(format!("{:06}.part", idx));
                    let mut writer = BufWriter::new(File::create(&part)?);
                    let stats = self.normalize_file(day_file, &mut writer)?;
                    writer.flush()?;
                    Ok(Some(stats))
                })
                .collect()
        });

        let mut stats = NormalizeStats::default();
        let mut completed = 0;
        for result in results {
            if let Some(file_stats) = result? {
                stats.merge(&file_stats);
                completed += 1;
            }
        }
        if completed < day_files.len() {
            return Err(CoaccessError::Cancelled {
                stage: "normalizing",
                completed,
                total: Some(day_files.len()),
            });
        }

        let mut writer = BufWriter::new(File::create(&tmp)?);
        for idx in 0..day_files.len() {
            let mut part = File::open(parts_dir.join(format!("{:06}.part", idx)))?;
            io::copy(&mut part, &mut writer)?;
        }
        writer.flush()?;
        drop(writer);
        fs::remove_dir_all(&parts_dir)?;
        layout::publish(&tmp, output)?;

        info!(
            files = stats.files,
            entries = stats.entries,
            emitted = stats.emitted,
            skipped = stats.skipped(),
            "normalization complete"
        );
        Ok(stats)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::archive::test_support::write_day_file;
    use serde_json::json;

    fn allow() -> AllowList {
        ["1401.0001", "1401.0002", "hep-th/9901001"].into_iter().collect()
    }

    #[test]
    fn test_normalize_entry_policy() {
        let allow_list = allow();
        let normalizer = Normalizer::new(&allow_list, 1, CancelToken::new());
        let mut stats = NormalizeStats::default();

        let entry = |v| RawEntry::from_value(&v);
        let cases = vec![
            entry(json!({"arxiv_id": "1401.0001", "utc": 10, "cookie_hash": "c1", "ip_hash": "i1"})),
            entry(json!({"arxiv_id": "1401.0002", "utc": 11, "ip_hash": "i2"})),
            entry(json!({"arxiv_id": "1401.0002", "utc": 12})),
            entry(json!({"arxiv_id": "9999.9999", "utc": 13, "cookie_hash": "c3"})),
            entry(json!({"utc": 14, "cookie_hash": "c4"})),
            entry(json!({"arxiv_id": "1401.0001", "cookie_hash": "c5"})),
            entry(json!({"arxiv_id": "1401.0001", "utc": 15, "cookie_hash": "has space"})),
            None,
        ];

        let events: Vec<AccessEvent> = cases
            .iter()
            .filter_map(|e| normalizer.normalize_entry(e.as_ref(), &mut stats))
            .collect();

        assert_eq!(
            events,
            vec![
                AccessEvent::new("c1", "1401.0001", 10),
                AccessEvent::new("i2", "1401.0002", 11),
            ]
        );
        assert_eq!(stats.entries, 8);
        assert_eq!(stats.emitted, 2);
        assert_eq!(stats.no_identity, 1);
        assert_eq!(stats.unknown_document, 1);
        assert_eq!(stats.missing_fields, 2);
        assert_eq!(stats.malformed, 2);
        assert_eq!(stats.skipped(), 6);
    }

    #[test]
    fn test_run_concatenates_in_file_order() {
        let temp_dir = tempfile::tempdir().unwrap();
        let days = temp_dir.path().join("days");
        fs::create_dir(&days).unwrap();
        write_day_file(
            &days.join("140102.json.gz"),
            vec![json!({"arxiv_id": "1401.0002", "utc": 2, "cookie_hash": "b"})],
        );
        write_day_file(
            &days.join("140101.json.gz"),
            vec![
                json!({"arxiv_id": "1401.0001", "utc": 1, "cookie_hash": "a"}),
                json!({"arxiv_id": "hep-th/9901001", "utc": 3, "ip_hash": "z"}),
            ],
        );

        let allow_list = allow();
        let normalizer = Normalizer::new(&allow_list, 2, CancelToken::new());
        let files = archive::list_day_files(&days).unwrap();
        let output = temp_dir.path().join("2014_phase1.txt");
        let stats = normalizer.run(&files, &output).unwrap();

        assert_eq!(stats.files, 2);
        assert_eq!(stats.emitted, 3);
        assert_eq!(
            fs::read_to_string(&output).unwrap(),
            "a 1401.0001 1\nz hep-th/9901001 3\nb 1401.0002 2\n"
        );
        assert!(!layout::temp_path(&output).exists());
    }

    #[test]
    fn test_run_cancelled_does_not_publish() {
        let temp_dir = tempfile::tempdir().unwrap();
        let day = temp_dir.path().join("140101.json.gz");
        write_day_file(&day, vec![json!({"arxiv_id": "1401.0001", "utc": 1, "cookie_hash": "a"})]);

        let allow_list = allow();
        let cancel = CancelToken::new();
        cancel.cancel();
        let normalizer = Normalizer::new(&allow_list, 1, cancel);
        let output = temp_dir.path().join("out.txt");

        match normalizer.run(&[day], &output) {
            Err(CoaccessError::Cancelled { completed, total, .. }) => {
                assert_eq!(completed, 0);
                assert_eq!(total, Some(1));
            }
            other => panic!("expected cancellation, got {:?}", other),
        }
        assert!(!output.exists());
    }
}
