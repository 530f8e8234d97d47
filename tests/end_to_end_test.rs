mod common;

use coaccess::cancel::CancelToken;
use coaccess::pipeline::{Pipeline, Stage};
use coaccess::reducer::OutputLayout;
use coaccess::CoaccessError;
use common::{ranking, read_tree, three_sessions, view, Fixture, A, B, C};
use std::fs;

fn allowed() -> Vec<String> {
    let mut ids = vec![A.to_string(), B.to_string(), C.to_string()];
    ids.extend((0..201).map(|i| format!("9901.{:04}", i)));
    ids
}

/// Sessions [A,B], [A,B,C], [B,C] give (A,B)=2, (A,C)=1, (B,C)=2 in both directions.
#[test]
fn test_three_session_scenario() {
    let temp_dir = tempfile::tempdir().unwrap();
    let fixture = Fixture::new(temp_dir.path(), &allowed());
    three_sessions(&fixture);

    let mut pipeline = Pipeline::new(fixture.config(), CancelToken::new());
    let report = pipeline.run().unwrap();
    assert_eq!(pipeline.stage(), Stage::Done);

    let final_dir = fixture.final_dir();
    assert_eq!(
        ranking(&final_dir.join("1401").join("1401.0001")),
        vec![(B.to_string(), 2), (C.to_string(), 1)]
    );
    assert_eq!(
        ranking(&final_dir.join("1401").join("1401.0002")),
        vec![(A.to_string(), 2), (C.to_string(), 2)]
    );
    assert_eq!(
        ranking(&final_dir.join("hep-th").join("hep-th@9901001")),
        vec![(B.to_string(), 2), (A.to_string(), 1)]
    );

    let normalize = report.normalize.unwrap();
    assert_eq!(normalize.files, 2);
    assert_eq!(normalize.entries, 11);
    assert_eq!(normalize.emitted, 8);
    assert_eq!(normalize.unknown_document, 1);
    assert_eq!(normalize.no_identity, 1);
    assert_eq!(normalize.malformed, 1);

    // u1 viewed A twice
    let dedup = report.dedup.unwrap();
    assert_eq!(dedup.retained, 7);
    assert_eq!(dedup.duplicates, 1);
    assert!(dedup.sort_runs > 1);

    let aggregate = report.aggregate.unwrap();
    assert_eq!(aggregate.expand.sessions, 3);
    assert_eq!(aggregate.expand.pairs, 5);
    assert_eq!(aggregate.neighbor_lines, 10);
    assert_eq!(aggregate.flushes, 2);

    let reduce = report.reduce.unwrap();
    assert_eq!(reduce.documents, 3);
    assert_eq!(reduce.lines_written, 6);
    assert_eq!(reduce.discarded, 0);

    assert!(!fixture.output_dir.join("2014_sort").exists());
    let saved: serde_json::Value =
        serde_json::from_str(&fs::read_to_string(fixture.output_dir.join("2014_report.json")).unwrap()).unwrap();
    assert_eq!(saved["year"], 2014);
    assert_eq!(saved["aggregate"]["neighbor_lines"], 10);
}

/// Counts summed over every output equal the neighbor lines the aggregator wrote,
/// and no ranking names its own document.
#[test]
fn test_conservation_and_no_self_references() {
    let temp_dir = tempfile::tempdir().unwrap();
    let fixture = Fixture::new(temp_dir.path(), &allowed());
    three_sessions(&fixture);

    let report = Pipeline::new(fixture.config(), CancelToken::new()).run().unwrap();
    let aggregate = report.aggregate.unwrap();

    let mut total = 0;
    for (path, content) in read_tree(&fixture.final_dir()) {
        let source = path.file_name().unwrap().to_str().unwrap().replace('@', "/");
        for line in content.lines() {
            let (neighbor, count) = line.rsplit_once(' ').unwrap();
            assert_ne!(neighbor, source, "{} lists itself", source);
            total += count.parse::<u64>().unwrap();
        }
    }
    assert_eq!(total, aggregate.neighbor_lines);
}

/// A session of 201 documents with the default cap of 200 contributes nothing.
#[test]
fn test_oversized_session_contributes_nothing() {
    let temp_dir = tempfile::tempdir().unwrap();
    let fixture = Fixture::new(temp_dir.path(), &allowed());
    three_sessions(&fixture);
    fixture.day(
        "140103.json.gz",
        (0..201).map(|i| view("crawler", &format!("9901.{:04}", i), 300 + i)).collect(),
    );

    let report = Pipeline::new(fixture.config(), CancelToken::new()).run().unwrap();

    let aggregate = report.aggregate.unwrap();
    assert_eq!(aggregate.expand.over_cap, 1);
    assert_eq!(aggregate.neighbor_lines, 10);
    assert!(!fixture.final_dir().join("9901").exists());
    assert_eq!(
        ranking(&fixture.final_dir().join("1401").join("1401.0001")),
        vec![(B.to_string(), 2), (C.to_string(), 1)]
    );
}

/// Two runs over the same archive produce byte-identical output trees.
#[test]
fn test_runs_are_deterministic() {
    let temp_dir = tempfile::tempdir().unwrap();
    let first = Fixture::new(&temp_dir.path().join("first"), &allowed());
    let second = Fixture::new(&temp_dir.path().join("second"), &allowed());
    for fixture in [&first, &second] {
        three_sessions(fixture);
        fixture.day(
            "140104.json.gz",
            (0..40)
                .map(|i| view(&format!("u{}", i % 7), &format!("9901.{:04}", i % 11), i))
                .collect(),
        );
    }

    let mut config = first.config();
    config.workers = 1;
    Pipeline::new(config, CancelToken::new()).run().unwrap();
    let mut config = second.config();
    config.workers = 4;
    config.flush_budget = 1_000;
    Pipeline::new(config, CancelToken::new()).run().unwrap();

    let first_tree = read_tree(&first.final_dir());
    assert!(!first_tree.is_empty());
    assert_eq!(first_tree, read_tree(&second.final_dir()));
}

/// No ranking is longer than top-K.
#[test]
fn test_top_k_bounds_every_ranking() {
    let temp_dir = tempfile::tempdir().unwrap();
    let fixture = Fixture::new(temp_dir.path(), &allowed());
    three_sessions(&fixture);

    let mut config = fixture.config();
    config.top_k = 1;
    let report = Pipeline::new(config, CancelToken::new()).run().unwrap();

    for (_, content) in read_tree(&fixture.final_dir()) {
        assert_eq!(content.lines().count(), 1);
    }
    assert_eq!(report.reduce.unwrap().discarded, 3);
    assert_eq!(
        ranking(&fixture.final_dir().join("1401").join("1401.0002")),
        vec![(A.to_string(), 2)]
    );
}

#[test]
fn test_per_shard_layout() {
    let temp_dir = tempfile::tempdir().unwrap();
    let fixture = Fixture::new(temp_dir.path(), &allowed());
    three_sessions(&fixture);

    let mut config = fixture.config();
    config.layout = OutputLayout::PerShard;
    Pipeline::new(config, CancelToken::new()).run().unwrap();

    assert_eq!(
        fs::read_to_string(fixture.final_dir().join("1401.txt")).unwrap(),
        format!(": {A}\n{B} 2\n{C} 1\n: {B}\n{A} 2\n{C} 2\n")
    );
    assert_eq!(
        fs::read_to_string(fixture.final_dir().join("hep-th.txt")).unwrap(),
        format!(": {C}\n{B} 2\n{A} 1\n")
    );
}

#[test]
fn test_missing_day_directory_is_a_config_error() {
    let temp_dir = tempfile::tempdir().unwrap();
    let fixture = Fixture::new(temp_dir.path(), &allowed());
    let mut config = fixture.config();
    config.year = 2015;

    let err = Pipeline::new(config, CancelToken::new()).run().unwrap_err();
    assert!(err.is_config());
    assert!(!fixture.output_dir.join("2015_phase1.txt").exists());
}

#[test]
fn test_corrupt_day_file_is_fatal() {
    let temp_dir = tempfile::tempdir().unwrap();
    let fixture = Fixture::new(temp_dir.path(), &allowed());
    three_sessions(&fixture);
    fs::write(fixture.input_root.join("2014").join("140109.json.gz"), "plain text").unwrap();

    let mut pipeline = Pipeline::new(fixture.config(), CancelToken::new());
    let err = pipeline.run().unwrap_err();
    assert!(matches!(err, CoaccessError::Data(_)), "got {}", err);
    assert_eq!(pipeline.stage(), Stage::Normalizing);
    assert!(!fixture.output_dir.join("2014_phase1.txt").exists());
}
