use std::fs;
use std::path::Path;

use stagehand::artifacts::{ArtifactCollector, compute_sha256};
use stagehand::error::ArchiveError;
use tempfile::tempdir;

fn write(root: &Path, relative: &str, contents: &str) {
    let path = root.join(relative);
    fs::create_dir_all(path.parent().unwrap()).unwrap();
    fs::write(path, contents).unwrap();
}

#[test]
fn archives_matches_preserving_layout() {
    let workspace = tempdir().unwrap();
    let archive = tempdir().unwrap();
    write(workspace.path(), "reports/junit.xml", "<testsuite/>");
    write(workspace.path(), "reports/html/index.html", "<html/>");
    write(workspace.path(), "notes.txt", "ignored");

    let collector = ArtifactCollector::new(workspace.path(), archive.path());
    let set = collector
        .archive(&["reports/**/*".to_string()], false, true)
        .unwrap();

    assert_eq!(set.file_count(), 2);
    let files = set.files("reports/**/*").unwrap();
    let sources: Vec<_> = files.iter().map(|f| f.source.clone()).collect();
    assert!(sources.contains(&Path::new("reports/html/index.html").to_path_buf()));
    for file in files {
        assert!(file.stored_at.starts_with(archive.path()));
        assert_eq!(
            fs::read(&file.stored_at).unwrap(),
            fs::read(workspace.path().join(&file.source)).unwrap()
        );
        assert_eq!(
            file.sha256.as_deref(),
            Some(compute_sha256(&file.stored_at).unwrap().as_str())
        );
    }
}

#[test]
fn allow_empty_yields_empty_set() {
    let workspace = tempdir().unwrap();
    let archive = tempdir().unwrap();
    let collector = ArtifactCollector::new(workspace.path(), archive.path());

    let set = collector
        .archive(&["dist/*.whl".to_string()], true, true)
        .unwrap();
    assert!(set.is_empty());
    assert_eq!(set.patterns().collect::<Vec<_>>(), vec!["dist/*.whl"]);
}

#[test]
fn empty_match_without_allow_empty_copies_nothing() {
    let workspace = tempdir().unwrap();
    let archive = tempdir().unwrap();
    write(workspace.path(), "build.log", "ok");
    let collector = ArtifactCollector::new(workspace.path(), archive.path().join("run"));

    let err = collector
        .archive(
            &["build.log".to_string(), "missing/*".to_string()],
            false,
            false,
        )
        .unwrap_err();
    assert!(matches!(err, ArchiveError::NoMatches { ref pattern } if pattern == "missing/*"));
    assert!(!archive.path().join("run").exists());
}

#[test]
fn invalid_pattern_is_reported() {
    let workspace = tempdir().unwrap();
    let collector = ArtifactCollector::new(workspace.path(), workspace.path().join("out"));
    let err = collector
        .archive(&["[oops".to_string()], true, false)
        .unwrap_err();
    assert!(matches!(err, ArchiveError::InvalidPattern { .. }));
}

#[test]
fn fingerprint_can_be_disabled() {
    let workspace = tempdir().unwrap();
    write(workspace.path(), "app.bin", "binary");
    let collector = ArtifactCollector::new(workspace.path(), workspace.path().join("archive"));
    let set = collector
        .archive(&["*.bin".to_string()], false, false)
        .unwrap();
    let file = &set.files("*.bin").unwrap()[0];
    assert!(file.sha256.is_none());
    assert_eq!(file.size, 6);
}
