use std::collections::BTreeMap;
use std::fs::{self, File};
use std::io::{BufReader, Read};
use std::path::{Path, PathBuf};

use glob::{MatchOptions, Pattern, glob_with};
use serde::Serialize;
use sha2::{Digest, Sha256};
use tracing::{debug, info};

use crate::error::ArchiveError;

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ArchivedFile {
    /// Path relative to the workspace.
    pub source: PathBuf,
    pub stored_at: PathBuf,
    pub size: u64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub sha256: Option<String>,
}

/// Files captured by one archive call, keyed by the pattern that matched
/// them. Read-only once returned from the collector.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct ArtifactSet {
    entries: BTreeMap<String, Vec<ArchivedFile>>,
}

impl ArtifactSet {
    pub fn files(&self, pattern: &str) -> Option<&[ArchivedFile]> {
        self.entries.get(pattern).map(Vec::as_slice)
    }

    pub fn patterns(&self) -> impl Iterator<Item = &str> {
        self.entries.keys().map(String::as_str)
    }

    pub fn file_count(&self) -> usize {
        self.entries.values().map(Vec::len).sum()
    }

    pub fn is_empty(&self) -> bool {
        self.file_count() == 0
    }

    pub(crate) fn merge(&mut self, other: ArtifactSet) {
        for (pattern, files) in other.entries {
            self.entries.entry(pattern).or_default().extend(files);
        }
    }
}

#[derive(Debug, Clone)]
pub struct ArtifactCollector {
    workspace: PathBuf,
    destination: PathBuf,
    excluded: Vec<PathBuf>,
}

impl ArtifactCollector {
    /// Files under `destination` never match, so archiving into the
    /// workspace does not pick up its own output.
    pub fn new(workspace: impl Into<PathBuf>, destination: impl Into<PathBuf>) -> Self {
        let destination = destination.into();
        Self {
            workspace: workspace.into(),
            excluded: vec![destination.clone()],
            destination,
        }
    }

    /// Skips every match below `path` (for example the archive root shared
    /// by earlier runs).
    pub fn excluding(mut self, path: impl Into<PathBuf>) -> Self {
        self.excluded.push(path.into());
        self
    }

    pub fn destination(&self) -> &Path {
        &self.destination
    }

    /// Resolves every pattern before copying anything, so an empty match
    /// with `allow_empty == false` leaves the archive untouched.
    pub fn archive(
        &self,
        patterns: &[String],
        allow_empty: bool,
        fingerprint: bool,
    ) -> Result<ArtifactSet, ArchiveError> {
        let mut resolved = Vec::with_capacity(patterns.len());
        for pattern in patterns {
            let matches = expand_pattern_excluding(&self.workspace, pattern, &self.excluded)
                .map_err(|source| ArchiveError::InvalidPattern {
                    pattern: pattern.clone(),
                    source,
                })?;
            if matches.is_empty() && !allow_empty {
                return Err(ArchiveError::NoMatches {
                    pattern: pattern.clone(),
                });
            }
            resolved.push((pattern.clone(), matches));
        }

        let mut set = ArtifactSet::default();
        for (pattern, matches) in resolved {
            let mut files = Vec::with_capacity(matches.len());
            for path in matches {
                files.push(self.copy_file(&path, fingerprint)?);
            }
            info!(pattern = %pattern, files = files.len(), "Archived artifacts");
            set.entries.insert(pattern, files);
        }
        Ok(set)
    }

    fn copy_file(&self, path: &Path, fingerprint: bool) -> Result<ArchivedFile, ArchiveError> {
        let relative = path
            .strip_prefix(&self.workspace)
            .map(Path::to_path_buf)
            .unwrap_or_else(|_| PathBuf::from(path.file_name().unwrap_or(path.as_os_str())));
        let stored_at = self.destination.join(&relative);
        let io_err = |source| ArchiveError::Io {
            path: path.to_path_buf(),
            source,
        };

        if let Some(parent) = stored_at.parent() {
            fs::create_dir_all(parent).map_err(io_err)?;
        }
        let size = fs::copy(path, &stored_at).map_err(io_err)?;
        let sha256 = if fingerprint {
            Some(compute_sha256(path).map_err(io_err)?)
        } else {
            None
        };
        debug!(source = %relative.display(), size, "Artifact copied");

        Ok(ArchivedFile {
            source: relative,
            stored_at,
            size,
            sha256,
        })
    }
}

/// Expands `pattern` relative to `base`, returning regular files only.
pub fn expand_pattern(base: &Path, pattern: &str) -> Result<Vec<PathBuf>, glob::PatternError> {
    expand_pattern_excluding(base, pattern, &[])
}

/// Like [`expand_pattern`], but drops matches that live under any of the
/// `excluded` directories.
pub fn expand_pattern_excluding(
    base: &Path,
    pattern: &str,
    excluded: &[PathBuf],
) -> Result<Vec<PathBuf>, glob::PatternError> {
    let full = if Path::new(pattern).is_absolute() {
        pattern.to_string()
    } else {
        let escaped = Pattern::escape(&base.to_string_lossy());
        format!("{}/{}", escaped.trim_end_matches('/'), pattern)
    };
    let options = MatchOptions {
        case_sensitive: true,
        require_literal_separator: true,
        require_literal_leading_dot: false,
    };
    let mut files: Vec<PathBuf> = glob_with(&full, options)?
        .filter_map(Result::ok)
        .filter(|path| path.is_file())
        .filter(|path| !excluded.iter().any(|dir| path.starts_with(dir)))
        .collect();
    files.sort();
    Ok(files)
}

pub fn compute_sha256(path: &Path) -> std::io::Result<String> {
    let mut reader = BufReader::new(File::open(path)?);
    let mut hasher = Sha256::new();
    let mut buffer = [0u8; 8192];

    loop {
        let read = reader.read(&mut buffer)?;
        if read == 0 {
            break;
        }
        hasher.update(&buffer[..read]);
    }

    Ok(format!("{:x}", hasher.finalize()))
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    #[test]
    fn compute_sha256_is_stable() {
        let temp = tempdir().unwrap();
        let path = temp.path().join("digest.bin");
        fs::write(&path, b"abc").unwrap();
        assert_eq!(
            compute_sha256(&path).unwrap(),
            "ba7816bf8f01cfea414140de5dae2223b00361a396177a9cb410ff61f20015ad"
        );
    }

    #[test]
    fn expand_skips_directories() {
        let temp = tempdir().unwrap();
        fs::create_dir_all(temp.path().join("reports/nested")).unwrap();
        fs::write(temp.path().join("reports/a.xml"), "a").unwrap();
        fs::write(temp.path().join("reports/nested/b.xml"), "b").unwrap();

        let files = expand_pattern(temp.path(), "reports/**/*").unwrap();
        assert_eq!(files.len(), 2);
        assert!(files.iter().all(|p| p.is_file()));
    }

    #[test]
    fn excluded_directories_never_match() {
        let temp = tempdir().unwrap();
        fs::create_dir_all(temp.path().join(".stagehand/archive/run-1/reports")).unwrap();
        fs::create_dir_all(temp.path().join("reports")).unwrap();
        fs::write(temp.path().join("reports/junit.xml"), "fresh").unwrap();
        fs::write(
            temp.path().join(".stagehand/archive/run-1/reports/junit.xml"),
            "stale",
        )
        .unwrap();

        let archive = temp.path().join(".stagehand/archive");
        let files = expand_pattern_excluding(temp.path(), "**/junit.xml", &[archive]).unwrap();
        assert_eq!(files, vec![temp.path().join("reports/junit.xml")]);
        assert_eq!(expand_pattern(temp.path(), "**/junit.xml").unwrap().len(), 2);
    }
}
