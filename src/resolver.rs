//! Artifact resolution: find the bytes on disk that a work item describes.
//!
//! Sensors record several hints about where they stored an artifact, none of
//! them guaranteed. Strategies run in a fixed order and the first file that
//! exists wins.

use std::fs;
use std::path::{Path, PathBuf};
use std::time::SystemTime;

use tracing::debug;

use crate::identify::sha256_file;
use crate::model::WorkItem;

/// Longest sanitized filename stub matched against directory entries.
const STUB_LEN: usize = 50;

/// Extension sensors append to hash-named artifacts.
const HASH_EXTENSION: &str = "bin";

/// Which strategy located the artifact.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Strategy {
    StoredName,
    HashName,
    FilenameScan,
    HashScan,
}

/// A located artifact.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Resolved {
    pub path: PathBuf,
    pub strategy: Strategy,
}

#[derive(Debug, Clone)]
pub struct ArtifactResolver {
    dir: PathBuf,
    scan_limit: usize,
}

impl ArtifactResolver {
    pub fn new(dir: impl Into<PathBuf>, scan_limit: usize) -> Self {
        Self {
            dir: dir.into(),
            scan_limit,
        }
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    /// Locate the artifact for `item`. `None` means it can't be found, which
    /// is permanent for that item.
    pub fn resolve(&self, item: &WorkItem) -> Option<Resolved> {
        if !self.dir.is_dir() {
            debug!(dir = %self.dir.display(), "artifact directory missing");
            return None;
        }

        let logged_hash = item
            .logged_hash
            .as_deref()
            .map(str::trim)
            .filter(|h| !h.is_empty())
            .map(str::to_ascii_lowercase);

        if let Some(path) = item
            .stored_name_hint
            .as_deref()
            .and_then(|name| self.direct(name))
        {
            return Some(Resolved {
                path,
                strategy: Strategy::StoredName,
            });
        }

        if let Some(hash) = &logged_hash {
            let candidates = [hash.clone(), format!("{hash}.{HASH_EXTENSION}")];
            if let Some(path) = candidates.iter().find_map(|name| self.direct(name)) {
                return Some(Resolved {
                    path,
                    strategy: Strategy::HashName,
                });
            }
        }

        let stub = item
            .filename_hint
            .as_deref()
            .map(str::trim)
            .filter(|n| !n.is_empty())
            .map(sanitize_stub);
        if stub.is_none() && logged_hash.is_none() {
            return None;
        }

        let recent = self.recent_files();

        if let Some(stub) = stub.filter(|s| !s.is_empty()) {
            let hit = recent.iter().find(|p| {
                p.file_name()
                    .and_then(|n| n.to_str())
                    .is_some_and(|n| n.contains(&stub))
            });
            if let Some(path) = hit {
                return Some(Resolved {
                    path: path.clone(),
                    strategy: Strategy::FilenameScan,
                });
            }
        }

        if let Some(hash) = &logged_hash {
            let hit = recent
                .iter()
                .find(|p| sha256_file(p).is_ok_and(|h| &h == hash));
            if let Some(path) = hit {
                return Some(Resolved {
                    path: path.clone(),
                    strategy: Strategy::HashScan,
                });
            }
        }

        None
    }

    /// `<dir>/<name>` if it exists. Only the final component of `name` is
    /// used, so a hint can't point outside the artifact directory.
    fn direct(&self, name: &str) -> Option<PathBuf> {
        let name = Path::new(name.trim()).file_name()?;
        let path = self.dir.join(name);
        path.exists().then_some(path)
    }

    /// Regular files in the directory, most recently modified first, capped
    /// at the scan limit.
    fn recent_files(&self) -> Vec<PathBuf> {
        let Ok(entries) = fs::read_dir(&self.dir) else {
            return Vec::new();
        };

        let mut files: Vec<(SystemTime, PathBuf)> = entries
            .filter_map(|entry| entry.ok())
            .filter_map(|entry| {
                let meta = entry.metadata().ok()?;
                if !meta.is_file() {
                    return None;
                }
                let modified = meta.modified().unwrap_or(SystemTime::UNIX_EPOCH);
                Some((modified, entry.path()))
            })
            .collect();

        files.sort_by(|a, b| b.0.cmp(&a.0));
        files
            .into_iter()
            .take(self.scan_limit)
            .map(|(_, path)| path)
            .collect()
    }
}

/// Filesystem-safe stub of an original filename: characters other than
/// alphanumerics and `._-` become `_`, truncated to [`STUB_LEN`] chars.
pub fn sanitize_stub(name: &str) -> String {
    name.chars()
        .map(|c| {
            if c.is_alphanumeric() || matches!(c, '.' | '_' | '-') {
                c
            } else {
                '_'
            }
        })
        .take(STUB_LEN)
        .collect()
}
