//! Content identification: streaming SHA-256 of a resolved artifact.

use std::fs::File;
use std::io::{self, Read};
use std::path::Path;

use sha2::{Digest, Sha256};
use tracing::warn;

use crate::model::WorkItem;
use crate::telemetry::metrics;

/// Read size per hashing step. Memory use is bounded by this, not the file.
const CHUNK_SIZE: usize = 1024 * 1024;

/// Identity assigned to an artifact's content.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ContentId {
    /// Hash computed from the bytes on disk.
    Computed(String),
    /// The file couldn't be read; the hash the sensor logged stands in.
    Logged(String),
    /// Neither a computed nor a logged hash is available.
    Unknown,
}

impl ContentId {
    /// Hex digest, if one is known.
    pub fn hash(&self) -> Option<&str> {
        match self {
            ContentId::Computed(h) | ContentId::Logged(h) => Some(h),
            ContentId::Unknown => None,
        }
    }
}

impl std::fmt::Display for ContentId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.hash().unwrap_or("unknown"))
    }
}

/// Lowercase hex SHA-256 of a file, read in fixed-size chunks.
pub fn sha256_file(path: &Path) -> io::Result<String> {
    let mut file = File::open(path)?;
    let mut hasher = Sha256::new();
    let mut buf = vec![0u8; CHUNK_SIZE];
    loop {
        let n = file.read(&mut buf)?;
        if n == 0 {
            break;
        }
        hasher.update(&buf[..n]);
    }
    Ok(hex::encode(hasher.finalize()))
}

/// Identify the artifact at `path`, degrading to the item's logged hash.
///
/// Never fails: a read error is logged and the fallback identity returned.
pub fn identify(path: &Path, item: &WorkItem) -> ContentId {
    match sha256_file(path) {
        Ok(hash) => ContentId::Computed(hash),
        Err(e) => {
            metrics::hash_fallbacks().add(1, &[]);
            let fallback = item
                .logged_hash
                .as_deref()
                .filter(|h| !h.is_empty())
                .map(|h| ContentId::Logged(h.to_ascii_lowercase()))
                .unwrap_or(ContentId::Unknown);
            warn!(
                id = %item.id,
                path = %path.display(),
                error = %e,
                fallback = %fallback,
                "content hash failed, using fallback"
            );
            fallback
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::{Status, WorkId};
    use chrono::Utc;
    use std::io::Write;

    fn item(logged_hash: Option<&str>) -> WorkItem {
        let now = Utc::now();
        WorkItem {
            id: WorkId(5),
            event_type: crate::model::ARTIFACT_OBSERVED.to_string(),
            source_ip: "10.0.0.2".into(),
            filename_hint: Some("dropper.exe".into()),
            stored_name_hint: None,
            logged_hash: logged_hash.map(str::to_string),
            status: Status::Claimed,
            lease_until: None,
            claimed_by: Some("w".into()),
            attempts: 1,
            retry_after: None,
            content_hash: None,
            task_ref: None,
            engine_response: None,
            duplicate_of: None,
            last_error: None,
            created_at: now,
            updated_at: now,
        }
    }

    #[test]
    fn known_digest() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        file.write_all(b"abc").unwrap();
        assert_eq!(
            sha256_file(file.path()).unwrap(),
            "ba7816bf8f01cfea414140de5dae2223b00361a396177a9cb410ff61f20015ad"
        );
    }

    #[test]
    fn multi_chunk_file_matches_one_shot_digest() {
        let data: Vec<u8> = (0..(CHUNK_SIZE * 2 + 17)).map(|i| (i % 251) as u8).collect();
        let mut file = tempfile::NamedTempFile::new().unwrap();
        file.write_all(&data).unwrap();

        let expected = hex::encode(Sha256::digest(&data));
        assert_eq!(sha256_file(file.path()).unwrap(), expected);
    }

    #[test]
    fn empty_hash_renders_as_unknown() {
        assert_eq!(ContentId::Unknown.to_string(), "unknown");
        assert_eq!(ContentId::Unknown.hash(), None);
        assert_eq!(ContentId::Logged("ab".into()).hash(), Some("ab"));
    }

    #[test]
    fn readable_file_is_computed() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        file.write_all(b"abc").unwrap();
        assert_eq!(
            identify(file.path(), &item(Some("ffff"))),
            ContentId::Computed(
                "ba7816bf8f01cfea414140de5dae2223b00361a396177a9cb410ff61f20015ad".into()
            )
        );
    }

    #[test]
    fn unreadable_file_falls_back_to_lowercased_logged_hash() {
        let dir = tempfile::tempdir().unwrap();
        let gone = dir.path().join("vanished.bin");
        assert_eq!(
            identify(&gone, &item(Some("DEADBEEF"))),
            ContentId::Logged("deadbeef".into())
        );
    }

    #[test]
    fn unreadable_file_without_logged_hash_is_unknown() {
        let dir = tempfile::tempdir().unwrap();
        let gone = dir.path().join("vanished.bin");
        assert_eq!(identify(&gone, &item(None)), ContentId::Unknown);
        assert_eq!(identify(&gone, &item(Some(""))), ContentId::Unknown);
        // A directory opens but can't be read as a file.
        assert_eq!(identify(dir.path(), &item(None)), ContentId::Unknown);
    }
}
