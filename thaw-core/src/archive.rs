/*!
Snapshot archive codec.

A snapshot is a tar stream of directory and regular-file entries, compressed as a
whole into a single frame. Entry paths are relative to the cache base directory.
Headers are written with zeroed ownership and timestamps so the same staged content
always produces the same archive body.
*/

use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::io::Read;
use std::path::{Component, Path, PathBuf};

use tar::{Archive, Builder, EntryType, Header};
use tracing::warn;

use crate::compression::CompressionAdapter;
use crate::{Result, ThawError};

/// Mode recorded for staged regular files
pub const DEFAULT_FILE_MODE: u32 = 0o644;

/// Mode recorded for directories implied by staged files
pub const DEFAULT_DIR_MODE: u32 = 0o755;

const BLOCK_SIZE: usize = 512;

/// Kind of an archive entry
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EntryKind {
    Directory,
    File,
}

/// One record of a snapshot
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ArchiveEntry {
    /// Path relative to the base directory
    pub path: PathBuf,
    pub kind: EntryKind,
    /// Unix permission bits
    pub mode: u32,
    /// File content; always empty for directories
    pub content: Vec<u8>,
}

impl ArchiveEntry {
    pub fn file<P: Into<PathBuf>>(path: P, content: Vec<u8>) -> Self {
        ArchiveEntry {
            path: path.into(),
            kind: EntryKind::File,
            mode: DEFAULT_FILE_MODE,
            content,
        }
    }

    pub fn directory<P: Into<PathBuf>>(path: P) -> Self {
        ArchiveEntry {
            path: path.into(),
            kind: EntryKind::Directory,
            mode: DEFAULT_DIR_MODE,
            content: Vec::new(),
        }
    }

    pub fn with_mode(mut self, mode: u32) -> Self {
        self.mode = mode;
        self
    }

    pub fn is_dir(&self) -> bool {
        self.kind == EntryKind::Directory
    }

    pub fn size(&self) -> u64 {
        self.content.len() as u64
    }
}

/// Turn drained staging content (absolute paths) into snapshot entries.
///
/// Every ancestor directory of a staged file gets its own directory entry, and
/// directories come before files so a sequential extractor never has to guess.
/// Paths that are not under `base` are skipped and returned separately.
pub fn entries_from_staged(
    base: &Path,
    staged: HashMap<PathBuf, Vec<u8>>,
) -> (Vec<ArchiveEntry>, Vec<PathBuf>) {
    let mut files = BTreeMap::new();
    let mut directories = BTreeSet::new();
    let mut skipped = Vec::new();

    for (path, content) in staged {
        let relative = match path.strip_prefix(base) {
            Ok(rel) if !rel.as_os_str().is_empty() => rel.to_path_buf(),
            _ => {
                skipped.push(path);
                continue;
            }
        };
        for ancestor in relative.ancestors().skip(1) {
            if !ancestor.as_os_str().is_empty() {
                directories.insert(ancestor.to_path_buf());
            }
        }
        files.insert(relative, content);
    }

    let mut entries: Vec<ArchiveEntry> = directories
        .into_iter()
        .map(ArchiveEntry::directory)
        .collect();
    entries.extend(
        files
            .into_iter()
            .map(|(path, content)| ArchiveEntry::file(path, content)),
    );
    (entries, skipped)
}

/// Encodes entries into a compressed snapshot blob and back
pub struct SnapshotCodec {
    compressor: Box<dyn CompressionAdapter>,
}

impl SnapshotCodec {
    pub fn new(compressor: Box<dyn CompressionAdapter>) -> Self {
        Self { compressor }
    }

    /// The compression adapter wrapping the archive body
    pub fn compressor(&self) -> &dyn CompressionAdapter {
        self.compressor.as_ref()
    }

    /// Serialize entries into a tar body and compress it in one pass
    pub fn encode(&self, entries: &[ArchiveEntry]) -> Result<Vec<u8>> {
        let body = write_archive(entries)?;
        self.compressor.compress(&body)
    }

    /// Decompress a snapshot blob and parse its entries
    ///
    /// Any failure, from the frame to a single short entry, is reported as
    /// [`ThawError::CorruptArchive`].
    pub fn decode(&self, blob: &[u8]) -> Result<Vec<ArchiveEntry>> {
        if blob.is_empty() {
            return Err(ThawError::corrupt_archive("snapshot blob is empty"));
        }
        let body = self
            .compressor
            .decompress(blob)
            .map_err(|e| ThawError::corrupt_archive(e.to_string()))?;
        read_archive(&body)
    }
}

fn write_archive(entries: &[ArchiveEntry]) -> Result<Vec<u8>> {
    let mut builder = Builder::new(Vec::new());

    for entry in entries {
        let mut header = Header::new_gnu();
        header.set_entry_type(match entry.kind {
            EntryKind::Directory => EntryType::Directory,
            EntryKind::File => EntryType::Regular,
        });
        header.set_mode(entry.mode);
        header.set_size(entry.size());
        header.set_mtime(0);
        header.set_uid(0);
        header.set_gid(0);

        builder
            .append_data(&mut header, &entry.path, entry.content.as_slice())
            .map_err(|e| {
                ThawError::compression(format!(
                    "Failed to append {} to archive: {e}",
                    entry.path.display()
                ))
            })?;
    }

    builder
        .into_inner()
        .map_err(|e| ThawError::compression(format!("Failed to finish archive: {e}")))
}

fn read_archive(body: &[u8]) -> Result<Vec<ArchiveEntry>> {
    // The builder always terminates the stream with two zero blocks; without them
    // the body was cut short at an entry boundary.
    if body.len() < 2 * BLOCK_SIZE
        || body.len() % BLOCK_SIZE != 0
        || body[body.len() - 2 * BLOCK_SIZE..].iter().any(|b| *b != 0)
    {
        return Err(ThawError::corrupt_archive(
            "archive is truncated (missing end-of-archive marker)",
        ));
    }

    let mut archive = Archive::new(body);
    let mut entries = Vec::new();

    let iter = archive
        .entries()
        .map_err(|e| ThawError::corrupt_archive(format!("unreadable archive: {e}")))?;

    for entry in iter {
        let mut entry =
            entry.map_err(|e| ThawError::corrupt_archive(format!("bad entry header: {e}")))?;

        let entry_type = entry.header().entry_type();
        let mode = entry
            .header()
            .mode()
            .map_err(|e| ThawError::corrupt_archive(format!("bad entry mode: {e}")))?;
        let raw_path = entry
            .path()
            .map_err(|e| ThawError::corrupt_archive(format!("bad entry path: {e}")))?
            .into_owned();
        let path = sanitize_path(&raw_path)?;

        let kind = if entry_type.is_dir() {
            EntryKind::Directory
        } else if entry_type.is_file() {
            EntryKind::File
        } else {
            warn!(path = %raw_path.display(), entry_type = ?entry_type, "Skipping unsupported archive entry");
            continue;
        };

        let expected = entry.size();
        let mut content = Vec::with_capacity(expected.min(64 * 1024 * 1024) as usize);
        entry.read_to_end(&mut content).map_err(|e| {
            ThawError::corrupt_archive(format!("failed to read {}: {e}", path.display()))
        })?;
        if content.len() as u64 != expected {
            return Err(ThawError::corrupt_archive(format!(
                "entry {} is truncated: expected {expected} bytes, got {}",
                path.display(),
                content.len()
            )));
        }

        entries.push(ArchiveEntry {
            path,
            kind,
            mode: mode & 0o7777,
            content,
        });
    }

    Ok(entries)
}

/// Keep only plain relative components; anything that could escape the base
/// directory makes the archive invalid.
fn sanitize_path(raw: &Path) -> Result<PathBuf> {
    let mut clean = PathBuf::new();
    for component in raw.components() {
        match component {
            Component::Normal(part) => clean.push(part),
            Component::CurDir => {}
            Component::ParentDir | Component::RootDir | Component::Prefix(_) => {
                return Err(ThawError::corrupt_archive(format!(
                    "entry path escapes the base directory: {}",
                    raw.display()
                )));
            }
        }
    }
    if clean.as_os_str().is_empty() {
        return Err(ThawError::corrupt_archive("entry with empty path"));
    }
    Ok(clean)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::compression::{CompressionAlgorithm, GzipCompressor, ZstdCompressor};

    fn zstd_codec() -> SnapshotCodec {
        SnapshotCodec::new(Box::new(ZstdCompressor::new()))
    }

    fn sample_entries() -> Vec<ArchiveEntry> {
        vec![
            ArchiveEntry::directory("models"),
            ArchiveEntry::directory("models/v1"),
            ArchiveEntry::file("models/v1/weights.bin", vec![0u8, 1, 2, 255, 254]),
            ArchiveEntry::file("a.txt", b"1".to_vec()),
            ArchiveEntry::file("empty.txt", Vec::new()),
        ]
    }

    #[test]
    fn test_encode_decode_roundtrip() {
        let codec = zstd_codec();
        let entries = sample_entries();

        let blob = codec.encode(&entries).unwrap();
        let decoded = codec.decode(&blob).unwrap();

        assert_eq!(decoded, entries);
    }

    #[test]
    fn test_roundtrip_with_gzip() {
        let codec = SnapshotCodec::new(Box::new(GzipCompressor::new()));
        let entries = sample_entries();

        let decoded = codec.decode(&codec.encode(&entries).unwrap()).unwrap();
        assert_eq!(decoded, entries);
    }

    #[test]
    fn test_long_paths_survive() {
        let codec = zstd_codec();
        let deep = PathBuf::from("d".repeat(80)).join("e".repeat(80)).join("file.txt");
        let entries = vec![ArchiveEntry::file(deep.clone(), b"deep".to_vec())];

        let decoded = codec.decode(&codec.encode(&entries).unwrap()).unwrap();
        assert_eq!(decoded[0].path, deep);
        assert_eq!(decoded[0].content, b"deep");
    }

    #[test]
    fn test_modes_are_preserved() {
        let codec = zstd_codec();
        let entries = vec![
            ArchiveEntry::directory("private").with_mode(0o700),
            ArchiveEntry::file("private/run.sh", b"#!/bin/sh".to_vec()).with_mode(0o755),
        ];

        let decoded = codec.decode(&codec.encode(&entries).unwrap()).unwrap();
        assert_eq!(decoded[0].mode, 0o700);
        assert_eq!(decoded[1].mode, 0o755);
    }

    #[test]
    fn test_encoding_is_deterministic() {
        let codec = zstd_codec();
        let first = codec.encode(&sample_entries()).unwrap();
        let second = codec.encode(&sample_entries()).unwrap();
        assert_eq!(first, second);
    }

    #[test]
    fn test_decode_rejects_garbage_frame() {
        let codec = zstd_codec();
        let result = codec.decode(b"definitely not a zstd frame");
        assert!(matches!(result, Err(ThawError::CorruptArchive(_))));
    }

    #[test]
    fn test_decode_rejects_empty_blob() {
        let codec = zstd_codec();
        assert!(matches!(codec.decode(&[]), Err(ThawError::CorruptArchive(_))));
    }

    #[test]
    fn test_decode_rejects_truncated_archive() {
        let codec = zstd_codec();
        let blob = codec.encode(&sample_entries()).unwrap();
        let mut body = codec.compressor().decompress(&blob).unwrap();

        // Cut inside the last file entry's header area.
        body.truncate(body.len() - 2 * BLOCK_SIZE - 100);
        let truncated = codec.compressor().compress(&body).unwrap();

        assert!(matches!(codec.decode(&truncated), Err(ThawError::CorruptArchive(_))));
    }

    #[test]
    fn test_decode_rejects_archive_cut_at_entry_boundary() {
        let codec = zstd_codec();
        let blob = codec.encode(&[ArchiveEntry::file("a.txt", b"1".to_vec())]).unwrap();
        let mut body = codec.compressor().decompress(&blob).unwrap();

        // Header block plus one content block, no end-of-archive marker.
        body.truncate(2 * BLOCK_SIZE);
        let truncated = codec.compressor().compress(&body).unwrap();

        assert!(matches!(codec.decode(&truncated), Err(ThawError::CorruptArchive(_))));
    }

    #[test]
    fn test_decode_rejects_corrupted_header() {
        let codec = zstd_codec();
        let blob = codec.encode(&[ArchiveEntry::file("a.txt", b"1".to_vec())]).unwrap();
        let mut body = codec.compressor().decompress(&blob).unwrap();

        // Scribble over the name field; the header checksum no longer matches.
        body[0..5].copy_from_slice(b"XXXXX");
        let corrupted = codec.compressor().compress(&body).unwrap();

        assert!(matches!(codec.decode(&corrupted), Err(ThawError::CorruptArchive(_))));
    }

    #[test]
    fn test_decode_rejects_parent_dir_paths() {
        let mut builder = Builder::new(Vec::new());
        let mut header = Header::new_gnu();
        header.set_entry_type(EntryType::Regular);
        header.set_size(4);
        header.set_mode(0o644);
        // set_path refuses `..`, so write the raw name bytes directly.
        let name = b"../escape.txt";
        header.as_old_mut().name[..name.len()].copy_from_slice(name);
        header.set_cksum();
        builder.append(&header, &b"evil"[..]).unwrap();
        let body = builder.into_inner().unwrap();

        let codec = zstd_codec();
        let blob = codec.compressor().compress(&body).unwrap();
        assert!(matches!(codec.decode(&blob), Err(ThawError::CorruptArchive(_))));
    }

    #[test]
    fn test_entries_from_staged_adds_parent_directories() {
        let base = Path::new("/tmp");
        let mut staged = HashMap::new();
        staged.insert(PathBuf::from("/tmp/a.txt"), b"1".to_vec());
        staged.insert(PathBuf::from("/tmp/cache/x/y.bin"), b"2".to_vec());
        staged.insert(PathBuf::from("/var/elsewhere.txt"), b"3".to_vec());

        let (entries, skipped) = entries_from_staged(base, staged);

        assert_eq!(skipped, vec![PathBuf::from("/var/elsewhere.txt")]);
        let summary: Vec<(PathBuf, EntryKind)> =
            entries.iter().map(|e| (e.path.clone(), e.kind)).collect();
        assert_eq!(
            summary,
            vec![
                (PathBuf::from("cache"), EntryKind::Directory),
                (PathBuf::from("cache/x"), EntryKind::Directory),
                (PathBuf::from("a.txt"), EntryKind::File),
                (PathBuf::from("cache/x/y.bin"), EntryKind::File),
            ]
        );
    }

    #[test]
    fn test_codec_from_algorithm() {
        let codec = SnapshotCodec::new(CompressionAlgorithm::Gzip.adapter());
        assert_eq!(codec.compressor().algorithm_name(), "gzip");
    }
}
