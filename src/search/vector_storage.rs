//! Binary storage for one namespace's embeddings.
//!
//! File format: vectors-<namespace>.bin
//!
//! Header (49 bytes):
//! - version: u8 (1)
//! - model_id: [u8; 32] (SHA256 of the model name)
//! - dimensions: u32 (little-endian, 0 while no vector was ever stored)
//! - entry_count: u64 (little-endian)
//! - checksum: u32 (CRC32 of the preceding header bytes)
//!
//! Entries (repeated):
//! - record_id: u64 (little-endian)
//! - content_hash: u64 (little-endian)
//! - embedding: [f32; dimensions] (little-endian)

use std::fs::File;
use std::io::{BufReader, BufWriter, Read, Write};
use std::path::{Path, PathBuf};

use crate::search::vector_index::VectorSpace;

const FORMAT_VERSION: u8 = 1;

const HEADER_SIZE: usize = 49;
const CHECKSUM_OFFSET: usize = HEADER_SIZE - 4;

#[derive(Debug, thiserror::Error)]
pub enum VectorStorageError {
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Invalid file format: {0}")]
    InvalidFormat(String),

    #[error("Version mismatch: file version {0}, supported version {1}")]
    VersionMismatch(u8, u8),

    #[error("Model mismatch: file uses different model")]
    ModelMismatch,

    #[error("Checksum mismatch: file may be corrupted")]
    ChecksumMismatch,
}

#[derive(Debug, PartialEq)]
struct Header {
    model_id: [u8; 32],
    dimensions: u32,
    entry_count: u64,
}

impl Header {
    fn encode(&self) -> [u8; HEADER_SIZE] {
        let mut bytes = [0u8; HEADER_SIZE];
        bytes[0] = FORMAT_VERSION;
        bytes[1..33].copy_from_slice(&self.model_id);
        bytes[33..37].copy_from_slice(&self.dimensions.to_le_bytes());
        bytes[37..45].copy_from_slice(&self.entry_count.to_le_bytes());

        let checksum = crc32fast::hash(&bytes[..CHECKSUM_OFFSET]);
        bytes[CHECKSUM_OFFSET..].copy_from_slice(&checksum.to_le_bytes());
        bytes
    }

    fn decode(bytes: &[u8; HEADER_SIZE]) -> Result<Self, VectorStorageError> {
        let version = bytes[0];
        if version != FORMAT_VERSION {
            return Err(VectorStorageError::VersionMismatch(version, FORMAT_VERSION));
        }

        let stored = u32::from_le_bytes(le_array(&bytes[CHECKSUM_OFFSET..]));
        if stored != crc32fast::hash(&bytes[..CHECKSUM_OFFSET]) {
            return Err(VectorStorageError::ChecksumMismatch);
        }

        let mut model_id = [0u8; 32];
        model_id.copy_from_slice(&bytes[1..33]);

        Ok(Self {
            model_id,
            dimensions: u32::from_le_bytes(le_array(&bytes[33..37])),
            entry_count: u64::from_le_bytes(le_array(&bytes[37..45])),
        })
    }
}

fn le_array<const N: usize>(slice: &[u8]) -> [u8; N] {
    let mut out = [0u8; N];
    out.copy_from_slice(&slice[..N]);
    out
}

fn read_array<const N: usize>(reader: &mut impl Read) -> std::io::Result<[u8; N]> {
    let mut buf = [0u8; N];
    reader.read_exact(&mut buf)?;
    Ok(buf)
}

/// A single partition file.
pub struct VectorStorage {
    path: PathBuf,
}

impl VectorStorage {
    pub fn new(path: PathBuf) -> Self {
        Self { path }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn exists(&self) -> bool {
        self.path.exists()
    }

    /// Read the partition. Entries with a zero-norm vector are skipped.
    pub fn load(&self, expected_model_id: &[u8; 32]) -> Result<VectorSpace, VectorStorageError> {
        let mut reader = BufReader::new(File::open(&self.path)?);

        let header_bytes: [u8; HEADER_SIZE] = read_array(&mut reader)?;
        let header = Header::decode(&header_bytes)?;
        if header.model_id != *expected_model_id {
            return Err(VectorStorageError::ModelMismatch);
        }

        if header.dimensions == 0 {
            if header.entry_count > 0 {
                return Err(VectorStorageError::InvalidFormat(
                    "entries without dimensions".to_string(),
                ));
            }
            return Ok(VectorSpace::new());
        }

        let dimensions = header.dimensions as usize;
        let capacity = usize::try_from(header.entry_count).unwrap_or(0).min(1 << 20);
        let mut space = VectorSpace::with_dimensions(dimensions, capacity);

        for n in 0..header.entry_count {
            let entry = Self::read_entry(&mut reader, dimensions).map_err(|e| {
                if e.kind() == std::io::ErrorKind::UnexpectedEof {
                    VectorStorageError::InvalidFormat(format!(
                        "truncated at entry {n} of {}",
                        header.entry_count
                    ))
                } else {
                    VectorStorageError::Io(e)
                }
            })?;

            let (id, content_hash, embedding) = entry;
            if let Err(e) = space.insert(id, content_hash, embedding) {
                log::warn!("skipping stored vector {id}: {e}");
            }
        }

        Ok(space)
    }

    fn read_entry(
        reader: &mut impl Read,
        dimensions: usize,
    ) -> std::io::Result<(u64, u64, Vec<f32>)> {
        let id = u64::from_le_bytes(read_array(reader)?);
        let content_hash = u64::from_le_bytes(read_array(reader)?);

        let mut embedding = Vec::with_capacity(dimensions);
        for _ in 0..dimensions {
            embedding.push(f32::from_le_bytes(read_array(reader)?));
        }

        Ok((id, content_hash, embedding))
    }

    /// Save atomically: temp file, fsync, rename.
    pub fn save(&self, space: &VectorSpace, model_id: &[u8; 32]) -> Result<(), VectorStorageError> {
        let file_name = self
            .path
            .file_name()
            .and_then(|n| n.to_str())
            .unwrap_or("vectors.bin");
        let temp_path = self
            .path
            .with_file_name(format!("{}-{file_name}.tmp", rusty_ulid::Ulid::generate()));

        if let Err(e) = Self::write_to(&temp_path, space, model_id) {
            let _ = std::fs::remove_file(&temp_path);
            return Err(e);
        }

        std::fs::rename(&temp_path, &self.path)?;
        Ok(())
    }

    fn write_to(
        path: &Path,
        space: &VectorSpace,
        model_id: &[u8; 32],
    ) -> Result<(), VectorStorageError> {
        let dimensions = match space.dimensions() {
            Some(d) => u32::try_from(d).map_err(|_| {
                VectorStorageError::InvalidFormat(format!("{d} dimensions do not fit the header"))
            })?,
            None => 0,
        };

        let mut writer = BufWriter::new(File::create(path)?);

        let header = Header {
            model_id: *model_id,
            dimensions,
            entry_count: space.len() as u64,
        };
        writer.write_all(&header.encode())?;

        let mut entries: Vec<_> = space.iter().collect();
        entries.sort_by_key(|(id, _)| *id);

        for (id, entry) in entries {
            writer.write_all(&id.to_le_bytes())?;
            writer.write_all(&entry.content_hash.to_le_bytes())?;
            for value in &entry.embedding {
                writer.write_all(&value.to_le_bytes())?;
            }
        }

        writer.flush()?;
        let file = writer
            .into_inner()
            .map_err(|e| VectorStorageError::Io(e.into_error()))?;
        file.sync_all()?;

        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::{Seek, SeekFrom};

    fn model_id() -> [u8; 32] {
        let mut id = [0u8; 32];
        id[0] = 0xAB;
        id[31] = 0xCD;
        id
    }

    fn storage(dir: &tempfile::TempDir) -> VectorStorage {
        VectorStorage::new(dir.path().join("vectors-user.bin"))
    }

    #[test]
    fn test_header_encode_decode() {
        let header = Header {
            model_id: model_id(),
            dimensions: 384,
            entry_count: 12,
        };
        assert_eq!(Header::decode(&header.encode()).unwrap(), header);
    }

    #[test]
    fn test_save_and_load_empty() {
        let tmp = tempfile::tempdir().unwrap();
        let storage = storage(&tmp);

        storage.save(&VectorSpace::new(), &model_id()).unwrap();
        assert!(storage.exists());

        let loaded = storage.load(&model_id()).unwrap();
        assert!(loaded.is_empty());
        assert_eq!(loaded.dimensions(), None);
    }

    #[test]
    fn test_save_and_load_with_entries() {
        let tmp = tempfile::tempdir().unwrap();
        let storage = storage(&tmp);

        let mut space = VectorSpace::new();
        space.insert(1, 100, vec![1.0, 0.0, 0.0]).unwrap();
        space.insert(2, 200, vec![0.0, 1.0, 0.0]).unwrap();
        space.insert(3, 300, vec![0.0, 0.25, -1.5]).unwrap();
        storage.save(&space, &model_id()).unwrap();

        let loaded = storage.load(&model_id()).unwrap();
        assert_eq!(loaded.len(), 3);
        assert_eq!(loaded.dimensions(), Some(3));

        let entry = loaded.get(3).unwrap();
        assert_eq!(entry.content_hash, 300);
        assert_eq!(entry.embedding, vec![0.0, 0.25, -1.5]);
    }

    #[test]
    fn test_model_mismatch() {
        let tmp = tempfile::tempdir().unwrap();
        let storage = storage(&tmp);
        storage.save(&VectorSpace::new(), &model_id()).unwrap();

        let result = storage.load(&[0xFF; 32]);
        assert!(matches!(result, Err(VectorStorageError::ModelMismatch)));
    }

    #[test]
    fn test_checksum_detects_corruption() {
        let tmp = tempfile::tempdir().unwrap();
        let storage = storage(&tmp);

        let mut space = VectorSpace::new();
        space.insert(1, 100, vec![1.0, 0.0]).unwrap();
        storage.save(&space, &model_id()).unwrap();

        let mut file = std::fs::OpenOptions::new()
            .write(true)
            .open(storage.path())
            .unwrap();
        file.seek(SeekFrom::Start(10)).unwrap();
        file.write_all(&[0xFF]).unwrap();

        let result = storage.load(&model_id());
        assert!(matches!(result, Err(VectorStorageError::ChecksumMismatch)));
    }

    #[test]
    fn test_truncated_file_is_invalid() {
        let tmp = tempfile::tempdir().unwrap();
        let storage = storage(&tmp);

        let mut space = VectorSpace::new();
        space.insert(1, 100, vec![1.0, 0.0]).unwrap();
        space.insert(2, 200, vec![0.0, 1.0]).unwrap();
        storage.save(&space, &model_id()).unwrap();

        let len = std::fs::metadata(storage.path()).unwrap().len();
        let file = std::fs::OpenOptions::new()
            .write(true)
            .open(storage.path())
            .unwrap();
        file.set_len(len - 4).unwrap();

        let result = storage.load(&model_id());
        assert!(matches!(result, Err(VectorStorageError::InvalidFormat(_))));
    }

    #[test]
    fn test_failed_save_leaves_no_temp_file() {
        let tmp = tempfile::tempdir().unwrap();
        let storage = VectorStorage::new(tmp.path().join("missing").join("vectors-user.bin"));

        assert!(storage.save(&VectorSpace::new(), &model_id()).is_err());
        assert!(!tmp.path().join("missing").exists());
    }
}
