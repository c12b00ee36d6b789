//! Disk-backed blob storage.
//!
//! Layout under the storage directory:
//!   blob-<digest>.bin  committed blob, named by a digest prefix and served
//!                      through a read-only mmap
//!   blob.bin.tmp       inbound update, written strictly in order
//!   blob.bin.new       local publish in progress
//!   manifest.toml      version, length, blake3 digest and file name of the
//!                      committed blob
//!
//! The manifest rename is the single commit point. New bytes land under a
//! fresh name first, the manifest is switched to them, and only then is the
//! previous file removed. A crash at any point leaves the manifest naming a
//! file that matches it. Opening verifies the digest regardless.

use std::fs::{self, File};
use std::io::Write;
use std::path::{Path, PathBuf};

use memmap2::Mmap;
use serde::{Deserialize, Serialize};

use super::{BlobStorage, StorageError};
use crate::blob_sync::BlobVersion;

const TMP_FILE: &str = "blob.bin.tmp";
const PUBLISH_FILE: &str = "blob.bin.new";
const MANIFEST_FILE: &str = "manifest.toml";

/// Advertise metadata for this backend is the raw blake3 digest.
pub const DIGEST_LEN: usize = 32;

/// What is committed, and where.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Manifest {
    pub version: i32,
    pub length: u32,
    /// Hex blake3 digest of the blob.
    pub checksum: String,
    /// Blob file name inside the storage directory. Empty when nothing has
    /// been committed.
    #[serde(default)]
    pub file: String,
}

impl Manifest {
    fn empty() -> Self {
        Self {
            version: BlobVersion::EMPTY.version,
            length: 0,
            checksum: blake3::hash(&[]).to_hex().to_string(),
            file: String::new(),
        }
    }

    fn new(version: i32, length: u32, digest: &blake3::Hash) -> Self {
        let checksum = digest.to_hex().to_string();
        let file = format!("blob-{}.bin", &checksum[..16]);
        Self { version, length, checksum, file }
    }

    fn digest(&self) -> Result<[u8; DIGEST_LEN], StorageError> {
        let raw = hex::decode(&self.checksum)
            .map_err(|e| StorageError::Manifest(format!("bad checksum: {e}")))?;
        raw.try_into()
            .map_err(|_| StorageError::Manifest("checksum is not 32 bytes".into()))
    }

    fn blob_path(&self, dir: &Path) -> Result<Option<PathBuf>, StorageError> {
        if self.file.is_empty() {
            return Ok(None);
        }
        if self.file.contains(|c: char| c == '/' || c == '\\') || self.file.starts_with('.') {
            return Err(StorageError::Manifest(format!("bad blob file name {:?}", self.file)));
        }
        Ok(Some(dir.join(&self.file)))
    }
}

struct Incoming {
    version: i32,
    total: u32,
    expected: [u8; DIGEST_LEN],
    file: File,
    hasher: blake3::Hasher,
    written: u32,
}

/// Blob storage rooted at a directory.
pub struct FileStorage {
    dir: PathBuf,
    manifest: Manifest,
    digest: [u8; DIGEST_LEN],
    map: Option<Mmap>,
    incoming: Option<Incoming>,
}

impl FileStorage {
    /// Open (creating if needed) the storage directory, map the committed
    /// blob and check it against the manifest digest. Leftovers of an
    /// interrupted update or publish are removed.
    pub fn open(dir: impl Into<PathBuf>) -> Result<Self, StorageError> {
        let dir = dir.into();
        fs::create_dir_all(&dir)?;
        let _ = fs::remove_file(dir.join(TMP_FILE));

        let manifest = read_manifest(&dir)?;
        let (digest, map) = load_blob(&dir, &manifest)?;
        remove_stale_blobs(&dir, &manifest.file);

        tracing::debug!(
            dir = %dir.display(),
            version = manifest.version,
            length = manifest.length,
            "blob storage opened"
        );
        Ok(Self {
            dir,
            manifest,
            digest,
            map,
            incoming: None,
        })
    }

    /// Atomically commit `data` as `version` under `dir` and return the new
    /// manifest. The caller reopens or announces the version.
    pub fn publish(dir: &Path, version: i32, data: &[u8]) -> Result<Manifest, StorageError> {
        fs::create_dir_all(dir)?;
        let length = u32::try_from(data.len()).map_err(|_| StorageError::Capacity {
            what: "blob",
            needed: data.len(),
            available: u32::MAX as usize,
        })?;

        let staged = dir.join(PUBLISH_FILE);
        {
            let mut file = File::create(&staged)?;
            file.write_all(data)?;
            file.sync_all()?;
        }
        let previous = read_manifest(dir).ok();
        let manifest = Manifest::new(version, length, &blake3::hash(data));
        commit(dir, &staged, &manifest, previous.as_ref())?;
        tracing::info!(version, length, checksum = %manifest.checksum, "blob published");
        Ok(manifest)
    }

    /// Read the manifest committed under `dir` without mapping the blob.
    /// A directory with no manifest reads as the empty version.
    pub fn stored_manifest(dir: &Path) -> Result<Manifest, StorageError> {
        read_manifest(dir)
    }

    /// Pick up a blob published into the directory by another process.
    /// Leaves this storage untouched on error. An inbound update in
    /// progress is kept; the caller decides whether to abort it.
    pub fn reload(&mut self) -> Result<BlobVersion, StorageError> {
        let manifest = read_manifest(&self.dir)?;
        let (digest, map) = load_blob(&self.dir, &manifest)?;
        self.manifest = manifest;
        self.digest = digest;
        self.map = map;
        Ok(self.local())
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    pub fn manifest(&self) -> &Manifest {
        &self.manifest
    }

    /// The committed version, for seeding [`BlobSync::new`](crate::BlobSync::new).
    pub fn local(&self) -> BlobVersion {
        BlobVersion::new(self.manifest.version, self.manifest.length)
    }

    /// Committed bytes.
    pub fn contents(&self) -> &[u8] {
        match &self.map {
            Some(map) => &map[..self.manifest.length as usize],
            None => &[],
        }
    }
}

fn read_manifest(dir: &Path) -> Result<Manifest, StorageError> {
    let path = dir.join(MANIFEST_FILE);
    if !path.exists() {
        return Ok(Manifest::empty());
    }
    let text = fs::read_to_string(&path)?;
    toml::from_str(&text).map_err(|e| StorageError::Manifest(e.to_string()))
}

fn write_manifest(dir: &Path, manifest: &Manifest) -> Result<(), StorageError> {
    let text = toml::to_string(manifest).map_err(|e| StorageError::Manifest(e.to_string()))?;
    let path = dir.join(MANIFEST_FILE);
    let tmp = path.with_extension("toml.tmp");
    {
        let mut file = File::create(&tmp)?;
        file.write_all(text.as_bytes())?;
        file.sync_all()?;
    }
    fs::rename(&tmp, &path)?;
    Ok(())
}

/// Move `staged` under the name `manifest` gives it, switch the manifest
/// over, then drop the file the previous manifest named.
fn commit(
    dir: &Path,
    staged: &Path,
    manifest: &Manifest,
    previous: Option<&Manifest>,
) -> Result<(), StorageError> {
    let target = manifest
        .blob_path(dir)?
        .ok_or_else(|| StorageError::Manifest("commit without a blob file".into()))?;
    fs::rename(staged, &target)?;
    write_manifest(dir, manifest)?;

    if let Some(old) = previous.filter(|old| !old.file.is_empty() && old.file != manifest.file) {
        if let Ok(Some(path)) = old.blob_path(dir) {
            let _ = fs::remove_file(path);
        }
    }
    Ok(())
}

/// Map the blob `manifest` names and check its length and digest.
fn load_blob(
    dir: &Path,
    manifest: &Manifest,
) -> Result<([u8; DIGEST_LEN], Option<Mmap>), StorageError> {
    let digest = manifest.digest()?;
    let map = map_blob(dir, manifest)?;
    let contents = match &map {
        Some(map) => &map[..manifest.length as usize],
        None => &[][..],
    };
    let actual = blake3::hash(contents);
    if actual.as_bytes() != &digest {
        return Err(StorageError::ChecksumMismatch {
            expected: manifest.checksum.clone(),
            actual: actual.to_hex().to_string(),
        });
    }
    Ok((digest, map))
}

fn map_blob(dir: &Path, manifest: &Manifest) -> Result<Option<Mmap>, StorageError> {
    if manifest.length == 0 {
        return Ok(None);
    }
    let path = manifest
        .blob_path(dir)?
        .ok_or_else(|| StorageError::Manifest("no blob file for a non-empty blob".into()))?;
    let file = File::open(&path)?;
    // Safety: opened read-only; committed blob files are never written in
    // place, only created by rename and later unlinked.
    let map = unsafe { Mmap::map(&file)? };
    if map.len() < manifest.length as usize {
        return Err(StorageError::Manifest(format!(
            "{} holds {} bytes but the manifest says {}",
            manifest.file,
            map.len(),
            manifest.length
        )));
    }
    Ok(Some(map))
}

/// Remove blob files the manifest does not name: the result of a crash
/// between staging a blob and switching the manifest.
fn remove_stale_blobs(dir: &Path, keep: &str) {
    let Ok(entries) = fs::read_dir(dir) else {
        return;
    };
    for entry in entries.flatten() {
        let name = entry.file_name();
        let Some(name) = name.to_str() else {
            continue;
        };
        if name.starts_with("blob-") && name.ends_with(".bin") && name != keep {
            tracing::debug!(file = name, "removing uncommitted blob");
            let _ = fs::remove_file(entry.path());
        }
    }
}

impl BlobStorage for FileStorage {
    fn start_update(
        &mut self,
        total_len: u32,
        version: i32,
        metadata: &[u8],
    ) -> Result<(), StorageError> {
        let expected: [u8; DIGEST_LEN] = metadata.try_into().map_err(|_| {
            StorageError::Rejected(format!(
                "expected a {DIGEST_LEN}-byte digest, got {} bytes of metadata",
                metadata.len()
            ))
        })?;
        self.on_abort();
        let file = File::create(self.dir.join(TMP_FILE))?;
        self.incoming = Some(Incoming {
            version,
            total: total_len,
            expected,
            file,
            hasher: blake3::Hasher::new(),
            written: 0,
        });
        Ok(())
    }

    fn receive_chunk(&mut self, chunk: &[u8]) -> Result<(), StorageError> {
        let incoming = self.incoming.as_mut().ok_or(StorageError::NoUpdate)?;
        if u64::from(incoming.written) + chunk.len() as u64 > u64::from(incoming.total) {
            return Err(StorageError::Overrun(incoming.total));
        }
        incoming.file.write_all(chunk)?;
        incoming.hasher.update(chunk);
        incoming.written += chunk.len() as u32;
        Ok(())
    }

    fn on_abort(&mut self) {
        if self.incoming.take().is_some() {
            let _ = fs::remove_file(self.dir.join(TMP_FILE));
        }
    }

    fn on_complete(&mut self) -> Result<(), StorageError> {
        let incoming = self.incoming.take().ok_or(StorageError::NoUpdate)?;
        let tmp = self.dir.join(TMP_FILE);

        let actual = incoming.hasher.finalize();
        if actual.as_bytes() != &incoming.expected {
            let _ = fs::remove_file(&tmp);
            return Err(StorageError::ChecksumMismatch {
                expected: hex::encode(incoming.expected),
                actual: actual.to_hex().to_string(),
            });
        }
        incoming.file.sync_all()?;
        drop(incoming.file);

        let manifest = Manifest::new(incoming.version, incoming.total, &actual);
        commit(&self.dir, &tmp, &manifest, Some(&self.manifest))?;

        self.map = map_blob(&self.dir, &manifest)?;
        self.digest = incoming.expected;
        self.manifest = manifest;
        tracing::debug!(version = self.manifest.version, "blob committed to disk");
        Ok(())
    }

    fn provide_chunk(&self, offset: u32, buf: &mut [u8]) -> Result<(), StorageError> {
        let contents = self.contents();
        let start = offset as usize;
        let end = start + buf.len();
        if end > contents.len() {
            return Err(StorageError::OutOfRange {
                offset,
                len: buf.len(),
                committed: self.manifest.length,
            });
        }
        buf.copy_from_slice(&contents[start..end]);
        Ok(())
    }

    fn provide_metadata(&self, buf: &mut [u8]) -> Result<usize, StorageError> {
        if buf.len() < DIGEST_LEN {
            return Err(StorageError::Capacity {
                what: "digest",
                needed: DIGEST_LEN,
                available: buf.len(),
            });
        }
        buf[..DIGEST_LEN].copy_from_slice(&self.digest);
        Ok(DIGEST_LEN)
    }
}
