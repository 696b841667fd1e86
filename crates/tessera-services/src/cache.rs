//! Persistent capsule cache.
//!
//! Capsules are stored by ref in a two-level directory structure:
//!   {root}/{hex[0..2]}/{algorithm}-{hex}
//!
//! This is the same layout Git uses for objects. Files are immutable:
//! if the ref exists, the content is correct. No TTLs, no invalidation.
//! Phony refs name built-in entities and are never written.

use std::fs;
use std::io::Write;
use std::path::PathBuf;

use anyhow::{Context, Result};
use memmap2::Mmap;

use tessera_core::codec;
use tessera_core::{Capsule, Ref};

#[derive(Clone)]
pub struct CapsuleCache {
    root: PathBuf,
}

impl CapsuleCache {
    /// Create a cache rooted at the given directory.
    pub fn new(root: impl Into<PathBuf>) -> Result<Self> {
        let root = root.into();
        fs::create_dir_all(&root)
            .with_context(|| format!("failed to create cache root: {}", root.display()))?;
        Ok(Self { root })
    }

    pub fn has(&self, r: &Ref) -> bool {
        self.capsule_path(r).is_some_and(|p| p.exists())
    }

    /// Read a capsule back.
    ///
    /// A file whose content no longer hashes to its ref is treated as absent
    /// and logged.
    pub fn get(&self, r: &Ref) -> Result<Option<Capsule>> {
        let Some(path) = self.capsule_path(r) else {
            return Ok(None);
        };
        if !path.exists() {
            return Ok(None);
        }

        let file = fs::File::open(&path)
            .with_context(|| format!("failed to open capsule: {}", path.display()))?;

        // Safety: file is opened read-only and we don't mutate the mmap
        let mmap = unsafe {
            Mmap::map(&file)
                .with_context(|| format!("failed to mmap capsule: {}", path.display()))?
        };

        let capsule: Capsule = codec::decode(&mmap)
            .with_context(|| format!("failed to decode capsule: {}", path.display()))?;
        if capsule.make_ref(r.hash_algorithm).ok().as_ref() != Some(r) {
            tracing::warn!(r = %r, path = %path.display(), "cached capsule does not match its ref");
            return Ok(None);
        }
        Ok(Some(capsule))
    }

    /// Store a capsule under `r`.
    ///
    /// Writes are atomic: write to temp file, then rename. If the capsule
    /// already exists, this is a no-op (immutability = idempotence).
    pub fn put(&self, r: &Ref, capsule: &Capsule) -> Result<()> {
        let Some(path) = self.capsule_path(r) else {
            return Ok(());
        };

        if path.exists() {
            return Ok(());
        }

        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent)
                .with_context(|| format!("failed to create cache dir: {}", parent.display()))?;
        }

        let data = codec::encode(capsule).context("failed to encode capsule")?;

        // Atomic write: tmp file → rename
        let tmp_path = path.with_extension("tmp");
        {
            let mut file = fs::File::create(&tmp_path)
                .with_context(|| format!("failed to create temp file: {}", tmp_path.display()))?;
            file.write_all(&data).context("failed to write capsule data")?;
            file.sync_all().context("failed to sync capsule to disk")?;
        }

        fs::rename(&tmp_path, &path).with_context(|| {
            format!(
                "failed to rename {} to {}",
                tmp_path.display(),
                path.display()
            )
        })?;

        tracing::trace!(r = %r.short(), "capsule cached");
        Ok(())
    }

    fn capsule_path(&self, r: &Ref) -> Option<PathBuf> {
        if r.is_phony() || r.hash.is_empty() {
            return None;
        }
        let hex = hex::encode(&r.hash);
        Some(
            self.root
                .join(&hex[0..2])
                .join(format!("{}-{}", r.hash_algorithm.name(), hex)),
        )
    }

    /// Count total capsules in cache (for stats/debugging).
    pub fn count(&self) -> usize {
        let mut total = 0;
        if let Ok(entries) = fs::read_dir(&self.root) {
            for entry in entries.flatten() {
                if let Ok(subdir) = fs::read_dir(entry.path()) {
                    total += subdir.count();
                }
            }
        }
        total
    }

    /// Total cache size in bytes (for stats/debugging).
    pub fn size(&self) -> u64 {
        let mut total = 0u64;
        if let Ok(entries) = fs::read_dir(&self.root) {
            for entry in entries.flatten() {
                if let Ok(subdir) = fs::read_dir(entry.path()) {
                    for file in subdir.flatten() {
                        if let Ok(meta) = file.metadata() {
                            total += meta.len();
                        }
                    }
                }
            }
        }
        total
    }
}
