//! Local file tier: memory spill files and checkpoint files.
//!
//! Checkpoint filenames encode the process id, the ordinate sort key, and
//! the timestamp so a lexicographic directory sort agrees with the semantic
//! order; "before" lookups are a glob scan plus a string compare. Spill
//! filenames only need uniqueness and carry a short random suffix.

use std::io;
use std::path::{Path, PathBuf};

use bytes::Bytes;
use rand::Rng;

use crate::cache::SpillWriter;
use crate::model::MemoryOrigin;
use crate::ordinate::Ordinate;

const CHECKPOINT_PREFIX: &str = "checkpoint";
const SPILL_PREFIX: &str = "state";
const EXT: &str = "bin";

/// A checkpoint file matched by [`CheckpointFiles::find_checkpoint_file_before`].
#[derive(Debug, Clone, PartialEq)]
pub struct CheckpointFileHit {
    pub name: String,
    pub ordinate: Ordinate,
    pub timestamp: i64,
}

/// The two local directories the core writes memory images into.
#[derive(Debug, Clone)]
pub struct CheckpointFiles {
    spill_dir: PathBuf,
    checkpoint_dir: PathBuf,
}

impl CheckpointFiles {
    pub fn new(spill_dir: impl Into<PathBuf>, checkpoint_dir: impl Into<PathBuf>) -> io::Result<Self> {
        let spill_dir = spill_dir.into();
        let checkpoint_dir = checkpoint_dir.into();
        std::fs::create_dir_all(&spill_dir)?;
        std::fs::create_dir_all(&checkpoint_dir)?;
        Ok(Self {
            spill_dir,
            checkpoint_dir,
        })
    }

    /// Write an evicted memory buffer to the spill directory.
    ///
    /// Synchronous: called from the cache eviction path which holds a lock.
    pub fn write_process_memory_file(
        &self,
        origin: &MemoryOrigin,
        bytes: &Bytes,
    ) -> io::Result<PathBuf> {
        let suffix: u32 = rand::rng().random();
        let name = format!(
            "{SPILL_PREFIX},{},{},{},{suffix:08x}.{EXT}",
            origin.process_id,
            origin.timestamp,
            encode_key(&origin.ordinate.sort_key()),
        );
        let path = self.spill_dir.join(name);
        std::fs::write(&path, bytes)?;
        Ok(path)
    }

    /// Read a spilled or checkpointed memory image by absolute path.
    pub async fn read_memory_file(&self, path: &Path) -> io::Result<Bytes> {
        Ok(Bytes::from(tokio::fs::read(path).await?))
    }

    /// Read a file by name, checking the checkpoint dir then the spill dir.
    pub async fn read_named(&self, name: &str) -> io::Result<Bytes> {
        let primary = self.checkpoint_dir.join(name);
        match tokio::fs::read(&primary).await {
            Ok(bytes) => Ok(Bytes::from(bytes)),
            Err(_) => Ok(Bytes::from(tokio::fs::read(self.spill_dir.join(name)).await?)),
        }
    }

    /// Persist a checkpoint image; the returned name sorts semantically.
    pub async fn write_checkpoint_file(
        &self,
        process_id: &str,
        ordinate: &Ordinate,
        timestamp: i64,
        bytes: &Bytes,
    ) -> io::Result<String> {
        let name = format!(
            "{CHECKPOINT_PREFIX},{process_id},{},{},{timestamp}.{EXT}",
            encode_key(&ordinate.sort_key()),
            encode_key(ordinate.as_str()),
        );
        tokio::fs::write(self.checkpoint_dir.join(&name), bytes).await?;
        Ok(name)
    }

    /// Greatest checkpoint file for a process at or before the target.
    pub fn find_checkpoint_file_before(
        &self,
        process_id: &str,
        before: &Ordinate,
    ) -> Option<CheckpointFileHit> {
        let pattern = self
            .checkpoint_dir
            .join(format!("{CHECKPOINT_PREFIX},{process_id},*.{EXT}"));
        let target_key = encode_key(&before.sort_key());
        let mut best: Option<(String, CheckpointFileHit)> = None;
        for entry in glob::glob(&pattern.to_string_lossy()).ok()?.flatten() {
            let name = entry.file_name()?.to_string_lossy().into_owned();
            let Some((key, hit)) = parse_checkpoint_name(&name, process_id) else {
                continue;
            };
            if key > target_key {
                continue;
            }
            match &best {
                Some((best_key, _)) if *best_key >= key => {}
                _ => best = Some((key, hit)),
            }
        }
        best.map(|(_, hit)| hit)
    }
}

impl SpillWriter for CheckpointFiles {
    fn spill(&self, origin: &MemoryOrigin, bytes: &Bytes) -> io::Result<PathBuf> {
        self.write_process_memory_file(origin, bytes)
    }
}

/// Make a sort key or ordinate filename-safe while preserving order:
/// every `:` maps to `.`, which keeps equal-width keys comparable.
fn encode_key(key: &str) -> String {
    key.replace(':', ".")
}

fn decode_key(key: &str) -> String {
    key.replace('.', ":")
}

fn parse_checkpoint_name(name: &str, process_id: &str) -> Option<(String, CheckpointFileHit)> {
    let body = name
        .strip_prefix(&format!("{CHECKPOINT_PREFIX},{process_id},"))?
        .strip_suffix(&format!(".{EXT}"))?;
    let mut parts = body.rsplitn(2, ',');
    let timestamp: i64 = parts.next()?.parse().ok()?;
    let rest = parts.next()?;
    let (sort_key, raw_ordinate) = rest.split_once(',')?;
    Some((
        sort_key.to_string(),
        CheckpointFileHit {
            name: name.to_string(),
            ordinate: Ordinate::new(decode_key(raw_ordinate)),
            timestamp,
        },
    ))
}
