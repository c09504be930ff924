//! Saved reproduction cases.

use anyhow::{Context, Result};
use chrono::Utc;
use serde::{Deserialize, Serialize};
use std::fs::{self, File};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};

use crate::ebpf::Register;
use crate::generator::Probe;

/// Why an artifact was saved.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum ArtifactKind {
    /// The verifier predicted `predicted` for `register` after the
    /// instruction at `offset`, but the program observed `observed`.
    Divergence {
        offset: u32,
        register: Register,
        predicted: u64,
        observed: u64,
    },
    /// Every run came back without a usable observation.
    Flake { attempts: usize },
}

impl ArtifactKind {
    fn label(&self) -> &'static str {
        match self {
            ArtifactKind::Divergence { .. } => "divergence",
            ArtifactKind::Flake { .. } => "flake",
        }
    }
}

/// Everything needed to reproduce a finding.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct Artifact {
    pub kind: ArtifactKind,
    pub seed: u64,
    pub bytecode: Vec<u64>,
    pub verifier_log: String,
    /// Observed probe values; empty for flakes.
    pub observed: Vec<u64>,
    pub probes: Vec<Probe>,
}

/// Somewhere artifacts can be saved to.
pub trait ArtifactStore {
    fn save(&self, artifact: &Artifact) -> Result<()>;
}

/// Writes each artifact to its own CBOR file in a directory.
pub struct DiskArtifactStore {
    dir: PathBuf,
    sequence: AtomicU64,
}

impl DiskArtifactStore {
    /// Creates the directory if it does not exist yet.
    pub fn new(dir: impl Into<PathBuf>) -> Result<Self> {
        let dir = dir.into();
        fs::create_dir_all(&dir)
            .with_context(|| format!("failed to create artifact directory {}", dir.display()))?;
        Ok(Self {
            dir,
            sequence: AtomicU64::new(0),
        })
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    /// Reads back an artifact written by [`DiskArtifactStore::save`].
    pub fn load(path: &Path) -> Result<Artifact> {
        let file =
            File::open(path).with_context(|| format!("failed to open {}", path.display()))?;
        serde_cbor::from_reader(file).with_context(|| format!("failed to decode {}", path.display()))
    }
}

impl ArtifactStore for DiskArtifactStore {
    fn save(&self, artifact: &Artifact) -> Result<()> {
        let sequence = self.sequence.fetch_add(1, Ordering::Relaxed);
        let name = format!(
            "{}-{}-{:016x}-{sequence}.cbor",
            artifact.kind.label(),
            Utc::now().format("%Y%m%dT%H%M%S%.3fZ"),
            artifact.seed,
        );
        let path = self.dir.join(name);
        let file =
            File::create(&path).with_context(|| format!("failed to create {}", path.display()))?;
        serde_cbor::to_writer(file, artifact)
            .with_context(|| format!("failed to write {}", path.display()))
    }
}

#[cfg(test)]
pub(crate) mod testing {
    use super::*;
    use std::sync::Mutex;

    /// Keeps artifacts in memory.
    #[derive(Default)]
    pub struct MemoryStore {
        pub artifacts: Mutex<Vec<Artifact>>,
        pub fail: bool,
    }

    impl MemoryStore {
        pub fn saved(&self) -> Vec<Artifact> {
            self.artifacts.lock().unwrap().clone()
        }
    }

    impl ArtifactStore for MemoryStore {
        fn save(&self, artifact: &Artifact) -> Result<()> {
            if self.fail {
                anyhow::bail!("disk full");
            }
            self.artifacts.lock().unwrap().push(artifact.clone());
            Ok(())
        }
    }
}
