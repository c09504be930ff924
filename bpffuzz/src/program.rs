//! A generated program bound to the runtime resources it needs.
//!
//! The observation map and, once the verifier accepts it, the loaded program
//! are held as [`OwnedHandle`]s. Dropping the [`Program`] releases both
//! exactly once, so every exit path of an iteration (early returns on fatal
//! errors included) leaves nothing behind.

use serde::{Deserialize, Serialize};
use std::fmt;
use std::sync::Arc;

use crate::constants::{OBSERVATION_KEY_SIZE, OBSERVATION_VALUE_SIZE};
use crate::generator::ProbeTable;
use crate::proto::RunProgramRequest;

/// A kernel object handle (a file descriptor on the machine that owns it).
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Handle(pub i64);

impl fmt::Display for Handle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "fd {}", self.0)
    }
}

/// The capability to give a handle back to the system.
pub trait Release: Send + Sync {
    fn release(&self, handle: Handle);
}

/// Shape of an array map.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct MapLayout {
    pub key_size: u32,
    pub value_size: u32,
    pub entries: u32,
}

impl MapLayout {
    /// One 64-bit slot per probe, keyed by the probe index.
    pub fn observations(entries: u32) -> Self {
        Self {
            key_size: OBSERVATION_KEY_SIZE,
            value_size: OBSERVATION_VALUE_SIZE,
            entries,
        }
    }
}

/// Allocates the kernel objects a generated program refers to.
pub trait KernelObjects: Send + Sync {
    fn create_observation_map(&self, layout: MapLayout) -> anyhow::Result<Handle>;
}

/// A handle that is released when dropped.
pub struct OwnedHandle {
    handle: Handle,
    releaser: Arc<dyn Release>,
}

impl OwnedHandle {
    pub fn new(handle: Handle, releaser: Arc<dyn Release>) -> Self {
        Self { handle, releaser }
    }

    pub fn handle(&self) -> Handle {
        self.handle
    }
}

impl fmt::Debug for OwnedHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_tuple("OwnedHandle").field(&self.handle).finish()
    }
}

impl Drop for OwnedHandle {
    fn drop(&mut self) {
        self.releaser.release(self.handle);
    }
}

/// Bytecode plus the resources needed to run it, owned by one iteration.
#[derive(Debug)]
pub struct Program {
    seed: u64,
    bytecode: Vec<u64>,
    probes: ProbeTable,
    // Dropped before the map it writes to.
    loaded: Option<OwnedHandle>,
    observation_map: OwnedHandle,
}

impl Program {
    pub(crate) fn new(
        seed: u64,
        bytecode: Vec<u64>,
        probes: ProbeTable,
        observation_map: OwnedHandle,
    ) -> Self {
        Self {
            seed,
            bytecode,
            probes,
            loaded: None,
            observation_map,
        }
    }

    /// Seed the program was generated from.
    pub fn seed(&self) -> u64 {
        self.seed
    }

    pub fn bytecode(&self) -> &[u64] {
        &self.bytecode
    }

    pub fn probes(&self) -> &ProbeTable {
        &self.probes
    }

    pub fn probe_count(&self) -> usize {
        self.probes.len()
    }

    pub fn observation_map(&self) -> Handle {
        self.observation_map.handle()
    }

    /// Takes ownership of the handle of the verified, loaded program.
    pub fn attach_loaded(&mut self, program: OwnedHandle) {
        self.loaded = Some(program);
    }

    pub fn loaded(&self) -> Option<Handle> {
        self.loaded.as_ref().map(OwnedHandle::handle)
    }

    /// Builds the execution request for this program. Returns `None` until a
    /// loaded program handle has been attached.
    pub fn run_request(&self) -> Option<RunProgramRequest> {
        let loaded = self.loaded()?;
        Some(RunProgramRequest {
            ebpf_program: self.bytecode.clone(),
            prog_fd: loaded.0,
            map_fd: self.observation_map().0,
            map_count: self.probes.len() as i32,
        })
    }
}
