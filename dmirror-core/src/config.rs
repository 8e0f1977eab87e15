use serde::{Deserialize, Serialize};
use std::path::PathBuf;

/// Engine tunables, shared by every worker the manager creates.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SyncOptions {
    /// Bounded capacity of each worker's event queue; producers block while
    /// the queue is full.
    #[serde(default = "SyncOptions::default_queue_capacity")]
    pub queue_capacity: usize,
    /// Concurrent in-flight file copies allowed per worker.
    #[serde(default = "SyncOptions::default_copy_permits")]
    pub copy_permits: usize,
}

impl SyncOptions {
    fn default_queue_capacity() -> usize {
        10_000
    }
    fn default_copy_permits() -> usize {
        4
    }
}

impl Default for SyncOptions {
    fn default() -> Self {
        Self {
            queue_capacity: Self::default_queue_capacity(),
            copy_permits: Self::default_copy_permits(),
        }
    }
}

/// One source/targets pairing to register at startup.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MirrorSpec {
    pub source: PathBuf,
    pub targets: Vec<PathBuf>,
}

/// On-disk CLI configuration (YAML or JSON).
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct MirrorConfig {
    #[serde(default)]
    pub options: SyncOptions,
    #[serde(default)]
    pub mirrors: Vec<MirrorSpec>,
}
