//! Crash recovery: the checkpoint written while recording and the check that
//! runs at the next start.

pub mod checkpoint;
pub mod session;
pub mod startup;
pub mod store;

pub use checkpoint::{Checkpoint, SESSION_DIR_PREFIX};
pub use session::{CheckpointHandle, Progress, ProgressSource, RecoverySession};
pub use startup::{
    check_for_recovery, recover_artifact, repair_wav_header, resolve, RecoveryOffer,
    RecoveryOutcome, RecoverySummary, Resolution,
};
pub use store::{CheckpointError, CheckpointStore, FileCheckpointStore, MemoryCheckpointStore};
