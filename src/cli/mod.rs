pub mod args;
pub mod devices;
pub mod record;
pub mod recover;

pub use args::{Cli, CliCommand, RecordCliArgs, RecoverCliArgs};
pub use devices::handle_devices_command;
pub use record::handle_record_command;
pub use recover::handle_recover_command;

use anyhow::Result;
use std::sync::Arc;

use crate::backend::{AudioBackend, NativeBackend};
use crate::global;
use crate::recovery::FileCheckpointStore;

pub(crate) fn native_backend() -> Arc<dyn AudioBackend> {
    Arc::new(NativeBackend::new())
}

pub(crate) fn checkpoint_store() -> Result<Arc<FileCheckpointStore>> {
    Ok(Arc::new(FileCheckpointStore::new(global::checkpoint_file()?)))
}
