pub mod clock;
pub mod orchestrator;
pub mod status;

pub use clock::SessionClock;
pub use orchestrator::{OrchestratorOptions, RecordingOrchestrator, StopReport};
pub use status::{RecordingState, StateSnapshot};
