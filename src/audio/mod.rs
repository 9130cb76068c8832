pub mod amplitude;
pub mod artifact;
pub mod audio_mixer;
pub mod audio_source;
pub mod external_source;
pub mod local_source;
pub mod strategy;

pub use amplitude::{AmplitudeFrame, AmplitudeSample, AmplitudeTracker};
pub use artifact::{format_elapsed, AudioArtifact, MediaType};
pub use audio_source::{AudioSourceHandle, SourceEvent, SourceOutput, SourceTag};
pub use external_source::ExternalProcessSource;
pub use local_source::LocalGraphSource;
pub use strategy::{
    CaptureSettings, CaptureSetup, CaptureStrategy, Finalized, StrategyKind, StrategyPreference,
};
