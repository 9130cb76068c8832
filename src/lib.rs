pub mod audio;
pub mod backend;
pub mod cli;
pub mod config;
pub mod error;
pub mod global;
pub mod hooks;
pub mod recording;
pub mod recovery;

pub use error::{CaptureError, Degradation};
