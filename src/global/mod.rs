use anyhow::{anyhow, Context, Result};
use std::path::PathBuf;

const APP_DIR: &str = "meetrec";

pub fn config_dir() -> Result<PathBuf> {
    dirs::config_dir()
        .map(|dir| dir.join(APP_DIR))
        .context("Unable to determine config directory")
}

pub fn config_file() -> Result<PathBuf> {
    Ok(config_dir()?.join("config.toml"))
}

pub fn data_dir() -> Result<PathBuf> {
    if let Some(dir) = dirs::data_dir() {
        return Ok(dir.join(APP_DIR));
    }
    if let Some(home) = dirs::home_dir() {
        return Ok(home.join(".local").join("share").join(APP_DIR));
    }
    Err(anyhow!("Unable to determine data directory"))
}

/// Survives reboots, unlike the system temp dir.
pub fn recovery_dir() -> Result<PathBuf> {
    Ok(data_dir()?.join("recovery"))
}

pub fn checkpoint_file() -> Result<PathBuf> {
    Ok(recovery_dir()?.join("checkpoint.json"))
}

pub fn sessions_dir() -> Result<PathBuf> {
    Ok(recovery_dir()?.join("sessions"))
}

pub fn recordings_dir() -> Result<PathBuf> {
    Ok(data_dir()?.join("recordings"))
}
