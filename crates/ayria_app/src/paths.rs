use std::path::PathBuf;

use anyhow::{Context, Result};

/// Returns the base directory: `~/.ayria/`
pub fn base_dir() -> Result<PathBuf> {
    let home = dirs::home_dir().context("Could not determine home directory")?;
    Ok(home.join(".ayria"))
}

/// Returns the config file path: `~/.ayria/config.json`
pub fn config_path() -> Result<PathBuf> {
    Ok(base_dir()?.join("config.json"))
}

/// Returns the identity file path: `~/.ayria/identity.json`
pub fn identity_path() -> Result<PathBuf> {
    Ok(base_dir()?.join("identity.json"))
}

/// Returns the message store path: `~/.ayria/ayria.db`
pub fn db_path() -> Result<PathBuf> {
    Ok(base_dir()?.join("ayria.db"))
}

/// Returns the logs directory: `~/.ayria/logs/`
pub fn logs_dir() -> Result<PathBuf> {
    Ok(base_dir()?.join("logs"))
}

/// Ensures all required directories exist.
pub fn ensure_dirs() -> Result<()> {
    for dir in [base_dir()?, logs_dir()?] {
        std::fs::create_dir_all(&dir)
            .with_context(|| format!("Failed to create {}", dir.display()))?;
    }
    Ok(())
}
