//! Matrix definition loader and serialization.

use crate::error::ConfigError;
use crate::matrix::MatrixPlan;
use std::fs;
use std::path::{Path, PathBuf};

/// Get the user-level matrix directory: ~/.config/matrix-ci
pub fn get_user_config_dir() -> Result<PathBuf, ConfigError> {
    let config = dirs::config_dir().ok_or_else(|| {
        ConfigError::ValidationFailed("Cannot determine config directory".to_string())
    })?;
    Ok(config.join("matrix-ci"))
}

/// Load a matrix definition from a TOML file.
///
/// Only parses; validation happens when the plan is expanded.
pub fn load_plan_from_file(path: &Path) -> Result<MatrixPlan, ConfigError> {
    validate_config_path(path)?;

    let content = fs::read_to_string(path).map_err(|e| {
        if e.kind() == std::io::ErrorKind::NotFound {
            ConfigError::FileNotFound(path.display().to_string())
        } else {
            ConfigError::IoError(e)
        }
    })?;

    load_plan_from_str(&content)
}

/// Parse a matrix definition from TOML text.
pub fn load_plan_from_str(content: &str) -> Result<MatrixPlan, ConfigError> {
    let plan: MatrixPlan = toml::from_str(content)?;
    Ok(plan)
}

/// Save a matrix definition as TOML.
pub fn save_plan_to_file(plan: &MatrixPlan, path: &Path) -> Result<(), ConfigError> {
    validate_config_path(path)?;

    if let Some(parent) = path.parent() {
        if !parent.as_os_str().is_empty() {
            fs::create_dir_all(parent)?;
        }
    }

    let content = toml::to_string_pretty(plan)?;
    fs::write(path, content)?;
    Ok(())
}

/// Validate a matrix definition path (.toml extension required).
pub fn validate_config_path(path: &Path) -> Result<(), ConfigError> {
    if path.as_os_str().is_empty() {
        return Err(ConfigError::ValidationFailed(
            "Matrix definition path cannot be empty".to_string(),
        ));
    }

    match path.extension() {
        Some(ext) if ext == "toml" => Ok(()),
        Some(ext) => Err(ConfigError::ValidationFailed(format!(
            "Matrix definition must have .toml extension, got .{}",
            ext.to_string_lossy()
        ))),
        None => Err(ConfigError::ValidationFailed(
            "Matrix definition must have .toml extension".to_string(),
        )),
    }
}
