use super::{default_global_config_path, ConfigError, Settings};
use std::path::Path;

/// Loads and validates settings. An explicit path must exist; the default
/// global path falls back to built-in defaults when absent.
pub fn load_settings(explicit: Option<&Path>) -> Result<Settings, ConfigError> {
    let settings = match explicit {
        Some(path) => Settings::from_path(path)?,
        None => {
            let path = default_global_config_path()?;
            if path.is_file() {
                Settings::from_path(&path)?
            } else {
                Settings::default()
            }
        }
    };
    settings.validate()?;
    Ok(settings)
}
