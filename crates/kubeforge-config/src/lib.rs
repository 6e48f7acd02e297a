pub mod error;
pub mod settings;

pub use error::*;
pub use settings::*;

use std::path::PathBuf;

const CONFIG_ENV: &str = "KUBEFORGE_CONFIG_PATH";
const PROJECT_DIR: &str = ".kubeforge";
const CANDIDATES: [&str; 2] = ["kubeforge.local.yaml", "kubeforge.yaml"];

/// KubeForge's global config directory, created if missing
pub fn get_config_dir() -> Result<PathBuf> {
    let config_dir = dirs::config_dir()
        .ok_or(ConfigError::ConfigDirNotFound)?
        .join("kubeforge");

    if !config_dir.exists() {
        std::fs::create_dir_all(&config_dir)?;
    }

    Ok(config_dir)
}

/// Locate the config file
///
/// Search order:
/// 1. `KUBEFORGE_CONFIG_PATH`
/// 2. current directory: kubeforge.local.yaml, kubeforge.yaml
/// 3. ./.kubeforge/ with the same names
/// 4. ~/.config/kubeforge/kubeforge.yaml
pub fn find_config_file() -> Result<PathBuf> {
    if let Ok(config_path) = std::env::var(CONFIG_ENV) {
        let path = PathBuf::from(config_path);
        if path.exists() {
            return Ok(path);
        }
    }

    let current_dir = std::env::current_dir()?;

    for filename in &CANDIDATES {
        let path = current_dir.join(filename);
        if path.exists() {
            return Ok(path);
        }
    }

    let project_dir = current_dir.join(PROJECT_DIR);
    if project_dir.is_dir() {
        for filename in &CANDIDATES {
            let path = project_dir.join(filename);
            if path.exists() {
                return Ok(path);
            }
        }
    }

    if let Some(config_dir) = dirs::config_dir() {
        let global_config = config_dir.join("kubeforge").join("kubeforge.yaml");
        if global_config.exists() {
            return Ok(global_config);
        }
    }

    Err(ConfigError::ConfigFileNotFound)
}

/// Load the discovered config file, falling back to defaults when there is none.
///
/// Returns the path that was loaded, if any.
pub fn load_config() -> Result<(KubeforgeConfig, Option<PathBuf>)> {
    match find_config_file() {
        Ok(path) => Ok((KubeforgeConfig::load(&path)?, Some(path))),
        Err(ConfigError::ConfigFileNotFound) => Ok((KubeforgeConfig::default(), None)),
        Err(e) => Err(e),
    }
}
