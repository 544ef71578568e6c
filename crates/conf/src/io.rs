use anyhow::{Context, Result};
use async_std::{
    fs,
    path::{Path, PathBuf},
};
use tracing::info;

use crate::{conf, persisted};

/// Loads and validates configuration. Default configuration is returned if
/// the file does not exist.
pub async fn load_conf(path: &Path) -> Result<conf::Configuration> {
    match load_conf_text(path).await? {
        Some(text) => {
            let persistent: persisted::Configuration = serde_yaml::from_str(text.as_str())
                .context("Failed to parse Arena configuration")?;
            conf::Configuration::try_from(persistent)
        }
        None => Ok(conf::Configuration::default()),
    }
}

/// Path of the configuration file in user's configuration directory.
pub fn default_conf_path() -> Option<PathBuf> {
    let base_conf_dir = dirs::config_dir()?;
    Some(PathBuf::from(base_conf_dir).join("Arena").join("conf.yaml"))
}

/// Loads configuration file to a string. Returns Ok(None) if the configuration
/// file does not exist.
async fn load_conf_text(path: &Path) -> Result<Option<String>> {
    if path.is_file().await {
        info!("Loading configuration from {}", path.to_string_lossy());
        fs::read_to_string(path).await.map(Some).with_context(|| {
            format!(
                "Could not load Arena configuration file: {}",
                path.to_string_lossy(),
            )
        })
    } else {
        info!(
            "Configuration does not exist or is not a file, using defaults: {}",
            path.to_string_lossy()
        );
        Ok(None)
    }
}
