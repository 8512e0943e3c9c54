//! Initialize the configuration directory: create ~/.chatline and a default config.

use anyhow::{Context, Result};
use std::path::{Path, PathBuf};

/// Default config written by `chatline init`: one local relay account so `chat` works out of the box.
const DEFAULT_CONFIG: &str = r#"{
  "client": {},
  "relay": {
    "users": [
      { "username": "alice", "password": "pw" }
    ]
  }
}
"#;

/// Create the config directory and default config file if they do not exist.
/// Returns the config directory.
pub fn init_config_dir(config_path: &Path) -> Result<PathBuf> {
    let config_dir = config_path
        .parent()
        .filter(|p| !p.as_os_str().is_empty())
        .unwrap_or_else(|| Path::new("."));
    std::fs::create_dir_all(config_dir)
        .with_context(|| format!("creating config directory {}", config_dir.display()))?;

    if !config_path.exists() {
        std::fs::write(config_path, DEFAULT_CONFIG)
            .with_context(|| format!("writing default config to {}", config_path.display()))?;
        log::info!("created default config at {}", config_path.display());
    } else {
        log::debug!("config already exists at {}, skipping", config_path.display());
    }

    Ok(config_dir.to_path_buf())
}
