//! Configuration file loading.
//!
//! The configuration model lives in [`fp_core::config`]; this module reads it
//! from TOML.

pub use fp_core::config::{Config, RunConfig, ToolsConfig};

use anyhow::{Context, Result};
use std::path::{Path, PathBuf};

/// Locations searched, in order, when no config file is given.
pub const DEFAULT_PATHS: [&str; 3] = [
    "./ffpilot.toml",
    "~/.config/ffpilot/config.toml",
    "/etc/ffpilot/config.toml",
];

/// Load configuration from a TOML file
pub fn load_config(path: &Path) -> Result<Config> {
    let content = std::fs::read_to_string(path)
        .with_context(|| format!("Failed to read config file: {:?}", path))?;

    let mut config: Config = toml::from_str(&content)
        .with_context(|| format!("Failed to parse config file: {:?}", path))?;

    expand_tool_paths(&mut config.tools);

    for warning in config.validate() {
        tracing::warn!("{}: {}", path.display(), warning);
    }

    Ok(config)
}

/// The first default location that exists.
pub fn default_config_path() -> Option<PathBuf> {
    DEFAULT_PATHS.iter().find_map(|path_str| {
        let path = PathBuf::from(shellexpand::tilde(path_str).as_ref());
        path.exists().then_some(path)
    })
}

/// Load config from `custom_path`, else from default locations, else return
/// the default config
pub fn load_config_or_default(custom_path: Option<&Path>) -> Result<Config> {
    if let Some(path) = custom_path {
        return load_config(path);
    }

    match default_config_path() {
        Some(path) => {
            tracing::debug!("Using config file {}", path.display());
            load_config(&path)
        }
        None => Ok(Config::default()),
    }
}

fn expand_tool_paths(tools: &mut ToolsConfig) {
    for path in [
        &mut tools.ffmpeg_path,
        &mut tools.ffprobe_path,
        &mut tools.flvmeta_path,
    ]
    .into_iter()
    .flatten()
    {
        let expanded = shellexpand::tilde(&path.to_string_lossy()).into_owned();
        *path = PathBuf::from(expanded);
    }
}
