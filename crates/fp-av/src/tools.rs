//! External tool detection and management.
//!
//! The [`ToolLocator`] resolves the binaries a run needs. Each lookup tries,
//! in order: the path configured in [`ToolsConfig`], the tool's environment
//! variable override, a `PATH` search, and (for ffprobe only) the directory
//! holding the resolved ffmpeg. Environment and `PATH` results are cached for
//! the lifetime of the process; [`forget`] clears that cache.

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::LazyLock;

use fp_core::config::ToolsConfig;
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};

/// Process-wide cache of environment/`PATH` lookups.
static RESOLVED: LazyLock<RwLock<HashMap<Tool, Option<PathBuf>>>> =
    LazyLock::new(|| RwLock::new(HashMap::new()));

/// A binary the crate knows how to find.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Tool {
    Ffmpeg,
    Ffprobe,
    /// FLV metadata rewriter: flvmeta, or flvtool2 as a fallback.
    Flvmeta,
    Nice,
    Renice,
}

impl Tool {
    /// Every tool, in reporting order.
    pub const ALL: [Tool; 5] = [
        Tool::Ffmpeg,
        Tool::Ffprobe,
        Tool::Flvmeta,
        Tool::Nice,
        Tool::Renice,
    ];

    /// Human-readable tool name.
    pub fn name(self) -> &'static str {
        match self {
            Tool::Ffmpeg => "ffmpeg",
            Tool::Ffprobe => "ffprobe",
            Tool::Flvmeta => "flvmeta",
            Tool::Nice => "nice",
            Tool::Renice => "renice",
        }
    }

    /// Environment variables that override the lookup, in priority order.
    fn env_vars(self) -> &'static [&'static str] {
        match self {
            Tool::Ffmpeg => &["FFMPEG_PATH"],
            Tool::Ffprobe => &["FFPROBE_PATH"],
            Tool::Flvmeta => &["FLVMETA_PATH", "FLVTOOL2_PATH"],
            Tool::Nice | Tool::Renice => &[],
        }
    }

    /// Executable names searched for on `PATH`, in priority order.
    fn binary_names(self) -> &'static [&'static str] {
        match self {
            Tool::Ffmpeg => &["ffmpeg"],
            Tool::Ffprobe => &["ffprobe"],
            Tool::Flvmeta => &["flvmeta", "flvtool2"],
            Tool::Nice => &["nice"],
            Tool::Renice => &["renice"],
        }
    }

    fn version_arg(self) -> &'static str {
        match self {
            Tool::Ffmpeg | Tool::Ffprobe => "-version",
            _ => "--version",
        }
    }
}

impl std::fmt::Display for Tool {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.name())
    }
}

/// Availability information for a tool, returned by [`ToolLocator::check_all`].
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ToolInfo {
    /// Tool name.
    pub name: String,
    /// Whether the tool was found.
    pub available: bool,
    /// Version string (first line of the version output), if available.
    pub version: Option<String>,
    /// Resolved path to the executable.
    pub path: Option<PathBuf>,
}

/// Resolves tool paths using configured overrides and the process-wide cache.
#[derive(Debug, Clone, Default)]
pub struct ToolLocator {
    config: ToolsConfig,
}

impl ToolLocator {
    /// Create a locator honouring the given path overrides.
    pub fn new(config: ToolsConfig) -> Self {
        Self { config }
    }

    /// The path overrides this locator was built with.
    pub fn config(&self) -> &ToolsConfig {
        &self.config
    }

    /// Resolve the path of `tool`.
    ///
    /// # Errors
    ///
    /// Returns [`fp_core::Error::ToolNotFound`] if no lookup step finds the
    /// binary.
    pub fn resolve(&self, tool: Tool) -> fp_core::Result<PathBuf> {
        if let Some(path) = self.configured(tool) {
            if path.exists() {
                return Ok(path.to_path_buf());
            }
            tracing::warn!(
                "Configured path for {tool} does not exist: {}; falling back to lookup",
                path.display()
            );
        }

        if let Some(path) = cached_lookup(tool) {
            return Ok(path);
        }

        if tool == Tool::Ffprobe {
            if let Ok(ffmpeg) = self.resolve(Tool::Ffmpeg) {
                if let Some(path) = sibling_of(&ffmpeg, tool) {
                    tracing::debug!("Using ffprobe next to ffmpeg: {}", path.display());
                    return Ok(path);
                }
            }
        }

        Err(fp_core::Error::tool_not_found(tool.name()))
    }

    /// Whether `tool` can be resolved.
    pub fn is_available(&self, tool: Tool) -> bool {
        self.resolve(tool).is_ok()
    }

    /// Check all known tools and return availability information.
    pub fn check_all(&self) -> Vec<ToolInfo> {
        Tool::ALL
            .iter()
            .map(|&tool| match self.resolve(tool) {
                Ok(path) => ToolInfo {
                    name: tool.name().to_string(),
                    available: true,
                    version: detect_version(tool, &path),
                    path: Some(path),
                },
                Err(_) => ToolInfo {
                    name: tool.name().to_string(),
                    available: false,
                    version: None,
                    path: None,
                },
            })
            .collect()
    }

    fn configured(&self, tool: Tool) -> Option<&Path> {
        match tool {
            Tool::Ffmpeg => self.config.ffmpeg_path.as_deref(),
            Tool::Ffprobe => self.config.ffprobe_path.as_deref(),
            Tool::Flvmeta => self.config.flvmeta_path.as_deref(),
            Tool::Nice | Tool::Renice => None,
        }
    }
}

/// Clear the process-wide lookup cache.
pub fn forget() {
    RESOLVED.write().clear();
}

fn cached_lookup(tool: Tool) -> Option<PathBuf> {
    if let Some(hit) = RESOLVED.read().get(&tool) {
        return hit.clone();
    }

    let found = discover(tool);
    match &found {
        Some(path) => tracing::debug!("Resolved {tool} to {}", path.display()),
        None => tracing::debug!("{tool} not found in environment or PATH"),
    }
    RESOLVED.write().insert(tool, found.clone());
    found
}

fn discover(tool: Tool) -> Option<PathBuf> {
    for var in tool.env_vars() {
        if let Some(value) = std::env::var_os(var).filter(|v| !v.is_empty()) {
            let path = PathBuf::from(value);
            if path.exists() {
                return Some(path);
            }
            tracing::warn!("{var} points to a missing file: {}", path.display());
        }
    }

    tool.binary_names()
        .iter()
        .find_map(|name| which::which(name).ok())
}

/// Look for `tool` in the same directory as another resolved binary.
fn sibling_of(binary: &Path, tool: Tool) -> Option<PathBuf> {
    let dir = binary.parent()?;
    let file_name = format!("{}{}", tool.name(), std::env::consts::EXE_SUFFIX);
    let candidate = dir.join(file_name);
    candidate.exists().then_some(candidate)
}

/// Run the tool's version flag and return the first line of stdout.
fn detect_version(tool: Tool, path: &Path) -> Option<String> {
    let output = std::process::Command::new(path)
        .arg(tool.version_arg())
        .output()
        .ok()?;

    if !output.status.success() {
        return None;
    }

    String::from_utf8_lossy(&output.stdout)
        .lines()
        .next()
        .map(|s| s.to_string())
}
