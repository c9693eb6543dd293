//! Configuration types.
//!
//! The top-level [`Config`] carries the tool path overrides and the run-time
//! defaults applied to every new command. Every section defaults sensibly so
//! a completely empty document is valid.

use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use std::time::Duration;

use crate::error::Result;
use crate::Error;

/// Lowest niceness accepted by the scheduler.
pub const MIN_NICENESS: i32 = -20;
/// Highest niceness accepted by the scheduler.
pub const MAX_NICENESS: i32 = 19;

// ---------------------------------------------------------------------------
// Top-level Config
// ---------------------------------------------------------------------------

/// Root configuration.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    pub tools: ToolsConfig,
    pub run: RunConfig,
}

impl Config {
    /// Deserialize a `Config` from a JSON string.
    pub fn from_json(json_str: &str) -> Result<Self> {
        serde_json::from_str(json_str)
            .map_err(|e| Error::Config(format!("config parse error: {e}")))
    }

    /// Return a list of validation warnings (non-fatal issues).
    pub fn validate(&self) -> Vec<String> {
        let mut warnings = Vec::new();

        if !(MIN_NICENESS..=MAX_NICENESS).contains(&self.run.niceness) {
            warnings.push(format!(
                "run.niceness {} is outside {MIN_NICENESS}..={MAX_NICENESS} and will be clamped",
                self.run.niceness
            ));
        }

        if self.run.timeout_secs == Some(0) {
            warnings.push("run.timeout_secs is 0; every run will time out immediately".into());
        }

        let paths = [
            ("tools.ffmpeg_path", &self.tools.ffmpeg_path),
            ("tools.ffprobe_path", &self.tools.ffprobe_path),
            ("tools.flvmeta_path", &self.tools.flvmeta_path),
        ];
        for (key, path) in paths {
            if let Some(p) = path {
                if !p.exists() {
                    warnings.push(format!("{key} {} does not exist", p.display()));
                }
            }
        }

        warnings
    }
}

// ---------------------------------------------------------------------------
// Sub-configs
// ---------------------------------------------------------------------------

/// Explicit paths for external binaries. Unset entries are resolved from
/// environment overrides and `PATH`.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ToolsConfig {
    pub ffmpeg_path: Option<PathBuf>,
    pub ffprobe_path: Option<PathBuf>,
    /// Metadata rewriter (flvmeta or flvtool2).
    pub flvmeta_path: Option<PathBuf>,
}

/// Defaults applied to each command run.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct RunConfig {
    /// Scheduling priority adjustment for the transcoder.
    pub niceness: i32,
    /// Kill the transcoder after this many seconds.
    pub timeout_secs: Option<u64>,
    /// Delay between an output stream closing and the transcoder being
    /// killed, giving an exiting process the chance to finish on its own.
    #[serde(default = "default_output_close_grace_ms")]
    pub output_close_grace_ms: u64,
    /// Check requested formats and codecs against the transcoder's
    /// capability catalogs before spawning.
    pub validate_capabilities: bool,
}

fn default_output_close_grace_ms() -> u64 {
    20
}

impl Default for RunConfig {
    fn default() -> Self {
        Self {
            niceness: 0,
            timeout_secs: None,
            output_close_grace_ms: default_output_close_grace_ms(),
            validate_capabilities: false,
        }
    }
}

impl RunConfig {
    /// The configured deadline, if any.
    pub fn timeout(&self) -> Option<Duration> {
        self.timeout_secs.map(Duration::from_secs)
    }

    /// The configured output-close grace period.
    pub fn output_close_grace(&self) -> Duration {
        Duration::from_millis(self.output_close_grace_ms)
    }
}
