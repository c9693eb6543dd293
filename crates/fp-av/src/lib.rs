//! # fp-av
//!
//! Supervised ffmpeg runs for the ffpilot workspace.
//!
//! This crate provides:
//!
//! - **Tool discovery** ([`ToolLocator`]) -- find and cache paths to ffmpeg,
//!   ffprobe, the flv metadata rewriter, `nice` and `renice`.
//! - **Process supervision** ([`ToolCommand`]) -- async builder that spawns a
//!   tool, captures or pipes its streams, enforces a deadline, and completes
//!   exactly once.
//! - **Argument assembly** ([`args`]) -- turn a [`CommandSpec`] snapshot into
//!   the ordered ffmpeg argument list.
//! - **Output interpretation** ([`interpret`]) -- incremental progress, codec
//!   banner, and diagnostic extraction over growing output buffers.
//! - **Command lifecycle** ([`FfmpegCommand`]) -- the builder callers use,
//!   with listeners, streaming I/O, post-run metadata rewriting, and live
//!   priority/signal control.
//! - **Metadata and capabilities** ([`probe`], [`capabilities`]) -- ffprobe
//!   metadata and cached codec/format/filter catalogs.

pub mod args;
pub mod capabilities;
pub mod command;
pub mod control;
pub mod interpret;
pub mod probe;
pub mod process;
pub mod rewrite;
pub mod tools;

// ---- Re-exports for convenience ----

pub use args::{
    assemble, CommandSpec, ComplexFilter, Filter, InputSource, InputSpec, OutputSpec, OutputTarget,
    Size,
};
pub use command::{FfmpegCommand, FilterArg, RunOutput, RunPhase};
pub use control::{ControlHandle, KillSignal, ProcessSlot};
pub use interpret::{extract_error, CodecBannerScanner, ProgressScanner};
pub use probe::{ffprobe, MediaMetadata};
pub use process::{Completion, ProcessObserver, ToolCommand, ToolOutput};
pub use tools::{Tool, ToolInfo, ToolLocator};
