//! ffpilot - supervised ffmpeg transcoding
//!
//! The transcoding library lives in the `fp-av` and `fp-core` crates; this
//! crate adds configuration file loading for the `ffpilot` command-line tool.

pub mod config;
