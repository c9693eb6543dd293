//! Shared harness for the run lifecycle tests.
//!
//! [`FakeTools`] writes shell scripts standing in for ffmpeg, ffprobe and
//! flvmeta into a temporary directory and hands out commands configured to
//! use them.

#![allow(dead_code)]

use std::os::unix::fs::PermissionsExt;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};

use fp_av::{FfmpegCommand, ToolLocator};
use fp_core::config::ToolsConfig;
use tempfile::TempDir;

/// Stderr banner of a single mp4 input with one video and one audio stream.
pub const BANNER: &str = "\
ffmpeg version 6.1 Copyright (c) 2000-2023 the FFmpeg developers
Input #0, mov,mp4,m4a,3gp,3g2,mj2, from 'in.mp4':
  Metadata:
    major_brand     : isom
  Duration: 00:00:04.00, start: 0.000000, bitrate: 1032 kb/s
  Stream #0:0[0x1](und): Video: h264 (High) (avc1 / 0x31637661), yuv420p(progressive), 640x480, 900 kb/s, 25 fps
  Stream #0:1[0x2](und): Audio: aac (LC) (mp4a / 0x6134706D), 44100 Hz, stereo, fltp, 128 kb/s
Stream mapping:
  Stream #0:0 -> #0:0 (h264 (native) -> h264 (libx264))
Output #0, mp4, to 'out.mp4':
";

/// Two `-progress` blocks reaching 2s and 4s.
pub const PROGRESS: &str = "\
frame=50
fps=25.00
bitrate= 128.0kbits/s
total_size=4096
out_time=00:00:02.000000
progress=continue
frame=100
fps=25.00
bitrate= 128.0kbits/s
total_size=8192
out_time=00:00:04.000000
progress=end
";

pub struct FakeTools {
    dir: TempDir,
    config: ToolsConfig,
}

impl FakeTools {
    pub fn new() -> Self {
        Self {
            dir: tempfile::tempdir().expect("failed to create temp dir"),
            config: ToolsConfig::default(),
        }
    }

    /// Install a fake ffmpeg running `body`.
    pub fn ffmpeg(mut self, body: &str) -> Self {
        self.config.ffmpeg_path = Some(self.script("ffmpeg", body));
        self
    }

    pub fn ffprobe(mut self, body: &str) -> Self {
        self.config.ffprobe_path = Some(self.script("ffprobe", body));
        self
    }

    /// An ffprobe reporting a container duration of `seconds`.
    pub fn ffprobe_duration(self, seconds: f64) -> Self {
        self.ffprobe(&format!(
            "echo '{{\"format\": {{\"duration\": \"{seconds}\"}}, \"streams\": []}}'"
        ))
    }

    pub fn flvmeta(mut self, body: &str) -> Self {
        self.config.flvmeta_path = Some(self.script("flvmeta", body));
        self
    }

    pub fn dir(&self) -> &Path {
        self.dir.path()
    }

    /// A path inside the temporary directory.
    pub fn path(&self, name: &str) -> PathBuf {
        self.dir.path().join(name)
    }

    pub fn locator(&self) -> ToolLocator {
        ToolLocator::new(self.config.clone())
    }

    /// A command wired to the fake tools.
    pub fn command(&self) -> FfmpegCommand {
        let mut cmd = FfmpegCommand::new();
        cmd.locator(self.locator());
        cmd
    }

    fn script(&self, name: &str, body: &str) -> PathBuf {
        let path = self.dir.path().join(name);
        std::fs::write(&path, format!("#!/bin/sh\n{body}\n")).expect("failed to write script");
        std::fs::set_permissions(&path, std::fs::Permissions::from_mode(0o755))
            .expect("failed to chmod script");
        path
    }
}

/// Thread-safe list of values collected by listeners.
pub struct Recorder<T>(Arc<Mutex<Vec<T>>>);

impl<T> Clone for Recorder<T> {
    fn clone(&self) -> Self {
        Self(Arc::clone(&self.0))
    }
}

impl<T: Clone> Recorder<T> {
    pub fn new() -> Self {
        Self(Arc::new(Mutex::new(Vec::new())))
    }

    pub fn push(&self, value: T) {
        self.0.lock().unwrap().push(value);
    }

    pub fn take(&self) -> Vec<T> {
        std::mem::take(&mut *self.0.lock().unwrap())
    }

    pub fn len(&self) -> usize {
        self.0.lock().unwrap().len()
    }
}
