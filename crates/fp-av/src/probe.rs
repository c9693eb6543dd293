//! Media metadata via the `ffprobe` CLI.
//!
//! Shells out to `ffprobe -v error -show_format -show_streams -print_format json`
//! and maps the JSON output into [`MediaMetadata`].

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

use crate::process::ToolCommand;
use crate::tools::{Tool, ToolLocator};

/// Container and stream metadata of one input.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct MediaMetadata {
    pub format: FormatInfo,
    pub streams: Vec<StreamInfo>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct FormatInfo {
    pub filename: Option<String>,
    pub format_name: Option<String>,
    pub format_long_name: Option<String>,
    /// Duration in seconds.
    pub duration: Option<f64>,
    /// Size in bytes.
    pub size: Option<u64>,
    /// Overall bitrate in bit/s.
    pub bit_rate: Option<u64>,
    pub nb_streams: Option<u32>,
    pub tags: BTreeMap<String, String>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct StreamInfo {
    pub index: u32,
    /// `video`, `audio`, `subtitle`, `data` or `attachment`.
    pub codec_type: Option<String>,
    pub codec_name: Option<String>,
    pub codec_long_name: Option<String>,
    pub width: Option<u32>,
    pub height: Option<u32>,
    /// Frames per second, from `r_frame_rate`.
    pub frame_rate: Option<f64>,
    pub channels: Option<u32>,
    pub sample_rate: Option<u32>,
    pub bit_rate: Option<u64>,
    pub duration: Option<f64>,
    pub tags: BTreeMap<String, String>,
}

impl StreamInfo {
    pub fn language(&self) -> Option<&str> {
        self.tags.get("language").map(String::as_str)
    }
}

impl MediaMetadata {
    /// Parse ffprobe's JSON output.
    pub fn from_json(json: &str) -> fp_core::Result<Self> {
        let raw: FfprobeOutput = serde_json::from_str(json)
            .map_err(|e| fp_core::Error::Probe(format!("ffprobe JSON parse error: {e}")))?;
        Ok(raw.into())
    }

    /// Container duration in seconds, falling back to the longest stream.
    pub fn duration(&self) -> Option<f64> {
        self.format.duration.or_else(|| {
            self.streams
                .iter()
                .filter_map(|s| s.duration)
                .reduce(f64::max)
        })
    }

    pub fn video_streams(&self) -> impl Iterator<Item = &StreamInfo> {
        self.streams_of("video")
    }

    pub fn audio_streams(&self) -> impl Iterator<Item = &StreamInfo> {
        self.streams_of("audio")
    }

    fn streams_of<'a>(&'a self, kind: &'a str) -> impl Iterator<Item = &'a StreamInfo> {
        self.streams
            .iter()
            .filter(move |s| s.codec_type.as_deref() == Some(kind))
    }
}

/// Read the metadata of `input` (a path or URL).
///
/// # Errors
///
/// [`fp_core::Error::ToolNotFound`] when ffprobe is missing, a process error
/// when it fails, [`fp_core::Error::Probe`] when its output is unreadable.
pub async fn ffprobe(locator: &ToolLocator, input: &str) -> fp_core::Result<MediaMetadata> {
    let output = ToolCommand::new(Tool::Ffprobe)
        .args(["-v", "error", "-show_format", "-show_streams"])
        .args(["-print_format", "json"])
        .arg(input)
        .execute(locator)
        .await?;

    let metadata = MediaMetadata::from_json(&output.stdout)?;
    tracing::debug!(
        "Probed {input}: {} streams, duration {:?}",
        metadata.streams.len(),
        metadata.duration()
    );
    Ok(metadata)
}

// ---------------------------------------------------------------------------
// JSON structures
// ---------------------------------------------------------------------------

#[derive(Debug, Deserialize)]
struct FfprobeOutput {
    #[serde(default)]
    format: FfprobeFormat,
    #[serde(default)]
    streams: Vec<FfprobeStream>,
}

#[derive(Debug, Default, Deserialize)]
struct FfprobeFormat {
    filename: Option<String>,
    format_name: Option<String>,
    format_long_name: Option<String>,
    duration: Option<String>,
    size: Option<String>,
    bit_rate: Option<String>,
    nb_streams: Option<u32>,
    #[serde(default)]
    tags: BTreeMap<String, String>,
}

#[derive(Debug, Deserialize)]
struct FfprobeStream {
    #[serde(default)]
    index: u32,
    codec_type: Option<String>,
    codec_name: Option<String>,
    codec_long_name: Option<String>,
    width: Option<u32>,
    height: Option<u32>,
    r_frame_rate: Option<String>,
    channels: Option<u32>,
    sample_rate: Option<String>,
    bit_rate: Option<String>,
    duration: Option<String>,
    #[serde(default)]
    tags: BTreeMap<String, String>,
}

impl From<FfprobeOutput> for MediaMetadata {
    fn from(raw: FfprobeOutput) -> Self {
        let format = raw.format;
        MediaMetadata {
            format: FormatInfo {
                filename: format.filename,
                format_name: format.format_name,
                format_long_name: format.format_long_name,
                duration: parse_number(format.duration.as_deref()),
                size: parse_number(format.size.as_deref()),
                bit_rate: parse_number(format.bit_rate.as_deref()),
                nb_streams: format.nb_streams,
                tags: format.tags,
            },
            streams: raw
                .streams
                .into_iter()
                .map(|s| StreamInfo {
                    index: s.index,
                    codec_type: s.codec_type,
                    codec_name: s.codec_name,
                    codec_long_name: s.codec_long_name,
                    width: s.width,
                    height: s.height,
                    frame_rate: s.r_frame_rate.as_deref().and_then(parse_frame_rate),
                    channels: s.channels,
                    sample_rate: parse_number(s.sample_rate.as_deref()),
                    bit_rate: parse_number(s.bit_rate.as_deref()),
                    duration: parse_number(s.duration.as_deref()),
                    tags: s.tags,
                })
                .collect(),
        }
    }
}

fn parse_number<T: std::str::FromStr>(value: Option<&str>) -> Option<T> {
    value.and_then(|v| v.trim().parse().ok())
}

/// Parse `"24000/1001"` style rates.
fn parse_frame_rate(rate: &str) -> Option<f64> {
    let (num, den) = rate.split_once('/')?;
    let num: f64 = num.parse().ok()?;
    let den: f64 = den.parse().ok()?;
    (den != 0.0 && num > 0.0).then(|| num / den)
}
