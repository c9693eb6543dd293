//! Incremental interpretation of ffmpeg's text output.
//!
//! The supervisor hands every chunk of stdout/stderr to the run, together
//! with the whole accumulated text. The scanners here keep a [`LineCursor`]
//! into that append-only text, so each call only looks at lines completed
//! since the previous call and a line is never reported twice.
//!
//! - [`ProgressScanner`] reads `-progress` key=value blocks and classic
//!   `frame=... time=...` stats lines.
//! - [`CodecBannerScanner`] reads the one-time input summary from stderr.
//! - [`extract_error`] picks the fatal message out of stderr after a failed
//!   exit.

use std::collections::HashMap;
use std::sync::LazyLock;

use fp_core::{CodecData, Progress};
use regex::Regex;

static KEY_VALUE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"(\w+)=\s*(\S+)").expect("valid key=value regex"));
static INPUT: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"^Input #\d+, (.+?), from").expect("valid input regex"));
static DURATION: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"Duration: ([^,]+)").expect("valid duration regex"));
static AUDIO: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"Stream #\d+[:.]\d+.*?: Audio: (.*)$").expect("valid audio regex")
});
static VIDEO: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"Stream #\d+[:.]\d+.*?: Video: (.*)$").expect("valid video regex")
});
static BANNER_END: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"^\s*(Output #\d+|Stream mapping:|Press \[q\])").expect("valid banner end regex")
});

// ---------------------------------------------------------------------------
// LineCursor
// ---------------------------------------------------------------------------

/// Position in an append-only text buffer up to which lines were consumed.
///
/// Both `\n` and `\r` end a line: ffmpeg rewrites its stats line in place
/// with carriage returns.
#[derive(Debug, Default, Clone)]
pub struct LineCursor {
    offset: usize,
}

impl LineCursor {
    /// Return the non-blank lines completed since the last call and advance
    /// past them. A trailing partial line is left for the next call.
    pub fn complete_lines<'a>(&mut self, text: &'a str) -> Vec<&'a str> {
        let Some(tail) = text.get(self.offset..) else {
            return Vec::new();
        };
        let Some(end) = tail.rfind(is_line_break) else {
            return Vec::new();
        };
        self.offset += end + 1;
        tail[..end]
            .split(is_line_break)
            .filter(|line| !line.trim().is_empty())
            .collect()
    }

    /// Bytes consumed so far.
    pub fn offset(&self) -> usize {
        self.offset
    }
}

fn is_line_break(c: char) -> bool {
    c == '\n' || c == '\r'
}

// ---------------------------------------------------------------------------
// Progress
// ---------------------------------------------------------------------------

/// Turns stdout into [`Progress`] events.
#[derive(Debug, Default)]
pub struct ProgressScanner {
    cursor: LineCursor,
    block: HashMap<String, String>,
    duration: Option<f64>,
}

impl ProgressScanner {
    /// Create a scanner; `duration_secs` enables the percentage field.
    pub fn new(duration_secs: Option<f64>) -> Self {
        Self {
            duration: duration_secs,
            ..Default::default()
        }
    }

    /// Total input duration used for percentages.
    pub fn duration(&self) -> Option<f64> {
        self.duration
    }

    pub fn set_duration(&mut self, duration_secs: Option<f64>) {
        self.duration = duration_secs;
    }

    /// Report every progress marker completed since the previous call.
    pub fn scan(&mut self, text: &str) -> Vec<Progress> {
        let mut events = Vec::new();

        for line in self.cursor.complete_lines(text) {
            let pairs: Vec<(&str, &str)> = KEY_VALUE
                .captures_iter(line)
                .filter_map(|c| Some((c.get(1)?.as_str(), c.get(2)?.as_str())))
                .collect();

            match pairs.as_slice() {
                [] => {}
                [(key, _)] if *key == "progress" => {
                    if !self.block.is_empty() {
                        let block = std::mem::take(&mut self.block);
                        events.push(self.build(|k| block.get(k).map(String::as_str)));
                    }
                }
                [(key, value)] => {
                    self.block.insert((*key).to_string(), (*value).to_string());
                }
                stats => {
                    if stats.iter().any(|(k, _)| *k == "time") {
                        let fields: HashMap<&str, &str> = stats.iter().copied().collect();
                        events.push(self.build(|k| fields.get(k).copied()));
                    }
                }
            }
        }

        events
    }

    fn build<'a>(&self, get: impl Fn(&str) -> Option<&'a str>) -> Progress {
        let frames = get("frame").and_then(|v| v.parse::<u64>().ok());
        let current_fps = get("fps").and_then(|v| v.parse::<f64>().ok());
        let current_kbps = get("bitrate").and_then(|v| {
            v.trim_end_matches("kbits/s").parse::<f64>().ok()
        });
        let target_size = match get("total_size").and_then(|v| v.parse::<u64>().ok()) {
            Some(bytes) => Some(bytes / 1024),
            None => get("size")
                .or_else(|| get("Lsize"))
                .and_then(|v| {
                    v.trim_end_matches("KiB")
                        .trim_end_matches("kB")
                        .parse::<u64>()
                        .ok()
                }),
        };
        let timemark = get("out_time")
            .or_else(|| get("time"))
            .unwrap_or_default()
            .to_string();

        let percent = match (self.duration, timemark_to_seconds(&timemark)) {
            (Some(duration), Some(elapsed)) if duration > 0.0 => {
                Some((elapsed / duration * 100.0).clamp(0.0, 100.0))
            }
            _ => None,
        };

        Progress {
            frames,
            current_fps,
            current_kbps,
            target_size,
            timemark,
            percent,
        }
    }
}

/// Convert `[-][[HH:]MM:]SS[.frac]` into seconds.
pub fn timemark_to_seconds(timemark: &str) -> Option<f64> {
    let timemark = timemark.trim();
    let (sign, body) = match timemark.strip_prefix('-') {
        Some(rest) => (-1.0, rest),
        None => (1.0, timemark),
    };
    if body.is_empty() {
        return None;
    }

    let mut seconds = 0.0;
    for part in body.split(':') {
        seconds = seconds * 60.0 + part.parse::<f64>().ok()?;
    }
    Some(sign * seconds)
}

// ---------------------------------------------------------------------------
// Codec banner
// ---------------------------------------------------------------------------

/// Finds the input codec summary in stderr and reports it once.
#[derive(Debug, Default)]
pub struct CodecBannerScanner {
    cursor: LineCursor,
    fired: bool,
    input_seen: bool,
    collecting: bool,
    data: CodecData,
}

impl CodecBannerScanner {
    pub fn new() -> Self {
        Self::default()
    }

    /// Whether the banner was already reported.
    pub fn has_fired(&self) -> bool {
        self.fired
    }

    /// Scan newly completed stderr lines. Returns the banner the first time
    /// its end is seen, `None` on every other call.
    pub fn scan(&mut self, text: &str) -> Option<CodecData> {
        if self.fired {
            return None;
        }

        for line in self.cursor.complete_lines(text) {
            if let Some(caps) = INPUT.captures(line) {
                // Only the first input is summarised.
                if self.input_seen {
                    self.collecting = false;
                } else {
                    self.input_seen = true;
                    self.collecting = true;
                    self.data.format = caps[1].to_string();
                }
                continue;
            }

            if BANNER_END.is_match(line) {
                if self.input_seen {
                    self.fired = true;
                    return Some(std::mem::take(&mut self.data));
                }
                continue;
            }

            if !self.collecting {
                continue;
            }

            if let Some(caps) = DURATION.captures(line) {
                if self.data.duration.is_empty() {
                    self.data.duration = caps[1].trim().to_string();
                }
            } else if let Some(caps) = AUDIO.captures(line) {
                if self.data.audio.is_empty() {
                    let (codec, details) = split_codec(&caps[1]);
                    self.data.audio = codec;
                    self.data.audio_details = details;
                }
            } else if let Some(caps) = VIDEO.captures(line) {
                if self.data.video.is_empty() {
                    let (codec, details) = split_codec(&caps[1]);
                    self.data.video = codec;
                    self.data.video_details = details;
                }
            }
        }

        None
    }
}

/// Split a stream description into its codec and the remaining parameters.
fn split_codec(description: &str) -> (String, Vec<String>) {
    let mut parts = split_top_level(description).into_iter();
    let codec = parts.next().unwrap_or_default();
    (codec, parts.collect())
}

/// Split on commas that are not nested inside parentheses or brackets.
fn split_top_level(s: &str) -> Vec<String> {
    let mut parts = Vec::new();
    let mut depth = 0usize;
    let mut start = 0;

    for (i, c) in s.char_indices() {
        match c {
            '(' | '[' => depth += 1,
            ')' | ']' => depth = depth.saturating_sub(1),
            ',' if depth == 0 => {
                parts.push(s[start..i].trim().to_string());
                start = i + 1;
            }
            _ => {}
        }
    }
    parts.push(s[start..].trim().to_string());
    parts.retain(|p| !p.is_empty());
    parts
}

// ---------------------------------------------------------------------------
// Errors
// ---------------------------------------------------------------------------

/// Extract the most specific diagnostic from stderr.
///
/// ffmpeg prints context (indented metadata, `[component @ 0x..]` logs,
/// stats lines) before its final fatal message, so the last run of lines
/// that are none of those is taken. Falls back to the whole stderr, then to
/// `"unknown error"`.
pub fn extract_error(stderr: &str) -> String {
    let mut block: Vec<&str> = Vec::new();

    for line in stderr.split(is_line_break) {
        if line.trim().is_empty() {
            continue;
        }
        if is_context_line(line) {
            block.clear();
        } else {
            block.push(line.trim_end());
        }
    }

    if !block.is_empty() {
        return block.join("\n");
    }

    match stderr.trim() {
        "" => "unknown error".to_string(),
        text => text.to_string(),
    }
}

fn is_context_line(line: &str) -> bool {
    line.starts_with(' ')
        || line.starts_with('[')
        || line.starts_with("frame=")
        || line.starts_with("size=")
}

#[cfg(test)]
mod tests {
    use super::*;

    const PROGRESS_BLOCK: &str = "frame=25\nfps=24.50\nstream_0_0_q=28.0\nbitrate=1677.7kbits/s\n\
total_size=1048576\nout_time_us=60000000\nout_time=00:01:00.000000\nspeed=1.02x\nprogress=continue\n";

    const BANNER: &str = "ffmpeg version 6.1 Copyright (c) 2000-2023 the FFmpeg developers\n\
  built with gcc 13\n\
Input #0, mov,mp4,m4a,3gp,3g2,mj2, from 'in.mp4':\n\
  Metadata:\n\
    major_brand     : isom\n\
  Duration: 00:02:00.00, start: 0.000000, bitrate: 1205 kb/s\n\
  Stream #0:0[0x1](und): Video: h264 (High) (avc1 / 0x31637661), yuv420p(tv, bt709), 1920x1080 [SAR 1:1 DAR 16:9], 1071 kb/s, 25 fps\n\
  Stream #0:1[0x2](und): Audio: aac (LC) (mp4a / 0x6134706D), 44100 Hz, stereo, fltp, 128 kb/s (default)\n\
Stream mapping:\n\
  Stream #0:0 -> #0:0 (h264 (native) -> h264 (libx264))\n";

    #[test]
    fn cursor_holds_back_partial_line() {
        let mut cursor = LineCursor::default();
        assert!(cursor.complete_lines("frame=1").is_empty());
        assert_eq!(cursor.complete_lines("frame=1\nfps="), vec!["frame=1"]);
        assert_eq!(cursor.complete_lines("frame=1\nfps=2\r"), vec!["fps=2"]);
        assert_eq!(cursor.offset(), "frame=1\nfps=2\r".len());
    }

    #[test]
    fn progress_block_is_reported_once() {
        let mut scanner = ProgressScanner::new(None);
        let mut text = String::from(PROGRESS_BLOCK);

        let first = scanner.scan(&text);
        assert_eq!(first.len(), 1);
        let p = &first[0];
        assert_eq!(p.frames, Some(25));
        assert_eq!(p.current_fps, Some(24.5));
        assert_eq!(p.current_kbps, Some(1677.7));
        assert_eq!(p.target_size, Some(1024));
        assert_eq!(p.timemark, "00:01:00.000000");
        assert_eq!(p.percent, None);

        // Rescanning the same growing buffer only reports new markers.
        assert!(scanner.scan(&text).is_empty());
        text.push_str("frame=50\nout_time=00:01:30.000000\n");
        assert!(scanner.scan(&text).is_empty());
        text.push_str("progress=end\n");
        let second = scanner.scan(&text);
        assert_eq!(second.len(), 1);
        assert_eq!(second[0].frames, Some(50));
    }

    #[test]
    fn block_split_across_chunks() {
        let mut scanner = ProgressScanner::new(None);
        let (a, b) = PROGRESS_BLOCK.split_at(37);
        let mut text = a.to_string();
        assert!(scanner.scan(&text).is_empty());
        text.push_str(b);
        assert_eq!(scanner.scan(&text).len(), 1);
    }

    #[test]
    fn percent_from_duration() {
        let mut scanner = ProgressScanner::new(Some(120.0));
        let events = scanner.scan(PROGRESS_BLOCK);
        assert_eq!(events[0].percent, Some(50.0));
    }

    #[test]
    fn percent_absent_for_zero_duration() {
        let mut scanner = ProgressScanner::new(Some(0.0));
        assert_eq!(scanner.scan(PROGRESS_BLOCK)[0].percent, None);
    }

    #[test]
    fn percent_is_clamped() {
        let mut scanner = ProgressScanner::new(Some(30.0));
        assert_eq!(scanner.scan(PROGRESS_BLOCK)[0].percent, Some(100.0));

        let mut scanner = ProgressScanner::new(Some(30.0));
        let early = "frame=0\nout_time=-00:00:00.040000\nprogress=continue\n";
        assert_eq!(scanner.scan(early)[0].percent, Some(0.0));
    }

    #[test]
    fn classic_stats_lines() {
        let mut scanner = ProgressScanner::new(Some(10.0));
        let text = "frame=  120 fps= 30 q=28.0 size=     512kB time=00:00:05.00 bitrate= 838.9kbits/s speed=1.2x\r\
frame=  240 fps= 30 q=28.0 size=    1024kB time=00:00:10.00 bitrate= 838.9kbits/s speed=1.2x\r";
        let events = scanner.scan(text);
        assert_eq!(events.len(), 2);
        assert_eq!(events[0].frames, Some(120));
        assert_eq!(events[0].target_size, Some(512));
        assert_eq!(events[0].timemark, "00:00:05.00");
        assert_eq!(events[0].percent, Some(50.0));
        assert_eq!(events[1].current_kbps, Some(838.9));
        assert_eq!(events[1].percent, Some(100.0));
    }

    #[test]
    fn unrelated_lines_are_ignored() {
        let mut scanner = ProgressScanner::new(None);
        assert!(scanner.scan("hello world\nsize=10kB\n").is_empty());
    }

    #[test]
    fn timemark_parsing() {
        assert_eq!(timemark_to_seconds("00:01:00.00"), Some(60.0));
        assert_eq!(timemark_to_seconds("01:00:01.5"), Some(3601.5));
        assert_eq!(timemark_to_seconds("02:30"), Some(150.0));
        assert_eq!(timemark_to_seconds("7.25"), Some(7.25));
        assert_eq!(timemark_to_seconds("-00:00:01.00"), Some(-1.0));
        assert_eq!(timemark_to_seconds("N/A"), None);
        assert_eq!(timemark_to_seconds(""), None);
    }

    #[test]
    fn banner_is_parsed() {
        let mut scanner = CodecBannerScanner::new();
        let data = scanner.scan(BANNER).expect("banner");
        assert_eq!(data.format, "mov,mp4,m4a,3gp,3g2,mj2");
        assert_eq!(data.duration, "00:02:00.00");
        assert_eq!(data.video, "h264 (High) (avc1 / 0x31637661)");
        assert_eq!(data.video_details[0], "yuv420p(tv, bt709)");
        assert_eq!(data.video_details[1], "1920x1080 [SAR 1:1 DAR 16:9]");
        assert_eq!(data.audio, "aac (LC) (mp4a / 0x6134706D)");
        assert_eq!(
            data.audio_details,
            vec!["44100 Hz", "stereo", "fltp", "128 kb/s (default)"]
        );
        assert!(scanner.has_fired());
    }

    #[test]
    fn banner_fires_once() {
        let mut scanner = CodecBannerScanner::new();
        let mut text = BANNER.to_string();
        assert!(scanner.scan(&text).is_some());
        text.push_str(BANNER);
        assert!(scanner.scan(&text).is_none());
        assert!(scanner.scan(&text).is_none());
    }

    #[test]
    fn banner_across_chunks() {
        let mut scanner = CodecBannerScanner::new();
        let cut = BANNER.find("Stream mapping").unwrap();
        assert!(scanner.scan(&BANNER[..cut]).is_none());
        assert!(scanner.scan(BANNER).is_some());
    }

    #[test]
    fn banner_needs_an_input() {
        let mut scanner = CodecBannerScanner::new();
        assert!(scanner.scan("Press [q] to stop\n").is_none());
        assert!(!scanner.has_fired());
    }

    #[test]
    fn error_prefers_trailing_message() {
        let stderr = "ffmpeg version 6.1\n  built with gcc\nInput #0, mov, from 'in.mp4':\n  Duration: 00:00:01.00\n\
[NULL @ 0x5581] Unable to find a suitable output format for 'out.xyz'\nout.xyz: Invalid argument\n";
        assert_eq!(extract_error(stderr), "out.xyz: Invalid argument");
    }

    #[test]
    fn error_keeps_multiline_tail() {
        let stderr = "[libx264 @ 0x1] broken\nError initializing output stream 0:0\nConversion failed!\n";
        assert_eq!(
            extract_error(stderr),
            "Error initializing output stream 0:0\nConversion failed!"
        );
    }

    #[test]
    fn error_falls_back_to_full_text() {
        assert_eq!(extract_error("  indented only\n[x] bracketed\n"), "indented only\n[x] bracketed");
        assert_eq!(extract_error(""), "unknown error");
        assert_eq!(extract_error("\n\n"), "unknown error");
    }

    #[test]
    fn top_level_split_respects_nesting() {
        assert_eq!(
            split_top_level("a, b(c, d), [e, f], g"),
            vec!["a", "b(c, d)", "[e, f]", "g"]
        );
    }
}
