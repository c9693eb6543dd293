//! Payloads reported while a command runs.
//!
//! [`Progress`] and [`CodecData`] are produced by the output scanners;
//! [`RunEvent`] wraps every observable event of a run so it can be logged or
//! serialized as one stream.

use serde::{Deserialize, Serialize};

use crate::ids::RunId;

// ---------------------------------------------------------------------------
// Progress
// ---------------------------------------------------------------------------

/// One progress report from the transcoder.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Progress {
    /// Frames processed so far.
    pub frames: Option<u64>,
    /// Current processing speed in frames per second.
    pub current_fps: Option<f64>,
    /// Current output bitrate in kbit/s.
    pub current_kbps: Option<f64>,
    /// Output size so far in kB.
    pub target_size: Option<u64>,
    /// Position reached in the output, as `HH:MM:SS.ss`.
    pub timemark: String,
    /// Completion percentage, present only when the input duration is known.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub percent: Option<f64>,
}

// ---------------------------------------------------------------------------
// CodecData
// ---------------------------------------------------------------------------

/// The transcoder's one-time summary of the first input.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct CodecData {
    /// Container format name(s), e.g. `mov,mp4,m4a,3gp,3g2,mj2`.
    pub format: String,
    /// Input duration as printed by the transcoder.
    pub duration: String,
    /// Audio codec name, empty when the input has no audio.
    pub audio: String,
    /// Remaining audio stream parameters.
    pub audio_details: Vec<String>,
    /// Video codec name, empty when the input has no video.
    pub video: String,
    /// Remaining video stream parameters.
    pub video_details: Vec<String>,
}

// ---------------------------------------------------------------------------
// RunEvent
// ---------------------------------------------------------------------------

/// What happened during a run.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum RunEventPayload {
    Start { args: Vec<String> },
    Progress(Progress),
    CodecData(CodecData),
    Stderr { line: String },
    Error { message: String },
    End,
}

/// An event tagged with the run that produced it.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RunEvent {
    pub run_id: RunId,
    pub payload: RunEventPayload,
}

impl RunEvent {
    pub fn new(run_id: RunId, payload: RunEventPayload) -> Self {
        Self { run_id, payload }
    }

    /// Whether this event ends the run.
    pub fn is_terminal(&self) -> bool {
        matches!(
            self.payload,
            RunEventPayload::Error { .. } | RunEventPayload::End
        )
    }
}
