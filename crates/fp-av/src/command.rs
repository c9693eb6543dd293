//! The ffmpeg command builder and run lifecycle.
//!
//! An [`FfmpegCommand`] collects inputs, outputs, options and listeners, then
//! [`run`](FfmpegCommand::run)s ffmpeg under supervision. Each run:
//!
//! 1. **Preparing** -- rejects misuse recorded by the builder, checks there
//!    is an output, resolves the metadata rewriter, probes the input
//!    duration for progress percentages, optionally validates codecs and
//!    formats, and assembles the argument list.
//! 2. **Running** -- spawns ffmpeg, pumps the attached input/output streams,
//!    and turns its output into progress, codec and stderr events.
//! 3. **Finalizing** -- enriches failures with ffmpeg's own diagnostic, or
//!    rewrites FLV metadata after a success.
//!
//! Every run ends in exactly one `end` or `error` event. A command can be
//! run again once its previous run has finished; stream inputs and outputs
//! are consumed by the run that uses them.

use std::fmt;
use std::io::ErrorKind;
use std::sync::atomic::{AtomicBool, AtomicI32, Ordering};
use std::sync::Arc;
use std::time::Duration;

use fp_core::config::Config;
use fp_core::events::{RunEvent, RunEventPayload};
use fp_core::{CodecData, Error, ErrorCategory, Progress, Result, RunId};
use parking_lot::Mutex;
use serde::Serialize;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio::process::{ChildStdin, ChildStdout};
use tokio::task::JoinHandle;
use tracing::Instrument;

use crate::args::{
    self, CommandSpec, ComplexFilter, Filter, InputSource, InputSpec, OutputSpec, OutputTarget,
};
use crate::capabilities;
use crate::control::{clamp_niceness, ControlHandle, KillSignal, ProcessSlot};
use crate::interpret::{extract_error, timemark_to_seconds, CodecBannerScanner, LineCursor, ProgressScanner};
use crate::probe::{self, MediaMetadata};
use crate::process::{ProcessObserver, StartedProcess, ToolCommand};
use crate::rewrite;
use crate::tools::{Tool, ToolLocator};

const PUMP_CHUNK: usize = 64 * 1024;
const DEFAULT_OUTPUT_CLOSE_GRACE: Duration = Duration::from_millis(20);
const OUTPUT_CLOSED: &str = "output stream closed";

type Reader = Box<dyn AsyncRead + Send + Unpin>;
type Writer = Box<dyn AsyncWrite + Send + Unpin>;

type StartListener = Arc<dyn Fn(&[String]) + Send + Sync>;
type ProgressListener = Arc<dyn Fn(&Progress) + Send + Sync>;
type CodecDataListener = Arc<dyn Fn(&CodecData) + Send + Sync>;
type StderrListener = Arc<dyn Fn(&str) + Send + Sync>;
type ErrorListener = Arc<dyn Fn(&Error, &str, &str) + Send + Sync>;
type EndListener = Arc<dyn Fn(&str, &str) + Send + Sync>;
type EventListener = Arc<dyn Fn(&RunEvent) + Send + Sync>;

/// Where a run currently is.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum RunPhase {
    #[default]
    Idle,
    Preparing,
    Running,
    Finalizing,
    Completed,
    Failed,
}

impl fmt::Display for RunPhase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            RunPhase::Idle => "idle",
            RunPhase::Preparing => "preparing",
            RunPhase::Running => "running",
            RunPhase::Finalizing => "finalizing",
            RunPhase::Completed => "completed",
            RunPhase::Failed => "failed",
        };
        f.write_str(name)
    }
}

/// Result of a successful run.
#[derive(Debug, Clone)]
pub struct RunOutput {
    pub run_id: RunId,
    /// Arguments ffmpeg was started with.
    pub args: Vec<String>,
    /// Captured stdout; empty when stdout fed an output stream.
    pub stdout: String,
    pub stderr: String,
}

// ---------------------------------------------------------------------------
// Listeners
// ---------------------------------------------------------------------------

#[derive(Default, Clone)]
struct Listeners {
    start: Vec<StartListener>,
    progress: Vec<ProgressListener>,
    codec_data: Vec<CodecDataListener>,
    stderr: Vec<StderrListener>,
    error: Vec<ErrorListener>,
    end: Vec<EndListener>,
    events: Vec<EventListener>,
}

impl Listeners {
    fn event(&self, run_id: RunId, payload: impl FnOnce() -> RunEventPayload) {
        if self.events.is_empty() {
            return;
        }
        let event = RunEvent::new(run_id, payload());
        for listener in &self.events {
            listener(&event);
        }
    }

    fn start(&self, run_id: RunId, args: &[String]) {
        for listener in &self.start {
            listener(args);
        }
        self.event(run_id, || RunEventPayload::Start {
            args: args.to_vec(),
        });
    }

    fn progress(&self, run_id: RunId, progress: &Progress) {
        for listener in &self.progress {
            listener(progress);
        }
        self.event(run_id, || RunEventPayload::Progress(progress.clone()));
    }

    fn codec_data(&self, run_id: RunId, data: &CodecData) {
        for listener in &self.codec_data {
            listener(data);
        }
        self.event(run_id, || RunEventPayload::CodecData(data.clone()));
    }

    fn stderr_line(&self, run_id: RunId, line: &str) {
        for listener in &self.stderr {
            listener(line);
        }
        self.event(run_id, || RunEventPayload::Stderr {
            line: line.to_string(),
        });
    }

    fn wants_stderr_lines(&self) -> bool {
        !self.stderr.is_empty() || !self.events.is_empty()
    }
}

/// Emits the single terminal event of a run. Firing consumes the latch.
struct TerminalLatch<'a> {
    listeners: &'a Listeners,
    run_id: RunId,
}

impl<'a> TerminalLatch<'a> {
    fn new(listeners: &'a Listeners, run_id: RunId) -> Self {
        Self { listeners, run_id }
    }

    fn fail<T>(self, error: Error, stdout: &str, stderr: &str) -> Result<T> {
        tracing::info!("ffmpeg run failed: {error}");
        for listener in &self.listeners.error {
            listener(&error, stdout, stderr);
        }
        self.listeners.event(self.run_id, || RunEventPayload::Error {
            message: error.to_string(),
        });
        Err(error)
    }

    fn end(self, args: Vec<String>, stdout: String, stderr: String) -> Result<RunOutput> {
        tracing::info!("ffmpeg run completed");
        for listener in &self.listeners.end {
            listener(&stdout, &stderr);
        }
        self.listeners.event(self.run_id, || RunEventPayload::End);
        Ok(RunOutput {
            run_id: self.run_id,
            args,
            stdout,
            stderr,
        })
    }
}

// ---------------------------------------------------------------------------
// FfmpegCommand
// ---------------------------------------------------------------------------

/// Builder and runner for one ffmpeg invocation.
///
/// # Example
///
/// ```no_run
/// use fp_av::FfmpegCommand;
///
/// # async fn example() -> fp_core::Result<()> {
/// let mut cmd = FfmpegCommand::new();
/// cmd.input("in.mp4")
///     .video_codec("libx264")
///     .size("1280x?")
///     .on_progress(|p| println!("{:?}%", p.percent));
/// cmd.save("out.mp4").await?;
/// # Ok(())
/// # }
/// ```
pub struct FfmpegCommand {
    spec: CommandSpec,
    locator: ToolLocator,
    niceness: AtomicI32,
    timeout: Option<Duration>,
    output_close_grace: Duration,
    validate_capabilities: bool,
    /// First builder misuse, reported when the command runs.
    pending_error: Option<String>,
    input_stream: Mutex<Option<Reader>>,
    output_stream: Mutex<Option<Writer>>,
    listeners: Listeners,
    slot: ProcessSlot,
    phase: Mutex<RunPhase>,
}

impl Default for FfmpegCommand {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Debug for FfmpegCommand {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("FfmpegCommand")
            .field("spec", &self.spec)
            .field("niceness", &self.niceness.load(Ordering::Relaxed))
            .field("timeout", &self.timeout)
            .field("phase", &*self.phase.lock())
            .finish_non_exhaustive()
    }
}

impl FfmpegCommand {
    pub fn new() -> Self {
        Self {
            spec: CommandSpec::default(),
            locator: ToolLocator::default(),
            niceness: AtomicI32::new(0),
            timeout: None,
            output_close_grace: DEFAULT_OUTPUT_CLOSE_GRACE,
            validate_capabilities: false,
            pending_error: None,
            input_stream: Mutex::new(None),
            output_stream: Mutex::new(None),
            listeners: Listeners::default(),
            slot: ProcessSlot::new(),
            phase: Mutex::new(RunPhase::Idle),
        }
    }

    /// A command using the tool paths and run defaults of `config`.
    pub fn with_config(config: &Config) -> Self {
        let mut cmd = Self::new();
        cmd.locator = ToolLocator::new(config.tools.clone());
        cmd.niceness = AtomicI32::new(clamp_niceness(config.run.niceness));
        cmd.timeout = config.run.timeout();
        cmd.output_close_grace = config.run.output_close_grace();
        cmd.validate_capabilities = config.run.validate_capabilities;
        cmd
    }

    fn misuse(&mut self, message: impl Into<String>) {
        let message = message.into();
        tracing::debug!("Recording command error: {message}");
        self.pending_error.get_or_insert(message);
    }

    fn last_input(&mut self) -> Option<&mut InputSpec> {
        if self.spec.inputs.is_empty() {
            self.misuse("No input specified");
        }
        self.spec.inputs.last_mut()
    }

    /// The output being configured, created without a target if none exists.
    fn current_output(&mut self) -> &mut OutputSpec {
        if self.spec.outputs.is_empty() {
            self.spec.outputs.push(OutputSpec::default());
        }
        let last = self.spec.outputs.len() - 1;
        &mut self.spec.outputs[last]
    }

    fn set_output_target(&mut self, target: OutputTarget) {
        match self.spec.outputs.last_mut() {
            Some(output) if output.target == OutputTarget::None => output.target = target,
            _ => self.spec.outputs.push(OutputSpec::new(target)),
        }
    }

    // ---- Inputs ----

    /// Add a file path or URL input.
    pub fn input(&mut self, source: impl Into<String>) -> &mut Self {
        self.spec
            .inputs
            .push(InputSpec::new(InputSource::Path(source.into())));
        self
    }

    /// Add an input read from `reader` through ffmpeg's stdin. Only one
    /// stream input is supported.
    pub fn input_stream(&mut self, reader: impl AsyncRead + Send + Unpin + 'static) -> &mut Self {
        if self.spec.has_stream_input() {
            self.misuse("Only one input stream is supported");
            return self;
        }
        self.spec.inputs.push(InputSpec::new(InputSource::Stream));
        *self.input_stream.get_mut() = Some(Box::new(reader));
        self
    }

    /// Add options placed before the last input's `-i`.
    pub fn input_options(&mut self, options: impl IntoIterator<Item = impl Into<String>>) -> &mut Self {
        let options: Vec<String> = options.into_iter().map(Into::into).collect();
        if let Some(input) = self.last_input() {
            input.options.extend(options);
        }
        self
    }

    pub fn input_option(&mut self, option: impl Into<String>) -> &mut Self {
        self.input_options([option.into()])
    }

    /// Force the demuxer of the last input.
    pub fn input_format(&mut self, format: impl Into<String>) -> &mut Self {
        self.input_options(["-f".to_string(), format.into()])
    }

    /// Seek the last input before decoding.
    pub fn seek_input(&mut self, position: impl Into<String>) -> &mut Self {
        self.input_options(["-ss".to_string(), position.into()])
    }

    /// Read the last input at its native frame rate.
    pub fn native_framerate(&mut self) -> &mut Self {
        self.input_option("-re")
    }

    // ---- Outputs ----

    /// Set the target of the current output, or add a new output.
    pub fn output(&mut self, target: impl Into<String>) -> &mut Self {
        self.set_output_target(OutputTarget::Path(target.into()));
        self
    }

    /// Write an output to `writer` through ffmpeg's stdout. Only one stream
    /// output is supported.
    pub fn output_stream(&mut self, writer: impl AsyncWrite + Send + Unpin + 'static) -> &mut Self {
        if self.spec.has_stream_output() {
            self.misuse("Only one output stream is supported");
            return self;
        }
        self.set_output_target(OutputTarget::Stream);
        *self.output_stream.get_mut() = Some(Box::new(writer));
        self
    }

    pub fn output_options(&mut self, options: impl IntoIterator<Item = impl Into<String>>) -> &mut Self {
        self.current_output()
            .options
            .extend(options.into_iter().map(Into::into));
        self
    }

    pub fn output_option(&mut self, option: impl Into<String>) -> &mut Self {
        self.output_options([option.into()])
    }

    /// Force the muxer of the current output.
    pub fn format(&mut self, format: impl Into<String>) -> &mut Self {
        self.output_options(["-f".to_string(), format.into()])
    }

    /// Stop writing the current output after `duration`.
    pub fn duration(&mut self, duration: impl Into<String>) -> &mut Self {
        self.output_options(["-t".to_string(), duration.into()])
    }

    /// Seek the current output (decode and discard up to `position`).
    pub fn seek(&mut self, position: impl Into<String>) -> &mut Self {
        self.output_options(["-ss".to_string(), position.into()])
    }

    /// Rewrite FLV metadata of the current output once the run succeeds.
    pub fn flvmeta(&mut self) -> &mut Self {
        self.current_output().flvmeta = true;
        self
    }

    // ---- Audio ----

    fn audio_options(&mut self, options: [String; 2]) -> &mut Self {
        self.current_output().audio.extend(options);
        self
    }

    pub fn audio_codec(&mut self, codec: impl Into<String>) -> &mut Self {
        self.audio_options(["-acodec".into(), codec.into()])
    }

    /// Audio bitrate; a bare number is taken as kbit/s.
    pub fn audio_bitrate(&mut self, bitrate: impl Into<String>) -> &mut Self {
        self.audio_options(["-b:a".into(), with_kilo_suffix(bitrate.into())])
    }

    pub fn audio_channels(&mut self, channels: u32) -> &mut Self {
        self.audio_options(["-ac".into(), channels.to_string()])
    }

    pub fn audio_frequency(&mut self, hz: u32) -> &mut Self {
        self.audio_options(["-ar".into(), hz.to_string()])
    }

    pub fn audio_quality(&mut self, quality: u32) -> &mut Self {
        self.audio_options(["-aq".into(), quality.to_string()])
    }

    /// Append an audio filter, e.g. `"volume=0.5"`.
    pub fn audio_filter(&mut self, filter: impl Into<FilterArg>) -> &mut Self {
        match filter.into().resolve() {
            Ok(filter) => self.current_output().audio_filters.push(filter),
            Err(e) => self.misuse(e.to_string()),
        }
        self
    }

    pub fn audio_filters(&mut self, filters: impl IntoIterator<Item = impl Into<FilterArg>>) -> &mut Self {
        for filter in filters {
            self.audio_filter(filter);
        }
        self
    }

    /// Drop audio from the current output.
    pub fn no_audio(&mut self) -> &mut Self {
        let output = self.current_output();
        output.audio.clear();
        output.audio_filters.clear();
        output.audio.push("-an".into());
        self
    }

    // ---- Video ----

    fn video_options(&mut self, options: [String; 2]) -> &mut Self {
        self.current_output().video.extend(options);
        self
    }

    pub fn video_codec(&mut self, codec: impl Into<String>) -> &mut Self {
        self.video_options(["-vcodec".into(), codec.into()])
    }

    /// Video bitrate; a bare number is taken as kbit/s.
    pub fn video_bitrate(&mut self, bitrate: impl Into<String>) -> &mut Self {
        self.video_options(["-b:v".into(), with_kilo_suffix(bitrate.into())])
    }

    pub fn fps(&mut self, fps: f64) -> &mut Self {
        self.video_options(["-r".into(), fps.to_string()])
    }

    /// Stop after `frames` video frames.
    pub fn frames(&mut self, frames: u64) -> &mut Self {
        self.video_options(["-vframes".into(), frames.to_string()])
    }

    pub fn video_filter(&mut self, filter: impl Into<FilterArg>) -> &mut Self {
        match filter.into().resolve() {
            Ok(filter) => self.current_output().video_filters.push(filter),
            Err(e) => self.misuse(e.to_string()),
        }
        self
    }

    pub fn video_filters(&mut self, filters: impl IntoIterator<Item = impl Into<FilterArg>>) -> &mut Self {
        for filter in filters {
            self.video_filter(filter);
        }
        self
    }

    /// Output size: `"640x480"`, `"640x?"`, `"?x480"` or `"50%"`.
    pub fn size(&mut self, size: impl Into<String>) -> &mut Self {
        let size = size.into();
        if let Err(e) = size.parse::<args::Size>() {
            self.misuse(e.to_string());
            return self;
        }
        self.current_output().size = Some(size);
        self
    }

    /// Display aspect ratio, `"16:9"` or `"1.777"`.
    pub fn aspect(&mut self, aspect: impl Into<String>) -> &mut Self {
        let aspect = aspect.into();
        if let Err(e) = args::parse_aspect(&aspect) {
            self.misuse(e.to_string());
            return self;
        }
        self.current_output().aspect = Some(aspect);
        self
    }

    /// Letterbox into the exact output size with `color` padding.
    pub fn autopad(&mut self, color: Option<&str>) -> &mut Self {
        self.current_output().autopad = Some(color.unwrap_or("black").to_string());
        self
    }

    /// Drop video from the current output.
    pub fn no_video(&mut self) -> &mut Self {
        let output = self.current_output();
        output.video.clear();
        output.video_filters.clear();
        output.size = None;
        output.video.push("-vn".into());
        self
    }

    // ---- Global ----

    /// Set the `-filter_complex` graph and the labels mapped to the outputs.
    pub fn complex_filter(
        &mut self,
        filters: impl IntoIterator<Item = ComplexFilter>,
        map: impl IntoIterator<Item = impl Into<String>>,
    ) -> &mut Self {
        self.spec.complex = filters.into_iter().collect();
        self.spec.complex_map = map.into_iter().map(Into::into).collect();
        self
    }

    pub fn global_option(&mut self, option: impl Into<String>) -> &mut Self {
        self.spec.global.push(option.into());
        self
    }

    /// Overwrite existing output files.
    pub fn overwrite(&mut self) -> &mut Self {
        self.global_option("-y")
    }

    // ---- Run-time options ----

    pub fn locator(&mut self, locator: ToolLocator) -> &mut Self {
        self.locator = locator;
        self
    }

    /// Scheduling priority for future runs, clamped to the supported range.
    pub fn niceness(&mut self, value: i32) -> &mut Self {
        *self.niceness.get_mut() = clamp_niceness(value);
        self
    }

    /// Kill ffmpeg and fail the run after `timeout`.
    pub fn timeout(&mut self, timeout: Duration) -> &mut Self {
        self.timeout = Some(timeout);
        self
    }

    /// Delay between an output stream closing and ffmpeg being killed.
    pub fn output_close_grace(&mut self, grace: Duration) -> &mut Self {
        self.output_close_grace = grace;
        self
    }

    /// Check codecs and formats against ffmpeg's catalogs before spawning.
    pub fn validate_capabilities(&mut self, validate: bool) -> &mut Self {
        self.validate_capabilities = validate;
        self
    }

    // ---- Listeners ----

    pub fn on_start(&mut self, f: impl Fn(&[String]) + Send + Sync + 'static) -> &mut Self {
        self.listeners.start.push(Arc::new(f));
        self
    }

    /// Subscribe to progress reports. Enables `-progress` output (or stderr
    /// stats lines when stdout feeds an output stream) and an input
    /// duration probe.
    pub fn on_progress(&mut self, f: impl Fn(&Progress) + Send + Sync + 'static) -> &mut Self {
        self.listeners.progress.push(Arc::new(f));
        self
    }

    pub fn on_codec_data(&mut self, f: impl Fn(&CodecData) + Send + Sync + 'static) -> &mut Self {
        self.listeners.codec_data.push(Arc::new(f));
        self
    }

    /// Subscribe to every complete stderr line.
    pub fn on_stderr(&mut self, f: impl Fn(&str) + Send + Sync + 'static) -> &mut Self {
        self.listeners.stderr.push(Arc::new(f));
        self
    }

    /// Called with the error, stdout and stderr when a run fails.
    pub fn on_error(&mut self, f: impl Fn(&Error, &str, &str) + Send + Sync + 'static) -> &mut Self {
        self.listeners.error.push(Arc::new(f));
        self
    }

    /// Called with stdout and stderr when a run succeeds.
    pub fn on_end(&mut self, f: impl Fn(&str, &str) + Send + Sync + 'static) -> &mut Self {
        self.listeners.end.push(Arc::new(f));
        self
    }

    /// Subscribe to every event as a [`RunEvent`].
    pub fn on_event(&mut self, f: impl Fn(&RunEvent) + Send + Sync + 'static) -> &mut Self {
        self.listeners.events.push(Arc::new(f));
        self
    }

    // ---- Inspection ----

    pub fn spec(&self) -> &CommandSpec {
        &self.spec
    }

    /// The arguments a run would start ffmpeg with, without progress flags.
    pub fn args(&self) -> Result<Vec<String>> {
        if let Some(message) = &self.pending_error {
            return Err(Error::config(message.clone()));
        }
        args::assemble(&self.spec)
    }

    pub fn phase(&self) -> RunPhase {
        *self.phase.lock()
    }

    pub fn is_running(&self) -> bool {
        self.slot.is_busy()
    }

    pub fn current_niceness(&self) -> i32 {
        self.niceness.load(Ordering::Relaxed)
    }

    // ---- Control ----

    /// Send `signal` to the running ffmpeg. Returns `false` (with a warning)
    /// when nothing is running.
    pub fn kill(&self, signal: KillSignal) -> bool {
        match self.slot.live() {
            Some(process) => process.control.signal(signal),
            None => {
                tracing::warn!("No running ffmpeg process to send {signal} to");
                false
            }
        }
    }

    /// Change the priority of future runs and, best-effort, of the running
    /// process.
    pub fn renice(&self, value: i32) {
        let value = clamp_niceness(value);
        self.niceness.store(value, Ordering::Relaxed);
        if let Some(process) = self.slot.live() {
            process.control.renice(value);
        }
    }

    /// Read the metadata of the input at `index`.
    pub async fn ffprobe(&self, index: usize) -> Result<MediaMetadata> {
        match self.spec.inputs.get(index).map(|i| &i.source) {
            Some(InputSource::Path(path)) => probe::ffprobe(&self.locator, path).await,
            Some(InputSource::Stream) => Err(Error::config("Cannot probe a stream input")),
            None => Err(Error::config(format!("No input at index {index}"))),
        }
    }

    // ---- Running ----

    /// Write to `target` and run.
    pub async fn save(&mut self, target: impl Into<String>) -> Result<RunOutput> {
        self.output(target);
        self.run().await
    }

    /// Write to `writer` and run.
    pub async fn pipe(&mut self, writer: impl AsyncWrite + Send + Unpin + 'static) -> Result<RunOutput> {
        self.output_stream(writer);
        self.run().await
    }

    /// Run ffmpeg once with the current configuration.
    ///
    /// # Errors
    ///
    /// Any error reported through the `error` event: configuration and tool
    /// resolution errors before spawning, process, stream and timeout errors
    /// while running, and post-processing errors after a successful exit.
    pub async fn run(&self) -> Result<RunOutput> {
        let run_id = RunId::new();
        let span = tracing::info_span!("ffmpeg_run", %run_id);
        self.run_once(run_id).instrument(span).await
    }

    fn enter(&self, phase: RunPhase) {
        let previous = std::mem::replace(&mut *self.phase.lock(), phase);
        tracing::debug!("Run phase {previous} -> {phase}");
    }

    async fn run_once(&self, run_id: RunId) -> Result<RunOutput> {
        let terminal = TerminalLatch::new(&self.listeners, run_id);

        let Some(_reservation) = self.slot.reserve() else {
            return terminal.fail(Error::config("ffmpeg is already running"), "", "");
        };

        self.enter(RunPhase::Preparing);
        let mut prepared = match self.prepare().await {
            Ok(prepared) => prepared,
            Err(e) => {
                self.enter(RunPhase::Failed);
                return terminal.fail(e, "", "");
            }
        };

        tracing::info!("Starting ffmpeg {}", prepared.args.join(" "));
        self.enter(RunPhase::Running);

        let input = prepared.input.take();
        let output = prepared.output.take();
        let mut tool = ToolCommand::new(Tool::Ffmpeg);
        tool.args(prepared.args.iter().cloned())
            .niceness(self.niceness.load(Ordering::Relaxed))
            .deadline(self.timeout)
            .capture_stdout(output.is_none())
            .capture_stderr(true)
            .pipe_stdin(input.is_some());

        let mut observer = RunObserver::new(&self.listeners, run_id, &prepared, self.output_close_grace);
        observer.input = input;
        observer.output = output;
        let completion = tool
            .supervise(&self.locator, &mut observer, Some(&self.slot))
            .await;

        self.enter(RunPhase::Finalizing);
        let succeeded = completion.result.is_ok();
        let output_closed = observer
            .finish(succeeded, completion.stderr.as_deref().unwrap_or_default())
            .await;

        let stdout = completion.stdout.unwrap_or_default();
        let stderr = completion.stderr.unwrap_or_default();

        if let Err(e) = completion.result {
            self.enter(RunPhase::Failed);
            // Dying of SIGPIPE or the grace kill is the closed destination's doing.
            let e = if output_closed && e.category() == ErrorCategory::Process {
                Error::OutputStream(OUTPUT_CLOSED.to_string())
            } else {
                e.with_diagnostic(extract_error(&stderr))
            };
            return terminal.fail(e, &stdout, &stderr);
        }

        if !prepared.flvmeta.is_empty() {
            if let Err(e) = rewrite::rewrite_all(&self.locator, &prepared.flvmeta).await {
                self.enter(RunPhase::Failed);
                return terminal.fail(e, &stdout, &stderr);
            }
        }

        self.enter(RunPhase::Completed);
        terminal.end(prepared.args, stdout, stderr)
    }

    async fn prepare(&self) -> Result<Prepared> {
        if let Some(message) = &self.pending_error {
            return Err(Error::config(message.clone()));
        }
        if !self.spec.has_target() {
            return Err(Error::config("No output specified"));
        }

        let mut spec = self.spec.clone();

        let mut flvmeta = Vec::new();
        for output in &mut spec.outputs {
            if !output.flvmeta {
                continue;
            }
            match output.path() {
                Some(path) => flvmeta.push(path.to_string()),
                None => {
                    tracing::warn!("Metadata rewriting needs a file output; ignoring it for a stream");
                    output.flvmeta = false;
                }
            }
        }
        if !flvmeta.is_empty() {
            self.locator.resolve(Tool::Flvmeta)?;
        }

        let stream_out = spec.has_stream_output();
        let wants_progress = !self.listeners.progress.is_empty();
        let mut duration = None;
        let progress = match (wants_progress, stream_out) {
            (false, _) => None,
            (true, true) => {
                tracing::debug!("stdout feeds an output stream; reading progress from stderr stats");
                Some(ProgressSource::Stderr)
            }
            (true, false) => {
                spec.global
                    .extend(["-progress", "pipe:1", "-nostats"].map(String::from));
                Some(ProgressSource::Stdout)
            }
        };
        if progress.is_some() {
            if let Some(input) = spec.first_file_input() {
                match probe::ffprobe(&self.locator, input).await {
                    Ok(meta) => duration = meta.duration(),
                    Err(e) => tracing::warn!("Could not read duration of {input}: {e}"),
                }
            }
        }

        if self.validate_capabilities {
            capabilities::validate(&self.locator, &spec).await?;
        }

        let args = args::assemble(&spec)?;

        let input = if spec.has_stream_input() {
            Some(self.input_stream.lock().take().ok_or_else(|| {
                Error::config("Input stream was already consumed by a previous run")
            })?)
        } else {
            None
        };
        let output = if stream_out {
            let writer = self.output_stream.lock().take();
            if writer.is_none() {
                // Nothing was started, so the input stream stays usable.
                if let Some(reader) = input {
                    *self.input_stream.lock() = Some(reader);
                }
                return Err(Error::config(
                    "Output stream was already consumed by a previous run",
                ));
            }
            writer
        } else {
            None
        };

        Ok(Prepared {
            args,
            duration,
            progress,
            flvmeta,
            input,
            output,
        })
    }
}

fn with_kilo_suffix(bitrate: String) -> String {
    if !bitrate.is_empty() && bitrate.chars().all(|c| c.is_ascii_digit()) {
        format!("{bitrate}k")
    } else {
        bitrate
    }
}

/// A filter given either as text (`"scale=640:-2"`) or already structured.
#[derive(Debug, Clone)]
pub enum FilterArg {
    Text(String),
    Filter(Filter),
}

impl FilterArg {
    fn resolve(self) -> Result<Filter> {
        match self {
            FilterArg::Text(text) => text.parse(),
            FilterArg::Filter(filter) => Ok(filter),
        }
    }
}

impl From<&str> for FilterArg {
    fn from(text: &str) -> Self {
        FilterArg::Text(text.to_string())
    }
}

impl From<String> for FilterArg {
    fn from(text: String) -> Self {
        FilterArg::Text(text)
    }
}

impl From<Filter> for FilterArg {
    fn from(filter: Filter) -> Self {
        FilterArg::Filter(filter)
    }
}

// ---------------------------------------------------------------------------
// Run internals
// ---------------------------------------------------------------------------

/// Where progress reports are read from.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum ProgressSource {
    /// `-progress pipe:1` key=value blocks.
    Stdout,
    /// Classic `frame=... time=...` stats lines.
    Stderr,
}

/// Everything a run needs once preparation succeeded.
struct Prepared {
    args: Vec<String>,
    duration: Option<f64>,
    progress: Option<ProgressSource>,
    flvmeta: Vec<String>,
    input: Option<Reader>,
    output: Option<Writer>,
}

/// Connects supervisor events to listeners and stream pumps.
struct RunObserver<'a> {
    listeners: &'a Listeners,
    run_id: RunId,
    args: &'a [String],
    progress: Option<ProgressScanner>,
    progress_source: Option<ProgressSource>,
    banner: Option<CodecBannerScanner>,
    stderr_lines: Option<LineCursor>,
    input: Option<Reader>,
    output: Option<Writer>,
    grace: Duration,
    output_closed: Arc<AtomicBool>,
    input_task: Option<JoinHandle<()>>,
    output_task: Option<JoinHandle<()>>,
}

impl<'a> RunObserver<'a> {
    fn new(listeners: &'a Listeners, run_id: RunId, prepared: &'a Prepared, grace: Duration) -> Self {
        let progress = prepared
            .progress
            .map(|_| ProgressScanner::new(prepared.duration));
        let needs_banner_duration = progress.is_some() && prepared.duration.is_none();
        let wants_codec_data = !listeners.codec_data.is_empty() || !listeners.events.is_empty();
        let banner = (wants_codec_data || needs_banner_duration).then(CodecBannerScanner::new);

        Self {
            listeners,
            run_id,
            args: &prepared.args,
            progress,
            progress_source: prepared.progress,
            banner,
            stderr_lines: listeners.wants_stderr_lines().then(LineCursor::default),
            input: None,
            output: None,
            grace,
            output_closed: Arc::new(AtomicBool::new(false)),
            input_task: None,
            output_task: None,
        }
    }

    fn scan_progress(&mut self, accumulated: &str) {
        if let Some(scanner) = &mut self.progress {
            for progress in scanner.scan(accumulated) {
                self.listeners.progress(self.run_id, &progress);
            }
        }
    }

    /// Wait for the stream pumps and flush a trailing stderr line.
    ///
    /// Returns whether the output stream's destination went away.
    async fn finish(&mut self, succeeded: bool, stderr: &str) -> bool {
        if let Some(task) = self.input_task.take() {
            task.abort();
        }
        if let Some(task) = self.output_task.take() {
            if succeeded {
                if let Err(e) = task.await {
                    tracing::debug!("Output stream task ended abnormally: {e}");
                }
            } else {
                task.abort();
            }
        }

        if let Some(cursor) = &self.stderr_lines {
            if let Some(rest) = stderr.get(cursor.offset()..) {
                let rest = rest.trim();
                if !rest.is_empty() {
                    self.listeners.stderr_line(self.run_id, rest);
                }
            }
        }

        self.output_closed.load(Ordering::Acquire)
    }
}

impl ProcessObserver for RunObserver<'_> {
    fn started(&mut self, process: &mut StartedProcess) {
        self.listeners.start(self.run_id, self.args);

        if let (Some(reader), Some(stdin)) = (self.input.take(), process.take_stdin()) {
            let control = process.control().clone();
            self.input_task = Some(tokio::spawn(pump_input(reader, stdin, control)));
        }
        if let (Some(writer), Some(stdout)) = (self.output.take(), process.take_stdout()) {
            let pump = OutputPump {
                control: process.control().clone(),
                grace: self.grace,
                closed: Arc::clone(&self.output_closed),
            };
            self.output_task = Some(tokio::spawn(pump_output(stdout, writer, pump)));
        }
    }

    fn stdout_chunk(&mut self, _chunk: &str, accumulated: &str) {
        if self.progress_source == Some(ProgressSource::Stdout) {
            self.scan_progress(accumulated);
        }
    }

    fn stderr_chunk(&mut self, _chunk: &str, accumulated: &str) {
        if let Some(banner) = &mut self.banner {
            if let Some(data) = banner.scan(accumulated) {
                if let Some(scanner) = &mut self.progress {
                    if scanner.duration().is_none() {
                        scanner.set_duration(timemark_to_seconds(&data.duration));
                    }
                }
                self.listeners.codec_data(self.run_id, &data);
            }
        }

        if self.progress_source == Some(ProgressSource::Stderr) {
            self.scan_progress(accumulated);
        }

        if let Some(cursor) = &mut self.stderr_lines {
            for line in cursor.complete_lines(accumulated) {
                self.listeners.stderr_line(self.run_id, line);
            }
        }
    }
}

/// Copy the input stream into ffmpeg's stdin.
async fn pump_input(mut source: Reader, mut stdin: ChildStdin, control: ControlHandle) {
    let mut buf = vec![0u8; PUMP_CHUNK];
    loop {
        let n = match source.read(&mut buf).await {
            Ok(0) => break,
            Ok(n) => n,
            Err(e) => {
                control.abort(Error::InputStream(e.to_string()));
                return;
            }
        };
        if let Err(e) = stdin.write_all(&buf[..n]).await {
            // ffmpeg stopped reading; its exit reports why.
            tracing::debug!("ffmpeg closed stdin: {e}");
            return;
        }
    }
    if let Err(e) = stdin.shutdown().await {
        tracing::debug!("Closing ffmpeg stdin failed: {e}");
    }
}

/// What the output pump needs to stop the run when its destination closes.
struct OutputPump {
    control: ControlHandle,
    grace: Duration,
    closed: Arc<AtomicBool>,
}

/// Copy ffmpeg's stdout into the output stream.
async fn pump_output(mut stdout: ChildStdout, mut dest: Writer, pump: OutputPump) {
    let OutputPump {
        control,
        grace,
        closed,
    } = pump;
    let mut buf = vec![0u8; PUMP_CHUNK];
    loop {
        let n = match stdout.read(&mut buf).await {
            Ok(0) => break,
            Ok(n) => n,
            Err(e) => {
                tracing::debug!("Reading ffmpeg stdout failed: {e}");
                break;
            }
        };
        if let Err(e) = dest.write_all(&buf[..n]).await {
            if matches!(
                e.kind(),
                ErrorKind::BrokenPipe | ErrorKind::ConnectionReset | ErrorKind::WriteZero
            ) {
                tracing::debug!("Output stream closed; stopping ffmpeg in {grace:?}");
                closed.store(true, Ordering::Release);
                drop(stdout);
                tokio::time::sleep(grace).await;
                control.abort(Error::OutputStream(OUTPUT_CLOSED.to_string()));
            } else {
                control.abort(Error::OutputStream(e.to_string()));
            }
            return;
        }
    }
    if let Err(e) = dest.shutdown().await {
        tracing::debug!("Closing output stream failed: {e}");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use assert_matches::assert_matches;

    #[test]
    fn output_setters_create_an_output() {
        let mut cmd = FfmpegCommand::new();
        cmd.input("in.mp4").audio_codec("aac").output("out.mp4");
        assert_eq!(cmd.spec().outputs.len(), 1);
        assert_eq!(
            cmd.args().unwrap(),
            vec!["-i", "in.mp4", "-acodec", "aac", "out.mp4"]
        );
    }

    #[test]
    fn output_after_target_adds_another() {
        let mut cmd = FfmpegCommand::new();
        cmd.input("in.mp4")
            .output("a.mp4")
            .video_codec("libx264")
            .output("b.mkv")
            .video_codec("copy");
        let outputs = &cmd.spec().outputs;
        assert_eq!(outputs.len(), 2);
        assert_eq!(outputs[0].video, vec!["-vcodec", "libx264"]);
        assert_eq!(outputs[1].video, vec!["-vcodec", "copy"]);
    }

    #[test]
    fn input_options_need_an_input() {
        let mut cmd = FfmpegCommand::new();
        cmd.input_format("mp4").output("o.mp4");
        assert_matches!(cmd.args(), Err(Error::Config(ref m)) if m == "No input specified");
    }

    #[test]
    fn input_option_helpers() {
        let mut cmd = FfmpegCommand::new();
        cmd.input("in.ts")
            .input_format("mpegts")
            .seek_input("10")
            .native_framerate()
            .output("o.mp4");
        assert_eq!(
            cmd.args().unwrap(),
            vec!["-f", "mpegts", "-ss", "10", "-re", "-i", "in.ts", "o.mp4"]
        );
    }

    #[test]
    fn second_stream_is_misuse() {
        let mut cmd = FfmpegCommand::new();
        cmd.input_stream(tokio::io::empty())
            .input_stream(tokio::io::empty())
            .output("o.mp4");
        assert_matches!(cmd.args(), Err(Error::Config(ref m)) if m.contains("one input stream"));

        let mut cmd = FfmpegCommand::new();
        cmd.input("in.mp4")
            .output_stream(tokio::io::sink())
            .output_stream(tokio::io::sink());
        assert_matches!(cmd.args(), Err(Error::Config(ref m)) if m.contains("one output stream"));
    }

    #[test]
    fn first_misuse_is_kept() {
        let mut cmd = FfmpegCommand::new();
        cmd.input("in.mp4").size("huge").aspect("wide").output("o.mp4");
        assert_matches!(cmd.args(), Err(Error::Config(ref m)) if m.contains("size"));
    }

    #[test]
    fn bad_filter_is_recorded() {
        let mut cmd = FfmpegCommand::new();
        cmd.input("in.mp4").video_filter("no good=1").output("o.mp4");
        assert_matches!(cmd.args(), Err(Error::Config(_)));
    }

    #[test]
    fn audio_and_video_helpers() {
        let mut cmd = FfmpegCommand::new();
        cmd.input("in.mp4")
            .audio_bitrate("128")
            .audio_channels(2)
            .audio_frequency(44100)
            .audio_filters(["volume=0.5", "aresample=48000"])
            .video_bitrate("1M")
            .fps(25.0)
            .frames(100)
            .video_filter(Filter::new("hflip"))
            .size("50%")
            .duration("5")
            .format("mp4")
            .output("o.mp4");
        assert_eq!(
            cmd.args().unwrap(),
            vec![
                "-i", "in.mp4", "-b:a", "128k", "-ac", "2", "-ar", "44100", "-filter:a",
                "volume=0.5,aresample=48000", "-b:v", "1M", "-r", "25", "-vframes", "100",
                "-filter:v", "hflip,scale=w=trunc(iw*50/100/2)*2:h=trunc(ih*50/100/2)*2",
                "-t", "5", "-f", "mp4", "o.mp4",
            ]
        );
    }

    #[test]
    fn no_audio_and_no_video_replace_options() {
        let mut cmd = FfmpegCommand::new();
        cmd.input("in.mp4")
            .audio_codec("aac")
            .no_audio()
            .video_codec("libx264")
            .size("640x480")
            .no_video()
            .output("o.mp4");
        assert_eq!(cmd.args().unwrap(), vec!["-i", "in.mp4", "-an", "-vn", "o.mp4"]);
    }

    #[test]
    fn overwrite_and_globals_follow_inputs() {
        let mut cmd = FfmpegCommand::new();
        cmd.overwrite().input("in.mp4").output("o.mp4");
        assert_eq!(cmd.args().unwrap(), vec!["-i", "in.mp4", "-y", "o.mp4"]);
    }

    #[test]
    fn niceness_is_clamped() {
        let mut cmd = FfmpegCommand::new();
        cmd.niceness(999);
        assert_eq!(cmd.current_niceness(), 19);
        cmd.renice(-999);
        assert_eq!(cmd.current_niceness(), -20);
    }

    #[test]
    fn kill_without_process_is_noop() {
        let cmd = FfmpegCommand::new();
        assert!(!cmd.kill(KillSignal::Kill));
        assert!(!cmd.is_running());
    }

    #[test]
    fn with_config_applies_run_defaults() {
        let mut config = Config::default();
        config.run.niceness = 50;
        config.run.timeout_secs = Some(9);
        config.run.output_close_grace_ms = 5;
        let cmd = FfmpegCommand::with_config(&config);
        assert_eq!(cmd.current_niceness(), 19);
        assert_eq!(cmd.timeout, Some(Duration::from_secs(9)));
        assert_eq!(cmd.output_close_grace, Duration::from_millis(5));
    }

    #[test]
    fn kilo_suffix() {
        assert_eq!(with_kilo_suffix("128".into()), "128k");
        assert_eq!(with_kilo_suffix("2M".into()), "2M");
        assert_eq!(with_kilo_suffix(String::new()), "");
    }

    #[tokio::test]
    async fn no_output_fails_before_spawn() {
        let errors = Arc::new(Mutex::new(Vec::new()));
        let seen = errors.clone();

        let mut cmd = FfmpegCommand::new();
        cmd.input("in.mp4")
            .on_error(move |e, _, _| seen.lock().push(e.to_string()));

        let err = cmd.run().await.unwrap_err();
        assert!(err.is_pre_spawn());
        assert_eq!(errors.lock().len(), 1);
        assert_eq!(cmd.phase(), RunPhase::Failed);
    }

    #[tokio::test]
    async fn probing_a_stream_input_is_rejected() {
        let mut cmd = FfmpegCommand::new();
        cmd.input_stream(tokio::io::empty());
        assert_matches!(cmd.ffprobe(0).await, Err(Error::Config(_)));
        assert_matches!(cmd.ffprobe(3).await, Err(Error::Config(_)));
    }
}
