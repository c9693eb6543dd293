//! ffmpeg argument assembly.
//!
//! [`assemble`] turns a [`CommandSpec`] snapshot into the ordered argument
//! list passed to the binary:
//!
//! 1. per input: its options, `-i`, its locator (`pipe:0` for a stream);
//! 2. global options;
//! 3. `-filter_complex` and its `-map` labels, when a complex graph exists;
//! 4. per output: audio options, `-filter:a`, video options, `-filter:v`
//!    (video and size filters), output options, then its locator (`pipe:1`
//!    for a stream, nothing for an absent target).
//!
//! Nothing here touches the filesystem or spawns anything.

use std::str::FromStr;
use std::sync::LazyLock;

use fp_core::{Error, Result};
use regex::Regex;
use serde::{Deserialize, Serialize};

static FILTER_NAME: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"^[A-Za-z0-9_]+(@[A-Za-z0-9_]+)?$").expect("valid filter name regex")
});
static STREAM_LABEL: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"^[A-Za-z0-9_:.]+$").expect("valid stream label regex"));

/// Locator ffmpeg reads a piped input from.
pub const STDIN_LOCATOR: &str = "pipe:0";
/// Locator ffmpeg writes a piped output to.
pub const STDOUT_LOCATOR: &str = "pipe:1";

// ---------------------------------------------------------------------------
// Spec types
// ---------------------------------------------------------------------------

/// Frozen description of one ffmpeg invocation.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct CommandSpec {
    pub inputs: Vec<InputSpec>,
    pub outputs: Vec<OutputSpec>,
    /// Options placed after the inputs and before any output.
    pub global: Vec<String>,
    pub complex: Vec<ComplexFilter>,
    /// Labels mapped into the outputs with `-map [label]`.
    pub complex_map: Vec<String>,
}

impl CommandSpec {
    /// Whether any output has somewhere to write.
    pub fn has_target(&self) -> bool {
        self.outputs.iter().any(|o| o.target != OutputTarget::None)
    }

    pub fn has_stream_input(&self) -> bool {
        self.inputs.iter().any(|i| i.source == InputSource::Stream)
    }

    pub fn has_stream_output(&self) -> bool {
        self.outputs.iter().any(|o| o.target == OutputTarget::Stream)
    }

    /// Path of the first input that is a file rather than a stream.
    pub fn first_file_input(&self) -> Option<&str> {
        self.inputs.iter().find_map(|i| match &i.source {
            InputSource::Path(path) => Some(path.as_str()),
            InputSource::Stream => None,
        })
    }
}

/// Where an input comes from.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum InputSource {
    /// A path or URL passed to ffmpeg as-is.
    Path(String),
    /// A byte stream written to the process's stdin.
    Stream,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct InputSpec {
    pub source: InputSource,
    /// Options placed before this input's `-i`.
    pub options: Vec<String>,
}

impl InputSpec {
    pub fn new(source: InputSource) -> Self {
        Self {
            source,
            options: Vec::new(),
        }
    }
}

/// Where an output goes.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum OutputTarget {
    Path(String),
    /// A byte stream read from the process's stdout.
    Stream,
    /// Not set yet; contributes options but no locator.
    #[default]
    None,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct OutputSpec {
    pub target: OutputTarget,
    pub audio: Vec<String>,
    pub audio_filters: Vec<Filter>,
    pub video: Vec<String>,
    pub video_filters: Vec<Filter>,
    pub size: Option<String>,
    /// Display aspect ratio, `"4:3"` or `"1.333"`.
    pub aspect: Option<String>,
    /// Pad colour used to letterbox into an exact size.
    pub autopad: Option<String>,
    pub options: Vec<String>,
    /// Rewrite FLV metadata after a successful run.
    pub flvmeta: bool,
}

impl OutputSpec {
    pub fn new(target: OutputTarget) -> Self {
        Self {
            target,
            ..Default::default()
        }
    }

    /// The file path, when this output writes to a file.
    pub fn path(&self) -> Option<&str> {
        match &self.target {
            OutputTarget::Path(path) => Some(path),
            _ => None,
        }
    }
}

// ---------------------------------------------------------------------------
// Filters
// ---------------------------------------------------------------------------

/// Options of a single filter.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FilterOptions {
    #[default]
    None,
    /// `name=a:b:c`
    Positional(Vec<String>),
    /// `name=k=v:k2=v2`
    Named(Vec<(String, String)>),
    /// Already-escaped option text, used verbatim.
    Raw(String),
}

/// A filter in a simple or complex filter chain.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Filter {
    pub name: String,
    pub options: FilterOptions,
}

impl Filter {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            options: FilterOptions::None,
        }
    }

    pub fn positional(
        name: impl Into<String>,
        values: impl IntoIterator<Item = impl Into<String>>,
    ) -> Self {
        Self {
            name: name.into(),
            options: FilterOptions::Positional(values.into_iter().map(Into::into).collect()),
        }
    }

    pub fn named<K: Into<String>, V: Into<String>>(
        name: impl Into<String>,
        pairs: impl IntoIterator<Item = (K, V)>,
    ) -> Self {
        Self {
            name: name.into(),
            options: FilterOptions::Named(
                pairs
                    .into_iter()
                    .map(|(k, v)| (k.into(), v.into()))
                    .collect(),
            ),
        }
    }

    /// Render as `name[=options]`.
    ///
    /// # Errors
    ///
    /// A configuration error if the name is not a valid filter name.
    pub fn render(&self) -> Result<String> {
        if !FILTER_NAME.is_match(&self.name) {
            return Err(Error::config(format!("invalid filter name '{}'", self.name)));
        }

        let options = match &self.options {
            FilterOptions::None => return Ok(self.name.clone()),
            FilterOptions::Positional(values) => values
                .iter()
                .map(|v| escape_value(v))
                .collect::<Vec<_>>()
                .join(":"),
            FilterOptions::Named(pairs) => {
                let mut rendered = Vec::with_capacity(pairs.len());
                for (key, value) in pairs {
                    if key.is_empty() || !key.chars().all(|c| c.is_ascii_alphanumeric() || c == '_') {
                        return Err(Error::config(format!(
                            "invalid option '{key}' for filter '{}'",
                            self.name
                        )));
                    }
                    rendered.push(format!("{key}={}", escape_value(value)));
                }
                rendered.join(":")
            }
            FilterOptions::Raw(raw) => raw.clone(),
        };

        if options.is_empty() {
            Ok(self.name.clone())
        } else {
            Ok(format!("{}={options}", self.name))
        }
    }
}

impl FromStr for Filter {
    type Err = Error;

    /// Parse `"name"` or `"name=options"`; options are kept verbatim.
    fn from_str(s: &str) -> Result<Self> {
        let s = s.trim();
        let (name, options) = match s.split_once('=') {
            Some((name, options)) => (name, FilterOptions::Raw(options.to_string())),
            None => (s, FilterOptions::None),
        };
        if !FILTER_NAME.is_match(name) {
            return Err(Error::config(format!("invalid filter description '{s}'")));
        }
        Ok(Self {
            name: name.to_string(),
            options,
        })
    }
}

/// Quote a filter option value when it contains graph syntax.
fn escape_value(value: &str) -> String {
    if value.contains([':', ',', ';', '[', ']', '=', '\'', '\\']) {
        format!("'{}'", value.replace('\'', r"'\''"))
    } else {
        value.to_string()
    }
}

/// One node of a `-filter_complex` graph.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ComplexFilter {
    pub filter: Filter,
    /// Input pad labels, without brackets (e.g. `0:v`).
    pub inputs: Vec<String>,
    /// Output pad labels, without brackets.
    pub outputs: Vec<String>,
}

impl ComplexFilter {
    pub fn new(filter: Filter) -> Self {
        Self {
            filter,
            inputs: Vec::new(),
            outputs: Vec::new(),
        }
    }

    pub fn inputs(mut self, labels: impl IntoIterator<Item = impl Into<String>>) -> Self {
        self.inputs = labels.into_iter().map(Into::into).collect();
        self
    }

    pub fn outputs(mut self, labels: impl IntoIterator<Item = impl Into<String>>) -> Self {
        self.outputs = labels.into_iter().map(Into::into).collect();
        self
    }

    /// Render as `[in]name=opts[out]`.
    pub fn render(&self) -> Result<String> {
        let mut out = String::new();
        for label in &self.inputs {
            out.push_str(&bracket(label)?);
        }
        out.push_str(&self.filter.render()?);
        for label in &self.outputs {
            out.push_str(&bracket(label)?);
        }
        Ok(out)
    }
}

fn bracket(label: &str) -> Result<String> {
    let label = label.trim_start_matches('[').trim_end_matches(']');
    if !STREAM_LABEL.is_match(label) {
        return Err(Error::config(format!("invalid stream label '{label}'")));
    }
    Ok(format!("[{label}]"))
}

// ---------------------------------------------------------------------------
// Size
// ---------------------------------------------------------------------------

/// A parsed output size setting.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Size {
    /// `"640x480"`
    Exact { width: u32, height: u32 },
    /// `"640x?"`, height follows the aspect ratio.
    Width(u32),
    /// `"?x480"`, width follows the aspect ratio.
    Height(u32),
    /// `"50%"`
    Percent(u32),
}

impl FromStr for Size {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        let invalid = || Error::config(format!("invalid size specification '{s}'"));
        let dimension = |v: &str| v.parse::<u32>().ok().filter(|&n| n > 0);
        let trimmed = s.trim();

        if let Some(percent) = trimmed.strip_suffix('%') {
            return dimension(percent).map(Size::Percent).ok_or_else(invalid);
        }

        let (w, h) = trimmed.split_once(['x', 'X']).ok_or_else(invalid)?;
        match (w, h) {
            ("?", "?") => Err(invalid()),
            ("?", h) => dimension(h).map(Size::Height).ok_or_else(invalid),
            (w, "?") => dimension(w).map(Size::Width).ok_or_else(invalid),
            (w, h) => match (dimension(w), dimension(h)) {
                (Some(width), Some(height)) => Ok(Size::Exact { width, height }),
                _ => Err(invalid()),
            },
        }
    }
}

/// Parse `"16:9"` or `"1.7777"` into a ratio.
pub fn parse_aspect(aspect: &str) -> Result<f64> {
    let invalid = || Error::config(format!("invalid aspect ratio '{aspect}'"));
    let ratio = match aspect.trim().split_once(':') {
        Some((w, h)) => {
            let w: f64 = w.parse().map_err(|_| invalid())?;
            let h: f64 = h.parse().map_err(|_| invalid())?;
            if h == 0.0 {
                return Err(invalid());
            }
            w / h
        }
        None => aspect.trim().parse().map_err(|_| invalid())?,
    };
    if ratio.is_finite() && ratio > 0.0 {
        Ok(ratio)
    } else {
        Err(invalid())
    }
}

/// Round to the nearest even dimension, as most encoders require.
fn even(value: f64) -> Result<u32> {
    let rounded = ((value / 2.0).round() * 2.0).max(2.0);
    if !rounded.is_finite() || rounded > f64::from(u32::MAX) {
        return Err(Error::config(format!(
            "computed dimension {value:.0} is out of range"
        )));
    }
    Ok(rounded as u32)
}

/// Scale (and pad) filters implementing a size setting.
///
/// # Errors
///
/// A configuration error when the aspect ratio pushes the computed
/// dimension out of range.
pub fn size_filters(size: Size, aspect: Option<f64>, autopad: Option<&str>) -> Result<Vec<Filter>> {
    let size = match (size, aspect) {
        (Size::Width(width), Some(a)) => Size::Exact {
            width,
            height: even(f64::from(width) / a)?,
        },
        (Size::Height(height), Some(a)) => Size::Exact {
            width: even(f64::from(height) * a)?,
            height,
        },
        (size, _) => size,
    };

    let filters = match size {
        Size::Exact { width, height } => match autopad {
            Some(color) => vec![
                Filter::named(
                    "scale",
                    [
                        ("w", width.to_string()),
                        ("h", height.to_string()),
                        ("force_original_aspect_ratio", "decrease".to_string()),
                    ],
                ),
                Filter::named(
                    "pad",
                    [
                        ("w", width.to_string()),
                        ("h", height.to_string()),
                        ("x", "(ow-iw)/2".to_string()),
                        ("y", "(oh-ih)/2".to_string()),
                        ("color", color.to_string()),
                    ],
                ),
            ],
            None => vec![Filter::named(
                "scale",
                [("w", width.to_string()), ("h", height.to_string())],
            )],
        },
        Size::Width(width) => vec![Filter::named(
            "scale",
            [("w", width.to_string()), ("h", "trunc(ow/a/2)*2".to_string())],
        )],
        Size::Height(height) => vec![Filter::named(
            "scale",
            [("w", "trunc(oh*a/2)*2".to_string()), ("h", height.to_string())],
        )],
        Size::Percent(p) => vec![Filter::named(
            "scale",
            [
                ("w", format!("trunc(iw*{p}/100/2)*2")),
                ("h", format!("trunc(ih*{p}/100/2)*2")),
            ],
        )],
    };
    Ok(filters)
}

// ---------------------------------------------------------------------------
// assemble
// ---------------------------------------------------------------------------

/// Build the ordered argument list for `spec`.
///
/// # Errors
///
/// A configuration error for malformed filters, stream labels, size or
/// aspect settings.
pub fn assemble(spec: &CommandSpec) -> Result<Vec<String>> {
    let mut args = Vec::new();

    for input in &spec.inputs {
        args.extend(input.options.iter().cloned());
        args.push("-i".to_string());
        args.push(match &input.source {
            InputSource::Path(path) => path.clone(),
            InputSource::Stream => STDIN_LOCATOR.to_string(),
        });
    }

    args.extend(spec.global.iter().cloned());

    if !spec.complex.is_empty() {
        let graph = spec
            .complex
            .iter()
            .map(ComplexFilter::render)
            .collect::<Result<Vec<_>>>()?
            .join(";");
        args.push("-filter_complex".to_string());
        args.push(graph);
        for label in &spec.complex_map {
            args.push("-map".to_string());
            args.push(bracket(label)?);
        }
    }

    for output in &spec.outputs {
        assemble_output(output, &mut args)?;
    }

    Ok(args)
}

fn assemble_output(output: &OutputSpec, args: &mut Vec<String>) -> Result<()> {
    args.extend(output.audio.iter().cloned());
    if !output.audio_filters.is_empty() {
        args.push("-filter:a".to_string());
        args.push(render_chain(&output.audio_filters)?);
    }

    args.extend(output.video.iter().cloned());

    let aspect = output.aspect.as_deref().map(parse_aspect).transpose()?;
    let mut video_filters = output.video_filters.clone();
    match output.size.as_deref() {
        Some(size) => {
            let size: Size = size.parse()?;
            video_filters.extend(size_filters(size, aspect, output.autopad.as_deref())?);
        }
        None => {
            if let Some(aspect) = &output.aspect {
                args.push("-aspect".to_string());
                args.push(aspect.trim().to_string());
            }
        }
    }
    if !video_filters.is_empty() {
        args.push("-filter:v".to_string());
        args.push(render_chain(&video_filters)?);
    }

    args.extend(output.options.iter().cloned());

    match &output.target {
        OutputTarget::Path(path) => args.push(path.clone()),
        OutputTarget::Stream => args.push(STDOUT_LOCATOR.to_string()),
        OutputTarget::None => {}
    }
    Ok(())
}

fn render_chain(filters: &[Filter]) -> Result<String> {
    Ok(filters
        .iter()
        .map(Filter::render)
        .collect::<Result<Vec<_>>>()?
        .join(","))
}
