//! Codec, encoder, format and filter catalogs reported by ffmpeg.
//!
//! Each catalog is read from `ffmpeg -hide_banner -<kind>` on first use and
//! cached for the lifetime of the process. Concurrent first uses share one
//! invocation; a failed read is not cached. [`reset`] drops every cached
//! catalog.

use std::collections::BTreeMap;
use std::str::FromStr;
use std::sync::{Arc, LazyLock};

use parking_lot::RwLock;
use regex::Regex;
use serde::{Deserialize, Serialize};
use tokio::sync::OnceCell;

use crate::args::CommandSpec;
use crate::process::ToolCommand;
use crate::tools::{Tool, ToolLocator};

static CODEC_LINE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"^\s*([D.])([E.])([VASDT])([I.])([L.])([S.]) (\S+)\s+(.*)$")
        .expect("valid codec line regex")
});
static ENCODER_LINE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"^\s*([VASD])([F.])([S.])([X.])([B.])([D.]) (\S+)\s+(.*)$")
        .expect("valid encoder line regex")
});
static FORMAT_LINE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"^\s?([D ])([E ])([d ]?) (\S+)\s+(.*)$").expect("valid format line regex")
});
static FILTER_LINE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"^\s*([T.])([S.])([C.]) (\S+)\s+(\S+)->(\S+)\s+(.*)$")
        .expect("valid filter line regex")
});

/// Catalog entries keyed by name.
pub type Catalog<T> = BTreeMap<String, T>;

/// Kind of stream a codec or encoder handles.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum MediaKind {
    Video,
    Audio,
    Subtitle,
    Data,
    Attachment,
}

impl MediaKind {
    fn from_flag(flag: &str) -> Option<Self> {
        match flag {
            "V" => Some(MediaKind::Video),
            "A" => Some(MediaKind::Audio),
            "S" => Some(MediaKind::Subtitle),
            "D" => Some(MediaKind::Data),
            "T" => Some(MediaKind::Attachment),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CodecInfo {
    pub kind: MediaKind,
    pub description: String,
    pub can_decode: bool,
    pub can_encode: bool,
    pub intra_frame_only: bool,
    pub lossy: bool,
    pub lossless: bool,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct EncoderInfo {
    pub kind: MediaKind,
    pub description: String,
    pub frame_mt: bool,
    pub slice_mt: bool,
    pub experimental: bool,
    pub draw_horiz_band: bool,
    pub direct_rendering: bool,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ContainerFormat {
    pub description: String,
    pub can_demux: bool,
    pub can_mux: bool,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FilterInfo {
    pub description: String,
    /// Input pads, e.g. `V`, `AA` or `N` for dynamic.
    pub input: String,
    pub output: String,
    pub timeline: bool,
    pub slice_threading: bool,
    pub command_support: bool,
}

/// Which catalog to read.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum CatalogKind {
    Codecs,
    Encoders,
    Formats,
    Filters,
}

impl CatalogKind {
    fn flag(self) -> &'static str {
        match self {
            CatalogKind::Codecs => "-codecs",
            CatalogKind::Encoders => "-encoders",
            CatalogKind::Formats => "-formats",
            CatalogKind::Filters => "-filters",
        }
    }
}

impl FromStr for CatalogKind {
    type Err = fp_core::Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "codecs" => Ok(CatalogKind::Codecs),
            "encoders" => Ok(CatalogKind::Encoders),
            "formats" => Ok(CatalogKind::Formats),
            "filters" => Ok(CatalogKind::Filters),
            other => Err(fp_core::Error::config(format!(
                "unknown capability catalog '{other}'"
            ))),
        }
    }
}

// ---------------------------------------------------------------------------
// Parsing
// ---------------------------------------------------------------------------

fn flag(capture: &str, set: &str) -> bool {
    capture == set
}

/// Parse `ffmpeg -codecs` output. Entries start after the `---` separator.
pub fn parse_codecs(text: &str) -> Catalog<CodecInfo> {
    let mut catalog = Catalog::new();
    let mut in_table = false;

    for line in text.lines() {
        if !in_table {
            in_table = line.trim_start().starts_with("---");
            continue;
        }
        let Some(caps) = CODEC_LINE.captures(line) else {
            continue;
        };
        if &caps[7] == "=" {
            continue;
        }
        let Some(kind) = MediaKind::from_flag(&caps[3]) else {
            continue;
        };
        catalog.insert(
            caps[7].to_string(),
            CodecInfo {
                kind,
                description: caps[8].trim().to_string(),
                can_decode: flag(&caps[1], "D"),
                can_encode: flag(&caps[2], "E"),
                intra_frame_only: flag(&caps[4], "I"),
                lossy: flag(&caps[5], "L"),
                lossless: flag(&caps[6], "S"),
            },
        );
    }

    catalog
}

/// Parse `ffmpeg -encoders` output.
pub fn parse_encoders(text: &str) -> Catalog<EncoderInfo> {
    let mut catalog = Catalog::new();

    for line in text.lines() {
        let Some(caps) = ENCODER_LINE.captures(line) else {
            continue;
        };
        if &caps[7] == "=" {
            continue;
        }
        let Some(kind) = MediaKind::from_flag(&caps[1]) else {
            continue;
        };
        catalog.insert(
            caps[7].to_string(),
            EncoderInfo {
                kind,
                description: caps[8].trim().to_string(),
                frame_mt: flag(&caps[2], "F"),
                slice_mt: flag(&caps[3], "S"),
                experimental: flag(&caps[4], "X"),
                draw_horiz_band: flag(&caps[5], "B"),
                direct_rendering: flag(&caps[6], "D"),
            },
        );
    }

    catalog
}

/// Parse `ffmpeg -formats` output. Comma-separated names become one entry
/// each.
pub fn parse_formats(text: &str) -> Catalog<ContainerFormat> {
    let mut catalog = Catalog::new();

    for line in text.lines() {
        let Some(caps) = FORMAT_LINE.captures(line) else {
            continue;
        };
        if &caps[4] == "=" {
            continue;
        }
        let can_demux = flag(&caps[1], "D");
        let can_mux = flag(&caps[2], "E");
        let description = caps[5].trim().to_string();

        for name in caps[4].split(',').filter(|n| !n.is_empty()) {
            let entry = catalog
                .entry(name.to_string())
                .or_insert_with(|| ContainerFormat {
                    description: description.clone(),
                    can_demux: false,
                    can_mux: false,
                });
            // Newer builds list demuxer and muxer on separate lines.
            entry.can_demux |= can_demux;
            entry.can_mux |= can_mux;
        }
    }

    catalog
}

/// Parse `ffmpeg -filters` output.
pub fn parse_filters(text: &str) -> Catalog<FilterInfo> {
    let mut catalog = Catalog::new();

    for line in text.lines() {
        let Some(caps) = FILTER_LINE.captures(line) else {
            continue;
        };
        if &caps[4] == "=" {
            continue;
        }
        catalog.insert(
            caps[4].to_string(),
            FilterInfo {
                description: caps[7].trim().to_string(),
                input: caps[5].to_string(),
                output: caps[6].to_string(),
                timeline: flag(&caps[1], "T"),
                slice_threading: flag(&caps[2], "S"),
                command_support: flag(&caps[3], "C"),
            },
        );
    }

    catalog
}

// ---------------------------------------------------------------------------
// Cache
// ---------------------------------------------------------------------------

#[derive(Default)]
struct Catalogs {
    codecs: OnceCell<Arc<Catalog<CodecInfo>>>,
    encoders: OnceCell<Arc<Catalog<EncoderInfo>>>,
    formats: OnceCell<Arc<Catalog<ContainerFormat>>>,
    filters: OnceCell<Arc<Catalog<FilterInfo>>>,
}

static CACHE: LazyLock<RwLock<Arc<Catalogs>>> =
    LazyLock::new(|| RwLock::new(Arc::new(Catalogs::default())));

fn current() -> Arc<Catalogs> {
    CACHE.read().clone()
}

/// Drop every cached catalog; the next lookup re-reads it.
pub fn reset() {
    *CACHE.write() = Arc::new(Catalogs::default());
}

async fn load<T>(
    locator: &ToolLocator,
    kind: CatalogKind,
    parse: fn(&str) -> Catalog<T>,
) -> fp_core::Result<Arc<Catalog<T>>> {
    let output = ToolCommand::new(Tool::Ffmpeg)
        .args(["-hide_banner", kind.flag()])
        .execute(locator)
        .await?;

    let catalog = parse(&output.stdout);
    if catalog.is_empty() {
        return Err(fp_core::Error::Capability(format!(
            "ffmpeg {} returned no entries",
            kind.flag()
        )));
    }
    tracing::debug!("Loaded {} entries from ffmpeg {}", catalog.len(), kind.flag());
    Ok(Arc::new(catalog))
}

pub async fn codecs(locator: &ToolLocator) -> fp_core::Result<Arc<Catalog<CodecInfo>>> {
    current()
        .codecs
        .get_or_try_init(|| load(locator, CatalogKind::Codecs, parse_codecs))
        .await
        .cloned()
}

pub async fn encoders(locator: &ToolLocator) -> fp_core::Result<Arc<Catalog<EncoderInfo>>> {
    current()
        .encoders
        .get_or_try_init(|| load(locator, CatalogKind::Encoders, parse_encoders))
        .await
        .cloned()
}

pub async fn formats(locator: &ToolLocator) -> fp_core::Result<Arc<Catalog<ContainerFormat>>> {
    current()
        .formats
        .get_or_try_init(|| load(locator, CatalogKind::Formats, parse_formats))
        .await
        .cloned()
}

pub async fn filters(locator: &ToolLocator) -> fp_core::Result<Arc<Catalog<FilterInfo>>> {
    current()
        .filters
        .get_or_try_init(|| load(locator, CatalogKind::Filters, parse_filters))
        .await
        .cloned()
}

/// A catalog as JSON, for reporting.
pub async fn catalog_json(
    locator: &ToolLocator,
    kind: CatalogKind,
) -> fp_core::Result<serde_json::Value> {
    let value = match kind {
        CatalogKind::Codecs => serde_json::to_value(&*codecs(locator).await?),
        CatalogKind::Encoders => serde_json::to_value(&*encoders(locator).await?),
        CatalogKind::Formats => serde_json::to_value(&*formats(locator).await?),
        CatalogKind::Filters => serde_json::to_value(&*filters(locator).await?),
    };
    value.map_err(|e| fp_core::Error::Capability(format!("serializing {kind:?}: {e}")))
}

// ---------------------------------------------------------------------------
// Validation
// ---------------------------------------------------------------------------

/// Codec and format names requested by a command's option tokens.
#[derive(Debug, Default, PartialEq, Eq)]
struct Requested {
    audio_codecs: Vec<String>,
    video_codecs: Vec<String>,
    input_formats: Vec<String>,
    output_formats: Vec<String>,
}

fn requested(spec: &CommandSpec) -> Requested {
    let mut req = Requested::default();

    for input in &spec.inputs {
        for pair in input.options.windows(2) {
            if pair[0] == "-f" {
                req.input_formats.push(pair[1].clone());
            }
        }
    }

    for output in &spec.outputs {
        for tokens in [&output.audio, &output.video, &output.options] {
            for pair in tokens.windows(2) {
                match pair[0].as_str() {
                    "-acodec" | "-c:a" | "-codec:a" => req.audio_codecs.push(pair[1].clone()),
                    "-vcodec" | "-c:v" | "-codec:v" => req.video_codecs.push(pair[1].clone()),
                    "-f" => req.output_formats.push(pair[1].clone()),
                    _ => {}
                }
            }
        }
    }

    req
}

/// Check the codecs and formats requested by `spec` against the catalogs.
///
/// # Errors
///
/// A configuration error naming the first unsupported codec or format, or
/// the error that prevented a catalog from loading.
pub async fn validate(locator: &ToolLocator, spec: &CommandSpec) -> fp_core::Result<()> {
    let req = requested(spec);

    if !req.audio_codecs.is_empty() || !req.video_codecs.is_empty() {
        let encoders = encoders(locator).await?;
        let wanted = req
            .audio_codecs
            .iter()
            .map(|c| (c, MediaKind::Audio))
            .chain(req.video_codecs.iter().map(|c| (c, MediaKind::Video)));
        for (codec, kind) in wanted {
            if codec == "copy" {
                continue;
            }
            match encoders.get(codec) {
                Some(info) if info.kind == kind => {}
                Some(_) => {
                    return Err(fp_core::Error::config(format!(
                        "encoder '{codec}' is not a {kind:?} encoder"
                    )))
                }
                None => {
                    return Err(fp_core::Error::config(format!(
                        "ffmpeg has no encoder '{codec}'"
                    )))
                }
            }
        }
    }

    if !req.input_formats.is_empty() || !req.output_formats.is_empty() {
        let formats = formats(locator).await?;
        for name in &req.input_formats {
            if !formats.get(name).is_some_and(|f| f.can_demux) {
                return Err(fp_core::Error::config(format!(
                    "ffmpeg cannot read format '{name}'"
                )));
            }
        }
        for name in &req.output_formats {
            if !formats.get(name).is_some_and(|f| f.can_mux) {
                return Err(fp_core::Error::config(format!(
                    "ffmpeg cannot write format '{name}'"
                )));
            }
        }
    }

    Ok(())
}
