//! The legacy path grammar.
//!
//! A legacy path is a run of recognized segments followed by the image key:
//!
//! ```text
//! /unsafe/fit-in/10x10:200x200/300x0/s3:photos/filters:grayscale():quality(80)/cats/tom (1).jpg
//!  ^^^^^^ ^^^^^^ ^^^^^^^^^^^^^ ^^^^^ ^^^^^^^^^ ^^^^^^^^^^^^^^^^^^^^^^^^^^^^^^ ^^^^^^^^^^^^^^^
//!  ignored fit    crop          resize bucket   filter chain                  key
//! ```
//!
//! Segments are consumed left to right. The first segment that is not
//! recognized starts the key, and nothing after it is interpreted, so file
//! names may contain parentheses, `x`, or anything else. A filter chain may
//! contain `/` inside its parentheses (`filters:watermark(b,logos/a.png,0,0)`).
//!
//! Geometry segments become edits first (crop, then resize), followed by the
//! filters in path order. A `quality()` seen before the output format is
//! known is stored as [`EditOperation::PendingQuality`] and resolved during
//! normalization.
//!
//! A `WxH` segment crops to fill (`cover`). With `fit-in`, or when one side
//! is `0`, the image fits inside the box instead.
//!
//! [`RewriteRule`] turns a custom URL scheme into this grammar first.

use crate::edits::{CropRegion, EditMap, EditOperation, Overlay, quality_value};
use crate::imaging::calculations::RoundCropRequest;
use crate::imaging::{EncoderOptions, Kernel, Rgba};
use crate::types::{Fit, ImageFormat};
use percent_encoding::percent_decode_str;
use regex::Regex;
use std::sync::LazyLock;
use tracing::debug;

static CROP_SEGMENT: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"^(\d{1,6})x(\d{1,6}):(\d{1,6})x(\d{1,6})$").expect("static pattern")
});
static RESIZE_SEGMENT: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"^(\d+)x(\d+)$").expect("static pattern"));
static ROUND_CROP_ARGS: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"(\d+)x(\d+)(?::(\d+)x(\d+))?").expect("static pattern")
});
static PERCENT_POSITION: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"^(100|[1-9]?\d|-(100|[1-9]\d?))p$").expect("static pattern")
});

const FILTERS_PREFIX: &str = "filters:";
const AUTHORS_PREFIX: &str = "authors/";
const BUCKET_PREFIX: &str = "s3:";

/// A parsed legacy path.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct LegacyPath {
    pub edits: EditMap,
    /// Percent-decoded object key.
    pub key: String,
    /// Buckets named by `s3:` segments, in path order.
    pub buckets: Vec<String>,
}

/// One `name(args)` call from a filter chain.
#[derive(Debug, Clone, PartialEq, Eq)]
struct Filter<'a> {
    name: &'a str,
    args: &'a str,
}

#[derive(Default)]
struct Segments<'a> {
    crop: Option<(f64, f64, f64, f64)>,
    resize: Option<(f64, f64)>,
    fit_in: bool,
    round_crop: bool,
    buckets: Vec<String>,
    filters: Vec<Filter<'a>>,
}

/// Parse a legacy path into edits, key and bucket hints.
pub fn parse_path(path: &str) -> LegacyPath {
    let (segments, raw_key) = split_segments(path);
    let key = percent_decode_str(raw_key).decode_utf8_lossy().into_owned();
    let key_format = super::classify::extension(&key).and_then(ImageFormat::from_name);

    let mut edits = EditMap::new();
    if let Some((left, top, right, bottom)) = segments.crop {
        edits.insert(EditOperation::Crop(Some(CropRegion {
            left: left as i64,
            top: top as i64,
            width: (right - left) as i64,
            height: (bottom - top) as i64,
        })));
    }
    if let Some((width, height)) = segments.resize {
        let resize = edits.resize_entry();
        resize.width = (width != 0.0).then_some(width);
        resize.height = (height != 0.0).then_some(height);
        resize.fit = Some(if width == 0.0 || height == 0.0 {
            Fit::Inside
        } else {
            Fit::Cover
        });
    }
    if segments.fit_in {
        edits.resize_entry().fit = Some(Fit::Inside);
    }
    if segments.round_crop {
        edits.insert(EditOperation::RoundCrop(RoundCropRequest::default()));
    }
    for filter in &segments.filters {
        apply_filter(filter, key_format, &mut edits);
    }

    LegacyPath {
        edits,
        key,
        buckets: segments.buckets,
    }
}

/// Just the edits of a legacy path.
pub fn map_path_to_edits(path: &str) -> EditMap {
    parse_path(path).edits
}

/// Consume recognized leading segments; the remainder is the raw key.
fn split_segments(path: &str) -> (Segments<'_>, &str) {
    let mut segments = Segments::default();
    let mut rest = path.trim_start_matches('/');
    rest = rest.strip_prefix(AUTHORS_PREFIX).unwrap_or(rest);

    loop {
        if rest.starts_with(FILTERS_PREFIX) {
            let Some(len) = filter_chain_len(rest) else {
                break;
            };
            let Some(tail) = rest[len..].strip_prefix('/') else {
                break;
            };
            segments.filters.extend(parse_chain(&rest[FILTERS_PREFIX.len()..len]));
            rest = tail;
            continue;
        }

        let Some((segment, tail)) = rest.split_once('/') else {
            break;
        };
        if segment == "unsafe" {
            // Signing marker of the legacy scheme; carries no edit.
        } else if segment == "fit-in" {
            segments.fit_in = true;
        } else if segment == "roundCrop:true" {
            segments.round_crop = true;
        } else if let Some(caps) = CROP_SEGMENT.captures(segment) {
            if segments.crop.is_none() {
                let n = |i: usize| caps[i].parse::<f64>().unwrap_or(0.0);
                segments.crop = Some((n(1), n(2), n(3), n(4)));
            }
        } else if let Some(caps) = RESIZE_SEGMENT.captures(segment) {
            if segments.resize.is_none() {
                let n = |i: usize| caps[i].parse::<f64>().unwrap_or(0.0);
                segments.resize = Some((n(1), n(2)));
            }
        } else if let Some(bucket) = segment.strip_prefix(BUCKET_PREFIX)
            && !bucket.is_empty()
        {
            segments.buckets.push(bucket.to_string());
        } else {
            break;
        }
        rest = tail;
    }
    (segments, rest)
}

/// Byte length of a `filters:a(..):b(..)` chain at the start of `input`.
/// Parentheses nest; `None` when the chain is malformed.
fn filter_chain_len(input: &str) -> Option<usize> {
    let bytes = input.as_bytes();
    let mut pos = FILTERS_PREFIX.len();
    loop {
        let name_len = bytes[pos..]
            .iter()
            .take_while(|b| b.is_ascii_alphanumeric() || **b == b'_')
            .count();
        if name_len == 0 || bytes.get(pos + name_len) != Some(&b'(') {
            return None;
        }
        pos += name_len + 1;
        let mut depth = 1usize;
        while depth > 0 {
            match bytes.get(pos)? {
                b'(' => depth += 1,
                b')' => depth -= 1,
                _ => {}
            }
            pos += 1;
        }
        if bytes.get(pos) != Some(&b':') {
            return Some(pos);
        }
        pos += 1;
    }
}

/// Split a validated chain body (`a(x):b(y)`) into filters.
fn parse_chain(body: &str) -> Vec<Filter<'_>> {
    let mut filters = Vec::new();
    let mut rest = body;
    while let Some(open) = rest.find('(') {
        let name = &rest[..open];
        let mut depth = 0usize;
        let mut close = None;
        for (i, c) in rest[open..].char_indices() {
            match c {
                '(' => depth += 1,
                ')' => {
                    depth -= 1;
                    if depth == 0 {
                        close = Some(open + i);
                        break;
                    }
                }
                _ => {}
            }
        }
        let Some(close) = close else {
            break;
        };
        filters.push(Filter {
            name,
            args: &rest[open + 1..close],
        });
        rest = rest[close + 1..].strip_prefix(':').unwrap_or("");
    }
    filters
}

fn apply_filter(filter: &Filter<'_>, key_format: Option<ImageFormat>, edits: &mut EditMap) {
    let args = filter.args;
    match filter.name {
        "autojpg" => {
            edits.insert(EditOperation::ToFormat(ImageFormat::Jpeg));
        }
        "background_color" => match Rgba::parse(args) {
            Some(color) => {
                edits.insert(EditOperation::Flatten(Some(color)));
            }
            None => debug!(color = args, "unknown background color"),
        },
        "blur" => {
            let mut values = args.split(',').map(parse_number);
            let radius = values.next().unwrap_or(f64::NAN);
            let sigma = values.next().unwrap_or(f64::NAN);
            let sigma = if sigma.is_nan() { radius / 2.0 } else { sigma };
            if sigma.is_finite() {
                edits.insert(EditOperation::Blur(Some(sigma)));
            }
        }
        "convolution" => {
            if let Some(kernel) = convolution_kernel(args) {
                edits.insert(EditOperation::Convolve(kernel));
            }
        }
        "equalize" => {
            edits.insert(EditOperation::Normalize(true));
        }
        "fill" => match Rgba::parse(args) {
            Some(color) => {
                let resize = edits.resize_entry();
                resize.fit = Some(Fit::Contain);
                resize.background = Some(color);
            }
            None => debug!(color = args, "unknown fill color"),
        },
        "format" => {
            let name: String = args.chars().filter(char::is_ascii_alphanumeric).collect();
            match ImageFormat::from_name(&name) {
                Some(format) => {
                    edits.insert(EditOperation::ToFormat(format));
                }
                None => debug!(format = args, "unsupported legacy format"),
            }
        }
        "grayscale" => {
            edits.insert(EditOperation::Grayscale(true));
        }
        "no_upscale" => {
            edits.resize_entry().without_enlargement = Some(true);
        }
        "proportion" => {
            let ratio = parse_number(args);
            let resize = edits.resize_entry();
            match (resize.width, resize.height) {
                (Some(w), Some(h)) if w != 0.0 && h != 0.0 => {
                    resize.width = Some(w * ratio);
                    resize.height = Some(h * ratio);
                }
                _ => resize.ratio = Some(ratio),
            }
        }
        "quality" => {
            let quality = parse_number(args);
            let target = key_format
                .or_else(|| edits.to_format())
                .filter(|f| f.accepts_quality());
            let op = match target {
                Some(format) => EditOperation::Encoder(
                    format,
                    EncoderOptions {
                        quality: quality_value(quality),
                        ..EncoderOptions::default()
                    },
                ),
                None => EditOperation::PendingQuality(quality),
            };
            edits.insert(op);
        }
        "rgb" => {
            let channel: Vec<f64> = args
                .split(',')
                .map(|pct| 255.0 * parse_number(pct) / 100.0)
                .collect();
            if let [r, g, b, ..] = channel[..] {
                edits.insert(EditOperation::Tint(Rgba::from_channels(r, g, b)));
            }
        }
        "rotate" => {
            let angle = parse_number(args);
            if angle.is_finite() {
                edits.insert(EditOperation::Rotate(Some(angle)));
            }
        }
        "sharpen" => {
            let radius = args.split(',').nth(1).map(parse_number).unwrap_or(f64::NAN);
            if radius.is_finite() {
                edits.insert(EditOperation::Sharpen(Some(1.0 + radius / 2.0)));
            }
        }
        "stretch" => {
            let resize = edits.resize_entry();
            if resize.fit != Some(Fit::Inside) {
                resize.fit = Some(Fit::Fill);
            }
        }
        "strip_exif" | "strip_icc" => {
            edits.insert(EditOperation::Rotate(None));
        }
        "upscale" => {
            edits.resize_entry().fit = Some(Fit::Inside);
        }
        "watermark" => {
            edits.insert(EditOperation::OverlayWith(watermark(args)));
        }
        "roundCrop" => {
            let request = match ROUND_CROP_ARGS.captures(args) {
                Some(caps) => {
                    let n = |i: usize| caps.get(i).and_then(|m| m.as_str().parse::<f64>().ok());
                    RoundCropRequest {
                        left: n(1),
                        top: n(2),
                        rx: n(3),
                        ry: n(4),
                    }
                }
                None => RoundCropRequest::default(),
            };
            edits.insert(EditOperation::RoundCrop(request));
        }
        other => debug!(filter = other, "dropping unknown filter"),
    }
}

/// Loose numeric parse: blank is NaN, surrounding whitespace ignored.
fn parse_number(text: &str) -> f64 {
    let text = text.trim();
    if text.is_empty() {
        return f64::NAN;
    }
    text.parse().unwrap_or(f64::NAN)
}

/// `k1;k2;…,width[,…]` → kernel with `height = ceil(len / width)`.
fn convolution_kernel(args: &str) -> Option<Kernel> {
    let mut parts = args.split(',');
    let kernel: Vec<f64> = parts.next()?.split(';').map(parse_number).collect();
    let width = parse_number(parts.next()?);
    if !width.is_finite() || width < 1.0 || kernel.iter().any(|v| !v.is_finite()) {
        debug!(args, "unusable convolution kernel");
        return None;
    }
    let width = width as u32;
    let height = (kernel.len() as f64 / f64::from(width)).ceil() as u32;
    Some(Kernel {
        width,
        height,
        kernel,
        scale: None,
        offset: None,
    })
}

fn is_position(value: &str) -> bool {
    PERCENT_POSITION.is_match(value) || (!value.is_empty() && value.parse::<f64>().is_ok())
}

/// `watermark(bucket,key,x,y[,alpha[,wRatio[,hRatio]]])`.
///
/// The key may itself contain commas, so it extends up to the first pair of
/// arguments that both read as positions.
fn watermark(args: &str) -> Overlay {
    let compact: String = args.chars().filter(|c| !c.is_whitespace()).collect();
    let parts: Vec<&str> = compact.split(',').collect();
    let position_at = (2..parts.len().saturating_sub(1))
        .find(|&i| is_position(parts[i]) && is_position(parts[i + 1]))
        .unwrap_or(2);

    let part = |i: usize| parts.get(i).copied().filter(|s| !s.is_empty());
    let key = parts
        .get(1..position_at.min(parts.len()))
        .map(|key_parts| key_parts.join(","))
        .unwrap_or_default();
    let position = |i: usize| part(i).filter(|p| is_position(p)).map(str::to_string);

    Overlay {
        bucket: part(0).unwrap_or_default().to_string(),
        key,
        left: position(position_at),
        top: position(position_at + 1),
        alpha: part(position_at + 2).map(str::to_string),
        w_ratio: part(position_at + 3).map(str::to_string),
        h_ratio: part(position_at + 4).map(str::to_string),
    }
}

/// A configured path rewrite.
///
/// `/body/flags` patterns are regular expressions (`i`, `m` and `s` become
/// inline flags, `g` replaces every match); anything else is a literal that
/// replaces its first occurrence. `$1` and `$&` in the substitution refer to
/// capture groups.
#[derive(Debug, Clone)]
pub enum RewriteRule {
    Regex {
        regex: Regex,
        global: bool,
        replacement: String,
    },
    Literal {
        pattern: String,
        substitution: String,
    },
}

impl RewriteRule {
    pub fn parse(pattern: &str, substitution: &str) -> Result<Self, regex::Error> {
        let delimited = pattern
            .strip_prefix('/')
            .and_then(|inner| inner.rsplit_once('/'))
            .filter(|(_, flags)| flags.chars().all(|c| "gimsuy".contains(c)));
        let Some((body, flags)) = delimited else {
            return Ok(RewriteRule::Literal {
                pattern: pattern.to_string(),
                substitution: substitution.to_string(),
            });
        };

        let inline: String = flags.chars().filter(|c| matches!(c, 'i' | 'm' | 's')).collect();
        let source = if inline.is_empty() {
            body.to_string()
        } else {
            format!("(?{inline}){body}")
        };
        Ok(RewriteRule::Regex {
            regex: Regex::new(&source)?,
            global: flags.contains('g'),
            replacement: replacement_template(substitution),
        })
    }

    pub fn apply(&self, path: &str) -> String {
        match self {
            RewriteRule::Regex {
                regex,
                global: true,
                replacement,
            } => regex.replace_all(path, replacement.as_str()).into_owned(),
            RewriteRule::Regex {
                regex, replacement, ..
            } => regex.replace(path, replacement.as_str()).into_owned(),
            RewriteRule::Literal {
                pattern,
                substitution,
            } => path.replacen(pattern.as_str(), substitution, 1),
        }
    }
}

/// Rewrite a path with the configured rule.
pub fn parse_custom_path(path: &str, rule: &RewriteRule) -> String {
    rule.apply(path)
}

/// Translate `$1`, `$&` and `$$` into `regex` replacement syntax. Any other
/// `$` is literal.
fn replacement_template(substitution: &str) -> String {
    let mut out = String::with_capacity(substitution.len());
    let mut chars = substitution.chars().peekable();
    while let Some(c) = chars.next() {
        if c != '$' {
            out.push(c);
            continue;
        }
        match chars.peek() {
            Some('&') => {
                chars.next();
                out.push_str("${0}");
            }
            Some(d) if d.is_ascii_digit() => {
                let mut group = String::new();
                while let Some(d) = chars.peek().filter(|d| d.is_ascii_digit()) {
                    group.push(*d);
                    chars.next();
                }
                out.push_str(&format!("${{{group}}}"));
            }
            Some('$') => {
                chars.next();
                out.push_str("$$");
            }
            _ => out.push_str("$$"),
        }
    }
    out
}
