//! Edit-map normalization.
//!
//! Runs after decoding, once the source content type is known. Each pass
//! takes the map by value and hands back a new one:
//!
//! 1. resize defaults and validation (sides in `1..=MAX_DIMENSION`)
//! 2. output-format decision (explicit, SVG rasterization, then `Accept`)
//! 3. WebP effort validation
//! 4. legacy quality reconciliation
//!
//! Running the passes again on their own output changes nothing.

use crate::config::AutoFormatConfig;
use crate::edits::{EditMap, EditOperation, ResizeEdit, quality_value};
use crate::error::HandlerError;
use crate::imaging::EncoderOptions;
use crate::imaging::calculations::MAX_DIMENSION;
use crate::types::{CONTENT_TYPE_SVG, Fit, ImageFormat, RequestType};
use tracing::debug;

/// WebP effort used when the requested one is unusable.
pub const DEFAULT_EFFORT: u8 = 4;
const MAX_EFFORT: f64 = 6.0;

/// Request facts the passes depend on besides the edits themselves.
#[derive(Debug, Clone, Copy)]
pub struct NormalizeInput<'a> {
    pub request_type: RequestType,
    /// Content type of the source object.
    pub content_type: &'a str,
    /// Request-level output format (DEFAULT payloads only).
    pub output_format: Option<&'a str>,
    /// Request-level WebP effort (DEFAULT payloads only).
    pub effort: Option<f64>,
    /// The request's `Accept` header.
    pub accept: Option<&'a str>,
    pub auto_format: AutoFormatConfig,
}

#[derive(Debug, Clone, PartialEq)]
pub struct Normalized {
    pub edits: EditMap,
    pub output_format: Option<ImageFormat>,
    pub effort: Option<u8>,
    /// Content type of the response.
    pub content_type: String,
}

pub fn normalize(edits: EditMap, input: &NormalizeInput<'_>) -> Result<Normalized, HandlerError> {
    let edits = normalize_resize(edits)?;
    let output_format = decide_output_format(&edits, input)?;
    let effort = resolve_effort(output_format, input);
    let edits = if input.request_type.uses_path_grammar() {
        let source_format = ImageFormat::from_content_type(input.content_type);
        remap_quality(resolve_pending_quality(edits, output_format.or(source_format)), output_format)
    } else {
        edits
    };
    let content_type = output_format
        .map(ImageFormat::content_type)
        .unwrap_or_else(|| input.content_type.to_string());

    debug!(?output_format, ?effort, %content_type, "normalized edits");
    Ok(Normalized {
        edits,
        output_format,
        effort,
        content_type,
    })
}

/// Inject the default resize, fold a ratio into known sides, round sides.
fn normalize_resize(edits: EditMap) -> Result<EditMap, HandlerError> {
    if edits.resize().is_none() {
        let mut edits = edits;
        edits.insert(EditOperation::Resize(ResizeEdit::implicit_inside()));
        return Ok(edits);
    }

    edits
        .into_iter()
        .map(|op| match op {
            EditOperation::Resize(resize) => checked_resize(resize).map(EditOperation::Resize),
            other => Ok(other),
        })
        .collect()
}

fn checked_resize(mut resize: ResizeEdit) -> Result<ResizeEdit, HandlerError> {
    if let (Some(width), Some(height), Some(ratio)) = (resize.width, resize.height, resize.ratio) {
        resize.width = Some(width * ratio);
        resize.height = Some(height * ratio);
        resize.ratio = None;
        resize.fit.get_or_insert(Fit::Inside);
    }
    let side = |value: Option<f64>| match value {
        Some(v) if v.is_nan() || v.round() <= 0.0 || v.round() > f64::from(MAX_DIMENSION) => {
            debug!(side = v, "resize side out of range");
            Err(HandlerError::InvalidResize)
        }
        Some(v) => Ok(Some(v.round())),
        None => Ok(None),
    };
    resize.width = side(resize.width)?;
    resize.height = side(resize.height)?;
    Ok(resize)
}

fn decide_output_format(
    edits: &EditMap,
    input: &NormalizeInput<'_>,
) -> Result<Option<ImageFormat>, HandlerError> {
    if let Some(format) = edits.to_format() {
        return Ok(Some(format));
    }
    if let Some(name) = input.output_format {
        return ImageFormat::from_name(name)
            .map(Some)
            .ok_or_else(|| HandlerError::UnsupportedOutputFormat {
                format: name.to_string(),
            });
    }
    if input.content_type == CONTENT_TYPE_SVG {
        // Vector sources are only rasterized when something edits them.
        return Ok(edits.has_effect().then_some(ImageFormat::Png));
    }
    Ok(negotiate(input.accept, input.auto_format))
}

/// Pick an automatic format from `Accept`. AVIF is preferred over WebP.
fn negotiate(accept: Option<&str>, auto: AutoFormatConfig) -> Option<ImageFormat> {
    let accept = accept?;
    if auto.avif && accept.contains("image/avif") {
        Some(ImageFormat::Avif)
    } else if auto.webp && accept.contains("image/webp") {
        Some(ImageFormat::Webp)
    } else {
        None
    }
}

fn resolve_effort(output_format: Option<ImageFormat>, input: &NormalizeInput<'_>) -> Option<u8> {
    if input.request_type != RequestType::Default || output_format != Some(ImageFormat::Webp) {
        return None;
    }
    let requested = input.effort?.trunc();
    if requested.is_finite() && (0.0..=MAX_EFFORT).contains(&requested) {
        Some(requested as u8)
    } else {
        debug!(requested, "effort out of range; using default");
        Some(DEFAULT_EFFORT)
    }
}

/// Give each pending `quality()` the format it was meant for, or drop it.
fn resolve_pending_quality(edits: EditMap, target: Option<ImageFormat>) -> EditMap {
    let target = target.filter(|f| f.accepts_quality());
    let taken = target.is_some_and(|f| edits.contains(f.as_str()));
    edits
        .into_iter()
        .filter_map(|op| match op {
            EditOperation::PendingQuality(quality) => match target {
                Some(format) if !taken => Some(EditOperation::Encoder(
                    format,
                    EncoderOptions {
                        quality: quality_value(quality),
                        ..EncoderOptions::default()
                    },
                )),
                _ => {
                    debug!(quality, "dropping quality without a usable format");
                    None
                }
            },
            other => Some(other),
        })
        .collect()
}

/// Move the first format-specific encoder entry to the output format.
fn remap_quality(edits: EditMap, output_format: Option<ImageFormat>) -> EditMap {
    let Some(output) = output_format.filter(|f| f.accepts_quality()) else {
        return edits;
    };
    let Some(stale) = edits.quality_format() else {
        return edits;
    };
    if stale == output || edits.contains(output.as_str()) {
        return edits;
    }
    debug!(from = %stale, to = %output, "remapping quality options");
    edits
        .into_iter()
        .map(|op| match op {
            EditOperation::Encoder(format, options) if format == stale => {
                EditOperation::Encoder(output, options)
            }
            other => other,
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::request::legacy::map_path_to_edits;
    use crate::types::CONTENT_TYPE_GENERIC;
    use serde_json::json;

    fn input(request_type: RequestType) -> NormalizeInput<'static> {
        NormalizeInput {
            request_type,
            content_type: "image/jpeg",
            output_format: None,
            effort: None,
            accept: None,
            auto_format: AutoFormatConfig::default(),
        }
    }

    fn default_edits(value: serde_json::Value) -> EditMap {
        serde_json::from_value(value).unwrap()
    }

    // =========================================================================
    // Resize
    // =========================================================================

    #[test]
    fn injects_implicit_resize() {
        let out = normalize(EditMap::new(), &input(RequestType::Default)).unwrap();
        assert_eq!(out.edits.resize(), Some(&ResizeEdit::implicit_inside()));
        assert!(!out.edits.has_effect());
    }

    #[test]
    fn rounds_numeric_string_sides() {
        let edits = default_edits(json!({"resize": {"width": "99.6", "height": 20.2}}));
        let out = normalize(edits, &input(RequestType::Default)).unwrap();
        let resize = out.edits.resize().unwrap();
        assert_eq!((resize.width, resize.height), (Some(100.0), Some(20.0)));
    }

    #[test]
    fn non_positive_or_garbage_sides_are_invalid() {
        for resize in [json!({"width": 0}), json!({"height": -5}), json!({"width": "abc"})] {
            let edits = default_edits(json!({ "resize": resize }));
            let err = normalize(edits, &input(RequestType::Default)).unwrap_err();
            assert_eq!(err.code(), "InvalidResizeException");
            assert_eq!(err.status(), 400);
        }
    }

    #[test]
    fn oversized_sides_are_invalid() {
        let edits = default_edits(json!({"resize": {"width": 4_000_000_000u64, "height": 10, "fit": "fill"}}));
        let err = normalize(edits, &input(RequestType::Default)).unwrap_err();
        assert_eq!(err.code(), "InvalidResizeException");

        let edits = default_edits(json!({"resize": {"width": 16383, "height": 16384}}));
        assert!(normalize(edits, &input(RequestType::Default)).is_err());

        let edits = default_edits(json!({"resize": {"width": 16383}}));
        assert!(normalize(edits, &input(RequestType::Default)).is_ok());
    }

    #[test]
    fn ratio_folds_into_known_sides() {
        let edits = map_path_to_edits("/200x100/filters:proportion(0.5)/cat.jpg");
        // Both sides known while parsing: scaled immediately.
        let out = normalize(edits, &input(RequestType::LegacyPath)).unwrap();
        let resize = out.edits.resize().unwrap();
        assert_eq!((resize.width, resize.height), (Some(100.0), Some(50.0)));

        let edits = default_edits(json!({"resize": {"width": 300, "height": 200, "ratio": 0.1}}));
        let out = normalize(edits, &input(RequestType::Default)).unwrap();
        let resize = out.edits.resize().unwrap();
        assert_eq!((resize.width, resize.height), (Some(30.0), Some(20.0)));
        assert_eq!(resize.ratio, None);
        assert_eq!(resize.fit, Some(Fit::Inside));
    }

    // =========================================================================
    // Output format
    // =========================================================================

    #[test]
    fn to_format_beats_payload_and_accept() {
        let edits = default_edits(json!({"toFormat": "png"}));
        let request = NormalizeInput {
            output_format: Some("jpeg"),
            accept: Some("image/webp"),
            auto_format: AutoFormatConfig { webp: true, avif: false },
            ..input(RequestType::Default)
        };
        let out = normalize(edits, &request).unwrap();
        assert_eq!(out.output_format, Some(ImageFormat::Png));
        assert_eq!(out.content_type, "image/png");
    }

    #[test]
    fn payload_format_beats_accept() {
        let request = NormalizeInput {
            output_format: Some("jpg"),
            accept: Some("image/webp,*/*"),
            auto_format: AutoFormatConfig { webp: true, avif: true },
            ..input(RequestType::Default)
        };
        let out = normalize(EditMap::new(), &request).unwrap();
        assert_eq!(out.output_format, Some(ImageFormat::Jpeg));
    }

    #[test]
    fn unknown_payload_format_is_rejected() {
        let request = NormalizeInput {
            output_format: Some("bmp"),
            ..input(RequestType::Default)
        };
        let err = normalize(EditMap::new(), &request).unwrap_err();
        assert_eq!(err.code(), "UnsupportedOutputImageFormatException");
    }

    #[test]
    fn accept_negotiation_prefers_avif() {
        let both = AutoFormatConfig { webp: true, avif: true };
        let request = NormalizeInput {
            accept: Some("image/avif,image/webp,*/*"),
            auto_format: both,
            ..input(RequestType::Default)
        };
        assert_eq!(
            normalize(EditMap::new(), &request).unwrap().output_format,
            Some(ImageFormat::Avif)
        );

        let webp_only = NormalizeInput {
            auto_format: AutoFormatConfig { webp: true, avif: false },
            ..request
        };
        assert_eq!(
            normalize(EditMap::new(), &webp_only).unwrap().output_format,
            Some(ImageFormat::Webp)
        );

        let disabled = NormalizeInput {
            auto_format: AutoFormatConfig::default(),
            ..request
        };
        let out = normalize(EditMap::new(), &disabled).unwrap();
        assert_eq!(out.output_format, None);
        assert_eq!(out.content_type, "image/jpeg");
    }

    #[test]
    fn svg_with_edits_becomes_png() {
        let request = NormalizeInput {
            content_type: CONTENT_TYPE_SVG,
            accept: Some("image/webp"),
            auto_format: AutoFormatConfig { webp: true, avif: false },
            ..input(RequestType::Default)
        };
        let edited = normalize(default_edits(json!({"grayscale": true})), &request).unwrap();
        assert_eq!(edited.output_format, Some(ImageFormat::Png));

        let untouched = normalize(EditMap::new(), &request).unwrap();
        assert_eq!(untouched.output_format, None);
        assert_eq!(untouched.content_type, CONTENT_TYPE_SVG);

        let explicit = normalize(default_edits(json!({"toFormat": "webp"})), &request).unwrap();
        assert_eq!(explicit.output_format, Some(ImageFormat::Webp));
    }

    // =========================================================================
    // Effort
    // =========================================================================

    #[test]
    fn effort_out_of_range_falls_back() {
        let request = NormalizeInput {
            output_format: Some("webp"),
            effort: Some(7.0),
            ..input(RequestType::Default)
        };
        assert_eq!(normalize(EditMap::new(), &request).unwrap().effort, Some(4));
    }

    #[test]
    fn effort_is_truncated() {
        let request = NormalizeInput {
            output_format: Some("webp"),
            effort: Some(5.9),
            ..input(RequestType::Default)
        };
        assert_eq!(normalize(EditMap::new(), &request).unwrap().effort, Some(5));
    }

    #[test]
    fn effort_ignored_for_other_formats() {
        let request = NormalizeInput {
            output_format: Some("png"),
            effort: Some(3.0),
            ..input(RequestType::Default)
        };
        assert_eq!(normalize(EditMap::new(), &request).unwrap().effort, None);
    }

    // =========================================================================
    // Quality reconciliation
    // =========================================================================

    #[test]
    fn quality_key_follows_output_format() {
        // quality() bound to the key's extension, then format() changes it.
        let edits = map_path_to_edits("/filters:quality(50):format(webp)/cat.jpg");
        assert!(edits.contains("jpeg"));
        let out = normalize(edits, &input(RequestType::LegacyPath)).unwrap();
        assert!(!out.edits.contains("jpeg"));
        assert_eq!(
            out.edits.get("webp"),
            Some(&EditOperation::Encoder(
                ImageFormat::Webp,
                EncoderOptions::with_quality(50)
            ))
        );
    }

    #[test]
    fn pending_quality_takes_output_format() {
        let edits = map_path_to_edits("/filters:quality(70):format(png)/cat");
        let out = normalize(edits, &input(RequestType::Rewritten)).unwrap();
        assert!(!out.edits.contains("quality"));
        assert!(out.edits.contains("png"));
    }

    #[test]
    fn pending_quality_falls_back_to_source_format() {
        let edits = map_path_to_edits("/filters:quality(70)/cat");
        let out = normalize(edits, &input(RequestType::LegacyPath)).unwrap();
        assert!(out.edits.contains("jpeg"));

        let generic = NormalizeInput {
            content_type: CONTENT_TYPE_GENERIC,
            ..input(RequestType::LegacyPath)
        };
        let edits = map_path_to_edits("/filters:quality(70)/cat");
        let out = normalize(edits, &generic).unwrap();
        assert!(!out.edits.contains("quality"));
        assert_eq!(out.edits.quality_format(), None);
    }

    #[test]
    fn default_requests_keep_quality_keys() {
        let edits = default_edits(json!({"png": {"quality": 40}, "toFormat": "jpeg"}));
        let out = normalize(edits, &input(RequestType::Default)).unwrap();
        assert!(out.edits.contains("png"));
        assert!(!out.edits.contains("jpeg"));
    }

    // =========================================================================
    // Idempotence
    // =========================================================================

    #[test]
    fn normalizing_twice_changes_nothing() {
        let paths = [
            "/fit-in/300x0/filters:quality(50):format(webp)/cat.jpg",
            "/filters:quality(30)/filters:rotate(90)/dog",
            "/10x10:90x90/filters:grayscale()/bird.png",
        ];
        let request = NormalizeInput {
            accept: Some("image/webp"),
            auto_format: AutoFormatConfig { webp: true, avif: false },
            ..input(RequestType::LegacyPath)
        };
        for path in paths {
            let once = normalize(map_path_to_edits(path), &request).unwrap();
            let twice = normalize(once.edits.clone(), &request).unwrap();
            assert_eq!(once, twice, "{path}");
        }
    }
}
