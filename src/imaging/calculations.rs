//! Pure geometry for image edits.
//!
//! All functions here are pure and testable without any I/O or images.
//!
//! | Function | Used by |
//! |---|---|
//! | [`resolve_overlay_offset`] | overlay placement (pixels, `p` percentages, negative from edge) |
//! | [`overlay_dimensions`] / [`overlay_alpha`] | overlay sizing and transparency |
//! | [`round_crop_ellipse`] | round-crop mask defaults |
//! | [`handle_bounds`] | clamping detected face boxes to the unit square |
//! | [`get_crop_area`] | smart-crop padding clamp |
//! | [`plan_resize`] | target dimensions for every fit mode |

use super::params::{BoundingBox, CropArea, Ellipse};
use crate::types::Fit;
use regex::Regex;
use std::sync::LazyLock;

/// Whole numbers 0 through 100 without leading zeros.
static ZERO_TO_HUNDRED: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"^(100|[1-9]?\d)$").expect("static pattern"));

/// Resolve one overlay offset axis.
///
/// `None` input (or an unparsable one) yields `None`, meaning "leave that axis
/// unset". A trailing `p` makes the value a percentage of `image_size`;
/// negative values are measured from the far edge, so the overlay's own size
/// is subtracted.
///
/// ```
/// # use image_handler::imaging::resolve_overlay_offset;
/// assert_eq!(resolve_overlay_offset(Some("-50p"), 100, 50), Some(0));
/// assert_eq!(resolve_overlay_offset(Some("-10"), 100, 50), Some(40));
/// assert_eq!(resolve_overlay_offset(None, 100, 50), None);
/// ```
pub fn resolve_overlay_offset(edit: Option<&str>, image_size: u32, overlay_size: u32) -> Option<i64> {
    let edit = edit?.trim();
    let image = f64::from(image_size);
    let overlay = f64::from(overlay_size);

    if let Some(percent) = edit.strip_suffix('p') {
        let pct: f64 = percent.parse().ok().filter(|v: &f64| v.is_finite())?;
        let resolved = if pct < 0.0 {
            image + image * pct / 100.0 - overlay
        } else {
            image * pct / 100.0
        };
        return Some(resolved.floor() as i64);
    }

    let pixels = parse_int_prefix(edit)?;
    if pixels < 0 {
        Some(i64::from(image_size) + pixels - i64::from(overlay_size))
    } else {
        Some(pixels)
    }
}

/// Leading integer of a string, the way loose numeric parsers read `"12.7px"` as 12.
fn parse_int_prefix(text: &str) -> Option<i64> {
    let (sign, digits) = match text.as_bytes().first()? {
        b'-' => (-1, &text[1..]),
        b'+' => (1, &text[1..]),
        _ => (1, text),
    };
    let end = digits
        .bytes()
        .position(|b| !b.is_ascii_digit())
        .unwrap_or(digits.len());
    if end == 0 {
        return None;
    }
    digits[..end].parse::<i64>().ok().map(|v| sign * v)
}

/// Overlay target size from percentage ratios of the primary image.
///
/// Ratios outside whole numbers 0..=100 are ignored, leaving that side to
/// follow the overlay's aspect ratio.
pub fn overlay_dimensions(
    w_ratio: Option<&str>,
    h_ratio: Option<&str>,
    image: (u32, u32),
) -> (Option<u32>, Option<u32>) {
    let scale = |ratio: Option<&str>, size: u32| {
        ratio
            .filter(|r| ZERO_TO_HUNDRED.is_match(r))
            .and_then(|r| r.parse::<u64>().ok())
            .map(|pct| (u64::from(size) * pct / 100) as u32)
    };
    (scale(w_ratio, image.0), scale(h_ratio, image.1))
}

/// Overlay transparency in percent. Out-of-range or missing means fully opaque (0).
pub fn overlay_alpha(alpha: Option<&str>) -> u8 {
    alpha
        .filter(|a| ZERO_TO_HUNDRED.is_match(a))
        .and_then(|a| a.parse().ok())
        .unwrap_or(0)
}

/// Alpha channel of the 1x1 mask tile for an overlay transparency percentage.
pub fn alpha_tile_value(alpha_percent: u8) -> f64 {
    1.0 - f64::from(alpha_percent.min(100)) / 100.0
}

/// Round-crop options as requested; any field may be missing.
#[derive(Debug, Clone, Copy, Default, PartialEq)]
pub struct RoundCropRequest {
    pub top: Option<f64>,
    pub left: Option<f64>,
    pub rx: Option<f64>,
    pub ry: Option<f64>,
}

/// Ellipse for a round crop on a `width` x `height` image.
///
/// Radii default to half the shorter side and the center to the image center
/// whenever a value is missing or not positive.
pub fn round_crop_ellipse(request: &RoundCropRequest, width: u32, height: u32) -> Ellipse {
    let valid = |v: Option<f64>| v.filter(|v| v.is_finite() && *v > 0.0);
    let w = f64::from(width);
    let h = f64::from(height);
    let radius = w.min(h) / 2.0;

    Ellipse {
        cx: valid(request.left).unwrap_or(w / 2.0),
        cy: valid(request.top).unwrap_or(h / 2.0),
        rx: valid(request.rx).unwrap_or(radius),
        ry: valid(request.ry).unwrap_or(radius),
        width,
        height,
    }
}

/// Clamp a raw face box into the unit square.
///
/// Each value is clamped to `[0, 1]` first; width and height are then
/// shortened so the box ends inside the square. NaN is treated as 0.
pub fn handle_bounds(raw: BoundingBox) -> BoundingBox {
    let clamp = |v: f64| if v.is_nan() { 0.0 } else { v.clamp(0.0, 1.0) };
    let mut bounds = BoundingBox {
        left: clamp(raw.left),
        top: clamp(raw.top),
        width: clamp(raw.width),
        height: clamp(raw.height),
    };

    if bounds.left + bounds.width > 1.0 {
        bounds.width = 1.0 - bounds.left;
    }
    if bounds.top + bounds.height > 1.0 {
        bounds.height = 1.0 - bounds.top;
    }
    bounds
}

/// Pixel crop area around a fractional box, grown by `padding` on every side.
///
/// Never fails: the area is clamped to the image, so excessive padding
/// degrades to the largest area available from the clamped corner.
pub fn get_crop_area(bbox: BoundingBox, padding: f64, image: (u32, u32)) -> CropArea {
    let (img_w, img_h) = (i64::from(image.0), i64::from(image.1));
    let padding = if padding.is_finite() { padding } else { 0.0 };

    let left = ((bbox.left * img_w as f64 - padding).floor() as i64).max(0);
    let top = ((bbox.top * img_h as f64 - padding).floor() as i64).max(0);
    let width = (bbox.width * img_w as f64 + padding * 2.0).floor() as i64;
    let height = (bbox.height * img_h as f64 + padding * 2.0).floor() as i64;

    let left = left.min(img_w);
    let top = top.min(img_h);
    let width = width.min(img_w - left).max(0);
    let height = height.min(img_h - top).max(0);

    CropArea {
        left: left as u32,
        top: top as u32,
        width: width as u32,
        height: height as u32,
    }
}

/// Largest width or height any resize may produce.
pub const MAX_DIMENSION: u32 = 0x3FFF;

/// How a resize turns a source image into the requested box.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ResizePlan {
    /// Dimensions the pixels are resampled to.
    pub scaled: (u32, u32),
    /// Centered crop applied after scaling ([`Fit::Cover`]).
    pub crop: Option<(u32, u32)>,
    /// Canvas the scaled image is centered on ([`Fit::Contain`]).
    pub canvas: Option<(u32, u32)>,
}

impl ResizePlan {
    fn scale_only(scaled: (u32, u32)) -> Self {
        Self {
            scaled,
            crop: None,
            canvas: None,
        }
    }

    /// Final dimensions after crop or padding.
    pub fn output(&self) -> (u32, u32) {
        self.crop.or(self.canvas).unwrap_or(self.scaled)
    }

    /// Whether every intermediate and final side stays within [`MAX_DIMENSION`].
    pub fn within_limits(&self) -> bool {
        let (sw, sh) = self.scaled;
        let (ow, oh) = self.output();
        sw.max(sh).max(ow).max(oh) <= MAX_DIMENSION
    }
}

/// Plan a resize of `source` into `width` x `height` with the given fit.
///
/// A missing side follows the source aspect ratio; with both missing the
/// image keeps its size. With `without_enlargement`, a plan that would grow
/// the image is replaced by the source size.
pub fn plan_resize(
    source: (u32, u32),
    width: Option<u32>,
    height: Option<u32>,
    fit: Fit,
    without_enlargement: bool,
) -> ResizePlan {
    let (src_w, src_h) = (source.0.max(1), source.1.max(1));
    let aspect = f64::from(src_w) / f64::from(src_h);

    let plan = match (width, height) {
        (None, None) => ResizePlan::scale_only((src_w, src_h)),
        (Some(w), None) => {
            ResizePlan::scale_only((w.max(1), ((f64::from(w) / aspect).round() as u32).max(1)))
        }
        (None, Some(h)) => {
            ResizePlan::scale_only((((f64::from(h) * aspect).round() as u32).max(1), h.max(1)))
        }
        (Some(w), Some(h)) => {
            let target = (w.max(1), h.max(1));
            match fit {
                Fit::Fill => ResizePlan::scale_only(target),
                Fit::Inside => ResizePlan::scale_only(calculate_inside_dimensions(source, target)),
                Fit::Outside => ResizePlan::scale_only(calculate_fill_dimensions(source, target)),
                Fit::Cover => ResizePlan {
                    scaled: calculate_fill_dimensions(source, target),
                    crop: Some(target),
                    canvas: None,
                },
                Fit::Contain => ResizePlan {
                    scaled: calculate_inside_dimensions(source, target),
                    crop: None,
                    canvas: Some(target),
                },
            }
        }
    };

    if without_enlargement && (plan.scaled.0 > src_w || plan.scaled.1 > src_h) {
        return ResizePlan::scale_only((src_w, src_h));
    }
    plan
}

/// Dimensions that completely cover the target while keeping the source
/// aspect ratio. One side matches the target, the other may exceed it.
pub fn calculate_fill_dimensions(source: (u32, u32), target: (u32, u32)) -> (u32, u32) {
    let (src_w, src_h) = (source.0.max(1), source.1.max(1));
    let (tgt_w, tgt_h) = target;

    let src_aspect = f64::from(src_w) / f64::from(src_h);
    let tgt_aspect = f64::from(tgt_w) / f64::from(tgt_h);

    if src_aspect > tgt_aspect {
        // Source is wider: height matches, width exceeds
        let w = (f64::from(tgt_h) * src_aspect).round() as u32;
        (w.max(1), tgt_h)
    } else {
        // Source is taller: width matches, height exceeds
        let h = (f64::from(tgt_w) / src_aspect).round() as u32;
        (tgt_w, h.max(1))
    }
}

/// Largest dimensions that fit inside the target while keeping the source
/// aspect ratio.
pub fn calculate_inside_dimensions(source: (u32, u32), target: (u32, u32)) -> (u32, u32) {
    let (src_w, src_h) = (source.0.max(1), source.1.max(1));
    let (tgt_w, tgt_h) = target;

    let src_aspect = f64::from(src_w) / f64::from(src_h);
    let tgt_aspect = f64::from(tgt_w) / f64::from(tgt_h);

    if src_aspect > tgt_aspect {
        let h = (f64::from(tgt_w) / src_aspect).round() as u32;
        (tgt_w, h.max(1))
    } else {
        let w = (f64::from(tgt_h) * src_aspect).round() as u32;
        (w.max(1), tgt_h)
    }
}
