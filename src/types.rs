//! Shared vocabulary used across request resolution and image processing.
//!
//! These types are small, `Copy` where possible, and serialize to the same
//! lowercase names the wire encodings use (`"jpeg"`, `"inside"`, ...).

use serde::{Deserialize, Serialize};
use std::fmt;

/// Content type of SVG sources; triggers rasterization when edits are present.
pub const CONTENT_TYPE_SVG: &str = "image/svg+xml";
/// Content type reported when nothing more specific is known.
pub const CONTENT_TYPE_GENERIC: &str = "image";

/// Which wire encoding produced the edit map.
///
/// Fixed once the classifier has run; every later stage branches on it.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum RequestType {
    /// Base64-encoded JSON payload.
    Default,
    /// Thumbor-style `filters:` path grammar.
    LegacyPath,
    /// Legacy grammar applied after a configured path rewrite.
    Rewritten,
}

impl RequestType {
    /// Legacy and rewritten requests share the path grammar and its quirks.
    pub fn uses_path_grammar(self) -> bool {
        matches!(self, RequestType::LegacyPath | RequestType::Rewritten)
    }
}

impl fmt::Display for RequestType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            RequestType::Default => "Default",
            RequestType::LegacyPath => "Thumbor",
            RequestType::Rewritten => "Custom",
        };
        f.write_str(name)
    }
}

/// Image formats the resolution pipeline can name.
///
/// Not every variant can be encoded by every backend; the capability reports
/// unsupported formats at encode time.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ImageFormat {
    #[serde(alias = "jpg")]
    Jpeg,
    Png,
    Webp,
    #[serde(alias = "tif")]
    Tiff,
    Heif,
    Heic,
    Gif,
    Avif,
    Raw,
}

/// Formats that may carry a format-specific quality sub-key in an edit map,
/// in the order the quality remap scans them.
pub const QUALITY_FORMATS: [ImageFormat; 7] = [
    ImageFormat::Jpeg,
    ImageFormat::Png,
    ImageFormat::Webp,
    ImageFormat::Tiff,
    ImageFormat::Heif,
    ImageFormat::Gif,
    ImageFormat::Avif,
];

impl ImageFormat {
    /// Parse a format name, accepting `jpg` and `tif` aliases. Case-insensitive.
    pub fn from_name(name: &str) -> Option<Self> {
        let format = match name.to_ascii_lowercase().as_str() {
            "jpg" | "jpeg" => ImageFormat::Jpeg,
            "png" => ImageFormat::Png,
            "webp" => ImageFormat::Webp,
            "tif" | "tiff" => ImageFormat::Tiff,
            "heif" => ImageFormat::Heif,
            "heic" => ImageFormat::Heic,
            "gif" => ImageFormat::Gif,
            "avif" => ImageFormat::Avif,
            "raw" => ImageFormat::Raw,
            _ => return None,
        };
        Some(format)
    }

    /// Parse a MIME type such as `image/png`.
    pub fn from_content_type(content_type: &str) -> Option<Self> {
        let essence = content_type.split(';').next().unwrap_or("").trim();
        let subtype = essence.strip_prefix("image/")?;
        Self::from_name(subtype)
    }

    /// Canonical lowercase name, also used as the edit-map key for quality options.
    pub fn as_str(self) -> &'static str {
        match self {
            ImageFormat::Jpeg => "jpeg",
            ImageFormat::Png => "png",
            ImageFormat::Webp => "webp",
            ImageFormat::Tiff => "tiff",
            ImageFormat::Heif => "heif",
            ImageFormat::Heic => "heic",
            ImageFormat::Gif => "gif",
            ImageFormat::Avif => "avif",
            ImageFormat::Raw => "raw",
        }
    }

    pub fn content_type(self) -> String {
        format!("image/{}", self.as_str())
    }

    /// Whether the format may hold a quality sub-key (see [`QUALITY_FORMATS`]).
    pub fn accepts_quality(self) -> bool {
        QUALITY_FORMATS.contains(&self)
    }
}

impl fmt::Display for ImageFormat {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// How a resize fits the source into the target box.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Fit {
    /// Fill the box, cropping overflow.
    Cover,
    /// Fit within the box, padding with the background color.
    Contain,
    /// Stretch to the exact box, ignoring aspect ratio.
    Fill,
    /// Fit within the box, no padding.
    Inside,
    /// Cover the box, no cropping.
    Outside,
}

/// Guess a content type from the leading bytes of an image.
///
/// Used when object storage only knows the generic octet-stream type. SVG has
/// no magic number and falls through to [`CONTENT_TYPE_GENERIC`].
pub fn infer_content_type(bytes: &[u8]) -> String {
    let inferred = match bytes {
        [0x89, 0x50, 0x4E, 0x47, ..] => Some(ImageFormat::Png),
        [0x52, 0x49, 0x46, 0x46, ..] => Some(ImageFormat::Webp),
        [0x49, 0x49, 0x2A, 0x00, ..] | [0x4D, 0x4D, 0x00, 0x2A, ..] => Some(ImageFormat::Tiff),
        [0x47, 0x49, 0x46, 0x38, ..] => Some(ImageFormat::Gif),
        [0xFF, 0xD8, ..] => Some(ImageFormat::Jpeg),
        _ if bytes.len() >= 12 && &bytes[4..12] == b"ftypavif" => Some(ImageFormat::Avif),
        _ => None,
    };
    inferred
        .map(ImageFormat::content_type)
        .unwrap_or_else(|| CONTENT_TYPE_GENERIC.to_string())
}
