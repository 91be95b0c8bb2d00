//! Request-type classification.
//!
//! Picks one of the three wire encodings for a path, first match wins:
//!
//! 1. base64 alphabet that decodes to a JSON payload → [`RequestType::Default`]
//! 2. a rewrite rule is configured → [`RequestType::Rewritten`]
//! 3. legacy markers, a known image extension, or no extension at all →
//!    [`RequestType::LegacyPath`]
//!
//! Anything else is a [`HandlerError::RequestType`].

use super::codec;
use super::legacy::RewriteRule;
use crate::error::HandlerError;
use crate::types::RequestType;
use regex::Regex;
use std::sync::LazyLock;
use tracing::debug;

static BASE64_PATH: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"^/?[0-9A-Za-z+/_-]*={0,2}$").expect("static pattern"));

/// Source extensions the legacy grammar serves.
const LEGACY_EXTENSIONS: [&str; 9] = [
    "jpg", "jpeg", "png", "webp", "tiff", "tif", "svg", "gif", "avif",
];

const LEGACY_MARKERS: [&str; 3] = ["filters:", "fit-in", "unsafe"];

pub fn classify(path: &str, rewrite: Option<&RewriteRule>) -> Result<RequestType, HandlerError> {
    let request_type = if is_default_request(path) {
        RequestType::Default
    } else if rewrite.is_some() {
        RequestType::Rewritten
    } else if looks_like_legacy_path(path) {
        RequestType::LegacyPath
    } else {
        return Err(HandlerError::RequestType);
    };
    debug!(path, %request_type, "classified request");
    Ok(request_type)
}

/// Decoding is only a probe here; failures fall through to the other encodings.
fn is_default_request(path: &str) -> bool {
    BASE64_PATH.is_match(path) && codec::decode(Some(path)).is_ok()
}

fn looks_like_legacy_path(path: &str) -> bool {
    if LEGACY_MARKERS.iter().any(|marker| path.contains(marker)) {
        return true;
    }
    match extension(path) {
        None => true,
        Some(ext) => LEGACY_EXTENSIONS
            .iter()
            .any(|known| known.eq_ignore_ascii_case(ext)),
    }
}

/// Extension of the last path segment, if it has a non-empty one.
pub(crate) fn extension(path: &str) -> Option<&str> {
    let name = path.rsplit('/').next().unwrap_or(path);
    name.rsplit_once('.')
        .map(|(_, ext)| ext)
        .filter(|ext| !ext.is_empty())
}

#[cfg(test)]
mod tests {
    use super::*;
    use base64::Engine;
    use base64::engine::general_purpose::STANDARD;

    fn encoded(json: &str) -> String {
        format!("/{}", STANDARD.encode(json))
    }

    #[test]
    fn base64_json_is_default() {
        let path = encoded(r#"{"bucket":"b","key":"cat.jpg"}"#);
        assert_eq!(classify(&path, None).unwrap(), RequestType::Default);
    }

    #[test]
    fn default_wins_over_rewrite() {
        let rule = RewriteRule::parse("/(filters-)/gm", "filters:").unwrap();
        let path = encoded(r#"{"key":"cat.jpg"}"#);
        assert_eq!(classify(&path, Some(&rule)).unwrap(), RequestType::Default);
    }

    #[test]
    fn base64_alphabet_without_json_falls_through() {
        // Valid alphabet, decodes to garbage.
        assert_eq!(
            classify("/abcd/efgh", None).unwrap(),
            RequestType::LegacyPath
        );
    }

    #[test]
    fn configured_rewrite_classifies_rewritten() {
        let rule = RewriteRule::parse("/(filters-)/gm", "filters:").unwrap();
        assert_eq!(
            classify("/filters-rotate(90)/image.bmp", Some(&rule)).unwrap(),
            RequestType::Rewritten
        );
    }

    #[test]
    fn legacy_markers_and_extensions() {
        assert_eq!(
            classify("/filters:grayscale()/photo.jpg", None).unwrap(),
            RequestType::LegacyPath
        );
        assert_eq!(
            classify("/fit-in/200x200/photo.PNG", None).unwrap(),
            RequestType::LegacyPath
        );
        assert_eq!(
            classify("/200x200/folder.v2/photo", None).unwrap(),
            RequestType::LegacyPath
        );
    }

    #[test]
    fn unknown_extension_is_rejected() {
        let err = classify("/200x200/document.pdf", None).unwrap_err();
        assert_eq!(err.code(), "RequestTypeError");
        assert_eq!(err.status(), 400);
    }

    #[test]
    fn extension_looks_at_last_segment_only() {
        assert_eq!(extension("/a.b/c"), None);
        assert_eq!(extension("/a/c.jpeg"), Some("jpeg"));
        assert_eq!(extension("/a/c."), None);
    }
}
