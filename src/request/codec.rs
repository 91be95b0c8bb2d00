//! The self-describing request encoding: a base64 JSON payload as the path.
//!
//! ```text
//! /eyJidWNrZXQiOiJwaG90b3MiLCJrZXkiOiJjYXQuanBnIn0=
//!   → {"bucket":"photos","key":"cat.jpg"}
//! ```
//!
//! Decoding is lenient: padding is optional and the URL-safe alphabet is
//! accepted when the path contains `-` or `_`. Encoding always produces the
//! standard alphabet with padding.

use crate::error::HandlerError;
use base64::Engine;
use base64::alphabet;
use base64::engine::general_purpose::{GeneralPurpose, GeneralPurposeConfig, STANDARD};
use base64::engine::DecodePaddingMode;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::collections::BTreeMap;
use tracing::debug;

const LENIENT: GeneralPurposeConfig = GeneralPurposeConfig::new()
    .with_decode_padding_mode(DecodePaddingMode::Indifferent)
    .with_decode_allow_trailing_bits(true);

const STANDARD_LENIENT: GeneralPurpose = GeneralPurpose::new(&alphabet::STANDARD, LENIENT);
const URL_SAFE_LENIENT: GeneralPurpose = GeneralPurpose::new(&alphabet::URL_SAFE, LENIENT);

/// The decoded DEFAULT payload.
///
/// `edits` stays raw JSON here; it becomes an [`EditMap`](crate::edits::EditMap)
/// during resolution so the payload round-trips exactly.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DefaultImageRequest {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub bucket: Option<String>,
    pub key: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub edits: Option<Map<String, Value>>,
    /// Extra response headers.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub headers: Option<BTreeMap<String, String>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub output_format: Option<String>,
    /// WebP reduction effort.
    #[serde(default, alias = "reductionEffort", skip_serializing_if = "Option::is_none")]
    pub effort: Option<f64>,
}

/// Decode a DEFAULT path. One leading slash is ignored.
pub fn decode(path: Option<&str>) -> Result<DefaultImageRequest, HandlerError> {
    let path = path
        .filter(|p| !p.is_empty())
        .ok_or(HandlerError::CannotReadPath)?;
    let encoded = path.strip_prefix('/').unwrap_or(path);

    let engine = if encoded.contains(['-', '_']) {
        &URL_SAFE_LENIENT
    } else {
        &STANDARD_LENIENT
    };
    let bytes = engine.decode(encoded).map_err(|e| {
        debug!(error = %e, "path is not base64");
        HandlerError::CannotDecodeRequest
    })?;
    serde_json::from_slice(&bytes).map_err(|e| {
        debug!(error = %e, "decoded path is not a request payload");
        HandlerError::CannotDecodeRequest
    })
}

/// Encode a payload as a DEFAULT path, leading slash included.
pub fn encode(request: &DefaultImageRequest) -> Result<String, serde_json::Error> {
    let json = serde_json::to_vec(request)?;
    Ok(format!("/{}", STANDARD.encode(json)))
}

#[cfg(test)]
mod tests {
    use super::*;
    use base64::engine::general_purpose::{STANDARD_NO_PAD, URL_SAFE_NO_PAD};
    use serde_json::json;

    fn sample() -> DefaultImageRequest {
        let edits = json!({"resize": {"width": 300, "fit": "cover"}, "grayscale": true});
        DefaultImageRequest {
            bucket: Some("photos".into()),
            key: "albums/cat (1).jpg".into(),
            edits: edits.as_object().cloned(),
            headers: Some(BTreeMap::from([("Cache-Control".into(), "no-cache".into())])),
            output_format: Some("webp".into()),
            effort: Some(3.0),
        }
    }

    #[test]
    fn encode_then_decode_preserves_payload() {
        let request = sample();
        let path = encode(&request).unwrap();
        assert!(path.starts_with('/'));
        assert_eq!(decode(Some(&path)).unwrap(), request);
    }

    #[test]
    fn edit_order_survives_round_trip() {
        let path = encode(&sample()).unwrap();
        let decoded = decode(Some(&path)).unwrap();
        let keys: Vec<_> = decoded.edits.unwrap().keys().cloned().collect();
        assert_eq!(keys, vec!["resize", "grayscale"]);
    }

    #[test]
    fn decodes_without_slash_or_padding() {
        let raw = STANDARD_NO_PAD.encode(r#"{"key":"a.png"}"#);
        assert_eq!(decode(Some(&raw)).unwrap().key, "a.png");
    }

    #[test]
    fn decodes_url_safe_alphabet() {
        // '?' and '>' force the URL-safe characters into the encoding.
        let json = r#"{"key":"??>>.png"}"#;
        let raw = URL_SAFE_NO_PAD.encode(json);
        assert!(raw.contains(['-', '_']));
        assert_eq!(decode(Some(&raw)).unwrap().key, "??>>.png");
    }

    #[test]
    fn reduction_effort_alias() {
        let raw = STANDARD.encode(r#"{"key":"a.png","outputFormat":"webp","reductionEffort":7}"#);
        let request = decode(Some(&raw)).unwrap();
        assert_eq!(request.effort, Some(7.0));
        assert_eq!(request.output_format.as_deref(), Some("webp"));
    }

    #[test]
    fn missing_path_cannot_be_read() {
        assert_eq!(decode(None).unwrap_err().code(), "DecodeRequest::CannotReadPath");
        assert_eq!(decode(Some("")).unwrap_err().code(), "DecodeRequest::CannotReadPath");
    }

    #[test]
    fn malformed_payloads_cannot_be_decoded() {
        let missing_key = format!("/{}", STANDARD.encode(r#"{"bucket":"b"}"#));
        for path in ["/not*base64", "/aGVsbG8=", missing_key.as_str()] {
            assert_eq!(
                decode(Some(path)).unwrap_err().code(),
                "DecodeRequest::CannotDecodeRequest",
                "{path}"
            );
        }
    }
}
