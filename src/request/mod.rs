//! Request resolution.
//!
//! Turns an inbound event into an [`ImageRequestContext`]: everything needed
//! to render the response, with the source object already fetched.
//!
//! ```text
//! path ──classify──┬─ Default ─────► codec::decode ───────────┐
//!                  ├─ LegacyPath ──► legacy::parse_path ──────┤
//!                  └─ Rewritten ───► rewrite, parse_path ─────┤
//!                                                             ▼
//!                              bucket check → fetch source → normalize
//! ```
//!
//! Signature checks live in [`signature`] and run before any of this.

pub mod classify;
pub mod codec;
pub mod legacy;
pub mod normalize;
pub mod signature;

pub use classify::classify;
pub use codec::DefaultImageRequest;
pub use legacy::{LegacyPath, RewriteRule, map_path_to_edits, parse_custom_path, parse_path};
pub use normalize::{NormalizeInput, Normalized, normalize};
pub use signature::{SignatureValidator, sign};

use crate::config::HandlerConfig;
use crate::edits::EditMap;
use crate::error::HandlerError;
use crate::services::storage::OCTET_STREAM;
use crate::services::{ObjectStore, StoredObject};
use crate::types::{CONTENT_TYPE_GENERIC, ImageFormat, RequestType, infer_content_type};
use serde::Serialize;
use std::collections::BTreeMap;
use tracing::{debug, info};

/// Cache-Control sent when the source object has none.
pub const DEFAULT_CACHE_CONTROL: &str = "max-age=31536000,public";

/// The inbound request, reduced to what resolution reads.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ImageHandlerEvent {
    pub path: Option<String>,
    pub headers: BTreeMap<String, String>,
    pub query: BTreeMap<String, String>,
}

impl ImageHandlerEvent {
    pub fn new(path: impl Into<String>) -> Self {
        Self {
            path: Some(path.into()),
            ..Self::default()
        }
    }

    pub fn with_header(mut self, name: &str, value: &str) -> Self {
        self.headers.insert(name.to_string(), value.to_string());
        self
    }

    pub fn with_query(mut self, name: &str, value: &str) -> Self {
        self.query.insert(name.to_string(), value.to_string());
        self
    }

    /// Case-insensitive header lookup.
    pub fn header(&self, name: &str) -> Option<&str> {
        self.headers
            .iter()
            .find(|(key, _)| key.eq_ignore_ascii_case(name))
            .map(|(_, value)| value.as_str())
    }

    pub fn query_param(&self, name: &str) -> Option<&str> {
        self.query.get(name).map(String::as_str)
    }
}

/// A fully resolved request.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ImageRequestContext {
    pub request_type: RequestType,
    pub bucket: String,
    pub key: String,
    pub edits: EditMap,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub output_format: Option<ImageFormat>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub effort: Option<u8>,
    /// Content type of the response.
    pub content_type: String,
    pub cache_control: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub expires: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub last_modified: Option<String>,
    /// Extra response headers from a DEFAULT payload.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub headers: Option<BTreeMap<String, String>>,
    #[serde(skip)]
    pub original_image: Vec<u8>,
}

/// What decoding produced, before the source is fetched.
struct Decoded {
    bucket: String,
    key: String,
    edits: EditMap,
    output_format: Option<String>,
    effort: Option<f64>,
    headers: Option<BTreeMap<String, String>>,
}

/// Resolve `event` into a context, fetching the source from `store`.
pub fn setup(
    event: &ImageHandlerEvent,
    config: &HandlerConfig,
    rewrite: Option<&RewriteRule>,
    store: &dyn ObjectStore,
) -> Result<ImageRequestContext, HandlerError> {
    let path = event
        .path
        .as_deref()
        .filter(|p| !p.is_empty())
        .ok_or(HandlerError::CannotReadPath)?;

    let request_type = classify(path, rewrite)?;
    let decoded = match (request_type, rewrite) {
        (RequestType::Default, _) => decode_default(path, &config.source_buckets)?,
        (RequestType::Rewritten, Some(rule)) => {
            let rewritten = parse_custom_path(path, rule);
            debug!(from = path, to = %rewritten, "rewrote path");
            decode_legacy(&rewritten, &config.source_buckets)?
        }
        _ => decode_legacy(path, &config.source_buckets)?,
    };

    let source = store
        .get(&decoded.bucket, &decoded.key)
        .map_err(|e| e.into_handler_error(&decoded.key))?;
    let source_type = source_content_type(&source);

    let normalized = normalize(
        decoded.edits,
        &NormalizeInput {
            request_type,
            content_type: &source_type,
            output_format: decoded.output_format.as_deref(),
            effort: decoded.effort,
            accept: event.header("accept"),
            auto_format: config.auto_format,
        },
    )?;

    Ok(ImageRequestContext {
        request_type,
        bucket: decoded.bucket,
        key: decoded.key,
        edits: normalized.edits,
        output_format: normalized.output_format,
        effort: normalized.effort,
        content_type: normalized.content_type,
        cache_control: source
            .cache_control
            .unwrap_or_else(|| DEFAULT_CACHE_CONTROL.to_string()),
        expires: source.expires,
        last_modified: source.last_modified,
        headers: decoded.headers,
        original_image: source.body,
    })
}

fn decode_default(path: &str, allowed: &[String]) -> Result<Decoded, HandlerError> {
    let request = codec::decode(Some(path))?;
    let bucket = match request.bucket {
        Some(bucket) if allowed.contains(&bucket) => bucket,
        Some(bucket) => {
            debug!(%bucket, "bucket not in allow-list");
            return Err(HandlerError::CannotAccessBucket);
        }
        None => default_bucket(allowed)?,
    };
    Ok(Decoded {
        bucket,
        key: request.key,
        edits: request
            .edits
            .as_ref()
            .map(EditMap::from_json_map)
            .unwrap_or_default(),
        output_format: request.output_format,
        effort: request.effort,
        headers: request.headers,
    })
}

fn decode_legacy(path: &str, allowed: &[String]) -> Result<Decoded, HandlerError> {
    let parsed = parse_path(path);
    let named = parsed
        .buckets
        .iter()
        .find(|bucket| allowed.contains(bucket));
    let bucket = match named {
        Some(bucket) => {
            info!(%bucket, "using bucket named in path");
            bucket.clone()
        }
        None => default_bucket(allowed)?,
    };
    Ok(Decoded {
        bucket,
        key: parsed.key,
        edits: parsed.edits,
        output_format: None,
        effort: None,
        headers: None,
    })
}

fn default_bucket(allowed: &[String]) -> Result<String, HandlerError> {
    allowed
        .first()
        .cloned()
        .ok_or(HandlerError::NoSourceBuckets)
}

/// The source's content type, sniffing generic binary types.
fn source_content_type(source: &StoredObject) -> String {
    match source.content_type.as_deref() {
        None => CONTENT_TYPE_GENERIC.to_string(),
        Some(OCTET_STREAM) | Some("binary/octet-stream") => infer_content_type(&source.body),
        Some(declared) => declared.to_string(),
    }
}
