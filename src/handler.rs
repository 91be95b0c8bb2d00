//! Event handling: one request in, one response out.
//!
//! [`ImageHandler::handle`] never fails. Every error becomes either a JSON
//! [`ErrorBody`](crate::error::ErrorBody) or, when configured, the fallback
//! image served with the error's status code.

use crate::config::{ConfigError, HandlerConfig};
use crate::error::HandlerError;
use crate::imaging::{ImageBackend, Services};
use crate::process::process;
use crate::request::{self, ImageHandlerEvent, ImageRequestContext, RewriteRule, SignatureValidator};
use crate::services::{
    ImageRecognition, MapSecretStore, NullRecognition, ObjectStore, SecretStore,
};
use base64::Engine;
use base64::engine::general_purpose::STANDARD;
use serde::Serialize;
use std::collections::BTreeMap;
use tracing::{error, info, warn};

/// Query parameter carrying the request signature.
pub const SIGNATURE_PARAM: &str = "signature";

const FALLBACK_CACHE_CONTROL: &str = "max-age=31536000,public";

/// Custom headers a request may not set. Entries ending in `-` are prefixes.
const DENIED_HEADERS: [&str; 18] = [
    "authorization",
    "connection",
    "server",
    "transfer-encoding",
    "referrer-policy",
    "permissions-",
    "www-authenticate",
    "proxy-authenticate",
    "x-api-key",
    "x-frame-",
    "x-content-",
    "x-xss-",
    "strict-transport-",
    "x-amz-",
    "x-amzn-",
    "access-control-",
    "cross-origin-",
    "content-",
];

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct HandlerResponse {
    pub status_code: u16,
    pub headers: BTreeMap<String, String>,
    pub body: String,
    pub is_base64_encoded: bool,
}

/// A configured handler with its collaborators.
pub struct ImageHandler<B> {
    config: HandlerConfig,
    rewrite: Option<RewriteRule>,
    signature: SignatureValidator,
    backend: B,
    store: Box<dyn ObjectStore>,
    recognition: Box<dyn ImageRecognition>,
    secrets: Box<dyn SecretStore>,
}

impl<B: ImageBackend> ImageHandler<B> {
    /// Validates `config`. Recognition finds nothing and no secrets exist
    /// until set with the builders below.
    pub fn new(
        config: HandlerConfig,
        backend: B,
        store: Box<dyn ObjectStore>,
    ) -> Result<Self, ConfigError> {
        config.validate()?;
        let rewrite = config.rewrite_rule()?;
        let signature = SignatureValidator::from_config(&config.signature);
        Ok(Self {
            config,
            rewrite,
            signature,
            backend,
            store,
            recognition: Box::new(NullRecognition),
            secrets: Box::new(MapSecretStore::new()),
        })
    }

    pub fn with_recognition(mut self, recognition: Box<dyn ImageRecognition>) -> Self {
        self.recognition = recognition;
        self
    }

    pub fn with_secrets(mut self, secrets: Box<dyn SecretStore>) -> Self {
        self.secrets = secrets;
        self
    }

    pub fn config(&self) -> &HandlerConfig {
        &self.config
    }

    /// Check the signature and resolve the request.
    pub fn resolve(&self, event: &ImageHandlerEvent) -> Result<ImageRequestContext, HandlerError> {
        let path = event.path.as_deref().unwrap_or_default();
        self.signature
            .validate(path, event.query_param(SIGNATURE_PARAM), self.secrets.as_ref())?;
        request::setup(event, &self.config, self.rewrite.as_ref(), self.store.as_ref())
    }

    /// Resolve and render, returning the context alongside the body.
    pub fn render(
        &self,
        event: &ImageHandlerEvent,
    ) -> Result<(ImageRequestContext, String), HandlerError> {
        let ctx = self.resolve(event)?;
        let body = process(&self.backend, &ctx, self.services())?;
        Ok((ctx, body))
    }

    pub fn handle(&self, event: &ImageHandlerEvent) -> HandlerResponse {
        match self.render(event) {
            Ok((ctx, body)) => {
                info!(key = %ctx.key, content_type = %ctx.content_type, "served image");
                HandlerResponse {
                    status_code: 200,
                    headers: self.success_headers(&ctx),
                    body,
                    is_base64_encoded: true,
                }
            }
            Err(err) => self.error_response(&err),
        }
    }

    fn services(&self) -> Services<'_> {
        Services {
            store: self.store.as_ref(),
            recognition: self.recognition.as_ref(),
        }
    }

    fn base_headers(&self) -> BTreeMap<String, String> {
        let mut headers = BTreeMap::new();
        headers.insert("Access-Control-Allow-Methods".into(), "GET".into());
        headers.insert(
            "Access-Control-Allow-Headers".into(),
            "Content-Type, Authorization".into(),
        );
        if self.config.cors.enabled {
            headers.insert(
                "Access-Control-Allow-Origin".into(),
                self.config.cors.origin.clone(),
            );
        }
        headers
    }

    fn success_headers(&self, ctx: &ImageRequestContext) -> BTreeMap<String, String> {
        let mut headers = self.base_headers();
        headers.insert("Content-Type".into(), ctx.content_type.clone());
        headers.insert("Cache-Control".into(), ctx.cache_control.clone());
        if let Some(expires) = &ctx.expires {
            headers.insert("Expires".into(), expires.clone());
        }
        if let Some(last_modified) = &ctx.last_modified {
            headers.insert("Last-Modified".into(), last_modified.clone());
        }
        for (name, value) in ctx.headers.iter().flatten() {
            if is_denied_header(name) {
                warn!(header = %name, "dropping custom header");
            } else {
                headers.insert(name.clone(), value.clone());
            }
        }
        headers
    }

    fn error_response(&self, err: &HandlerError) -> HandlerResponse {
        match err {
            HandlerError::Internal(detail) => error!(%detail, "request failed"),
            other => warn!(code = other.code(), status = other.status(), "request failed"),
        }

        if self.config.fallback_image.enabled {
            let fallback = &self.config.fallback_image;
            match self.store.get(&fallback.bucket, &fallback.key) {
                Ok(object) => {
                    let mut headers = self.base_headers();
                    if let Some(content_type) = object.content_type {
                        headers.insert("Content-Type".into(), content_type);
                    }
                    headers.insert("Cache-Control".into(), FALLBACK_CACHE_CONTROL.into());
                    if let Some(last_modified) = object.last_modified {
                        headers.insert("Last-Modified".into(), last_modified);
                    }
                    return HandlerResponse {
                        status_code: err.status(),
                        headers,
                        body: STANDARD.encode(&object.body),
                        is_base64_encoded: true,
                    };
                }
                Err(fetch_err) => {
                    error!(bucket = %fallback.bucket, key = %fallback.key, error = %fetch_err, "cannot load fallback image");
                }
            }
        }

        let mut headers = self.base_headers();
        headers.insert("Content-Type".into(), "application/json".into());
        HandlerResponse {
            status_code: err.status(),
            headers,
            body: serde_json::to_string(&err.body()).unwrap_or_default(),
            is_base64_encoded: false,
        }
    }
}

/// Whether a custom response header is on the deny-list.
pub fn is_denied_header(name: &str) -> bool {
    let name = name.to_ascii_lowercase();
    DENIED_HEADERS.iter().any(|denied| {
        if denied.ends_with('-') {
            name.starts_with(denied)
        } else {
            name == *denied
        }
    })
}
