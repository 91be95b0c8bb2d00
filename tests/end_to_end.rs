//! Requests driven through the public API with the pure-Rust backend.
//!
//! Sources are small generated PNGs held in memory or written to a temporary
//! bucket directory; every response is decoded back to check what was served.

use base64::Engine;
use base64::engine::general_purpose::STANDARD;
use image_handler::imaging::RustBackend;
use image_handler::request::{DefaultImageRequest, codec, sign};
use image_handler::services::{FsObjectStore, MapSecretStore, MemoryObjectStore, StoredObject};
use image_handler::{HandlerConfig, HandlerResponse, ImageHandler, ImageHandlerEvent};
use serde_json::{Value, json};
use std::io::Cursor;

fn png(width: u32, height: u32) -> Vec<u8> {
    let img = image::RgbImage::from_fn(width, height, |x, y| {
        image::Rgb([(x * 7 % 256) as u8, (y * 11 % 256) as u8, 128])
    });
    let mut buf = Cursor::new(Vec::new());
    image::DynamicImage::ImageRgb8(img)
        .write_to(&mut buf, image::ImageFormat::Png)
        .unwrap();
    buf.into_inner()
}

fn config() -> HandlerConfig {
    HandlerConfig {
        source_buckets: vec!["photos".into(), "archive".into()],
        ..HandlerConfig::default()
    }
}

fn memory_handler(config: HandlerConfig) -> ImageHandler<RustBackend> {
    let store = MemoryObjectStore::new();
    store.insert("photos", "wide.png", StoredObject::new(png(200, 100), "image/png"));
    store.insert("archive", "square.png", StoredObject::new(png(60, 60), "image/png"));
    ImageHandler::new(config, RustBackend::new(), Box::new(store)).unwrap()
}

fn default_path(payload: Value) -> String {
    let request: DefaultImageRequest = serde_json::from_value(payload).unwrap();
    codec::encode(&request).unwrap()
}

fn served_image(response: &HandlerResponse) -> image::DynamicImage {
    assert_eq!(response.status_code, 200, "body: {}", response.body);
    assert!(response.is_base64_encoded);
    let bytes = STANDARD.decode(&response.body).unwrap();
    image::load_from_memory(&bytes).unwrap()
}

fn error_code(response: &HandlerResponse) -> String {
    assert!(!response.is_base64_encoded);
    let body: Value = serde_json::from_str(&response.body).unwrap();
    body["code"].as_str().unwrap().to_string()
}

// =========================================================================
// DEFAULT requests
// =========================================================================

#[test]
fn default_request_resizes_keeping_aspect() {
    let handler = memory_handler(config());
    let path = default_path(json!({
        "bucket": "photos",
        "key": "wide.png",
        "edits": {"resize": {"width": 50}}
    }));
    let response = handler.handle(&ImageHandlerEvent::new(path));

    let img = served_image(&response);
    assert_eq!((img.width(), img.height()), (50, 25));
    assert_eq!(response.headers["Content-Type"], "image/png");
    assert_eq!(response.headers["Cache-Control"], "max-age=31536000,public");
}

#[test]
fn default_request_output_format_and_custom_headers() {
    let handler = memory_handler(config());
    let path = default_path(json!({
        "key": "wide.png",
        "edits": {"grayscale": true},
        "outputFormat": "jpeg",
        "headers": {"Cache-Control": "max-age=60", "X-Frame-Options": "DENY"}
    }));
    let response = handler.handle(&ImageHandlerEvent::new(path));

    let bytes = STANDARD.decode(&response.body).unwrap();
    assert_eq!(image::guess_format(&bytes).unwrap(), image::ImageFormat::Jpeg);
    assert_eq!(response.headers["Content-Type"], "image/jpeg");
    assert_eq!(response.headers["Cache-Control"], "max-age=60");
    assert!(!response.headers.contains_key("X-Frame-Options"));
}

#[test]
fn accept_header_negotiates_webp() {
    let mut config = config();
    config.auto_format.webp = true;
    let handler = memory_handler(config);
    let path = default_path(json!({"key": "wide.png", "edits": {"flip": true}}));
    let event = ImageHandlerEvent::new(path).with_header("accept", "image/avif,image/webp,*/*");
    let response = handler.handle(&event);

    let bytes = STANDARD.decode(&response.body).unwrap();
    assert_eq!(image::guess_format(&bytes).unwrap(), image::ImageFormat::WebP);
    assert_eq!(response.headers["Content-Type"], "image/webp");
}

#[test]
fn disallowed_bucket_is_forbidden() {
    let handler = memory_handler(config());
    let path = default_path(json!({"bucket": "secret", "key": "wide.png"}));
    let response = handler.handle(&ImageHandlerEvent::new(path));

    assert_eq!(response.status_code, 403);
    assert_eq!(error_code(&response), "ImageBucket::CannotAccessBucket");
}

#[test]
fn missing_key_is_not_found() {
    let handler = memory_handler(config());
    let path = default_path(json!({"key": "nope.png"}));
    let response = handler.handle(&ImageHandlerEvent::new(path));

    assert_eq!(response.status_code, 404);
    assert_eq!(error_code(&response), "NoSuchKey");
    assert_eq!(response.headers["Content-Type"], "application/json");
}

#[test]
fn oversized_resize_is_rejected() {
    let handler = memory_handler(config());
    for resize in [
        json!({"width": 4_000_000_000u64, "height": 4_000_000_000u64, "fit": "fill"}),
        json!({"width": 16000, "height": 16000, "fit": "cover"}),
    ] {
        let path = default_path(json!({"key": "wide.png", "edits": {"resize": resize}}));
        let response = handler.handle(&ImageHandlerEvent::new(path));
        assert_eq!(response.status_code, 400);
        assert_eq!(error_code(&response), "InvalidResizeException");
    }
}

#[test]
fn out_of_range_blur_serves_unblurred_image() {
    let handler = memory_handler(config());
    let plain = served_image(&handler.handle(&ImageHandlerEvent::new("/wide.png")));
    let path = default_path(json!({"key": "wide.png", "edits": {"blur": 1e12}}));
    let img = served_image(&handler.handle(&ImageHandlerEvent::new(path)));
    assert_eq!(img.to_rgb8(), plain.to_rgb8());
}

// =========================================================================
// Path grammar and rewrites
// =========================================================================

#[test]
fn legacy_path_fits_inside_box() {
    let handler = memory_handler(config());
    let event = ImageHandlerEvent::new("/fit-in/40x40/filters:grayscale()/wide.png");
    let img = served_image(&handler.handle(&event));

    assert_eq!((img.width(), img.height()), (40, 20));
    let pixel = img.to_rgb8().get_pixel(10, 10).0;
    assert_eq!(pixel[0], pixel[1]);
    assert_eq!(pixel[1], pixel[2]);
}

#[test]
fn legacy_bucket_segment_selects_allowed_bucket() {
    let handler = memory_handler(config());
    let event = ImageHandlerEvent::new("/20x0/s3:archive/square.png");
    let img = served_image(&handler.handle(&event));
    assert_eq!((img.width(), img.height()), (20, 20));
}

#[test]
fn rewritten_path_goes_through_rule() {
    let mut config = config();
    config.rewrite.match_pattern = r"/^\/thumb\/(.*)$/".into();
    config.rewrite.substitution = "/fit-in/30x30/$1".into();
    let handler = memory_handler(config);

    let ctx = handler.resolve(&ImageHandlerEvent::new("/thumb/wide.png")).unwrap();
    assert_eq!(ctx.key, "wide.png");
    let img = served_image(&handler.handle(&ImageHandlerEvent::new("/thumb/wide.png")));
    assert_eq!((img.width(), img.height()), (30, 15));
}

#[test]
fn filters_to_format_changes_content_type() {
    let handler = memory_handler(config());
    let event = ImageHandlerEvent::new("/filters:format(jpeg):quality(70)/wide.png");
    let response = handler.handle(&event);

    assert_eq!(response.status_code, 200);
    assert_eq!(response.headers["Content-Type"], "image/jpeg");
}

// =========================================================================
// Signatures, CORS and fallback
// =========================================================================

#[test]
fn signed_requests_are_checked() {
    let mut config = config();
    config.signature.enabled = true;
    config.signature.secret_id = "handler".into();
    config.signature.secret_key = "signingKey".into();
    let secrets = MapSecretStore::new().with_secret("handler", r#"{"signingKey":"s3cr3t"}"#);
    let handler = memory_handler(config).with_secrets(Box::new(secrets));

    let path = "/fit-in/10x10/wide.png";
    let good = ImageHandlerEvent::new(path).with_query("signature", &sign(path, "s3cr3t").unwrap());
    assert_eq!(handler.handle(&good).status_code, 200);

    let bad = ImageHandlerEvent::new(path).with_query("signature", "deadbeef");
    let response = handler.handle(&bad);
    assert_eq!(response.status_code, 403);
    assert_eq!(error_code(&response), "SignatureDoesNotMatch");

    let unsigned = handler.handle(&ImageHandlerEvent::new(path));
    assert_eq!(unsigned.status_code, 400);
    assert_eq!(error_code(&unsigned), "AuthorizationQueryParametersError");
}

#[test]
fn cors_origin_on_success_and_error() {
    let mut config = config();
    config.cors.enabled = true;
    config.cors.origin = "https://example.com".into();
    let handler = memory_handler(config);

    let ok = handler.handle(&ImageHandlerEvent::new("/wide.png"));
    assert_eq!(ok.headers["Access-Control-Allow-Origin"], "https://example.com");
    let missing = handler.handle(&ImageHandlerEvent::new("/missing.png"));
    assert_eq!(missing.headers["Access-Control-Allow-Origin"], "https://example.com");
}

#[test]
fn fallback_image_replaces_error_body() {
    let mut config = config();
    config.fallback_image.enabled = true;
    config.fallback_image.bucket = "archive".into();
    config.fallback_image.key = "square.png".into();
    let handler = memory_handler(config);

    let response = handler.handle(&ImageHandlerEvent::new("/missing.png"));
    assert_eq!(response.status_code, 404);
    assert!(response.is_base64_encoded);
    assert_eq!(response.headers["Content-Type"], "image/png");
    let bytes = STANDARD.decode(&response.body).unwrap();
    assert_eq!(image::load_from_memory(&bytes).unwrap().width(), 60);
}

// =========================================================================
// Filesystem store
// =========================================================================

#[test]
fn filesystem_bucket_serves_files() {
    let tmp = tempfile::TempDir::new().unwrap();
    std::fs::create_dir(tmp.path().join("photos")).unwrap();
    std::fs::write(tmp.path().join("photos/wide.png"), png(80, 40)).unwrap();

    let handler = ImageHandler::new(
        config(),
        RustBackend::new(),
        Box::new(FsObjectStore::new(tmp.path())),
    )
    .unwrap();
    let img = served_image(&handler.handle(&ImageHandlerEvent::new("/fit-in/20x20/wide.png")));
    assert_eq!((img.width(), img.height()), (20, 10));

    let escaped = handler.handle(&ImageHandlerEvent::new("/../photos/wide.png"));
    assert_ne!(escaped.status_code, 200);
}
