//! # Image Handler
//!
//! Turns image-transformation requests into a canonical set of edits and
//! applies them to a stored source image. A request arrives as a URL path in
//! one of three encodings:
//!
//! ```text
//! DEFAULT       /eyJidWNrZXQiOi...         base64 JSON {bucket, key, edits, ...}
//! LEGACY_PATH   /fit-in/200x0/filters:grayscale()/cat.jpg
//! REWRITTEN     /thumb/cat.jpg             → rewrite rule → LEGACY_PATH grammar
//! ```
//!
//! # Pipeline
//!
//! ```text
//! event ─► signature check ─► classify ─► decode ─► fetch source ─► normalize ─► edits ─► encode
//!          (request)           (request)   (request)  (services)      (request)    (imaging) (process)
//! ```
//!
//! Every stage before `imaging` is pure data transformation and is unit tested
//! without decoding pixels. Pixel work goes through the [`imaging::ImageBackend`]
//! trait, so the sequencing logic is tested against a recording mock.
//!
//! # Module Map
//!
//! | Module | Role |
//! |--------|------|
//! | [`request`] | Classification, DEFAULT codec, path grammar, normalization, signatures |
//! | [`edits`] | The ordered edit map and its typed operations |
//! | [`imaging`] | Backend contract, geometry helpers, edit sequencing, pure-Rust backend |
//! | [`services`] | Object storage, image recognition and secret collaborators |
//! | [`process`] | Rendering and base64 body assembly under the payload ceiling |
//! | [`handler`] | Event in, response out: CORS, custom headers, errors, fallback image |
//! | [`config`] | `HandlerConfig` from TOML or environment variables |
//! | [`error`] | The closed set of request errors with status and code |
//! | [`types`] | Request types, image formats, fits and content sniffing |
//!
//! # Design Decisions
//!
//! ## Typed Edits, Ordered Map
//!
//! Edits are an [`edits::EditOperation`] enum stored in insertion order. Order
//! matters: a crop before a resize is a different image than a resize before a
//! crop. Normalization passes take a map and return a new one, so each pass is
//! testable on its own and running the whole normalizer twice changes nothing.
//!
//! ## Collaborators Behind Traits
//!
//! Storage, recognition and secrets are `Sync` traits held as boxed objects by
//! [`handler::ImageHandler`]. The crate ships filesystem and in-memory stores and
//! a recognition service that finds nothing; deployments plug in their own.

pub mod config;
pub mod edits;
pub mod error;
pub mod handler;
pub mod imaging;
pub mod process;
pub mod request;
pub mod services;
pub mod types;

pub use config::HandlerConfig;
pub use error::HandlerError;
pub use handler::{HandlerResponse, ImageHandler};
pub use request::{ImageHandlerEvent, ImageRequestContext};

#[cfg(test)]
pub(crate) mod test_helpers;
