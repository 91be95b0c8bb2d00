//! Handler configuration.
//!
//! One immutable [`HandlerConfig`] is built at startup and passed down to
//! everything that needs it. It comes from either of two sources:
//!
//! - a TOML file, merged over the stock defaults ([`load_config`])
//! - process environment variables ([`HandlerConfig::from_env`])
//!
//! ## Config File
//!
//! ```toml
//! # All options are optional - defaults shown below
//!
//! source_buckets = []          # Buckets images may be read from; first is the default
//!
//! [rewrite]
//! match_pattern = ""           # "/regex/flags" or a literal substring
//! substitution = ""
//!
//! [signature]
//! enabled = false
//! secret_id = ""               # Secret holding the JSON key document
//! secret_key = ""              # Field of that document used as the HMAC key
//!
//! [auto_format]
//! webp = false                 # Negotiate WebP from the Accept header
//! avif = false                 # Negotiate AVIF from the Accept header
//!
//! [cors]
//! enabled = false
//! origin = "*"
//!
//! [fallback_image]
//! enabled = false
//! bucket = ""
//! key = ""
//!
//! [processing]
//! max_processes = 4            # Max parallel renders (omit for auto = CPU cores)
//! ```
//!
//! ## Environment
//!
//! | Variable | Field |
//! |---|---|
//! | `SOURCE_BUCKETS` | `source_buckets` (comma-separated, whitespace ignored) |
//! | `REWRITE_MATCH_PATTERN`, `REWRITE_SUBSTITUTION` | `rewrite.*` |
//! | `ENABLE_SIGNATURE`, `SECRETS_MANAGER`, `SECRET_KEY` | `signature.*` |
//! | `AUTO_WEBP`, `AUTO_AVIF` | `auto_format.*` |
//! | `CORS_ENABLED`, `CORS_ORIGIN` | `cors.*` |
//! | `ENABLE_DEFAULT_FALLBACK_IMAGE`, `DEFAULT_FALLBACK_IMAGE_BUCKET`, `DEFAULT_FALLBACK_IMAGE_KEY` | `fallback_image.*` |
//!
//! Flags are on only for the exact value `Yes`.
//!
//! Unknown keys in config files are rejected to catch typos early.

use crate::request::RewriteRule;
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::Path;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
    #[error("TOML parse error: {0}")]
    Toml(#[from] toml::de::Error),
    #[error("TOML serialize error: {0}")]
    Serialize(#[from] toml::ser::Error),
    #[error("Config validation error: {0}")]
    Validation(String),
}

/// Value that switches an environment flag on.
const ENV_FLAG_ON: &str = "Yes";

/// Everything the handler needs to know about its deployment.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct HandlerConfig {
    /// Buckets requests may read from. The first one is the default.
    pub source_buckets: Vec<String>,
    pub rewrite: RewriteConfig,
    pub signature: SignatureConfig,
    pub auto_format: AutoFormatConfig,
    pub cors: CorsConfig,
    pub fallback_image: FallbackConfig,
    pub processing: ProcessingConfig,
}

/// Custom path rewrite. Both halves set, or neither.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct RewriteConfig {
    pub match_pattern: String,
    pub substitution: String,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct SignatureConfig {
    pub enabled: bool,
    pub secret_id: String,
    pub secret_key: String,
}

/// Formats offered through `Accept` negotiation.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct AutoFormatConfig {
    pub webp: bool,
    pub avif: bool,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct CorsConfig {
    pub enabled: bool,
    pub origin: String,
}

impl Default for CorsConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            origin: "*".to_string(),
        }
    }
}

/// Image served in place of an error body.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct FallbackConfig {
    pub enabled: bool,
    pub bucket: String,
    pub key: String,
}

/// Parallel processing settings for batch rendering.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct ProcessingConfig {
    /// Maximum number of parallel renders.
    /// When absent, defaults to the number of CPU cores.
    /// Values larger than the core count are clamped down.
    pub max_processes: Option<usize>,
}

impl ProcessingConfig {
    /// Threads for batch rendering: `max_processes` capped at the core count.
    pub fn render_threads(&self) -> usize {
        let cores = std::thread::available_parallelism().map_or(1, |n| n.get());
        self.max_processes.map_or(cores, |n| n.clamp(1, cores))
    }
}

impl HandlerConfig {
    /// Read the deployment environment.
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_lookup(|name| std::env::var(name).ok())
    }

    /// Build from any variable lookup; absent variables keep their defaults.
    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Result<Self, ConfigError> {
        let text = |name: &str| lookup(name).unwrap_or_default();
        let flag = |name: &str| lookup(name).is_some_and(|v| v == ENV_FLAG_ON);

        let defaults = CorsConfig::default();
        let config = Self {
            source_buckets: parse_bucket_list(&text("SOURCE_BUCKETS")),
            rewrite: RewriteConfig {
                match_pattern: text("REWRITE_MATCH_PATTERN"),
                substitution: text("REWRITE_SUBSTITUTION"),
            },
            signature: SignatureConfig {
                enabled: flag("ENABLE_SIGNATURE"),
                secret_id: text("SECRETS_MANAGER"),
                secret_key: text("SECRET_KEY"),
            },
            auto_format: AutoFormatConfig {
                webp: flag("AUTO_WEBP"),
                avif: flag("AUTO_AVIF"),
            },
            cors: CorsConfig {
                enabled: flag("CORS_ENABLED"),
                origin: lookup("CORS_ORIGIN").unwrap_or(defaults.origin),
            },
            fallback_image: FallbackConfig {
                enabled: flag("ENABLE_DEFAULT_FALLBACK_IMAGE"),
                bucket: text("DEFAULT_FALLBACK_IMAGE_BUCKET"),
                key: text("DEFAULT_FALLBACK_IMAGE_KEY"),
            },
            processing: ProcessingConfig::default(),
        };
        config.validate()?;
        Ok(config)
    }

    /// Check cross-field requirements.
    pub fn validate(&self) -> Result<(), ConfigError> {
        self.rewrite_rule()?;
        if self.signature.enabled
            && (self.signature.secret_id.is_empty() || self.signature.secret_key.is_empty())
        {
            return Err(ConfigError::Validation(
                "signature.secret_id and signature.secret_key are required when signing is enabled"
                    .into(),
            ));
        }
        if self.fallback_image.enabled
            && (self.fallback_image.bucket.is_empty() || self.fallback_image.key.is_empty())
        {
            return Err(ConfigError::Validation(
                "fallback_image.bucket and fallback_image.key are required when the fallback is enabled"
                    .into(),
            ));
        }
        if self.processing.max_processes == Some(0) {
            return Err(ConfigError::Validation(
                "processing.max_processes must be at least 1".into(),
            ));
        }
        Ok(())
    }

    /// The compiled rewrite rule, if one is configured.
    pub fn rewrite_rule(&self) -> Result<Option<RewriteRule>, ConfigError> {
        let RewriteConfig {
            match_pattern,
            substitution,
        } = &self.rewrite;
        match (match_pattern.is_empty(), substitution.is_empty()) {
            (true, true) => Ok(None),
            (false, false) => RewriteRule::parse(match_pattern, substitution)
                .map(Some)
                .map_err(|e| ConfigError::Validation(format!("rewrite.match_pattern: {e}"))),
            _ => Err(ConfigError::Validation(
                "rewrite.match_pattern and rewrite.substitution must be set together".into(),
            )),
        }
    }
}

/// Split a comma-separated bucket list, dropping all whitespace.
pub fn parse_bucket_list(raw: &str) -> Vec<String> {
    let compact: String = raw.chars().filter(|c| !c.is_whitespace()).collect();
    compact
        .split(',')
        .filter(|bucket| !bucket.is_empty())
        .map(str::to_string)
        .collect()
}

// =============================================================================
// Config loading, merging, and validation
// =============================================================================

/// The stock defaults as TOML sections.
fn stock_defaults() -> Result<toml::Table, ConfigError> {
    Ok(toml::Value::try_from(HandlerConfig::default())?.try_into()?)
}

/// Lay file settings over the defaults.
///
/// A section present in both keeps its default fields and takes the file's
/// fields; any other value from the file replaces the default outright.
fn overlay_sections(defaults: &mut toml::Table, file: toml::Table) {
    for (name, value) in file {
        let merged = match (defaults.remove(&name), value) {
            (Some(toml::Value::Table(mut section)), toml::Value::Table(fields)) => {
                section.extend(fields);
                toml::Value::Table(section)
            }
            (_, value) => value,
        };
        defaults.insert(name, merged);
    }
}

/// Build a validated config from the file's parsed contents.
pub fn config_from_table(file: toml::Table) -> Result<HandlerConfig, ConfigError> {
    let mut merged = stock_defaults()?;
    overlay_sections(&mut merged, file);
    let config: HandlerConfig = toml::Value::Table(merged).try_into()?;
    config.validate()?;
    Ok(config)
}

/// Load config from a TOML file; a missing file yields the defaults.
pub fn load_config(path: &Path) -> Result<HandlerConfig, ConfigError> {
    if !path.exists() {
        return Ok(HandlerConfig::default());
    }
    config_from_table(toml::from_str(&fs::read_to_string(path)?)?)
}

/// Returns a fully-commented stock config file.
///
/// Used by the `gen-config` CLI command.
pub fn stock_config_toml() -> &'static str {
    r##"# Image Handler Configuration
# ===========================
# All settings are optional. Remove or comment out any you don't need.
# Values shown below are the defaults.
#
# Every setting can also come from the environment when no config file is
# given (see the variable names next to each section).

# Buckets images may be read from. The first one is used when a request
# names none. (SOURCE_BUCKETS, comma-separated)
source_buckets = []

# ---------------------------------------------------------------------------
# Path rewriting (REWRITE_MATCH_PATTERN, REWRITE_SUBSTITUTION)
# ---------------------------------------------------------------------------
# Turns a custom URL scheme into the filters: path grammar. The pattern is
# either "/regex/flags" or a literal substring. Set both or neither.
[rewrite]
match_pattern = ""
substitution = ""

# ---------------------------------------------------------------------------
# Request signatures (ENABLE_SIGNATURE, SECRETS_MANAGER, SECRET_KEY)
# ---------------------------------------------------------------------------
# When enabled, requests need ?signature=<hex HMAC-SHA256 of the path>.
# secret_id names a JSON secret; secret_key is the field holding the key.
[signature]
enabled = false
secret_id = ""
secret_key = ""

# ---------------------------------------------------------------------------
# Automatic output format (AUTO_WEBP, AUTO_AVIF)
# ---------------------------------------------------------------------------
# Chosen from the Accept header when the request names no format.
# AVIF wins when both are accepted.
[auto_format]
webp = false
avif = false

# ---------------------------------------------------------------------------
# CORS (CORS_ENABLED, CORS_ORIGIN)
# ---------------------------------------------------------------------------
[cors]
enabled = false
origin = "*"

# ---------------------------------------------------------------------------
# Fallback image (ENABLE_DEFAULT_FALLBACK_IMAGE, DEFAULT_FALLBACK_IMAGE_BUCKET,
# DEFAULT_FALLBACK_IMAGE_KEY)
# ---------------------------------------------------------------------------
# Served, with the error's status code, instead of a JSON error body.
[fallback_image]
enabled = false
bucket = ""
key = ""

# ---------------------------------------------------------------------------
# Processing
# ---------------------------------------------------------------------------
[processing]
# Maximum parallel renders for the render command.
# Omit to auto-detect (uses all CPU cores).
# Values larger than the core count are clamped down.
# max_processes = 4
"##
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;
    use tempfile::TempDir;

    fn lookup(vars: &[(&str, &str)]) -> impl Fn(&str) -> Option<String> {
        let map: HashMap<String, String> = vars
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        move |name| map.get(name).cloned()
    }

    #[test]
    fn default_config_is_permissive() {
        let config = HandlerConfig::default();
        assert!(config.source_buckets.is_empty());
        assert!(!config.signature.enabled);
        assert_eq!(config.cors.origin, "*");
        assert!(config.validate().is_ok());
    }

    // =========================================================================
    // Environment
    // =========================================================================

    #[test]
    fn env_bucket_list_ignores_whitespace() {
        let config = HandlerConfig::from_lookup(lookup(&[(
            "SOURCE_BUCKETS",
            " photos , archive\t,, thumbs ",
        )]))
        .unwrap();
        assert_eq!(config.source_buckets, vec!["photos", "archive", "thumbs"]);
    }

    #[test]
    fn env_flags_need_exact_yes() {
        let config = HandlerConfig::from_lookup(lookup(&[
            ("AUTO_WEBP", "Yes"),
            ("AUTO_AVIF", "yes"),
            ("CORS_ENABLED", "true"),
        ]))
        .unwrap();
        assert!(config.auto_format.webp);
        assert!(!config.auto_format.avif);
        assert!(!config.cors.enabled);
    }

    #[test]
    fn env_reads_every_section() {
        let config = HandlerConfig::from_lookup(lookup(&[
            ("SOURCE_BUCKETS", "photos"),
            ("REWRITE_MATCH_PATTERN", "/(filters-)/gm"),
            ("REWRITE_SUBSTITUTION", "filters:"),
            ("ENABLE_SIGNATURE", "Yes"),
            ("SECRETS_MANAGER", "image-handler"),
            ("SECRET_KEY", "signing-key"),
            ("CORS_ENABLED", "Yes"),
            ("CORS_ORIGIN", "https://example.com"),
            ("ENABLE_DEFAULT_FALLBACK_IMAGE", "Yes"),
            ("DEFAULT_FALLBACK_IMAGE_BUCKET", "photos"),
            ("DEFAULT_FALLBACK_IMAGE_KEY", "fallback.png"),
        ]))
        .unwrap();
        assert_eq!(config.rewrite.substitution, "filters:");
        assert!(config.rewrite_rule().unwrap().is_some());
        assert_eq!(config.signature.secret_id, "image-handler");
        assert_eq!(config.cors.origin, "https://example.com");
        assert_eq!(config.fallback_image.key, "fallback.png");
    }

    #[test]
    fn env_signature_without_secret_is_invalid() {
        let result = HandlerConfig::from_lookup(lookup(&[("ENABLE_SIGNATURE", "Yes")]));
        assert!(matches!(result, Err(ConfigError::Validation(_))));
    }

    // =========================================================================
    // Rewrite rule
    // =========================================================================

    #[test]
    fn rewrite_rule_needs_both_halves() {
        let mut config = HandlerConfig::default();
        assert!(config.rewrite_rule().unwrap().is_none());

        config.rewrite.match_pattern = "/a/".into();
        assert!(matches!(config.rewrite_rule(), Err(ConfigError::Validation(_))));

        config.rewrite.substitution = "b".into();
        assert!(config.rewrite_rule().unwrap().is_some());
    }

    #[test]
    fn rewrite_rule_must_compile() {
        let mut config = HandlerConfig::default();
        config.rewrite.match_pattern = "/([/".into();
        config.rewrite.substitution = "x".into();
        let err = config.validate().unwrap_err();
        assert!(err.to_string().contains("rewrite.match_pattern"));
    }

    // =========================================================================
    // Processing config tests
    // =========================================================================

    #[test]
    fn render_threads_never_exceed_cores() {
        let cores = std::thread::available_parallelism().map_or(1, |n| n.get());
        let threads = |max_processes| ProcessingConfig { max_processes }.render_threads();
        assert_eq!(threads(None), cores);
        assert_eq!(threads(Some(1)), 1);
        assert_eq!(threads(Some(cores + 8)), cores);
    }

    #[test]
    fn zero_processes_rejected() {
        let mut config = HandlerConfig::default();
        config.processing.max_processes = Some(0);
        assert!(matches!(config.validate(), Err(ConfigError::Validation(_))));
    }

    // =========================================================================
    // Section overlay
    // =========================================================================

    fn table(raw: &str) -> toml::Table {
        toml::from_str(raw).unwrap()
    }

    #[test]
    fn file_section_keeps_unset_default_fields() {
        let config = config_from_table(table("[cors]\nenabled = true")).unwrap();
        assert!(config.cors.enabled);
        assert_eq!(config.cors.origin, "*");
    }

    #[test]
    fn file_bucket_list_replaces_default() {
        let mut defaults = table(r#"source_buckets = ["a", "b"]"#);
        overlay_sections(&mut defaults, table(r#"source_buckets = ["c"]"#));
        let buckets = defaults.get("source_buckets").and_then(toml::Value::as_array);
        assert_eq!(buckets.map(Vec::len), Some(1));
    }

    // =========================================================================
    // Loading
    // =========================================================================

    #[test]
    fn load_config_returns_default_when_no_file() {
        let tmp = TempDir::new().unwrap();
        let config = load_config(&tmp.path().join("config.toml")).unwrap();
        assert_eq!(config, HandlerConfig::default());
    }

    #[test]
    fn load_config_reads_partial_file() {
        let tmp = TempDir::new().unwrap();
        let path = tmp.path().join("config.toml");
        fs::write(
            &path,
            r#"
source_buckets = ["photos"]

[auto_format]
webp = true
"#,
        )
        .unwrap();

        let config = load_config(&path).unwrap();
        assert_eq!(config.source_buckets, vec!["photos"]);
        assert!(config.auto_format.webp);
        // Unspecified values should be defaults
        assert!(!config.auto_format.avif);
        assert_eq!(config.cors.origin, "*");
    }

    #[test]
    fn load_config_invalid_toml_is_error() {
        let tmp = TempDir::new().unwrap();
        let path = tmp.path().join("config.toml");
        fs::write(&path, "this is not valid toml [[[").unwrap();
        assert!(matches!(load_config(&path), Err(ConfigError::Toml(_))));
    }

    #[test]
    fn unknown_key_rejected() {
        let tmp = TempDir::new().unwrap();
        let path = tmp.path().join("config.toml");
        fs::write(
            &path,
            r#"
[signature]
enabled = false
secret = "typo"
"#,
        )
        .unwrap();
        assert!(matches!(load_config(&path), Err(ConfigError::Toml(_))));
    }

    #[test]
    fn fallback_without_location_is_invalid() {
        let result = config_from_table(table("[fallback_image]\nenabled = true"));
        assert!(matches!(result, Err(ConfigError::Validation(_))));
    }

    // =========================================================================
    // stock_config_toml tests
    // =========================================================================

    #[test]
    fn stock_config_toml_roundtrips_to_defaults() {
        let config: HandlerConfig = toml::from_str(stock_config_toml()).unwrap();
        assert_eq!(config, HandlerConfig::default());
    }

    #[test]
    fn stock_config_toml_contains_all_sections() {
        let content = stock_config_toml();
        for section in [
            "[rewrite]",
            "[signature]",
            "[auto_format]",
            "[cors]",
            "[fallback_image]",
            "[processing]",
        ] {
            assert!(content.contains(section), "missing {section}");
        }
    }
}
