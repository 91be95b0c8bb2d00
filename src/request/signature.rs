//! Request signatures.
//!
//! When enabled, every request must carry a `signature` query parameter equal
//! to the lowercase hex HMAC-SHA256 of the raw request path. The key is one
//! field of a JSON secret fetched from the [`SecretStore`].

use crate::config::SignatureConfig;
use crate::error::HandlerError;
use crate::services::SecretStore;
use hmac::{Hmac, Mac};
use serde_json::Value;
use sha2::Sha256;
use tracing::{debug, error};

type HmacSha256 = Hmac<Sha256>;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SignatureValidator {
    Disabled,
    Enabled { secret_id: String, secret_key: String },
}

impl SignatureValidator {
    pub fn from_config(config: &SignatureConfig) -> Self {
        if config.enabled {
            SignatureValidator::Enabled {
                secret_id: config.secret_id.clone(),
                secret_key: config.secret_key.clone(),
            }
        } else {
            SignatureValidator::Disabled
        }
    }

    /// Check `signature` against `path`. A missing signature fails before the
    /// secret is fetched.
    pub fn validate(
        &self,
        path: &str,
        signature: Option<&str>,
        secrets: &dyn SecretStore,
    ) -> Result<(), HandlerError> {
        let SignatureValidator::Enabled {
            secret_id,
            secret_key,
        } = self
        else {
            return Ok(());
        };
        let signature = signature
            .filter(|s| !s.is_empty())
            .ok_or(HandlerError::AuthorizationQueryParameters)?;

        let key = signing_key(secrets, secret_id, secret_key)?;
        let expected = sign(path, &key).map_err(|e| {
            error!(error = %e, "cannot build signature");
            HandlerError::SignatureValidationFailure
        })?;
        if expected == signature {
            Ok(())
        } else {
            debug!(path, "signature mismatch");
            Err(HandlerError::SignatureDoesNotMatch)
        }
    }
}

fn signing_key(
    secrets: &dyn SecretStore,
    secret_id: &str,
    field: &str,
) -> Result<String, HandlerError> {
    let raw = secrets.secret_string(secret_id).map_err(|e| {
        error!(secret_id, error = %e, "cannot read signing secret");
        HandlerError::SignatureValidationFailure
    })?;
    let parsed: Value = serde_json::from_str(&raw).map_err(|e| {
        error!(secret_id, error = %e, "signing secret is not JSON");
        HandlerError::SignatureValidationFailure
    })?;
    match parsed.get(field).and_then(Value::as_str) {
        Some(key) => Ok(key.to_string()),
        None => {
            error!(secret_id, field, "signing secret has no such field");
            Err(HandlerError::SignatureValidationFailure)
        }
    }
}

/// Lowercase hex HMAC-SHA256 of `path` under `key`.
pub fn sign(path: &str, key: &str) -> Result<String, hmac::digest::InvalidLength> {
    let mut mac = HmacSha256::new_from_slice(key.as_bytes())?;
    mac.update(path.as_bytes());
    Ok(format!("{:x}", mac.finalize().into_bytes()))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::services::MapSecretStore;

    fn enabled() -> SignatureValidator {
        SignatureValidator::Enabled {
            secret_id: "image-handler".into(),
            secret_key: "signing-key".into(),
        }
    }

    fn store() -> MapSecretStore {
        MapSecretStore::new().with_secret("image-handler", r#"{"signing-key":"secret"}"#)
    }

    #[test]
    fn sign_matches_known_digest() {
        // Widely published HMAC-SHA256 test vector.
        assert_eq!(
            sign("The quick brown fox jumps over the lazy dog", "key").unwrap(),
            "f7bc83f430538424b13298e6aa6fb143ef4d59a14946175997479dbc2d1a3cd8"
        );
    }

    #[test]
    fn disabled_accepts_anything() {
        let empty = MapSecretStore::new();
        assert!(SignatureValidator::Disabled.validate("/a.jpg", None, &empty).is_ok());
    }

    #[test]
    fn valid_signature_passes() {
        let path = "/filters:grayscale()/cat.jpg";
        let signature = sign(path, "secret").unwrap();
        assert!(enabled().validate(path, Some(&signature), &store()).is_ok());
    }

    #[test]
    fn missing_signature_is_a_bad_request() {
        for signature in [None, Some("")] {
            let err = enabled().validate("/anything", signature, &store()).unwrap_err();
            assert_eq!(err.code(), "AuthorizationQueryParametersError");
            assert_eq!(err.status(), 400);
        }
    }

    #[test]
    fn wrong_signature_is_forbidden() {
        let signature = sign("/other.jpg", "secret").unwrap();
        let err = enabled().validate("/cat.jpg", Some(&signature), &store()).unwrap_err();
        assert_eq!(err.code(), "SignatureDoesNotMatch");
        assert_eq!(err.status(), 403);
    }

    #[test]
    fn signature_comparison_is_case_sensitive() {
        let signature = sign("/cat.jpg", "secret").unwrap().to_uppercase();
        let err = enabled().validate("/cat.jpg", Some(&signature), &store()).unwrap_err();
        assert_eq!(err.code(), "SignatureDoesNotMatch");
    }

    #[test]
    fn unreadable_secret_is_a_validation_failure() {
        let cases = [
            MapSecretStore::new(),
            MapSecretStore::new().with_secret("image-handler", "not json"),
            MapSecretStore::new().with_secret("image-handler", r#"{"other":"x"}"#),
        ];
        for secrets in cases {
            let err = enabled().validate("/cat.jpg", Some("abc"), &secrets).unwrap_err();
            assert_eq!(err.code(), "SignatureValidationFailure");
            assert_eq!(err.status(), 500);
        }
    }
}
