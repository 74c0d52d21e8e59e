//! Upstream authentication.
//!
//! Token verification is a capability behind [`Verifier`]; the server only
//! cares that a bearer token resolves to an [`EndpointToken`] whose
//! endpoint list (empty = unrestricted) gates Listen registrations.

use axum::http::HeaderMap;
use jsonwebtoken::{Algorithm, DecodingKey, Validation};
use serde::Deserialize;

/// Claims carried by a verified endpoint token.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct EndpointToken {
    /// Endpoints the bearer may register.  Empty means no restriction.
    pub endpoints: Vec<String>,
}

impl EndpointToken {
    pub fn permits(&self, endpoint_id: &str) -> bool {
        self.endpoints.is_empty() || self.endpoints.iter().any(|e| e == endpoint_id)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, thiserror::Error)]
pub enum AuthError {
    #[error("missing authorization")]
    MissingAuthorization,
    #[error("invalid token")]
    InvalidToken,
}

pub trait Verifier: Send + Sync + 'static {
    fn verify_endpoint_token(&self, token: Option<&str>) -> Result<EndpointToken, AuthError>;
}

/// HS256 verification of endpoint tokens.
#[derive(Clone)]
pub struct HmacVerifier {
    key: DecodingKey,
    validation: Validation,
}

#[derive(Debug, Deserialize)]
struct Claims {
    #[serde(default)]
    endpoints: Vec<String>,
    #[allow(dead_code)]
    exp: u64,
}

impl HmacVerifier {
    pub fn new(secret: &str) -> Self {
        Self {
            key: DecodingKey::from_secret(secret.as_bytes()),
            validation: Validation::new(Algorithm::HS256),
        }
    }
}

impl Verifier for HmacVerifier {
    fn verify_endpoint_token(&self, token: Option<&str>) -> Result<EndpointToken, AuthError> {
        let token = token.ok_or(AuthError::MissingAuthorization)?;
        let data = jsonwebtoken::decode::<Claims>(token, &self.key, &self.validation)
            .map_err(|_| AuthError::InvalidToken)?;
        Ok(EndpointToken {
            endpoints: data.claims.endpoints,
        })
    }
}

/// Verifier used when no secret is configured: every upstream is admitted
/// with an unrestricted token.
pub struct AllowAllVerifier;

impl Verifier for AllowAllVerifier {
    fn verify_endpoint_token(&self, _token: Option<&str>) -> Result<EndpointToken, AuthError> {
        Ok(EndpointToken::default())
    }
}

pub fn extract_bearer(authorization: &str) -> Option<&str> {
    authorization.strip_prefix("Bearer ")
}

pub fn extract_token_from_headers(headers: &HeaderMap) -> Option<String> {
    headers
        .get("authorization")
        .and_then(|v| v.to_str().ok())
        .and_then(extract_bearer)
        .map(ToOwned::to_owned)
}

#[cfg(test)]
mod tests {
    use super::*;
    use jsonwebtoken::{encode, EncodingKey, Header};
    use serde::Serialize;

    #[derive(Serialize)]
    struct TestClaims {
        endpoints: Vec<String>,
        exp: u64,
    }

    fn mint(secret: &str, endpoints: &[&str]) -> String {
        let exp = std::time::SystemTime::now()
            .duration_since(std::time::UNIX_EPOCH)
            .unwrap()
            .as_secs()
            + 3600;
        encode(
            &Header::default(),
            &TestClaims {
                endpoints: endpoints.iter().map(|s| (*s).to_owned()).collect(),
                exp,
            },
            &EncodingKey::from_secret(secret.as_bytes()),
        )
        .unwrap()
    }

    #[test]
    fn valid_token_resolves_claims() {
        let verifier = HmacVerifier::new("secret");
        let token = mint("secret", &["a", "b"]);
        let claims = verifier.verify_endpoint_token(Some(&token)).unwrap();
        assert_eq!(claims.endpoints, vec!["a".to_owned(), "b".to_owned()]);
        assert!(claims.permits("a"));
        assert!(!claims.permits("c"));
    }

    #[test]
    fn empty_endpoint_list_permits_everything() {
        let verifier = HmacVerifier::new("secret");
        let token = mint("secret", &[]);
        let claims = verifier.verify_endpoint_token(Some(&token)).unwrap();
        assert!(claims.permits("anything"));
    }

    #[test]
    fn wrong_key_is_invalid() {
        let verifier = HmacVerifier::new("secret");
        let token = mint("other-secret", &[]);
        assert_eq!(
            verifier.verify_endpoint_token(Some(&token)),
            Err(AuthError::InvalidToken)
        );
    }

    #[test]
    fn missing_token_is_distinct_from_invalid() {
        let verifier = HmacVerifier::new("secret");
        assert_eq!(
            verifier.verify_endpoint_token(None),
            Err(AuthError::MissingAuthorization)
        );
    }

    #[test]
    fn expired_token_is_invalid() {
        let verifier = HmacVerifier::new("secret");
        let token = encode(
            &Header::default(),
            &TestClaims {
                endpoints: vec![],
                exp: 1,
            },
            &EncodingKey::from_secret(b"secret"),
        )
        .unwrap();
        assert_eq!(
            verifier.verify_endpoint_token(Some(&token)),
            Err(AuthError::InvalidToken)
        );
    }

    #[test]
    fn bearer_extraction_handles_missing_and_malformed() {
        let mut headers = HeaderMap::new();
        assert_eq!(extract_token_from_headers(&headers), None);
        headers.insert("authorization", "Basic abc".parse().unwrap());
        assert_eq!(extract_token_from_headers(&headers), None);
        headers.insert("authorization", "Bearer tok-1".parse().unwrap());
        assert_eq!(extract_token_from_headers(&headers), Some("tok-1".to_owned()));
    }
}
