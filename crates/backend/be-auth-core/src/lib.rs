//! Bearer-token validation for the identity supplied by the auth service.
//!
//! Tokens are issued elsewhere; this crate only checks them and exposes the
//! subject as an opaque user id.

use anyhow::{Result, anyhow};
use jsonwebtoken::{Algorithm, DecodingKey, Validation, decode};
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Claims {
    /// Opaque user id.
    pub sub: String,
    pub exp: i64,
    pub iat: i64,
    pub token_type: String,
}

#[derive(Clone)]
pub struct JwtConfig {
    pub access_token_decoding_key: DecodingKey,
    pub validation: Validation,
}

impl JwtConfig {
    /// HS256 validation with a shared secret.
    pub fn from_secret(secret: &[u8]) -> Self {
        Self {
            access_token_decoding_key: DecodingKey::from_secret(secret),
            validation: Validation::new(Algorithm::HS256),
        }
    }

    /// Reads `JWT_ACCESS_PUBLIC_KEY` (PEM-encoded EC key, ES256) or, failing
    /// that, `JWT_ACCESS_SECRET` (HS256). Returns `None` when neither is set,
    /// in which case requests carry no verified identity.
    pub fn from_env() -> Result<Option<Self>> {
        if let Some(public_key) = non_empty_var("JWT_ACCESS_PUBLIC_KEY") {
            let key = DecodingKey::from_ec_pem(public_key.as_bytes())
                .map_err(|e| anyhow!("JWT_ACCESS_PUBLIC_KEY is not a valid EC PEM key: {e}"))?;
            return Ok(Some(Self {
                access_token_decoding_key: key,
                validation: Validation::new(Algorithm::ES256),
            }));
        }

        if let Some(secret) = non_empty_var("JWT_ACCESS_SECRET") {
            return Ok(Some(Self::from_secret(secret.as_bytes())));
        }

        tracing::warn!("No JWT key configured, bearer tokens will be rejected");
        Ok(None)
    }

    pub fn validate_access_token(&self, token: &str) -> Result<Claims> {
        let token_data = decode::<Claims>(token, &self.access_token_decoding_key, &self.validation)
            .map_err(|e| anyhow!("Invalid token: {}", e))?;

        if token_data.claims.token_type != "access" {
            return Err(anyhow!("Invalid token type: expected access token"));
        }

        if token_data.claims.sub.is_empty() {
            return Err(anyhow!("Invalid token: empty subject"));
        }

        Ok(token_data.claims)
    }
}

fn non_empty_var(name: &str) -> Option<String> {
    std::env::var(name).ok().filter(|v| !v.trim().is_empty())
}

#[cfg(test)]
mod tests {
    use super::*;
    use jsonwebtoken::{EncodingKey, Header, encode};

    const SECRET: &[u8] = b"test-secret";

    fn token(sub: &str, token_type: &str, secret: &[u8]) -> String {
        let now = chrono::Utc::now().timestamp();
        let claims = Claims {
            sub: sub.to_string(),
            exp: now + 3600,
            iat: now,
            token_type: token_type.to_string(),
        };
        encode(
            &Header::new(Algorithm::HS256),
            &claims,
            &EncodingKey::from_secret(secret),
        )
        .unwrap()
    }

    #[test]
    fn accepts_access_token() {
        let config = JwtConfig::from_secret(SECRET);
        let claims = config
            .validate_access_token(&token("u1", "access", SECRET))
            .unwrap();
        assert_eq!(claims.sub, "u1");
    }

    #[test]
    fn rejects_refresh_token() {
        let config = JwtConfig::from_secret(SECRET);
        assert!(
            config
                .validate_access_token(&token("u1", "refresh", SECRET))
                .is_err()
        );
    }

    #[test]
    fn rejects_wrong_secret() {
        let config = JwtConfig::from_secret(SECRET);
        assert!(
            config
                .validate_access_token(&token("u1", "access", b"other"))
                .is_err()
        );
    }

    #[test]
    fn rejects_garbage() {
        let config = JwtConfig::from_secret(SECRET);
        assert!(config.validate_access_token("not-a-jwt").is_err());
    }
}
