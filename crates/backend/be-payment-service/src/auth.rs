use std::sync::Arc;

use axum::extract::FromRequestParts;
use axum::http::request::Parts;
use be_auth_core::{Claims, JwtConfig};

use crate::error::PaymentError;

/// Identity from an optional bearer token. Requests without an
/// `Authorization` header pass through as anonymous; a header that is present
/// must carry a valid access token.
pub struct MaybeUser(pub Option<Claims>);

impl<S> FromRequestParts<S> for MaybeUser
where
    S: Send + Sync,
{
    type Rejection = PaymentError;

    async fn from_request_parts(parts: &mut Parts, _state: &S) -> Result<Self, Self::Rejection> {
        let Some(auth_header) = parts.headers.get("authorization") else {
            return Ok(MaybeUser(None));
        };

        let auth_header = auth_header.to_str().map_err(|_| {
            PaymentError::Unauthorized("Authorization header is not valid ASCII".to_string())
        })?;

        let Some(token) = auth_header.strip_prefix("Bearer ") else {
            return Err(PaymentError::Unauthorized(
                "Authorization header must start with 'Bearer '".to_string(),
            ));
        };

        let jwt_config = parts.extensions.get::<Arc<JwtConfig>>().ok_or_else(|| {
            PaymentError::Unauthorized("Bearer tokens are not accepted".to_string())
        })?;

        let claims = jwt_config
            .validate_access_token(token)
            .map_err(|e| PaymentError::Unauthorized(e.to_string()))?;

        Ok(MaybeUser(Some(claims)))
    }
}

impl MaybeUser {
    /// The user a request acts for. A token's subject wins; a body `userId`
    /// may only repeat it.
    pub fn resolve(self, body_user_id: Option<String>) -> Result<Option<String>, PaymentError> {
        let body_user_id = body_user_id
            .map(|id| id.trim().to_string())
            .filter(|id| !id.is_empty());

        match (self.0, body_user_id) {
            (Some(claims), Some(body)) if body != claims.sub => Err(PaymentError::Unauthorized(
                "userId does not match the authenticated user".to_string(),
            )),
            (Some(claims), _) => Ok(Some(claims.sub)),
            (None, body) => Ok(body),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn claims(sub: &str) -> Claims {
        Claims {
            sub: sub.into(),
            exp: 0,
            iat: 0,
            token_type: "access".into(),
        }
    }

    #[test]
    fn test_token_subject_wins() {
        let user = MaybeUser(Some(claims("U1")));
        assert_eq!(user.resolve(None).unwrap(), Some("U1".into()));

        let user = MaybeUser(Some(claims("U1")));
        assert_eq!(user.resolve(Some("U1".into())).unwrap(), Some("U1".into()));
    }

    #[test]
    fn test_mismatched_body_user_is_rejected() {
        let user = MaybeUser(Some(claims("U1")));
        assert!(matches!(
            user.resolve(Some("U2".into())),
            Err(PaymentError::Unauthorized(_))
        ));
    }

    #[test]
    fn test_anonymous_uses_body() {
        assert_eq!(
            MaybeUser(None).resolve(Some(" U3 ".into())).unwrap(),
            Some("U3".into())
        );
        assert_eq!(MaybeUser(None).resolve(Some("".into())).unwrap(), None);
    }
}
