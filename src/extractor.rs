use axum::async_trait;
use axum::{
    extract::FromRequestParts,
    http::{request::Parts, StatusCode},
};
use jsonwebtoken::{decode, DecodingKey, Validation};
use serde::Deserialize;
use uuid::Uuid;

use crate::dispatch::Caller;
use crate::jobs::EntitlementTier;

#[derive(Deserialize)]
struct Claims {
    sub: String,
    role: String,
    #[serde(default)]
    tier: Option<String>,
    #[allow(dead_code)]
    exp: usize,
}

pub struct AuthUser {
    pub owner_id: Uuid,
    pub role: String,
    pub tier: EntitlementTier,
}

impl AuthUser {
    pub fn is_admin(&self) -> bool {
        self.role == "admin"
    }

    pub fn caller(&self) -> Caller {
        Caller {
            owner_id: self.owner_id,
            tier: self.tier,
        }
    }
}

#[async_trait]
impl<S> FromRequestParts<S> for AuthUser
where
    S: Send + Sync,
{
    type Rejection = (StatusCode, String);

    async fn from_request_parts(parts: &mut Parts, _state: &S) -> Result<Self, Self::Rejection> {
        let token_opt = if let Some(cookie_header) = parts.headers.get(axum::http::header::COOKIE) {
            let cookies = cookie_header.to_str().unwrap_or("");
            cookies.split(';').find_map(|c| {
                let c = c.trim();
                c.strip_prefix("auth_token=").map(|s| s.to_string())
            })
        } else if let Some(authz) = parts.headers.get(axum::http::header::AUTHORIZATION) {
            authz
                .to_str()
                .ok()
                .and_then(|s| s.strip_prefix("Bearer ").map(|s| s.to_string()))
        } else {
            None
        };
        let token = token_opt.ok_or((StatusCode::UNAUTHORIZED, "Missing token".into()))?;
        let secret = crate::config::JWT_SECRET.as_str();
        let decoded = decode::<Claims>(
            &token,
            &DecodingKey::from_secret(secret.as_bytes()),
            &Validation::default(),
        )
        .map_err(|_| (StatusCode::UNAUTHORIZED, "Invalid token".into()))?;
        let owner_id = Uuid::parse_str(&decoded.claims.sub)
            .map_err(|_| (StatusCode::UNAUTHORIZED, "Invalid subject".into()))?;
        let tier = match decoded.claims.tier.as_deref() {
            Some(raw) => raw
                .parse::<EntitlementTier>()
                .map_err(|_| (StatusCode::UNAUTHORIZED, "Invalid tier".into()))?,
            None => EntitlementTier::default(),
        };
        Ok(AuthUser {
            owner_id,
            role: decoded.claims.role,
            tier,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::http::Request;
    use jsonwebtoken::{encode, EncodingKey, Header};

    fn token(claims: serde_json::Value) -> String {
        encode(&Header::default(), &claims, &EncodingKey::from_secret(b"secret")).unwrap()
    }

    async fn extract(header: String) -> Result<AuthUser, (StatusCode, String)> {
        std::env::set_var("JWT_SECRET", "secret");
        let request = Request::builder()
            .header("Authorization", header)
            .body(axum::body::Body::empty())
            .unwrap();
        let mut parts = request.into_parts().0;
        AuthUser::from_request_parts(&mut parts, &()).await
    }

    #[tokio::test]
    async fn token_parsed_from_header() {
        let owner = Uuid::new_v4();
        let token = token(serde_json::json!({
            "sub": owner.to_string(),
            "role": "user",
            "tier": "pro",
            "exp": 9999999999u64
        }));
        let user = extract(format!("Bearer {}", token)).await.unwrap();
        assert_eq!(user.owner_id, owner);
        assert_eq!(user.role, "user");
        assert_eq!(user.tier, EntitlementTier::Pro);
        assert!(!user.is_admin());
    }

    #[tokio::test]
    async fn missing_tier_defaults_to_free() {
        let token = token(serde_json::json!({
            "sub": Uuid::new_v4().to_string(),
            "role": "admin",
            "exp": 9999999999u64
        }));
        let user = extract(format!("Bearer {}", token)).await.unwrap();
        assert_eq!(user.tier, EntitlementTier::Free);
        assert!(user.is_admin());
    }

    #[tokio::test]
    async fn invalid_token_rejected() {
        assert!(extract("Bearer invalid".to_string()).await.is_err());
    }

    #[tokio::test]
    async fn non_uuid_subject_rejected() {
        let token = token(serde_json::json!({"sub": "7", "role": "user", "exp": 9999999999u64}));
        assert!(extract(format!("Bearer {}", token)).await.is_err());
    }
}
