use std::str::FromStr;

use chrono::{Duration, Utc};
use jsonwebtoken::{Algorithm, DecodingKey, EncodingKey, Header, Validation, decode, encode};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use super::SecurityError;
use crate::config::SecurityConfig;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TokenType {
    Access,
    Refresh,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Claims {
    /// User id, as a string.
    pub sub: String,
    pub exp: i64,
    pub iat: i64,
    pub jti: String,
    #[serde(rename = "type")]
    pub token_type: TokenType,
}

impl Claims {
    pub fn user_id(&self) -> Option<i64> {
        self.sub.parse().ok()
    }
}

pub fn verify_token_type(claims: &Claims, expected: TokenType) -> bool {
    claims.token_type == expected
}

/// Signs and checks access/refresh tokens with the configured HMAC secret.
#[derive(Clone)]
pub struct TokenIssuer {
    encoding: EncodingKey,
    decoding: DecodingKey,
    algorithm: Algorithm,
    access_ttl: Duration,
    refresh_ttl: Duration,
}

impl TokenIssuer {
    pub fn new(config: &SecurityConfig) -> Result<Self, SecurityError> {
        let algorithm = Algorithm::from_str(&config.algorithm)
            .map_err(|_| SecurityError::UnsupportedAlgorithm(config.algorithm.clone()))?;
        if !matches!(
            algorithm,
            Algorithm::HS256 | Algorithm::HS384 | Algorithm::HS512
        ) {
            return Err(SecurityError::UnsupportedAlgorithm(config.algorithm.clone()));
        }

        Ok(Self {
            encoding: EncodingKey::from_secret(config.secret_key.as_bytes()),
            decoding: DecodingKey::from_secret(config.secret_key.as_bytes()),
            algorithm,
            access_ttl: Duration::minutes(config.access_token_expire_minutes),
            refresh_ttl: Duration::days(config.refresh_token_expire_days),
        })
    }

    pub fn create_access_token(&self, user_id: i64) -> Result<String, SecurityError> {
        self.create_token(user_id, TokenType::Access, self.access_ttl)
    }

    pub fn create_refresh_token(&self, user_id: i64) -> Result<String, SecurityError> {
        self.create_token(user_id, TokenType::Refresh, self.refresh_ttl)
    }

    pub fn create_token(
        &self,
        user_id: i64,
        token_type: TokenType,
        ttl: Duration,
    ) -> Result<String, SecurityError> {
        let now = Utc::now();
        let claims = Claims {
            sub: user_id.to_string(),
            exp: (now + ttl).timestamp(),
            iat: now.timestamp(),
            jti: Uuid::new_v4().to_string(),
            token_type,
        };
        Ok(encode(&Header::new(self.algorithm), &claims, &self.encoding)?)
    }

    /// `None` for a bad signature, a malformed token or an expired one.
    pub fn decode(&self, token: &str) -> Option<Claims> {
        let mut validation = Validation::new(self.algorithm);
        validation.leeway = 0;
        decode::<Claims>(token, &self.decoding, &validation)
            .map(|data| data.claims)
            .ok()
    }

    pub fn access_token_ttl_seconds(&self) -> i64 {
        self.access_ttl.num_seconds()
    }
}

#[cfg(test)]
mod tests {
    use chrono::Duration;

    use super::{TokenIssuer, TokenType, verify_token_type};
    use crate::config::SecurityConfig;

    fn config(secret: &str) -> SecurityConfig {
        SecurityConfig {
            secret_key: secret.to_string(),
            algorithm: "HS256".to_string(),
            access_token_expire_minutes: 30,
            refresh_token_expire_days: 7,
            bcrypt_cost: 4,
        }
    }

    #[test]
    fn access_token_carries_subject_and_type() {
        let issuer = TokenIssuer::new(&config("secret")).expect("issuer");
        let token = issuer.create_access_token(42).expect("token");
        let claims = issuer.decode(&token).expect("claims");

        assert_eq!(claims.user_id(), Some(42));
        assert!(verify_token_type(&claims, TokenType::Access));
        assert!(!verify_token_type(&claims, TokenType::Refresh));
        assert_eq!(claims.exp - claims.iat, 30 * 60);
        assert_eq!(issuer.access_token_ttl_seconds(), 1800);
    }

    #[test]
    fn refresh_tokens_are_unique() {
        let issuer = TokenIssuer::new(&config("secret")).expect("issuer");
        let first = issuer.create_refresh_token(7).expect("token");
        let second = issuer.create_refresh_token(7).expect("token");
        assert_ne!(first, second);

        let claims = issuer.decode(&first).expect("claims");
        assert_eq!(claims.token_type, TokenType::Refresh);
        assert_eq!(claims.exp - claims.iat, 7 * 24 * 3600);
    }

    #[test]
    fn expired_token_is_rejected() {
        let issuer = TokenIssuer::new(&config("secret")).expect("issuer");
        let token = issuer
            .create_token(1, TokenType::Access, Duration::seconds(-30))
            .expect("token");
        assert!(issuer.decode(&token).is_none());
    }

    #[test]
    fn foreign_signature_is_rejected() {
        let issuer = TokenIssuer::new(&config("secret")).expect("issuer");
        let other = TokenIssuer::new(&config("other-secret")).expect("issuer");
        let token = other.create_access_token(1).expect("token");
        assert!(issuer.decode(&token).is_none());
        assert!(issuer.decode("not.a.jwt").is_none());
    }

    #[test]
    fn asymmetric_algorithms_are_refused() {
        let mut cfg = config("secret");
        cfg.algorithm = "RS256".to_string();
        assert!(TokenIssuer::new(&cfg).is_err());
    }
}
