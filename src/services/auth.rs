use async_trait::async_trait;
use chrono::{Duration, Utc};
use jsonwebtoken::{decode, encode, errors::ErrorKind, DecodingKey, EncodingKey, Header, Validation};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::{
    config::JwtConfig,
    error::{AppError, AppResult},
};

#[derive(Debug, Serialize, Deserialize, Clone)]
pub struct Claims {
    pub sub: String, // user_id
    pub iss: String, // issuer
    pub exp: i64,    // expiry
    pub iat: i64,    // issued at
}

/// Maps a bearer token to the user it was issued for.
#[async_trait]
pub trait TokenVerifier: Send + Sync {
    async fn verify(&self, token: &str) -> AppResult<Uuid>;
}

/// HS256 tokens signed with a shared secret.
pub struct JwtVerifier {
    config: JwtConfig,
    encoding: EncodingKey,
    decoding: DecodingKey,
}

impl JwtVerifier {
    pub fn new(config: &JwtConfig) -> Self {
        Self {
            encoding: EncodingKey::from_secret(config.secret.as_bytes()),
            decoding: DecodingKey::from_secret(config.secret.as_bytes()),
            config: config.clone(),
        }
    }

    pub fn validate_token(&self, token: &str) -> AppResult<Claims> {
        let mut validation = Validation::default();
        validation.set_issuer(&[&self.config.issuer]);

        decode::<Claims>(token, &self.decoding, &validation)
            .map(|data| data.claims)
            .map_err(|e| match e.kind() {
                ErrorKind::ExpiredSignature => AppError::TokenExpired,
                _ => AppError::InvalidToken,
            })
    }

    pub fn issue_token(&self, user_id: Uuid) -> AppResult<String> {
        let now = Utc::now();
        let ttl = Duration::seconds(self.config.access_token_ttl.as_secs() as i64);
        let claims = Claims {
            sub: user_id.to_string(),
            iss: self.config.issuer.clone(),
            exp: (now + ttl).timestamp(),
            iat: now.timestamp(),
        };

        Ok(encode(&Header::default(), &claims, &self.encoding)?)
    }
}

#[async_trait]
impl TokenVerifier for JwtVerifier {
    async fn verify(&self, token: &str) -> AppResult<Uuid> {
        let claims = self.validate_token(token)?;
        Uuid::parse_str(&claims.sub).map_err(|_| AppError::InvalidToken)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::Config;

    #[tokio::test]
    async fn test_issued_token_verifies() {
        let verifier = JwtVerifier::new(&Config::for_tests().jwt);
        let user = Uuid::new_v4();

        let token = verifier.issue_token(user).unwrap();
        assert_eq!(verifier.verify(&token).await.unwrap(), user);
    }

    #[tokio::test]
    async fn test_foreign_tokens_are_rejected() {
        let config = Config::for_tests().jwt;
        let verifier = JwtVerifier::new(&config);

        let other_secret = JwtVerifier::new(&JwtConfig {
            secret: "another-secret".to_string(),
            ..config.clone()
        });
        let token = other_secret.issue_token(Uuid::new_v4()).unwrap();
        assert!(matches!(verifier.verify(&token).await, Err(AppError::InvalidToken)));

        let other_issuer = JwtVerifier::new(&JwtConfig {
            issuer: "someone-else".to_string(),
            ..config
        });
        let token = other_issuer.issue_token(Uuid::new_v4()).unwrap();
        assert!(verifier.verify(&token).await.is_err());

        assert!(verifier.verify("not-a-jwt").await.is_err());
    }

    #[tokio::test]
    async fn test_expired_token() {
        let config = Config::for_tests().jwt;
        let verifier = JwtVerifier::new(&config);
        let past = Utc::now() - Duration::hours(2);
        let claims = Claims {
            sub: Uuid::new_v4().to_string(),
            iss: config.issuer.clone(),
            exp: (past + Duration::minutes(5)).timestamp(),
            iat: past.timestamp(),
        };
        let token = encode(
            &Header::default(),
            &claims,
            &EncodingKey::from_secret(config.secret.as_bytes()),
        )
        .unwrap();

        assert!(matches!(verifier.verify(&token).await, Err(AppError::TokenExpired)));
    }
}
