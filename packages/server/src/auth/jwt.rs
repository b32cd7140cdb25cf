use anyhow::Result;
use jsonwebtoken::{decode, encode, DecodingKey, EncodingKey, Header, Validation};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Capability token claims
#[derive(Debug, Serialize, Deserialize, Clone)]
pub struct Claims {
    pub sub: String,    // Subject (owner_id as string)
    pub owner_id: Uuid, // Owner whose runs this token may start and observe
    pub exp: i64,       // Expiration timestamp
    pub iat: i64,       // Issued at timestamp
    pub iss: String,    // Issuer
    pub jti: String,    // JWT ID (unique token identifier)
}

/// JWT Service - creates and verifies capability tokens
#[derive(Clone)]
pub struct JwtService {
    encoding_key: EncodingKey,
    decoding_key: DecodingKey,
    issuer: String,
}

impl JwtService {
    /// Create new JWT service with secret and issuer
    pub fn new(secret: &str, issuer: String) -> Self {
        Self {
            encoding_key: EncodingKey::from_secret(secret.as_bytes()),
            decoding_key: DecodingKey::from_secret(secret.as_bytes()),
            issuer,
        }
    }

    /// Create a token for an owner
    ///
    /// Token expires after 24 hours
    pub fn create_token(&self, owner_id: Uuid) -> Result<String> {
        self.create_token_with_ttl(owner_id, chrono::Duration::hours(24))
    }

    pub fn create_token_with_ttl(&self, owner_id: Uuid, ttl: chrono::Duration) -> Result<String> {
        let now = chrono::Utc::now();
        let exp = now + ttl;

        let claims = Claims {
            sub: owner_id.to_string(),
            owner_id,
            exp: exp.timestamp(),
            iat: now.timestamp(),
            iss: self.issuer.clone(),
            jti: Uuid::new_v4().to_string(),
        };

        encode(&Header::default(), &claims, &self.encoding_key).map_err(Into::into)
    }

    /// Verify and decode a token
    ///
    /// Returns claims if token is valid and not expired
    pub fn verify_token(&self, token: &str) -> Result<Claims> {
        let mut validation = Validation::default();
        validation.set_issuer(&[&self.issuer]);

        decode::<Claims>(token, &self.decoding_key, &validation)
            .map(|data| data.claims)
            .map_err(Into::into)
    }
}
