/// Short-lived signed tokens presented to the manager
use crate::errors::{DaemonError, DaemonResult};
use chrono::{Duration, Utc};
use jsonwebtoken::{decode, encode, DecodingKey, EncodingKey, Header, Validation};
use serde::{Deserialize, Serialize};

/// Scope carried by every agent token
pub const DELEGATE_SCOPE: &str = "delegate";

/// JWT claims
#[derive(Debug, Serialize, Deserialize)]
pub struct Claims {
    pub sub: String,
    pub exp: i64,
    pub iat: i64,
    pub scope: Vec<String>,
}

/// Signs tokens with the account secret
pub struct TokenSigner {
    account_id: String,
    expiry_secs: i64,
    encoding_key: EncodingKey,
    decoding_key: DecodingKey,
}

impl TokenSigner {
    pub fn new(account_id: &str, account_secret: &str, expiry_secs: u64) -> Self {
        TokenSigner {
            account_id: account_id.to_string(),
            expiry_secs: expiry_secs as i64,
            encoding_key: EncodingKey::from_secret(account_secret.as_bytes()),
            decoding_key: DecodingKey::from_secret(account_secret.as_bytes()),
        }
    }

    /// Generate a fresh token
    pub fn token(&self) -> DaemonResult<String> {
        let now = Utc::now();
        let exp = now + Duration::seconds(self.expiry_secs);

        let claims = Claims {
            sub: self.account_id.clone(),
            exp: exp.timestamp(),
            iat: now.timestamp(),
            scope: vec![DELEGATE_SCOPE.to_string()],
        };

        encode(&Header::default(), &claims, &self.encoding_key)
            .map_err(|e| DaemonError::AuthError(format!("Token generation failed: {}", e)))
    }

    /// Verify a token
    pub fn verify(&self, token: &str) -> DaemonResult<Claims> {
        decode::<Claims>(token, &self.decoding_key, &Validation::default())
            .map(|data| data.claims)
            .map_err(|e| DaemonError::AuthError(format!("Token verification failed: {}", e)))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_token_round_trip() {
        let signer = TokenSigner::new("acc-1", "secret", 300);
        let token = signer.token().unwrap();
        let claims = signer.verify(&token).unwrap();
        assert_eq!(claims.sub, "acc-1");
        assert_eq!(claims.scope, vec![DELEGATE_SCOPE.to_string()]);
        assert!(claims.exp > claims.iat);
    }

    #[test]
    fn test_token_rejected_with_other_secret() {
        let token = TokenSigner::new("acc-1", "secret", 300).token().unwrap();
        let other = TokenSigner::new("acc-1", "different", 300);
        assert!(other.verify(&token).is_err());
    }
}
