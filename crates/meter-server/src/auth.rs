//! Bearer Token Identity
//!
//! Tokens have the form `<accountId>.<expiresUnix>.<hex HMAC-SHA256>` where
//! the MAC covers `<accountId>.<expiresUnix>`. Account ids must not contain `.`.

use axum::http::{HeaderMap, header::AUTHORIZATION};
use chrono::{DateTime, Utc};
use hmac::{Hmac, Mac};
use sha2::Sha256;

use meter_billing::{BillingError, Result};

type HmacSha256 = Hmac<Sha256>;

/// Resolves a bearer token to an account id
pub trait IdentityVerifier: Send + Sync {
    fn verify(&self, token: &str, now: DateTime<Utc>) -> Result<String>;
}

#[derive(Clone)]
pub struct HmacIdentity {
    secret: String,
}

impl HmacIdentity {
    pub fn new(secret: impl Into<String>) -> Self {
        Self { secret: secret.into() }
    }

    fn mac(&self, message: &str) -> Result<HmacSha256> {
        let mut mac = HmacSha256::new_from_slice(self.secret.as_bytes())
            .map_err(|e| BillingError::Config(e.to_string()))?;
        mac.update(message.as_bytes());
        Ok(mac)
    }

    /// Mint a token valid until `expires_at`
    pub fn issue(&self, account_id: &str, expires_at: DateTime<Utc>) -> Result<String> {
        let claims = format!("{account_id}.{}", expires_at.timestamp());
        let tag = hex::encode(self.mac(&claims)?.finalize().into_bytes());
        Ok(format!("{claims}.{tag}"))
    }
}

impl IdentityVerifier for HmacIdentity {
    fn verify(&self, token: &str, now: DateTime<Utc>) -> Result<String> {
        let mut parts = token.rsplitn(3, '.');
        let (Some(tag), Some(expires), Some(account_id)) = (parts.next(), parts.next(), parts.next())
        else {
            return Err(BillingError::Unauthenticated);
        };
        if account_id.is_empty() || account_id.contains('.') {
            return Err(BillingError::Unauthenticated);
        }

        let expires: i64 = expires.parse().map_err(|_| BillingError::Unauthenticated)?;
        let tag = hex::decode(tag).map_err(|_| BillingError::Unauthenticated)?;

        self.mac(&format!("{account_id}.{expires}"))?
            .verify_slice(&tag)
            .map_err(|_| BillingError::Unauthenticated)?;

        if expires <= now.timestamp() {
            tracing::debug!(account_id = %account_id, "Expired bearer token");
            return Err(BillingError::Unauthenticated);
        }
        Ok(account_id.to_string())
    }
}

/// Extract the raw bearer token from request headers
pub fn bearer_token(headers: &HeaderMap) -> Option<&str> {
    headers
        .get(AUTHORIZATION)?
        .to_str()
        .ok()?
        .strip_prefix("Bearer ")
        .map(str::trim)
        .filter(|t| !t.is_empty())
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Duration;

    #[test]
    fn test_issued_token_verifies() {
        let identity = HmacIdentity::new("secret");
        let now = Utc::now();
        let token = identity.issue("acct_1", now + Duration::hours(1)).unwrap();
        assert_eq!(identity.verify(&token, now).unwrap(), "acct_1");
    }

    #[test]
    fn test_rejects_expired_tampered_and_foreign_tokens() {
        let identity = HmacIdentity::new("secret");
        let now = Utc::now();

        let expired = identity.issue("acct_1", now - Duration::seconds(1)).unwrap();
        assert!(matches!(identity.verify(&expired, now), Err(BillingError::Unauthenticated)));

        let token = identity.issue("acct_1", now + Duration::hours(1)).unwrap();
        let tampered = token.replacen("acct_1", "acct_2", 1);
        assert!(identity.verify(&tampered, now).is_err());

        let foreign = HmacIdentity::new("other").issue("acct_1", now + Duration::hours(1)).unwrap();
        assert!(identity.verify(&foreign, now).is_err());

        assert!(identity.verify("garbage", now).is_err());
        assert!(identity.verify("a.b.c", now).is_err());
    }

    #[test]
    fn test_bearer_extraction() {
        let mut headers = HeaderMap::new();
        assert!(bearer_token(&headers).is_none());

        headers.insert(AUTHORIZATION, "Bearer abc.1.ff".parse().unwrap());
        assert_eq!(bearer_token(&headers), Some("abc.1.ff"));

        headers.insert(AUTHORIZATION, "Basic xyz".parse().unwrap());
        assert!(bearer_token(&headers).is_none());
    }
}
