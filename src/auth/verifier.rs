/**
 * Bearer Token Verification
 *
 * Two modes, picked at startup:
 *
 * 1. **Local verify** - when `JWT_SECRET` is configured, tokens are
 *    HMAC-SHA256 JWTs verified in-process. Any other algorithm, a bad
 *    signature or an elapsed `exp` rejects the token.
 * 2. **Remote introspect** - otherwise the identity service is asked
 *    via `GET /api/v1/users/me` with the token as a bearer header.
 *
 * Successful decisions are cached in an LRU map keyed by the raw token,
 * for `min(remaining token lifetime, 60s)`. Expired entries are purged
 * on each lookup. Revoked tokens are rejected before any cache or
 * verify work.
 */

use chrono::{DateTime, TimeZone, Utc};
use jsonwebtoken::{decode, errors::ErrorKind, Algorithm, DecodingKey, Validation};
use lru::LruCache;
use serde::Deserialize;
use std::collections::HashSet;
use std::num::NonZeroUsize;
use std::sync::{Mutex, RwLock};
use std::time::Duration;
use uuid::Uuid;

use crate::error::ServiceError;

/// How long a verification decision may be reused, in seconds.
const CACHE_TTL_SECS: i64 = 60;

fn cache_ttl() -> chrono::Duration {
    chrono::Duration::seconds(CACHE_TTL_SECS)
}

/// Default ceiling for the decision cache.
pub const DEFAULT_CACHE_CAPACITY: usize = 10_000;

/// Identity attached to an admitted session.
#[derive(Debug, Clone)]
pub struct AuthClaims {
    pub user_id: Uuid,
    pub username: String,
    pub email: String,
    pub expires_at: DateTime<Utc>,
}

/// Claim shape minted by the identity service (HS256).
#[derive(Debug, Deserialize)]
struct JwtClaims {
    user_id: Uuid,
    #[serde(default)]
    username: Option<String>,
    #[serde(default)]
    email: Option<String>,
    exp: i64,
}

/// Response of `GET /api/v1/users/me`.
#[derive(Debug, Deserialize)]
struct MeResponse {
    id: Uuid,
    username: String,
    email: String,
}

struct CacheEntry {
    claims: AuthClaims,
    cache_until: DateTime<Utc>,
}

/// Process-wide token verifier.
pub struct AuthVerifier {
    secret: Option<String>,
    auth_service_url: String,
    http: reqwest::Client,
    cache: Mutex<LruCache<String, CacheEntry>>,
    revoked: RwLock<HashSet<String>>,
}

impl AuthVerifier {
    /// Create a verifier. Local HMAC mode when `secret` is set, remote
    /// introspection against `auth_service_url` otherwise.
    pub fn new(secret: Option<String>, auth_service_url: String, cache_capacity: usize) -> Self {
        let capacity = NonZeroUsize::new(cache_capacity)
            .unwrap_or_else(|| NonZeroUsize::new(DEFAULT_CACHE_CAPACITY).unwrap());
        let http = reqwest::Client::builder()
            .timeout(Duration::from_secs(5))
            .build()
            .unwrap_or_else(|_| reqwest::Client::new());

        Self {
            secret,
            auth_service_url,
            http,
            cache: Mutex::new(LruCache::new(capacity)),
            revoked: RwLock::new(HashSet::new()),
        }
    }

    /// True when tokens are verified in-process.
    pub fn is_local(&self) -> bool {
        self.secret.is_some()
    }

    /// Add a token to the revocation set. Takes effect at the next
    /// admission; in-flight sessions are not dropped.
    pub fn revoke(&self, token: &str) {
        self.revoked.write().unwrap().insert(token.to_string());
    }

    /// Verify a bearer token and return its claims.
    pub async fn verify(&self, token: &str) -> Result<AuthClaims, ServiceError> {
        if self.revoked.read().unwrap().contains(token) {
            return Err(ServiceError::AuthInvalid("token revoked".into()));
        }

        let now = Utc::now();
        if let Some(claims) = self.cache_lookup(token, now) {
            return Ok(claims);
        }

        let claims = match &self.secret {
            Some(secret) => self.verify_local(token, secret)?,
            None => self.introspect(token).await?,
        };

        self.cache_insert(token, &claims, now);
        Ok(claims)
    }

    /// Reachability probe for readiness checks (remote mode only).
    pub async fn probe_identity(&self) -> Result<(), ServiceError> {
        let url = format!("{}/health", self.auth_service_url);
        let response = self
            .http
            .get(&url)
            .timeout(Duration::from_secs(2))
            .send()
            .await
            .map_err(|e| ServiceError::transient(format!("identity service: {}", e)))?;
        if response.status().is_success() {
            Ok(())
        } else {
            Err(ServiceError::transient(format!(
                "identity service returned {}",
                response.status()
            )))
        }
    }

    fn verify_local(&self, token: &str, secret: &str) -> Result<AuthClaims, ServiceError> {
        let mut validation = Validation::new(Algorithm::HS256);
        validation.validate_exp = true;

        let data = decode::<JwtClaims>(
            token,
            &DecodingKey::from_secret(secret.as_bytes()),
            &validation,
        )
        .map_err(|err| match err.kind() {
            ErrorKind::ExpiredSignature => ServiceError::AuthExpired,
            other => ServiceError::AuthInvalid(format!("{:?}", other)),
        })?;

        let claims = data.claims;
        let expires_at = Utc
            .timestamp_opt(claims.exp, 0)
            .single()
            .ok_or_else(|| ServiceError::AuthInvalid("exp out of range".into()))?;

        Ok(AuthClaims {
            user_id: claims.user_id,
            username: claims.username.unwrap_or_default(),
            email: claims.email.unwrap_or_default(),
            expires_at,
        })
    }

    async fn introspect(&self, token: &str) -> Result<AuthClaims, ServiceError> {
        let url = format!("{}/api/v1/users/me", self.auth_service_url);
        let response = self
            .http
            .get(&url)
            .bearer_auth(token)
            .send()
            .await
            .map_err(|e| ServiceError::transient(format!("identity service: {}", e)))?;

        if response.status() == reqwest::StatusCode::UNAUTHORIZED {
            return Err(ServiceError::AuthInvalid(
                "identity service rejected token".into(),
            ));
        }
        if !response.status().is_success() {
            return Err(ServiceError::transient(format!(
                "identity service returned {}",
                response.status()
            )));
        }

        let me: MeResponse = response
            .json()
            .await
            .map_err(|e| ServiceError::AuthInvalid(format!("introspection payload: {}", e)))?;

        // The introspection response carries no expiry; cap at the
        // cache TTL so the decision gets re-checked.
        Ok(AuthClaims {
            user_id: me.id,
            username: me.username,
            email: me.email,
            expires_at: Utc::now() + cache_ttl(),
        })
    }

    fn cache_lookup(&self, token: &str, now: DateTime<Utc>) -> Option<AuthClaims> {
        let mut cache = self.cache.lock().unwrap();

        // Janitor pass: drop whatever has gone stale.
        let expired: Vec<String> = cache
            .iter()
            .filter(|(_, entry)| entry.cache_until <= now)
            .map(|(token, _)| token.clone())
            .collect();
        for key in expired {
            cache.pop(&key);
        }

        cache
            .get(token)
            .filter(|entry| entry.claims.expires_at > now)
            .map(|entry| entry.claims.clone())
    }

    fn cache_insert(&self, token: &str, claims: &AuthClaims, now: DateTime<Utc>) {
        let cache_until = (now + cache_ttl()).min(claims.expires_at);
        self.cache.lock().unwrap().put(
            token.to_string(),
            CacheEntry {
                claims: claims.clone(),
                cache_until,
            },
        );
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use jsonwebtoken::{encode, EncodingKey, Header};
    use serde::Serialize;

    const SECRET: &str = "test-secret";

    #[derive(Serialize)]
    struct TestClaims {
        user_id: Uuid,
        username: String,
        email: String,
        exp: i64,
    }

    fn mint(secret: &str, algorithm: Algorithm, exp: i64) -> (Uuid, String) {
        let user_id = Uuid::new_v4();
        let claims = TestClaims {
            user_id,
            username: "alice".into(),
            email: "alice@example.com".into(),
            exp,
        };
        let token = encode(
            &Header::new(algorithm),
            &claims,
            &EncodingKey::from_secret(secret.as_bytes()),
        )
        .unwrap();
        (user_id, token)
    }

    fn verifier() -> AuthVerifier {
        AuthVerifier::new(Some(SECRET.into()), "http://localhost:8081".into(), 16)
    }

    #[tokio::test]
    async fn test_local_verify_round_trip() {
        let v = verifier();
        let exp = (Utc::now() + chrono::Duration::hours(1)).timestamp();
        let (user_id, token) = mint(SECRET, Algorithm::HS256, exp);

        let claims = v.verify(&token).await.unwrap();
        assert_eq!(claims.user_id, user_id);
        assert_eq!(claims.username, "alice");
        assert_eq!(claims.email, "alice@example.com");
        assert!(claims.expires_at > Utc::now());
    }

    #[tokio::test]
    async fn test_expired_token_rejected() {
        let v = verifier();
        let exp = (Utc::now() - chrono::Duration::hours(1)).timestamp();
        let (_, token) = mint(SECRET, Algorithm::HS256, exp);

        let err = v.verify(&token).await.unwrap_err();
        assert!(matches!(err, ServiceError::AuthExpired));
    }

    #[tokio::test]
    async fn test_wrong_algorithm_rejected() {
        let v = verifier();
        let exp = (Utc::now() + chrono::Duration::hours(1)).timestamp();
        let (_, token) = mint(SECRET, Algorithm::HS384, exp);

        let err = v.verify(&token).await.unwrap_err();
        assert!(matches!(err, ServiceError::AuthInvalid(_)));
    }

    #[tokio::test]
    async fn test_bad_signature_rejected() {
        let v = verifier();
        let exp = (Utc::now() + chrono::Duration::hours(1)).timestamp();
        let (_, token) = mint("other-secret", Algorithm::HS256, exp);

        let err = v.verify(&token).await.unwrap_err();
        assert!(matches!(err, ServiceError::AuthInvalid(_)));
    }

    #[tokio::test]
    async fn test_malformed_token_rejected() {
        let v = verifier();
        let err = v.verify("not.a.jwt").await.unwrap_err();
        assert!(matches!(err, ServiceError::AuthInvalid(_)));
    }

    #[tokio::test]
    async fn test_revocation_beats_cache() {
        let v = verifier();
        let exp = (Utc::now() + chrono::Duration::hours(1)).timestamp();
        let (_, token) = mint(SECRET, Algorithm::HS256, exp);

        // Warm the cache with a valid decision, then revoke.
        v.verify(&token).await.unwrap();
        v.revoke(&token);

        let err = v.verify(&token).await.unwrap_err();
        assert!(matches!(err, ServiceError::AuthInvalid(_)));
    }

    #[tokio::test]
    async fn test_cache_serves_repeat_lookups() {
        let v = verifier();
        let exp = (Utc::now() + chrono::Duration::hours(1)).timestamp();
        let (user_id, token) = mint(SECRET, Algorithm::HS256, exp);

        let first = v.verify(&token).await.unwrap();
        let second = v.verify(&token).await.unwrap();
        assert_eq!(first.user_id, user_id);
        assert_eq!(second.user_id, user_id);
    }
}
