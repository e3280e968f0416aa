//! Bearer token verification.
//!
//! Tokens are HS256 JWTs whose claims carry `roles`, `issuedAt` and
//! `lastAccess` (milliseconds since the epoch) plus arbitrary extra claims.
//! A token is accepted when it decodes, carries every required role, was
//! last used within the configured lifetime, and every authenticator in the
//! chain agrees.

use std::fmt;
use std::sync::Arc;
use std::time::{Duration, SystemTime, UNIX_EPOCH};

use async_trait::async_trait;
use jsonwebtoken::{Algorithm, DecodingKey, EncodingKey, Header, Validation};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

use crate::error::RequestError;

/// Decoded token claims.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AuthenticationToken {
    #[serde(default)]
    pub roles: Vec<String>,
    #[serde(rename = "issuedAt")]
    pub issued_at: i64,
    #[serde(rename = "lastAccess")]
    pub last_access: i64,
    #[serde(flatten)]
    pub extra: Map<String, Value>,
}

impl AuthenticationToken {
    /// A fresh token issued now.
    pub fn issue(roles: Vec<String>) -> Self {
        let now = now_millis();
        Self {
            roles,
            issued_at: now,
            last_access: now,
            extra: Map::new(),
        }
    }

    pub fn with_claim(mut self, name: impl Into<String>, value: Value) -> Self {
        self.extra.insert(name.into(), value);
        self
    }

    /// True when every role in `required` is present.
    pub fn has_roles(&self, required: &[String]) -> bool {
        required.iter().all(|role| self.roles.contains(role))
    }
}

/// A verified token together with its encoded form.
#[derive(Debug, Clone, PartialEq)]
pub struct Authentication {
    pub token: AuthenticationToken,
    pub encoded: String,
}

/// One link of the authenticator chain.
///
/// Authenticators may annotate `payload` for later stages. Returning
/// `false` rejects the request.
#[async_trait]
pub trait Authenticator: Send + Sync {
    async fn authenticate(&self, token: &AuthenticationToken, payload: &mut Value) -> bool;
}

#[async_trait]
impl<F> Authenticator for F
where
    F: Fn(&AuthenticationToken, &mut Value) -> bool + Send + Sync,
{
    async fn authenticate(&self, token: &AuthenticationToken, payload: &mut Value) -> bool {
        (self)(token, payload)
    }
}

/// Per-route authentication requirements.
#[derive(Clone, Default)]
pub struct AuthenticationOptions {
    pub authenticators: Vec<Arc<dyn Authenticator>>,
    pub roles: Vec<String>,
    /// Refresh `lastAccess` and re-sign the token on success.
    pub renew_token: bool,
}

impl AuthenticationOptions {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn authenticator(mut self, authenticator: impl Authenticator + 'static) -> Self {
        self.authenticators.push(Arc::new(authenticator));
        self
    }

    pub fn roles<I, S>(mut self, roles: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.roles = roles.into_iter().map(Into::into).collect();
        self
    }

    pub fn renew_token(mut self, renew: bool) -> Self {
        self.renew_token = renew;
        self
    }
}

impl fmt::Debug for AuthenticationOptions {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("AuthenticationOptions")
            .field("authenticators", &self.authenticators.len())
            .field("roles", &self.roles)
            .field("renew_token", &self.renew_token)
            .finish()
    }
}

/// Signs and verifies tokens with a shared secret.
#[derive(Clone)]
pub struct AuthVerifier {
    encoding: EncodingKey,
    decoding: DecodingKey,
    validation: Validation,
    token_lifetime: Duration,
}

impl fmt::Debug for AuthVerifier {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("AuthVerifier")
            .field("token_lifetime", &self.token_lifetime)
            .finish_non_exhaustive()
    }
}

impl AuthVerifier {
    pub fn new(secret: &str, token_lifetime: Duration) -> Self {
        let mut validation = Validation::new(Algorithm::HS256);
        // Lifetime is governed by `lastAccess`, not registered claims.
        validation.required_spec_claims.clear();
        validation.validate_exp = false;

        Self {
            encoding: EncodingKey::from_secret(secret.as_bytes()),
            decoding: DecodingKey::from_secret(secret.as_bytes()),
            validation,
            token_lifetime,
        }
    }

    pub fn token_lifetime(&self) -> Duration {
        self.token_lifetime
    }

    pub fn sign(&self, token: &AuthenticationToken) -> Result<String, RequestError> {
        jsonwebtoken::encode(&Header::new(Algorithm::HS256), token, &self.encoding).map_err(|e| {
            tracing::error!(error = %e, "Failed to sign token");
            RequestError::internal("failed to sign token")
        })
    }

    /// Decode and check the signature. Any failure is `Unauthorized`.
    pub fn decode(&self, encoded: &str) -> Result<AuthenticationToken, RequestError> {
        let data = jsonwebtoken::decode::<AuthenticationToken>(encoded, &self.decoding, &self.validation)
            .map_err(|e| {
                tracing::debug!(error = %e, "Token rejected");
                RequestError::unauthorized("unauthorized")
            })?;

        let token = data.claims;
        if token.issued_at <= 0 || token.last_access <= 0 {
            tracing::debug!("Token missing issuedAt or lastAccess");
            return Err(RequestError::unauthorized("unauthorized"));
        }
        Ok(token)
    }

    /// True while `lastAccess + lifetime` is in the future.
    pub fn is_token_time_valid(&self, token: &AuthenticationToken) -> bool {
        let lifetime = i64::try_from(self.token_lifetime.as_millis()).unwrap_or(i64::MAX);
        token.last_access.saturating_add(lifetime) > now_millis()
    }

    /// Run the full check for one request.
    ///
    /// `authorization` is the raw header (or RPC token) value.
    pub async fn verify(
        &self,
        options: &AuthenticationOptions,
        authorization: Option<&str>,
        payload: &mut Value,
    ) -> Result<Authentication, RequestError> {
        let encoded = authorization
            .and_then(extract_token)
            .ok_or_else(|| RequestError::unauthorized("unauthorized"))?;
        let mut token = self.decode(encoded)?;

        if !token.has_roles(&options.roles) {
            return Err(RequestError::forbidden("forbidden"));
        }
        if !self.is_token_time_valid(&token) {
            return Err(RequestError::unauthorized("reauthentication required"));
        }

        for authenticator in &options.authenticators {
            if !authenticator.authenticate(&token, payload).await {
                return Err(RequestError::unauthorized("authentication failed"));
            }
        }

        let encoded = if options.renew_token {
            token.last_access = now_millis();
            self.sign(&token)?
        } else {
            encoded.to_string()
        };

        Ok(Authentication { token, encoded })
    }
}

/// Pull the token out of `Bearer <token>`; a bare token is returned as-is.
pub fn extract_token(raw: &str) -> Option<&str> {
    let raw = raw.trim();
    let token = match raw.split_once(char::is_whitespace) {
        Some((_scheme, rest)) => rest.trim(),
        None if raw.eq_ignore_ascii_case("bearer") => "",
        None => raw,
    };
    (!token.is_empty()).then_some(token)
}

fn now_millis() -> i64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_millis() as i64)
        .unwrap_or_default()
}
