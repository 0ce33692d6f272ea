//! Authentication
//!
//! Validates JWTs from external auth providers (Firebase, Auth0, Supabase, etc.)
//! and, when enabled, accepts bare device logins. The server never issues
//! tokens. After a successful login the player's profile is written
//! best-effort.

use chrono::Utc;
use jsonwebtoken::{decode, DecodingKey, Validation, Algorithm, TokenData};
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::{debug, warn};

use crate::game::state::PlayerId;
use crate::network::protocol::{AuthRequest, ErrorCode};
use crate::ranking::profile::{guest_name, Profile, ProfileStore};

/// Accepted device id length, in bytes.
const DEVICE_ID_LEN: std::ops::RangeInclusive<usize> = 10..=128;

/// Longest display name kept; longer names are cut.
const MAX_NAME_LEN: usize = 32;

/// Authentication configuration.
#[derive(Clone, Debug, Default)]
pub struct AuthConfig {
    /// Expected issuer claim ("iss"). If None, any issuer accepted.
    pub issuer: Option<String>,
    /// Expected audience claim ("aud"). If None, any audience accepted.
    pub audience: Option<String>,
    /// RS256 public key in PEM format (preferred for external providers).
    pub public_key_pem: Option<String>,
    /// HS256 secret (fallback for simple setups).
    pub secret: Option<String>,
    /// Whether to skip expiry validation (for testing only).
    pub skip_expiry: bool,
    /// Accept `device_id` logins without a token.
    pub allow_device_login: bool,
}

impl AuthConfig {
    /// Create config from environment variables.
    pub fn from_env() -> Self {
        Self {
            issuer: std::env::var("AUTH_ISSUER").ok(),
            audience: std::env::var("AUTH_AUDIENCE").ok(),
            public_key_pem: std::env::var("AUTH_PUBLIC_KEY_PEM").ok(),
            secret: std::env::var("AUTH_SECRET").ok(),
            skip_expiry: env_flag("AUTH_SKIP_EXPIRY"),
            allow_device_login: env_flag("AUTH_ALLOW_DEVICE_LOGIN"),
        }
    }

    /// Check if token authentication is configured.
    pub fn is_configured(&self) -> bool {
        self.public_key_pem.is_some() || self.secret.is_some()
    }
}

fn env_flag(name: &str) -> bool {
    std::env::var(name)
        .map(|v| v == "true" || v == "1")
        .unwrap_or(false)
}

/// Standard JWT claims we expect from auth providers.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TokenClaims {
    /// Subject - usually the user ID from the auth provider.
    pub sub: String,
    /// Expiry timestamp (Unix seconds).
    #[serde(default)]
    pub exp: u64,
    /// Issued at timestamp.
    #[serde(default)]
    pub iat: u64,
    /// Issuer (auth provider).
    #[serde(default)]
    pub iss: Option<String>,
    /// Audience.
    #[serde(default)]
    pub aud: Option<serde_json::Value>,
    /// Display name, if the provider includes one.
    #[serde(default)]
    pub name: Option<String>,
}

impl TokenClaims {
    /// Stable player id for the subject claim.
    pub fn player_id(&self) -> PlayerId {
        PlayerId::from_subject(&self.sub)
    }
}

/// Authentication errors.
#[derive(Debug, Error)]
pub enum AuthError {
    /// No authentication configured on server.
    #[error("authentication not configured")]
    NotConfigured,
    /// Neither a token nor a device id was supplied.
    #[error("missing credentials")]
    MissingCredentials,
    /// Device id is empty or too long.
    #[error("invalid device id")]
    InvalidDeviceId,
    /// Token format is invalid.
    #[error("invalid token format")]
    InvalidFormat,
    /// Token signature verification failed.
    #[error("invalid signature")]
    InvalidSignature,
    /// Token has expired.
    #[error("token expired")]
    Expired,
    /// Issuer claim doesn't match expected value.
    #[error("invalid issuer")]
    InvalidIssuer,
    /// Audience claim doesn't match expected value.
    #[error("invalid audience")]
    InvalidAudience,
    /// Required claim is missing.
    #[error("missing required claim: {0}")]
    MissingClaim(String),
    /// JWT decoding error.
    #[error("decode error: {0}")]
    DecodeError(String),
}

impl AuthError {
    /// Wire code reported to the client.
    pub fn code(&self) -> ErrorCode {
        match self {
            AuthError::Expired => ErrorCode::TokenExpired,
            AuthError::InvalidFormat
            | AuthError::InvalidSignature
            | AuthError::InvalidIssuer
            | AuthError::InvalidAudience
            | AuthError::MissingClaim(_)
            | AuthError::DecodeError(_) => ErrorCode::InvalidToken,
            AuthError::NotConfigured | AuthError::MissingCredentials | AuthError::InvalidDeviceId => {
                ErrorCode::AuthFailed
            }
        }
    }
}

/// Validate a JWT token and extract claims.
pub fn validate_token(token: &str, config: &AuthConfig) -> Result<TokenClaims, AuthError> {
    if !config.is_configured() {
        return Err(AuthError::NotConfigured);
    }

    let algorithm = if config.public_key_pem.is_some() {
        Algorithm::RS256
    } else {
        Algorithm::HS256
    };

    let mut validation = Validation::new(algorithm);
    validation.required_spec_claims = std::collections::HashSet::new();

    if let Some(ref issuer) = config.issuer {
        validation.set_issuer(&[issuer]);
    }

    if let Some(ref audience) = config.audience {
        validation.set_audience(&[audience]);
    } else {
        validation.validate_aud = false;
    }

    if config.skip_expiry {
        validation.validate_exp = false;
    }

    let token_data: TokenData<TokenClaims> = if let Some(ref pem) = config.public_key_pem {
        let key = DecodingKey::from_rsa_pem(pem.as_bytes())
            .map_err(|e| AuthError::DecodeError(format!("invalid public key: {}", e)))?;
        decode(token, &key, &validation).map_err(map_jwt_error)?
    } else if let Some(ref secret) = config.secret {
        let key = DecodingKey::from_secret(secret.as_bytes());
        decode(token, &key, &validation).map_err(map_jwt_error)?
    } else {
        return Err(AuthError::NotConfigured);
    };

    let claims = token_data.claims;

    if claims.sub.is_empty() {
        return Err(AuthError::MissingClaim("sub".into()));
    }

    // jsonwebtoken allows some leeway; enforce the exact expiry too.
    if !config.skip_expiry && claims.exp > 0 {
        let now = Utc::now().timestamp().max(0) as u64;
        if now > claims.exp {
            return Err(AuthError::Expired);
        }
    }

    Ok(claims)
}

/// Map JWT library errors to our error type.
fn map_jwt_error(err: jsonwebtoken::errors::Error) -> AuthError {
    use jsonwebtoken::errors::ErrorKind;
    match err.kind() {
        ErrorKind::ExpiredSignature => AuthError::Expired,
        ErrorKind::InvalidSignature => AuthError::InvalidSignature,
        ErrorKind::InvalidIssuer => AuthError::InvalidIssuer,
        ErrorKind::InvalidAudience => AuthError::InvalidAudience,
        ErrorKind::InvalidToken | ErrorKind::Base64(_) => AuthError::InvalidFormat,
        _ => AuthError::DecodeError(err.to_string()),
    }
}

// =============================================================================
// LOGIN
// =============================================================================

/// Who logged in.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LoginIdentity {
    /// Stable player id.
    pub player_id: PlayerId,
    /// Device id for device logins.
    pub device_id: Option<String>,
    /// Name supplied by the token or the request.
    pub name_hint: Option<String>,
}

/// Resolve an auth request to a player identity.
///
/// A token always wins over a device id. Device login only works when
/// `allow_device_login` is set.
pub fn authenticate(request: &AuthRequest, config: &AuthConfig) -> Result<LoginIdentity, AuthError> {
    if let Some(token) = request.token.as_deref() {
        let claims = validate_token(token, config)?;
        return Ok(LoginIdentity {
            player_id: claims.player_id(),
            device_id: None,
            name_hint: claims.name.or_else(|| request.name.clone()),
        });
    }

    let Some(device_id) = request.device_id.as_deref() else {
        return Err(AuthError::MissingCredentials);
    };
    if !config.allow_device_login {
        return Err(AuthError::NotConfigured);
    }
    if !DEVICE_ID_LEN.contains(&device_id.len()) {
        return Err(AuthError::InvalidDeviceId);
    }

    Ok(LoginIdentity {
        player_id: PlayerId::from_subject(&format!("device:{device_id}")),
        device_id: Some(device_id.to_string()),
        name_hint: request.name.clone(),
    })
}

/// Display name for a login: the trimmed hint, else a guest name.
pub fn display_name_for(identity: &LoginIdentity) -> String {
    identity
        .name_hint
        .as_deref()
        .map(str::trim)
        .filter(|name| !name.is_empty())
        .map(|name| name.chars().take(MAX_NAME_LEN).collect())
        .unwrap_or_else(|| guest_name(&identity.player_id))
}

/// Post-login hook: write the player's profile.
///
/// Persistence is best-effort. A failing store is logged and the login
/// still succeeds with the computed profile.
pub async fn after_authenticate(profiles: &dyn ProfileStore, identity: &LoginIdentity) -> Profile {
    let now = Utc::now();
    let profile = Profile {
        id: identity.player_id,
        device_id: identity.device_id.clone(),
        name: display_name_for(identity),
        created_at: now,
        updated_at: now,
    };

    match profiles.upsert_profile(profile.clone()).await {
        Ok(stored) => {
            debug!("Profile stored for {} ({})", stored.name, stored.id.short());
            stored
        }
        Err(e) => {
            warn!("Profile upsert failed for {}: {}", profile.id.short(), e);
            profile
        }
    }
}

// =============================================================================
// TESTS
// =============================================================================
