//! TURN relay credentials (TURN REST API, time-limited shared secret).
//!
//! ```text
//! username = "<expiry-unix>:<identity-hash>"
//! password = base64(HMAC-SHA1(shared_secret, username))
//! ```
//!
//! The TURN server holds the same shared secret and recomputes the password
//! from the username, so credentials are never stored. Revocation is not
//! possible; instead the issuer can lower the maximum TTL for future
//! credentials or rotate the secret.
//!
//! `identity-hash` is a truncated SHA-256 over the identity, the room and a
//! random nonce. The relay logs usernames, so the raw identity never appears
//! in them, and two issues for the same identity never share a username.
//!
//! Issued credentials are cached per (identity, room) for
//! `min(cache_ttl, ttl / 2)` so a client refreshing its ICE configuration gets
//! a stable answer.

use crate::errors::HubError;
use crate::observability::metrics;

use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine;
use chrono::{DateTime, Utc};
use common::secret::{ExposeSecret, SecretString};
use common::types::{MeetingId, PeerIdentity};
use ring::{digest, hmac, rand};
use serde::Serialize;
use std::collections::HashMap;
use std::fmt;
use std::sync::{Mutex, PoisonError, RwLock};
use std::time::Duration;
use tokio::time::Instant;
use tracing::{debug, info};

/// Public STUN servers offered alongside the TURN entry.
pub const STUN_SERVERS: [&str; 4] = [
    "stun:stun.l.google.com:19302",
    "stun:stun1.l.google.com:19302",
    "stun:stun2.l.google.com:19302",
    "stun:stun.microsoft.com:3478",
];

/// Hex characters of the identity hash kept in the username.
const IDENTITY_HASH_LEN: usize = 32;

/// Issuer settings.
#[derive(Clone)]
pub struct TurnSettings {
    pub shared_secret: SecretString,
    /// TURN host name or address.
    pub server: String,
    pub default_ttl: Duration,
    pub max_ttl: Duration,
    pub cache_ttl: Duration,
}

impl fmt::Debug for TurnSettings {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TurnSettings")
            .field("shared_secret", &"[REDACTED]")
            .field("server", &self.server)
            .field("default_ttl", &self.default_ttl)
            .field("max_ttl", &self.max_ttl)
            .field("cache_ttl", &self.cache_ttl)
            .finish()
    }
}

/// Time-limited TURN credential.
#[derive(Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct RelayCredential {
    pub username: String,
    pub password: String,
    /// Validity in seconds from issue time.
    pub ttl: u64,
    pub expires_at: DateTime<Utc>,
    pub urls: Vec<String>,
}

impl fmt::Debug for RelayCredential {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RelayCredential")
            .field("username", &self.username)
            .field("password", &"[REDACTED]")
            .field("ttl", &self.ttl)
            .field("expires_at", &self.expires_at)
            .field("urls", &self.urls)
            .finish()
    }
}

/// `RTCIceServer` entry.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct IceServer {
    pub urls: Vec<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub username: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub credential: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub credential_type: Option<String>,
}

struct CachedCredential {
    credential: RelayCredential,
    cached_until: Instant,
}

type CacheKey = (PeerIdentity, MeetingId);

/// Derives and caches relay credentials.
///
/// Never consults room state. Shared behind an `Arc`; all methods take `&self`.
pub struct CredentialIssuer {
    secret: RwLock<SecretString>,
    server: String,
    default_ttl: Duration,
    max_ttl: RwLock<Duration>,
    cache_ttl: Duration,
    cache: Mutex<HashMap<CacheKey, CachedCredential>>,
    rng: rand::SystemRandom,
}

impl fmt::Debug for CredentialIssuer {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CredentialIssuer")
            .field("server", &self.server)
            .field("default_ttl", &self.default_ttl)
            .field("max_ttl", &self.max_ttl())
            .finish_non_exhaustive()
    }
}

impl CredentialIssuer {
    #[must_use]
    pub fn new(settings: TurnSettings) -> Self {
        Self {
            secret: RwLock::new(settings.shared_secret),
            server: settings.server,
            default_ttl: settings.default_ttl,
            max_ttl: RwLock::new(settings.max_ttl),
            cache_ttl: settings.cache_ttl,
            cache: Mutex::new(HashMap::new()),
            rng: rand::SystemRandom::new(),
        }
    }

    /// TURN URLs for this server (UDP/TCP and TLS).
    #[must_use]
    pub fn turn_urls(&self) -> Vec<String> {
        vec![
            format!("turn:{}:3478", self.server),
            format!("turns:{}:5349", self.server),
        ]
    }

    #[must_use]
    pub fn max_ttl(&self) -> Duration {
        *self.max_ttl.read().unwrap_or_else(PoisonError::into_inner)
    }

    /// Cap the validity of credentials issued from now on.
    ///
    /// Cached credentials that outlive the new cap are dropped.
    pub fn set_max_ttl(&self, max_ttl: Duration) {
        *self.max_ttl.write().unwrap_or_else(PoisonError::into_inner) = max_ttl;
        let mut cache = self.cache.lock().unwrap_or_else(PoisonError::into_inner);
        cache.retain(|_, entry| Duration::from_secs(entry.credential.ttl) <= max_ttl);
        info!(
            target: "hub.turn",
            max_ttl_seconds = max_ttl.as_secs(),
            "TURN max TTL updated"
        );
    }

    /// Replace the shared secret and drop every cached credential.
    pub fn rotate_secret(&self, secret: SecretString) {
        *self.secret.write().unwrap_or_else(PoisonError::into_inner) = secret;
        self.cache
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clear();
        info!(target: "hub.turn", "TURN shared secret rotated");
    }

    /// Issue a credential for `identity` in `room_id`.
    ///
    /// `ttl` defaults to the configured default when absent or zero and is
    /// capped at the current maximum.
    ///
    /// # Errors
    ///
    /// Returns `HubError::Credential` if randomness or time arithmetic fails.
    pub fn issue(
        &self,
        identity: &PeerIdentity,
        room_id: MeetingId,
        ttl: Option<Duration>,
    ) -> Result<RelayCredential, HubError> {
        let ttl = self.effective_ttl(ttl);
        let key = (identity.clone(), room_id);
        let now = Instant::now();

        {
            let cache = self.cache.lock().unwrap_or_else(PoisonError::into_inner);
            if let Some(entry) = cache.get(&key) {
                if entry.cached_until > now && entry.credential.ttl == ttl.as_secs() {
                    metrics::record_turn_credential("hit");
                    return Ok(entry.credential.clone());
                }
            }
        }

        let credential = self.derive(identity, room_id, ttl)?;
        let cache_for = self.cache_ttl.min(ttl / 2);
        {
            let mut cache = self.cache.lock().unwrap_or_else(PoisonError::into_inner);
            cache.retain(|_, entry| entry.cached_until > now);
            cache.insert(
                key,
                CachedCredential {
                    credential: credential.clone(),
                    cached_until: now + cache_for,
                },
            );
        }

        metrics::record_turn_credential("miss");
        debug!(
            target: "hub.turn",
            meeting_id = %room_id,
            ttl_seconds = ttl.as_secs(),
            "Issued TURN credential"
        );
        Ok(credential)
    }

    /// STUN list plus one TURN entry carrying `credential`.
    #[must_use]
    pub fn ice_servers(&self, credential: &RelayCredential) -> Vec<IceServer> {
        let mut servers: Vec<IceServer> = STUN_SERVERS
            .iter()
            .map(|url| IceServer {
                urls: vec![(*url).to_string()],
                username: None,
                credential: None,
                credential_type: None,
            })
            .collect();
        servers.push(IceServer {
            urls: credential.urls.clone(),
            username: Some(credential.username.clone()),
            credential: Some(credential.password.clone()),
            credential_type: Some("password".to_string()),
        });
        servers
    }

    /// Check a username/password pair the way the TURN server would.
    #[must_use]
    pub fn verify(&self, username: &str, password: &str) -> bool {
        let Some((expiry, _)) = username.split_once(':') else {
            return false;
        };
        let Ok(expiry) = expiry.parse::<i64>() else {
            return false;
        };
        if expiry <= Utc::now().timestamp() {
            return false;
        }
        let Ok(provided) = BASE64.decode(password) else {
            return false;
        };

        let secret = self.secret.read().unwrap_or_else(PoisonError::into_inner);
        let key = hmac::Key::new(
            hmac::HMAC_SHA1_FOR_LEGACY_USE_ONLY,
            secret.expose_secret().as_bytes(),
        );
        hmac::verify(&key, username.as_bytes(), &provided).is_ok()
    }

    fn effective_ttl(&self, requested: Option<Duration>) -> Duration {
        let ttl = match requested {
            Some(ttl) if !ttl.is_zero() => ttl,
            _ => self.default_ttl,
        };
        let ttl = ttl.min(self.max_ttl());
        // Whole seconds; at least one.
        Duration::from_secs(ttl.as_secs().max(1))
    }

    fn derive(
        &self,
        identity: &PeerIdentity,
        room_id: MeetingId,
        ttl: Duration,
    ) -> Result<RelayCredential, HubError> {
        let validity = chrono::Duration::from_std(ttl)
            .map_err(|e| HubError::Credential(format!("TTL out of range: {e}")))?;
        let expires_at = Utc::now()
            .checked_add_signed(validity)
            .ok_or_else(|| HubError::Credential("expiry out of range".to_string()))?;

        let mut nonce = [0u8; 16];
        rand::SecureRandom::fill(&self.rng, &mut nonce)
            .map_err(|_| HubError::Credential("random nonce generation failed".to_string()))?;

        let username = format!(
            "{}:{}",
            expires_at.timestamp(),
            identity_hash(identity, room_id, &nonce)
        );

        let secret = self.secret.read().unwrap_or_else(PoisonError::into_inner);
        let key = hmac::Key::new(
            hmac::HMAC_SHA1_FOR_LEGACY_USE_ONLY,
            secret.expose_secret().as_bytes(),
        );
        let tag = hmac::sign(&key, username.as_bytes());

        Ok(RelayCredential {
            username,
            password: BASE64.encode(tag.as_ref()),
            ttl: ttl.as_secs(),
            expires_at,
            urls: self.turn_urls(),
        })
    }
}

fn identity_hash(identity: &PeerIdentity, room_id: MeetingId, nonce: &[u8]) -> String {
    let mut ctx = digest::Context::new(&digest::SHA256);
    ctx.update(identity.to_string().as_bytes());
    ctx.update(b"|");
    ctx.update(room_id.to_string().as_bytes());
    ctx.update(b"|");
    ctx.update(nonce);
    let mut hash = hex::encode(ctx.finish().as_ref());
    hash.truncate(IDENTITY_HASH_LEN);
    hash
}
