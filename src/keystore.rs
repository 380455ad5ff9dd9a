//! The boundary to the secure key store.
//!
//! A [`KeyStoreProvider`] owns key material and hands out keyed
//! [`CryptoContext`]s. Key bytes never cross this boundary: callers only see
//! aliases, policies and contexts.

use aes_gcm::{
    Aes256Gcm,
    aead::{Aead, KeyInit},
};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;
use std::time::Instant;
use tracing::debug;
use uuid::Uuid;

use crate::envelope::Nonce;
use crate::error::{Error, Result};
use crate::policy::{AuthenticatorKind, KeyPolicy};

/// Identity of one key inside the store.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct KeyAlias(Uuid);

impl KeyAlias {
    /// Mints a new random alias.
    pub fn generate() -> Self {
        Self(Uuid::new_v4())
    }

    pub fn as_bytes(&self) -> &[u8; 16] {
        self.0.as_bytes()
    }
}

impl fmt::Display for KeyAlias {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Display::fmt(&self.0.hyphenated(), f)
    }
}

impl FromStr for KeyAlias {
    type Err = uuid::Error;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        Uuid::parse_str(s).map(Self)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Direction {
    Encrypt,
    Decrypt,
}

/// A live AES-256-GCM instance bound to one key, one direction and one
/// nonce.
///
/// Each context carries a random challenge so that a per-use proof can be
/// tied to exactly this operation. A context is consumed by its transform.
pub struct CryptoContext {
    alias: KeyAlias,
    direction: Direction,
    nonce: Nonce,
    challenge: u64,
    cipher: Aes256Gcm,
    authorized: bool,
}

impl CryptoContext {
    /// Keys a new context. `authorized` says whether it may be used right
    /// away or still waits for a proof.
    pub fn new(
        alias: KeyAlias,
        direction: Direction,
        nonce: Nonce,
        key_material: &[u8],
        authorized: bool,
    ) -> Result<Self> {
        let cipher = Aes256Gcm::new_from_slice(key_material)
            .map_err(|_| Error::KeyStoreUnavailable(format!("key {alias} has the wrong length")))?;
        Ok(Self {
            alias,
            direction,
            nonce,
            challenge: rand::random(),
            cipher,
            authorized,
        })
    }

    pub fn alias(&self) -> KeyAlias {
        self.alias
    }

    pub fn direction(&self) -> Direction {
        self.direction
    }

    pub fn nonce(&self) -> &Nonce {
        &self.nonce
    }

    pub fn challenge(&self) -> u64 {
        self.challenge
    }

    pub fn is_authorized(&self) -> bool {
        self.authorized
    }

    /// Unlocks the context once its provider has accepted a proof.
    pub fn mark_authorized(&mut self) {
        self.authorized = true;
    }

    /// Runs the cipher over `data`, consuming the context.
    pub(crate) fn apply(self, data: &[u8]) -> Result<Vec<u8>> {
        if !self.authorized {
            return Err(Error::authorization(
                crate::broker::ERROR_CANCELED,
                "cipher context used before authorization",
            ));
        }
        debug!(alias = %self.alias, direction = ?self.direction, "applying cipher transform");
        let nonce = aes_gcm::Nonce::from_slice(&self.nonce);
        match self.direction {
            Direction::Encrypt => self
                .cipher
                .encrypt(nonce, data)
                .map_err(|_| Error::KeyStoreUnavailable("AES-GCM encryption failed".into())),
            Direction::Decrypt => self
                .cipher
                .decrypt(nonce, data)
                .map_err(|_| Error::IntegrityCheckFailed),
        }
    }
}

impl fmt::Debug for CryptoContext {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CryptoContext")
            .field("alias", &self.alias)
            .field("direction", &self.direction)
            .field("challenge", &self.challenge)
            .field("authorized", &self.authorized)
            .finish_non_exhaustive()
    }
}

/// Outcome of binding a context to a key.
#[derive(Debug)]
pub enum Binding {
    /// The context can be used immediately.
    Ready(CryptoContext),
    /// A proof of presence is needed first. Per-use keys hand back the
    /// context the proof must be bound to; keys whose validity window has
    /// lapsed hand back nothing, and a new context is built after the proof.
    NeedsAuthorization(Option<CryptoContext>),
}

/// Proof that a user authenticated, as reported by a presenter.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct AuthToken {
    authenticator: AuthenticatorKind,
    challenge: Option<u64>,
    issued_at: Instant,
}

impl AuthToken {
    pub fn new(authenticator: AuthenticatorKind, challenge: Option<u64>) -> Self {
        Self {
            authenticator,
            challenge,
            issued_at: Instant::now(),
        }
    }

    pub fn authenticator(&self) -> AuthenticatorKind {
        self.authenticator
    }

    pub fn challenge(&self) -> Option<u64> {
        self.challenge
    }

    pub fn issued_at(&self) -> Instant {
        self.issued_at
    }
}

/// A hardware-isolated (or hardware-sealed) symmetric key store.
pub trait KeyStoreProvider: Send + Sync {
    fn contains(&self, alias: &KeyAlias) -> Result<bool>;

    /// Generates a new key under `policy`. Overwriting is not allowed.
    fn generate(&self, alias: &KeyAlias, policy: &KeyPolicy) -> Result<()>;

    /// Policy the key was created with. [`Error::KeyNotFound`] if it is gone.
    fn policy(&self, alias: &KeyAlias) -> Result<KeyPolicy>;

    fn delete(&self, alias: &KeyAlias) -> Result<()>;

    /// Builds a context for one operation. Encryption passes `None` and the
    /// store chooses a random nonce.
    fn init_context(
        &self,
        alias: &KeyAlias,
        direction: Direction,
        nonce: Option<Nonce>,
    ) -> Result<Binding>;

    /// Applies a proof. `context` is the one handed out by
    /// [`KeyStoreProvider::init_context`], if any. Returns the context to
    /// resume with, which may be a freshly built one.
    fn apply_authorization(
        &self,
        alias: &KeyAlias,
        direction: Direction,
        nonce: Option<Nonce>,
        context: Option<CryptoContext>,
        token: &AuthToken,
    ) -> Result<Binding>;
}
