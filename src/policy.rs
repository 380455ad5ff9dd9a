//! Key policies and the authenticator classes that can satisfy them.

use bincode::{Decode, Encode};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::ops::BitOr;
use std::time::Duration;

use crate::error::{Error, Result};
use crate::keystore::KeyAlias;

/// AES key size. Every key in the store is AES-256.
pub const KEY_SIZE_BITS: usize = 256;
/// GCM authentication tag length.
pub const TAG_LENGTH_BITS: usize = 128;

/// Bitmask of authenticator classes, using the platform's numbering.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize, Encode, Decode,
)]
#[serde(from = "u16", into = "u16")]
pub struct Authenticators(u16);

impl Authenticators {
    pub const NONE: Self = Self(0);
    /// Class 3 biometrics (fingerprint, face with a secure sensor).
    pub const BIOMETRIC_STRONG: Self = Self(0x000F);
    /// PIN, pattern or password.
    pub const DEVICE_CREDENTIAL: Self = Self(0x8000);

    pub const fn from_bits(bits: u16) -> Self {
        Self(bits & (Self::BIOMETRIC_STRONG.0 | Self::DEVICE_CREDENTIAL.0))
    }

    pub const fn bits(self) -> u16 {
        self.0
    }

    pub const fn is_empty(self) -> bool {
        self.0 == 0
    }

    pub const fn contains(self, other: Self) -> bool {
        other.0 != 0 && self.0 & other.0 == other.0
    }

    /// Whether a proof produced by `kind` satisfies this set.
    pub fn accepts(self, kind: AuthenticatorKind) -> bool {
        self.contains(kind.flag())
    }

    /// The individual kinds present in this set.
    pub fn kinds(self) -> impl Iterator<Item = AuthenticatorKind> {
        [
            AuthenticatorKind::StrongBiometric,
            AuthenticatorKind::DeviceCredential,
        ]
        .into_iter()
        .filter(move |kind| self.accepts(*kind))
    }
}

impl From<u16> for Authenticators {
    fn from(bits: u16) -> Self {
        Self::from_bits(bits)
    }
}

impl From<Authenticators> for u16 {
    fn from(set: Authenticators) -> Self {
        set.0
    }
}

impl BitOr for Authenticators {
    type Output = Self;

    fn bitor(self, rhs: Self) -> Self {
        Self(self.0 | rhs.0)
    }
}

impl fmt::Display for Authenticators {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let names: Vec<_> = self.kinds().map(|k| k.to_string()).collect();
        if names.is_empty() {
            f.write_str("none")
        } else {
            f.write_str(&names.join("|"))
        }
    }
}

/// The authenticator that actually produced a proof.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Encode, Decode)]
pub enum AuthenticatorKind {
    StrongBiometric,
    DeviceCredential,
}

impl AuthenticatorKind {
    pub const fn flag(self) -> Authenticators {
        match self {
            Self::StrongBiometric => Authenticators::BIOMETRIC_STRONG,
            Self::DeviceCredential => Authenticators::DEVICE_CREDENTIAL,
        }
    }
}

impl fmt::Display for AuthenticatorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::StrongBiometric => f.write_str("strong-biometric"),
            Self::DeviceCredential => f.write_str("device-credential"),
        }
    }
}

/// Configuration attached to a key when it is generated.
///
/// A policy is never changed on an existing key. To move a key to a new
/// policy the vault deletes it and generates a replacement under a fresh
/// alias, see [`crate::KeyVault::rotate`].
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, Encode, Decode)]
pub struct KeyPolicy {
    #[serde(default)]
    authorization_required: bool,
    /// Seconds a proof stays valid. Zero requires a proof bound to each
    /// individual operation.
    #[serde(default)]
    validity_secs: u64,
    #[serde(default)]
    authenticators: Authenticators,
}

impl KeyPolicy {
    /// A key usable without any proof of presence.
    pub fn unrestricted() -> Self {
        Self {
            authorization_required: false,
            validity_secs: 0,
            authenticators: Authenticators::NONE,
        }
    }

    /// A key that needs a proof bound to every single operation.
    pub fn per_use(authenticators: Authenticators) -> Result<Self> {
        Self::new(true, Duration::ZERO, authenticators)
    }

    /// A key that can be used for `validity` after any accepted proof.
    pub fn timed(validity: Duration, authenticators: Authenticators) -> Result<Self> {
        Self::new(true, validity, authenticators)
    }

    pub fn new(
        authorization_required: bool,
        validity: Duration,
        authenticators: Authenticators,
    ) -> Result<Self> {
        if validity > Duration::ZERO && validity < Duration::from_secs(1) {
            return Err(Error::InvalidPolicy(format!(
                "validity of {validity:?} is shorter than one second; use a per-use policy instead"
            )));
        }
        let policy = Self {
            authorization_required,
            validity_secs: validity.as_secs(),
            authenticators,
        };
        policy.validate()?;
        Ok(policy)
    }

    /// Checks a policy that may have come from configuration.
    pub fn validate(&self) -> Result<()> {
        // Decoded records bypass the masking in `from_bits`, so check the
        // kinds rather than the raw bits.
        if self.authorization_required && self.authenticators.kinds().next().is_none() {
            return Err(Error::InvalidPolicy(
                "authorization is required but no authenticator is accepted".into(),
            ));
        }
        Ok(())
    }

    pub fn authorization_required(&self) -> bool {
        self.authorization_required
    }

    pub fn validity(&self) -> Duration {
        Duration::from_secs(self.validity_secs)
    }

    /// True when every operation needs its own bound proof.
    pub fn is_per_use(&self) -> bool {
        self.authorization_required && self.validity_secs == 0
    }

    pub fn authenticators(&self) -> Authenticators {
        self.authenticators
    }
}

impl Default for KeyPolicy {
    fn default() -> Self {
        Self {
            authorization_required: true,
            validity_secs: 0,
            authenticators: Authenticators::BIOMETRIC_STRONG,
        }
    }
}

/// What a caller may learn about a provisioned key.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct KeyDescriptor {
    pub alias: KeyAlias,
    pub authorization_required: bool,
    pub authenticators: Authenticators,
    pub validity: Duration,
}

impl KeyDescriptor {
    pub(crate) fn from_policy(alias: KeyAlias, policy: &KeyPolicy) -> Self {
        Self {
            alias,
            authorization_required: policy.authorization_required(),
            authenticators: policy.authenticators(),
            validity: policy.validity(),
        }
    }
}
