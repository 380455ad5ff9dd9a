//! Error types shared by every layer of the crate.

use thiserror::Error;

use crate::keystore::KeyAlias;

/// Everything that can go wrong while provisioning a key or running a
/// cipher operation.
///
/// Only [`Error::AuthorizationFailed`] is ever worth retrying, and even then
/// the whole operation has to be started again by the caller.
#[derive(Debug, Error)]
pub enum Error {
    /// The backing key store could not be opened, read or written.
    #[error("key store unavailable: {0}")]
    KeyStoreUnavailable(String),

    /// The key behind a handle no longer exists in the store.
    #[error("key {0} not found in key store")]
    KeyNotFound(KeyAlias),

    /// An envelope or nonce did not have the expected layout.
    #[error("malformed envelope: {0}")]
    MalformedEnvelope(String),

    /// The authorization ceremony was rejected, cancelled or timed out.
    #[error("authorization failed ({code}): {message}")]
    AuthorizationFailed { code: i32, message: String },

    /// No presenter is registered to host the authorization ceremony.
    #[error("no presenter available to host the authorization ceremony")]
    NoPresenterAvailable,

    /// The GCM authentication tag did not verify.
    #[error("integrity check failed")]
    IntegrityCheckFailed,

    /// A key policy that can never be satisfied.
    #[error("invalid key policy: {0}")]
    InvalidPolicy(String),
}

impl Error {
    pub(crate) fn authorization(code: i32, message: impl Into<String>) -> Self {
        Self::AuthorizationFailed {
            code,
            message: message.into(),
        }
    }
}

impl From<sled::Error> for Error {
    fn from(e: sled::Error) -> Self {
        Self::KeyStoreUnavailable(e.to_string())
    }
}

impl From<bincode::error::EncodeError> for Error {
    fn from(e: bincode::error::EncodeError) -> Self {
        Self::KeyStoreUnavailable(format!("failed to encode key record: {e}"))
    }
}

impl From<bincode::error::DecodeError> for Error {
    fn from(e: bincode::error::DecodeError) -> Self {
        Self::KeyStoreUnavailable(format!("failed to decode key record: {e}"))
    }
}

#[cfg(feature = "tpm")]
impl From<tss_esapi::Error> for Error {
    fn from(e: tss_esapi::Error) -> Self {
        Self::KeyStoreUnavailable(format!("TPM error: {e}"))
    }
}

pub type Result<T> = std::result::Result<T, Error>;
