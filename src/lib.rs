//! Authorization-gated AES-256-GCM encryption.
//!
//! A [`KeyVault`] provisions a key inside a [`KeyStoreProvider`]. Every
//! encrypt or decrypt runs as a [`PendingCipher`] that, when the key's policy
//! demands a fresh proof of presence, suspends on the
//! [`AuthorizationBroker`] until the registered [`Presenter`] finishes its
//! ceremony. [`CryptoService`] ties the pieces together.

pub mod broker;
pub mod config;
pub mod crypt;
pub mod envelope;
pub mod error;
pub mod keystore;
pub mod kv;
pub mod policy;
pub mod service;
pub mod session;
#[cfg(feature = "tpm")]
pub mod tpm;
pub mod vault;

pub use broker::{
    AuthorizationBroker, AuthorizationOutcome, AuthorizationReply, AuthorizationRequest,
    Availability, Presenter, PromptInfo,
};
pub use config::ServiceConfig;
pub use crypt::MasterKey;
pub use error::{Error, Result};
pub use keystore::{AuthToken, Binding, CryptoContext, Direction, KeyAlias, KeyStoreProvider};
pub use kv::SledKeyStore;
pub use policy::{AuthenticatorKind, Authenticators, KeyDescriptor, KeyPolicy};
pub use service::CryptoService;
pub use session::{CipherSession, PendingCipher, SessionState};
pub use vault::{KeyHandle, KeyVault};
