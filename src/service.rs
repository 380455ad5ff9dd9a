//! The encrypt/decrypt surface handed to UI code.

use std::sync::Arc;
use tracing::instrument;

use crate::broker::{AuthorizationBroker, PromptInfo};
use crate::config::ServiceConfig;
use crate::envelope;
use crate::error::Result;
use crate::keystore::KeyStoreProvider;
use crate::policy::KeyPolicy;
use crate::session::CipherSession;
use crate::vault::KeyVault;

/// Encrypts and decrypts with the vault's key, asking the registered
/// presenter for a proof of presence whenever the key demands one.
pub struct CryptoService {
    vault: KeyVault,
    session: CipherSession,
    broker: Arc<AuthorizationBroker>,
    policy: KeyPolicy,
}

impl CryptoService {
    pub fn new(
        vault: KeyVault,
        broker: Arc<AuthorizationBroker>,
        policy: KeyPolicy,
        prompt: PromptInfo,
    ) -> Result<Self> {
        policy.validate()?;
        let session = CipherSession::with_prompt(vault.provider().clone(), prompt);
        Ok(Self {
            vault,
            session,
            broker,
            policy,
        })
    }

    /// Builds a service, and its broker, from configuration.
    pub fn from_config(provider: Arc<dyn KeyStoreProvider>, config: &ServiceConfig) -> Result<Self> {
        let vault = match config.key_alias {
            Some(alias) => KeyVault::with_alias(provider, alias),
            None => KeyVault::new(provider),
        };
        let broker = Arc::new(AuthorizationBroker::with_timeout(
            config.authorization_timeout(),
        ));
        Self::new(vault, broker, config.policy.clone(), config.prompt.clone())
    }

    /// The broker presenters register with.
    pub fn broker(&self) -> &Arc<AuthorizationBroker> {
        &self.broker
    }

    pub fn vault(&self) -> &KeyVault {
        &self.vault
    }

    /// Encrypts `plaintext` into a `nonce || ciphertext` envelope.
    #[instrument(level = "debug", skip_all, fields(len = plaintext.len()))]
    pub async fn encrypt(&self, plaintext: &[u8]) -> Result<Vec<u8>> {
        let handle = self.vault.provision(&self.policy)?;
        let mut cipher = self.session.begin_encrypt(&handle)?;
        cipher.authorize(&self.broker).await?;
        cipher.finish(plaintext)
    }

    /// Opens an envelope produced by [`CryptoService::encrypt`].
    #[instrument(level = "debug", skip_all, fields(len = envelope.len()))]
    pub async fn decrypt(&self, envelope: &[u8]) -> Result<Vec<u8>> {
        let (nonce, ciphertext) = envelope::unpack(envelope)?;
        let handle = self.vault.provision(&self.policy)?;
        let mut cipher = self.session.begin_decrypt(&handle, &nonce)?;
        cipher.authorize(&self.broker).await?;
        cipher.finish(ciphertext)
    }
}
