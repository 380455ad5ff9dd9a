//! Provisioning of the single key a [`KeyVault`] is responsible for.

use std::sync::Arc;
use tracing::{debug, info, instrument};

use crate::error::Result;
use crate::keystore::{KeyAlias, KeyStoreProvider};
use crate::policy::{KeyDescriptor, KeyPolicy};

/// Opaque reference to a provisioned key. Carries no key material.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct KeyHandle {
    alias: KeyAlias,
}

impl KeyHandle {
    pub fn alias(&self) -> KeyAlias {
        self.alias
    }
}

/// Owns one key identity inside a [`KeyStoreProvider`].
///
/// Every vault mints a new alias, so keys are not shared between vault
/// instances unless an application persists the alias itself and hands it
/// back through [`KeyVault::with_alias`].
pub struct KeyVault {
    alias: KeyAlias,
    provider: Arc<dyn KeyStoreProvider>,
}

impl KeyVault {
    pub fn new(provider: Arc<dyn KeyStoreProvider>) -> Self {
        Self::with_alias(provider, KeyAlias::generate())
    }

    pub fn with_alias(provider: Arc<dyn KeyStoreProvider>, alias: KeyAlias) -> Self {
        Self { alias, provider }
    }

    pub fn alias(&self) -> KeyAlias {
        self.alias
    }

    pub fn provider(&self) -> &Arc<dyn KeyStoreProvider> {
        &self.provider
    }

    /// Returns a handle to the vault's key, generating it under `policy` if
    /// the store does not hold it yet.
    ///
    /// An existing key keeps the policy it was created with.
    #[instrument(level = "debug", skip(self, policy), fields(alias = %self.alias))]
    pub fn provision(&self, policy: &KeyPolicy) -> Result<KeyHandle> {
        if self.provider.contains(&self.alias)? {
            debug!("key already provisioned");
        } else {
            self.provider.generate(&self.alias, policy)?;
        }
        Ok(KeyHandle { alias: self.alias })
    }

    /// Reports the authorization requirements of a provisioned key.
    pub fn describe(&self, handle: &KeyHandle) -> Result<KeyDescriptor> {
        let policy = self.provider.policy(&handle.alias)?;
        Ok(KeyDescriptor::from_policy(handle.alias, &policy))
    }

    /// Replaces the vault's key with a new one under `policy`.
    ///
    /// The old key is deleted, so envelopes sealed with it can no longer be
    /// opened.
    #[instrument(level = "debug", skip(self, policy), fields(old = %self.alias))]
    pub fn rotate(&mut self, policy: &KeyPolicy) -> Result<KeyHandle> {
        policy.validate()?;
        self.provider.delete(&self.alias)?;
        self.alias = KeyAlias::generate();
        info!(new = %self.alias, "Rotated vault key");
        self.provision(policy)
    }

    /// Deletes the vault's key from the store.
    pub fn retire(&self) -> Result<()> {
        self.provider.delete(&self.alias)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::Error;
    use crate::kv::SledKeyStore;
    use crate::policy::Authenticators;
    use std::time::Duration;

    fn vault() -> KeyVault {
        KeyVault::new(Arc::new(SledKeyStore::temporary().unwrap()))
    }

    #[test]
    fn provision_is_idempotent() {
        let vault = vault();
        let policy = KeyPolicy::per_use(Authenticators::BIOMETRIC_STRONG).unwrap();
        let first = vault.provision(&policy).unwrap();
        // A second call with another policy does not touch the key.
        let second = vault.provision(&KeyPolicy::unrestricted()).unwrap();
        assert_eq!(first, second);

        let descriptor = vault.describe(&first).unwrap();
        assert!(descriptor.authorization_required);
        assert_eq!(descriptor.authenticators, Authenticators::BIOMETRIC_STRONG);
        assert_eq!(descriptor.validity, Duration::ZERO);
    }

    #[test]
    fn vaults_never_share_identity() {
        let provider: Arc<dyn KeyStoreProvider> = Arc::new(SledKeyStore::temporary().unwrap());
        let a = KeyVault::new(provider.clone());
        let b = KeyVault::new(provider);
        assert_ne!(a.alias(), b.alias());
    }

    #[test]
    fn describe_stale_handle() {
        let vault = vault();
        let handle = vault.provision(&KeyPolicy::unrestricted()).unwrap();
        vault.provider().delete(&handle.alias()).unwrap();
        assert!(matches!(
            vault.describe(&handle),
            Err(Error::KeyNotFound(alias)) if alias == handle.alias()
        ));
    }

    #[test]
    fn rotate_mints_new_identity() {
        let mut vault = vault();
        let old = vault.provision(&KeyPolicy::unrestricted()).unwrap();
        let policy =
            KeyPolicy::timed(Duration::from_secs(5), Authenticators::DEVICE_CREDENTIAL).unwrap();
        let new = vault.rotate(&policy).unwrap();

        assert_ne!(old.alias(), new.alias());
        assert!(!vault.provider().contains(&old.alias()).unwrap());
        assert_eq!(vault.describe(&new).unwrap().validity, Duration::from_secs(5));
        assert!(matches!(vault.describe(&old), Err(Error::KeyNotFound(_))));
    }

    #[test]
    fn rotate_rejects_invalid_policy_without_deleting() {
        let mut vault = vault();
        let handle = vault.provision(&KeyPolicy::unrestricted()).unwrap();
        let invalid: KeyPolicy = serde_json::from_str(r#"{"authorization_required": true}"#).unwrap();
        assert!(matches!(vault.rotate(&invalid), Err(Error::InvalidPolicy(_))));
        assert!(vault.provider().contains(&handle.alias()).unwrap());
    }

    #[test]
    fn retire_deletes_key() {
        let vault = vault();
        let handle = vault.provision(&KeyPolicy::unrestricted()).unwrap();
        vault.retire().unwrap();
        assert!(matches!(vault.describe(&handle), Err(Error::KeyNotFound(_))));
    }
}
