//! Service configuration.

use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use std::time::Duration;

use crate::broker::PromptInfo;
use crate::crypt::MasterKey;
use crate::error::Result;
use crate::keystore::KeyAlias;
use crate::kv::{KvStore, SledKeyStore};
use crate::policy::KeyPolicy;

/// Settings for a [`crate::CryptoService`].
///
/// Every field has a default, so an empty document is a valid config:
/// a per-use strong-biometric key, no timeout, an in-memory store and a
/// fresh key alias on every start.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ServiceConfig {
    /// Policy for the key when it is first generated.
    pub policy: KeyPolicy,
    pub prompt: PromptInfo,
    /// How long to wait for an authorization ceremony. Unset waits forever.
    pub authorization_timeout_secs: Option<u64>,
    /// Directory of the sled database. Unset keeps keys in memory.
    pub store_path: Option<PathBuf>,
    /// Reuse a key created by an earlier run instead of minting a new one.
    pub key_alias: Option<KeyAlias>,
}

impl ServiceConfig {
    pub fn authorization_timeout(&self) -> Option<Duration> {
        self.authorization_timeout_secs.map(Duration::from_secs)
    }

    /// Opens the configured key store under `master`.
    pub fn open_store(&self, master: MasterKey) -> Result<SledKeyStore> {
        let kv = match &self.store_path {
            Some(path) => KvStore::open(path)?,
            None => KvStore::temporary()?,
        };
        Ok(SledKeyStore::new(kv, master))
    }

    /// Opens the configured key store with a TPM-sealed master key.
    #[cfg(feature = "tpm")]
    pub fn open_sealed_store(&self) -> Result<SledKeyStore> {
        let path = self.store_path.as_ref().ok_or_else(|| {
            crate::Error::KeyStoreUnavailable("a sealed store needs a store_path".into())
        })?;
        SledKeyStore::open_sealed(path, &crate::tpm::default_tcti())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::policy::Authenticators;

    #[test]
    fn empty_document_uses_defaults() {
        let config: ServiceConfig = serde_json::from_str("{}").unwrap();
        assert_eq!(config, ServiceConfig::default());
        assert!(config.policy.is_per_use());
        assert_eq!(config.authorization_timeout(), None);
    }

    #[test]
    fn full_document() {
        let alias = KeyAlias::generate();
        let config: ServiceConfig = serde_json::from_str(&format!(
            r#"{{
                "policy": {{"authorization_required": true, "validity_secs": 30, "authenticators": 32783}},
                "prompt": {{"title": "Unlock notes"}},
                "authorization_timeout_secs": 45,
                "store_path": "/var/lib/keygate",
                "key_alias": "{alias}"
            }}"#
        ))
        .unwrap();

        assert_eq!(
            config.policy.authenticators(),
            Authenticators::BIOMETRIC_STRONG | Authenticators::DEVICE_CREDENTIAL
        );
        assert_eq!(config.prompt.title, "Unlock notes");
        assert_eq!(config.prompt.subtitle, None);
        assert_eq!(config.authorization_timeout(), Some(Duration::from_secs(45)));
        assert_eq!(config.key_alias, Some(alias));
    }

    #[test]
    fn store_path_opens_on_disk() {
        let dir = tempfile::tempdir().unwrap();
        let config = ServiceConfig {
            store_path: Some(dir.path().join("keys")),
            ..ServiceConfig::default()
        };
        config.open_store(MasterKey::generate()).unwrap();
        assert!(dir.path().join("keys").exists());
    }
}
