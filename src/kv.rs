//! A [`KeyStoreProvider`] backed by an on-disk sled database.
//!
//! Key material is stored wrapped: each record is AES-GCM encrypted under a
//! key derived from the store's [`MasterKey`] and the record's alias. The
//! master key itself only lives in memory, or sealed to a TPM when the
//! `tpm` feature is enabled.

use bincode::{Decode, Encode};
use sled::Db;
use std::collections::HashMap;
use std::path::Path;
use std::sync::{Mutex, PoisonError};
use std::time::Instant;
use tracing::{debug, error, info, instrument, trace};

use crate::broker::ERROR_PROOF_REJECTED;
use crate::crypt::{self, MasterKey};
use crate::envelope::Nonce;
use crate::error::{Error, Result};
use crate::keystore::{AuthToken, Binding, CryptoContext, Direction, KeyAlias, KeyStoreProvider};
use crate::policy::{AuthenticatorKind, KeyPolicy};

// Layout of the tree:
// `keys/<alias>`         bincode-encoded `KeyRecord`
// `sealed_master_key`    TPM-sealed master key, only with the `tpm` feature

/// A thin wrapper around sled's `Db`.
#[derive(Clone)]
pub struct KvStore {
    db: Db,
}

impl KvStore {
    /// Opens (or creates) the database at `path`.
    pub fn open(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        match sled::open(path) {
            Ok(db) => Ok(Self { db }),
            Err(e) => {
                error!("Failed to open sled database at {:?}: {}", path, e);
                Err(e.into())
            }
        }
    }

    /// A database that is deleted when dropped.
    pub fn temporary() -> Result<Self> {
        let db = sled::Config::new().temporary(true).open()?;
        Ok(Self { db })
    }

    pub fn db(&self) -> &Db {
        &self.db
    }
}

#[derive(Encode, Decode, Debug, Clone)]
struct KeyRecord {
    policy: KeyPolicy,
    wrapped_key: Vec<u8>,
    iv: Nonce,
}

fn key_path(alias: &KeyAlias) -> String {
    format!("keys/{alias}")
}

/// Software key store with sealed-at-rest key material.
pub struct SledKeyStore {
    kv: KvStore,
    master: MasterKey,
    /// Most recent accepted proof per authenticator kind.
    last_proof: Mutex<HashMap<AuthenticatorKind, Instant>>,
}

impl SledKeyStore {
    pub fn new(kv: KvStore, master: MasterKey) -> Self {
        Self {
            kv,
            master,
            last_proof: Mutex::new(HashMap::new()),
        }
    }

    /// Opens a persistent store. The same master key must be supplied on
    /// every open for existing records to unwrap.
    pub fn open(path: impl AsRef<Path>, master: MasterKey) -> Result<Self> {
        Ok(Self::new(KvStore::open(path)?, master))
    }

    /// An in-memory store with a random master key. Nothing survives drop.
    pub fn temporary() -> Result<Self> {
        Ok(Self::new(KvStore::temporary()?, MasterKey::generate()))
    }

    /// Opens a persistent store whose master key is sealed to the TPM,
    /// creating and sealing one on first use.
    #[cfg(feature = "tpm")]
    pub fn open_sealed(path: impl AsRef<Path>, tcti: &tss_esapi::TctiNameConf) -> Result<Self> {
        use crate::tpm::SealedMasterKey;

        let kv = KvStore::open(path)?;
        let master = match kv.db().get(SealedMasterKey::PATH)? {
            Some(bytes) => {
                let (sealed, _): (SealedMasterKey, usize) =
                    bincode::decode_from_slice(&bytes, bincode::config::standard())?;
                debug!("Unsealing existing master key");
                sealed.unseal(tss_esapi::Context::new(tcti.clone())?)?
            }
            None => {
                info!("No sealed master key found, generating one");
                let master = MasterKey::generate();
                let sealed = SealedMasterKey::seal(&master, tss_esapi::Context::new(tcti.clone())?)?;
                let encoded = bincode::encode_to_vec(&sealed, bincode::config::standard())?;
                kv.db().insert(SealedMasterKey::PATH, encoded)?;
                kv.db().flush()?;
                master
            }
        };
        Ok(Self::new(kv, master))
    }

    fn record(&self, alias: &KeyAlias) -> Result<KeyRecord> {
        let bytes = self
            .kv
            .db()
            .get(key_path(alias))?
            .ok_or(Error::KeyNotFound(*alias))?;
        let (record, _): (KeyRecord, usize) =
            bincode::decode_from_slice(&bytes, bincode::config::standard())?;
        Ok(record)
    }

    fn context(
        &self,
        alias: &KeyAlias,
        record: &KeyRecord,
        direction: Direction,
        nonce: Option<Nonce>,
        authorized: bool,
    ) -> Result<CryptoContext> {
        let material = self
            .master
            .wrapping_key(alias.as_bytes())?
            .unwrap_material(&record.wrapped_key, &record.iv)?;
        let nonce = nonce.unwrap_or_else(crypt::random_nonce);
        CryptoContext::new(*alias, direction, nonce, &material, authorized)
    }

    /// Whether an accepted proof is still inside the policy's window.
    fn is_fresh(&self, policy: &KeyPolicy) -> bool {
        let last_proof = self.last_proof.lock().unwrap_or_else(PoisonError::into_inner);
        policy.authenticators().kinds().any(|kind| {
            last_proof
                .get(&kind)
                .is_some_and(|at| at.elapsed() <= policy.validity())
        })
    }

    fn record_proof(&self, token: &AuthToken) {
        let mut last_proof = self.last_proof.lock().unwrap_or_else(PoisonError::into_inner);
        let entry = last_proof
            .entry(token.authenticator())
            .or_insert(token.issued_at());
        if *entry < token.issued_at() {
            *entry = token.issued_at();
        }
    }
}

impl KeyStoreProvider for SledKeyStore {
    fn contains(&self, alias: &KeyAlias) -> Result<bool> {
        Ok(self.kv.db().contains_key(key_path(alias))?)
    }

    #[instrument(level = "debug", skip(self, policy), fields(alias = %alias))]
    fn generate(&self, alias: &KeyAlias, policy: &KeyPolicy) -> Result<()> {
        policy.validate()?;
        let material = crypt::generate_key_material();
        let (wrapped_key, iv) = self.master.wrapping_key(alias.as_bytes())?.wrap(&material)?;
        let record = KeyRecord {
            policy: policy.clone(),
            wrapped_key,
            iv,
        };
        let encoded = bincode::encode_to_vec(&record, bincode::config::standard())?;

        self.kv
            .db()
            .compare_and_swap(key_path(alias), None::<&[u8]>, Some(encoded))?
            .map_err(|_| Error::KeyStoreUnavailable(format!("key {alias} already exists")))?;
        self.kv.db().flush()?;
        info!(
            authorization_required = policy.authorization_required(),
            authenticators = %policy.authenticators(),
            "Generated AES-256-GCM key"
        );
        Ok(())
    }

    fn policy(&self, alias: &KeyAlias) -> Result<KeyPolicy> {
        Ok(self.record(alias)?.policy)
    }

    #[instrument(level = "debug", skip(self), fields(alias = %alias))]
    fn delete(&self, alias: &KeyAlias) -> Result<()> {
        if self.kv.db().remove(key_path(alias))?.is_some() {
            self.kv.db().flush()?;
            info!("Deleted key");
        }
        Ok(())
    }

    #[instrument(level = "debug", skip(self, nonce), fields(alias = %alias))]
    fn init_context(
        &self,
        alias: &KeyAlias,
        direction: Direction,
        nonce: Option<Nonce>,
    ) -> Result<Binding> {
        let record = self.record(alias)?;
        let policy = &record.policy;

        if !policy.authorization_required() {
            trace!("key needs no authorization");
            return Ok(Binding::Ready(
                self.context(alias, &record, direction, nonce, true)?,
            ));
        }
        if policy.is_per_use() {
            debug!("per-use key, context waits for a bound proof");
            return Ok(Binding::NeedsAuthorization(Some(
                self.context(alias, &record, direction, nonce, false)?,
            )));
        }
        if self.is_fresh(policy) {
            trace!("previous proof still inside validity window");
            Ok(Binding::Ready(
                self.context(alias, &record, direction, nonce, true)?,
            ))
        } else {
            debug!("user not authenticated within validity window");
            Ok(Binding::NeedsAuthorization(None))
        }
    }

    #[instrument(level = "debug", skip(self, nonce, context, token), fields(alias = %alias, authenticator = %token.authenticator()))]
    fn apply_authorization(
        &self,
        alias: &KeyAlias,
        direction: Direction,
        nonce: Option<Nonce>,
        context: Option<CryptoContext>,
        token: &AuthToken,
    ) -> Result<Binding> {
        let record = self.record(alias)?;
        let policy = &record.policy;

        if policy.authorization_required() && !policy.authenticators().accepts(token.authenticator())
        {
            return Err(Error::authorization(
                ERROR_PROOF_REJECTED,
                format!(
                    "{} is not accepted by this key ({})",
                    token.authenticator(),
                    policy.authenticators()
                ),
            ));
        }

        if policy.is_per_use() {
            let mut context = context.ok_or_else(|| {
                Error::authorization(
                    ERROR_PROOF_REJECTED,
                    "per-use key needs a proof bound to its cipher context",
                )
            })?;
            if context.alias() != *alias || token.challenge() != Some(context.challenge()) {
                return Err(Error::authorization(
                    ERROR_PROOF_REJECTED,
                    "proof is bound to a different operation",
                ));
            }
            context.mark_authorized();
            return Ok(Binding::Ready(context));
        }

        self.record_proof(token);
        // A context created before the proof is stale, build a fresh one.
        drop(context);
        self.init_context(alias, direction, nonce)
    }
}
