//! Seals a key store's master key to a TPM 2.0 device.
//!
//! The master key is encrypted with an RSA-2048 child key created under an
//! owner-hierarchy RSA primary. Only the TPM-wrapped blobs of the child key
//! and the encrypted master key are persisted; without the same TPM the
//! store's records cannot be unwrapped.

use bincode::{Decode, Encode};
use secrecy::ExposeSecret;
use serde::{Deserialize, Serialize};
use std::convert::TryFrom;
use tracing::{debug, error, info, instrument, trace};
use tss_esapi::attributes::ObjectAttributesBuilder;
use tss_esapi::handles::KeyHandle;
use tss_esapi::interface_types::algorithm::{HashingAlgorithm, PublicAlgorithm};
use tss_esapi::interface_types::key_bits::RsaKeyBits;
use tss_esapi::interface_types::resource_handles::Hierarchy;
use tss_esapi::structures::{
    Data, Private, Public, PublicBuilder, PublicKeyRsa, PublicRsaParametersBuilder,
    RsaDecryptionScheme, RsaExponent, RsaScheme, SensitiveData, SymmetricDefinitionObject,
};
use tss_esapi::tcti_ldr::TabrmdConfig;
use tss_esapi::traits::{Marshall, UnMarshall};
use tss_esapi::{Context, TctiNameConf};
use zeroize::Zeroizing;

use crate::crypt::MasterKey;
use crate::error::{Error, Result};

const RSA_KEY_BITS: u16 = 2048;

/// TCTI from `TPM2TOOLS_TCTI`/`TCTI`, falling back to the access broker.
pub fn default_tcti() -> TctiNameConf {
    TctiNameConf::from_environment_variable()
        .unwrap_or(TctiNameConf::Tabrmd(TabrmdConfig::default()))
}

/// A master key encrypted by a TPM-resident RSA key.
#[derive(Serialize, Deserialize, Encode, Decode, Debug, Clone)]
pub struct SealedMasterKey {
    public_key: Vec<u8>,
    private_key_blob: Vec<u8>,
    encrypted_key: Vec<u8>,
}

impl SealedMasterKey {
    /// Where a [`crate::SledKeyStore`] keeps the sealed key.
    pub const PATH: &'static str = "sealed_master_key";

    #[instrument(level = "debug", skip_all)]
    pub fn seal(master_key: &MasterKey, tpm_context: Context) -> Result<Self> {
        let mut sealer = TpmSealer::with_rsa_primary(tpm_context)?;
        let (public, private) = sealer.create_child()?;
        let encrypted_key = sealer.rsa_encrypt(master_key.key().expose_secret())?;
        info!("Master key sealed to TPM");

        Ok(Self {
            public_key: public.marshall()?,
            private_key_blob: private.value().to_vec(),
            encrypted_key,
        })
    }

    #[instrument(level = "debug", skip_all)]
    pub fn unseal(&self, tpm_context: Context) -> Result<MasterKey> {
        let mut sealer = TpmSealer::with_rsa_primary(tpm_context)?;
        let public = Public::unmarshall(&self.public_key)?;
        let private = Private::try_from(self.private_key_blob.clone()).map_err(|_| {
            Error::KeyStoreUnavailable("sealed private key blob is invalid".into())
        })?;
        sealer.load_child(public, private)?;
        let decrypted = sealer.rsa_decrypt(&self.encrypted_key)?;
        MasterKey::from_slice(&decrypted)
    }
}

/// A TPM context with a loaded RSA primary and, once created or loaded, the
/// child key used for sealing.
struct TpmSealer {
    ctx: Context,
    primary: KeyHandle,
    child: Option<KeyHandle>,
}

impl TpmSealer {
    fn with_rsa_primary(mut ctx: Context) -> Result<Self> {
        let object_attributes = ObjectAttributesBuilder::new()
            .with_fixed_tpm(true)
            .with_fixed_parent(true)
            .with_sensitive_data_origin(true)
            .with_user_with_auth(true)
            .with_restricted(true)
            .with_decrypt(true)
            .build()?;

        let rsa_params = PublicRsaParametersBuilder::new_restricted_decryption_key(
            SymmetricDefinitionObject::AES_128_CFB,
            RsaKeyBits::try_from(RSA_KEY_BITS)?,
            RsaExponent::default(),
        )
        .build()?;

        let template = PublicBuilder::new()
            .with_object_attributes(object_attributes)
            .with_rsa_parameters(rsa_params)
            .with_public_algorithm(PublicAlgorithm::Rsa)
            .with_name_hashing_algorithm(HashingAlgorithm::Sha256)
            .with_rsa_unique_identifier(PublicKeyRsa::default())
            .build()?;
        trace!(?template, "creating RSA primary");

        let primary = ctx.execute_with_nullauth_session(|ctx| {
            ctx.create_primary(Hierarchy::Owner, template, None, None, None, None)
        })?;
        debug!("RSA primary created");

        Ok(Self {
            ctx,
            primary: primary.key_handle,
            child: None,
        })
    }

    /// Creates and loads an unrestricted RSA decryption key under the primary.
    fn create_child(&mut self) -> Result<(Public, Private)> {
        let rsa_params = PublicRsaParametersBuilder::new()
            .with_scheme(RsaScheme::Null)
            .with_key_bits(RsaKeyBits::try_from(RSA_KEY_BITS)?)
            .with_exponent(RsaExponent::default())
            .with_symmetric(SymmetricDefinitionObject::Null)
            .with_is_signing_key(false)
            .with_is_decryption_key(true)
            .with_restricted(false)
            .build()?;

        let object_attributes = ObjectAttributesBuilder::new()
            .with_fixed_tpm(true)
            .with_fixed_parent(true)
            .with_sensitive_data_origin(true)
            .with_user_with_auth(true)
            .with_decrypt(true)
            .build()?;

        let template = PublicBuilder::new()
            .with_public_algorithm(PublicAlgorithm::Rsa)
            .with_name_hashing_algorithm(HashingAlgorithm::Sha256)
            .with_object_attributes(object_attributes)
            .with_rsa_parameters(rsa_params)
            .with_rsa_unique_identifier(PublicKeyRsa::default())
            .build()?;

        let primary = self.primary;
        let created = self.ctx.execute_with_nullauth_session(|ctx| {
            ctx.create(
                primary,
                template,
                None,
                Some(SensitiveData::default()),
                None,
                None,
            )
        })?;
        debug!(
            private_len = created.out_private.value().len(),
            "RSA sealing key created"
        );

        self.load_child(created.out_public.clone(), created.out_private.clone())?;
        Ok((created.out_public, created.out_private))
    }

    fn load_child(&mut self, public: Public, private: Private) -> Result<()> {
        let primary = self.primary;
        let handle = self
            .ctx
            .execute_with_nullauth_session(|ctx| ctx.load(primary, private, public))?;
        self.child = Some(handle);
        Ok(())
    }

    fn child(&self) -> Result<KeyHandle> {
        self.child.ok_or_else(|| {
            error!("No sealing key loaded");
            Error::KeyStoreUnavailable("no TPM sealing key loaded".into())
        })
    }

    fn rsa_encrypt(&mut self, plaintext: &[u8]) -> Result<Vec<u8>> {
        let key = self.child()?;
        let message = PublicKeyRsa::try_from(plaintext.to_vec())?;
        let encrypted = self.ctx.execute_with_nullauth_session(|ctx| {
            ctx.rsa_encrypt(key, message, RsaDecryptionScheme::RsaEs, Data::default())
        })?;
        Ok(encrypted.value().to_vec())
    }

    fn rsa_decrypt(&mut self, ciphertext: &[u8]) -> Result<Zeroizing<Vec<u8>>> {
        let key = self.child()?;
        let ciphertext = PublicKeyRsa::try_from(ciphertext.to_vec())?;
        let decrypted = self.ctx.execute_with_nullauth_session(|ctx| {
            ctx.rsa_decrypt(key, ciphertext, RsaDecryptionScheme::RsaEs, Data::default())
        })?;
        Ok(Zeroizing::new(decrypted.value().to_vec()))
    }
}
