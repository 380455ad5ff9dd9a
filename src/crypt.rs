use aes_gcm::{
    Aes256Gcm, Nonce,
    aead::{Aead, KeyInit},
};
use hkdf::Hkdf;
use rand::RngCore;
use secrecy::{ExposeSecret, SecretSlice};
use zeroize::Zeroizing;

use crate::envelope::{NONCE_LEN, Nonce as NonceBytes};
use crate::error::{Error, Result};
use crate::policy::KEY_SIZE_BITS;

pub(crate) const KEY_LEN: usize = KEY_SIZE_BITS / 8;

/// Salt mixed into every wrapping-key derivation.
const WRAP_SALT: &[u8] = b"keygate:key-wrap:v1";

/// The root key of a key store, from which one wrapping key per stored
/// key is derived.
///
/// It never encrypts user data directly. In TPM terms this is the key that
/// gets sealed to the device, see [`crate::tpm`].
pub struct MasterKey {
    key: SecretSlice<u8>,
}

impl MasterKey {
    /// Draws a fresh master key from the OS RNG.
    pub fn generate() -> Self {
        let mut key = Zeroizing::new([0u8; KEY_LEN]);
        rand::rng().fill_bytes(key.as_mut_slice());
        Self {
            key: SecretSlice::new(key.to_vec().into()),
        }
    }

    pub fn from_slice(key: &[u8]) -> Result<Self> {
        if key.len() != KEY_LEN {
            return Err(Error::KeyStoreUnavailable(format!(
                "master key must be {KEY_LEN} bytes, got {}",
                key.len()
            )));
        }
        Ok(Self {
            key: SecretSlice::new(key.to_vec().into()),
        })
    }

    pub fn key(&self) -> &SecretSlice<u8> {
        &self.key
    }

    /// Derives the key that wraps the material stored under `label`.
    pub fn wrapping_key(&self, label: &[u8]) -> Result<WrappingKey> {
        let mut key = Zeroizing::new([0u8; KEY_LEN]);
        Hkdf::<sha2::Sha256>::new(Some(WRAP_SALT), self.key.expose_secret())
            .expand(label, key.as_mut_slice())
            .map_err(|e| Error::KeyStoreUnavailable(format!("hkdf expansion failed: {e}")))?;
        Ok(WrappingKey {
            key: SecretSlice::new(key.to_vec().into()),
        })
    }
}

/// A per-key wrapping key derived from a [`MasterKey`].
pub struct WrappingKey {
    key: SecretSlice<u8>,
}

impl WrappingKey {
    fn cipher(&self) -> Result<Aes256Gcm> {
        Aes256Gcm::new_from_slice(self.key.expose_secret())
            .map_err(|_| Error::KeyStoreUnavailable("wrapping key has the wrong length".into()))
    }

    /// Encrypts key material for storage. Returns the wrapped bytes and the
    /// nonce used.
    pub fn wrap(&self, material: &[u8]) -> Result<(Vec<u8>, NonceBytes)> {
        let nonce = random_nonce();
        let wrapped = self
            .cipher()?
            .encrypt(Nonce::from_slice(&nonce), material)
            .map_err(|_| Error::KeyStoreUnavailable("failed to wrap key material".into()))?;
        Ok((wrapped, nonce))
    }

    /// Recovers key material. A tag mismatch means the record was tampered
    /// with or the store was opened with a different master key.
    pub fn unwrap_material(
        &self,
        wrapped: &[u8],
        nonce: &NonceBytes,
    ) -> Result<Zeroizing<Vec<u8>>> {
        self.cipher()?
            .decrypt(Nonce::from_slice(nonce), wrapped)
            .map(Zeroizing::new)
            .map_err(|_| {
                Error::KeyStoreUnavailable("stored key material failed to unwrap".into())
            })
    }
}

/// Fresh random key bytes for a new AES-256 key.
pub(crate) fn generate_key_material() -> Zeroizing<Vec<u8>> {
    let mut material = Zeroizing::new(vec![0u8; KEY_LEN]);
    rand::rng().fill_bytes(material.as_mut_slice());
    material
}

pub(crate) fn random_nonce() -> NonceBytes {
    let mut nonce = [0u8; NONCE_LEN];
    rand::rng().fill_bytes(&mut nonce);
    nonce
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn master_key_must_be_32_bytes() {
        assert!(MasterKey::from_slice(&[0u8; 16]).is_err());
        let key = MasterKey::from_slice(&[9u8; 32]).unwrap();
        assert_eq!(key.key().expose_secret(), &[9u8; 32]);
    }

    #[test]
    fn wrapping_keys_are_label_specific() {
        let master = MasterKey::from_slice(&[1u8; 32]).unwrap();
        let material = generate_key_material();

        let (wrapped, nonce) = master.wrapping_key(b"a").unwrap().wrap(&material).unwrap();
        let unwrapped = master
            .wrapping_key(b"a")
            .unwrap()
            .unwrap_material(&wrapped, &nonce)
            .unwrap();
        assert_eq!(unwrapped.as_slice(), material.as_slice());

        assert!(
            master
                .wrapping_key(b"b")
                .unwrap()
                .unwrap_material(&wrapped, &nonce)
                .is_err()
        );
    }

    #[test]
    fn different_master_cannot_unwrap() {
        let material = generate_key_material();
        let (wrapped, nonce) = MasterKey::generate()
            .wrapping_key(b"label")
            .unwrap()
            .wrap(&material)
            .unwrap();
        let other = MasterKey::generate().wrapping_key(b"label").unwrap();
        assert!(other.unwrap_material(&wrapped, &nonce).is_err());
    }
}
