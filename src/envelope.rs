//! Byte layout of an encrypted payload: `nonce || ciphertext-with-tag`.
//!
//! There is no framing beyond the fixed-size nonce prefix.

use crate::error::{Error, Result};

/// Length of an AES-GCM nonce.
pub const NONCE_LEN: usize = 12;

pub type Nonce = [u8; NONCE_LEN];

/// Concatenates `nonce` and `ciphertext` into one envelope.
pub fn pack(nonce: &Nonce, ciphertext: &[u8]) -> Vec<u8> {
    let mut envelope = Vec::with_capacity(NONCE_LEN + ciphertext.len());
    envelope.extend_from_slice(nonce);
    envelope.extend_from_slice(ciphertext);
    envelope
}

/// Splits an envelope back into its nonce and ciphertext.
///
/// An envelope must carry at least one byte after the nonce.
pub fn unpack(envelope: &[u8]) -> Result<(Nonce, &[u8])> {
    if envelope.len() <= NONCE_LEN {
        return Err(Error::MalformedEnvelope(format!(
            "envelope is {} bytes, expected more than {NONCE_LEN}",
            envelope.len()
        )));
    }
    let (head, ciphertext) = envelope.split_at(NONCE_LEN);
    Ok((nonce_from_slice(head)?, ciphertext))
}

/// Validates a caller-supplied nonce.
pub fn nonce_from_slice(bytes: &[u8]) -> Result<Nonce> {
    bytes.try_into().map_err(|_| {
        Error::MalformedEnvelope(format!(
            "nonce is {} bytes, expected {NONCE_LEN}",
            bytes.len()
        ))
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn pack_prefixes_nonce() {
        let nonce = [7u8; NONCE_LEN];
        let envelope = pack(&nonce, b"ciphertext");
        assert_eq!(envelope.len(), NONCE_LEN + b"ciphertext".len());
        assert_eq!(&envelope[..NONCE_LEN], &nonce);

        let (n, ct) = unpack(&envelope).unwrap();
        assert_eq!(n, nonce);
        assert_eq!(ct, b"ciphertext");
    }

    #[test]
    fn unpack_rejects_short_input() {
        for len in 0..=NONCE_LEN {
            let err = unpack(&vec![0u8; len]).unwrap_err();
            assert!(matches!(err, Error::MalformedEnvelope(_)), "len {len}");
        }
        assert!(unpack(&[0u8; NONCE_LEN + 1]).is_ok());
    }

    #[test]
    fn nonce_length_is_checked() {
        assert!(nonce_from_slice(&[0u8; 11]).is_err());
        assert!(nonce_from_slice(&[0u8; 13]).is_err());
        assert_eq!(nonce_from_slice(&[1u8; 12]).unwrap(), [1u8; 12]);
    }
}
