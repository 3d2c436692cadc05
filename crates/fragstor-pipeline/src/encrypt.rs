//! AEAD encryption stage (AES-GCM).
//!
//! A fresh nonce is generated per block and prepended to the ciphertext, so
//! the stage output is self-contained given the key. Authentication failure
//! on decrypt reports as corrupted. Key length selects the AES variant:
//! 16, 24, or 32 bytes for AES-128/192/256-GCM.

use aes_gcm::aead::consts::U12;
use aes_gcm::aead::Aead;
use aes_gcm::aes::Aes192;
use aes_gcm::{AeadCore, Aes128Gcm, Aes256Gcm, AesGcm, KeyInit, Nonce};
use rand::RngCore;
use serde::{Deserialize, Serialize};
use zeroize::{Zeroize, ZeroizeOnDrop};

use crate::error::{PipelineError, Result};

type Aes192Gcm = AesGcm<Aes192, U12>;

/// Nonce length in bytes, prepended to every ciphertext.
pub const NONCE_SIZE: usize = 12;

/// A pre-shared symmetric key of 16, 24, or 32 bytes.
#[derive(Clone, PartialEq, Eq, Serialize, Deserialize, Zeroize, ZeroizeOnDrop)]
pub struct AeadKey(pub Vec<u8>);

impl AeadKey {
    /// Validate the key length against the supported AES variants.
    pub fn validate(&self) -> Result<()> {
        match self.0.len() {
            16 | 24 | 32 => Ok(()),
            other => Err(PipelineError::InvalidConfig(format!(
                "AEAD key must be 16, 24 or 32 bytes, got {}",
                other
            ))),
        }
    }
}

impl std::fmt::Debug for AeadKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "AeadKey([REDACTED; {}])", self.0.len())
    }
}

/// Configuration for an encryptor stage.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EncryptorConfig {
    /// The pre-shared symmetric key.
    pub key: AeadKey,
}

/// Encrypt a chunk: output is `nonce || ciphertext-with-tag`.
pub fn encrypt(plaintext: &[u8], key: &AeadKey) -> Result<Vec<u8>> {
    key.validate()?;

    let mut nonce = [0u8; NONCE_SIZE];
    rand::thread_rng().fill_bytes(&mut nonce);

    let ciphertext = match key.0.len() {
        16 => seal::<Aes128Gcm>(&key.0, &nonce, plaintext)?,
        24 => seal::<Aes192Gcm>(&key.0, &nonce, plaintext)?,
        _ => seal::<Aes256Gcm>(&key.0, &nonce, plaintext)?,
    };

    let mut out = Vec::with_capacity(NONCE_SIZE + ciphertext.len());
    out.extend_from_slice(&nonce);
    out.extend_from_slice(&ciphertext);
    Ok(out)
}

/// Decrypt a chunk produced by [`encrypt`] with the same key.
pub fn decrypt(payload: &[u8], key: &AeadKey) -> Result<Vec<u8>> {
    key.validate()?;
    if payload.len() < NONCE_SIZE {
        return Err(PipelineError::Corrupted(
            "encrypted payload shorter than nonce".to_string(),
        ));
    }
    let (nonce, ciphertext) = payload.split_at(NONCE_SIZE);

    match key.0.len() {
        16 => open::<Aes128Gcm>(&key.0, nonce, ciphertext),
        24 => open::<Aes192Gcm>(&key.0, nonce, ciphertext),
        _ => open::<Aes256Gcm>(&key.0, nonce, ciphertext),
    }
}

fn seal<C>(key: &[u8], nonce: &[u8], plaintext: &[u8]) -> Result<Vec<u8>>
where
    C: Aead + KeyInit + AeadCore<NonceSize = U12>,
{
    let cipher =
        C::new_from_slice(key).map_err(|e| PipelineError::EncryptionFailed(e.to_string()))?;
    cipher
        .encrypt(Nonce::from_slice(nonce), plaintext)
        .map_err(|e| PipelineError::EncryptionFailed(e.to_string()))
}

fn open<C>(key: &[u8], nonce: &[u8], ciphertext: &[u8]) -> Result<Vec<u8>>
where
    C: Aead + KeyInit + AeadCore<NonceSize = U12>,
{
    let cipher =
        C::new_from_slice(key).map_err(|e| PipelineError::EncryptionFailed(e.to_string()))?;
    cipher
        .decrypt(Nonce::from_slice(nonce), ciphertext)
        .map_err(|_| PipelineError::Corrupted("AEAD authentication failed".to_string()))
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    proptest! {
        #[test]
        fn prop_roundtrip_all_key_sizes(data in prop::collection::vec(0u8..=255, 0..16_384)) {
            for len in [16usize, 24, 32] {
                let key = AeadKey(vec![0x42; len]);
                let sealed = encrypt(&data, &key).unwrap();
                prop_assert_eq!(decrypt(&sealed, &key).unwrap(), data.clone());
            }
        }
    }

    #[test]
    fn test_nonce_prepended_and_unique() {
        let key = AeadKey(vec![0; 16]);
        let a = encrypt(b"same plaintext", &key).unwrap();
        let b = encrypt(b"same plaintext", &key).unwrap();
        assert_ne!(&a[..NONCE_SIZE], &b[..NONCE_SIZE]);
        assert_ne!(a, b);
    }

    #[test]
    fn test_tampered_ciphertext_is_corrupted() {
        let key = AeadKey(vec![7; 32]);
        let mut sealed = encrypt(b"secret", &key).unwrap();
        let last = sealed.len() - 1;
        sealed[last] ^= 0xFF;
        assert!(matches!(
            decrypt(&sealed, &key),
            Err(PipelineError::Corrupted(_))
        ));
    }

    #[test]
    fn test_wrong_key_is_corrupted() {
        let key = AeadKey(vec![7; 32]);
        let sealed = encrypt(b"secret", &key).unwrap();
        let wrong = AeadKey(vec![8; 32]);
        assert!(matches!(
            decrypt(&sealed, &wrong),
            Err(PipelineError::Corrupted(_))
        ));
    }

    #[test]
    fn test_truncated_payload_is_corrupted() {
        let key = AeadKey(vec![7; 16]);
        assert!(matches!(
            decrypt(&[0u8; 4], &key),
            Err(PipelineError::Corrupted(_))
        ));
    }

    #[test]
    fn test_bad_key_length_rejected() {
        let key = AeadKey(vec![0; 20]);
        assert!(matches!(
            encrypt(b"x", &key),
            Err(PipelineError::InvalidConfig(_))
        ));
    }

    #[test]
    fn test_key_debug_redacted() {
        let key = AeadKey(vec![0xAA; 16]);
        let rendered = format!("{:?}", key);
        assert!(!rendered.contains("170"));
        assert!(rendered.contains("REDACTED"));
    }
}
