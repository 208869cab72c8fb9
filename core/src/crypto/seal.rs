// Network payload sealing: XChaCha20-Poly1305 under a shared group key
//
// Every device configured with the same passphrase derives the same key:
//   key = Blake3::derive_key(SEAL_CONTEXT, passphrase)
//
// Sealed layout: [nonce:24][ciphertext + tag:16]
//
// The packet type byte is bound as AAD so a sealed payload cannot be replayed
// under a different packet type. Relays forward sealed bytes untouched.

use chacha20poly1305::{
    aead::{Aead, KeyInit, Payload},
    XChaCha20Poly1305, XNonce,
};
use rand::RngCore;
use thiserror::Error;
use zeroize::{Zeroize, ZeroizeOnDrop};

/// Changing this breaks compatibility with every sealed packet in flight.
const SEAL_CONTEXT: &str = "lifeline mesh payload seal v1 2026-10-01";

const NONCE_SIZE: usize = 24;
const TAG_SIZE: usize = 16;

/// Bytes added to a payload by [`MeshCipher::seal`].
pub const SEAL_OVERHEAD: usize = NONCE_SIZE + TAG_SIZE;

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum SealError {
    #[error("Sealed payload too short: {0} bytes")]
    TooShort(usize),
    #[error("Encryption failed")]
    Encrypt,
    #[error("Decryption failed (wrong key or tampered payload)")]
    Decrypt,
}

#[derive(Zeroize, ZeroizeOnDrop)]
pub struct MeshCipher {
    key: [u8; 32],
}

impl MeshCipher {
    pub fn from_passphrase(passphrase: &str) -> Self {
        Self {
            key: blake3::derive_key(SEAL_CONTEXT, passphrase.as_bytes()),
        }
    }

    /// Short hex tag of the key, safe to log and compare across devices.
    pub fn fingerprint(&self) -> String {
        hex::encode(&blake3::hash(&self.key).as_bytes()[..4])
    }

    pub fn seal(&self, aad: &[u8], plaintext: &[u8]) -> Result<Vec<u8>, SealError> {
        let cipher = XChaCha20Poly1305::new_from_slice(&self.key).map_err(|_| SealError::Encrypt)?;

        let mut nonce_bytes = [0u8; NONCE_SIZE];
        rand::rngs::OsRng.fill_bytes(&mut nonce_bytes);
        let nonce = XNonce::from_slice(&nonce_bytes);

        let ciphertext = cipher
            .encrypt(nonce, Payload { msg: plaintext, aad })
            .map_err(|_| SealError::Encrypt)?;

        let mut out = Vec::with_capacity(NONCE_SIZE + ciphertext.len());
        out.extend_from_slice(&nonce_bytes);
        out.extend_from_slice(&ciphertext);
        Ok(out)
    }

    pub fn open(&self, aad: &[u8], sealed: &[u8]) -> Result<Vec<u8>, SealError> {
        if sealed.len() < SEAL_OVERHEAD {
            return Err(SealError::TooShort(sealed.len()));
        }
        let cipher = XChaCha20Poly1305::new_from_slice(&self.key).map_err(|_| SealError::Decrypt)?;
        let (nonce_bytes, ciphertext) = sealed.split_at(NONCE_SIZE);

        cipher
            .decrypt(
                XNonce::from_slice(nonce_bytes),
                Payload {
                    msg: ciphertext,
                    aad,
                },
            )
            .map_err(|_| SealError::Decrypt)
    }
}

impl std::fmt::Debug for MeshCipher {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str("MeshCipher([redacted])")
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_seal_open() {
        let cipher = MeshCipher::from_passphrase("district-7");
        let sealed = cipher.seal(&[0x03], b"water at the school").unwrap();

        assert_eq!(sealed.len(), 19 + SEAL_OVERHEAD);
        assert_eq!(cipher.open(&[0x03], &sealed).unwrap(), b"water at the school");
    }

    #[test]
    fn test_fingerprint_matches_across_devices() {
        let a = MeshCipher::from_passphrase("district-7");
        let b = MeshCipher::from_passphrase("district-7");
        assert_eq!(a.fingerprint(), b.fingerprint());
        assert_eq!(a.fingerprint().len(), 8);
        assert_ne!(a.fingerprint(), MeshCipher::from_passphrase("x").fingerprint());
    }

    #[test]
    fn test_wrong_passphrase_fails() {
        let sealed = MeshCipher::from_passphrase("a").seal(&[1], b"x").unwrap();
        assert_eq!(
            MeshCipher::from_passphrase("b").open(&[1], &sealed),
            Err(SealError::Decrypt)
        );
    }

    #[test]
    fn test_aad_mismatch_fails() {
        let cipher = MeshCipher::from_passphrase("k");
        let sealed = cipher.seal(&[0x01], b"sos").unwrap();
        assert!(cipher.open(&[0x03], &sealed).is_err());
    }

    #[test]
    fn test_tamper_and_truncation_detected() {
        let cipher = MeshCipher::from_passphrase("k");
        let mut sealed = cipher.seal(&[], b"payload").unwrap();
        let last = sealed.len() - 1;
        sealed[last] ^= 0xFF;
        assert!(cipher.open(&[], &sealed).is_err());
        assert_eq!(cipher.open(&[], &[0u8; 10]), Err(SealError::TooShort(10)));
    }
}
