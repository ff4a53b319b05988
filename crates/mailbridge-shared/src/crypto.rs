//! Sealing of mail credentials at rest.
//!
//! A sealed credential is `hex(nonce || ciphertext)` under XChaCha20-Poly1305,
//! keyed by a blake3 derivation of the operator's secret. Hex keeps the value
//! storable in a TEXT column.

use chacha20poly1305::{
    aead::{Aead, KeyInit},
    XChaCha20Poly1305, XNonce,
};
use rand::RngCore;

use crate::constants::{KDF_CONTEXT_CREDENTIAL_KEY, NONCE_SIZE, SYMMETRIC_KEY_SIZE};
use crate::error::CryptoError;

/// Key used to seal and open stored mail passwords.
#[derive(Clone, PartialEq, Eq)]
pub struct CredentialKey([u8; SYMMETRIC_KEY_SIZE]);

impl std::fmt::Debug for CredentialKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str("CredentialKey(<redacted>)")
    }
}

impl CredentialKey {
    pub fn derive(secret: &str) -> Self {
        Self(blake3::derive_key(KDF_CONTEXT_CREDENTIAL_KEY, secret.as_bytes()))
    }

    fn cipher(&self) -> XChaCha20Poly1305 {
        XChaCha20Poly1305::new((&self.0).into())
    }

    pub fn seal(&self, credential: &str) -> Result<String, CryptoError> {
        let mut nonce = [0u8; NONCE_SIZE];
        rand::rngs::OsRng.fill_bytes(&mut nonce);

        let sealed = self
            .cipher()
            .encrypt(XNonce::from_slice(&nonce), credential.as_bytes())
            .map_err(|_| CryptoError::EncryptionFailed)?;

        let mut out = nonce.to_vec();
        out.extend(sealed);
        Ok(hex::encode(out))
    }

    pub fn open(&self, sealed: &str) -> Result<String, CryptoError> {
        let raw = hex::decode(sealed).map_err(|_| CryptoError::DecryptionFailed)?;
        if raw.len() < NONCE_SIZE {
            return Err(CryptoError::DecryptionFailed);
        }
        let (nonce, body) = raw.split_at(NONCE_SIZE);
        let plain = self
            .cipher()
            .decrypt(XNonce::from_slice(nonce), body)
            .map_err(|_| CryptoError::DecryptionFailed)?;
        String::from_utf8(plain).map_err(|_| CryptoError::InvalidUtf8)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn seal_then_open() {
        let key = CredentialKey::derive("operator secret");
        let sealed = key.seal("hunter2").unwrap();
        assert_ne!(sealed, "hunter2");
        assert_eq!(key.open(&sealed).unwrap(), "hunter2");

        // Fresh nonce every time.
        assert_ne!(key.seal("hunter2").unwrap(), sealed);
    }

    #[test]
    fn other_secret_cannot_open() {
        let sealed = CredentialKey::derive("secret-1").seal("password").unwrap();
        assert!(CredentialKey::derive("secret-2").open(&sealed).is_err());
    }

    #[test]
    fn tampering_and_garbage_are_rejected() {
        let key = CredentialKey::derive("secret");
        let mut raw = hex::decode(key.seal("Important data").unwrap()).unwrap();
        *raw.last_mut().unwrap() ^= 0xFF;
        assert!(key.open(&hex::encode(raw)).is_err());

        assert!(key.open("").is_err());
        assert!(key.open("not hex").is_err());
        assert!(key.open(&hex::encode([0u8; NONCE_SIZE - 1])).is_err());
    }

    #[test]
    fn debug_hides_key_material() {
        let key = CredentialKey::derive("abc");
        assert_eq!(key, CredentialKey::derive("abc"));
        assert_ne!(key, CredentialKey::derive("abd"));
        assert_eq!(format!("{key:?}"), "CredentialKey(<redacted>)");
    }
}
