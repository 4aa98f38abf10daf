//! Symmetric encryption of wire payloads and random identifiers.

use base64::{engine::general_purpose::STANDARD as BASE64, Engine as _};
use rand::{distributions::Alphanumeric, Rng};
use ring::{
    aead::{Aad, LessSafeKey, Nonce, UnboundKey, AES_256_GCM, NONCE_LEN},
    rand::{SecureRandom, SystemRandom},
};

use crate::error::{MagicLinkError, Result};

/// Size of a shared MagicLink key.
pub const KEY_BYTES: usize = 32;

/// Length of generated reply endpoints.
pub const ID_LENGTH: usize = 16;

/// AES-256-GCM cryptor shared by both ends of a MagicLink.
///
/// Encrypted payloads are `base64(nonce || ciphertext || tag)`, which keeps
/// them safe to carry in text frames.
pub struct AesCryptor {
    key: LessSafeKey,
    secret: [u8; KEY_BYTES],
    rng: SystemRandom,
}

impl AesCryptor {
    /// Creates a cryptor from raw key bytes.
    ///
    /// ## Arguments
    ///
    /// * `secret` - 32 bytes key
    pub fn new(secret: [u8; KEY_BYTES]) -> Result<Self> {
        let unbound = UnboundKey::new(&AES_256_GCM, &secret)
            .map_err(|_| MagicLinkError::Crypto("invalid AES-256 key".into()))?;
        Ok(Self {
            key: LessSafeKey::new(unbound),
            secret,
            rng: SystemRandom::new(),
        })
    }

    /// Creates a cryptor from a base64 encoded key, as found in configuration files.
    pub fn from_base64(encoded: &str) -> Result<Self> {
        let bytes = BASE64
            .decode(encoded.trim())
            .map_err(|err| MagicLinkError::Crypto(format!("key is not valid base64: {}", err)))?;
        let secret: [u8; KEY_BYTES] = bytes.try_into().map_err(|bytes: Vec<u8>| {
            MagicLinkError::Crypto(format!(
                "key must be {} bytes, got {}",
                KEY_BYTES,
                bytes.len()
            ))
        })?;
        Self::new(secret)
    }

    /// Raw secret, also used to sign bearer tokens.
    pub(crate) fn secret(&self) -> &[u8] {
        &self.secret
    }

    pub fn encrypt(&self, plaintext: &[u8]) -> Result<String> {
        let mut nonce_bytes = [0u8; NONCE_LEN];
        self.rng
            .fill(&mut nonce_bytes)
            .map_err(|_| MagicLinkError::Crypto("could not generate nonce".into()))?;
        let nonce = Nonce::assume_unique_for_key(nonce_bytes);
        let mut in_out = plaintext.to_vec();
        self.key
            .seal_in_place_append_tag(nonce, Aad::empty(), &mut in_out)
            .map_err(|_| MagicLinkError::Crypto("encryption failed".into()))?;
        let mut payload = Vec::with_capacity(NONCE_LEN + in_out.len());
        payload.extend_from_slice(&nonce_bytes);
        payload.extend_from_slice(&in_out);
        Ok(BASE64.encode(payload))
    }

    pub fn decrypt(&self, encoded: &str) -> Result<Vec<u8>> {
        let payload = BASE64
            .decode(encoded.trim())
            .map_err(|err| MagicLinkError::Crypto(format!("payload is not valid base64: {}", err)))?;
        if payload.len() < NONCE_LEN {
            return Err(MagicLinkError::Crypto("payload too short".into()));
        }
        let (nonce_bytes, ciphertext) = payload.split_at(NONCE_LEN);
        let nonce = Nonce::try_assume_unique_for_key(nonce_bytes)
            .map_err(|_| MagicLinkError::Crypto("invalid nonce".into()))?;
        let mut in_out = ciphertext.to_vec();
        let plaintext = self
            .key
            .open_in_place(nonce, Aad::empty(), &mut in_out)
            .map_err(|_| MagicLinkError::Crypto("decryption failed".into()))?;
        Ok(plaintext.to_vec())
    }

    pub fn encrypt_str(&self, plaintext: &str) -> Result<String> {
        self.encrypt(plaintext.as_bytes())
    }

    pub fn decrypt_str(&self, encoded: &str) -> Result<String> {
        let bytes = self.decrypt(encoded)?;
        String::from_utf8(bytes)
            .map_err(|_| MagicLinkError::Crypto("decrypted payload is not UTF-8".into()))
    }
}

impl std::fmt::Debug for AesCryptor {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AesCryptor").finish_non_exhaustive()
    }
}

/// Generates a new random key, base64 encoded.
pub fn generate_key() -> Result<String> {
    let mut secret = [0u8; KEY_BYTES];
    SystemRandom::new()
        .fill(&mut secret)
        .map_err(|_| MagicLinkError::Crypto("RNG failure".into()))?;
    Ok(BASE64.encode(secret))
}

/// Generates a short random alphanumeric identifier.
pub fn generate_id(len: usize) -> String {
    rand::thread_rng()
        .sample_iter(&Alphanumeric)
        .take(len)
        .map(char::from)
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn cryptor() -> AesCryptor {
        AesCryptor::from_base64(&generate_key().unwrap()).unwrap()
    }

    #[test]
    fn encrypt_decrypt() {
        let cryptor = cryptor();
        let encrypted = cryptor.encrypt_str("{\"v\":1}").unwrap();
        assert_ne!(encrypted, "{\"v\":1}");
        assert_eq!(cryptor.decrypt_str(&encrypted).unwrap(), "{\"v\":1}");
    }

    #[test]
    fn wrong_key_fails() {
        let encrypted = cryptor().encrypt_str("hello").unwrap();
        assert!(cryptor().decrypt_str(&encrypted).is_err());
    }

    #[test]
    fn garbage_fails() {
        let cryptor = cryptor();
        assert!(cryptor.decrypt("not base64 !!").is_err());
        assert!(cryptor.decrypt("AAAA").is_err());
    }

    #[test]
    fn short_key_rejected() {
        assert!(AesCryptor::from_base64("AAAA").is_err());
    }

    #[test]
    fn ids_are_alphanumeric() {
        let id = generate_id(ID_LENGTH);
        assert_eq!(id.len(), ID_LENGTH);
        assert!(id.chars().all(|c| c.is_ascii_alphanumeric()));
        assert_ne!(id, generate_id(ID_LENGTH));
    }
}
