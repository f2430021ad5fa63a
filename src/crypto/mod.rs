//! AES-256-GCM encryption of short secrets, plus the CSPRNG helpers used for
//! install-state nonces and database passwords.
//!
//! Ciphertexts are wrapped in a versioned JSON envelope
//! (`{"v":1,"iv":…,"data":…,"tag":…}`, all base64) so the on-disk format can
//! survive an algorithm change. The envelope is shared verbatim with the bulk
//! token sweeper, which reads the same rows with the same key.

use aes_gcm::{
    aead::{Aead, AeadCore, KeyInit, OsRng},
    Aes256Gcm, Nonce,
};
use base64::{engine::general_purpose::STANDARD as BASE64, Engine};
use rand::{distributions::Alphanumeric, Rng, RngCore};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use thiserror::Error;

pub mod signature;

const KEY_SIZE: usize = 32;
const NONCE_SIZE: usize = 12;
const TAG_SIZE: usize = 16;
const ENVELOPE_VERSION: u8 = 1;

#[derive(Debug, Error)]
pub enum CryptoError {
    #[error("encryption key must be {KEY_SIZE} bytes of hex")]
    InvalidKey,
    /// Deliberately carries no detail: tampered, truncated, wrong-key and
    /// unknown-version inputs are indistinguishable to callers.
    #[error("ciphertext is corrupt")]
    Corrupt,
}

#[derive(Serialize, Deserialize)]
struct Envelope {
    v: u8,
    iv: String,
    data: String,
    tag: String,
}

/// Process-wide cipher for token and password material. Constructed once at
/// startup from `ENCRYPTION_KEY`; a bad key is a fatal configuration error.
pub struct TokenCipher {
    cipher: Aes256Gcm,
}

impl TokenCipher {
    /// Build a cipher from a hex-encoded 32-byte key.
    pub fn from_hex_key(key_hex: &str) -> Result<Self, CryptoError> {
        let key_bytes = hex::decode(key_hex.trim()).map_err(|_| CryptoError::InvalidKey)?;
        if key_bytes.len() != KEY_SIZE {
            return Err(CryptoError::InvalidKey);
        }
        let cipher = Aes256Gcm::new_from_slice(&key_bytes).map_err(|_| CryptoError::InvalidKey)?;
        Ok(Self { cipher })
    }

    /// Encrypt a secret into the versioned envelope, with a fresh random
    /// 96-bit IV per call.
    pub fn encrypt(&self, plaintext: &str) -> Result<String, CryptoError> {
        let nonce = Aes256Gcm::generate_nonce(&mut OsRng);
        let mut sealed = self
            .cipher
            .encrypt(&nonce, plaintext.as_bytes())
            .map_err(|_| CryptoError::Corrupt)?;
        // aes-gcm appends the 16-byte auth tag; the envelope stores it apart.
        let tag = sealed.split_off(sealed.len() - TAG_SIZE);
        let envelope = Envelope {
            v: ENVELOPE_VERSION,
            iv: BASE64.encode(nonce),
            data: BASE64.encode(&sealed),
            tag: BASE64.encode(&tag),
        };
        serde_json::to_string(&envelope).map_err(|_| CryptoError::Corrupt)
    }

    /// Decrypt an envelope produced by [`TokenCipher::encrypt`].
    pub fn decrypt(&self, blob: &str) -> Result<String, CryptoError> {
        let envelope: Envelope = serde_json::from_str(blob).map_err(|_| CryptoError::Corrupt)?;
        if envelope.v != ENVELOPE_VERSION {
            return Err(CryptoError::Corrupt);
        }
        let iv = BASE64.decode(&envelope.iv).map_err(|_| CryptoError::Corrupt)?;
        let data = BASE64.decode(&envelope.data).map_err(|_| CryptoError::Corrupt)?;
        let tag = BASE64.decode(&envelope.tag).map_err(|_| CryptoError::Corrupt)?;
        if iv.len() != NONCE_SIZE || tag.len() != TAG_SIZE {
            return Err(CryptoError::Corrupt);
        }
        let mut sealed = data;
        sealed.extend_from_slice(&tag);
        let plaintext = self
            .cipher
            .decrypt(Nonce::from_slice(&iv), sealed.as_ref())
            .map_err(|_| CryptoError::Corrupt)?;
        String::from_utf8(plaintext).map_err(|_| CryptoError::Corrupt)
    }
}

/// SHA-256 hex digest. Used to hash install-state nonces before storage so
/// the raw state value never touches the database.
pub fn digest_hex(value: &str) -> String {
    hex::encode(Sha256::digest(value.as_bytes()))
}

/// `n` random bytes from the OS CSPRNG, hex encoded.
pub fn random_token_hex(n: usize) -> String {
    let mut bytes = vec![0u8; n];
    rand::thread_rng().fill_bytes(&mut bytes);
    hex::encode(bytes)
}

/// Random alphanumeric password for a provisioned database.
pub fn random_password(len: usize) -> String {
    rand::thread_rng()
        .sample_iter(&Alphanumeric)
        .take(len)
        .map(char::from)
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn test_cipher() -> TokenCipher {
        TokenCipher::from_hex_key(&hex::encode([7u8; 32])).unwrap()
    }

    #[test]
    fn rejects_bad_keys() {
        assert!(TokenCipher::from_hex_key("not hex").is_err());
        assert!(TokenCipher::from_hex_key(&hex::encode([0u8; 16])).is_err());
        assert!(TokenCipher::from_hex_key(&hex::encode([0u8; 64])).is_err());
        assert!(TokenCipher::from_hex_key(&hex::encode([0u8; 32])).is_ok());
    }

    #[test]
    fn round_trip() {
        let cipher = test_cipher();
        for plaintext in ["", "rt_abc123", "a much longer refresh token value 🦀"] {
            let blob = cipher.encrypt(plaintext).unwrap();
            assert_eq!(cipher.decrypt(&blob).unwrap(), plaintext);
        }
    }

    #[test]
    fn envelope_shape() {
        let cipher = test_cipher();
        let blob = cipher.encrypt("secret").unwrap();
        let value: serde_json::Value = serde_json::from_str(&blob).unwrap();
        assert_eq!(value["v"], 1);
        let iv = BASE64.decode(value["iv"].as_str().unwrap()).unwrap();
        let tag = BASE64.decode(value["tag"].as_str().unwrap()).unwrap();
        assert_eq!(iv.len(), NONCE_SIZE);
        assert_eq!(tag.len(), TAG_SIZE);
    }

    #[test]
    fn unique_ivs_per_call() {
        let cipher = test_cipher();
        let a = cipher.encrypt("same").unwrap();
        let b = cipher.encrypt("same").unwrap();
        assert_ne!(a, b);
        assert_eq!(cipher.decrypt(&a).unwrap(), "same");
        assert_eq!(cipher.decrypt(&b).unwrap(), "same");
    }

    #[test]
    fn tampered_ciphertext_is_corrupt() {
        let cipher = test_cipher();
        let blob = cipher.encrypt("secret").unwrap();
        let mut envelope: serde_json::Value = serde_json::from_str(&blob).unwrap();

        // Flip one bit inside the payload.
        let mut data = BASE64.decode(envelope["data"].as_str().unwrap()).unwrap();
        data[0] ^= 0x01;
        envelope["data"] = serde_json::Value::String(BASE64.encode(&data));
        let err = cipher.decrypt(&envelope.to_string()).unwrap_err();
        assert!(matches!(err, CryptoError::Corrupt));
    }

    #[test]
    fn structural_mismatches_are_corrupt() {
        let cipher = test_cipher();
        let blob = cipher.encrypt("secret").unwrap();

        // Unknown version.
        let mut envelope: serde_json::Value = serde_json::from_str(&blob).unwrap();
        envelope["v"] = serde_json::Value::from(2);
        assert!(matches!(
            cipher.decrypt(&envelope.to_string()),
            Err(CryptoError::Corrupt)
        ));

        // Truncated IV.
        let mut envelope: serde_json::Value = serde_json::from_str(&blob).unwrap();
        envelope["iv"] = serde_json::Value::String(BASE64.encode([0u8; 4]));
        assert!(matches!(
            cipher.decrypt(&envelope.to_string()),
            Err(CryptoError::Corrupt)
        ));

        // Not JSON at all.
        assert!(matches!(
            cipher.decrypt("definitely not an envelope"),
            Err(CryptoError::Corrupt)
        ));
    }

    #[test]
    fn wrong_key_is_corrupt() {
        let blob = test_cipher().encrypt("secret").unwrap();
        let other = TokenCipher::from_hex_key(&hex::encode([9u8; 32])).unwrap();
        assert!(matches!(other.decrypt(&blob), Err(CryptoError::Corrupt)));
    }

    #[test]
    fn digest_is_stable_hex() {
        let digest = digest_hex("state-nonce");
        assert_eq!(digest.len(), 64);
        assert_eq!(digest, digest_hex("state-nonce"));
        assert_ne!(digest, digest_hex("other-nonce"));
    }

    #[test]
    fn random_helpers_have_expected_shape() {
        let token = random_token_hex(32);
        assert_eq!(token.len(), 64);
        assert!(token.chars().all(|c| c.is_ascii_hexdigit()));
        assert_ne!(token, random_token_hex(32));

        let password = random_password(24);
        assert_eq!(password.len(), 24);
        assert!(password.chars().all(|c| c.is_ascii_alphanumeric()));
    }
}
