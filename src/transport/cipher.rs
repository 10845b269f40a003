//! AES-256-GCM cipher for the `encrypted-message` wrapper
//!
//! The key is derived from a shared password with PBKDF2-HMAC-SHA256, so
//! every party configured with the same password, salt and round count can
//! read each other's messages. Cipher text is the base64 encoding of a random
//! 96-bit nonce followed by the sealed bytes.

use super::{BrokerError, MessageCipher};
use crate::config::{BrokerSection, ConfigError};
use aes_gcm::aead::{Aead, AeadCore, KeyInit, OsRng};
use aes_gcm::{Aes256Gcm, Key, Nonce};
use base64::engine::general_purpose::STANDARD;
use base64::Engine;
use sha2::Sha256;
use tracing::info;

const NONCE_LEN: usize = 12;
const KEY_LEN: usize = 32;

pub struct AesGcmCipher {
    cipher: Aes256Gcm,
}

impl AesGcmCipher {
    pub fn from_key(key: &[u8; KEY_LEN]) -> Self {
        Self {
            cipher: Aes256Gcm::new(Key::<Aes256Gcm>::from_slice(&key[..])),
        }
    }

    pub fn from_password(password: &str, salt: &str, rounds: u32) -> Self {
        let mut key = [0u8; KEY_LEN];
        pbkdf2::pbkdf2_hmac::<Sha256>(password.as_bytes(), salt.as_bytes(), rounds, &mut key);
        let cipher = Self::from_key(&key);
        key.fill(0);
        cipher
    }

    /// Cipher for the broker section, `None` while encryption is disabled
    pub fn from_broker_config(broker: &BrokerSection) -> Result<Option<Self>, ConfigError> {
        if !broker.encryption_enabled {
            return Ok(None);
        }
        let password = broker.encryption_password().ok_or_else(|| {
            ConfigError::InvalidConfig(format!(
                "broker.encryption_enabled is set but {} holds no password",
                broker.encryption_password_env.as_deref().unwrap_or("<unset>")
            ))
        })?;
        info!(
            rounds = broker.key_derivation_rounds,
            "Whole-message encryption enabled"
        );
        Ok(Some(Self::from_password(
            &password,
            &broker.encryption_salt,
            broker.key_derivation_rounds,
        )))
    }
}

impl MessageCipher for AesGcmCipher {
    fn encrypt(&self, plain_text: &str) -> Result<String, BrokerError> {
        let nonce = Aes256Gcm::generate_nonce(&mut OsRng);
        let sealed = self
            .cipher
            .encrypt(&nonce, plain_text.as_bytes())
            .map_err(|e| BrokerError::Encrypt(e.to_string()))?;

        let mut bytes = Vec::with_capacity(NONCE_LEN + sealed.len());
        bytes.extend_from_slice(&nonce);
        bytes.extend_from_slice(&sealed);
        Ok(STANDARD.encode(bytes))
    }

    fn decrypt(&self, cipher_text: &str) -> Result<String, BrokerError> {
        let bytes = STANDARD
            .decode(cipher_text.trim())
            .map_err(|e| BrokerError::Decrypt(format!("invalid base64: {e}")))?;
        if bytes.len() <= NONCE_LEN {
            return Err(BrokerError::Decrypt("cipher text too short".to_string()));
        }

        let (nonce, sealed) = bytes.split_at(NONCE_LEN);
        let plain = self
            .cipher
            .decrypt(Nonce::from_slice(nonce), sealed)
            .map_err(|_| BrokerError::Decrypt("authentication failed".to_string()))?;
        String::from_utf8(plain).map_err(|e| BrokerError::Decrypt(e.to_string()))
    }
}
