use aes_gcm::{
    aead::{Aead, KeyInit, OsRng},
    Aes256Gcm, Nonce,
};
use aes_gcm::aead::generic_array::GenericArray;
use base64::{engine::general_purpose::STANDARD as BASE64, Engine as _};

use crate::config::Config;

const NONCE_SIZE: usize = 12;

/// AES-256-GCM at-rest encryption for provider credentials (SMTP passwords,
/// provider tokens). Stored format: nonce || ciphertext, with the key id
/// persisted next to the blob for rotation.
pub struct EncryptionService {
    cipher: Aes256Gcm,
    key_id: String,
}

impl EncryptionService {
    pub fn from_config(config: &Config) -> Result<Self, String> {
        let key_str = config
            .encryption_key
            .as_deref()
            .ok_or("ENCRYPTION_KEY not configured")?;

        let key_bytes = BASE64
            .decode(key_str)
            .map_err(|e| format!("Invalid ENCRYPTION_KEY format: {}", e))?;

        let key_id = std::env::var("ENCRYPTION_KEY_ID")
            .unwrap_or_else(|_| "default-key-v1".to_string());

        Self::new_with_key(&key_bytes, &key_id)
    }

    pub fn new_with_key(key_bytes: &[u8], key_id: &str) -> Result<Self, String> {
        if key_bytes.len() != 32 {
            return Err("Encryption key must be 32 bytes (256 bits) when decoded".to_string());
        }

        let key = GenericArray::from_slice(key_bytes);
        Ok(Self {
            cipher: Aes256Gcm::new(key),
            key_id: key_id.to_string(),
        })
    }

    pub fn encrypt(&self, plaintext: &str) -> Result<(Vec<u8>, String), String> {
        use rand::RngCore;

        let mut nonce_bytes = [0u8; NONCE_SIZE];
        OsRng.fill_bytes(&mut nonce_bytes);
        let nonce = Nonce::from_slice(&nonce_bytes);

        let ciphertext = self
            .cipher
            .encrypt(nonce, plaintext.as_bytes())
            .map_err(|e| format!("Encryption failed: {}", e))?;

        let mut blob = nonce_bytes.to_vec();
        blob.extend(ciphertext);
        Ok((blob, self.key_id.clone()))
    }

    pub fn decrypt(&self, blob: &[u8]) -> Result<String, String> {
        if blob.len() < NONCE_SIZE {
            return Err("Encrypted blob too short".to_string());
        }

        let (nonce_bytes, ciphertext) = blob.split_at(NONCE_SIZE);
        let plaintext = self
            .cipher
            .decrypt(Nonce::from_slice(nonce_bytes), ciphertext)
            .map_err(|e| format!("Decryption failed: {}", e))?;

        String::from_utf8(plaintext).map_err(|e| format!("Invalid UTF-8 in decrypted data: {}", e))
    }

    pub fn key_id(&self) -> &str {
        &self.key_id
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_encrypt_decrypt_roundtrip() {
        let service = EncryptionService::new_with_key(&[7u8; 32], "test-key").unwrap();

        let (blob, key_id) = service.encrypt("smtp-secret").unwrap();
        assert_eq!(key_id, "test-key");
        assert_ne!(blob, b"smtp-secret".to_vec());

        assert_eq!(service.decrypt(&blob).unwrap(), "smtp-secret");
    }

    #[test]
    fn test_rejects_short_key_and_blob() {
        assert!(EncryptionService::new_with_key(&[0u8; 16], "short").is_err());

        let service = EncryptionService::new_with_key(&[7u8; 32], "test-key").unwrap();
        assert!(service.decrypt(&[1, 2, 3]).is_err());
    }
}
