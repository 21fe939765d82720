//! Decryption of stored certificate material.
//!
//! Certificates, private keys and key passwords are persisted as
//! `nonce_b64:ciphertext_b64` AES-256-GCM payloads; the 12-byte random nonce
//! is generated at encryption time. The symmetric key is supplied from the
//! environment and the decrypted material only lives for the duration of a
//! single event's processing.
use aes_gcm::aead::{Aead, AeadCore, KeyInit, OsRng};
use aes_gcm::{Aes256Gcm, Nonce};
use base64ct::{Base64, Encoding};
use thiserror::Error;

const NONCE_LEN: usize = 12;

#[derive(Debug, Error, PartialEq, Eq)]
pub enum SecretsError {
    #[error("encryption key must be 32 bytes of base64")]
    BadKey,
    #[error("malformed encrypted payload")]
    BadPayload,
    #[error("decryption failed")]
    Decrypt,
}

/// Decrypted signing credentials for one dispatch. Never cached.
#[derive(Clone)]
pub struct CertificateMaterial {
    pub cert_pem: String,
    pub key_pem: String,
    pub key_password: Option<String>,
}

impl std::fmt::Debug for CertificateMaterial {
    // Key material must never end up in logs.
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CertificateMaterial")
            .field("cert_pem", &"<redacted>")
            .field("key_pem", &"<redacted>")
            .field("key_password", &self.key_password.as_ref().map(|_| "<redacted>"))
            .finish()
    }
}

fn cipher_for(key_b64: &str) -> Result<Aes256Gcm, SecretsError> {
    let key = Base64::decode_vec(key_b64).map_err(|_| SecretsError::BadKey)?;
    if key.len() != 32 {
        return Err(SecretsError::BadKey);
    }
    Aes256Gcm::new_from_slice(&key).map_err(|_| SecretsError::BadKey)
}

/// Decrypt one `nonce:ciphertext` column value.
pub fn decrypt_field(payload: &str, key_b64: &str) -> Result<String, SecretsError> {
    let cipher = cipher_for(key_b64)?;
    let (nonce_b64, ciphertext_b64) = payload.split_once(':').ok_or(SecretsError::BadPayload)?;
    let nonce = Base64::decode_vec(nonce_b64).map_err(|_| SecretsError::BadPayload)?;
    if nonce.len() != NONCE_LEN {
        return Err(SecretsError::BadPayload);
    }
    let ciphertext = Base64::decode_vec(ciphertext_b64).map_err(|_| SecretsError::BadPayload)?;

    let plain = cipher
        .decrypt(Nonce::from_slice(&nonce), ciphertext.as_ref())
        .map_err(|_| SecretsError::Decrypt)?;
    String::from_utf8(plain).map_err(|_| SecretsError::Decrypt)
}

/// Encrypt a value into the `nonce:ciphertext` column format.
pub fn encrypt_field(plain: &str, key_b64: &str) -> Result<String, SecretsError> {
    let cipher = cipher_for(key_b64)?;
    let nonce = Aes256Gcm::generate_nonce(&mut OsRng);
    let ciphertext = cipher
        .encrypt(&nonce, plain.as_bytes())
        .map_err(|_| SecretsError::Decrypt)?;
    Ok(format!(
        "{}:{}",
        Base64::encode_string(&nonce),
        Base64::encode_string(&ciphertext)
    ))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn key() -> String {
        Base64::encode_string(&[7u8; 32])
    }

    #[test]
    fn round_trips_certificate_material() {
        let pem = "-----BEGIN CERTIFICATE-----\nMIIB\n-----END CERTIFICATE-----";
        let encrypted = encrypt_field(pem, &key()).expect("encrypt");
        assert!(encrypted.contains(':'));
        let decrypted = decrypt_field(&encrypted, &key()).expect("decrypt");
        assert_eq!(decrypted, pem);
    }

    #[test]
    fn tampered_ciphertext_fails_authentication() {
        let encrypted = encrypt_field("secret", &key()).expect("encrypt");
        let (nonce, ct) = encrypted.split_once(':').unwrap();
        let mut bytes = Base64::decode_vec(ct).unwrap();
        bytes[0] ^= 0xFF;
        let tampered = format!("{nonce}:{}", Base64::encode_string(&bytes));
        assert_eq!(decrypt_field(&tampered, &key()), Err(SecretsError::Decrypt));
    }

    #[test]
    fn wrong_key_fails_authentication() {
        let encrypted = encrypt_field("secret", &key()).expect("encrypt");
        let other = Base64::encode_string(&[9u8; 32]);
        assert_eq!(decrypt_field(&encrypted, &other), Err(SecretsError::Decrypt));
    }

    #[test]
    fn malformed_payloads_are_rejected() {
        assert_eq!(
            decrypt_field("no-separator", &key()),
            Err(SecretsError::BadPayload)
        );
        assert_eq!(
            decrypt_field("short:abcd", &key()),
            Err(SecretsError::BadPayload)
        );
        assert_eq!(
            decrypt_field("a:b", "not base64!"),
            Err(SecretsError::BadKey)
        );
    }
}
