use aes_gcm::aead::Aead;
use aes_gcm::{Aes256Gcm, Key, KeyInit, Nonce};
use base64::engine::general_purpose::{STANDARD, STANDARD_NO_PAD};
use base64::Engine as _;
use rand::rngs::OsRng;
use rand::RngCore;
use thiserror::Error;

const MASTER_KEY_LEN: usize = 32;
const NONCE_LEN: usize = 12;

#[derive(Debug, Error)]
pub enum SecretBoxError {
    #[error("encryption key is required")]
    MissingKey,
    #[error("encryption key must be 32 bytes, provide as 64-char hex or base64")]
    InvalidKey,
    #[error("failed to decrypt secret")]
    CipherFail,
}

/// Symmetric authenticated encryption for stored upstream credentials.
///
/// Tokens are `base64(nonce ∥ AES-256-GCM ciphertext)` with a fresh random
/// nonce per call, so encrypting the same plaintext twice yields different
/// tokens. Tampered or truncated tokens fail to decrypt.
#[derive(Clone)]
pub struct SecretBox {
    key: [u8; MASTER_KEY_LEN],
}

impl SecretBox {
    /// Builds the box from the configured master key, accepted as 64 hex
    /// chars or standard/raw base64 of exactly 32 octets.
    pub fn new(master_key: &str) -> Result<Self, SecretBoxError> {
        let master_key = master_key.trim();
        if master_key.is_empty() {
            return Err(SecretBoxError::MissingKey);
        }
        let bytes = decode_master_key(master_key).ok_or(SecretBoxError::InvalidKey)?;
        let mut key = [0u8; MASTER_KEY_LEN];
        key.copy_from_slice(&bytes);
        Ok(Self { key })
    }

    pub fn encrypt(&self, plaintext: &str) -> Result<String, SecretBoxError> {
        let cipher = Aes256Gcm::new(Key::<Aes256Gcm>::from_slice(&self.key));
        let mut nonce = [0u8; NONCE_LEN];
        OsRng.fill_bytes(&mut nonce);

        let ciphertext = cipher
            .encrypt(Nonce::from_slice(&nonce), plaintext.as_bytes())
            .map_err(|_| SecretBoxError::CipherFail)?;

        let mut token = Vec::with_capacity(NONCE_LEN + ciphertext.len());
        token.extend_from_slice(&nonce);
        token.extend_from_slice(&ciphertext);
        Ok(STANDARD.encode(token))
    }

    pub fn decrypt(&self, token: &str) -> Result<String, SecretBoxError> {
        let data = STANDARD
            .decode(token)
            .map_err(|_| SecretBoxError::CipherFail)?;
        if data.len() < NONCE_LEN {
            return Err(SecretBoxError::CipherFail);
        }
        let (nonce, ciphertext) = data.split_at(NONCE_LEN);

        let cipher = Aes256Gcm::new(Key::<Aes256Gcm>::from_slice(&self.key));
        let plaintext = cipher
            .decrypt(Nonce::from_slice(nonce), ciphertext)
            .map_err(|_| SecretBoxError::CipherFail)?;
        String::from_utf8(plaintext).map_err(|_| SecretBoxError::CipherFail)
    }
}

fn decode_master_key(raw: &str) -> Option<Vec<u8>> {
    if raw.len() == MASTER_KEY_LEN * 2 {
        if let Ok(bytes) = hex_decode(raw) {
            return Some(bytes);
        }
    }
    for engine in [&STANDARD, &STANDARD_NO_PAD] {
        if let Ok(bytes) = engine.decode(raw) {
            if bytes.len() == MASTER_KEY_LEN {
                return Some(bytes);
            }
        }
    }
    None
}

fn hex_decode(raw: &str) -> Result<Vec<u8>, ()> {
    if raw.len() % 2 != 0 {
        return Err(());
    }
    raw.as_bytes()
        .chunks(2)
        .map(|pair| {
            let high = hex_nibble(pair[0])?;
            let low = hex_nibble(pair[1])?;
            Ok(high << 4 | low)
        })
        .collect()
}

fn hex_nibble(c: u8) -> Result<u8, ()> {
    match c {
        b'0'..=b'9' => Ok(c - b'0'),
        b'a'..=b'f' => Ok(c - b'a' + 10),
        b'A'..=b'F' => Ok(c - b'A' + 10),
        _ => Err(()),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn hex_key() -> String {
        "00".repeat(16) + &"ff".repeat(16)
    }

    #[test]
    fn round_trips_plaintext() {
        let sbox = SecretBox::new(&hex_key()).expect("box");
        let token = sbox.encrypt("sk-upstream-credential").expect("encrypt");
        assert_eq!(sbox.decrypt(&token).expect("decrypt"), "sk-upstream-credential");
    }

    #[test]
    fn nonces_are_unique_per_call() {
        let sbox = SecretBox::new(&hex_key()).expect("box");
        let first = sbox.encrypt("same plaintext").expect("encrypt");
        let second = sbox.encrypt("same plaintext").expect("encrypt");
        assert_ne!(first, second);
        assert_eq!(sbox.decrypt(&first).expect("decrypt"), "same plaintext");
        assert_eq!(sbox.decrypt(&second).expect("decrypt"), "same plaintext");
    }

    #[test]
    fn accepts_base64_master_keys() {
        let key_bytes = [7u8; 32];
        let padded = STANDARD.encode(key_bytes);
        let raw = STANDARD_NO_PAD.encode(key_bytes);
        for encoded in [padded, raw] {
            let sbox = SecretBox::new(&encoded).expect("box");
            let token = sbox.encrypt("value").expect("encrypt");
            assert_eq!(sbox.decrypt(&token).expect("decrypt"), "value");
        }
    }

    #[test]
    fn rejects_bad_master_keys() {
        assert!(matches!(SecretBox::new(""), Err(SecretBoxError::MissingKey)));
        assert!(matches!(SecretBox::new("too-short"), Err(SecretBoxError::InvalidKey)));
        assert!(matches!(
            SecretBox::new(&"zz".repeat(32)),
            Err(SecretBoxError::InvalidKey)
        ));
        // 31 bytes of base64 is well-formed but the wrong width.
        assert!(matches!(
            SecretBox::new(&STANDARD.encode([1u8; 31])),
            Err(SecretBoxError::InvalidKey)
        ));
    }

    #[test]
    fn tampered_tokens_fail() {
        let sbox = SecretBox::new(&hex_key()).expect("box");
        let token = sbox.encrypt("secret").expect("encrypt");

        let mut data = STANDARD.decode(&token).expect("decode");
        let last = data.len() - 1;
        data[last] ^= 0x01;
        let tampered = STANDARD.encode(&data);
        assert!(matches!(sbox.decrypt(&tampered), Err(SecretBoxError::CipherFail)));

        assert!(matches!(sbox.decrypt("not base64 !!"), Err(SecretBoxError::CipherFail)));
        assert!(matches!(sbox.decrypt("AAAA"), Err(SecretBoxError::CipherFail)));
    }

    #[test]
    fn decrypts_tokens_from_a_second_box_with_the_same_key() {
        let first = SecretBox::new(&hex_key()).expect("box");
        let second = SecretBox::new(&hex_key()).expect("box");
        let token = first.encrypt("shared").expect("encrypt");
        assert_eq!(second.decrypt(&token).expect("decrypt"), "shared");
    }
}
