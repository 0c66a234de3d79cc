mod proxy_resolver;
mod resolver;

pub use proxy_resolver::{ProxyResolution, ProxyResolver};
pub use resolver::Resolver;

use base64::engine::general_purpose::URL_SAFE_NO_PAD;
use base64::Engine as _;
use rand::rngs::OsRng;
use rand::RngCore;
use sha2::{Digest, Sha256};

/// Prefix for operator keys.
pub const OPERATOR_KEY_PREFIX: &str = "mdm_sk_";
/// Prefix for proxy keys.
pub const PROXY_KEY_PREFIX: &str = "mdm_pk_";

const KEY_RANDOM_BYTES: usize = 32;

/// Generates a fresh operator key. Returns `(plaintext, digest)`; the
/// plaintext is shown once and only the digest is persisted.
pub fn generate_operator_key() -> (String, String) {
    generate_key(OPERATOR_KEY_PREFIX)
}

/// Generates a fresh proxy key. Returns `(plaintext, digest)`.
pub fn generate_proxy_key() -> (String, String) {
    generate_key(PROXY_KEY_PREFIX)
}

fn generate_key(prefix: &str) -> (String, String) {
    let mut bytes = [0u8; KEY_RANDOM_BYTES];
    OsRng.fill_bytes(&mut bytes);
    let plaintext = format!("{prefix}{}", URL_SAFE_NO_PAD.encode(bytes));
    let digest = hash_key(&plaintext);
    (plaintext, digest)
}

/// Hex SHA-256 of a secret string. Used wherever a secret's digest is
/// persisted, including the hashed upstream `Authorization` header.
pub fn hash_key(key: &str) -> String {
    let digest = Sha256::digest(key.as_bytes());
    let mut out = String::with_capacity(digest.len() * 2);
    for byte in digest {
        out.push_str(&format!("{byte:02x}"));
    }
    out
}
