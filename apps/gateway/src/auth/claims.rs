//! Token validation and claim decryption.
//!
//! The upstream auth service issues an HS256 JWT whose sensitive claims are
//! additionally AES-128-GCM encrypted per field. The AES key is the first
//! 16 bytes of `SHA-256(jwt_key)`; each value is
//! `base64(nonce[12] || ciphertext || tag)`.

use aes_gcm::aead::{Aead, KeyInit};
use aes_gcm::{Aes128Gcm, Nonce};
use base64::engine::general_purpose::STANDARD;
use base64::Engine;
use jsonwebtoken::{Algorithm, DecodingKey, Validation};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};

use crate::models::user::{Database, User};

const NONCE_SIZE: usize = 12;

#[derive(Debug, Serialize, Deserialize)]
pub struct Claims {
    /// Display name of the user.
    pub sub: String,
    /// Encrypted database name.
    pub h_d: String,
    /// Encrypted backend password.
    pub h_p: String,
    /// Encrypted backend login.
    pub h_u: String,
    /// Encrypted workplace tag.
    pub h_ap: String,
    pub exp: i64,
}

/// Validate the given token, including its expiry.
pub fn validate_token(token: &str, key: &[u8]) -> Result<Claims, jsonwebtoken::errors::Error> {
    let validation = Validation::new(Algorithm::HS256);
    jsonwebtoken::decode::<Claims>(token, &DecodingKey::from_secret(key), &validation)
        .map(|data| data.claims)
}

impl Claims {
    /// Decrypt the claim fields into a `User`.
    pub fn to_user(&self, key: &[u8]) -> Result<User, String> {
        let hash = Sha256::digest(key);
        let cipher = Aes128Gcm::new_from_slice(&hash[..16])
            .map_err(|e| format!("failed to build AES cipher: {e}"))?;

        let database_str = decrypt(&cipher, &self.h_d);
        Ok(User {
            username: self.sub.clone(),
            db_password: decrypt(&cipher, &self.h_p),
            db_user: decrypt(&cipher, &self.h_u),
            workplace: decrypt(&cipher, &self.h_ap),
            database: Database::from_upstream(&database_str),
            database_str,
            expiration: self.exp,
        })
    }
}

/// Decrypt a single claim value. Failures degrade to an empty string, the
/// token signature was already checked at this point.
fn decrypt(cipher: &Aes128Gcm, value: &str) -> String {
    let raw = match STANDARD.decode(value) {
        Ok(raw) => raw,
        Err(e) => {
            tracing::warn!(?e, "base64 decoding of claim failed");
            return String::new();
        }
    };

    if raw.len() < NONCE_SIZE {
        tracing::warn!(len = raw.len(), "claim value shorter than the nonce");
        return String::new();
    }

    let nonce = Nonce::from_slice(&raw[..NONCE_SIZE]);
    match cipher.decrypt(nonce, &raw[NONCE_SIZE..]) {
        Ok(plaintext) => String::from_utf8(plaintext).unwrap_or_else(|e| {
            tracing::warn!(?e, "decrypted claim is not valid UTF-8");
            String::new()
        }),
        Err(_) => {
            tracing::warn!("failed to decrypt claim value");
            String::new()
        }
    }
}
