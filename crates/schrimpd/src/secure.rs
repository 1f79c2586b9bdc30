//! Optional transport encryption for broadcast payloads.
//!
//! One symmetric cipher per process, derived once from the configured
//! passphrase with PBKDF2-HMAC-SHA256 and used by every session. The salt is
//! fixed so that independently configured clients derive the same key from
//! the same passphrase; see DESIGN.md for why that is a precomputation
//! weakness we keep anyway.
//!
//! Wire form of an encrypted line: `base64(nonce || ciphertext)`.

use base64::Engine as _;
use base64::engine::general_purpose::STANDARD as B64;
use chacha20poly1305::aead::{Aead, KeyInit, OsRng};
use chacha20poly1305::{ChaCha20Poly1305, Nonce};
use rand::RngCore;
use sha2::Sha256;
use zeroize::Zeroize;

// Fixed salt shared by all deployments speaking this protocol.
const KDF_SALT: &[u8] = b"schrimp_salt_2025";
const KDF_ROUNDS: u32 = 100_000;
const NONCE_LEN: usize = 12;

pub struct EncryptionContext {
    cipher: ChaCha20Poly1305,
}

impl std::fmt::Debug for EncryptionContext {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("EncryptionContext").finish_non_exhaustive()
    }
}

impl EncryptionContext {
    pub fn new(passphrase: &str) -> Self {
        let mut key = [0u8; 32];
        pbkdf2::pbkdf2_hmac::<Sha256>(passphrase.as_bytes(), KDF_SALT, KDF_ROUNDS, &mut key);
        let cipher = ChaCha20Poly1305::new(&key.into());
        key.zeroize();
        Self { cipher }
    }

    pub fn encrypt(&self, text: &str) -> String {
        let mut nonce_bytes = [0u8; NONCE_LEN];
        OsRng.fill_bytes(&mut nonce_bytes);
        let nonce = Nonce::from_slice(&nonce_bytes);

        match self.cipher.encrypt(nonce, text.as_bytes()) {
            Ok(ct) => {
                let mut payload = Vec::with_capacity(NONCE_LEN + ct.len());
                payload.extend_from_slice(&nonce_bytes);
                payload.extend_from_slice(&ct);
                B64.encode(payload)
            }
            // ChaCha20-Poly1305 sealing cannot fail on in-memory inputs; fall
            // back to plaintext rather than dropping the line if it ever does.
            Err(_) => text.to_string(),
        }
    }

    /// Lenient decrypt: anything that is not one of our payloads is passed
    /// through unchanged and treated as already-plaintext.
    pub fn decrypt(&self, line: &str) -> String {
        let Ok(raw) = B64.decode(line.trim()) else {
            return line.to_string();
        };
        if raw.len() <= NONCE_LEN {
            return line.to_string();
        }

        let (nonce_bytes, ct) = raw.split_at(NONCE_LEN);
        let nonce = Nonce::from_slice(nonce_bytes);
        match self.cipher.decrypt(nonce, ct) {
            Ok(pt) => String::from_utf8(pt).unwrap_or_else(|_| line.to_string()),
            Err(_) => line.to_string(),
        }
    }
}
