use aes_gcm::aead::generic_array::typenum::U16;
use aes_gcm::aead::generic_array::GenericArray;
use aes_gcm::aead::{Aead, KeyInit};
use aes_gcm::aes::Aes256;
use aes_gcm::AesGcm;
use base64::Engine as _;
use rand::RngCore;

use crate::error::IngestError;

/// AES-256-GCM with a 16-byte nonce. The nonce size and the envelope layout
/// below are frozen: every credential persisted since launch uses them.
type TokenCipher = AesGcm<Aes256, U16>;

const NONCE_LEN: usize = 16;
const TAG_LEN: usize = 16;

/// Seals and opens token material at rest.
///
/// Envelope layout: `base64(nonce(16) || tag(16) || ciphertext)`.
/// Only the token broker talks to the vault; fetchers receive bare bearer
/// strings and never see the storage representation.
pub struct CredentialVault {
    cipher: TokenCipher,
}

impl CredentialVault {
    /// Derive the cipher key from the process-wide secret.
    ///
    /// The secret's UTF-8 bytes are truncated to 32 bytes when longer and
    /// zero-padded when shorter. Frozen policy: envelopes sealed under the
    /// padded form of a short secret must stay readable.
    pub fn new(secret: &str) -> Self {
        let mut key = [0u8; 32];
        let bytes = secret.as_bytes();
        let n = bytes.len().min(32);
        key[..n].copy_from_slice(&bytes[..n]);

        Self {
            cipher: TokenCipher::new(GenericArray::from_slice(&key)),
        }
    }

    /// Encrypt a token string into an opaque envelope. Fresh random nonce per
    /// call, never reused.
    pub fn seal(&self, plaintext: &str) -> Result<String, IngestError> {
        let mut nonce_bytes = [0u8; NONCE_LEN];
        rand::thread_rng().fill_bytes(&mut nonce_bytes);
        let nonce = GenericArray::from_slice(&nonce_bytes);

        let sealed = self
            .cipher
            .encrypt(nonce, plaintext.as_bytes())
            .map_err(|e| IngestError::Integrity(format!("Encryption failed: {e}")))?;

        // The cipher emits ciphertext || tag; the envelope stores tag first.
        let (ciphertext, tag) = sealed.split_at(sealed.len() - TAG_LEN);

        let mut envelope = Vec::with_capacity(NONCE_LEN + sealed.len());
        envelope.extend_from_slice(&nonce_bytes);
        envelope.extend_from_slice(tag);
        envelope.extend_from_slice(ciphertext);

        Ok(base64::engine::general_purpose::STANDARD.encode(&envelope))
    }

    /// Decrypt an envelope back to the token string.
    ///
    /// Any malformed or tampered input surfaces as `Integrity` — a failed tag
    /// check never yields corrupted plaintext.
    pub fn open(&self, envelope: &str) -> Result<String, IngestError> {
        let blob = base64::engine::general_purpose::STANDARD
            .decode(envelope)
            .map_err(|e| IngestError::Integrity(format!("Invalid envelope base64: {e}")))?;

        if blob.len() < NONCE_LEN + TAG_LEN {
            return Err(IngestError::Integrity("Envelope too short".into()));
        }

        let (nonce_bytes, rest) = blob.split_at(NONCE_LEN);
        let (tag, ciphertext) = rest.split_at(TAG_LEN);

        let mut sealed = Vec::with_capacity(rest.len());
        sealed.extend_from_slice(ciphertext);
        sealed.extend_from_slice(tag);

        let plaintext = self
            .cipher
            .decrypt(GenericArray::from_slice(nonce_bytes), sealed.as_ref())
            .map_err(|_| IngestError::Integrity("Envelope tag verification failed".into()))?;

        String::from_utf8(plaintext)
            .map_err(|e| IngestError::Integrity(format!("Invalid UTF-8 after decrypt: {e}")))
    }
}
