//! Sealed-box encryption to a member's X25519 key.
//!
//! Layout: `ephemeral_pub(32) || nonce(12) || ciphertext+tag`.

use aes_gcm::aead::{Aead, KeyInit};
use aes_gcm::{Aes256Gcm, Nonce};
use rand::RngCore;
use rand_core::OsRng;
use sha2::{Digest, Sha256};
use x25519_dalek::{PublicKey, StaticSecret};
use zeroize::Zeroizing;

use crate::error::{AssemblyError, Result};

const SEAL_DOMAIN: &[u8] = b"assembly:sealed_box:v1\0";
const HEADER_LEN: usize = 32 + 12;

fn derive_key(shared: &[u8; 32], ephemeral_public: &[u8; 32], recipient: &[u8; 32]) -> Zeroizing<[u8; 32]> {
    let mut hasher = Sha256::new();
    hasher.update(SEAL_DOMAIN);
    hasher.update(shared);
    hasher.update(ephemeral_public);
    hasher.update(recipient);
    Zeroizing::new(hasher.finalize().into())
}

/// Encrypt `plaintext` so only the holder of the secret behind `recipient` can read it.
pub fn seal(recipient: &PublicKey, plaintext: &[u8]) -> Result<Vec<u8>> {
    // Step 1: fresh ephemeral keypair per message
    let ephemeral_secret = StaticSecret::random_from_rng(OsRng);
    let ephemeral_public = PublicKey::from(&ephemeral_secret);

    // Step 2: ECDH + key derivation
    let shared = ephemeral_secret.diffie_hellman(recipient);
    let key = derive_key(shared.as_bytes(), ephemeral_public.as_bytes(), recipient.as_bytes());

    // Step 3: AES-256-GCM under a random nonce
    let mut nonce_bytes = [0u8; 12];
    OsRng.fill_bytes(&mut nonce_bytes);
    let cipher = Aes256Gcm::new_from_slice(key.as_slice())
        .map_err(|e| AssemblyError::Crypto(format!("Cipher init failed: {e:?}")))?;
    let ciphertext = cipher
        .encrypt(Nonce::from_slice(&nonce_bytes), plaintext)
        .map_err(|e| AssemblyError::Crypto(format!("Encryption failed: {e:?}")))?;

    let mut sealed = Vec::with_capacity(HEADER_LEN + ciphertext.len());
    sealed.extend_from_slice(ephemeral_public.as_bytes());
    sealed.extend_from_slice(&nonce_bytes);
    sealed.extend_from_slice(&ciphertext);
    Ok(sealed)
}

/// Open a sealed box with the recipient's static secret.
pub fn open(secret: &StaticSecret, sealed: &[u8]) -> Result<Vec<u8>> {
    if sealed.len() < HEADER_LEN {
        return Err(AssemblyError::Crypto("Sealed box too short".into()));
    }

    let mut ephemeral_bytes = [0u8; 32];
    ephemeral_bytes.copy_from_slice(&sealed[..32]);
    let nonce_bytes = &sealed[32..HEADER_LEN];
    let ciphertext = &sealed[HEADER_LEN..];

    let ephemeral_public = PublicKey::from(ephemeral_bytes);
    let recipient = PublicKey::from(secret);
    let shared = secret.diffie_hellman(&ephemeral_public);
    let key = derive_key(shared.as_bytes(), &ephemeral_bytes, recipient.as_bytes());

    let cipher = Aes256Gcm::new_from_slice(key.as_slice())
        .map_err(|e| AssemblyError::Crypto(format!("Cipher init failed: {e:?}")))?;
    cipher
        .decrypt(Nonce::from_slice(nonce_bytes), ciphertext)
        .map_err(|_| AssemblyError::Crypto("Sealed box authentication failed".into()))
}
