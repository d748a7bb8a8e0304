use std::collections::BTreeMap;
use std::sync::RwLock;

use aes_gcm::aead::{Aead, KeyInit};
use aes_gcm::{Aes256Gcm, Nonce};
use rand::RngCore;
use zeroize::Zeroizing;

use crate::error::{AssemblyError, Result};
use crate::store::backend::StoreBackend;

/// Sealed record blob, encrypted using AES-GCM
struct SealedBlob {
    ciphertext: Vec<u8>,
    nonce: [u8; 12],
}

/// Backend that keeps every record sealed under a key that never leaves memory.
pub struct SealedBackend {
    store: RwLock<BTreeMap<String, SealedBlob>>,
    cipher: Aes256Gcm,
}

impl SealedBackend {
    pub fn new() -> Result<Self> {
        let mut key = Zeroizing::new([0u8; 32]);
        rand::thread_rng().fill_bytes(&mut key[..]);
        Self::with_key(&key)
    }

    /// Use a caller-provided 32-byte sealing key.
    pub fn with_key(key: &[u8; 32]) -> Result<Self> {
        let cipher = Aes256Gcm::new_from_slice(key)
            .map_err(|e| AssemblyError::Storage(format!("Cipher init failed: {e:?}")))?;

        Ok(SealedBackend {
            store: RwLock::new(BTreeMap::new()),
            cipher,
        })
    }
}

fn poisoned() -> AssemblyError {
    AssemblyError::Storage("Store lock poisoned".into())
}

impl StoreBackend for SealedBackend {
    fn store_record(&self, key: &str, value: &[u8]) -> Result<()> {
        let mut nonce_bytes = [0u8; 12];
        rand::thread_rng().fill_bytes(&mut nonce_bytes);
        let nonce = Nonce::from_slice(&nonce_bytes);

        // bind the ciphertext to its key so blobs cannot be swapped between entries
        let ciphertext = self
            .cipher
            .encrypt(nonce, aes_gcm::aead::Payload { msg: value, aad: key.as_bytes() })
            .map_err(|e| AssemblyError::Storage(format!("Encryption failed: {e:?}")))?;

        let blob = SealedBlob { ciphertext, nonce: nonce_bytes };
        self.store.write().map_err(|_| poisoned())?.insert(key.to_string(), blob);
        Ok(())
    }

    fn load_record(&self, key: &str) -> Result<Option<Vec<u8>>> {
        let store = self.store.read().map_err(|_| poisoned())?;
        let Some(blob) = store.get(key) else {
            return Ok(None);
        };

        let nonce = Nonce::from_slice(&blob.nonce);
        let plaintext = self
            .cipher
            .decrypt(nonce, aes_gcm::aead::Payload { msg: &blob.ciphertext, aad: key.as_bytes() })
            .map_err(|e| AssemblyError::Storage(format!("Decryption failed: {e:?}")))?;
        Ok(Some(plaintext))
    }

    fn remove_record(&self, key: &str) -> Result<()> {
        self.store.write().map_err(|_| poisoned())?.remove(key);
        Ok(())
    }

    fn keys_with_prefix(&self, prefix: &str) -> Result<Vec<String>> {
        let store = self.store.read().map_err(|_| poisoned())?;
        Ok(store.keys().filter(|k| k.starts_with(prefix)).cloned().collect())
    }
}
