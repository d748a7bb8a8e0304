//! Member identity: private keys (`Me`) and the self-signed, shareable `IdentityProof`.

use ed25519_dalek::{Signer, SigningKey, VerifyingKey};
use rand_core::OsRng;
use serde::{Deserialize, Serialize};
use tracing::debug;
use x25519_dalek::{PublicKey, StaticSecret};
use zeroize::Zeroizing;

use crate::crypto::sealing;
use crate::crypto::signing::{decode_b64_array, encode_b64, verify_signature, verifying_key_from_b64};
use crate::error::{AssemblyError, IntegrityCheck, Result};
use crate::types::Fingerprint;

/// A member's private material. Never sent over the wire.
pub struct Me {
    signing: SigningKey,
    encryption: StaticSecret,
    nickname: String,
    fingerprint: Fingerprint,
}

/// Serializable form of `Me` for the local credential store.
#[derive(Serialize, Deserialize, Clone)]
pub struct MeRecord {
    pub signing_key: String,
    pub encryption_key: String,
    pub nickname: String,
}

impl Me {
    /// Create a fresh signing keypair and an independent encryption keypair.
    pub fn generate(nickname: &str) -> Result<Self> {
        let signing = SigningKey::generate(&mut OsRng);
        let encryption = StaticSecret::random_from_rng(OsRng);
        Self::from_parts(signing, encryption, nickname.to_string())
    }

    fn from_parts(signing: SigningKey, encryption: StaticSecret, nickname: String) -> Result<Self> {
        let verifying = signing.verifying_key();
        if verifying.is_weak() {
            return Err(AssemblyError::KeyGeneration("weak verification key".into()));
        }
        if PublicKey::from(&encryption).as_bytes() == &[0u8; 32] {
            return Err(AssemblyError::KeyGeneration("degenerate encryption key".into()));
        }

        let fingerprint = Fingerprint::of_key(verifying.as_bytes());
        debug!(member = %fingerprint.short(), "Identity loaded");

        Ok(Me { signing, encryption, nickname, fingerprint })
    }

    pub fn fingerprint(&self) -> &Fingerprint {
        &self.fingerprint
    }

    pub fn nickname(&self) -> &str {
        &self.nickname
    }

    pub fn verifying_key(&self) -> VerifyingKey {
        self.signing.verifying_key()
    }

    /// Sign arbitrary bytes; returns the base64 signature.
    pub fn sign(&self, message: &[u8]) -> String {
        encode_b64(&self.signing.sign(message).to_bytes())
    }

    /// Open a sealed box addressed to this member.
    pub fn decrypt(&self, ciphertext: &[u8]) -> Result<Vec<u8>> {
        sealing::open(&self.encryption, ciphertext)
    }

    /// Produce the self-signed binding of fingerprint, encryption key and nickname.
    pub fn identity_proof(&self) -> IdentityProof {
        let encryption_key = PublicKey::from(&self.encryption);

        IdentityProof {
            verification_key: encode_b64(self.signing.verifying_key().as_bytes()),
            fingerprint: self.fingerprint.clone(),
            encryption_key: encode_b64(encryption_key.as_bytes()),
            encryption_key_signature: self.sign(encryption_key.as_bytes()),
            nickname: self.nickname.clone(),
            nickname_signature: self.sign(self.nickname.as_bytes()),
        }
    }

    pub fn to_record(&self) -> MeRecord {
        MeRecord {
            signing_key: encode_b64(&self.signing.to_bytes()),
            encryption_key: encode_b64(&self.encryption.to_bytes()),
            nickname: self.nickname.clone(),
        }
    }

    pub fn from_record(record: &MeRecord) -> Result<Self> {
        let signing_bytes = Zeroizing::new(decode_b64_array::<32>(&record.signing_key)?);
        let encryption_bytes = Zeroizing::new(decode_b64_array::<32>(&record.encryption_key)?);

        Self::from_parts(
            SigningKey::from_bytes(&signing_bytes),
            StaticSecret::from(*encryption_bytes),
            record.nickname.clone(),
        )
    }
}

impl std::fmt::Debug for Me {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Me")
            .field("nickname", &self.nickname)
            .field("fingerprint", &self.fingerprint)
            .finish_non_exhaustive()
    }
}

/// Third-party verifiable binding of a fingerprint to an encryption key and nickname.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct IdentityProof {
    pub verification_key: String,
    pub fingerprint: Fingerprint,
    pub encryption_key: String,
    pub encryption_key_signature: String,
    pub nickname: String,
    pub nickname_signature: String,
}

impl IdentityProof {
    /// Run every check; the error names the first one that failed.
    pub fn is_valid(&self) -> Result<()> {
        let key = verifying_key_from_b64(&self.verification_key)
            .map_err(|_| AssemblyError::Integrity(IntegrityCheck::Fingerprint))?;

        if Fingerprint::of_key(key.as_bytes()) != self.fingerprint {
            return Err(AssemblyError::Integrity(IntegrityCheck::Fingerprint));
        }

        let encryption_key = decode_b64_array::<32>(&self.encryption_key)
            .map_err(|_| AssemblyError::Integrity(IntegrityCheck::EncryptionKeySignature))?;
        verify_signature(&key, &encryption_key, &self.encryption_key_signature)
            .map_err(|_| AssemblyError::Integrity(IntegrityCheck::EncryptionKeySignature))?;

        verify_signature(&key, self.nickname.as_bytes(), &self.nickname_signature)
            .map_err(|_| AssemblyError::Integrity(IntegrityCheck::NicknameSignature))?;

        Ok(())
    }

    /// Check a signature made by this member.
    pub fn verify(&self, message: &[u8], signature: &str) -> Result<()> {
        let key = verifying_key_from_b64(&self.verification_key)?;
        verify_signature(&key, message, signature)
    }

    /// Seal `plaintext` to this member's encryption key.
    pub fn encrypt_for(&self, plaintext: &[u8]) -> Result<Vec<u8>> {
        let key = PublicKey::from(decode_b64_array::<32>(&self.encryption_key)?);
        sealing::seal(&key, plaintext)
    }
}
