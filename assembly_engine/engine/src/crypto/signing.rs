//! Ed25519 signature helpers and the base64 wire encoding used for keys and signatures.

use base64::Engine as _;
use base64::engine::general_purpose::STANDARD;
use ed25519_dalek::{Signature, Verifier, VerifyingKey};

use crate::error::{AssemblyError, Result};

pub fn encode_b64(bytes: &[u8]) -> String {
    STANDARD.encode(bytes)
}

pub fn decode_b64(encoded: &str) -> Result<Vec<u8>> {
    STANDARD
        .decode(encoded)
        .map_err(|e| AssemblyError::Crypto(format!("Invalid base64: {e}")))
}

/// Decode exactly `N` bytes of base64.
pub fn decode_b64_array<const N: usize>(encoded: &str) -> Result<[u8; N]> {
    let bytes = decode_b64(encoded)?;
    let len = bytes.len();
    bytes
        .try_into()
        .map_err(|_| AssemblyError::Crypto(format!("Expected {N} bytes, got {len}")))
}

pub fn verifying_key_from_b64(encoded: &str) -> Result<VerifyingKey> {
    let bytes = decode_b64_array::<32>(encoded)?;
    VerifyingKey::from_bytes(&bytes)
        .map_err(|e| AssemblyError::Crypto(format!("Invalid public key: {e:?}")))
}

pub fn signature_from_b64(encoded: &str) -> Result<Signature> {
    let bytes = decode_b64_array::<64>(encoded)?;
    Ok(Signature::from_bytes(&bytes))
}

/// Verify a base64 signature against a message and verification key.
pub fn verify_signature(key: &VerifyingKey, message: &[u8], signature_b64: &str) -> Result<()> {
    let signature = signature_from_b64(signature_b64)?;

    key.verify(message, &signature)
        .map_err(|e| AssemblyError::Crypto(format!("Signature verification failed: {e:?}")))
}
