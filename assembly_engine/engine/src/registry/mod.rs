/// This module will:
///     Track identity proofs of the members of one assembly
///     Refuse any proof that fails its integrity checks
///     Hand out verification and encryption keys to the harvest protocol

use std::collections::HashMap;
use std::sync::RwLock;

use tracing::{debug, warn};

use crate::error::{AssemblyError, Result};
use crate::identity::IdentityProof;
use crate::types::Fingerprint;

/// Append-only cache of validated identity proofs for one assembly (thread-safe)
pub struct ProofCache {
    assembly_id: String,
    proofs: RwLock<HashMap<Fingerprint, IdentityProof>>,
}

impl ProofCache {
    /// Create a new empty cache scoped to `assembly_id`
    pub fn new(assembly_id: &str) -> Self {
        ProofCache {
            assembly_id: assembly_id.to_string(),
            proofs: RwLock::new(HashMap::new()),
        }
    }

    pub fn assembly_id(&self) -> &str {
        &self.assembly_id
    }

    /// Validate and cache a peer proof. Returns true if it was new.
    ///
    /// The first valid proof for a fingerprint wins; later ones are ignored.
    pub fn insert(&self, proof: IdentityProof) -> Result<bool> {
        if let Err(e) = proof.is_valid() {
            warn!(member = %proof.fingerprint.short(), "Rejected identity proof: {e}");
            return Err(e);
        }

        let mut proofs = self
            .proofs
            .write()
            .map_err(|_| AssemblyError::Internal("Proof cache lock poisoned".into()))?;
        if proofs.contains_key(&proof.fingerprint) {
            return Ok(false);
        }

        debug!(member = %proof.fingerprint.short(), nickname = %proof.nickname, "Cached identity proof");
        proofs.insert(proof.fingerprint.clone(), proof);
        Ok(true)
    }

    /// Get the proof for a member, if we have one
    pub fn get(&self, member: &Fingerprint) -> Option<IdentityProof> {
        self.proofs.read().ok()?.get(member).cloned()
    }

    pub fn contains(&self, member: &Fingerprint) -> bool {
        self.proofs.read().map_or(false, |p| p.contains_key(member))
    }

    /// Like `get`, but a missing proof is an error.
    pub fn require(&self, member: &Fingerprint) -> Result<IdentityProof> {
        self.get(member)
            .ok_or_else(|| AssemblyError::Crypto(format!("No identity proof for {member}")))
    }

    pub fn all(&self) -> Vec<IdentityProof> {
        self.proofs
            .read()
            .map(|p| p.values().cloned().collect())
            .unwrap_or_default()
    }

    pub fn len(&self) -> usize {
        self.proofs.read().map_or(0, |p| p.len())
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}
