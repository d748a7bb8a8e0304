//! Local persistence of credentials and peer identity proofs.
//! The backend is pluggable; records are JSON.

pub mod backend;

use std::sync::Arc;

use tracing::{debug, warn};
use zeroize::Zeroizing;

use crate::error::Result;
use crate::identity::IdentityProof;
use crate::membership::{Membership, MembershipRecord};
use crate::registry::ProofCache;
use crate::store::backend::StoreBackend;

pub use backend::memory::MemoryBackend;
pub use backend::sealed::SealedBackend;

const MEMBERSHIP_KEY: &str = "membership/last";

fn proof_prefix(assembly_id: &str) -> String {
    format!("proofs/{assembly_id}/")
}

#[derive(Clone)]
pub struct CredentialStore {
    backend: Arc<dyn StoreBackend>,
}

impl CredentialStore {
    pub fn new(backend: Arc<dyn StoreBackend>) -> Self {
        CredentialStore { backend }
    }

    pub fn in_memory() -> Self {
        Self::new(Arc::new(MemoryBackend::new()))
    }

    /// Remember the membership used last.
    pub fn save_membership(&self, membership: &Membership) -> Result<()> {
        let raw = Zeroizing::new(serde_json::to_vec(&membership.to_record())?);
        self.backend.store_record(MEMBERSHIP_KEY, &raw)
    }

    pub fn load_membership(&self) -> Result<Option<Membership>> {
        let Some(raw) = self.backend.load_record(MEMBERSHIP_KEY)? else {
            return Ok(None);
        };
        let raw = Zeroizing::new(raw);
        let record: MembershipRecord = serde_json::from_slice(&raw)?;
        Membership::from_record(&record).map(Some)
    }

    /// Abandon the membership: forget the keys and every cached proof of that assembly.
    pub fn forget_membership(&self, membership: &Membership) -> Result<()> {
        for key in self.backend.keys_with_prefix(&proof_prefix(&membership.assembly.id))? {
            self.backend.remove_record(&key)?;
        }
        self.backend.remove_record(MEMBERSHIP_KEY)
    }

    pub fn save_proof(&self, assembly_id: &str, proof: &IdentityProof) -> Result<()> {
        let key = format!("{}{}", proof_prefix(assembly_id), proof.fingerprint);
        self.backend.store_record(&key, &serde_json::to_vec(proof)?)
    }

    pub fn save_proofs(&self, cache: &ProofCache) -> Result<()> {
        for proof in cache.all() {
            self.save_proof(cache.assembly_id(), &proof)?;
        }
        Ok(())
    }

    /// Rebuild the proof cache of one assembly; proofs failing validation are dropped.
    pub fn load_proofs(&self, assembly_id: &str) -> Result<ProofCache> {
        let cache = ProofCache::new(assembly_id);
        for key in self.backend.keys_with_prefix(&proof_prefix(assembly_id))? {
            let Some(raw) = self.backend.load_record(&key)? else {
                continue;
            };
            let proof: IdentityProof = serde_json::from_slice(&raw)?;
            if let Err(e) = cache.insert(proof) {
                warn!(%key, "Dropping stored proof: {e}");
            }
        }
        debug!(assembly = %assembly_id, proofs = cache.len(), "Proof cache loaded");
        Ok(cache)
    }
}
