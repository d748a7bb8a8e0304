use std::sync::Arc;

use crate::identity::Me;
use crate::registry::ProofCache;

mod config_tests;
mod harvest_state_tests;
mod session_flow_tests;
mod store_tests;

/// `count` fresh members, sorted by fingerprint so index i is participant i.
pub(crate) fn members(count: usize) -> Vec<Arc<Me>> {
    let mut members: Vec<Arc<Me>> = (0..count)
        .map(|i| Arc::new(Me::generate(&format!("member-{i}")).unwrap()))
        .collect();
    members.sort_by(|a, b| a.fingerprint().cmp(b.fingerprint()));
    members
}

pub(crate) fn cache_for(assembly_id: &str, members: &[Arc<Me>]) -> ProofCache {
    let cache = ProofCache::new(assembly_id);
    for member in members {
        cache.insert(member.identity_proof()).unwrap();
    }
    cache
}
