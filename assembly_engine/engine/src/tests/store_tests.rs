use std::sync::Arc;

use assert_matches::assert_matches;

use crate::error::AssemblyError;
use crate::membership::{AssemblyDescriptor, Membership};
use crate::store::backend::StoreBackend;
use crate::store::{CredentialStore, SealedBackend};
use crate::tests::{cache_for, members};

fn descriptor() -> AssemblyDescriptor {
    AssemblyDescriptor { id: "assembly-1".into(), secret: "s3cret".into(), name: "Tenants".into() }
}

fn sealed_store() -> CredentialStore {
    CredentialStore::new(Arc::new(SealedBackend::new().unwrap()))
}

#[test]
fn test_membership_survives_store_round_trip() {
    let store = sealed_store();
    assert!(store.load_membership().unwrap().is_none());

    let membership = Membership::create(descriptor(), "alice").unwrap();
    store.save_membership(&membership).unwrap();

    let loaded = store.load_membership().unwrap().unwrap();
    assert_eq!(loaded.assembly, membership.assembly);
    assert_eq!(loaded.me.fingerprint(), membership.me.fingerprint());
    assert_eq!(loaded.me.nickname(), "alice");
}

#[test]
fn test_proofs_reload_per_assembly() {
    let store = CredentialStore::in_memory();
    let everyone = members(3);
    store.save_proofs(&cache_for("assembly-1", &everyone)).unwrap();

    let reloaded = store.load_proofs("assembly-1").unwrap();
    assert_eq!(reloaded.len(), 3);
    assert!(everyone.iter().all(|m| reloaded.contains(m.fingerprint())));
    assert!(store.load_proofs("assembly-2").unwrap().is_empty());
}

#[test]
fn test_forget_membership_drops_keys_and_proofs() {
    let store = CredentialStore::in_memory();
    let membership = Membership::create(descriptor(), "alice").unwrap();
    store.save_membership(&membership).unwrap();
    store.save_proof("assembly-1", &membership.me.identity_proof()).unwrap();

    store.forget_membership(&membership).unwrap();
    assert!(store.load_membership().unwrap().is_none());
    assert!(store.load_proofs("assembly-1").unwrap().is_empty());
}

#[test]
fn test_sealed_backend_binds_record_to_key() {
    let backend = SealedBackend::with_key(&[7u8; 32]).unwrap();
    backend.store_record("a", b"payload").unwrap();
    assert_eq!(backend.load_record("a").unwrap().unwrap(), b"payload");
    assert!(backend.load_record("b").unwrap().is_none());

    backend.remove_record("a").unwrap();
    assert!(backend.keys_with_prefix("").unwrap().is_empty());
}

#[test]
fn test_tampered_stored_proof_is_dropped() {
    let store = CredentialStore::in_memory();
    let everyone = members(2);
    let mut forged = everyone[0].identity_proof();
    forged.nickname = "someone else".into();

    store.save_proof("assembly-1", &forged).unwrap();
    store.save_proof("assembly-1", &everyone[1].identity_proof()).unwrap();

    let reloaded = store.load_proofs("assembly-1").unwrap();
    assert_eq!(reloaded.len(), 1);
    assert!(reloaded.contains(everyone[1].fingerprint()));
    assert_matches!(reloaded.require(everyone[0].fingerprint()), Err(AssemblyError::Crypto(_)));
}
