use std::collections::BTreeMap;
use std::sync::RwLock;

use crate::error::{AssemblyError, Result};
use crate::store::backend::StoreBackend;

/// Plain in-memory backend, for tests and throwaway sessions.
#[derive(Default)]
pub struct MemoryBackend {
    records: RwLock<BTreeMap<String, Vec<u8>>>,
}

impl MemoryBackend {
    pub fn new() -> Self {
        Self::default()
    }
}

fn poisoned() -> AssemblyError {
    AssemblyError::Storage("Store lock poisoned".into())
}

impl StoreBackend for MemoryBackend {
    fn store_record(&self, key: &str, value: &[u8]) -> Result<()> {
        self.records.write().map_err(|_| poisoned())?.insert(key.to_string(), value.to_vec());
        Ok(())
    }

    fn load_record(&self, key: &str) -> Result<Option<Vec<u8>>> {
        Ok(self.records.read().map_err(|_| poisoned())?.get(key).cloned())
    }

    fn remove_record(&self, key: &str) -> Result<()> {
        self.records.write().map_err(|_| poisoned())?.remove(key);
        Ok(())
    }

    fn keys_with_prefix(&self, prefix: &str) -> Result<Vec<String>> {
        let records = self.records.read().map_err(|_| poisoned())?;
        Ok(records.keys().filter(|k| k.starts_with(prefix)).cloned().collect())
    }
}
