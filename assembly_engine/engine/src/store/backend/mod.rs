pub mod memory;
pub mod sealed;

use crate::error::Result;

/// Key-value persistence the credential store sits on.
pub trait StoreBackend: Send + Sync {
    fn store_record(&self, key: &str, value: &[u8]) -> Result<()>;
    fn load_record(&self, key: &str) -> Result<Option<Vec<u8>>>;
    fn remove_record(&self, key: &str) -> Result<()>;
    fn keys_with_prefix(&self, prefix: &str) -> Result<Vec<String>>;
}
