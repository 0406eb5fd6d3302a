//! Secret storage abstraction.
//!
//! The desktop shell provides a keyring-backed implementation; tests and the
//! headless runtime use [`InMemorySecretStore`]. Values are opaque strings —
//! callers decide what to serialize into them.

use std::collections::HashMap;
use std::sync::RwLock;

use crate::errors::{Error, Result};

/// Key/value secret storage (refresh tokens, sync identity, salts).
pub trait SecretStore: Send + Sync {
    fn get_secret(&self, key: &str) -> Result<Option<String>>;
    fn set_secret(&self, key: &str, value: &str) -> Result<()>;
    fn delete_secret(&self, key: &str) -> Result<()>;
}

/// Process-local secret store. Not persisted; intended for tests and tooling.
#[derive(Debug, Default)]
pub struct InMemorySecretStore {
    values: RwLock<HashMap<String, String>>,
}

impl InMemorySecretStore {
    pub fn new() -> Self {
        Self::default()
    }
}

impl SecretStore for InMemorySecretStore {
    fn get_secret(&self, key: &str) -> Result<Option<String>> {
        let values = self
            .values
            .read()
            .map_err(|_| Error::SecretStore("Secret store lock is poisoned".to_string()))?;
        Ok(values.get(key).cloned())
    }

    fn set_secret(&self, key: &str, value: &str) -> Result<()> {
        let mut values = self
            .values
            .write()
            .map_err(|_| Error::SecretStore("Secret store lock is poisoned".to_string()))?;
        values.insert(key.to_string(), value.to_string());
        Ok(())
    }

    fn delete_secret(&self, key: &str) -> Result<()> {
        let mut values = self
            .values
            .write()
            .map_err(|_| Error::SecretStore("Secret store lock is poisoned".to_string()))?;
        values.remove(key);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn in_memory_store_round_trip() {
        let store = InMemorySecretStore::new();
        assert_eq!(store.get_secret("missing").unwrap(), None);

        store.set_secret("refresh_token", "abc").unwrap();
        assert_eq!(
            store.get_secret("refresh_token").unwrap(),
            Some("abc".to_string())
        );

        store.delete_secret("refresh_token").unwrap();
        assert_eq!(store.get_secret("refresh_token").unwrap(), None);
    }
}
