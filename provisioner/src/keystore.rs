// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Interface to secret storage

use async_trait::async_trait;
use std::collections::BTreeMap;
use std::sync::Mutex;
use trellis_common::api::external::DeleteResult;
use trellis_common::api::external::Error;
use trellis_common::api::external::LookupResult;
use trellis_common::api::external::ResourceType;
use trellis_common::typed_uuid::SecretUuid;
use trellis_common::typed_uuid::ToUntypedUuid;

/// Holds secrets on behalf of plugins.  Plugins keep only the returned id,
/// usually in the cluster's `extra` bag.
#[async_trait]
pub trait KeyStore: Send + Sync {
    async fn store_secret(&self, secret: &str) -> Result<SecretUuid, Error>;

    async fn get_secret(&self, id: SecretUuid) -> LookupResult<String>;

    async fn delete_secret(&self, id: SecretUuid) -> DeleteResult;
}

/// A [`KeyStore`] that keeps secrets in process memory
#[derive(Default)]
pub struct MemoryKeyStore {
    secrets: Mutex<BTreeMap<SecretUuid, String>>,
}

impl MemoryKeyStore {
    pub fn new() -> MemoryKeyStore {
        MemoryKeyStore::default()
    }

    pub fn len(&self) -> usize {
        self.secrets.lock().unwrap().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

fn not_found(id: SecretUuid) -> Error {
    Error::not_found_by_id(ResourceType::Secret, &id.to_untyped_uuid())
}

#[async_trait]
impl KeyStore for MemoryKeyStore {
    async fn store_secret(&self, secret: &str) -> Result<SecretUuid, Error> {
        let id = SecretUuid::new_v4();
        self.secrets.lock().unwrap().insert(id, secret.to_string());
        Ok(id)
    }

    async fn get_secret(&self, id: SecretUuid) -> LookupResult<String> {
        self.secrets.lock().unwrap().get(&id).cloned().ok_or_else(|| not_found(id))
    }

    async fn delete_secret(&self, id: SecretUuid) -> DeleteResult {
        self.secrets
            .lock()
            .unwrap()
            .remove(&id)
            .map(|_| ())
            .ok_or_else(|| not_found(id))
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[tokio::test]
    async fn test_memory_keystore() {
        let keystore = MemoryKeyStore::new();
        let id = keystore.store_secret("hunter2").await.unwrap();
        assert_eq!(keystore.get_secret(id).await.unwrap(), "hunter2");
        keystore.delete_secret(id).await.unwrap();
        assert!(keystore.is_empty());
        assert!(keystore.get_secret(id).await.unwrap_err().is_not_found());
        assert!(keystore.delete_secret(id).await.unwrap_err().is_not_found());
    }
}
