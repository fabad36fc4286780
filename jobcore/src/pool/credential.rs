//! Credential acquisition (spec.md §4.3): passwords never live in the
//! Store; they come from an external secret store keyed by `cluster:{id}`.

use crate::error::CoreResult;
use crate::ids::ClusterId;
use async_trait::async_trait;
use std::collections::HashMap;
use tokio::sync::Mutex;

#[async_trait]
pub trait CredentialStore: Send + Sync {
    async fn get_password(&self, cluster_id: ClusterId) -> CoreResult<Option<String>>;
    async fn set_password(&self, cluster_id: ClusterId, password: String) -> CoreResult<()>;
    async fn delete_password(&self, cluster_id: ClusterId) -> CoreResult<()>;
}

/// In-process credential store. Suitable for tests and for deployments
/// that authenticate purely by key file; a real deployment plugs in an
/// OS-keyring-backed implementation of the same trait.
#[derive(Default)]
pub struct InMemoryCredentialStore {
    passwords: Mutex<HashMap<ClusterId, String>>,
}

impl InMemoryCredentialStore {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl CredentialStore for InMemoryCredentialStore {
    async fn get_password(&self, cluster_id: ClusterId) -> CoreResult<Option<String>> {
        Ok(self.passwords.lock().await.get(&cluster_id).cloned())
    }

    async fn set_password(&self, cluster_id: ClusterId, password: String) -> CoreResult<()> {
        self.passwords.lock().await.insert(cluster_id, password);
        Ok(())
    }

    async fn delete_password(&self, cluster_id: ClusterId) -> CoreResult<()> {
        self.passwords.lock().await.remove(&cluster_id);
        Ok(())
    }
}
