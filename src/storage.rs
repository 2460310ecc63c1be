use async_trait::async_trait;
use parking_lot::RwLock;
use serde_json::{Map, Value};
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};

use crate::descriptor::NodeDescriptor;
use crate::error::StorageError;

/// Secret fields keyed by node id (or subflow alias).
pub type CredentialMap = HashMap<String, Map<String, Value>>;

/// Where deployed flows and credentials live between restarts.
#[async_trait]
pub trait Storage: Send + Sync {
    async fn get_flows(&self) -> Result<Vec<NodeDescriptor>, StorageError>;
    async fn save_flows(&self, flows: &[NodeDescriptor]) -> Result<(), StorageError>;
    async fn get_credentials(&self) -> Result<CredentialMap, StorageError>;
    async fn save_credentials(&self, credentials: &CredentialMap) -> Result<(), StorageError>;
}

/// Process-local storage, for embedding and tests.
#[derive(Debug, Default)]
pub struct MemoryStorage {
    flows: RwLock<Vec<NodeDescriptor>>,
    credentials: RwLock<CredentialMap>,
    fail_writes: AtomicBool,
    flow_saves: AtomicUsize,
    credential_saves: AtomicUsize,
}

impl MemoryStorage {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_flows(flows: Vec<NodeDescriptor>) -> Self {
        let storage = Self::default();
        *storage.flows.write() = flows;
        storage
    }

    pub fn with_credentials(self, credentials: CredentialMap) -> Self {
        *self.credentials.write() = credentials;
        self
    }

    /// Makes every following save fail, to exercise persistence errors.
    pub fn fail_writes(&self, fail: bool) {
        self.fail_writes.store(fail, Ordering::SeqCst);
    }

    pub fn flow_saves(&self) -> usize {
        self.flow_saves.load(Ordering::SeqCst)
    }

    pub fn credential_saves(&self) -> usize {
        self.credential_saves.load(Ordering::SeqCst)
    }

    pub fn stored_credentials(&self) -> CredentialMap {
        self.credentials.read().clone()
    }

    fn check_writable(&self) -> Result<(), StorageError> {
        if self.fail_writes.load(Ordering::SeqCst) {
            return Err(StorageError::WriteFailed("memory storage is read-only".into()));
        }
        Ok(())
    }
}

#[async_trait]
impl Storage for MemoryStorage {
    async fn get_flows(&self) -> Result<Vec<NodeDescriptor>, StorageError> {
        Ok(self.flows.read().clone())
    }

    async fn save_flows(&self, flows: &[NodeDescriptor]) -> Result<(), StorageError> {
        self.check_writable()?;
        *self.flows.write() = flows.to_vec();
        self.flow_saves.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }

    async fn get_credentials(&self) -> Result<CredentialMap, StorageError> {
        Ok(self.credentials.read().clone())
    }

    async fn save_credentials(&self, credentials: &CredentialMap) -> Result<(), StorageError> {
        self.check_writable()?;
        *self.credentials.write() = credentials.clone();
        self.credential_saves.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }
}
