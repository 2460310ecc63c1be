use dashmap::DashMap;
use parking_lot::Mutex;
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use tracing::{debug, info, warn};

use crate::descriptor::NodeDescriptor;
use crate::error::CredentialError;
use crate::storage::{CredentialMap, Storage};

/// Markers the editor sends back for a password it never revealed.
const UNCHANGED_MARKERS: [&str; 2] = ["__PWRD__", "__unchanged__"];

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize, JsonSchema)]
#[serde(rename_all = "lowercase")]
pub enum CredentialKind {
    #[default]
    Text,
    Password,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize, JsonSchema)]
pub struct CredentialField {
    #[serde(rename = "type", default)]
    pub kind: CredentialKind,
}

impl CredentialField {
    pub fn text() -> Self {
        Self { kind: CredentialKind::Text }
    }

    pub fn password() -> Self {
        Self { kind: CredentialKind::Password }
    }
}

/// Secret fields a node type declares, by field name.
pub type CredentialSchema = HashMap<String, CredentialField>;

/// Secrets for deployed nodes, kept out of the flow definition.
pub struct CredentialStore {
    cache: Mutex<CredentialMap>,
    definitions: DashMap<String, CredentialSchema>,
    storage: Arc<dyn Storage>,
}

impl CredentialStore {
    pub fn new(storage: Arc<dyn Storage>) -> Self {
        Self {
            cache: Mutex::new(CredentialMap::new()),
            definitions: DashMap::new(),
            storage,
        }
    }

    /// Replaces the cache with what storage holds.
    pub async fn load(&self) -> Result<(), CredentialError> {
        let stored = self.storage.get_credentials().await?;
        info!("loaded credentials for {} nodes", stored.len());
        *self.cache.lock() = stored;
        Ok(())
    }

    pub async fn save(&self) -> Result<(), CredentialError> {
        let snapshot = self.cache.lock().clone();
        self.storage.save_credentials(&snapshot).await?;
        Ok(())
    }

    pub async fn add(&self, id: &str, credentials: Map<String, Value>) -> Result<(), CredentialError> {
        self.cache.lock().insert(id.to_string(), credentials);
        self.save().await
    }

    pub fn get(&self, id: &str) -> Option<Map<String, Value>> {
        self.cache.lock().get(id).cloned()
    }

    pub async fn delete(&self, id: &str) -> Result<(), CredentialError> {
        self.cache.lock().remove(id);
        self.save().await
    }

    pub fn register(&self, type_name: &str, schema: CredentialSchema) {
        self.definitions.insert(dashed(type_name), schema);
    }

    pub fn definition(&self, type_name: &str) -> Option<CredentialSchema> {
        self.definitions.get(&dashed(type_name)).map(|d| d.clone())
    }

    /// Moves the descriptor's `credentials` into the cache according to the
    /// type's schema and strips them from the descriptor. Returns whether the
    /// descriptor carried credentials.
    ///
    /// Does not persist; callers save once after extracting a whole deploy.
    pub fn extract(&self, node: &mut NodeDescriptor) -> bool {
        let Some(incoming) = node.credentials.take() else {
            return false;
        };
        let Some(schema) = self.definition(&node.type_name) else {
            warn!(node = %node.id, kind = %node.type_name, "credential type not registered");
            return true;
        };

        let key = node.credential_key().to_string();
        let mut cache = self.cache.lock();
        let entry = cache.entry(key).or_default();
        for (field, def) in &schema {
            let Some(value) = incoming.get(field) else {
                continue;
            };
            match value.as_str() {
                Some(s) if s.trim().is_empty() => {
                    entry.remove(field);
                }
                Some(s) if def.kind == CredentialKind::Password && UNCHANGED_MARKERS.contains(&s) => {}
                _ => {
                    entry.insert(field.clone(), value.clone());
                }
            }
        }
        true
    }

    /// Drops entries for nodes that are no longer deployed. Persists only
    /// when something was removed; returns whether it did.
    pub async fn clean(&self, descriptors: &[NodeDescriptor]) -> Result<bool, CredentialError> {
        let live: HashSet<&str> = descriptors
            .iter()
            .flat_map(|n| std::iter::once(n.id.as_str()).chain(n.alias.as_deref()))
            .collect();
        let removed = {
            let mut cache = self.cache.lock();
            let before = cache.len();
            cache.retain(|id, _| live.contains(id.as_str()));
            before - cache.len()
        };
        if removed == 0 {
            return Ok(false);
        }
        debug!("removed credentials for {removed} deleted nodes");
        self.save().await?;
        Ok(true)
    }
}

impl std::fmt::Debug for CredentialStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "CredentialStore({} entries)", self.cache.lock().len())
    }
}

fn dashed(type_name: &str) -> String {
    type_name.split_whitespace().collect::<Vec<_>>().join("-")
}
