use dashmap::DashMap;
use parking_lot::RwLock;
use serde::Serialize;
use std::collections::{BTreeSet, HashSet};
use std::sync::Arc;
use tracing::{info, warn};

use crate::config::Settings;
use crate::credentials::{CredentialSchema, CredentialStore};
use crate::descriptor::NodeDescriptor;
use crate::error::RegistryError;
use crate::events::Listeners;
use crate::node::NodeType;

const DISABLED_TYPES_KEY: &str = "flowwire.nodes.disabled";

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum TypeState {
    Enabled,
    Disabled,
    Errored(String),
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct TypeInfo {
    #[serde(rename = "type")]
    pub type_name: String,
    pub module: Option<String>,
    pub state: TypeState,
}

/// Result of resolving a type name.
#[derive(Clone)]
pub enum TypeLookup {
    Available(Arc<dyn NodeType>),
    Disabled,
    Errored(String),
    Unknown,
}

impl std::fmt::Debug for TypeLookup {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            TypeLookup::Available(_) => f.write_str("Available"),
            TypeLookup::Disabled => f.write_str("Disabled"),
            TypeLookup::Errored(e) => write!(f, "Errored({e})"),
            TypeLookup::Unknown => f.write_str("Unknown"),
        }
    }
}

#[derive(Debug, Clone, Default)]
pub struct RegisterOptions {
    pub credentials: Option<CredentialSchema>,
    /// The node file / package the type was loaded from.
    pub module: Option<String>,
}

impl RegisterOptions {
    pub fn credentials(schema: CredentialSchema) -> Self {
        Self { credentials: Some(schema), module: None }
    }

    pub fn module(module: impl Into<String>) -> Self {
        Self { credentials: None, module: Some(module.into()) }
    }
}

struct TypeEntry {
    factory: Arc<dyn NodeType>,
    module: Option<String>,
    enabled: bool,
    error: Option<String>,
}

impl TypeEntry {
    fn available(&self) -> bool {
        self.enabled && self.error.is_none()
    }

    fn state(&self) -> TypeState {
        match (&self.error, self.enabled) {
            (Some(e), _) => TypeState::Errored(e.clone()),
            (None, true) => TypeState::Enabled,
            (None, false) => TypeState::Disabled,
        }
    }
}

/// Maps type names to node factories and tracks whether each is usable.
pub struct TypeRegistry {
    types: DashMap<String, TypeEntry>,
    disabled: RwLock<HashSet<String>>,
    credentials: Option<Arc<CredentialStore>>,
    settings: Option<Settings>,
    registered: Listeners<String>,
}

impl TypeRegistry {
    pub fn new(settings: Option<Settings>, credentials: Option<Arc<CredentialStore>>) -> Self {
        Self {
            types: DashMap::new(),
            disabled: RwLock::new(HashSet::new()),
            credentials,
            settings,
            registered: Listeners::new(),
        }
    }

    /// Restores the persisted disabled list. Types already registered that
    /// appear in it become unavailable. A missing entry means nothing is
    /// disabled; an unreadable one is an error and changes nothing.
    pub async fn load_settings(&self) -> Result<(), RegistryError> {
        let settings = self.settings.as_ref().ok_or(RegistryError::SettingsUnavailable)?;
        let stored: Vec<String> = match settings.get(DISABLED_TYPES_KEY).await {
            Some(raw) => serde_json::from_str(&raw)
                .map_err(|e| RegistryError::Settings(format!("malformed {DISABLED_TYPES_KEY}: {e}")))?,
            None => Vec::new(),
        };
        for name in &stored {
            if let Some(mut entry) = self.types.get_mut(name) {
                entry.enabled = false;
            }
        }
        *self.disabled.write() = stored.into_iter().collect();
        Ok(())
    }

    pub fn register(
        &self,
        type_name: &str,
        factory: Arc<dyn NodeType>,
        opts: RegisterOptions,
    ) -> Result<(), RegistryError> {
        if self.types.contains_key(type_name) {
            return Err(RegistryError::AlreadyRegistered(type_name.to_string()));
        }
        if let Some(schema) = opts.credentials {
            match &self.credentials {
                Some(store) => store.register(type_name, schema),
                None => warn!(kind = type_name, "no credential store to hold schema"),
            }
        }
        let enabled = !self.disabled.read().contains(type_name);
        self.types.insert(
            type_name.to_string(),
            TypeEntry { factory, module: opts.module, enabled, error: None },
        );
        info!(kind = type_name, enabled, "registered node type");
        if enabled {
            self.registered.emit(&type_name.to_string());
        }
        Ok(())
    }

    /// The factory for `type_name`, or `None` when it is unknown, disabled
    /// or errored. Use [`TypeRegistry::lookup`] to tell those apart.
    pub fn get(&self, type_name: &str) -> Option<Arc<dyn NodeType>> {
        match self.lookup(type_name) {
            TypeLookup::Available(factory) => Some(factory),
            _ => None,
        }
    }

    pub fn lookup(&self, type_name: &str) -> TypeLookup {
        match self.types.get(type_name) {
            None => TypeLookup::Unknown,
            Some(entry) => match (&entry.error, entry.enabled) {
                (Some(e), _) => TypeLookup::Errored(e.clone()),
                (None, false) => TypeLookup::Disabled,
                (None, true) => TypeLookup::Available(entry.factory.clone()),
            },
        }
    }

    pub fn is_available(&self, type_name: &str) -> bool {
        self.types.get(type_name).is_some_and(|e| e.available())
    }

    pub async fn enable(&self, type_name: &str) -> Result<TypeInfo, RegistryError> {
        self.set_enabled(&[type_name.to_string()], true).await?;
        self.type_info(type_name).ok_or_else(|| RegistryError::UnknownType(type_name.to_string()))
    }

    /// Marks the type unusable for future deploys. Live instances keep
    /// running until the next deploy replaces them.
    pub async fn disable(&self, type_name: &str) -> Result<TypeInfo, RegistryError> {
        self.set_enabled(&[type_name.to_string()], false).await?;
        self.type_info(type_name).ok_or_else(|| RegistryError::UnknownType(type_name.to_string()))
    }

    /// Disables every type of a node module, refusing while any deployed
    /// descriptor still uses one of them.
    pub async fn disable_module(
        &self,
        module: &str,
        deployed: &[NodeDescriptor],
    ) -> Result<Vec<String>, RegistryError> {
        if self.settings.is_none() {
            return Err(RegistryError::SettingsUnavailable);
        }
        let types: BTreeSet<String> = self
            .types
            .iter()
            .filter(|e| e.module.as_deref() == Some(module))
            .map(|e| e.key().clone())
            .collect();
        if types.is_empty() {
            return Err(RegistryError::UnknownModule(module.to_string()));
        }
        if let Some(user) = deployed.iter().find(|d| types.contains(&d.type_name)) {
            return Err(RegistryError::TypeInUse {
                type_name: user.type_name.clone(),
                node_id: user.id.clone(),
            });
        }
        let types: Vec<String> = types.into_iter().collect();
        self.set_enabled(&types, false).await?;
        Ok(types)
    }

    /// Records the discovery outcome for a type. Clearing the error of an
    /// enabled type makes it available again.
    pub fn set_error(&self, type_name: &str, error: Option<String>) -> Result<(), RegistryError> {
        let became_available = {
            let mut entry = self
                .types
                .get_mut(type_name)
                .ok_or_else(|| RegistryError::UnknownType(type_name.to_string()))?;
            let was = entry.available();
            if let Some(e) = &error {
                warn!(kind = type_name, "node type errored: {e}");
            }
            entry.error = error;
            !was && entry.available()
        };
        if became_available {
            self.registered.emit(&type_name.to_string());
        }
        Ok(())
    }

    /// Called with the type name each time a type becomes available.
    pub fn on_type_registered(&self, handler: impl Fn(&String) + Send + Sync + 'static) {
        self.registered.subscribe(handler);
    }

    pub fn type_info(&self, type_name: &str) -> Option<TypeInfo> {
        self.types.get(type_name).map(|e| TypeInfo {
            type_name: type_name.to_string(),
            module: e.module.clone(),
            state: e.state(),
        })
    }

    pub fn type_list(&self) -> Vec<TypeInfo> {
        let mut list: Vec<TypeInfo> = self
            .types
            .iter()
            .map(|e| TypeInfo { type_name: e.key().clone(), module: e.module.clone(), state: e.state() })
            .collect();
        list.sort_by(|a, b| a.type_name.cmp(&b.type_name));
        list
    }

    async fn set_enabled(&self, type_names: &[String], enabled: bool) -> Result<(), RegistryError> {
        let settings = self.settings.as_ref().ok_or(RegistryError::SettingsUnavailable)?;
        if let Some(unknown) = type_names.iter().find(|t| !self.types.contains_key(t.as_str())) {
            return Err(RegistryError::UnknownType(unknown.clone()));
        }

        let mut disabled = self.disabled.read().clone();
        for t in type_names {
            if enabled {
                disabled.remove(t);
            } else {
                disabled.insert(t.clone());
            }
        }
        let mut persisted: Vec<&String> = disabled.iter().collect();
        persisted.sort();
        settings
            .set_json(DISABLED_TYPES_KEY, &persisted)
            .await
            .map_err(RegistryError::Settings)?;
        *self.disabled.write() = disabled;

        let mut now_available = Vec::new();
        for t in type_names {
            if let Some(mut entry) = self.types.get_mut(t) {
                let was = entry.available();
                entry.enabled = enabled;
                if !was && entry.available() {
                    now_available.push(t.clone());
                }
            }
        }
        for t in now_available {
            info!(kind = %t, "node type enabled");
            self.registered.emit(&t);
        }
        Ok(())
    }
}

impl std::fmt::Debug for TypeRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "TypeRegistry({} types)", self.types.len())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::MemorySettings;
    use crate::credentials::CredentialField;
    use crate::nodes::testing::Passthrough;
    use crate::storage::MemoryStorage;
    use parking_lot::Mutex;
    use std::collections::HashMap;

    fn registry() -> (TypeRegistry, Arc<Mutex<Vec<String>>>) {
        let registry = TypeRegistry::new(Some(Settings(MemorySettings::new())), None);
        let seen = Arc::new(Mutex::new(Vec::new()));
        let sink = seen.clone();
        registry.on_type_registered(move |t| sink.lock().push(t.clone()));
        (registry, seen)
    }

    #[test]
    fn register_rejects_duplicates_and_announces() {
        let (registry, seen) = registry();
        registry.register("pass", Arc::new(Passthrough), RegisterOptions::default()).unwrap();
        let err = registry.register("pass", Arc::new(Passthrough), RegisterOptions::default()).unwrap_err();
        assert_eq!(err, RegistryError::AlreadyRegistered("pass".into()));
        assert_eq!(*seen.lock(), vec!["pass"]);
        assert!(registry.get("pass").is_some());
        assert!(matches!(registry.lookup("nope"), TypeLookup::Unknown));
    }

    #[tokio::test]
    async fn disabled_types_are_not_found_until_enabled() {
        let (registry, seen) = registry();
        registry.register("pass", Arc::new(Passthrough), RegisterOptions::default()).unwrap();

        let info = registry.disable("pass").await.unwrap();
        assert_eq!(info.state, TypeState::Disabled);
        assert!(registry.get("pass").is_none());
        assert!(matches!(registry.lookup("pass"), TypeLookup::Disabled));

        registry.enable("pass").await.unwrap();
        assert!(registry.get("pass").is_some());
        assert_eq!(*seen.lock(), vec!["pass", "pass"]);
    }

    #[tokio::test]
    async fn enable_requires_settings() {
        let registry = TypeRegistry::new(None, None);
        registry.register("pass", Arc::new(Passthrough), RegisterOptions::default()).unwrap();
        assert_eq!(registry.disable("pass").await.unwrap_err(), RegistryError::SettingsUnavailable);
        assert_eq!(registry.load_settings().await.unwrap_err(), RegistryError::SettingsUnavailable);
    }

    #[tokio::test]
    async fn disabled_list_survives_a_new_registry() {
        let settings = Settings(MemorySettings::new());
        let first = TypeRegistry::new(Some(settings.clone()), None);
        first.register("pass", Arc::new(Passthrough), RegisterOptions::default()).unwrap();
        first.disable("pass").await.unwrap();

        let second = TypeRegistry::new(Some(settings), None);
        second.load_settings().await.unwrap();
        second.register("pass", Arc::new(Passthrough), RegisterOptions::default()).unwrap();
        assert!(!second.is_available("pass"));
    }

    #[tokio::test]
    async fn malformed_disabled_list_is_an_error() {
        let settings = Settings(MemorySettings::new());
        settings.set(DISABLED_TYPES_KEY, "[\"pass\"").await.unwrap();
        let registry = TypeRegistry::new(Some(settings), None);
        registry.register("pass", Arc::new(Passthrough), RegisterOptions::default()).unwrap();

        let err = registry.load_settings().await.unwrap_err();
        assert!(matches!(err, RegistryError::Settings(ref m) if m.contains(DISABLED_TYPES_KEY)));
        assert!(registry.is_available("pass"));

        let empty = TypeRegistry::new(Some(Settings(MemorySettings::new())), None);
        empty.load_settings().await.unwrap();
    }

    #[tokio::test]
    async fn module_disable_refuses_while_in_use() {
        let (registry, _) = registry();
        registry.register("mqtt in", Arc::new(Passthrough), RegisterOptions::module("mqtt")).unwrap();
        registry.register("mqtt out", Arc::new(Passthrough), RegisterOptions::module("mqtt")).unwrap();

        let deployed = vec![NodeDescriptor::new("n1", "mqtt out")];
        let err = registry.disable_module("mqtt", &deployed).await.unwrap_err();
        assert_eq!(err, RegistryError::TypeInUse { type_name: "mqtt out".into(), node_id: "n1".into() });
        assert!(registry.is_available("mqtt out"));

        let disabled = registry.disable_module("mqtt", &[]).await.unwrap();
        assert_eq!(disabled, vec!["mqtt in", "mqtt out"]);
        assert_eq!(
            registry.disable_module("nope", &[]).await.unwrap_err(),
            RegistryError::UnknownModule("nope".into())
        );
    }

    #[test]
    fn errored_types_announce_when_cleared() {
        let (registry, seen) = registry();
        registry.register("pass", Arc::new(Passthrough), RegisterOptions::default()).unwrap();
        registry.set_error("pass", Some("missing dependency".into())).unwrap();
        assert!(matches!(registry.lookup("pass"), TypeLookup::Errored(e) if e == "missing dependency"));
        assert_eq!(registry.type_list()[0].state, TypeState::Errored("missing dependency".into()));

        registry.set_error("pass", None).unwrap();
        assert!(registry.is_available("pass"));
        assert_eq!(seen.lock().len(), 2);
    }

    #[test]
    fn credential_schema_is_forwarded() {
        let store = Arc::new(crate::credentials::CredentialStore::new(Arc::new(MemoryStorage::new())));
        let registry = TypeRegistry::new(None, Some(store.clone()));
        let schema = HashMap::from([("secret".to_string(), CredentialField::password())]);
        registry
            .register("mqtt broker", Arc::new(Passthrough), RegisterOptions::credentials(schema.clone()))
            .unwrap();
        assert_eq!(store.definition("mqtt broker"), Some(schema));
    }
}
