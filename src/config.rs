use async_trait::async_trait;
use dashmap::DashMap;
use schemars::JsonSchema;
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use std::{env, fs, path::PathBuf};
use tracing::{info, warn};

/// Persistent runtime settings such as the disabled node types.
#[async_trait]
#[typetag::serde]
pub trait SettingsType: Send + Sync {
    async fn keys(&self) -> Vec<String>;
    async fn get(&self, key: &str) -> Option<String>;
    async fn set(&self, key: &str, value: &str) -> Result<(), String>;
    async fn del(&self, key: &str) -> Result<(), String>;
    fn clone_box(&self) -> Box<dyn SettingsType>;
    fn debug_box(&self) -> String;
}

#[derive(Serialize, Deserialize)]
pub struct Settings(pub Box<dyn SettingsType>);

impl Settings {
    pub async fn get(&self, key: &str) -> Option<String> {
        self.0.get(key).await
    }

    pub async fn set(&self, key: &str, value: &str) -> Result<(), String> {
        self.0.set(key, value).await
    }

    pub async fn del(&self, key: &str) -> Result<(), String> {
        self.0.del(key).await
    }

    /// Reads a JSON-encoded value. Unparseable values are reported and ignored.
    pub async fn get_json<T: DeserializeOwned>(&self, key: &str) -> Option<T> {
        let raw = self.0.get(key).await?;
        match serde_json::from_str(&raw) {
            Ok(v) => Some(v),
            Err(e) => {
                warn!("ignoring malformed setting {key}: {e}");
                None
            }
        }
    }

    pub async fn set_json<T: Serialize + Sync>(&self, key: &str, value: &T) -> Result<(), String> {
        let raw = serde_json::to_string(value).map_err(|e| e.to_string())?;
        self.0.set(key, &raw).await
    }
}

impl Clone for Settings {
    fn clone(&self) -> Self {
        Settings(self.0.clone_box())
    }
}

impl std::fmt::Debug for Settings {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.0.debug_box())
    }
}

/// Settings kept in the process environment and mirrored to a `.env` file.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct EnvSettings {
    env_file: PathBuf,
}

impl EnvSettings {
    pub fn new(env_file: PathBuf) -> Box<Self> {
        if env_file.exists() {
            match dotenvy::from_path(&env_file) {
                Ok(()) => info!("loaded settings from {}", env_file.display()),
                Err(e) => warn!("could not parse {}: {e}", env_file.display()),
            }
        }
        Box::new(Self { env_file })
    }

    fn rewrite(&self, key: &str, value: Option<&str>) -> Result<(), String> {
        let content = fs::read_to_string(&self.env_file).unwrap_or_default();
        let mut lines: Vec<String> = content
            .lines()
            .filter(|line| line.split_once('=').is_none_or(|(k, _)| k.trim() != key))
            .map(str::to_string)
            .collect();
        if let Some(value) = value {
            lines.push(format!("{key}={value}"));
        }
        fs::write(&self.env_file, lines.join("\n")).map_err(|e| e.to_string())
    }
}

#[typetag::serde]
#[async_trait]
impl SettingsType for EnvSettings {
    async fn keys(&self) -> Vec<String> {
        env::vars().map(|(k, _)| k).collect()
    }

    async fn get(&self, key: &str) -> Option<String> {
        env::var(key).ok()
    }

    async fn set(&self, key: &str, value: &str) -> Result<(), String> {
        self.rewrite(key, Some(value))?;
        unsafe { env::set_var(key, value) };
        Ok(())
    }

    async fn del(&self, key: &str) -> Result<(), String> {
        self.rewrite(key, None)?;
        unsafe { env::remove_var(key) };
        Ok(())
    }

    fn clone_box(&self) -> Box<dyn SettingsType> {
        Box::new(self.clone())
    }

    fn debug_box(&self) -> String {
        format!("EnvSettings({})", self.env_file.display())
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize, JsonSchema)]
pub struct MemorySettings {
    #[schemars(with = "std::collections::HashMap<String, String>")]
    map: DashMap<String, String>,
}

impl MemorySettings {
    pub fn new() -> Box<Self> {
        Box::new(Self::default())
    }
}

#[typetag::serde]
#[async_trait]
impl SettingsType for MemorySettings {
    async fn keys(&self) -> Vec<String> {
        self.map.iter().map(|entry| entry.key().clone()).collect()
    }

    async fn get(&self, key: &str) -> Option<String> {
        self.map.get(key).map(|v| v.clone())
    }

    async fn set(&self, key: &str, value: &str) -> Result<(), String> {
        self.map.insert(key.to_string(), value.to_string());
        Ok(())
    }

    async fn del(&self, key: &str) -> Result<(), String> {
        self.map.remove(key);
        Ok(())
    }

    fn clone_box(&self) -> Box<dyn SettingsType> {
        Box::new(self.clone())
    }

    fn debug_box(&self) -> String {
        format!("MemorySettings({} entries)", self.map.len())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::fs::write;
    use tempfile::tempdir;

    #[tokio::test]
    async fn memory_settings_round_trip_json() {
        let settings = Settings(MemorySettings::new());
        settings.set_json("nodes", &vec!["a", "b"]).await.unwrap();
        let back: Vec<String> = settings.get_json("nodes").await.unwrap();
        assert_eq!(back, vec!["a", "b"]);

        settings.set("nodes", "{not json").await.unwrap();
        assert!(settings.get_json::<Vec<String>>("nodes").await.is_none());

        settings.del("nodes").await.unwrap();
        assert_eq!(settings.get("nodes").await, None);
        assert!(settings.0.keys().await.is_empty());
    }

    #[tokio::test]
    async fn env_settings_load_and_write_back() {
        let dir = tempdir().unwrap();
        let env_path = dir.path().join(".env");
        write(&env_path, "FLOWWIRE_T_KEEP=1\nFLOWWIRE_T_DROP=2\n").unwrap();

        let settings = Settings(EnvSettings::new(env_path.clone()));
        assert_eq!(settings.get("FLOWWIRE_T_KEEP").await.as_deref(), Some("1"));

        settings.set("FLOWWIRE_T_NEW", "3").await.unwrap();
        settings.del("FLOWWIRE_T_DROP").await.unwrap();
        assert_eq!(env::var("FLOWWIRE_T_NEW").ok().as_deref(), Some("3"));
        assert!(env::var("FLOWWIRE_T_DROP").is_err());

        let content = fs::read_to_string(&env_path).unwrap();
        assert!(content.contains("FLOWWIRE_T_KEEP=1"));
        assert!(content.contains("FLOWWIRE_T_NEW=3"));
        assert!(!content.contains("FLOWWIRE_T_DROP"));

        unsafe {
            env::remove_var("FLOWWIRE_T_KEEP");
            env::remove_var("FLOWWIRE_T_NEW");
        }
    }
}
