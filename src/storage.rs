use crate::error::{Result, TeamError};
use crate::peer::{Identity, NetworkConfig};
use chrono::Utc;
use serde::de::DeserializeOwned;
use serde::Serialize;
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::RwLock;

/// On-disk layout under the node's data directory.
#[derive(Debug, Clone)]
pub struct DataDir {
    root: PathBuf,
}

impl DataDir {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    pub fn team_root(&self) -> PathBuf {
        self.root.join("team")
    }

    pub fn identity_path(&self) -> PathBuf {
        self.team_root().join("identity.json")
    }

    pub fn network_path(&self) -> PathBuf {
        self.team_root().join("network.json")
    }

    pub fn teams_path(&self) -> PathBuf {
        self.team_root().join("teams.json")
    }

    pub fn team_dir(&self, team_id: &str) -> PathBuf {
        self.team_root().join(team_id)
    }

    pub fn members_path(&self, team_id: &str) -> PathBuf {
        self.team_dir(team_id).join("members.json")
    }

    pub fn skills_path(&self, team_id: &str) -> PathBuf {
        self.team_dir(team_id).join("skills.json")
    }

    /// Local capability packages, one directory per plugin id.
    pub fn skills_root(&self) -> PathBuf {
        self.root.join("skills")
    }

    pub fn logs_dir(&self) -> PathBuf {
        self.root.join("logs")
    }
}

/// Reads a JSON file. A missing or unreadable file yields the default value.
pub fn load_json<T: DeserializeOwned + Default>(path: &Path) -> T {
    if !path.exists() {
        return T::default();
    }

    match fs::read_to_string(path) {
        Ok(content) => match serde_json::from_str::<T>(&content) {
            Ok(value) => value,
            Err(e) => {
                tracing::warn!(path = %path.display(), error = %e, "Failed to parse state file");
                T::default()
            }
        },
        Err(e) => {
            tracing::warn!(path = %path.display(), error = %e, "Failed to read state file");
            T::default()
        }
    }
}

pub fn save_json<T: Serialize + ?Sized>(path: &Path, value: &T) -> Result<()> {
    if let Some(parent) = path.parent() {
        fs::create_dir_all(parent)?;
    }
    let json = serde_json::to_string_pretty(value)?;
    fs::write(path, json)?;
    Ok(())
}

/// The local identity, cached in memory.
pub struct IdentityStore {
    path: PathBuf,
    current: RwLock<Option<Identity>>,
}

impl IdentityStore {
    pub fn open(data: &DataDir) -> Self {
        let path = data.identity_path();
        let current: Option<Identity> = load_json(&path);
        Self {
            path,
            current: RwLock::new(current),
        }
    }

    pub fn get(&self) -> Option<Identity> {
        self.current.read().ok().and_then(|c| c.clone())
    }

    pub fn require(&self) -> Result<Identity> {
        self.get().ok_or(TeamError::IdentityNotFound)
    }

    pub fn create(&self, name: &str) -> Result<Identity> {
        let name = name.trim();
        if name.is_empty() {
            return Err(TeamError::IdentityNameRequired);
        }
        let identity = Identity::new(name);
        self.store(identity.clone())?;
        tracing::info!(id = %identity.id, name = %identity.name, "Created identity");
        Ok(identity)
    }

    pub fn rename(&self, name: &str) -> Result<Identity> {
        let name = name.trim();
        if name.is_empty() {
            return Err(TeamError::IdentityNameRequired);
        }
        let mut identity = self.require()?;
        identity.name = name.to_string();
        identity.updated_at = Utc::now();
        self.store(identity.clone())?;
        Ok(identity)
    }

    /// Creates the identity if missing, renames it if the name differs.
    pub fn ensure(&self, name: &str) -> Result<Identity> {
        match self.get() {
            None => self.create(name),
            Some(existing) if existing.name != name.trim() => self.rename(name),
            Some(existing) => Ok(existing),
        }
    }

    fn store(&self, identity: Identity) -> Result<()> {
        save_json(&self.path, &identity)?;
        if let Ok(mut current) = self.current.write() {
            *current = Some(identity);
        }
        Ok(())
    }
}

pub struct NetworkConfigStore {
    path: PathBuf,
    current: RwLock<NetworkConfig>,
}

impl NetworkConfigStore {
    pub fn open(data: &DataDir) -> Self {
        let path = data.network_path();
        let current: NetworkConfig = load_json(&path);
        Self {
            path,
            current: RwLock::new(current),
        }
    }

    pub fn get(&self) -> NetworkConfig {
        self.current
            .read()
            .map(|c| c.clone())
            .unwrap_or_default()
    }

    pub fn set(&self, preferred_interface: &str, preferred_ip: &str) -> Result<NetworkConfig> {
        let config = NetworkConfig {
            preferred_interface: preferred_interface.to_string(),
            preferred_ip: preferred_ip.to_string(),
            last_updated: Some(Utc::now()),
        };
        save_json(&self.path, &config)?;
        if let Ok(mut current) = self.current.write() {
            *current = config.clone();
        }
        Ok(config)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn missing_and_corrupt_files_load_as_default() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("nothing.json");
        let v: Vec<String> = load_json(&path);
        assert!(v.is_empty());

        fs::write(&path, "{ broken").unwrap();
        let v: Vec<String> = load_json(&path);
        assert!(v.is_empty());
    }

    #[test]
    fn identity_persists_and_renames() {
        let dir = TempDir::new().unwrap();
        let data = DataDir::new(dir.path());

        let store = IdentityStore::open(&data);
        assert!(matches!(store.require(), Err(TeamError::IdentityNotFound)));
        assert!(matches!(store.create("  "), Err(TeamError::IdentityNameRequired)));

        let created = store.create("alice").unwrap();
        let renamed = store.ensure("alicia").unwrap();
        assert_eq!(created.id, renamed.id);
        assert_eq!(renamed.name, "alicia");

        let reopened = IdentityStore::open(&data);
        assert_eq!(reopened.require().unwrap().name, "alicia");
    }

    #[test]
    fn network_preference_round_trips_through_disk() {
        let dir = TempDir::new().unwrap();
        let data = DataDir::new(dir.path());
        let store = NetworkConfigStore::open(&data);
        assert_eq!(store.get(), NetworkConfig::default());

        store.set("eth0", "192.168.1.10").unwrap();
        let reopened = NetworkConfigStore::open(&data);
        assert_eq!(reopened.get().preferred_ip, "192.168.1.10");
        assert_eq!(reopened.get().preferred_interface, "eth0");
    }
}
