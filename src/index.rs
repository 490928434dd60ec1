use crate::error::Result;
use crate::storage::{load_json, save_json, DataDir};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::{Arc, RwLock};

/// A published capability, keyed by `plugin_id` within a team.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct SkillEntry {
    pub plugin_id: String,
    pub name: String,
    #[serde(default)]
    pub description: String,
    pub version: String,
    pub author_id: String,
    pub author_name: String,
    #[serde(default)]
    pub author_endpoint: String,
    #[serde(default)]
    pub file_count: usize,
    #[serde(default)]
    pub total_size: u64,
    #[serde(default)]
    pub checksum: String,
    pub published_at: DateTime<Utc>,
}

/// Full index as exchanged over HTTP and kept on disk.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
pub struct TeamSkillIndex {
    pub team_id: String,
    #[serde(default)]
    pub updated_at: Option<DateTime<Utc>>,
    #[serde(default)]
    pub skills: Vec<SkillEntry>,
}

/// Storage seam for one team's capability index.
pub trait CapabilityIndexStore: Send + Sync {
    fn get(&self, plugin_id: &str) -> Option<SkillEntry>;
    fn list(&self) -> Vec<SkillEntry>;
    fn upsert(&self, entry: SkillEntry) -> Result<()>;
    /// Changes only version and checksum. Returns false for unknown ids.
    fn update_version(&self, plugin_id: &str, version: &str, checksum: &str) -> Result<bool>;
    fn remove(&self, plugin_id: &str) -> Result<bool>;
    fn replace_all(&self, skills: Vec<SkillEntry>) -> Result<()>;
    fn snapshot(&self) -> TeamSkillIndex;
}

#[derive(Default)]
struct IndexState {
    skills: HashMap<String, SkillEntry>,
    updated_at: Option<DateTime<Utc>>,
}

/// JSON-backed index. `path: None` keeps it in memory only.
pub struct SkillIndex {
    team_id: String,
    path: Option<PathBuf>,
    state: RwLock<IndexState>,
}

impl SkillIndex {
    pub fn in_memory(team_id: &str) -> Self {
        Self {
            team_id: team_id.to_string(),
            path: None,
            state: RwLock::new(IndexState::default()),
        }
    }

    pub fn open(team_id: &str, path: PathBuf) -> Self {
        let stored: TeamSkillIndex = load_json(&path);
        let state = IndexState {
            skills: stored
                .skills
                .into_iter()
                .map(|s| (s.plugin_id.clone(), s))
                .collect(),
            updated_at: stored.updated_at,
        };
        Self {
            team_id: team_id.to_string(),
            path: Some(path),
            state: RwLock::new(state),
        }
    }

    pub fn len(&self) -> usize {
        self.state.read().map(|s| s.skills.len()).unwrap_or(0)
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    fn mutate<R>(&self, f: impl FnOnce(&mut IndexState) -> R) -> Result<R> {
        let (result, snapshot) = {
            let mut state = self
                .state
                .write()
                .unwrap_or_else(|poisoned| poisoned.into_inner());
            let result = f(&mut state);
            state.updated_at = Some(Utc::now());
            (result, self.snapshot_of(&state))
        };
        if let Some(path) = &self.path {
            save_json(path, &snapshot)?;
        }
        Ok(result)
    }

    fn snapshot_of(&self, state: &IndexState) -> TeamSkillIndex {
        let mut skills: Vec<SkillEntry> = state.skills.values().cloned().collect();
        skills.sort_by(|a, b| a.plugin_id.cmp(&b.plugin_id));
        TeamSkillIndex {
            team_id: self.team_id.clone(),
            updated_at: state.updated_at,
            skills,
        }
    }
}

impl CapabilityIndexStore for SkillIndex {
    fn get(&self, plugin_id: &str) -> Option<SkillEntry> {
        self.state
            .read()
            .ok()
            .and_then(|s| s.skills.get(plugin_id).cloned())
    }

    fn list(&self) -> Vec<SkillEntry> {
        self.snapshot().skills
    }

    fn upsert(&self, entry: SkillEntry) -> Result<()> {
        self.mutate(|s| {
            s.skills.insert(entry.plugin_id.clone(), entry);
        })
    }

    fn update_version(&self, plugin_id: &str, version: &str, checksum: &str) -> Result<bool> {
        self.mutate(|s| match s.skills.get_mut(plugin_id) {
            Some(entry) => {
                entry.version = version.to_string();
                entry.checksum = checksum.to_string();
                true
            }
            None => false,
        })
    }

    fn remove(&self, plugin_id: &str) -> Result<bool> {
        self.mutate(|s| s.skills.remove(plugin_id).is_some())
    }

    fn replace_all(&self, skills: Vec<SkillEntry>) -> Result<()> {
        self.mutate(|s| {
            s.skills = skills
                .into_iter()
                .map(|e| (e.plugin_id.clone(), e))
                .collect();
        })
    }

    fn snapshot(&self) -> TeamSkillIndex {
        match self.state.read() {
            Ok(state) => self.snapshot_of(&state),
            Err(_) => TeamSkillIndex {
                team_id: self.team_id.clone(),
                ..Default::default()
            },
        }
    }
}

/// One index per team, opened on first use.
pub struct IndexRegistry {
    data: Option<DataDir>,
    indexes: RwLock<HashMap<String, Arc<SkillIndex>>>,
}

impl IndexRegistry {
    pub fn new(data: DataDir) -> Self {
        Self {
            data: Some(data),
            indexes: RwLock::new(HashMap::new()),
        }
    }

    pub fn in_memory() -> Self {
        Self {
            data: None,
            indexes: RwLock::new(HashMap::new()),
        }
    }

    pub fn get(&self, team_id: &str) -> Option<Arc<SkillIndex>> {
        self.indexes
            .read()
            .ok()
            .and_then(|m| m.get(team_id).cloned())
    }

    pub fn get_or_open(&self, team_id: &str) -> Arc<SkillIndex> {
        if let Some(index) = self.get(team_id) {
            return index;
        }
        let mut map = self
            .indexes
            .write()
            .unwrap_or_else(|poisoned| poisoned.into_inner());
        map.entry(team_id.to_string())
            .or_insert_with(|| {
                Arc::new(match &self.data {
                    Some(data) => SkillIndex::open(team_id, data.skills_path(team_id)),
                    None => SkillIndex::in_memory(team_id),
                })
            })
            .clone()
    }

    /// Drops the index and its file.
    pub fn remove(&self, team_id: &str) {
        if let Ok(mut map) = self.indexes.write() {
            map.remove(team_id);
        }
        if let Some(data) = &self.data {
            let path = data.skills_path(team_id);
            if path.exists() {
                if let Err(e) = std::fs::remove_file(&path) {
                    tracing::warn!(team_id, error = %e, "Failed to remove skill index file");
                }
            }
        }
    }
}
