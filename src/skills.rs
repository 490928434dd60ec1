use crate::archive;
use crate::client::SkillMeta;
use crate::error::{Result, TeamError};
use crate::index::SkillEntry;
use crate::peer::Identity;
use chrono::Utc;
use serde::Deserialize;
use std::path::{Path, PathBuf};

/// Optional descriptor at the top of a capability directory.
pub const MANIFEST_FILE: &str = "skill.json";

#[derive(Debug, Default, Deserialize)]
struct Manifest {
    #[serde(default)]
    name: String,
    #[serde(default)]
    description: String,
    #[serde(default)]
    version: String,
}

/// Serves locally published capabilities from `<data_dir>/skills/<plugin_id>/`.
#[derive(Debug, Clone)]
pub struct SkillProvider {
    root: PathBuf,
}

impl SkillProvider {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    /// Directory for `plugin_id`. Ids that could escape the root are refused.
    pub fn dir(&self, plugin_id: &str) -> Result<PathBuf> {
        let bad = plugin_id.is_empty()
            || plugin_id == "."
            || plugin_id == ".."
            || plugin_id.contains(['/', '\\']);
        if bad {
            return Err(TeamError::PathTraversal(plugin_id.to_string()));
        }
        let dir = self.root.join(plugin_id);
        if !dir.is_dir() {
            return Err(TeamError::SkillNotFound(plugin_id.to_string()));
        }
        Ok(dir)
    }

    fn manifest(dir: &Path) -> Manifest {
        let path = dir.join(MANIFEST_FILE);
        match std::fs::read_to_string(&path) {
            Ok(text) => serde_json::from_str(&text).unwrap_or_else(|e| {
                tracing::warn!(path = %path.display(), error = %e, "Ignoring unreadable manifest");
                Manifest::default()
            }),
            Err(_) => Manifest::default(),
        }
    }

    /// Packs the directory. The checksum is over the archive bytes, which is
    /// what a downloader verifies.
    pub fn package(&self, plugin_id: &str) -> Result<(Vec<u8>, String)> {
        archive::pack(&self.dir(plugin_id)?)
    }

    pub fn meta(&self, plugin_id: &str) -> Result<SkillMeta> {
        let dir = self.dir(plugin_id)?;
        let manifest = Self::manifest(&dir);
        let (files, total_size) = archive::directory_info(&dir)?;
        let (_, checksum) = archive::pack(&dir)?;
        Ok(SkillMeta {
            plugin_id: plugin_id.to_string(),
            name: if manifest.name.is_empty() {
                plugin_id.to_string()
            } else {
                manifest.name
            },
            description: manifest.description,
            version: if manifest.version.is_empty() {
                "0.0.0".to_string()
            } else {
                manifest.version
            },
            files,
            total_size,
            checksum,
        })
    }

    /// Index entry announcing a local capability, authored by `identity`
    /// and downloadable from `endpoint`.
    pub fn entry(&self, plugin_id: &str, identity: &Identity, endpoint: &str) -> Result<SkillEntry> {
        let meta = self.meta(plugin_id)?;
        Ok(SkillEntry {
            plugin_id: meta.plugin_id,
            name: meta.name,
            description: meta.description,
            version: meta.version,
            author_id: identity.id.clone(),
            author_name: identity.name.clone(),
            author_endpoint: endpoint.to_string(),
            file_count: meta.files.len(),
            total_size: meta.total_size,
            checksum: meta.checksum,
            published_at: Utc::now(),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::fs;
    use tempfile::TempDir;

    fn provider_with_skill() -> (TempDir, SkillProvider) {
        let dir = TempDir::new().unwrap();
        let skill = dir.path().join("skill-1");
        fs::create_dir_all(skill.join("docs")).unwrap();
        fs::write(
            skill.join(MANIFEST_FILE),
            r#"{"name":"Formatter","description":"formats things","version":"1.2.0"}"#,
        )
        .unwrap();
        fs::write(skill.join("docs/readme.md"), "hello").unwrap();
        let root = dir.path().to_path_buf();
        (dir, SkillProvider::new(root))
    }

    #[test]
    fn meta_reads_manifest_and_matches_package_checksum() {
        let (_dir, provider) = provider_with_skill();
        let meta = provider.meta("skill-1").unwrap();
        assert_eq!(meta.name, "Formatter");
        assert_eq!(meta.version, "1.2.0");
        assert!(meta.files.contains(&"docs/readme.md".to_string()));

        let (bytes, sum) = provider.package("skill-1").unwrap();
        assert_eq!(sum, meta.checksum);
        assert!(archive::verify_checksum(&bytes, &meta.checksum));
    }

    #[test]
    fn missing_manifest_falls_back_to_id() {
        let dir = TempDir::new().unwrap();
        fs::create_dir_all(dir.path().join("bare")).unwrap();
        fs::write(dir.path().join("bare/a.txt"), "a").unwrap();
        let meta = SkillProvider::new(dir.path().to_path_buf()).meta("bare").unwrap();
        assert_eq!(meta.name, "bare");
        assert_eq!(meta.version, "0.0.0");
        assert_eq!(meta.total_size, 1);
    }

    #[test]
    fn escaping_and_unknown_ids_are_refused() {
        let (_dir, provider) = provider_with_skill();
        assert!(matches!(provider.dir(".."), Err(TeamError::PathTraversal(_))));
        assert!(matches!(provider.dir("a/b"), Err(TeamError::PathTraversal(_))));
        assert!(matches!(provider.meta("nope"), Err(TeamError::SkillNotFound(_))));
    }
}
