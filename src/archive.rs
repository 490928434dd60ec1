//! Directory <-> gzip'd tar packaging with a detached sha256 checksum.

use crate::error::{Result, TeamError};
use flate2::read::GzDecoder;
use flate2::write::GzEncoder;
use flate2::Compression;
use sha2::{Digest, Sha256};
use std::fs;
use std::io::{self, Read};
use std::path::{Component, Path, PathBuf};

/// One entry found while walking a directory.
struct WalkEntry {
    path: PathBuf,
    rel: String,
    is_dir: bool,
}

/// Depth-first walk below `root`, entries sorted by name within a directory.
fn walk(root: &Path) -> Result<Vec<WalkEntry>> {
    let mut out = Vec::new();
    walk_into(root, root, &mut out)?;
    Ok(out)
}

fn walk_into(root: &Path, dir: &Path, out: &mut Vec<WalkEntry>) -> Result<()> {
    let mut entries = fs::read_dir(dir)?.collect::<io::Result<Vec<_>>>()?;
    entries.sort_by_key(|e| e.file_name());
    for entry in entries {
        let path = entry.path();
        let file_type = entry.file_type()?;
        let rel = relative_slash_path(root, &path)?;
        if file_type.is_dir() {
            out.push(WalkEntry {
                path: path.clone(),
                rel,
                is_dir: true,
            });
            walk_into(root, &path, out)?;
        } else if file_type.is_file() {
            out.push(WalkEntry {
                path,
                rel,
                is_dir: false,
            });
        }
    }
    Ok(())
}

fn relative_slash_path(root: &Path, path: &Path) -> Result<String> {
    let rel = path
        .strip_prefix(root)
        .map_err(|_| TeamError::PathTraversal(path.display().to_string()))?;
    Ok(rel
        .components()
        .map(|c| c.as_os_str().to_string_lossy().into_owned())
        .collect::<Vec<_>>()
        .join("/"))
}

/// Packs `dir` into a tar.gz. Returns the bytes and their checksum.
pub fn pack(dir: &Path) -> Result<(Vec<u8>, String)> {
    let encoder = GzEncoder::new(Vec::new(), Compression::default());
    let mut builder = tar::Builder::new(encoder);

    for entry in walk(dir)? {
        if entry.is_dir {
            builder.append_dir(&entry.rel, &entry.path)?;
        } else {
            builder.append_path_with_name(&entry.path, &entry.rel)?;
        }
    }

    let encoder = builder.into_inner()?;
    let bytes = encoder.finish()?;
    let sum = checksum(&bytes);
    Ok((bytes, sum))
}

/// Relative path of an archive entry, refusing anything that leaves the root.
fn safe_relative(path: &Path) -> Result<PathBuf> {
    let mut out = PathBuf::new();
    for component in path.components() {
        match component {
            Component::Normal(part) => out.push(part),
            Component::CurDir => {}
            Component::ParentDir | Component::RootDir | Component::Prefix(_) => {
                return Err(TeamError::PathTraversal(path.display().to_string()));
            }
        }
    }
    Ok(out)
}

/// Extracts a tar.gz produced by [`pack`] into `dest`.
pub fn unpack(bytes: &[u8], dest: &Path) -> Result<()> {
    fs::create_dir_all(dest)?;
    let mut archive = tar::Archive::new(GzDecoder::new(bytes));

    for entry in archive.entries()? {
        let mut entry = entry?;
        let raw = entry.path()?.into_owned();
        let rel = safe_relative(&raw)?;
        if rel.as_os_str().is_empty() {
            continue;
        }
        let target = dest.join(&rel);
        let kind = entry.header().entry_type();

        if kind.is_dir() {
            fs::create_dir_all(&target)?;
        } else if kind.is_file() {
            if let Some(parent) = target.parent() {
                fs::create_dir_all(parent)?;
            }
            let mut file = fs::File::create(&target)?;
            io::copy(&mut entry, &mut file)?;
            if let Ok(mode) = entry.header().mode() {
                apply_mode(&target, mode);
            }
        } else {
            tracing::debug!(path = %raw.display(), "Skipping unsupported archive entry");
        }
    }
    Ok(())
}

#[cfg(unix)]
fn apply_mode(path: &Path, mode: u32) {
    use std::os::unix::fs::PermissionsExt;
    let _ = fs::set_permissions(path, fs::Permissions::from_mode(mode & 0o7777));
}

#[cfg(not(unix))]
fn apply_mode(_path: &Path, _mode: u32) {}

/// Hex sha256 of `bytes`.
pub fn checksum(bytes: &[u8]) -> String {
    hex::encode(Sha256::digest(bytes))
}

pub fn verify_checksum(bytes: &[u8], expected: &str) -> bool {
    checksum(bytes).eq_ignore_ascii_case(expected)
}

/// Like [`verify_checksum`] but reports what was found.
pub fn ensure_checksum(bytes: &[u8], expected: &str) -> Result<()> {
    let actual = checksum(bytes);
    if actual.eq_ignore_ascii_case(expected) {
        Ok(())
    } else {
        Err(TeamError::ChecksumMismatch {
            expected: expected.to_string(),
            actual,
        })
    }
}

/// Hash over every file's relative path followed by its content.
pub fn directory_checksum(dir: &Path) -> Result<String> {
    let mut hasher = Sha256::new();
    for entry in walk(dir)? {
        if entry.is_dir {
            continue;
        }
        hasher.update(entry.rel.as_bytes());
        let mut file = fs::File::open(&entry.path)?;
        let mut buf = [0u8; 8192];
        loop {
            let n = file.read(&mut buf)?;
            if n == 0 {
                break;
            }
            hasher.update(&buf[..n]);
        }
    }
    Ok(hex::encode(hasher.finalize()))
}

/// Relative file paths and their combined size.
pub fn directory_info(dir: &Path) -> Result<(Vec<String>, u64)> {
    let mut files = Vec::new();
    let mut total = 0u64;
    for entry in walk(dir)? {
        if entry.is_dir {
            continue;
        }
        total += fs::metadata(&entry.path)?.len();
        files.push(entry.rel);
    }
    Ok((files, total))
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn sample_tree() -> TempDir {
        let dir = TempDir::new().unwrap();
        fs::write(dir.path().join("SKILL.md"), "# hello\n").unwrap();
        fs::create_dir_all(dir.path().join("scripts/lib")).unwrap();
        fs::write(dir.path().join("scripts/run.sh"), "#!/bin/sh\necho hi\n").unwrap();
        fs::write(dir.path().join("scripts/lib/util.sh"), "true\n").unwrap();
        fs::create_dir_all(dir.path().join("empty")).unwrap();
        dir
    }

    #[test]
    fn pack_then_unpack_reproduces_tree() {
        let src = sample_tree();
        let (bytes, sum) = pack(src.path()).unwrap();
        assert!(verify_checksum(&bytes, &sum));

        let dest = TempDir::new().unwrap();
        unpack(&bytes, dest.path()).unwrap();

        for rel in ["SKILL.md", "scripts/run.sh", "scripts/lib/util.sh"] {
            assert_eq!(
                fs::read(src.path().join(rel)).unwrap(),
                fs::read(dest.path().join(rel)).unwrap(),
                "{rel}"
            );
        }
        assert!(dest.path().join("empty").is_dir());
        assert_eq!(
            directory_checksum(src.path()).unwrap(),
            directory_checksum(dest.path()).unwrap()
        );
    }

    #[test]
    fn unpack_rejects_parent_escape() {
        let mut builder = tar::Builder::new(GzEncoder::new(Vec::new(), Compression::default()));
        let data = b"pwned";
        let mut header = tar::Header::new_gnu();
        let name = b"../evil.txt";
        header.as_old_mut().name[..name.len()].copy_from_slice(name);
        header.set_size(data.len() as u64);
        header.set_mode(0o644);
        header.set_entry_type(tar::EntryType::Regular);
        header.set_cksum();
        builder.append(&header, &data[..]).unwrap();
        let bytes = builder.into_inner().unwrap().finish().unwrap();

        let outer = TempDir::new().unwrap();
        let dest = outer.path().join("dest");
        let err = unpack(&bytes, &dest).unwrap_err();
        assert!(matches!(err, TeamError::PathTraversal(_)));
        assert!(!outer.path().join("evil.txt").exists());
    }

    #[test]
    fn checksum_is_stable_and_content_sensitive() {
        assert_eq!(checksum(b"abc"), checksum(b"abc"));
        assert_ne!(checksum(b"abc"), checksum(b"abd"));
        assert_eq!(
            checksum(b""),
            "e3b0c44298fc1c149afbf4c8996fb92427ae41e4649b934ca495991b7852b855"
        );
        assert!(!verify_checksum(b"abc", &checksum(b"abd")));
        assert!(matches!(
            ensure_checksum(b"abc", "00"),
            Err(TeamError::ChecksumMismatch { .. })
        ));
    }

    #[test]
    fn directory_checksum_sees_renames() {
        let a = sample_tree();
        let before = directory_checksum(a.path()).unwrap();
        fs::rename(a.path().join("SKILL.md"), a.path().join("README.md")).unwrap();
        assert_ne!(before, directory_checksum(a.path()).unwrap());
    }

    #[test]
    fn directory_info_counts_files_only() {
        let dir = sample_tree();
        let (files, total) = directory_info(dir.path()).unwrap();
        assert_eq!(files.len(), 3);
        assert!(files.contains(&"scripts/lib/util.sh".to_string()));
        assert_eq!(total, (8 + 18 + 5) as u64);
    }
}
