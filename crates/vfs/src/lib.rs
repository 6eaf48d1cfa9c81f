//! Virtual filesystem: the `mem://` and `vfs://` namespaces backing
//! the `fs.virtual.*` capabilities.
//!
//! `mem://` is volatile per process; `vfs://` persists as files under
//! the state directory. URIs are validated — a path that escapes its
//! namespace root is an argument error, never a filesystem traversal.

use std::collections::HashMap;
use std::path::{Path, PathBuf};

use parking_lot::RwLock;

use sk_domain::error::{Error, Result};

/// A parsed virtual URI.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum VirtualUri {
    Mem(String),
    Vfs(String),
}

impl VirtualUri {
    /// Parse and validate `mem://...` / `vfs://...`.
    pub fn parse(raw: &str) -> Result<Self> {
        let (scheme, rest) = raw
            .split_once("://")
            .ok_or_else(|| Error::Args(format!("not a virtual uri: `{raw}`")))?;
        let path = rest.trim_matches('/');
        if path.is_empty() {
            return Err(Error::Args(format!("empty path in virtual uri `{raw}`")));
        }
        for segment in path.split('/') {
            if segment.is_empty() || segment == "." || segment == ".." {
                return Err(Error::Args(format!(
                    "invalid path segment `{segment}` in virtual uri `{raw}`"
                )));
            }
        }
        match scheme {
            "mem" => Ok(VirtualUri::Mem(path.to_owned())),
            "vfs" => Ok(VirtualUri::Vfs(path.to_owned())),
            other => Err(Error::Args(format!("unknown virtual scheme `{other}://`"))),
        }
    }

    pub fn path(&self) -> &str {
        match self {
            VirtualUri::Mem(path) | VirtualUri::Vfs(path) => path,
        }
    }
}

pub struct VirtualFs {
    mem: RwLock<HashMap<String, String>>,
    vfs_root: PathBuf,
}

impl VirtualFs {
    /// Open the store; persisted files live under `state_path/vfs`.
    pub fn open(state_path: &Path) -> Result<Self> {
        let vfs_root = state_path.join("vfs");
        std::fs::create_dir_all(&vfs_root).map_err(Error::Io)?;
        Ok(Self {
            mem: RwLock::new(HashMap::new()),
            vfs_root,
        })
    }

    fn disk_path(&self, path: &str) -> PathBuf {
        self.vfs_root.join(path)
    }

    pub fn read(&self, uri: &str) -> Result<String> {
        match VirtualUri::parse(uri)? {
            VirtualUri::Mem(path) => self
                .mem
                .read()
                .get(&path)
                .cloned()
                .ok_or_else(|| Error::EntryNotFound(uri.to_owned())),
            VirtualUri::Vfs(path) => {
                let file = self.disk_path(&path);
                if !file.exists() {
                    return Err(Error::EntryNotFound(uri.to_owned()));
                }
                std::fs::read_to_string(&file).map_err(Error::Io)
            }
        }
    }

    pub fn write(&self, uri: &str, content: &str) -> Result<()> {
        match VirtualUri::parse(uri)? {
            VirtualUri::Mem(path) => {
                self.mem.write().insert(path, content.to_owned());
                Ok(())
            }
            VirtualUri::Vfs(path) => {
                let file = self.disk_path(&path);
                if let Some(parent) = file.parent() {
                    std::fs::create_dir_all(parent).map_err(Error::Io)?;
                }
                std::fs::write(&file, content).map_err(Error::Io)
            }
        }
    }

    pub fn delete(&self, uri: &str) -> Result<bool> {
        match VirtualUri::parse(uri)? {
            VirtualUri::Mem(path) => Ok(self.mem.write().remove(&path).is_some()),
            VirtualUri::Vfs(path) => {
                let file = self.disk_path(&path);
                if !file.exists() {
                    return Ok(false);
                }
                std::fs::remove_file(&file).map_err(Error::Io)?;
                Ok(true)
            }
        }
    }

    /// All URIs under a namespace prefix, sorted.
    pub fn list(&self, prefix: &str) -> Result<Vec<String>> {
        let parsed = VirtualUri::parse(prefix)?;
        let mut uris = Vec::new();
        match parsed {
            VirtualUri::Mem(path) => {
                for key in self.mem.read().keys() {
                    if key.starts_with(&path) {
                        uris.push(format!("mem://{key}"));
                    }
                }
            }
            VirtualUri::Vfs(path) => {
                let root = self.disk_path(&path);
                collect_files(&root, &self.vfs_root, &mut uris)?;
            }
        }
        uris.sort();
        Ok(uris)
    }
}

fn collect_files(dir: &Path, root: &Path, uris: &mut Vec<String>) -> Result<()> {
    if !dir.exists() {
        return Ok(());
    }
    for dirent in std::fs::read_dir(dir).map_err(Error::Io)? {
        let dirent = dirent.map_err(Error::Io)?;
        let path = dirent.path();
        if path.is_dir() {
            collect_files(&path, root, uris)?;
        } else if let Ok(rel) = path.strip_prefix(root) {
            uris.push(format!("vfs://{}", rel.to_string_lossy().replace('\\', "/")));
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn open_vfs() -> (tempfile::TempDir, VirtualFs) {
        let dir = tempfile::tempdir().unwrap();
        let vfs = VirtualFs::open(dir.path()).unwrap();
        (dir, vfs)
    }

    #[test]
    fn mem_round_trip() {
        let (_dir, vfs) = open_vfs();
        vfs.write("mem://notes/plan.md", "step 1").unwrap();
        assert_eq!(vfs.read("mem://notes/plan.md").unwrap(), "step 1");
        assert!(vfs.delete("mem://notes/plan.md").unwrap());
        assert!(matches!(
            vfs.read("mem://notes/plan.md"),
            Err(Error::EntryNotFound(_))
        ));
    }

    #[test]
    fn vfs_persists_to_disk() {
        let (dir, vfs) = open_vfs();
        vfs.write("vfs://scratch/data.json", "{}").unwrap();
        assert!(dir.path().join("vfs/scratch/data.json").exists());

        // A fresh handle over the same root sees the file.
        let reopened = VirtualFs::open(dir.path()).unwrap();
        assert_eq!(reopened.read("vfs://scratch/data.json").unwrap(), "{}");
    }

    #[test]
    fn traversal_segments_rejected() {
        let (_dir, vfs) = open_vfs();
        assert!(vfs.read("vfs://../etc/passwd").is_err());
        assert!(vfs.write("mem://a/../b", "x").is_err());
        assert!(vfs.read("file:///etc/passwd").is_err());
    }

    #[test]
    fn list_filters_by_prefix() {
        let (_dir, vfs) = open_vfs();
        vfs.write("mem://a/1.txt", "1").unwrap();
        vfs.write("mem://a/2.txt", "2").unwrap();
        vfs.write("mem://b/3.txt", "3").unwrap();

        let listed = vfs.list("mem://a").unwrap();
        assert_eq!(listed, vec!["mem://a/1.txt", "mem://a/2.txt"]);
    }
}
