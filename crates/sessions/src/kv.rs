//! Key→file store backing session persistence.
//!
//! Logical keys follow the `section:part:...` convention
//! (`session:<id>:entries:<page>`, `session:<id>:meta`, `session:index`).
//! Each key maps to one file under the store root; `:` is rewritten for
//! the filesystem, everything else in a key must already be path-safe.

use std::path::{Path, PathBuf};

use chrono::Utc;

use sk_domain::error::{Error, Result};

/// Separator used when a logical key becomes a file name.
const KEY_SEP: &str = "__";

pub struct KvStore {
    root: PathBuf,
}

impl KvStore {
    pub fn open(root: &Path) -> Result<Self> {
        std::fs::create_dir_all(root).map_err(Error::Io)?;
        Ok(Self {
            root: root.to_path_buf(),
        })
    }

    fn file_for(&self, key: &str) -> PathBuf {
        self.root.join(key.replace(':', KEY_SEP))
    }

    fn key_for(file_name: &str) -> String {
        file_name.replace(KEY_SEP, ":")
    }

    pub fn get(&self, key: &str) -> Result<Option<String>> {
        let path = self.file_for(key);
        if !path.exists() {
            return Ok(None);
        }
        std::fs::read_to_string(&path).map(Some).map_err(Error::Io)
    }

    pub fn put(&self, key: &str, value: &str) -> Result<()> {
        std::fs::write(self.file_for(key), value).map_err(Error::Io)
    }

    /// Append a line to the value at `key` (creates the key if absent).
    pub fn append_line(&self, key: &str, line: &str) -> Result<()> {
        use std::io::Write;
        let mut file = std::fs::OpenOptions::new()
            .create(true)
            .append(true)
            .open(self.file_for(key))
            .map_err(Error::Io)?;
        file.write_all(line.as_bytes()).map_err(Error::Io)?;
        file.write_all(b"\n").map_err(Error::Io)
    }

    pub fn delete(&self, key: &str) -> Result<()> {
        let path = self.file_for(key);
        if path.exists() {
            std::fs::remove_file(path).map_err(Error::Io)?;
        }
        Ok(())
    }

    pub fn exists(&self, key: &str) -> bool {
        self.file_for(key).exists()
    }

    /// All keys starting with `prefix`, sorted.
    pub fn list_prefix(&self, prefix: &str) -> Result<Vec<String>> {
        let mut keys = Vec::new();
        for dirent in std::fs::read_dir(&self.root).map_err(Error::Io)? {
            let dirent = dirent.map_err(Error::Io)?;
            if !dirent.file_type().map_err(Error::Io)?.is_file() {
                continue;
            }
            let name = dirent.file_name();
            let Some(name) = name.to_str() else { continue };
            let key = Self::key_for(name);
            if key.starts_with(prefix) {
                keys.push(key);
            }
        }
        keys.sort();
        Ok(keys)
    }

    /// Move keys that predate the current layout under an
    /// `archive:legacy:<timestamp>` prefix and record them in
    /// `archive:legacy:index`. Current-layout keys (`session:`,
    /// `archive:`, `vfs:`) are left alone.
    pub fn archive_legacy_keys(&self) -> Result<usize> {
        let mut legacy = Vec::new();
        for key in self.list_prefix("")? {
            if key.starts_with("session:") || key.starts_with("archive:") || key.starts_with("vfs:")
            {
                continue;
            }
            legacy.push(key);
        }
        if legacy.is_empty() {
            return Ok(0);
        }

        let stamp = Utc::now().timestamp_millis();
        for key in &legacy {
            let archived = format!("archive:legacy:{stamp}:{key}");
            let value = self.get(key)?.unwrap_or_default();
            self.put(&archived, &value)?;
            self.delete(key)?;
        }

        let index_entry = serde_json::json!({
            "timestamp": stamp,
            "keys": legacy,
        });
        self.append_line("archive:legacy:index", &index_entry.to_string())?;

        tracing::info!(archived = legacy.len(), "archived legacy keys");
        Ok(legacy.len())
    }
}
