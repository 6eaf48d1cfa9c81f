//! Kernel-owned session store.
//!
//! Entries are persisted in sharded JSONL pages under
//! `session:<id>:entries:<page>`, headers under `session:<id>:meta`,
//! and the enumeration index under `session:index`. Deletes are
//! journaled through a tombstone key so a crash mid-delete is repaired
//! by the next startup scan.

use std::collections::HashMap;

use chrono::{DateTime, Duration, Utc};
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};

use sk_domain::config::TitleConfig;
use sk_domain::error::{Error, Result};
use sk_domain::tool::{Message, Role};

use crate::entry::{Entry, EntryKind, ForkedFrom, SessionHeader, TitleSource};
use crate::kv::KvStore;
use crate::view;

/// Entries per page before a new page is started.
const PAGE_MAX_ENTRIES: usize = 256;

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Index
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

#[derive(Debug, Clone, Serialize, Deserialize)]
struct IndexEntry {
    id: String,
    created_at: DateTime<Utc>,
    updated_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
struct SessionIndex {
    version: u32,
    sessions: Vec<IndexEntry>,
    updated_at: DateTime<Utc>,
}

impl Default for SessionIndex {
    fn default() -> Self {
        Self {
            version: 1,
            sessions: Vec::new(),
            updated_at: Utc::now(),
        }
    }
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Append cursor
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

#[derive(Debug, Clone, Default)]
struct Cursor {
    page: u32,
    entries_in_page: usize,
    last_entry_id: Option<String>,
    last_timestamp: Option<DateTime<Utc>>,
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Session store
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

pub struct SessionStore {
    kv: KvStore,
    index: RwLock<SessionIndex>,
    cursors: RwLock<HashMap<String, Cursor>>,
    title: TitleConfig,
}

impl SessionStore {
    /// Open the store under `state_path/store`. Runs the startup scan:
    /// archives legacy keys, finishes interrupted deletes, loads the index.
    pub fn open(state_path: &std::path::Path, title: TitleConfig) -> Result<Self> {
        let kv = KvStore::open(&state_path.join("store"))?;
        kv.archive_legacy_keys()?;

        let mut index: SessionIndex = match kv.get("session:index")? {
            Some(raw) => serde_json::from_str(&raw)
                .map_err(|e| Error::LogCorrupt(format!("session index: {e}")))?,
            None => SessionIndex::default(),
        };

        // Finish interrupted deletes: any tombstone means the session is gone.
        let mut dropped = 0usize;
        for key in kv.list_prefix("session:")? {
            let Some(id) = key
                .strip_prefix("session:")
                .and_then(|rest| rest.strip_suffix(":tombstone"))
            else {
                continue;
            };
            let id = id.to_owned();
            for page_key in kv.list_prefix(&format!("session:{id}:entries:"))? {
                kv.delete(&page_key)?;
            }
            kv.delete(&format!("session:{id}:meta"))?;
            kv.delete(&key)?;
            index.sessions.retain(|s| s.id != id);
            dropped += 1;
        }
        if dropped > 0 {
            index.updated_at = Utc::now();
            kv.put("session:index", &serde_json::to_string(&index)?)?;
            tracing::info!(dropped, "dropped tombstoned sessions at startup");
        }

        tracing::info!(sessions = index.sessions.len(), "session store loaded");

        Ok(Self {
            kv,
            index: RwLock::new(index),
            cursors: RwLock::new(HashMap::new()),
            title,
        })
    }

    // ── Creation / headers ─────────────────────────────────────────

    /// Create a new session. A caller-supplied id is honored; colliding
    /// with an existing session is an argument error.
    pub fn create(&self, session_id: Option<String>) -> Result<SessionHeader> {
        let id = session_id.unwrap_or_else(|| uuid::Uuid::new_v4().to_string());
        if self.kv.exists(&format!("session:{id}:meta")) {
            return Err(Error::Args(format!("session `{id}` already exists")));
        }

        let header = SessionHeader::new(&id);
        self.put_header(&header)?;

        let mut index = self.index.write();
        index.sessions.push(IndexEntry {
            id: id.clone(),
            created_at: header.created_at,
            updated_at: header.updated_at,
        });
        index.updated_at = Utc::now();
        self.kv.put("session:index", &serde_json::to_string(&*index)?)?;

        Ok(header)
    }

    /// Create a child session (agent fan-out). The child is a fresh
    /// log whose header records the parent.
    pub fn create_child(&self, parent_session_id: &str) -> Result<SessionHeader> {
        if !self.exists(parent_session_id) {
            return Err(Error::SessionNotFound(parent_session_id.to_owned()));
        }
        let mut header = self.create(None)?;
        header.parent_session_id = Some(parent_session_id.to_owned());
        self.put_header(&header)?;
        Ok(header)
    }

    pub fn exists(&self, session_id: &str) -> bool {
        self.kv.exists(&format!("session:{session_id}:meta"))
    }

    pub fn header(&self, session_id: &str) -> Result<SessionHeader> {
        let raw = self
            .kv
            .get(&format!("session:{session_id}:meta"))?
            .ok_or_else(|| Error::SessionNotFound(session_id.to_owned()))?;
        serde_json::from_str(&raw)
            .map_err(|e| Error::LogCorrupt(format!("session {session_id} meta: {e}")))
    }

    fn put_header(&self, header: &SessionHeader) -> Result<()> {
        self.kv.put(
            &format!("session:{}:meta", header.id),
            &serde_json::to_string(header)?,
        )
    }

    /// Headers in index order. Sessions whose meta cannot be loaded are
    /// skipped (orphans are allowed only transiently during delete).
    pub fn list(&self) -> Vec<SessionHeader> {
        let index = self.index.read();
        index
            .sessions
            .iter()
            .filter_map(|ie| self.header(&ie.id).ok())
            .collect()
    }

    pub fn set_title(&self, session_id: &str, title: &str, source: TitleSource) -> Result<SessionHeader> {
        let mut header = self.header(session_id)?;
        header.title = title.to_owned();
        header.title_source = source;
        header.updated_at = Utc::now();
        self.put_header(&header)?;
        self.touch_index(session_id, header.updated_at)?;
        Ok(header)
    }

    /// Re-derive the auto title from the first user entry. Manual
    /// titles always win and are left untouched.
    pub fn refresh_title(&self, session_id: &str) -> Result<SessionHeader> {
        let header = self.header(session_id)?;
        if header.title_source == TitleSource::Manual {
            return Ok(header);
        }
        let entries = self.entries(session_id)?;
        let derived = entries.iter().find_map(|e| match &e.kind {
            EntryKind::Message {
                role: Role::User,
                text,
                ..
            } => Some(derive_title(text, self.title.max_chars)),
            _ => None,
        });
        match derived {
            Some(title) => self.set_title(session_id, &title, TitleSource::Auto),
            None => Ok(header),
        }
    }

    // ── Appends ────────────────────────────────────────────────────

    pub fn append_message(
        &self,
        session_id: &str,
        role: Role,
        text: &str,
        tool_call_id: Option<String>,
        tool_name: Option<String>,
    ) -> Result<Entry> {
        let entry = self.append(
            session_id,
            EntryKind::Message {
                role,
                text: text.to_owned(),
                tool_call_id,
                tool_name,
            },
        )?;

        // Derive an auto title from the first user prompt.
        if role == Role::User && self.title.auto {
            let header = self.header(session_id)?;
            if header.title.is_empty() && header.title_source == TitleSource::Auto {
                self.set_title(session_id, &derive_title(text, self.title.max_chars), TitleSource::Auto)?;
            }
        }

        Ok(entry)
    }

    pub fn append_tool_call(
        &self,
        session_id: &str,
        call_id: &str,
        tool_name: &str,
        arguments: serde_json::Value,
    ) -> Result<Entry> {
        self.append(
            session_id,
            EntryKind::ToolCall {
                call_id: call_id.to_owned(),
                tool_name: tool_name.to_owned(),
                arguments,
            },
        )
    }

    pub fn append_compaction(
        &self,
        session_id: &str,
        summary: &str,
        first_kept_entry_id: Option<String>,
        tokens_before: u64,
        tokens_after: u64,
        reason: &str,
    ) -> Result<Entry> {
        self.append(
            session_id,
            EntryKind::Compaction {
                summary: summary.to_owned(),
                first_kept_entry_id,
                tokens_before,
                tokens_after,
                reason: reason.to_owned(),
            },
        )
    }

    fn append(&self, session_id: &str, kind: EntryKind) -> Result<Entry> {
        if !self.exists(session_id) {
            return Err(Error::SessionNotFound(session_id.to_owned()));
        }

        let mut cursors = self.cursors.write();
        let cursor = match cursors.entry(session_id.to_owned()) {
            std::collections::hash_map::Entry::Occupied(o) => o.into_mut(),
            std::collections::hash_map::Entry::Vacant(v) => v.insert(self.scan_cursor(session_id)?),
        };

        // Strictly monotonic timestamps within the log.
        let mut timestamp = Utc::now();
        if let Some(last) = cursor.last_timestamp {
            if timestamp <= last {
                timestamp = last + Duration::milliseconds(1);
            }
        }

        let entry = Entry {
            id: uuid::Uuid::new_v4().to_string(),
            timestamp,
            parent_id: cursor.last_entry_id.clone(),
            kind,
        };

        if cursor.entries_in_page >= PAGE_MAX_ENTRIES {
            cursor.page += 1;
            cursor.entries_in_page = 0;
        }
        let page_key = page_key(session_id, cursor.page);
        self.kv.append_line(&page_key, &serde_json::to_string(&entry)?)?;
        cursor.entries_in_page += 1;
        cursor.last_entry_id = Some(entry.id.clone());
        cursor.last_timestamp = Some(entry.timestamp);
        drop(cursors);

        let mut header = self.header(session_id)?;
        header.updated_at = Utc::now();
        self.put_header(&header)?;
        self.touch_index(session_id, header.updated_at)?;

        Ok(entry)
    }

    fn scan_cursor(&self, session_id: &str) -> Result<Cursor> {
        let pages = self.kv.list_prefix(&format!("session:{session_id}:entries:"))?;
        let Some(last_page_key) = pages.last() else {
            return Ok(Cursor::default());
        };
        let page: u32 = last_page_key
            .rsplit(':')
            .next()
            .and_then(|n| n.parse().ok())
            .unwrap_or(0);

        let raw = self.kv.get(last_page_key)?.unwrap_or_default();
        let mut count = 0usize;
        let mut last: Option<Entry> = None;
        for line in raw.lines().filter(|l| !l.trim().is_empty()) {
            let entry: Entry = serde_json::from_str(line)
                .map_err(|e| Error::LogCorrupt(format!("session {session_id}: {e}")))?;
            last = Some(entry);
            count += 1;
        }

        Ok(Cursor {
            page,
            entries_in_page: count,
            last_entry_id: last.as_ref().map(|e| e.id.clone()),
            last_timestamp: last.map(|e| e.timestamp),
        })
    }

    fn touch_index(&self, session_id: &str, updated_at: DateTime<Utc>) -> Result<()> {
        let mut index = self.index.write();
        if let Some(ie) = index.sessions.iter_mut().find(|s| s.id == session_id) {
            ie.updated_at = updated_at;
        }
        index.updated_at = Utc::now();
        self.kv.put("session:index", &serde_json::to_string(&*index)?)
    }

    // ── Reads ──────────────────────────────────────────────────────

    /// All entries in log order. A malformed line is fatal for the
    /// session (`E_LOG_CORRUPT`); it is surfaced, never auto-repaired.
    pub fn entries(&self, session_id: &str) -> Result<Vec<Entry>> {
        if !self.exists(session_id) {
            return Err(Error::SessionNotFound(session_id.to_owned()));
        }
        let mut entries = Vec::new();
        for page_key in self.kv.list_prefix(&format!("session:{session_id}:entries:"))? {
            let raw = self.kv.get(&page_key)?.unwrap_or_default();
            for line in raw.lines().filter(|l| !l.trim().is_empty()) {
                let entry: Entry = serde_json::from_str(line)
                    .map_err(|e| Error::LogCorrupt(format!("session {session_id}: {e}")))?;
                entries.push(entry);
            }
        }
        Ok(entries)
    }

    pub fn entry(&self, session_id: &str, entry_id: &str) -> Result<Entry> {
        self.entries(session_id)?
            .into_iter()
            .find(|e| e.id == entry_id)
            .ok_or_else(|| Error::EntryNotFound(entry_id.to_owned()))
    }

    /// The derived, send-ready projection of the log. Never cached:
    /// regenerated from the entries on every call.
    pub fn conversation_view(&self, session_id: &str) -> Result<Vec<Message>> {
        let entries = self.entries(session_id)?;
        Ok(view::build_conversation_view(&entries))
    }

    // ── Delete ─────────────────────────────────────────────────────

    /// Journaled delete: tombstone → pages → meta → index compaction.
    /// A crash between steps leaves a tombstone the startup scan drops.
    pub fn delete(&self, session_id: &str) -> Result<()> {
        if !self.exists(session_id) {
            return Err(Error::SessionNotFound(session_id.to_owned()));
        }

        let tombstone = format!("session:{session_id}:tombstone");
        self.kv.put(&tombstone, "")?;

        for page_key in self.kv.list_prefix(&format!("session:{session_id}:entries:"))? {
            self.kv.delete(&page_key)?;
        }
        self.kv.delete(&format!("session:{session_id}:meta"))?;

        {
            let mut index = self.index.write();
            index.sessions.retain(|s| s.id != session_id);
            index.updated_at = Utc::now();
            self.kv.put("session:index", &serde_json::to_string(&*index)?)?;
        }

        self.kv.delete(&tombstone)?;
        self.cursors.write().remove(session_id);
        Ok(())
    }

    // ── Fork ───────────────────────────────────────────────────────

    /// Fork a session: copy entries up to and including `leaf_id` into a
    /// new session whose header records the origin. The source session
    /// is untouched.
    pub fn fork(
        &self,
        source_id: &str,
        source_entry_id: &str,
        leaf_id: &str,
        reason: &str,
    ) -> Result<SessionHeader> {
        let entries = self.entries(source_id)?;
        let leaf_pos = entries
            .iter()
            .position(|e| e.id == leaf_id)
            .ok_or_else(|| Error::EntryNotFound(leaf_id.to_owned()))?;
        if !entries.iter().any(|e| e.id == source_entry_id) {
            return Err(Error::EntryNotFound(source_entry_id.to_owned()));
        }

        let mut header = self.create(None)?;
        header.parent_session_id = Some(source_id.to_owned());
        header.forked_from = Some(ForkedFrom {
            session_id: source_id.to_owned(),
            leaf_id: leaf_id.to_owned(),
            source_entry_id: source_entry_id.to_owned(),
            reason: reason.to_owned(),
        });
        self.put_header(&header)?;

        // Entries are copied verbatim: ids, parent chain, and compaction
        // cut points in the prefix must keep referring to the same ids.
        let copied = &entries[..=leaf_pos];
        let mut cursor = Cursor::default();
        for entry in copied {
            if cursor.entries_in_page >= PAGE_MAX_ENTRIES {
                cursor.page += 1;
                cursor.entries_in_page = 0;
            }
            self.kv.append_line(
                &page_key(&header.id, cursor.page),
                &serde_json::to_string(entry)?,
            )?;
            cursor.entries_in_page += 1;
            cursor.last_entry_id = Some(entry.id.clone());
            cursor.last_timestamp = Some(entry.timestamp);
        }
        self.cursors.write().insert(header.id.clone(), cursor);

        // Derive the fork's title from its own copied prefix.
        if self.title.auto {
            self.refresh_title(&header.id)?;
        }

        self.header(&header.id)
    }
}

fn page_key(session_id: &str, page: u32) -> String {
    format!("session:{session_id}:entries:{page:06}")
}

fn derive_title(text: &str, max_chars: usize) -> String {
    let line = text.lines().next().unwrap_or("").trim();
    if line.chars().count() <= max_chars {
        return line.to_owned();
    }
    let mut title: String = line.chars().take(max_chars).collect();
    title.push('…');
    title
}

#[cfg(test)]
mod tests {
    use super::*;

    fn open_store() -> (tempfile::TempDir, SessionStore) {
        let dir = tempfile::tempdir().unwrap();
        let store = SessionStore::open(dir.path(), TitleConfig::default()).unwrap();
        (dir, store)
    }

    #[test]
    fn create_append_read_back() {
        let (_dir, store) = open_store();
        let header = store.create(None).unwrap();

        store
            .append_message(&header.id, Role::User, "hello", None, None)
            .unwrap();
        store
            .append_message(&header.id, Role::Assistant, "hi", None, None)
            .unwrap();

        let entries = store.entries(&header.id).unwrap();
        assert_eq!(entries.len(), 2);
        assert_eq!(entries[1].parent_id.as_deref(), Some(entries[0].id.as_str()));
        assert!(entries[0].timestamp < entries[1].timestamp);
    }

    #[test]
    fn auto_title_from_first_user_prompt() {
        let (_dir, store) = open_store();
        let header = store.create(None).unwrap();
        store
            .append_message(&header.id, Role::User, "Book a flight to Oslo\nplease", None, None)
            .unwrap();
        let header = store.header(&header.id).unwrap();
        assert_eq!(header.title, "Book a flight to Oslo");
        assert_eq!(header.title_source, TitleSource::Auto);
    }

    #[test]
    fn manual_title_survives_refresh() {
        let (_dir, store) = open_store();
        let header = store.create(None).unwrap();
        store
            .append_message(&header.id, Role::User, "something long", None, None)
            .unwrap();
        store
            .set_title(&header.id, "My title", TitleSource::Manual)
            .unwrap();
        let refreshed = store.refresh_title(&header.id).unwrap();
        assert_eq!(refreshed.title, "My title");
        assert_eq!(refreshed.title_source, TitleSource::Manual);
    }

    #[test]
    fn pages_shard_after_bound() {
        let (dir, store) = open_store();
        let header = store.create(None).unwrap();
        for i in 0..(PAGE_MAX_ENTRIES + 3) {
            store
                .append_message(&header.id, Role::User, &format!("m{i}"), None, None)
                .unwrap();
        }
        let entries = store.entries(&header.id).unwrap();
        assert_eq!(entries.len(), PAGE_MAX_ENTRIES + 3);

        // Two page files exist on disk.
        let kv = KvStore::open(&dir.path().join("store")).unwrap();
        let pages = kv
            .list_prefix(&format!("session:{}:entries:", header.id))
            .unwrap();
        assert_eq!(pages.len(), 2);
    }

    #[test]
    fn delete_removes_everything() {
        let (_dir, store) = open_store();
        let header = store.create(None).unwrap();
        store
            .append_message(&header.id, Role::User, "x", None, None)
            .unwrap();
        store.delete(&header.id).unwrap();

        assert!(matches!(
            store.entries(&header.id),
            Err(Error::SessionNotFound(_))
        ));
        assert!(store.list().is_empty());
    }

    #[test]
    fn startup_scan_drops_tombstoned_sessions() {
        let dir = tempfile::tempdir().unwrap();
        let id;
        {
            let store = SessionStore::open(dir.path(), TitleConfig::default()).unwrap();
            let header = store.create(None).unwrap();
            id = header.id.clone();
            store
                .append_message(&id, Role::User, "x", None, None)
                .unwrap();
            // Simulate a crash mid-delete: tombstone written, pages left.
            let kv = KvStore::open(&dir.path().join("store")).unwrap();
            kv.put(&format!("session:{id}:tombstone"), "").unwrap();
        }

        let store = SessionStore::open(dir.path(), TitleConfig::default()).unwrap();
        assert!(!store.exists(&id));
        assert!(store.list().is_empty());
    }

    #[test]
    fn fork_copies_prefix_and_records_origin() {
        let (_dir, store) = open_store();
        let header = store.create(None).unwrap();
        let q1 = store
            .append_message(&header.id, Role::User, "Q1", None, None)
            .unwrap();
        let a1 = store
            .append_message(&header.id, Role::Assistant, "A1", None, None)
            .unwrap();
        store
            .append_message(&header.id, Role::User, "Q2", None, None)
            .unwrap();
        store
            .append_message(&header.id, Role::Assistant, "A2", None, None)
            .unwrap();

        let fork = store.fork(&header.id, &a1.id, &q1.id, "edit_rerun").unwrap();
        let fork_entries = store.entries(&fork.id).unwrap();
        assert_eq!(fork_entries.len(), 1);
        match &fork_entries[0].kind {
            EntryKind::Message { text, .. } => assert_eq!(text, "Q1"),
            other => panic!("expected message, got {other:?}"),
        }
        assert_eq!(fork.parent_session_id.as_deref(), Some(header.id.as_str()));
        let origin = fork.forked_from.unwrap();
        assert_eq!(origin.leaf_id, q1.id);
        assert_eq!(origin.source_entry_id, a1.id);

        // Source unchanged.
        assert_eq!(store.entries(&header.id).unwrap().len(), 4);
    }

    #[test]
    fn corrupt_page_surfaces_log_corrupt() {
        let dir = tempfile::tempdir().unwrap();
        let store = SessionStore::open(dir.path(), TitleConfig::default()).unwrap();
        let header = store.create(None).unwrap();
        store
            .append_message(&header.id, Role::User, "x", None, None)
            .unwrap();

        let kv = KvStore::open(&dir.path().join("store")).unwrap();
        kv.append_line(&format!("session:{}:entries:000000", header.id), "{not json")
            .unwrap();

        assert!(matches!(
            store.entries(&header.id),
            Err(Error::LogCorrupt(_))
        ));
    }
}
