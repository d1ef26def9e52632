//! Conversation sessions, their persistence, and per-session serialization.
//!
//! A session is owned by the [`SessionManager`] and handed out behind a
//! per-key async mutex. Holding the guard is what makes a turn exclusive:
//! two turns for the same key never interleave, while different keys run
//! independently.

use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, Local, Utc};
use dashmap::DashMap;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tokio::sync::{Mutex, OwnedMutexGuard};
use tracing::{debug, warn};

/// A single message in a session.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Message {
    pub role: String,
    pub content: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub timestamp: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub tools_used: Option<Vec<String>>,
}

impl Message {
    fn stamped(role: &str, content: &str, tools_used: Option<Vec<String>>) -> Self {
        Self {
            role: role.into(),
            content: content.into(),
            timestamp: Some(Local::now().format("%Y-%m-%dT%H:%M:%S").to_string()),
            tools_used,
        }
    }

    pub fn char_len(&self) -> usize {
        self.content.chars().count()
    }
}

/// A conversation session.
#[derive(Debug, Clone)]
pub struct Session {
    pub key: String,
    pub messages: Vec<Message>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    pub metadata: HashMap<String, serde_json::Value>,
}

impl Session {
    pub fn new(key: impl Into<String>) -> Self {
        let now = Utc::now();
        Self {
            key: key.into(),
            messages: Vec::new(),
            created_at: now,
            updated_at: now,
            metadata: HashMap::new(),
        }
    }

    pub fn add_message(&mut self, role: &str, content: &str) {
        self.messages.push(Message::stamped(role, content, None));
        self.updated_at = Utc::now();
    }

    pub fn add_message_with_tools(&mut self, role: &str, content: &str, tools: Vec<String>) {
        let tools = if tools.is_empty() { None } else { Some(tools) };
        self.messages.push(Message::stamped(role, content, tools));
        self.updated_at = Utc::now();
    }

    /// The most recent `max_messages` messages, oldest first.
    pub fn get_history(&self, max_messages: usize) -> &[Message] {
        let start = self.messages.len().saturating_sub(max_messages);
        &self.messages[start..]
    }

    pub fn char_len(&self) -> usize {
        self.messages.iter().map(Message::char_len).sum()
    }

    /// Drop the oldest messages until both limits hold. Returns how many
    /// were removed.
    pub fn trim(&mut self, limits: SessionLimits) -> usize {
        let mut total = self.char_len();
        let mut cut = 0;
        while cut < self.messages.len()
            && (self.messages.len() - cut > limits.max_messages || total > limits.max_chars)
        {
            total -= self.messages[cut].char_len();
            cut += 1;
        }
        if cut > 0 {
            self.messages.drain(..cut);
            self.updated_at = Utc::now();
        }
        cut
    }

    pub fn clear(&mut self) {
        self.messages.clear();
        self.updated_at = Utc::now();
    }
}

/// Retention limits applied after every mutation.
#[derive(Debug, Clone, Copy)]
pub struct SessionLimits {
    pub max_messages: usize,
    pub max_chars: usize,
}

impl Default for SessionLimits {
    fn default() -> Self {
        Self {
            max_messages: 200,
            max_chars: 200_000,
        }
    }
}

/// Summary of a stored session.
#[derive(Debug, Clone, Serialize)]
pub struct SessionInfo {
    pub key: String,
    pub created_at: String,
    pub updated_at: String,
    pub messages: usize,
}

#[derive(Debug, Error)]
pub enum PersistenceError {
    #[error("session '{key}': {source}")]
    Io {
        key: String,
        #[source]
        source: std::io::Error,
    },
    #[error("session '{key}' could not be encoded: {source}")]
    Encode {
        key: String,
        #[source]
        source: serde_json::Error,
    },
}

/// Durable backing for sessions.
#[async_trait]
pub trait SessionStore: Send + Sync {
    async fn load(&self, key: &str) -> Result<Option<Session>, PersistenceError>;
    async fn save(&self, session: &Session) -> Result<(), PersistenceError>;
    async fn delete(&self, key: &str) -> Result<bool, PersistenceError>;
    async fn list(&self) -> Result<Vec<SessionInfo>, PersistenceError>;
}

/// JSONL metadata line (first line of a session file).
#[derive(Debug, Serialize, Deserialize)]
struct MetadataLine {
    #[serde(rename = "_type")]
    type_field: String,
    #[serde(default)]
    key: Option<String>,
    created_at: String,
    #[serde(default)]
    updated_at: Option<String>,
    #[serde(default)]
    metadata: HashMap<String, serde_json::Value>,
}

fn parse_time(raw: &str) -> DateTime<Utc> {
    DateTime::parse_from_rfc3339(raw)
        .map(|d| d.with_timezone(&Utc))
        .or_else(|_| {
            chrono::NaiveDateTime::parse_from_str(raw, "%Y-%m-%dT%H:%M:%S%.f").map(|d| d.and_utc())
        })
        .unwrap_or_else(|_| Utc::now())
}

/// One JSONL file per session: a metadata line, then one line per message.
/// Malformed lines are skipped on load.
pub struct JsonlSessionStore {
    dir: PathBuf,
}

impl JsonlSessionStore {
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self { dir: dir.into() }
    }

    fn path_for(&self, key: &str) -> PathBuf {
        let safe: String = key
            .chars()
            .map(|c| match c {
                ':' | '/' | '\\' => '_',
                c => c,
            })
            .collect();
        self.dir.join(format!("{safe}.jsonl"))
    }

    fn io_err(key: &str, source: std::io::Error) -> PersistenceError {
        PersistenceError::Io {
            key: key.to_string(),
            source,
        }
    }

    fn decode(key: &str, raw: &str) -> Session {
        let mut session = Session::new(key);
        for line in raw.lines().map(str::trim).filter(|l| !l.is_empty()) {
            let value: serde_json::Value = match serde_json::from_str(line) {
                Ok(v) => v,
                Err(e) => {
                    warn!("Skipping malformed line in session {key}: {e}");
                    continue;
                }
            };
            if value.get("_type").and_then(|v| v.as_str()) == Some("metadata") {
                if let Ok(meta) = serde_json::from_value::<MetadataLine>(value) {
                    session.created_at = parse_time(&meta.created_at);
                    if let Some(updated) = meta.updated_at.as_deref() {
                        session.updated_at = parse_time(updated);
                    }
                    session.metadata = meta.metadata;
                }
                continue;
            }
            match serde_json::from_value::<Message>(value) {
                Ok(msg) => session.messages.push(msg),
                Err(e) => warn!("Skipping unreadable message in session {key}: {e}"),
            }
        }
        session
    }

    fn encode(session: &Session) -> Result<String, PersistenceError> {
        let enc = |source| PersistenceError::Encode {
            key: session.key.clone(),
            source,
        };
        let meta = MetadataLine {
            type_field: "metadata".into(),
            key: Some(session.key.clone()),
            created_at: session.created_at.to_rfc3339(),
            updated_at: Some(session.updated_at.to_rfc3339()),
            metadata: session.metadata.clone(),
        };
        let mut out = serde_json::to_string(&meta).map_err(enc)?;
        out.push('\n');
        for msg in &session.messages {
            out.push_str(&serde_json::to_string(msg).map_err(enc)?);
            out.push('\n');
        }
        Ok(out)
    }
}

#[async_trait]
impl SessionStore for JsonlSessionStore {
    async fn load(&self, key: &str) -> Result<Option<Session>, PersistenceError> {
        match tokio::fs::read_to_string(self.path_for(key)).await {
            Ok(raw) => Ok(Some(Self::decode(key, &raw))),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(None),
            Err(e) => Err(Self::io_err(key, e)),
        }
    }

    async fn save(&self, session: &Session) -> Result<(), PersistenceError> {
        let body = Self::encode(session)?;
        tokio::fs::create_dir_all(&self.dir)
            .await
            .map_err(|e| Self::io_err(&session.key, e))?;
        // Write to a sibling file and rename so a crash never leaves half a session.
        let path = self.path_for(&session.key);
        let tmp = path.with_extension("jsonl.tmp");
        tokio::fs::write(&tmp, body)
            .await
            .map_err(|e| Self::io_err(&session.key, e))?;
        tokio::fs::rename(&tmp, &path)
            .await
            .map_err(|e| Self::io_err(&session.key, e))
    }

    async fn delete(&self, key: &str) -> Result<bool, PersistenceError> {
        match tokio::fs::remove_file(self.path_for(key)).await {
            Ok(()) => Ok(true),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(false),
            Err(e) => Err(Self::io_err(key, e)),
        }
    }

    async fn list(&self) -> Result<Vec<SessionInfo>, PersistenceError> {
        let mut entries = match tokio::fs::read_dir(&self.dir).await {
            Ok(e) => e,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(Vec::new()),
            Err(e) => return Err(Self::io_err("*", e)),
        };

        let mut sessions = Vec::new();
        while let Some(entry) = entries.next_entry().await.map_err(|e| Self::io_err("*", e))? {
            let path = entry.path();
            if path.extension().and_then(|e| e.to_str()) != Some("jsonl") {
                continue;
            }
            let Ok(raw) = tokio::fs::read_to_string(&path).await else {
                continue;
            };
            let stem = path
                .file_stem()
                .and_then(|s| s.to_str())
                .unwrap_or_default()
                .to_string();
            let mut lines = raw.lines().filter(|l| !l.trim().is_empty());
            let Some(first) = lines.next() else { continue };
            let Ok(meta) = serde_json::from_str::<MetadataLine>(first) else {
                continue;
            };
            sessions.push(SessionInfo {
                key: meta.key.unwrap_or_else(|| stem.replacen('_', ":", 1)),
                updated_at: meta.updated_at.unwrap_or_else(|| meta.created_at.clone()),
                created_at: meta.created_at,
                messages: lines.count(),
            });
        }

        sessions.sort_by(|a, b| b.updated_at.cmp(&a.updated_at));
        Ok(sessions)
    }
}

/// Keeps sessions in process memory only.
#[derive(Default)]
pub struct MemorySessionStore {
    sessions: DashMap<String, Session>,
}

impl MemorySessionStore {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl SessionStore for MemorySessionStore {
    async fn load(&self, key: &str) -> Result<Option<Session>, PersistenceError> {
        Ok(self.sessions.get(key).map(|s| s.clone()))
    }

    async fn save(&self, session: &Session) -> Result<(), PersistenceError> {
        self.sessions.insert(session.key.clone(), session.clone());
        Ok(())
    }

    async fn delete(&self, key: &str) -> Result<bool, PersistenceError> {
        Ok(self.sessions.remove(key).is_some())
    }

    async fn list(&self) -> Result<Vec<SessionInfo>, PersistenceError> {
        let mut out: Vec<SessionInfo> = self
            .sessions
            .iter()
            .map(|s| SessionInfo {
                key: s.key.clone(),
                created_at: s.created_at.to_rfc3339(),
                updated_at: s.updated_at.to_rfc3339(),
                messages: s.messages.len(),
            })
            .collect();
        out.sort_by(|a, b| b.updated_at.cmp(&a.updated_at));
        Ok(out)
    }
}

/// Exclusive access to one session for the duration of a turn.
pub type SessionGuard = OwnedMutexGuard<Session>;

/// Owns live sessions and serializes access per key.
pub struct SessionManager {
    store: Arc<dyn SessionStore>,
    live: DashMap<String, Arc<Mutex<Session>>>,
    limits: SessionLimits,
}

impl SessionManager {
    pub fn new(store: Arc<dyn SessionStore>, limits: SessionLimits) -> Self {
        Self {
            store,
            live: DashMap::new(),
            limits,
        }
    }

    pub fn in_memory() -> Self {
        Self::new(Arc::new(MemorySessionStore::new()), SessionLimits::default())
    }

    pub fn limits(&self) -> SessionLimits {
        self.limits
    }

    /// Live handle for `key`, loading it from the store on first use.
    pub async fn get_or_create(&self, key: &str) -> Result<Arc<Mutex<Session>>, PersistenceError> {
        if let Some(existing) = self.live.get(key) {
            return Ok(existing.clone());
        }
        let loaded = match self.store.load(key).await? {
            Some(mut session) => {
                debug!("Loaded session {key} ({} messages)", session.messages.len());
                session.trim(self.limits);
                session
            }
            None => Session::new(key),
        };
        // A concurrent caller may have inserted while we were loading; keep theirs.
        let handle = self
            .live
            .entry(key.to_string())
            .or_insert_with(|| Arc::new(Mutex::new(loaded)))
            .clone();
        Ok(handle)
    }

    /// Wait for exclusive access to `key`.
    pub async fn lock(&self, key: &str) -> Result<SessionGuard, PersistenceError> {
        Ok(self.get_or_create(key).await?.lock_owned().await)
    }

    /// Append one message under the session's lock and apply retention limits.
    pub async fn append(&self, key: &str, role: &str, content: &str) -> Result<(), PersistenceError> {
        let mut session = self.lock(key).await?;
        session.add_message(role, content);
        self.apply_limits(&mut session);
        Ok(())
    }

    /// Trim a session the caller already holds.
    pub fn apply_limits(&self, session: &mut Session) {
        let removed = session.trim(self.limits);
        if removed > 0 {
            debug!("Trimmed {removed} old message(s) from session {}", session.key);
        }
    }

    pub async fn save(&self, session: &Session) -> Result<(), PersistenceError> {
        self.store.save(session).await
    }

    /// Drop the live copy; the next access reloads from the store.
    ///
    /// A session someone holds or is about to lock stays live, so two copies
    /// of one key never exist at once. Returns whether it was dropped.
    pub fn evict(&self, key: &str) -> bool {
        self.live
            .remove_if(key, |_, session| Arc::strong_count(session) == 1)
            .is_some()
    }

    /// Remove a session from memory and from the store.
    pub async fn delete(&self, key: &str) -> Result<bool, PersistenceError> {
        let was_live = self.live.remove(key).is_some();
        let was_stored = self.store.delete(key).await?;
        Ok(was_live || was_stored)
    }

    pub async fn list(&self) -> Result<Vec<SessionInfo>, PersistenceError> {
        self.store.list().await
    }

    pub fn live_count(&self) -> usize {
        self.live.len()
    }
}
