//! Conversation store.
//!
//! [`ConversationStore`] owns committed messages. It is mutated by explicit
//! operations only (create, commit, delete, import, prune) and writes through
//! to a [`ConversationStorage`] after every mutation. Persistence is best
//! effort: a failed save is logged and never rolls back the in-memory state.

use std::fmt;
use std::fs;
use std::io::{self, Write};
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex, PoisonError};

use serde::{Deserialize, Serialize};
use tempfile::NamedTempFile;
use thiserror::Error;
use tracing::{debug, error, info, warn};

use crate::types::{Message, Role};

/// Title given to a conversation until its first exchange completes.
pub const PLACEHOLDER_TITLE: &str = "New chat";

/// Characters of the first prompt kept in a generated title.
pub const TITLE_MAX_CHARS: usize = 20;

/// Conversations kept by [`ConversationStore::prune`] by default.
pub const DEFAULT_KEEP: usize = 50;

/// Conversations kept when storage reports it is out of space.
pub const QUOTA_FALLBACK_KEEP: usize = 20;

/// Errors raised by a storage backend.
#[derive(Error, Debug)]
pub enum StorageError {
    /// Underlying I/O failed.
    #[error("I/O error: {0}")]
    Io(#[from] io::Error),

    /// Stored or imported data is not a conversation list.
    #[error("Invalid conversation data: {0}")]
    Format(#[from] serde_json::Error),

    /// The backend has no room for the data.
    #[error("Storage quota exceeded")]
    QuotaExceeded,
}

/// A conversation and its committed turns.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Conversation {
    pub id: String,
    pub title: String,
    pub messages: Vec<Message>,
    /// Creation time, milliseconds since the Unix epoch.
    pub created_at: i64,
}

impl Conversation {
    /// Start an empty conversation with a fresh id and the placeholder title.
    pub fn new() -> Self {
        let now = chrono::Utc::now().timestamp_millis();
        let suffix = uuid::Uuid::new_v4().simple().to_string();
        Self {
            id: format!("conv_{now}_{}", &suffix[..9]),
            title: PLACEHOLDER_TITLE.to_string(),
            messages: Vec::new(),
            created_at: now,
        }
    }
}

impl Default for Conversation {
    fn default() -> Self {
        Self::new()
    }
}

/// Title derived from the first prompt of a conversation.
pub fn title_from_prompt(prompt: &str) -> String {
    let mut chars = prompt.chars();
    let head: String = chars.by_ref().take(TITLE_MAX_CHARS).collect();
    if chars.next().is_some() {
        format!("{head}...")
    } else {
        head
    }
}

// =============================================================================
// Storage backends
// =============================================================================

/// Persistence collaborator for [`ConversationStore`].
pub trait ConversationStorage: Send + Sync + fmt::Debug {
    /// Load every stored conversation, in stored order.
    ///
    /// Unreadable data is reported as an empty collection.
    fn load(&self) -> Vec<Conversation>;

    /// Replace the stored collection.
    fn save(&self, conversations: &[Conversation]) -> Result<(), StorageError>;

    /// Look up one stored conversation.
    fn get(&self, id: &str) -> Option<Conversation> {
        self.load().into_iter().find(|c| c.id == id)
    }

    /// Load the id of the conversation that was open last.
    fn load_current(&self) -> Option<String>;

    /// Persist the id of the open conversation.
    fn save_current(&self, id: Option<&str>) -> Result<(), StorageError>;
}

impl<T: ConversationStorage + ?Sized> ConversationStorage for Arc<T> {
    fn load(&self) -> Vec<Conversation> {
        (**self).load()
    }

    fn save(&self, conversations: &[Conversation]) -> Result<(), StorageError> {
        (**self).save(conversations)
    }

    fn load_current(&self) -> Option<String> {
        (**self).load_current()
    }

    fn save_current(&self, id: Option<&str>) -> Result<(), StorageError> {
        (**self).save_current(id)
    }
}

/// In-memory backend, optionally limited to a number of conversations.
#[derive(Debug, Default)]
pub struct MemoryStorage {
    conversations: Mutex<Vec<Conversation>>,
    current: Mutex<Option<String>>,
    capacity: Option<usize>,
}

impl MemoryStorage {
    /// Unbounded storage.
    pub fn new() -> Self {
        Self::default()
    }

    /// Storage that rejects saves of more than `capacity` conversations.
    pub fn with_capacity(capacity: usize) -> Self {
        Self {
            capacity: Some(capacity),
            ..Self::default()
        }
    }

    /// Snapshot of what was last saved.
    pub fn saved(&self) -> Vec<Conversation> {
        lock(&self.conversations).clone()
    }
}

impl ConversationStorage for MemoryStorage {
    fn load(&self) -> Vec<Conversation> {
        self.saved()
    }

    fn save(&self, conversations: &[Conversation]) -> Result<(), StorageError> {
        if self.capacity.is_some_and(|cap| conversations.len() > cap) {
            return Err(StorageError::QuotaExceeded);
        }
        *lock(&self.conversations) = conversations.to_vec();
        Ok(())
    }

    fn load_current(&self) -> Option<String> {
        lock(&self.current).clone()
    }

    fn save_current(&self, id: Option<&str>) -> Result<(), StorageError> {
        *lock(&self.current) = id.map(ToString::to_string);
        Ok(())
    }
}

/// JSON files in a directory.
///
/// Conversations are stored as an array of `[id, conversation]` pairs in
/// `conversations.json`; the open conversation id in `current_conversation`.
/// Files are replaced whole: each save writes a temporary file next to the
/// target and renames it into place, so an interrupted save leaves the
/// previous contents readable.
#[derive(Debug, Clone)]
pub struct JsonFileStorage {
    dir: PathBuf,
}

impl JsonFileStorage {
    const CONVERSATIONS_FILE: &'static str = "conversations.json";
    const CURRENT_FILE: &'static str = "current_conversation";

    /// Use `dir`, creating it if needed.
    pub fn open(dir: impl AsRef<Path>) -> Result<Self, StorageError> {
        let dir = dir.as_ref().to_path_buf();
        fs::create_dir_all(&dir)?;
        Ok(Self { dir })
    }

    fn conversations_path(&self) -> PathBuf {
        self.dir.join(Self::CONVERSATIONS_FILE)
    }

    fn current_path(&self) -> PathBuf {
        self.dir.join(Self::CURRENT_FILE)
    }

    fn write_atomic(&self, path: &Path, contents: &str) -> io::Result<()> {
        let mut tmp_file = NamedTempFile::new_in(&self.dir)?;
        tmp_file.write_all(contents.as_bytes())?;
        tmp_file.as_file().sync_all()?;
        tmp_file.persist(path).map_err(|e| e.error)?;
        Ok(())
    }
}

impl ConversationStorage for JsonFileStorage {
    fn load(&self) -> Vec<Conversation> {
        let path = self.conversations_path();
        let raw = match fs::read_to_string(&path) {
            Ok(raw) => raw,
            Err(e) if e.kind() == io::ErrorKind::NotFound => return Vec::new(),
            Err(e) => {
                error!(path = %path.display(), error = %e, "Failed to read conversations");
                return Vec::new();
            }
        };

        match decode_pairs(&raw) {
            Ok(conversations) => conversations,
            Err(e) => {
                warn!(path = %path.display(), error = %e, "Discarding corrupt conversation file");
                if let Err(e) = fs::remove_file(&path) {
                    error!(path = %path.display(), error = %e, "Failed to remove corrupt file");
                }
                Vec::new()
            }
        }
    }

    fn save(&self, conversations: &[Conversation]) -> Result<(), StorageError> {
        let json = encode_pairs(conversations, false)?;
        self.write_atomic(&self.conversations_path(), &json).map_err(|e| {
            if e.kind() == io::ErrorKind::StorageFull {
                StorageError::QuotaExceeded
            } else {
                StorageError::Io(e)
            }
        })
    }

    fn load_current(&self) -> Option<String> {
        fs::read_to_string(self.current_path())
            .ok()
            .map(|s| s.trim().to_string())
            .filter(|s| !s.is_empty())
    }

    fn save_current(&self, id: Option<&str>) -> Result<(), StorageError> {
        let path = self.current_path();
        match id {
            Some(id) => self.write_atomic(&path, id)?,
            None => match fs::remove_file(path) {
                Err(e) if e.kind() != io::ErrorKind::NotFound => return Err(e.into()),
                _ => {}
            },
        }
        Ok(())
    }
}

fn encode_pairs(conversations: &[Conversation], pretty: bool) -> Result<String, StorageError> {
    let pairs: Vec<(&str, &Conversation)> =
        conversations.iter().map(|c| (c.id.as_str(), c)).collect();
    let json = if pretty {
        serde_json::to_string_pretty(&pairs)?
    } else {
        serde_json::to_string(&pairs)?
    };
    Ok(json)
}

fn decode_pairs(raw: &str) -> Result<Vec<Conversation>, StorageError> {
    let pairs: Vec<(String, Conversation)> = serde_json::from_str(raw)?;
    Ok(pairs
        .into_iter()
        .map(|(id, mut conversation)| {
            conversation.id = id;
            conversation
        })
        .collect())
}

fn lock<T>(mutex: &Mutex<T>) -> std::sync::MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

// =============================================================================
// Store
// =============================================================================

/// Owner of committed conversation data.
#[derive(Debug)]
pub struct ConversationStore {
    storage: Box<dyn ConversationStorage>,
    /// Insertion order; later entries are newer.
    conversations: Vec<Conversation>,
    current: Option<String>,
}

impl ConversationStore {
    /// Load conversations and the open conversation id from `storage`.
    pub fn open(storage: impl ConversationStorage + 'static) -> Self {
        let conversations = storage.load();
        let current = storage
            .load_current()
            .filter(|id| conversations.iter().any(|c| &c.id == id));

        info!(
            name: "chat.store.loaded",
            conversations = conversations.len(),
            current = ?current,
            "Conversation store loaded"
        );

        Self {
            storage: Box::new(storage),
            conversations,
            current,
        }
    }

    pub fn get(&self, id: &str) -> Option<&Conversation> {
        self.conversations.iter().find(|c| c.id == id)
    }

    pub fn current_id(&self) -> Option<&str> {
        self.current.as_deref()
    }

    pub fn current(&self) -> Option<&Conversation> {
        self.current.as_deref().and_then(|id| self.get(id))
    }

    pub fn len(&self) -> usize {
        self.conversations.len()
    }

    pub fn is_empty(&self) -> bool {
        self.conversations.is_empty()
    }

    /// Conversations, newest first.
    pub fn list(&self) -> Vec<&Conversation> {
        let mut list: Vec<&Conversation> = self.conversations.iter().rev().collect();
        list.sort_by(|a, b| b.created_at.cmp(&a.created_at));
        list
    }

    /// Committed history of a conversation, oldest first.
    pub fn history(&self, id: &str) -> Vec<Message> {
        self.get(id).map(|c| c.messages.clone()).unwrap_or_default()
    }

    /// Create a conversation and make it the open one.
    pub fn create(&mut self) -> String {
        let conversation = Conversation::new();
        let id = conversation.id.clone();
        debug!(conversation_id = %id, "Created conversation");
        self.conversations.push(conversation);
        self.set_current(Some(id.clone()));
        self.persist();
        id
    }

    /// Open an existing conversation. Returns `false` for an unknown id.
    pub fn switch(&mut self, id: &str) -> bool {
        if self.get(id).is_none() {
            return false;
        }
        self.set_current(Some(id.to_string()));
        true
    }

    /// Delete a conversation.
    ///
    /// Deleting the open conversation opens the newest remaining one, or a
    /// fresh one if none remain. Returns `false` for an unknown id.
    pub fn delete(&mut self, id: &str) -> bool {
        let Some(index) = self.conversations.iter().position(|c| c.id == id) else {
            return false;
        };
        self.conversations.remove(index);
        self.persist();

        if self.current.as_deref() == Some(id) {
            let next = self.list().first().map(|c| c.id.clone());
            match next {
                Some(next) => self.set_current(Some(next)),
                None => {
                    self.create();
                }
            }
        }
        true
    }

    /// Append a completed exchange to a conversation.
    ///
    /// The first exchange replaces the placeholder title. Returns `false` if
    /// the conversation no longer exists (it was deleted mid-stream).
    pub fn commit(&mut self, id: &str, user: Message, assistant: Message) -> bool {
        let Some(conversation) = self.conversations.iter_mut().find(|c| c.id == id) else {
            return false;
        };
        debug_assert_eq!(user.role, Role::User);
        debug_assert_eq!(assistant.role, Role::Assistant);

        if conversation.messages.is_empty() && conversation.title == PLACEHOLDER_TITLE {
            conversation.title = title_from_prompt(&user.content);
        }
        conversation.messages.push(user);
        conversation.messages.push(assistant);

        info!(
            name: "chat.commit.saved",
            conversation_id = %id,
            messages = conversation.messages.len(),
            "Committed exchange"
        );
        self.persist();
        true
    }

    /// Pretty JSON backup of every conversation.
    pub fn export(&self) -> Result<String, StorageError> {
        encode_pairs(&self.conversations, true)
    }

    /// Replace all conversations with an exported backup.
    ///
    /// The open conversation is kept if it survives the import.
    pub fn import(&mut self, json: &str) -> Result<usize, StorageError> {
        self.conversations = decode_pairs(json)?;
        if self.current.as_deref().is_some_and(|id| self.get(id).is_none()) {
            self.set_current(None);
        }
        self.persist();
        Ok(self.conversations.len())
    }

    /// Keep the `keep` newest conversations. Returns how many were removed.
    pub fn prune(&mut self, keep: usize) -> usize {
        let before = self.conversations.len();
        self.conversations = newest(&self.conversations, keep);
        if self.current.as_deref().is_some_and(|id| self.get(id).is_none()) {
            self.set_current(None);
        }
        self.persist();
        before - self.conversations.len()
    }

    /// Remove every conversation and forget the open one.
    pub fn clear(&mut self) -> usize {
        let removed = self.conversations.len();
        self.conversations.clear();
        self.set_current(None);
        self.persist();
        info!(name: "chat.store.cleared", removed, "Cleared all conversations");
        removed
    }

    fn set_current(&mut self, id: Option<String>) {
        if let Err(e) = self.storage.save_current(id.as_deref()) {
            error!(
                name: "chat.storage.save_failed",
                error = %e,
                "Failed to persist current conversation"
            );
        }
        self.current = id;
    }

    /// Best-effort write-through. The in-memory state is never rolled back.
    fn persist(&self) {
        match self.storage.save(&self.conversations) {
            Ok(()) => {}
            Err(StorageError::QuotaExceeded) => {
                warn!(
                    keep = QUOTA_FALLBACK_KEEP,
                    "Storage full, saving only the most recent conversations"
                );
                let kept = newest(&self.conversations, QUOTA_FALLBACK_KEEP);
                if let Err(e) = self.storage.save(&kept) {
                    error!(name: "chat.storage.save_failed", error = %e, "Fallback save failed");
                }
            }
            Err(e) => {
                error!(name: "chat.storage.save_failed", error = %e, "Failed to save conversations");
            }
        }
    }
}

/// The `keep` newest conversations, in insertion order.
fn newest(conversations: &[Conversation], keep: usize) -> Vec<Conversation> {
    let mut order: Vec<usize> = (0..conversations.len()).rev().collect();
    order.sort_by(|&a, &b| conversations[b].created_at.cmp(&conversations[a].created_at));
    order.truncate(keep);
    order.sort_unstable();
    order.into_iter().map(|i| conversations[i].clone()).collect()
}
