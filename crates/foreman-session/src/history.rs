use async_trait::async_trait;
use foreman_core::{ForemanError, ForemanResult, Message};
use std::path::PathBuf;
use tokio::io::AsyncWriteExt;
use tokio::sync::Mutex;
use uuid::Uuid;

// ---------------------------------------------------------------------------
// HistoryStore trait
// ---------------------------------------------------------------------------

/// Durable, ordered conversation history.
///
/// The supervisor and the queue coordinator are the only writers. Every user
/// message is inserted exactly once: immediately when it starts a run, or at
/// drain time when it was queued behind a busy worker.
#[async_trait]
pub trait HistoryStore: Send + Sync {
    /// Appends a message and returns its id.
    async fn insert(&self, message: Message) -> ForemanResult<Uuid>;
    /// The `limit` most recent messages, oldest first.
    async fn recent(&self, limit: usize) -> ForemanResult<Vec<Message>>;
}

// ---------------------------------------------------------------------------
// FileHistoryStore
// ---------------------------------------------------------------------------

/// JSON-lines history file, one message per line.
pub struct FileHistoryStore {
    path: PathBuf,
    write_lock: Mutex<()>,
}

impl FileHistoryStore {
    /// Opens (or prepares) `dir/history.jsonl`.
    pub async fn new(dir: PathBuf) -> ForemanResult<Self> {
        tokio::fs::create_dir_all(&dir).await?;
        Ok(Self {
            path: dir.join("history.jsonl"),
            write_lock: Mutex::new(()),
        })
    }
}

#[async_trait]
impl HistoryStore for FileHistoryStore {
    async fn insert(&self, message: Message) -> ForemanResult<Uuid> {
        let _guard = self.write_lock.lock().await;
        let id = message.id;
        let mut file = tokio::fs::OpenOptions::new()
            .create(true)
            .append(true)
            .open(&self.path)
            .await?;
        let mut line = serde_json::to_string(&message)?;
        line.push('\n');
        file.write_all(line.as_bytes()).await?;
        file.flush().await?;
        Ok(id)
    }

    async fn recent(&self, limit: usize) -> ForemanResult<Vec<Message>> {
        if !self.path.exists() {
            return Ok(Vec::new());
        }
        let data = tokio::fs::read_to_string(&self.path).await?;
        let mut messages = Vec::new();
        for (lineno, line) in data.lines().enumerate() {
            if line.trim().is_empty() {
                continue;
            }
            match serde_json::from_str::<Message>(line) {
                Ok(msg) => messages.push(msg),
                Err(e) => {
                    tracing::warn!(line = lineno + 1, error = %e, "Skipping corrupt history line");
                }
            }
        }
        let skip = messages.len().saturating_sub(limit);
        Ok(messages.split_off(skip))
    }
}

// ---------------------------------------------------------------------------
// MemoryHistoryStore
// ---------------------------------------------------------------------------

/// In-process history, used by tests and ephemeral hosts.
#[derive(Default)]
pub struct MemoryHistoryStore {
    messages: Mutex<Vec<Message>>,
}

impl MemoryHistoryStore {
    /// Creates an empty store.
    pub fn new() -> Self {
        Self::default()
    }

    /// Every stored message, oldest first.
    pub async fn all(&self) -> Vec<Message> {
        self.messages.lock().await.clone()
    }

    /// Number of stored messages.
    pub async fn len(&self) -> usize {
        self.messages.lock().await.len()
    }

    /// Whether nothing has been stored yet.
    pub async fn is_empty(&self) -> bool {
        self.messages.lock().await.is_empty()
    }
}

#[async_trait]
impl HistoryStore for MemoryHistoryStore {
    async fn insert(&self, message: Message) -> ForemanResult<Uuid> {
        if message.content.is_empty() {
            return Err(ForemanError::Session("refusing to store an empty message".into()));
        }
        let id = message.id;
        self.messages.lock().await.push(message);
        Ok(id)
    }

    async fn recent(&self, limit: usize) -> ForemanResult<Vec<Message>> {
        let messages = self.messages.lock().await;
        let skip = messages.len().saturating_sub(limit);
        Ok(messages[skip..].to_vec())
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use super::*;
    use foreman_core::{EngineKind, Role};
    use tempfile::TempDir;

    #[tokio::test]
    async fn append_and_read_round_trip() {
        let tmp = TempDir::new().unwrap();
        let store = FileHistoryStore::new(tmp.path().to_path_buf()).await.unwrap();

        let msg = Message::assistant("hello").with_engine(EngineKind::Claude, "sonnet");
        let id = store.insert(msg.clone()).await.unwrap();
        assert_eq!(id, msg.id);

        let recent = store.recent(10).await.unwrap();
        assert_eq!(recent.len(), 1);
        assert_eq!(recent[0].content, "hello");
        assert_eq!(recent[0].engine, Some(EngineKind::Claude));
    }

    #[tokio::test]
    async fn empty_history_returns_empty_vec() {
        let tmp = TempDir::new().unwrap();
        let store = FileHistoryStore::new(tmp.path().to_path_buf()).await.unwrap();
        assert!(store.recent(5).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn recent_keeps_newest_in_order() {
        let tmp = TempDir::new().unwrap();
        let store = FileHistoryStore::new(tmp.path().to_path_buf()).await.unwrap();
        for i in 0..5 {
            store.insert(Message::user(format!("m{i}"))).await.unwrap();
        }
        let recent = store.recent(2).await.unwrap();
        let contents: Vec<_> = recent.iter().map(|m| m.content.as_str()).collect();
        assert_eq!(contents, vec!["m3", "m4"]);
    }

    #[tokio::test]
    async fn corrupt_lines_are_skipped() {
        let tmp = TempDir::new().unwrap();
        let store = FileHistoryStore::new(tmp.path().to_path_buf()).await.unwrap();
        store.insert(Message::user("before")).await.unwrap();
        tokio::fs::write(
            tmp.path().join("history.jsonl"),
            format!(
                "{}\nnot json\n",
                serde_json::to_string(&Message::user("kept")).unwrap()
            ),
        )
        .await
        .unwrap();
        let recent = store.recent(10).await.unwrap();
        assert_eq!(recent.len(), 1);
        assert_eq!(recent[0].content, "kept");
    }

    #[tokio::test]
    async fn file_persistence_across_store_instances() {
        let tmp = TempDir::new().unwrap();
        let dir = tmp.path().to_path_buf();
        {
            let store = FileHistoryStore::new(dir.clone()).await.unwrap();
            store.insert(Message::system("persist me")).await.unwrap();
        }
        let store2 = FileHistoryStore::new(dir).await.unwrap();
        let recent = store2.recent(1).await.unwrap();
        assert_eq!(recent[0].role, Role::System);
        assert_eq!(recent[0].content, "persist me");
    }

    #[tokio::test]
    async fn memory_store_rejects_empty() {
        let store = MemoryHistoryStore::new();
        assert!(store.insert(Message::user("")).await.is_err());
        assert!(store.is_empty().await);
    }
}
