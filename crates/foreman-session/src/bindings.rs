use async_trait::async_trait;
use chrono::{DateTime, Utc};
use foreman_core::{EngineKind, ForemanError, ForemanResult};
use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use tokio::sync::Mutex;

/// The engine session the main conversation is currently bound to.
///
/// A resume is only attempted when the requested engine matches
/// [`SessionBinding::engine`]; any other engine starts a fresh session.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SessionBinding {
    /// Engine that issued the session id.
    pub engine: EngineKind,
    /// Engine-native session / thread id.
    pub session_id: String,
    /// When the binding was last refreshed.
    pub updated_at: DateTime<Utc>,
}

impl SessionBinding {
    /// Binds `session_id` to `engine` as of now.
    pub fn new(engine: EngineKind, session_id: impl Into<String>) -> Self {
        Self {
            engine,
            session_id: session_id.into(),
            updated_at: Utc::now(),
        }
    }

    /// The session id to resume with, if it belongs to `engine`.
    pub fn resumable_for(&self, engine: EngineKind) -> Option<&str> {
        (self.engine == engine && !self.session_id.is_empty()).then_some(self.session_id.as_str())
    }
}

/// Persistence for the current [`SessionBinding`].
#[async_trait]
pub trait BindingStore: Send + Sync {
    /// Reads the stored binding, if any.
    async fn load(&self) -> ForemanResult<Option<SessionBinding>>;
    /// Replaces the stored binding; `None` clears it.
    async fn save(&self, binding: Option<&SessionBinding>) -> ForemanResult<()>;
}

/// Binding kept in a small JSON file (`sessions.json`).
pub struct FileBindingStore {
    path: PathBuf,
}

impl FileBindingStore {
    /// Uses `dir/sessions.json`, creating `dir` if needed.
    pub async fn new(dir: PathBuf) -> ForemanResult<Self> {
        tokio::fs::create_dir_all(&dir).await?;
        Ok(Self {
            path: dir.join("sessions.json"),
        })
    }
}

#[async_trait]
impl BindingStore for FileBindingStore {
    async fn load(&self) -> ForemanResult<Option<SessionBinding>> {
        if !self.path.exists() {
            return Ok(None);
        }
        let data = tokio::fs::read_to_string(&self.path).await?;
        if data.trim().is_empty() {
            return Ok(None);
        }
        let binding = serde_json::from_str(&data)
            .map_err(|e| ForemanError::Session(format!("Failed to parse session binding: {e}")))?;
        Ok(Some(binding))
    }

    async fn save(&self, binding: Option<&SessionBinding>) -> ForemanResult<()> {
        match binding {
            Some(b) => {
                let json = serde_json::to_string_pretty(b)?;
                tokio::fs::write(&self.path, json).await?;
            }
            None => {
                if self.path.exists() {
                    tokio::fs::remove_file(&self.path).await?;
                }
            }
        }
        Ok(())
    }
}

/// In-process binding store for tests.
#[derive(Default)]
pub struct MemoryBindingStore {
    binding: Mutex<Option<SessionBinding>>,
}

impl MemoryBindingStore {
    /// Creates an empty store.
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl BindingStore for MemoryBindingStore {
    async fn load(&self) -> ForemanResult<Option<SessionBinding>> {
        Ok(self.binding.lock().await.clone())
    }

    async fn save(&self, binding: Option<&SessionBinding>) -> ForemanResult<()> {
        *self.binding.lock().await = binding.cloned();
        Ok(())
    }
}
