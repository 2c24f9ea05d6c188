use std::path::{Path, PathBuf};

use async_trait::async_trait;
use serde_json::Value;

use super::{decode_document, encode_document, Persister};
use crate::inapp::error::PersistenceError;
use crate::inapp::message::Message;

pub const DEFAULT_FILE_NAME: &str = "inapp_messages.json";

/// Stores the whole message set as one JSON document. Writes go to a
/// temporary sibling file that is then renamed over the real one.
#[derive(Debug, Clone)]
pub struct FilePersister {
    path: PathBuf,
}

impl FilePersister {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    /// Uses [`DEFAULT_FILE_NAME`] inside `data_dir`.
    pub fn in_dir(data_dir: &Path) -> Self {
        Self::new(data_dir.join(DEFAULT_FILE_NAME))
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    fn temp_path(&self) -> PathBuf {
        let mut temp = self.path.clone().into_os_string();
        temp.push(".tmp");
        PathBuf::from(temp)
    }
}

#[async_trait]
impl Persister for FilePersister {
    async fn load(&self) -> Vec<Message> {
        let bytes = match tokio::fs::read(&self.path).await {
            Ok(bytes) => bytes,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                tracing::debug!(
                    target: "inapp_engine::persistence::file::load",
                    "No stored messages at {}",
                    self.path.display()
                );
                return Vec::new();
            }
            Err(e) => {
                tracing::warn!(
                    target: "inapp_engine::persistence::file::load",
                    "Could not read {}: {}",
                    self.path.display(),
                    e
                );
                return Vec::new();
            }
        };

        match serde_json::from_slice::<Value>(&bytes) {
            Ok(document) => decode_document(&document),
            Err(e) => {
                tracing::warn!(
                    target: "inapp_engine::persistence::file::load",
                    "Stored messages at {} are corrupt, starting empty: {}",
                    self.path.display(),
                    e
                );
                Vec::new()
            }
        }
    }

    async fn save(&self, messages: &[Message]) -> Result<(), PersistenceError> {
        if let Some(parent) = self.path.parent() {
            tokio::fs::create_dir_all(parent).await?;
        }

        let bytes = serde_json::to_vec(&encode_document(messages))?;
        let temp_path = self.temp_path();
        tokio::fs::write(&temp_path, bytes).await?;
        tokio::fs::rename(&temp_path, &self.path).await?;

        tracing::debug!(
            target: "inapp_engine::persistence::file::save",
            "Saved {} messages to {}",
            messages.len(),
            self.path.display()
        );
        Ok(())
    }

    async fn clear(&self) -> Result<(), PersistenceError> {
        match tokio::fs::remove_file(&self.path).await {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(e.into()),
        }
    }
}
