//! Process-wide memory documents shared by every agent.
//!
//! Writes are serialised by a lock owned here, independent of any agent.

use std::sync::Arc;

use tokio::sync::Mutex;

use crate::error::MemoryError;
use crate::memory::procedures;
use crate::memory::store::{DocumentKind, DocumentStore, Scope};

/// Global user preferences, global procedures and the knowledge directory.
pub struct GlobalMemory {
    store: Arc<dyn DocumentStore>,
    write_lock: Mutex<()>,
}

impl GlobalMemory {
    pub fn new(store: Arc<dyn DocumentStore>) -> Self {
        Self {
            store,
            write_lock: Mutex::new(()),
        }
    }

    pub async fn user_memory(&self) -> Result<String, MemoryError> {
        Ok(self
            .store
            .get_document(&Scope::Global, DocumentKind::Memory)
            .await?
            .unwrap_or_default())
    }

    pub async fn set_user_memory(&self, text: &str) -> Result<(), MemoryError> {
        let _guard = self.write_lock.lock().await;
        self.store
            .put_document(&Scope::Global, DocumentKind::Memory, text)
            .await
    }

    pub async fn procedures(&self) -> Result<String, MemoryError> {
        Ok(self
            .store
            .get_document(&Scope::Global, DocumentKind::Procedures)
            .await?
            .unwrap_or_default())
    }

    /// Replace the global procedures document after validating it parses.
    pub async fn set_procedures(&self, text: &str) -> Result<(), MemoryError> {
        validate_procedures(text)?;
        let _guard = self.write_lock.lock().await;
        self.store
            .put_document(&Scope::Global, DocumentKind::Procedures, text)
            .await
    }

    pub async fn list_knowledge(&self) -> Result<Vec<String>, MemoryError> {
        self.store.list_knowledge().await
    }
}

/// Reject procedure text that is neither empty nor parseable.
pub fn validate_procedures(text: &str) -> Result<(), MemoryError> {
    if procedures::is_empty_document(text) {
        return Ok(());
    }
    let today = chrono::Utc::now().date_naive();
    if procedures::parse_markdown(text, today).is_empty() {
        return Err(MemoryError::InvalidProcedures);
    }
    Ok(())
}
