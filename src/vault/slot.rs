//! Local persisted key-value slots.
//!
//! A slot holds one string (an encrypted blob, or a second-factor
//! reference).  Absence of the slot is meaningful: no vault yet, or no
//! second factor registered.

use std::collections::HashMap;
use std::path::{Path, PathBuf};

use async_trait::async_trait;
use tokio::sync::Mutex;

use crate::errors::{CredVaultError, Result};

/// One named string slot in local storage.
#[async_trait]
pub trait Slot: Send + Sync {
    /// Current content, or `None` if the slot was never written (or was removed).
    async fn read(&self) -> Result<Option<String>>;

    /// Replace the content.  Readers must never observe a partial write.
    async fn write(&self, content: &str) -> Result<()>;

    async fn exists(&self) -> Result<bool> {
        Ok(self.read().await?.is_some())
    }

    /// Delete the slot.  Removing a missing slot is not an error.
    async fn remove(&self) -> Result<()>;
}

/// A slot stored as one file on disk.
#[derive(Debug, Clone)]
pub struct FileSlot {
    path: PathBuf,
}

impl FileSlot {
    /// Slot `name` inside directory `dir`.
    pub fn new(dir: &Path, name: &str) -> Self {
        Self {
            path: dir.join(name),
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    fn tmp_path(&self) -> PathBuf {
        let parent = self.path.parent().unwrap_or(Path::new("."));
        parent.join(format!(
            ".{}.tmp",
            self.path.file_name().unwrap_or_default().to_string_lossy()
        ))
    }
}

#[async_trait]
impl Slot for FileSlot {
    async fn read(&self) -> Result<Option<String>> {
        match tokio::fs::read_to_string(&self.path).await {
            Ok(content) => Ok(Some(content)),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(None),
            Err(e) => Err(CredVaultError::StorageError(format!(
                "failed to read {}: {e}",
                self.path.display()
            ))),
        }
    }

    async fn write(&self, content: &str) -> Result<()> {
        if let Some(parent) = self.path.parent() {
            if !parent.as_os_str().is_empty() {
                tokio::fs::create_dir_all(parent).await?;
            }
        }

        // Temp file in the same directory so the rename stays on one filesystem.
        let tmp_path = self.tmp_path();
        tokio::fs::write(&tmp_path, content).await?;

        #[cfg(unix)]
        {
            use std::os::unix::fs::PermissionsExt;
            tokio::fs::set_permissions(&tmp_path, std::fs::Permissions::from_mode(0o600)).await?;
        }

        tokio::fs::rename(&tmp_path, &self.path).await?;
        Ok(())
    }

    async fn exists(&self) -> Result<bool> {
        Ok(tokio::fs::try_exists(&self.path).await?)
    }

    async fn remove(&self) -> Result<()> {
        match tokio::fs::remove_file(&self.path).await {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(e.into()),
        }
    }
}

/// In-memory slot, for tests and ephemeral sessions.
#[derive(Debug, Default)]
pub struct MemorySlot {
    content: Mutex<Option<String>>,
}

impl MemorySlot {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_content(content: impl Into<String>) -> Self {
        Self {
            content: Mutex::new(Some(content.into())),
        }
    }
}

#[async_trait]
impl Slot for MemorySlot {
    async fn read(&self) -> Result<Option<String>> {
        Ok(self.content.lock().await.clone())
    }

    async fn write(&self, content: &str) -> Result<()> {
        *self.content.lock().await = Some(content.to_string());
        Ok(())
    }

    async fn remove(&self) -> Result<()> {
        *self.content.lock().await = None;
        Ok(())
    }
}

/// A set of named in-memory slots sharing one map, so callers can hand
/// out several slots that behave like keys of one local store.
#[derive(Debug, Default, Clone)]
pub struct MemorySlots {
    entries: std::sync::Arc<Mutex<HashMap<String, String>>>,
}

impl MemorySlots {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn slot(&self, name: &str) -> NamedMemorySlot {
        NamedMemorySlot {
            entries: self.entries.clone(),
            name: name.to_string(),
        }
    }
}

/// One key of a `MemorySlots` map.
#[derive(Debug, Clone)]
pub struct NamedMemorySlot {
    entries: std::sync::Arc<Mutex<HashMap<String, String>>>,
    name: String,
}

#[async_trait]
impl Slot for NamedMemorySlot {
    async fn read(&self) -> Result<Option<String>> {
        Ok(self.entries.lock().await.get(&self.name).cloned())
    }

    async fn write(&self, content: &str) -> Result<()> {
        self.entries
            .lock()
            .await
            .insert(self.name.clone(), content.to_string());
        Ok(())
    }

    async fn remove(&self) -> Result<()> {
        self.entries.lock().await.remove(&self.name);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[tokio::test]
    async fn file_slot_absent_until_written() {
        let dir = TempDir::new().unwrap();
        let slot = FileSlot::new(dir.path(), "vault-slot");

        assert!(!slot.exists().await.unwrap());
        assert_eq!(slot.read().await.unwrap(), None);

        slot.write("first").await.unwrap();
        slot.write("second").await.unwrap();
        assert!(slot.exists().await.unwrap());
        assert_eq!(slot.read().await.unwrap().as_deref(), Some("second"));
        assert!(!slot.tmp_path().exists());

        slot.remove().await.unwrap();
        slot.remove().await.unwrap();
        assert!(!slot.exists().await.unwrap());
    }

    #[tokio::test]
    async fn file_slot_creates_missing_directory() {
        let dir = TempDir::new().unwrap();
        let slot = FileSlot::new(&dir.path().join("nested/data"), "slot");
        slot.write("x").await.unwrap();
        assert_eq!(slot.read().await.unwrap().as_deref(), Some("x"));
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn file_slot_is_owner_only() {
        use std::os::unix::fs::PermissionsExt;

        let dir = TempDir::new().unwrap();
        let slot = FileSlot::new(dir.path(), "slot");
        slot.write("secret").await.unwrap();
        let mode = std::fs::metadata(slot.path()).unwrap().permissions().mode();
        assert_eq!(mode & 0o777, 0o600);
    }

    #[tokio::test]
    async fn named_memory_slots_are_independent() {
        let slots = MemorySlots::new();
        let a = slots.slot("a");
        let b = slots.slot("b");

        a.write("one").await.unwrap();
        assert!(a.exists().await.unwrap());
        assert!(!b.exists().await.unwrap());

        // A second handle to the same key sees the write.
        assert_eq!(slots.slot("a").read().await.unwrap().as_deref(), Some("one"));
    }
}
