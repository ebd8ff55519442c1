//! Directory-backed Task Store: one JSON file per task, named `<id>.json`.
//!
//! A single `tokio::sync::RwLock` guards the whole store. **Public methods
//! take the lock once; private helpers assume the lock is already held.**
//! The teacher's SQLite checkpointer previously had a latent deadlock where
//! an internal helper reacquired the read lock while the caller held the
//! write lock — this type never does that (§9 "Store lock discipline").

use std::path::{Path, PathBuf};

use async_trait::async_trait;
use tokio::sync::RwLock;

use super::{Mutator, TaskStore};
use crate::error::StoreError;
use crate::task::{Message, Task};

pub struct FileTaskStore {
    dir: PathBuf,
    lock: RwLock<()>,
}

impl FileTaskStore {
    /// Creates the store, ensuring `dir` exists.
    pub async fn new(dir: impl Into<PathBuf>) -> Result<Self, StoreError> {
        let dir = dir.into();
        tokio::fs::create_dir_all(&dir).await?;
        Ok(Self {
            dir,
            lock: RwLock::new(()),
        })
    }

    fn path_for(&self, id: &str) -> PathBuf {
        self.dir.join(format!("{id}.json"))
    }

    /// Assumes the caller holds the lock. Loads and repairs one task file.
    fn load_from(path: &Path) -> Result<Task, StoreError> {
        let bytes = std::fs::read(path)?;
        let mut task: Task = serde_json::from_slice(&bytes)?;
        task.repair_on_load();
        Ok(task)
    }

    /// Assumes the caller holds the lock. Marshal-then-write; a
    /// production-strength implementation should write-then-rename for
    /// crash safety (§4.1).
    fn write_to(path: &Path, task: &Task) -> Result<(), StoreError> {
        let bytes = serde_json::to_vec_pretty(task)?;
        std::fs::write(path, bytes)?;
        Ok(())
    }

    async fn load_locked(&self, id: &str) -> Result<Task, StoreError> {
        let path = self.path_for(id);
        if !path.exists() {
            return Err(StoreError::NotFound(id.to_string()));
        }
        tokio::task::spawn_blocking(move || Self::load_from(&path))
            .await
            .map_err(|e| StoreError::Io(e.to_string()))?
    }

    async fn write_locked(&self, task: &Task) -> Result<(), StoreError> {
        let path = self.path_for(&task.id);
        let task = task.clone();
        tokio::task::spawn_blocking(move || Self::write_to(&path, &task))
            .await
            .map_err(|e| StoreError::Io(e.to_string()))?
    }
}

#[async_trait]
impl TaskStore for FileTaskStore {
    async fn create(
        &self,
        name: String,
        system_prompt: String,
        initial_messages: Vec<Message>,
        parent_id: Option<String>,
    ) -> Result<Task, StoreError> {
        let task = Task::new(name, system_prompt, initial_messages, parent_id);
        let _guard = self.lock.write().await;
        self.write_locked(&task).await?;
        tracing::debug!(task_id = %task.id, "task created");
        Ok(task)
    }

    async fn get(&self, id: &str) -> Result<Task, StoreError> {
        let _guard = self.lock.read().await;
        self.load_locked(id).await
    }

    async fn update(&self, id: &str, mutator: Mutator<'_>) -> Result<Task, StoreError> {
        let _guard = self.lock.write().await;
        let mut task = self.load_locked(id).await?;
        mutator(&mut task)?;
        task.touch();
        self.write_locked(&task).await?;
        tracing::debug!(task_id = %id, "task updated");
        Ok(task)
    }

    async fn list(&self) -> Result<Vec<Task>, StoreError> {
        let _guard = self.lock.read().await;
        let mut entries = tokio::fs::read_dir(&self.dir).await?;
        let mut tasks = Vec::new();
        while let Some(entry) = entries.next_entry().await? {
            let path = entry.path();
            if path.extension().and_then(|e| e.to_str()) != Some("json") {
                continue;
            }
            match Self::load_from(&path) {
                Ok(task) => tasks.push(task),
                Err(e) => {
                    tracing::warn!(path = %path.display(), error = %e, "skipping unreadable task file");
                }
            }
        }
        Ok(tasks)
    }

    async fn delete(&self, id: &str) -> Result<(), StoreError> {
        let _guard = self.lock.write().await;
        let path = self.path_for(id);
        if !path.exists() {
            return Err(StoreError::NotFound(id.to_string()));
        }
        tokio::fs::remove_file(path).await?;
        tracing::debug!(task_id = %id, "task deleted");
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::task::{Role, TaskState};

    async fn store() -> (FileTaskStore, tempfile::TempDir) {
        let dir = tempfile::tempdir().unwrap();
        let store = FileTaskStore::new(dir.path()).await.unwrap();
        (store, dir)
    }

    #[tokio::test]
    async fn create_writes_one_json_file_per_task() {
        let (store, dir) = store().await;
        let task = store.create("t1".into(), "".into(), vec![], None).await.unwrap();
        let path = dir.path().join(format!("{}.json", task.id));
        assert!(path.exists());
    }

    #[tokio::test]
    async fn get_round_trips_through_disk() {
        let (store, _dir) = store().await;
        let created = store
            .create("t1".into(), "sys".into(), vec![Message::text(Role::User, "hi")], None)
            .await
            .unwrap();
        let fetched = store.get(&created.id).await.unwrap();
        assert_eq!(fetched.system_prompt, "sys");
        assert_eq!(fetched.messages.len(), 1);
    }

    #[tokio::test]
    async fn get_missing_is_not_found() {
        let (store, _dir) = store().await;
        assert!(matches!(store.get("missing").await, Err(StoreError::NotFound(_))));
    }

    #[tokio::test]
    async fn update_persists_mutation_to_disk() {
        let (store, _dir) = store().await;
        let created = store.create("t1".into(), "".into(), vec![], None).await.unwrap();
        store
            .update(
                &created.id,
                Box::new(|t| {
                    t.state = TaskState::Working;
                    Ok(())
                }),
            )
            .await
            .unwrap();
        let fetched = store.get(&created.id).await.unwrap();
        assert_eq!(fetched.state, TaskState::Working);
    }

    #[tokio::test]
    async fn list_skips_unreadable_files_with_warning() {
        let (store, dir) = store().await;
        store.create("t1".into(), "".into(), vec![], None).await.unwrap();
        std::fs::write(dir.path().join("garbage.json"), b"not json").unwrap();
        let tasks = store.list().await.unwrap();
        assert_eq!(tasks.len(), 1);
    }

    #[tokio::test]
    async fn delete_removes_file() {
        let (store, dir) = store().await;
        let created = store.create("t1".into(), "".into(), vec![], None).await.unwrap();
        store.delete(&created.id).await.unwrap();
        assert!(!dir.path().join(format!("{}.json", created.id)).exists());
    }
}
