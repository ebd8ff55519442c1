//! In-memory Task Store, for tests and short-lived processes.

use async_trait::async_trait;
use dashmap::DashMap;

use super::{Mutator, TaskStore};
use crate::error::StoreError;
use crate::task::{Message, Task};

#[derive(Default)]
pub struct InMemoryTaskStore {
    tasks: DashMap<String, Task>,
}

impl InMemoryTaskStore {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl TaskStore for InMemoryTaskStore {
    async fn create(
        &self,
        name: String,
        system_prompt: String,
        initial_messages: Vec<Message>,
        parent_id: Option<String>,
    ) -> Result<Task, StoreError> {
        let task = Task::new(name, system_prompt, initial_messages, parent_id);
        self.tasks.insert(task.id.clone(), task.clone());
        Ok(task)
    }

    async fn get(&self, id: &str) -> Result<Task, StoreError> {
        self.tasks
            .get(id)
            .map(|t| t.clone())
            .ok_or_else(|| StoreError::NotFound(id.to_string()))
    }

    async fn update(&self, id: &str, mutator: Mutator<'_>) -> Result<Task, StoreError> {
        // `get_mut` holds the shard's write guard for the whole closure, so
        // the read-mutate-write is atomic with respect to any other get/
        // get_mut on the same id — required by the "exactly one writer at a
        // time per task" invariant (§3).
        let mut entry = self
            .tasks
            .get_mut(id)
            .ok_or_else(|| StoreError::NotFound(id.to_string()))?;
        mutator(&mut entry)?;
        entry.touch();
        Ok(entry.clone())
    }

    async fn list(&self) -> Result<Vec<Task>, StoreError> {
        Ok(self.tasks.iter().map(|e| e.value().clone()).collect())
    }

    async fn delete(&self, id: &str) -> Result<(), StoreError> {
        self.tasks
            .remove(id)
            .map(|_| ())
            .ok_or_else(|| StoreError::NotFound(id.to_string()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::task::{Role, TaskState};

    #[tokio::test]
    async fn create_then_get_round_trips() {
        let store = InMemoryTaskStore::new();
        let created = store
            .create("t1".into(), "".into(), vec![], None)
            .await
            .unwrap();
        let fetched = store.get(&created.id).await.unwrap();
        assert_eq!(fetched.id, created.id);
        assert_eq!(fetched.state, TaskState::Submitted);
    }

    #[tokio::test]
    async fn get_missing_is_not_found() {
        let store = InMemoryTaskStore::new();
        let err = store.get("missing").await.unwrap_err();
        assert!(matches!(err, StoreError::NotFound(_)));
    }

    #[tokio::test]
    async fn update_mutates_in_place_and_bumps_updated_at() {
        let store = InMemoryTaskStore::new();
        let created = store.create("t1".into(), "".into(), vec![], None).await.unwrap();
        let before = created.updated_at;
        std::thread::sleep(std::time::Duration::from_millis(2));
        let updated = store
            .update(
                &created.id,
                Box::new(|t| {
                    t.messages.push(Message::text(Role::User, "hi"));
                    Ok(())
                }),
            )
            .await
            .unwrap();
        assert_eq!(updated.messages.len(), 1);
        assert!(updated.updated_at >= before);
    }

    #[tokio::test]
    async fn failing_mutator_leaves_task_unchanged() {
        let store = InMemoryTaskStore::new();
        let created = store.create("t1".into(), "".into(), vec![], None).await.unwrap();
        let err = store
            .update(
                &created.id,
                Box::new(|_t| Err(StoreError::Io("boom".into()))),
            )
            .await
            .unwrap_err();
        assert!(matches!(err, StoreError::Io(_)));
        let after = store.get(&created.id).await.unwrap();
        assert_eq!(after.messages.len(), 0);
    }

    #[tokio::test]
    async fn delete_removes_task() {
        let store = InMemoryTaskStore::new();
        let created = store.create("t1".into(), "".into(), vec![], None).await.unwrap();
        store.delete(&created.id).await.unwrap();
        assert!(matches!(store.get(&created.id).await, Err(StoreError::NotFound(_))));
    }

    #[tokio::test]
    async fn list_returns_all_tasks() {
        let store = InMemoryTaskStore::new();
        store.create("a".into(), "".into(), vec![], None).await.unwrap();
        store.create("b".into(), "".into(), vec![], None).await.unwrap();
        assert_eq!(store.list().await.unwrap().len(), 2);
    }
}
