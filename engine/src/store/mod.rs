//! Task Store (§4.1): a persistent, concurrency-safe repository of task
//! records with `read-modify-write-under-lock` discipline.
//!
//! Two implementations: [`in_memory::InMemoryTaskStore`] (tests) and
//! [`file::FileTaskStore`] (one JSON file per task). Both are driven purely
//! through the [`TaskStore`] trait below.

mod file;
mod in_memory;

pub use file::FileTaskStore;
pub use in_memory::InMemoryTaskStore;

use async_trait::async_trait;

use crate::error::StoreError;
use crate::task::{Artifact, Message, Task, TaskState};

/// A mutator applied under the store's write lock. Returning `Err` aborts
/// the write; the in-memory task is left unchanged.
pub type Mutator<'a> = Box<dyn FnOnce(&mut Task) -> Result<(), StoreError> + Send + 'a>;

#[async_trait]
pub trait TaskStore: Send + Sync {
    async fn create(
        &self,
        name: String,
        system_prompt: String,
        initial_messages: Vec<Message>,
        parent_id: Option<String>,
    ) -> Result<Task, StoreError>;

    async fn get(&self, id: &str) -> Result<Task, StoreError>;

    async fn update(&self, id: &str, mutator: Mutator<'_>) -> Result<Task, StoreError>;

    async fn set_state(&self, id: &str, state: TaskState) -> Result<Task, StoreError> {
        self.update(
            id,
            Box::new(move |t| {
                t.state = state;
                Ok(())
            }),
        )
        .await
    }

    async fn add_message(&self, id: &str, message: Message) -> Result<Task, StoreError> {
        self.update(
            id,
            Box::new(move |t| {
                t.messages.push(message);
                Ok(())
            }),
        )
        .await
    }

    async fn add_artifact(&self, id: &str, artifact: Artifact) -> Result<Task, StoreError> {
        self.update(
            id,
            Box::new(move |t| {
                t.artifacts.insert(artifact.id.clone(), artifact);
                Ok(())
            }),
        )
        .await
    }

    async fn get_artifact(
        &self,
        id: &str,
        artifact_id: &str,
    ) -> Result<(Vec<u8>, Artifact), StoreError> {
        let task = self.get(id).await?;
        let artifact = task
            .artifacts
            .get(artifact_id)
            .cloned()
            .ok_or_else(|| StoreError::ArtifactNotFound {
                task_id: id.to_string(),
                artifact_id: artifact_id.to_string(),
            })?;
        Ok((artifact.bytes.clone(), artifact))
    }

    async fn list(&self) -> Result<Vec<Task>, StoreError>;

    async fn delete(&self, id: &str) -> Result<(), StoreError>;
}
