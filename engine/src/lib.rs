//! # engine
//!
//! The Task Execution Engine: the core of a single agent process that
//! drives a large-language-model through a tool-using reasoning loop.
//!
//! Clients submit tasks consisting of chat messages; the engine drives each
//! task through repeated LLM invocations, extracts tool-call directives
//! embedded in model output, dispatches tools, and reinjects their results —
//! suspending for human input when required, streaming incremental output to
//! subscribers, and persisting every state transition durably.
//!
//! ## Main modules
//!
//! - [`task`]: [`task::Task`], [`task::Message`], [`task::Part`],
//!   [`task::Artifact`] — the data model.
//! - [`store`]: [`store::TaskStore`] trait; [`store::InMemoryTaskStore`]
//!   and [`store::FileTaskStore`].
//! - [`parser`]: the lenient `<tool id="...">` extractor.
//! - [`tools`]: [`tools::Tool`] trait, [`tools::ToolRegistry`],
//!   [`tools::Dispatcher`].
//! - [`prompt`]: [`prompt::PromptBuilder`].
//! - [`llm`]: [`llm::LlmInvoker`] trait, [`llm::MockLlmInvoker`],
//!   [`llm::OpenAiLlmInvoker`].
//! - [`stream`]: [`stream::StreamingWriter`].
//! - [`executor`]: [`executor::TaskExecutor`] — the per-task driver loop.
//! - [`engine`]: [`Engine`] — the facade wiring everything together.
//!
//! ## Quick start
//!
//! ```no_run
//! use std::sync::Arc;
//! use engine::{Engine, store::InMemoryTaskStore, llm::MockLlmInvoker, prompt::PromptBuilder,
//!     tools::ToolRegistry, task::{Message, Role}};
//!
//! # async fn run() -> Result<(), engine::error::EngineError> {
//! let engine = Engine::new(
//!     Arc::new(InMemoryTaskStore::new()),
//!     Arc::new(PromptBuilder::new()),
//!     Arc::new(MockLlmInvoker::new(vec!["hello"])),
//!     ToolRegistry::new(),
//! );
//! let task_id = engine
//!     .submit("greet".into(), "".into(), vec![Message::text(Role::User, "hi")])
//!     .await?;
//! let task = engine.get(&task_id).await?;
//! println!("{:?}", task.state);
//! # Ok(())
//! # }
//! ```

pub mod engine;
pub mod error;
pub mod executor;
pub mod llm;
pub mod parser;
pub mod prompt;
pub mod store;
pub mod stream;
pub mod task;
pub mod tools;

pub use crate::engine::Engine;
pub use error::EngineError;

/// Initializes tracing from `RUST_LOG` so unit tests across `src/**` can
/// print logs with `--nocapture`.
#[cfg(test)]
mod test_logging {
    use ctor::ctor;
    use tracing_subscriber::layer::SubscriberExt;
    use tracing_subscriber::util::SubscriberInitExt;
    use tracing_subscriber::EnvFilter;
    use tracing_subscriber::Layer;

    #[ctor]
    fn init() {
        let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("warn"));
        let _ = tracing_subscriber::registry()
            .with(
                tracing_subscriber::fmt::layer()
                    .with_test_writer()
                    .with_filter(filter),
            )
            .try_init();
    }
}
