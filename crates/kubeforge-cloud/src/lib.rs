//! KubeForge provisioning engine
//!
//! Long-running cloud work (creating clusters, machines, load balancers) is
//! modelled in three layers:
//!
//! - **Tasks**: durable work items in a queue. Workers claim them with a
//!   compare-and-swap so each task runs on at most one worker at a time, and
//!   failed tasks are re-queued until their attempt budget is spent.
//! - **Actions**: one operation against one resource, with its status
//!   recorded on the resource. Only one action runs per resource; a newer
//!   action can cancel the running one.
//! - **Procedures**: ordered steps inside an action, checkpointed after every
//!   step so a re-run resumes where the last one stopped.
//!
//! ```text
//! ┌──────────────┐   claim    ┌──────────────┐  dispatch  ┌──────────────┐
//! │ TaskCollection│◄──────────│  WorkerPool  │───────────►│ TaskHandler  │
//! └──────┬───────┘            └──────────────┘            └──────────────┘
//!        │                                                        │
//! ┌──────▼───────┐            ┌──────────────┐            ┌──────▼───────┐
//! │ EntityStore  │◄───────────│   Actions    │◄───────────│  Resources   │
//! │ memory/file  │  persist   │  + registry  │   create   │ Kubes, Nodes │
//! └──────────────┘            └──────┬───────┘            └──────────────┘
//!                                    │
//!                             ┌──────▼───────┐
//!                             │CloudProvider │
//!                             │ (Procedures) │
//!                             └──────────────┘
//! ```

pub mod action;
pub mod collection;
pub mod engine;
pub mod error;
pub mod handlers;
pub mod kubernetes;
pub mod model;
pub mod observer;
pub mod procedure;
pub mod provider;
pub mod resources;
pub mod store;
pub mod task;
pub mod wait;
pub mod worker;

// Re-exports
pub use action::{Action, ActionBuilder, ActionHandle, ActionRegistry, ActionRuntime};
pub use collection::Collection;
pub use engine::{Engine, EngineBuilder};
pub use error::{CloudError, Result};
pub use kubernetes::{
    HeapsterMetric, HttpKubernetesConnector, KubeNode, KubernetesApi, KubernetesConnector,
};
pub use model::{
    ActionState, ActionStatus, CloudAccount, Entrypoint, EntrypointListener, Kube, Model, Node,
    Volume,
};
pub use observer::NodeObserver;
pub use procedure::Procedure;
pub use provider::{CloudProvider, NodeSize, ProviderContext, ProviderKind, ProviderRegistry};
pub use resources::{EntrypointListeners, Entrypoints, Kubes, Nodes, Volumes};
pub use store::{EntityStore, FileStore, MemoryStore};
pub use task::{DEFAULT_MAX_ATTEMPTS, DEFAULT_RETRY_DELAY, Task, TaskCollection, TaskStatus, TaskType};
pub use wait::cancellable_wait_for;
pub use worker::{HandlerRegistry, TaskHandler, TaskOutcome, Worker, WorkerPool};
