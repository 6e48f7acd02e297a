//! Actions: one provisioning operation against one resource
//!
//! An [`Action`] wraps a closure that mutates a [`Model`] and tracks its
//! progress in the model's embedded [`ActionStatus`]. Actions run either
//! inline ([`Action::now`]) or on a background task ([`Action::run_async`]).
//!
//! At most one action runs per resource identity. An action built with
//! `cancel_existing` signals the in-flight action on the same resource and
//! waits for it to finish before doing anything itself; otherwise the second
//! action is rejected with `Conflict`.
//!
//! ```ignore
//! runtime
//!     .action(kube)
//!     .description("provisioning")
//!     .max_retries(20)
//!     .run(move |action, kube| Box::pin(async move {
//!         provider.create_kube(&engine, kube, action).await
//!     }))
//!     .run_async()
//!     .await?;
//! ```

use futures_util::future::BoxFuture;
use parking_lot::Mutex;
use std::collections::HashMap;
use std::future::Future;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;
use tokio_util::sync::CancellationToken;

use crate::collection::{Collection, save_model};
use crate::error::{CloudError, Result};
use crate::model::{ActionState, ActionStatus, Model};
use crate::store::EntityStore;
use crate::wait;

/// The operation run by an action
pub type ActionFn<M> = Box<
    dyn for<'a> FnOnce(&'a ActionHandle, &'a mut M) -> BoxFuture<'a, Result<()>> + Send,
>;

/// Reloads the model (and whatever it needs) before the action runs
pub type ScopeFn<M> =
    Box<dyn FnOnce(Arc<dyn EntityStore>, M) -> BoxFuture<'static, Result<M>> + Send>;

struct InFlight {
    generation: u64,
    cancel: CancellationToken,
    done: CancellationToken,
}

/// In-flight actions, keyed by resource identity
#[derive(Default)]
pub struct ActionRegistry {
    inflight: Mutex<HashMap<String, InFlight>>,
    generation: AtomicU64,
}

impl ActionRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn is_running(&self, resource_id: &str) -> bool {
        self.inflight.lock().contains_key(resource_id)
    }

    /// Register a new action on `resource_id`.
    ///
    /// With `cancel_existing`, any in-flight action on the resource is
    /// cancelled and awaited first.
    pub async fn acquire(
        self: &Arc<Self>,
        resource_id: &str,
        cancel_existing: bool,
    ) -> Result<ActionGuard> {
        loop {
            let existing_done = {
                let mut inflight = self.inflight.lock();
                match inflight.get(resource_id) {
                    None => {
                        let generation = self.generation.fetch_add(1, Ordering::Relaxed);
                        let cancel = CancellationToken::new();
                        let done = CancellationToken::new();
                        inflight.insert(
                            resource_id.to_string(),
                            InFlight {
                                generation,
                                cancel: cancel.clone(),
                                done: done.clone(),
                            },
                        );
                        return Ok(ActionGuard {
                            registry: self.clone(),
                            resource_id: resource_id.to_string(),
                            generation,
                            cancel,
                            done,
                        });
                    }
                    Some(existing) if cancel_existing => {
                        existing.cancel.cancel();
                        existing.done.clone()
                    }
                    Some(_) => {
                        return Err(CloudError::Conflict(format!(
                            "an action is already running on {}",
                            resource_id
                        )));
                    }
                }
            };

            tracing::info!("Cancelling in-flight action on {}", resource_id);
            existing_done.cancelled().await;
        }
    }
}

/// Registration of a running action; dropping it acknowledges termination
pub struct ActionGuard {
    registry: Arc<ActionRegistry>,
    resource_id: String,
    generation: u64,
    cancel: CancellationToken,
    done: CancellationToken,
}

impl ActionGuard {
    pub fn cancellation_token(&self) -> &CancellationToken {
        &self.cancel
    }
}

impl Drop for ActionGuard {
    fn drop(&mut self) {
        {
            let mut inflight = self.registry.inflight.lock();
            if inflight
                .get(&self.resource_id)
                .is_some_and(|e| e.generation == self.generation)
            {
                inflight.remove(&self.resource_id);
            }
        }
        // Removal must be visible before waiters re-check the map
        self.done.cancel();
    }
}

/// Handle passed to a running action's closure
#[derive(Clone)]
pub struct ActionHandle {
    description: String,
    resource_id: String,
    cancel: CancellationToken,
    store: Arc<dyn EntityStore>,
}

impl ActionHandle {
    pub fn description(&self) -> &str {
        &self.description
    }

    pub fn resource_id(&self) -> &str {
        &self.resource_id
    }

    pub fn store(&self) -> &Arc<dyn EntityStore> {
        &self.store
    }

    pub fn is_cancelled(&self) -> bool {
        self.cancel.is_cancelled()
    }

    /// Poll `predicate` until it holds, honouring this action's cancellation.
    ///
    /// See [`wait::cancellable_wait_for`].
    pub async fn cancellable_wait_for<F, Fut>(
        &self,
        description: &str,
        timeout: Duration,
        interval: Duration,
        predicate: F,
    ) -> Result<()>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = Result<bool>>,
    {
        wait::cancellable_wait_for(&self.cancel, description, timeout, interval, predicate).await
    }
}

/// Shared dependencies for building actions
#[derive(Clone)]
pub struct ActionRuntime {
    store: Arc<dyn EntityStore>,
    registry: Arc<ActionRegistry>,
}

impl ActionRuntime {
    pub fn new(store: Arc<dyn EntityStore>) -> Self {
        Self {
            store,
            registry: Arc::new(ActionRegistry::new()),
        }
    }

    pub fn store(&self) -> &Arc<dyn EntityStore> {
        &self.store
    }

    pub fn registry(&self) -> &Arc<ActionRegistry> {
        &self.registry
    }

    /// Start building an action against `model`
    pub fn action<M: Model>(&self, model: M) -> ActionBuilder<M> {
        ActionBuilder {
            runtime: self.clone(),
            status: ActionStatus::new("running", 0),
            resource_id: None,
            model,
            scope: None,
            target_id: None,
            cancel_existing: false,
        }
    }
}

/// Configuration for an [`Action`]
pub struct ActionBuilder<M: Model> {
    runtime: ActionRuntime,
    status: ActionStatus,
    resource_id: Option<String>,
    model: M,
    scope: Option<ScopeFn<M>>,
    target_id: Option<String>,
    cancel_existing: bool,
}

impl<M: Model> ActionBuilder<M> {
    pub fn description(mut self, description: impl Into<String>) -> Self {
        self.status.description = description.into();
        self
    }

    pub fn max_retries(mut self, max_retries: u32) -> Self {
        self.status.max_retries = max_retries;
        self
    }

    /// Identity used for mutual exclusion; defaults to the model's uuid
    pub fn resource_id(mut self, resource_id: impl Into<String>) -> Self {
        self.resource_id = Some(resource_id.into());
        self
    }

    pub fn scope<F>(mut self, scope: F) -> Self
    where
        F: FnOnce(Arc<dyn EntityStore>, M) -> BoxFuture<'static, Result<M>> + Send + 'static,
    {
        self.scope = Some(Box::new(scope));
        self
    }

    /// Primary key of the record a delete-style action removes.
    ///
    /// The record is reloaded by this id before running (unless a scope is
    /// set), and its disappearance afterwards is not an error.
    pub fn target_id(mut self, id: impl Into<String>) -> Self {
        self.target_id = Some(id.into());
        self
    }

    pub fn cancel_existing(mut self, cancel_existing: bool) -> Self {
        self.cancel_existing = cancel_existing;
        self
    }

    pub fn run<F>(self, f: F) -> Action<M>
    where
        F: for<'a> FnOnce(&'a ActionHandle, &'a mut M) -> BoxFuture<'a, Result<()>>
            + Send
            + 'static,
    {
        let resource_id = self
            .resource_id
            .unwrap_or_else(|| self.model.uuid().to_string());
        Action {
            runtime: self.runtime,
            status: self.status,
            resource_id,
            model: self.model,
            scope: self.scope,
            target_id: self.target_id,
            cancel_existing: self.cancel_existing,
            f: Box::new(f),
        }
    }
}

/// A configured, not yet started action
pub struct Action<M: Model> {
    runtime: ActionRuntime,
    status: ActionStatus,
    resource_id: String,
    model: M,
    scope: Option<ScopeFn<M>>,
    target_id: Option<String>,
    cancel_existing: bool,
    f: ActionFn<M>,
}

impl<M: Model> Action<M> {
    pub fn resource_id(&self) -> &str {
        &self.resource_id
    }

    pub fn status(&self) -> &ActionStatus {
        &self.status
    }

    /// Run the action on the caller's task and return its result
    pub async fn now(self) -> Result<()> {
        let guard = self
            .runtime
            .registry
            .acquire(&self.resource_id, self.cancel_existing)
            .await?;
        let prepared = self.prepare().await?;
        prepared.execute(guard).await
    }

    /// Persist the initial status and run the action on a background task.
    ///
    /// Returns once the action is registered (any superseded action has
    /// terminated) and its status is persisted. Progress is observable only
    /// through the resource's `action_status`.
    pub async fn run_async(self) -> Result<()> {
        let guard = self
            .runtime
            .registry
            .acquire(&self.resource_id, self.cancel_existing)
            .await?;
        let prepared = self.prepare().await?;
        tokio::spawn(async move {
            let resource_id = prepared.resource_id.clone();
            if let Err(e) = prepared.execute(guard).await {
                tracing::warn!("Action on {} failed: {}", resource_id, e);
            }
        });
        Ok(())
    }

    async fn prepare(self) -> Result<Prepared<M>> {
        let Action {
            runtime,
            mut status,
            resource_id,
            mut model,
            scope,
            target_id,
            f,
            ..
        } = self;
        let store = runtime.store;

        if let Some(scope) = scope {
            model = scope(store.clone(), model).await?;
        } else if let Some(id) = &target_id {
            model = Collection::<M>::new(store.clone()).get(id).await?;
        }

        // carry advisory retry bookkeeping over from a previous run
        if let Some(previous) = model.action_status() {
            if previous.description == status.description {
                status.retries = previous.retries;
            }
        }
        status.state = ActionState::Running;
        status.error = None;
        model.set_action_status(Some(status.clone()));
        save_model(store.as_ref(), &model).await?;

        tracing::info!("Started {} action on {}", status.description, resource_id);
        Ok(Prepared {
            store,
            status,
            resource_id,
            model,
            target_id,
            f,
        })
    }
}

struct Prepared<M: Model> {
    store: Arc<dyn EntityStore>,
    status: ActionStatus,
    resource_id: String,
    model: M,
    target_id: Option<String>,
    f: ActionFn<M>,
}

impl<M: Model> Prepared<M> {
    async fn execute(self, guard: ActionGuard) -> Result<()> {
        let Prepared {
            store,
            mut status,
            resource_id,
            mut model,
            target_id,
            f,
        } = self;

        let handle = ActionHandle {
            description: status.description.clone(),
            resource_id: resource_id.clone(),
            cancel: guard.cancellation_token().clone(),
            store: store.clone(),
        };

        let result = f(&handle, &mut model).await;

        match &result {
            Ok(()) => {
                status.state = ActionState::Succeeded;
                status.error = None;
            }
            Err(e) if e.is_cancelled() => {
                status.state = ActionState::Cancelled;
                status.error = Some(e.to_string());
            }
            Err(e) => {
                status.state = ActionState::Failed;
                status.retries += 1;
                status.error = Some(e.to_string());
            }
        }
        tracing::info!(
            "{} action on {} {}",
            status.description,
            resource_id,
            status.state
        );

        model.set_action_status(Some(status));
        let persisted = match save_model(store.as_ref(), &model).await {
            Err(e) if e.is_not_found() && target_id.is_some() => {
                tracing::debug!("{} was removed by its action", resource_id);
                Ok(())
            }
            other => other,
        };

        // The guard outlives the final persist so a successor never races it
        drop(guard);
        result.and(persisted)
    }
}
