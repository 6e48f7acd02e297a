//! Checkpointed step sequences
//!
//! A [`Procedure`] runs its steps strictly in order against one model and
//! saves the model after every successful step. Steps are expected to skip
//! work that a previous (interrupted) run already applied, which lets a
//! procedure be re-run after a crash without repeating non-idempotent
//! provider calls.

use futures_util::future::BoxFuture;
use std::sync::Arc;

use crate::collection::save_model;
use crate::error::Result;
use crate::model::Model;
use crate::store::EntityStore;

type StepFn<M> = Box<dyn for<'a> FnOnce(&'a mut M) -> BoxFuture<'a, Result<()>> + Send>;

struct Step<M> {
    description: String,
    f: StepFn<M>,
}

pub struct Procedure<M: Model> {
    name: String,
    store: Arc<dyn EntityStore>,
    steps: Vec<Step<M>>,
}

impl<M: Model> Procedure<M> {
    pub fn new(name: impl Into<String>, store: Arc<dyn EntityStore>) -> Self {
        Self {
            name: name.into(),
            store,
            steps: Vec::new(),
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn len(&self) -> usize {
        self.steps.len()
    }

    pub fn is_empty(&self) -> bool {
        self.steps.is_empty()
    }

    /// Append a step; steps run in the order they were added
    pub fn add_step<F>(&mut self, description: impl Into<String>, f: F)
    where
        F: for<'a> FnOnce(&'a mut M) -> BoxFuture<'a, Result<()>> + Send + 'static,
    {
        self.steps.push(Step {
            description: description.into(),
            f: Box::new(f),
        });
    }

    /// Run every step, checkpointing `model` after each one.
    ///
    /// The first failing step stops the run; its error is returned as-is and
    /// no checkpoint is taken for it.
    pub async fn run(self, model: &mut M) -> Result<()> {
        for step in self.steps {
            tracing::info!(
                "Running step of {} procedure: {}",
                self.name,
                step.description
            );
            (step.f)(&mut *model).await?;
            save_model(self.store.as_ref(), model).await?;
        }
        Ok(())
    }
}
