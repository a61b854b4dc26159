//! Per-resource lifecycle
//!
//! An `EventResource` is either `Active` (no deletion timestamp) or
//! `Finalizing` (deletion requested). Both states run the declared
//! operations and persist the aggregate result. `Finalizing` then reverses
//! every `create` and only afterwards releases the finalizer, so the API
//! server cannot drop the resource while objects it created still exist.

use std::sync::Arc;

use kube::runtime::controller::Action;
use kube::{Resource, ResourceExt};
use mallory_crd::{EventResource, EventStatus, RunResult, FINALIZER};
use tracing::{debug, info, instrument, warn};

use crate::config::OperatorConfig;
use crate::dispatcher::OperationDispatcher;
use crate::error::{Error, Result};
use crate::events::{EventSink, OperationEvent};
use crate::store::EventStore;

/// Shared state handed to every reconcile invocation
pub struct Context {
    store: Arc<dyn EventStore>,
    dispatcher: OperationDispatcher,
    events: Arc<dyn EventSink>,
    config: OperatorConfig,
}

impl Context {
    /// Create context
    #[must_use]
    pub fn new(
        store: Arc<dyn EventStore>,
        dispatcher: OperationDispatcher,
        events: Arc<dyn EventSink>,
        config: OperatorConfig,
    ) -> Self {
        Self {
            store,
            dispatcher,
            events,
            config,
        }
    }

    /// Operator configuration
    #[inline]
    #[must_use]
    pub fn config(&self) -> &OperatorConfig {
        &self.config
    }
}

/// Lifecycle state of one resource
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Lifecycle {
    /// No deletion requested
    Active {
        /// Whether our finalizer is already on the resource
        has_finalizer: bool,
    },
    /// Deletion requested
    Finalizing {
        /// Whether our finalizer still blocks removal
        has_finalizer: bool,
    },
}

impl Lifecycle {
    /// Classify a resource
    #[must_use]
    pub fn of(event: &EventResource) -> Self {
        let has_finalizer = event.finalizers().iter().any(|f| f == FINALIZER);
        if event.meta().deletion_timestamp.is_some() {
            Self::Finalizing { has_finalizer }
        } else {
            Self::Active { has_finalizer }
        }
    }

    /// Finalizer must be added before anything else
    #[inline]
    #[must_use]
    pub fn needs_finalizer(self) -> bool {
        matches!(self, Self::Active { has_finalizer: false })
    }

    /// Our cleanup already completed; nothing left to do
    #[inline]
    #[must_use]
    pub fn is_released(self) -> bool {
        matches!(self, Self::Finalizing { has_finalizer: false })
    }

    /// Created objects must be reversed this pass
    #[inline]
    #[must_use]
    pub fn needs_cleanup(self) -> bool {
        matches!(self, Self::Finalizing { has_finalizer: true })
    }
}

/// Finalizer list with ours present exactly once
#[must_use]
pub fn with_finalizer(finalizers: &[String]) -> Vec<String> {
    let mut out: Vec<String> = finalizers.iter().filter(|f| *f != FINALIZER).cloned().collect();
    out.push(FINALIZER.to_string());
    out
}

/// Finalizer list with ours removed, others kept in order
#[must_use]
pub fn without_finalizer(finalizers: &[String]) -> Vec<String> {
    finalizers.iter().filter(|f| *f != FINALIZER).cloned().collect()
}

/// Reconcile one `EventResource`
///
/// Operation failures are folded into the status; only persistence and
/// cleanup failures are returned to the scheduler.
///
/// # Errors
/// `Persistence` when a finalizer or status write fails, `Cleanup` when a
/// created object cannot be deleted
#[instrument(
    skip_all,
    fields(event = %event.name_any(), namespace = %event.namespace().unwrap_or_default())
)]
pub async fn reconcile(event: Arc<EventResource>, ctx: Arc<Context>) -> Result<Action> {
    let state = Lifecycle::of(&event);
    if state.is_released() {
        debug!("deletion in progress without our finalizer");
        return Ok(Action::await_change());
    }

    let namespace = event.namespace().unwrap_or_default();
    let mut current = (*event).clone();

    if state.needs_finalizer() {
        current = ctx
            .store
            .set_finalizers(&current, with_finalizer(current.finalizers()))
            .await?;
        debug!("finalizer added");
    }

    let result = run_operations(&current, &ctx, &namespace).await;
    current = ctx
        .store
        .set_status(&current, &EventStatus { result: Some(result) })
        .await?;
    info!(result = result.as_str(), operations = current.spec.operations.len(), "pass complete");

    if state.needs_cleanup() {
        cleanup(&current, &ctx, &namespace).await?;
        ctx.store
            .set_finalizers(&current, without_finalizer(current.finalizers()))
            .await?;
        info!("cleanup complete, finalizer removed");
    }

    Ok(Action::await_change())
}

/// Requeue after a failed pass
pub fn error_policy(event: Arc<EventResource>, error: &Error, ctx: Arc<Context>) -> Action {
    warn!(
        event = %event.name_any(),
        error = %error,
        kind = error.kind(),
        retryable = error.is_retryable(),
        "reconcile failed"
    );
    Action::requeue(ctx.config.error_requeue())
}

/// Run every operation in declaration order; one failure never stops the rest
async fn run_operations(event: &EventResource, ctx: &Context, namespace: &str) -> RunResult {
    let reference = event.object_ref(&());
    let mut failed = 0;

    for op in &event.spec.operations {
        match ctx.dispatcher.execute(op, &event.spec.intruder, namespace).await {
            Ok(output) => {
                ctx.events.record(&reference, &op.id, &OperationEvent::Succeeded).await;
                if !output.is_empty() {
                    ctx.events
                        .record(&reference, &op.id, &OperationEvent::Output(output))
                        .await;
                }
            }
            Err(err) => {
                failed += 1;
                warn!(
                    operation = %op.id,
                    verb = %op.verb,
                    kind = err.kind(),
                    error = %err,
                    "operation failed"
                );
                ctx.events
                    .record(&reference, &op.id, &OperationEvent::Failed(err.to_string()))
                    .await;
            }
        }
    }

    RunResult::from_failures(failed)
}

/// Reverse every `create`; the first failure aborts
async fn cleanup(event: &EventResource, ctx: &Context, namespace: &str) -> Result<()> {
    for op in event.spec.operations.iter().filter(|op| op.is_reversible()) {
        ctx.dispatcher
            .reverse(op, &event.spec.intruder, namespace)
            .await
            .map_err(|source| Error::Cleanup {
                id: op.id.clone(),
                source: Box::new(source),
            })?;
        debug!(operation = %op.id, "created object reversed");
    }
    Ok(())
}
