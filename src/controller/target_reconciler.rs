//! ScalableTarget reconciliation
//!
//! [`sync_target`] and [`finalize_target`] hold the pass logic and only talk
//! to the remote system, so they can be driven without a cluster. The
//! `reconcile_target` wrapper adds finalizers, status writes and metrics.

use std::sync::Arc;
use std::time::{Duration, Instant};

use chrono::{DateTime, Utc};
use kube::runtime::controller::Action;
use kube::{Api, Resource, ResourceExt};
use tracing::{debug, info, instrument, warn};

use crate::aws::TargetKey;
use crate::config::OperatorConfig;
use crate::controller::context::Context;
use crate::controller::diff::{identity_change, target_key};
use crate::controller::error::{Error, FailureAction, Result, requeue_after_error};
use crate::controller::finalizer::{add_finalizer, has_finalizer, remove_finalizer};
use crate::controller::identity::{IdentityRegistry, owner_key};
use crate::controller::remote::{AwsReconciler, CreateGate, DeletionGate, DenyCreate, Mutation};
use crate::controller::state_machine::{SyncStateMachine, TransitionContext, next_phase};
use crate::controller::status::{
    RemoteSnapshot, RetryHold, deleting_status, failed_status, next_attempt_time, spec_changed,
    sync_retry_hold, synced_status, syncing_status,
};
use crate::controller::validation::validate_target_spec;
use crate::crd::{
    ScalableTarget, ScalableTargetStatus, SyncPhase, SyncState, is_adopted, retains_remote_on_delete,
};

pub const KIND: &str = "ScalableTarget";

/// Outcome of a successful pass
#[derive(Clone, Debug)]
pub struct TargetPass {
    pub status: ScalableTargetStatus,
    pub mutation: Mutation,
    pub requeue: Duration,
}

fn sync_state(target: &ScalableTarget) -> Option<&SyncState> {
    target.status.as_ref().map(|s| &s.sync)
}

fn owner_of(target: &ScalableTarget) -> String {
    owner_key(
        KIND,
        &target.namespace().unwrap_or_default(),
        &target.name_any(),
    )
}

/// Identity the remote object is tracked under: the synced one if any, else the spec's
fn tracked_identity(target: &ScalableTarget) -> String {
    sync_state(target)
        .and_then(|s| s.synced_identity.clone())
        .unwrap_or_else(|| target_key(&target.spec).to_string())
}

/// Restore the identity claims recorded in target statuses
///
/// Returns how many claims were restored.
pub fn restore_target_claims<'a>(
    identities: &IdentityRegistry,
    targets: impl IntoIterator<Item = &'a ScalableTarget>,
) -> usize {
    targets
        .into_iter()
        .filter_map(|obj| Some((sync_state(obj)?.synced_identity.as_deref()?, owner_of(obj))))
        .filter(|(identity, owner)| identities.restore(identity, owner))
        .count()
}

/// Drive the remote scalable target toward the spec once
pub async fn sync_target(
    target: &ScalableTarget,
    aws: &AwsReconciler,
    identities: &IdentityRegistry,
    gate: &dyn CreateGate,
    config: &OperatorConfig,
    now: DateTime<Utc>,
) -> Result<TargetPass> {
    validate_target_spec(&target.spec)?;

    let previous = sync_state(target);
    let key = target_key(&target.spec);
    let identity = key.to_string();
    let synced_identity = previous.and_then(|s| s.synced_identity.as_deref());
    identity_change(synced_identity, &identity)?;

    let _guard = identities.acquire(&identity, &owner_of(target)).await?;

    let adopted = is_adopted(target.meta());
    let first_sync = synced_identity.is_none();
    let deny = DenyCreate(format!("adopted scalable target {} does not exist", key));
    let gate: &dyn CreateGate = if adopted && first_sync { &deny } else { gate };

    let ensured = aws.ensure_target(&target.spec, gate).await?;

    let current = previous.map(|s| s.phase).unwrap_or_default();
    let ctx = TransitionContext::new(ensured.mutation.is_mutation(), 0).adopted(adopted && first_sync);
    let phase = next_phase(&SyncStateMachine::new(), current, &ctx, false);

    let snapshot = RemoteSnapshot {
        arn: ensured.state.arn.clone(),
        region: aws.api().region(),
        owner_account_id: aws.api().account_id(),
        creation_time: ensured.state.creation_time,
        last_modified_time: ensured.state.last_modified_time,
        mutation: ensured.mutation,
        adopted,
    };
    let generation = target.metadata.generation;
    let (sync, requeue) = if phase == SyncPhase::Synced {
        (
            synced_status(previous, generation, &identity, &snapshot, now),
            config.resync_interval,
        )
    } else {
        (
            syncing_status(previous, generation, &identity, &snapshot, now),
            config.syncing_requeue,
        )
    };

    Ok(TargetPass {
        status: ScalableTargetStatus {
            sync,
            role_arn: ensured.state.role_arn,
        },
        mutation: ensured.mutation,
        requeue,
    })
}

/// Remove the remote scalable target and its policies for a deleted resource
///
/// Does nothing when the resource asks to retain the remote object. A
/// resource that never recorded a synced identity may still have created its
/// target before the status write failed, so the spec's identity is described
/// and removed if present. Adopted resources that never synced leave the
/// remote object alone.
pub async fn finalize_target(target: &ScalableTarget, aws: &AwsReconciler) -> Result<()> {
    if retains_remote_on_delete(target.meta()) {
        info!("Deletion policy retains the remote scalable target");
        return Ok(());
    }
    let key: TargetKey = match sync_state(target).and_then(|s| s.synced_identity.as_deref()) {
        Some(identity) => identity.parse().map_err(Error::PermanentError)?,
        None if is_adopted(target.meta()) => {
            debug!("Adopted but never synced, leaving the remote scalable target");
            return Ok(());
        }
        None => {
            let key = target_key(&target.spec);
            if aws.describe_target(&key).await?.is_none() {
                debug!("Never synced, nothing to delete remotely");
                return Ok(());
            }
            info!(target = %key, "Removing scalable target created before its status was recorded");
            key
        }
    };

    aws.delete_dependent_policies(&key).await?.into_result()?;
    aws.delete_target(&key).await
}

/// Status and reaction for a failed pass
pub fn target_failure(
    target: &ScalableTarget,
    error: &Error,
    config: &OperatorConfig,
    now: DateTime<Utc>,
) -> (ScalableTargetStatus, FailureAction) {
    let action = error.failure_action();
    let previous = target.status.as_ref();
    let retries = previous.and_then(|s| s.sync.retry_count).unwrap_or(0);
    let status = ScalableTargetStatus {
        sync: failed_status(
            previous.map(|s| &s.sync),
            target.metadata.generation,
            error,
            action.is_terminal(),
            action.retry_after(error, retries, &config.backoff),
            now,
        ),
        role_arn: previous.and_then(|s| s.role_arn.clone()),
    };
    (status, action)
}

/// Reconcile a ScalableTarget
#[instrument(skip(target, ctx), fields(name = %target.name_any(), namespace = target.namespace().unwrap_or_default()))]
pub async fn reconcile_target(target: Arc<ScalableTarget>, ctx: Arc<Context>) -> Result<Action> {
    let start = Instant::now();
    let ns = target.namespace().ok_or(Error::MissingObjectKey("namespace"))?;
    let name = target.name_any();
    let api: Api<ScalableTarget> = Api::namespaced(ctx.client.clone(), &ns);

    if target.metadata.deletion_timestamp.is_some() {
        return handle_deletion(&target, &ctx, &api).await;
    }

    if !has_finalizer(target.as_ref()) {
        add_finalizer(&api, target.as_ref()).await?;
        return Ok(Action::requeue(Duration::from_secs(1)));
    }

    if let Some(hold) = sync_retry_hold(target.metadata.generation, sync_state(&target), Utc::now()) {
        debug!(?hold, "Last failure not due for retry");
        return Ok(hold.action());
    }

    if spec_changed(target.metadata.generation, sync_state(&target)) {
        info!("Reconciling ScalableTarget (spec changed)");
    } else {
        debug!("Resyncing ScalableTarget");
    }

    let gate = DeletionGate::new(api.clone(), &name);
    let result = sync_target(
        &target,
        &ctx.aws,
        &ctx.identities,
        &gate,
        &ctx.config,
        Utc::now(),
    )
    .await;

    match result {
        Ok(pass) => {
            ctx.status.write(target.as_ref(), &pass.status).await?;
            ctx.record_reconcile(KIND, &ns, &name, start.elapsed().as_secs_f64());
            info!(
                phase = %pass.status.sync.phase,
                mutation = ?pass.mutation,
                "ScalableTarget reconciled"
            );
            Ok(Action::requeue(pass.requeue))
        }
        Err(e) => {
            ctx.record_error(KIND, &ns, &name);
            let (status, action) = target_failure(&target, &e, &ctx.config, Utc::now());
            if let Err(write_err) = ctx.status.write(target.as_ref(), &status).await {
                warn!("Failed to record error status: {}", write_err);
            }
            action.into_result(e, &ctx.config.backoff)
        }
    }
}

async fn handle_deletion(
    target: &ScalableTarget,
    ctx: &Context,
    api: &Api<ScalableTarget>,
) -> Result<Action> {
    if !has_finalizer(target) {
        return Ok(Action::await_change());
    }
    info!("Handling ScalableTarget deletion");

    let sm = SyncStateMachine::new();
    let previous = target.status.as_ref();
    let generation = target.metadata.generation;
    let current = previous.map(|s| s.sync.phase).unwrap_or_default();
    let role_arn = previous.and_then(|s| s.role_arn.clone());

    if current == SyncPhase::Deleting
        && let Some(hold @ RetryHold::For(_)) =
            sync_retry_hold(generation, previous.map(|s| &s.sync), Utc::now())
    {
        debug!(?hold, "Last delete attempt not due for retry");
        return Ok(hold.action());
    }

    let deleting = next_phase(&sm, current, &TransitionContext::default(), true);
    if deleting != current {
        let status = ScalableTargetStatus {
            sync: deleting_status(previous.map(|s| &s.sync), generation, deleting, Utc::now()),
            role_arn: role_arn.clone(),
        };
        if let Err(e) = ctx.status.write(target, &status).await {
            warn!("Failed to record deleting status: {}", e);
        }
    }

    let identity = tracked_identity(target);
    let owner = owner_of(target);
    let result = match ctx.identities.acquire(&identity, &owner).await {
        Ok(guard) => {
            let result = finalize_target(target, &ctx.aws).await;
            drop(guard);
            result
        }
        Err(Error::IdentityConflict { owner: other, .. }) => {
            info!(owner = %other, "Remote scalable target is managed by another resource, skipping remote delete");
            Ok(())
        }
        Err(e) => Err(e),
    };

    if let Err(e) = result {
        let now = Utc::now();
        let (status, _) = target_failure(target, &e, &ctx.config, now);
        let retries = previous.and_then(|s| s.sync.retry_count).unwrap_or(0);
        let retry_after = ctx.config.backoff.delay_for_error(&e, retries);
        let status = ScalableTargetStatus {
            sync: SyncState {
                phase: deleting,
                next_attempt_time: next_attempt_time(Some(retry_after), now),
                ..status.sync
            },
            ..status
        };
        if let Err(write_err) = ctx.status.write(target, &status).await {
            warn!("Failed to record deletion error: {}", write_err);
        }
        return Err(e);
    }

    let deleted = next_phase(&sm, deleting, &TransitionContext::deleted(), true);
    let status = ScalableTargetStatus {
        sync: deleting_status(previous.map(|s| &s.sync), generation, deleted, Utc::now()),
        role_arn,
    };
    if let Err(e) = ctx.status.write(target, &status).await {
        debug!("Status not written after remote delete: {}", e);
    }

    ctx.identities.release(&identity, &owner);
    remove_finalizer(api, target).await?;
    info!("ScalableTarget deleted");
    Ok(Action::await_change())
}

/// Error policy for the ScalableTarget controller
pub fn target_error_policy(target: Arc<ScalableTarget>, error: &Error, ctx: Arc<Context>) -> Action {
    let retry_count = sync_state(&target)
        .and_then(|s| s.retry_count)
        .unwrap_or(0);
    requeue_after_error(&target.name_any(), retry_count, error, &ctx.config.backoff)
}
