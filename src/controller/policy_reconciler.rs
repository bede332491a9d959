//! ScalingPolicy reconciliation
//!
//! A policy can only be put once its scalable target is registered. While the
//! target is missing the policy keeps retrying with backoff; after
//! `dependency_wait` has passed since the first miss the failure becomes
//! terminal and is retried only after the cooldown.

use std::sync::Arc;
use std::time::{Duration, Instant};

use chrono::{DateTime, Utc};
use kube::runtime::controller::Action;
use kube::{Api, Resource, ResourceExt};
use tracing::{debug, info, instrument, warn};

use crate::aws::PolicyKey;
use crate::config::OperatorConfig;
use crate::controller::context::Context;
use crate::controller::diff::{identity_change, policy_key};
use crate::controller::error::{Error, FailureAction, Result, requeue_after_error};
use crate::controller::finalizer::{add_finalizer, has_finalizer, remove_finalizer};
use crate::controller::identity::{IdentityRegistry, owner_key};
use crate::controller::remote::{AwsReconciler, CreateGate, DeletionGate, DenyCreate, Mutation};
use crate::controller::state_machine::{SyncStateMachine, TransitionContext, next_phase};
use crate::controller::status::{
    RemoteSnapshot, RetryHold, deleting_status, failed_status, format_timestamp,
    next_attempt_time, spec_changed, sync_retry_hold, synced_status, syncing_status,
};
use crate::controller::validation::validate_policy_spec;
use crate::crd::{
    ScalingPolicy, ScalingPolicyStatus, SyncPhase, SyncState, is_adopted, retains_remote_on_delete,
};

pub const KIND: &str = "ScalingPolicy";

/// Outcome of a successful pass
#[derive(Clone, Debug)]
pub struct PolicyPass {
    pub status: ScalingPolicyStatus,
    pub mutation: Mutation,
    pub requeue: Duration,
}

fn sync_state(policy: &ScalingPolicy) -> Option<&SyncState> {
    policy.status.as_ref().map(|s| &s.sync)
}

fn owner_of(policy: &ScalingPolicy) -> String {
    owner_key(
        KIND,
        &policy.namespace().unwrap_or_default(),
        &policy.name_any(),
    )
}

fn tracked_identity(policy: &ScalingPolicy) -> String {
    sync_state(policy)
        .and_then(|s| s.synced_identity.clone())
        .unwrap_or_else(|| policy_key(&policy.spec).to_string())
}

/// Restore the identity claims recorded in policy statuses
///
/// Returns how many claims were restored.
pub fn restore_policy_claims<'a>(
    identities: &IdentityRegistry,
    policies: impl IntoIterator<Item = &'a ScalingPolicy>,
) -> usize {
    policies
        .into_iter()
        .filter_map(|obj| Some((sync_state(obj)?.synced_identity.as_deref()?, owner_of(obj))))
        .filter(|(identity, owner)| identities.restore(identity, owner))
        .count()
}

/// Drive the remote scaling policy toward the spec once
pub async fn sync_policy(
    policy: &ScalingPolicy,
    aws: &AwsReconciler,
    identities: &IdentityRegistry,
    gate: &dyn CreateGate,
    config: &OperatorConfig,
    now: DateTime<Utc>,
) -> Result<PolicyPass> {
    validate_policy_spec(&policy.spec)?;

    let previous = sync_state(policy);
    let key = policy_key(&policy.spec);
    let identity = key.to_string();
    let synced_identity = previous.and_then(|s| s.synced_identity.as_deref());
    identity_change(synced_identity, &identity)?;

    let _guard = identities.acquire(&identity, &owner_of(policy)).await?;

    let adopted = is_adopted(policy.meta());
    let first_sync = synced_identity.is_none();
    let deny = DenyCreate(format!("adopted scaling policy {} does not exist", key));
    let gate: &dyn CreateGate = if adopted && first_sync { &deny } else { gate };

    let ensured = aws.ensure_policy(&policy.spec, gate).await?;

    let current = previous.map(|s| s.phase).unwrap_or_default();
    let ctx = TransitionContext::new(ensured.mutation.is_mutation(), 0).adopted(adopted && first_sync);
    let phase = next_phase(&SyncStateMachine::new(), current, &ctx, false);

    let snapshot = RemoteSnapshot {
        arn: Some(ensured.state.arn.clone()),
        region: aws.api().region(),
        owner_account_id: aws.api().account_id(),
        creation_time: ensured.state.creation_time,
        last_modified_time: ensured.state.last_modified_time,
        mutation: ensured.mutation,
        adopted,
    };
    let generation = policy.metadata.generation;
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

    Ok(PolicyPass {
        status: ScalingPolicyStatus {
            sync,
            alarms: ensured.state.alarms,
            dependency_wait_started_at: None,
        },
        mutation: ensured.mutation,
        requeue,
    })
}

/// Delete the remote scaling policy for a deleted resource
///
/// Without a synced identity the spec's policy is deleted if it exists,
/// unless the resource was adopted.
pub async fn finalize_policy(policy: &ScalingPolicy, aws: &AwsReconciler) -> Result<()> {
    if retains_remote_on_delete(policy.meta()) {
        info!("Deletion policy retains the remote scaling policy");
        return Ok(());
    }
    let key: PolicyKey = match sync_state(policy).and_then(|s| s.synced_identity.as_deref()) {
        Some(identity) => identity.parse().map_err(Error::PermanentError)?,
        None if is_adopted(policy.meta()) => {
            debug!("Adopted but never synced, leaving the remote scaling policy");
            return Ok(());
        }
        None => {
            let key = policy_key(&policy.spec);
            if aws.describe_policy(&key).await?.is_none() {
                debug!("Never synced, nothing to delete remotely");
                return Ok(());
            }
            info!(policy = %key, "Removing scaling policy created before its status was recorded");
            key
        }
    };
    aws.delete_policy(&key).await
}

/// Status and reaction for a failed pass
///
/// A missing scalable target starts (or continues) the dependency wait. Once
/// the wait exceeds `config.dependency_wait` the failure is reported as
/// terminal and retried after the cooldown.
pub fn policy_failure(
    policy: &ScalingPolicy,
    error: &Error,
    config: &OperatorConfig,
    now: DateTime<Utc>,
) -> (ScalingPolicyStatus, FailureAction) {
    let previous = policy.status.as_ref();
    let mut wait_started_at = previous.and_then(|s| s.dependency_wait_started_at.clone());
    let mut action = error.failure_action();

    let expired;
    let reported = match error {
        Error::DependencyNotReady(reason) => {
            let started = wait_started_at
                .as_deref()
                .and_then(|ts| DateTime::parse_from_rfc3339(ts).ok())
                .map(|ts| ts.with_timezone(&Utc))
                .unwrap_or(now);
            wait_started_at = Some(format_timestamp(started));
            let waited = now.signed_duration_since(started).to_std().unwrap_or_default();
            if waited >= config.dependency_wait {
                action = FailureAction::Cooldown;
                expired = Error::DependencyNotReady(format!(
                    "{} (waited {}s)",
                    reason,
                    waited.as_secs()
                ));
                &expired
            } else {
                error
            }
        }
        _ => error,
    };

    let retries = previous.and_then(|s| s.sync.retry_count).unwrap_or(0);
    let status = ScalingPolicyStatus {
        sync: failed_status(
            previous.map(|s| &s.sync),
            policy.metadata.generation,
            reported,
            action.is_terminal(),
            action.retry_after(reported, retries, &config.backoff),
            now,
        ),
        alarms: previous.map(|s| s.alarms.clone()).unwrap_or_default(),
        dependency_wait_started_at: wait_started_at,
    };
    (status, action)
}

/// Reconcile a ScalingPolicy
#[instrument(skip(policy, ctx), fields(name = %policy.name_any(), namespace = policy.namespace().unwrap_or_default()))]
pub async fn reconcile_policy(policy: Arc<ScalingPolicy>, ctx: Arc<Context>) -> Result<Action> {
    let start = Instant::now();
    let ns = policy.namespace().ok_or(Error::MissingObjectKey("namespace"))?;
    let name = policy.name_any();
    let api: Api<ScalingPolicy> = Api::namespaced(ctx.client.clone(), &ns);

    if policy.metadata.deletion_timestamp.is_some() {
        return handle_deletion(&policy, &ctx, &api).await;
    }

    if !has_finalizer(policy.as_ref()) {
        add_finalizer(&api, policy.as_ref()).await?;
        return Ok(Action::requeue(Duration::from_secs(1)));
    }

    if let Some(hold) = sync_retry_hold(policy.metadata.generation, sync_state(&policy), Utc::now()) {
        debug!(?hold, "Last failure not due for retry");
        return Ok(hold.action());
    }

    if spec_changed(policy.metadata.generation, sync_state(&policy)) {
        info!("Reconciling ScalingPolicy (spec changed)");
    } else {
        debug!("Resyncing ScalingPolicy");
    }

    let gate = DeletionGate::new(api.clone(), &name);
    let result = sync_policy(
        &policy,
        &ctx.aws,
        &ctx.identities,
        &gate,
        &ctx.config,
        Utc::now(),
    )
    .await;

    match result {
        Ok(pass) => {
            ctx.status.write(policy.as_ref(), &pass.status).await?;
            ctx.record_reconcile(KIND, &ns, &name, start.elapsed().as_secs_f64());
            info!(
                phase = %pass.status.sync.phase,
                mutation = ?pass.mutation,
                "ScalingPolicy reconciled"
            );
            Ok(Action::requeue(pass.requeue))
        }
        Err(e) => {
            ctx.record_error(KIND, &ns, &name);
            let (status, action) = policy_failure(&policy, &e, &ctx.config, Utc::now());
            if let Some(started) = &status.dependency_wait_started_at {
                info!(since = %started, "Waiting for scalable target: {}", e);
            }
            if let Err(write_err) = ctx.status.write(policy.as_ref(), &status).await {
                warn!("Failed to record error status: {}", write_err);
            }
            action.into_result(e, &ctx.config.backoff)
        }
    }
}

async fn handle_deletion(
    policy: &ScalingPolicy,
    ctx: &Context,
    api: &Api<ScalingPolicy>,
) -> Result<Action> {
    if !has_finalizer(policy) {
        return Ok(Action::await_change());
    }
    info!("Handling ScalingPolicy deletion");

    let sm = SyncStateMachine::new();
    let previous = policy.status.as_ref();
    let generation = policy.metadata.generation;
    let current = previous.map(|s| s.sync.phase).unwrap_or_default();
    let alarms = previous.map(|s| s.alarms.clone()).unwrap_or_default();

    if current == SyncPhase::Deleting
        && let Some(hold @ RetryHold::For(_)) =
            sync_retry_hold(generation, previous.map(|s| &s.sync), Utc::now())
    {
        debug!(?hold, "Last delete attempt not due for retry");
        return Ok(hold.action());
    }

    let deleting = next_phase(&sm, current, &TransitionContext::default(), true);
    if deleting != current {
        let status = ScalingPolicyStatus {
            sync: deleting_status(previous.map(|s| &s.sync), generation, deleting, Utc::now()),
            alarms: alarms.clone(),
            dependency_wait_started_at: None,
        };
        if let Err(e) = ctx.status.write(policy, &status).await {
            warn!("Failed to record deleting status: {}", e);
        }
    }

    let identity = tracked_identity(policy);
    let owner = owner_of(policy);
    let result = match ctx.identities.acquire(&identity, &owner).await {
        Ok(guard) => {
            let result = finalize_policy(policy, &ctx.aws).await;
            drop(guard);
            result
        }
        Err(Error::IdentityConflict { owner: other, .. }) => {
            info!(owner = %other, "Remote scaling policy is managed by another resource, skipping remote delete");
            Ok(())
        }
        Err(e) => Err(e),
    };

    if let Err(e) = result {
        let now = Utc::now();
        let (status, _) = policy_failure(policy, &e, &ctx.config, now);
        let retries = previous.and_then(|s| s.sync.retry_count).unwrap_or(0);
        let retry_after = ctx.config.backoff.delay_for_error(&e, retries);
        let status = ScalingPolicyStatus {
            sync: SyncState {
                phase: deleting,
                next_attempt_time: next_attempt_time(Some(retry_after), now),
                ..status.sync
            },
            ..status
        };
        if let Err(write_err) = ctx.status.write(policy, &status).await {
            warn!("Failed to record deletion error: {}", write_err);
        }
        return Err(e);
    }

    let deleted = next_phase(&sm, deleting, &TransitionContext::deleted(), true);
    let status = ScalingPolicyStatus {
        sync: deleting_status(previous.map(|s| &s.sync), generation, deleted, Utc::now()),
        alarms: vec![],
        dependency_wait_started_at: None,
    };
    if let Err(e) = ctx.status.write(policy, &status).await {
        debug!("Status not written after remote delete: {}", e);
    }

    ctx.identities.release(&identity, &owner);
    remove_finalizer(api, policy).await?;
    info!("ScalingPolicy deleted");
    Ok(Action::await_change())
}

/// Error policy for the ScalingPolicy controller
pub fn policy_error_policy(policy: Arc<ScalingPolicy>, error: &Error, ctx: Arc<Context>) -> Action {
    let retry_count = sync_state(&policy)
        .and_then(|s| s.retry_count)
        .unwrap_or(0);
    requeue_after_error(&policy.name_any(), retry_count, error, &ctx.config.backoff)
}
