//! Idempotent ensure/describe/delete against the Application Auto Scaling API
//!
//! `ensure_*` describes first and only issues a mutating call when the
//! Differ reports changes. Creates are additionally gated by a [`CreateGate`]
//! checked immediately before the call.

use std::fmt::Debug;
use std::future::Future;
use std::sync::Arc;

use async_trait::async_trait;
use chrono::Utc;
use futures::FutureExt;
use kube::Api;
use serde::de::DeserializeOwned;
use tracing::{debug, info, instrument, warn};

use crate::aws::{
    AutoscalingApi, AwsError, PolicyFilter, PolicyKey, PutPolicyInput, RemotePolicyState,
    RemoteTargetState, TargetFilter, TargetKey,
};
use crate::controller::diff::{
    ChangeSet, diff_policy, diff_target, policy_key, register_input, target_key,
};
use crate::controller::error::{Error, Result};
use crate::controller::teardown::{Teardown, TeardownReport};
use crate::crd::{ScalableTargetSpec, ScalingPolicySpec};
use crate::health::HealthState;
use crate::poll::{PollConfig, PollOutcome, poll_until};

/// Kind of mutating call issued by an ensure
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub enum Mutation {
    #[default]
    None,
    Created,
    Updated,
}

impl Mutation {
    pub fn is_mutation(&self) -> bool {
        *self != Mutation::None
    }
}

/// Result of an ensure: the remote state after the pass and what was done
#[derive(Clone, Debug)]
pub struct Ensured<S> {
    pub state: S,
    pub mutation: Mutation,
    /// Changes that triggered an update; empty for creates and no-ops
    pub changes: ChangeSet,
}

/// Consulted right before a create is issued
#[async_trait]
pub trait CreateGate: Send + Sync {
    /// `Ok` when a create may be issued now
    async fn check(&self) -> Result<()>;
}

/// Gate that always allows creates
pub struct AllowCreate;

#[async_trait]
impl CreateGate for AllowCreate {
    async fn check(&self) -> Result<()> {
        Ok(())
    }
}

/// Gate that never allows creates, for resources bound through adoption
pub struct DenyCreate(pub String);

#[async_trait]
impl CreateGate for DenyCreate {
    async fn check(&self) -> Result<()> {
        Err(Error::NotFound(self.0.clone()))
    }
}

/// Re-reads the custom resource and refuses once deletion has been requested
pub struct DeletionGate<K> {
    api: Api<K>,
    name: String,
}

impl<K> DeletionGate<K> {
    pub fn new(api: Api<K>, name: impl Into<String>) -> Self {
        Self {
            api,
            name: name.into(),
        }
    }
}

#[async_trait]
impl<K> CreateGate for DeletionGate<K>
where
    K: kube::Resource + Clone + DeserializeOwned + Debug + Send + Sync + 'static,
{
    async fn check(&self) -> Result<()> {
        match self.api.get_opt(&self.name).await? {
            None => Err(Error::TransientError(format!(
                "{} no longer exists, create skipped",
                self.name
            ))),
            Some(obj) if obj.meta().deletion_timestamp.is_some() => Err(Error::TransientError(
                format!("deletion of {} requested, create skipped", self.name),
            )),
            Some(_) => Ok(()),
        }
    }
}

/// AWS Reconciler for scalable targets and scaling policies
#[derive(Clone)]
pub struct AwsReconciler {
    api: Arc<dyn AutoscalingApi>,
    health: Option<Arc<HealthState>>,
    dependent_poll: PollConfig,
}

impl AwsReconciler {
    pub fn new(api: Arc<dyn AutoscalingApi>) -> Self {
        Self {
            api,
            health: None,
            dependent_poll: PollConfig::default(),
        }
    }

    /// Record remote call metrics
    pub fn with_health(mut self, health: Arc<HealthState>) -> Self {
        self.health = Some(health);
        self
    }

    /// How long to wait for dependent policies to disappear before deregistering
    pub fn with_dependent_poll(mut self, config: PollConfig) -> Self {
        self.dependent_poll = config;
        self
    }

    pub fn api(&self) -> &Arc<dyn AutoscalingApi> {
        &self.api
    }

    async fn observe<T>(
        &self,
        operation: &'static str,
        fut: impl Future<Output = std::result::Result<T, AwsError>>,
    ) -> std::result::Result<T, AwsError> {
        let result = fut.await;
        if let Some(health) = &self.health {
            let outcome = match &result {
                Ok(_) => "success",
                Err(e) => e.kind.as_str(),
            };
            health.metrics.record_remote_call(operation, outcome);
        }
        result
    }

    /// Describe every scalable target matching a filter
    pub async fn describe_targets(&self, filter: &TargetFilter) -> Result<Vec<RemoteTargetState>> {
        Ok(self
            .observe(
                "DescribeScalableTargets",
                self.api.describe_scalable_targets(filter),
            )
            .await?)
    }

    /// Describe every scaling policy matching a filter
    pub async fn describe_policies(&self, filter: &PolicyFilter) -> Result<Vec<RemotePolicyState>> {
        Ok(self
            .observe(
                "DescribeScalingPolicies",
                self.api.describe_scaling_policies(filter),
            )
            .await?)
    }

    /// Describe one scalable target
    pub async fn describe_target(&self, key: &TargetKey) -> Result<Option<RemoteTargetState>> {
        let filter = TargetFilter::for_key(key);
        let found = self
            .observe(
                "DescribeScalableTargets",
                self.api.describe_scalable_targets(&filter),
            )
            .await?;
        Ok(found.into_iter().find(|t| t.key == *key))
    }

    /// Describe one scaling policy
    pub async fn describe_policy(&self, key: &PolicyKey) -> Result<Option<RemotePolicyState>> {
        let filter = PolicyFilter::for_key(key);
        let found = self
            .observe(
                "DescribeScalingPolicies",
                self.api.describe_scaling_policies(&filter),
            )
            .await?;
        Ok(found.into_iter().find(|p| p.key == *key))
    }

    /// Register or update a scalable target so it matches `spec`
    #[instrument(skip(self, spec, gate), fields(resource_id = %spec.resource_id))]
    pub async fn ensure_target(
        &self,
        spec: &ScalableTargetSpec,
        gate: &dyn CreateGate,
    ) -> Result<Ensured<RemoteTargetState>> {
        let key = target_key(spec);

        let (mutation, changes) = match self.describe_target(&key).await? {
            Some(observed) => {
                let changes = diff_target(spec, &observed);
                if changes.is_empty() {
                    return Ok(Ensured {
                        state: observed,
                        mutation: Mutation::None,
                        changes,
                    });
                }
                info!(target = %key, changes = %changes, "updating scalable target");
                (Mutation::Updated, changes)
            }
            None => {
                let (Some(_), Some(_)) = (spec.min_capacity, spec.max_capacity) else {
                    return Err(Error::ValidationError(
                        "minCapacity and maxCapacity are required to register a new scalable target"
                            .to_string(),
                    ));
                };
                gate.check().await?;
                info!(target = %key, "registering scalable target");
                (Mutation::Created, ChangeSet::default())
            }
        };

        let input = register_input(spec, &changes);
        let output = self
            .observe(
                "RegisterScalableTarget",
                self.api.register_scalable_target(&input),
            )
            .await?;

        let state = match self.describe_target(&key).await? {
            Some(mut state) => {
                if state.arn.is_none() {
                    state.arn = output.arn;
                }
                state
            }
            // Not yet visible to describe; report what was just applied
            None => RemoteTargetState {
                key,
                min_capacity: spec.min_capacity.unwrap_or_default(),
                max_capacity: spec.max_capacity.unwrap_or_default(),
                role_arn: spec.role_arn.clone(),
                suspended_state: spec.suspended_state.clone(),
                arn: output.arn,
                creation_time: None,
                last_modified_time: None,
                observed_at: Utc::now(),
            },
        };
        Ok(Ensured {
            state,
            mutation,
            changes,
        })
    }

    /// Create or update a scaling policy so it matches `spec`
    ///
    /// Fails with [`Error::DependencyNotReady`] while the owning scalable
    /// target is not registered.
    #[instrument(skip(self, spec, gate), fields(policy_name = %spec.policy_name))]
    pub async fn ensure_policy(
        &self,
        spec: &ScalingPolicySpec,
        gate: &dyn CreateGate,
    ) -> Result<Ensured<RemotePolicyState>> {
        let key = policy_key(spec);
        let input = PutPolicyInput {
            key: key.clone(),
            policy_type: spec.policy_type,
            target_tracking: spec.target_tracking_scaling_policy_configuration.clone(),
        };

        let (mutation, changes) = match self.describe_policy(&key).await? {
            Some(observed) => {
                let changes = diff_policy(spec, &observed);
                if changes.is_empty() {
                    return Ok(Ensured {
                        state: observed,
                        mutation: Mutation::None,
                        changes,
                    });
                }
                info!(policy = %key, changes = %changes, "updating scaling policy");
                (Mutation::Updated, changes)
            }
            None => {
                if self.describe_target(&key.target).await?.is_none() {
                    return Err(Error::DependencyNotReady(format!(
                        "scalable target {} is not registered",
                        key.target
                    )));
                }
                gate.check().await?;
                info!(policy = %key, "creating scaling policy");
                (Mutation::Created, ChangeSet::default())
            }
        };

        let output = self
            .observe("PutScalingPolicy", self.api.put_scaling_policy(&input))
            .await
            .map_err(|e| {
                if e.is_not_found() {
                    Error::DependencyNotReady(format!(
                        "scalable target {} is not registered: {}",
                        key.target, e.message
                    ))
                } else {
                    Error::Aws(e)
                }
            })?;

        let state = match self.describe_policy(&key).await? {
            Some(state) => state,
            None => RemotePolicyState {
                key,
                policy_type: input.policy_type,
                target_tracking: input.target_tracking,
                arn: output.arn,
                alarms: output.alarms,
                creation_time: None,
                last_modified_time: None,
                observed_at: Utc::now(),
            },
        };
        Ok(Ensured {
            state,
            mutation,
            changes,
        })
    }

    /// Delete a scaling policy; already-deleted is success
    #[instrument(skip(self), fields(policy = %key))]
    pub async fn delete_policy(&self, key: &PolicyKey) -> Result<()> {
        match self
            .observe("DeleteScalingPolicy", self.api.delete_scaling_policy(key))
            .await
        {
            Ok(()) => Ok(()),
            Err(e) if e.is_not_found() => {
                debug!("scaling policy already deleted");
                Ok(())
            }
            Err(e) => Err(e.into()),
        }
    }

    /// Delete every remote policy attached to a target, then wait for them to
    /// stop showing up in describe calls
    #[instrument(skip(self), fields(target = %key))]
    pub async fn delete_dependent_policies(&self, key: &TargetKey) -> Result<TeardownReport> {
        let filter = PolicyFilter::for_target(key);
        let policies = self
            .observe(
                "DescribeScalingPolicies",
                self.api.describe_scaling_policies(&filter),
            )
            .await?;

        let mut teardown = Teardown::new();
        for policy in &policies {
            let policy_key = policy.key.clone();
            teardown = teardown.step(
                format!("delete policy {}", policy.key.policy_name),
                async move { self.delete_policy(&policy_key).await }.boxed(),
            );
        }
        let report = teardown.run().await;
        if policies.is_empty() || !report.is_clean() {
            return Ok(report);
        }

        let filter = &filter;
        let outcome = poll_until(self.dependent_poll, move || async move {
            let remaining = self
                .observe(
                    "DescribeScalingPolicies",
                    self.api.describe_scaling_policies(filter),
                )
                .await?;
            Ok::<_, Error>(remaining.is_empty().then_some(()))
        })
        .await?;
        if let PollOutcome::TimedOut { attempts } = outcome {
            warn!(attempts, "dependent policies still reported after delete, continuing");
        }
        Ok(report)
    }

    /// Deregister a scalable target; already-deregistered is success
    #[instrument(skip(self), fields(target = %key))]
    pub async fn delete_target(&self, key: &TargetKey) -> Result<()> {
        match self
            .observe(
                "DeregisterScalableTarget",
                self.api.deregister_scalable_target(key),
            )
            .await
        {
            Ok(()) => Ok(()),
            Err(e) if e.is_not_found() => {
                debug!("scalable target already deregistered");
                Ok(())
            }
            Err(e) => Err(e.into()),
        }
    }
}
