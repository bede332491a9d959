//! Application Auto Scaling control plane boundary
//!
//! The reconcilers only talk to the remote system through [`AutoscalingApi`].
//! Two implementations exist: [`SdkAutoscalingClient`] backed by the AWS SDK,
//! and [`InMemoryAutoscaling`] which keeps the same contract in process.

pub mod error;
pub mod memory;
pub mod sdk;

use std::fmt;

use async_trait::async_trait;
use chrono::{DateTime, Utc};

use crate::crd::{Alarm, PolicyType, SuspendedState, TargetTrackingScalingPolicyConfiguration};

pub use error::{AwsError, AwsErrorKind};
pub use memory::InMemoryAutoscaling;
pub use sdk::SdkAutoscalingClient;

/// Identity of a scalable target in the remote system
#[derive(Clone, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct TargetKey {
    pub service_namespace: String,
    pub resource_id: String,
    pub scalable_dimension: String,
}

impl TargetKey {
    pub fn new(
        service_namespace: impl Into<String>,
        resource_id: impl Into<String>,
        scalable_dimension: impl Into<String>,
    ) -> Self {
        Self {
            service_namespace: service_namespace.into(),
            resource_id: resource_id.into(),
            scalable_dimension: scalable_dimension.into(),
        }
    }
}

impl fmt::Display for TargetKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{}|{}|{}",
            self.service_namespace, self.resource_id, self.scalable_dimension
        )
    }
}

impl std::str::FromStr for TargetKey {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let mut parts = s.splitn(3, '|');
        match (parts.next(), parts.next(), parts.next()) {
            (Some(ns), Some(rid), Some(dim)) if !ns.is_empty() && !rid.is_empty() && !dim.is_empty() => {
                Ok(TargetKey::new(ns, rid, dim))
            }
            _ => Err(format!("malformed target identity {s:?}")),
        }
    }
}

/// Identity of a scaling policy in the remote system
#[derive(Clone, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct PolicyKey {
    pub target: TargetKey,
    pub policy_name: String,
}

impl PolicyKey {
    pub fn new(target: TargetKey, policy_name: impl Into<String>) -> Self {
        Self {
            target,
            policy_name: policy_name.into(),
        }
    }
}

impl fmt::Display for PolicyKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}|{}", self.target, self.policy_name)
    }
}

impl std::str::FromStr for PolicyKey {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let mut parts = s.splitn(4, '|');
        match (parts.next(), parts.next(), parts.next(), parts.next()) {
            (Some(ns), Some(rid), Some(dim), Some(name)) if !name.is_empty() => {
                let target: TargetKey = format!("{ns}|{rid}|{dim}").parse()?;
                Ok(PolicyKey::new(target, name))
            }
            _ => Err(format!("malformed policy identity {s:?}")),
        }
    }
}

/// Filter for DescribeScalableTargets
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct TargetFilter {
    pub service_namespace: String,
    pub resource_ids: Vec<String>,
    pub scalable_dimension: Option<String>,
}

impl TargetFilter {
    /// Filter matching exactly one identity
    pub fn for_key(key: &TargetKey) -> Self {
        Self {
            service_namespace: key.service_namespace.clone(),
            resource_ids: vec![key.resource_id.clone()],
            scalable_dimension: Some(key.scalable_dimension.clone()),
        }
    }
}

/// Filter for DescribeScalingPolicies
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct PolicyFilter {
    pub service_namespace: String,
    pub resource_id: Option<String>,
    pub scalable_dimension: Option<String>,
    pub policy_names: Vec<String>,
}

impl PolicyFilter {
    /// Filter matching exactly one identity
    pub fn for_key(key: &PolicyKey) -> Self {
        Self {
            policy_names: vec![key.policy_name.clone()],
            ..Self::for_target(&key.target)
        }
    }

    /// Filter matching every policy attached to a target
    pub fn for_target(key: &TargetKey) -> Self {
        Self {
            service_namespace: key.service_namespace.clone(),
            resource_id: Some(key.resource_id.clone()),
            scalable_dimension: Some(key.scalable_dimension.clone()),
            policy_names: vec![],
        }
    }
}

/// Snapshot of a scalable target as described by the remote system
#[derive(Clone, Debug, PartialEq)]
pub struct RemoteTargetState {
    pub key: TargetKey,
    pub min_capacity: i32,
    pub max_capacity: i32,
    pub role_arn: Option<String>,
    pub suspended_state: Option<SuspendedState>,
    pub arn: Option<String>,
    pub creation_time: Option<DateTime<Utc>>,
    /// Only reported by backends that track modifications
    pub last_modified_time: Option<DateTime<Utc>>,
    pub observed_at: DateTime<Utc>,
}

/// Snapshot of a scaling policy as described by the remote system
#[derive(Clone, Debug, PartialEq)]
pub struct RemotePolicyState {
    pub key: PolicyKey,
    pub policy_type: PolicyType,
    pub target_tracking: Option<TargetTrackingScalingPolicyConfiguration>,
    pub arn: String,
    pub alarms: Vec<Alarm>,
    pub creation_time: Option<DateTime<Utc>>,
    pub last_modified_time: Option<DateTime<Utc>>,
    pub observed_at: DateTime<Utc>,
}

/// RegisterScalableTarget request; unset fields keep their remote values
#[derive(Clone, Debug, PartialEq)]
pub struct RegisterTargetInput {
    pub key: TargetKey,
    pub min_capacity: Option<i32>,
    pub max_capacity: Option<i32>,
    pub role_arn: Option<String>,
    pub suspended_state: Option<SuspendedState>,
}

#[derive(Clone, Debug, Default, PartialEq)]
pub struct RegisterTargetOutput {
    pub arn: Option<String>,
}

/// PutScalingPolicy request
#[derive(Clone, Debug, PartialEq)]
pub struct PutPolicyInput {
    pub key: PolicyKey,
    pub policy_type: PolicyType,
    pub target_tracking: Option<TargetTrackingScalingPolicyConfiguration>,
}

#[derive(Clone, Debug, PartialEq)]
pub struct PutPolicyOutput {
    pub arn: String,
    pub alarms: Vec<Alarm>,
}

/// Operations consumed from the Application Auto Scaling control plane
#[async_trait]
pub trait AutoscalingApi: Send + Sync {
    async fn describe_scalable_targets(
        &self,
        filter: &TargetFilter,
    ) -> Result<Vec<RemoteTargetState>, AwsError>;

    /// Register a target, or update the bounds of an already registered one
    async fn register_scalable_target(
        &self,
        input: &RegisterTargetInput,
    ) -> Result<RegisterTargetOutput, AwsError>;

    async fn deregister_scalable_target(&self, key: &TargetKey) -> Result<(), AwsError>;

    async fn describe_scaling_policies(
        &self,
        filter: &PolicyFilter,
    ) -> Result<Vec<RemotePolicyState>, AwsError>;

    /// Create a policy, or replace the configuration of an existing one
    async fn put_scaling_policy(&self, input: &PutPolicyInput) -> Result<PutPolicyOutput, AwsError>;

    async fn delete_scaling_policy(&self, key: &PolicyKey) -> Result<(), AwsError>;

    /// Region reported in resource status
    fn region(&self) -> Option<String>;

    /// Account reported in resource status
    fn account_id(&self) -> Option<String>;
}
