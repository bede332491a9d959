//! In-process Application Auto Scaling control plane
//!
//! Enforces the same rules as the real service: policies require a
//! registered target, register/put are upserts, deletes of missing objects
//! fail with ObjectNotFound. Used by the test suites and by local runs with
//! `--backend memory`.

use std::collections::{BTreeMap, HashMap, VecDeque};
use std::sync::Mutex;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use tracing::debug;

use super::{
    AutoscalingApi, AwsError, PolicyFilter, PolicyKey, PutPolicyInput, PutPolicyOutput,
    RegisterTargetInput, RegisterTargetOutput, RemotePolicyState, RemoteTargetState, TargetFilter,
    TargetKey,
};
use crate::crd::{Alarm, PolicyType};

const DEFAULT_REGION: &str = "us-west-2";
const DEFAULT_ACCOUNT: &str = "000000000000";

#[derive(Default)]
struct State {
    targets: BTreeMap<TargetKey, RemoteTargetState>,
    policies: BTreeMap<PolicyKey, RemotePolicyState>,
    /// Deleted policies still visible to describe calls
    lingering: BTreeMap<PolicyKey, (RemotePolicyState, u32)>,
    failures: VecDeque<(&'static str, AwsError)>,
    calls: HashMap<&'static str, u32>,
    last_stamp_ms: i64,
    sequence: u64,
}

impl State {
    /// Strictly increasing millisecond timestamps
    fn next_stamp(&mut self) -> DateTime<Utc> {
        let now = Utc::now().timestamp_millis();
        let ms = now.max(self.last_stamp_ms + 1);
        self.last_stamp_ms = ms;
        DateTime::from_timestamp_millis(ms).unwrap_or_else(Utc::now)
    }

    fn next_id(&mut self) -> String {
        self.sequence += 1;
        format!("{:032x}", self.sequence)
    }

    fn begin(&mut self, operation: &'static str) -> Result<(), AwsError> {
        *self.calls.entry(operation).or_default() += 1;
        if let Some(pos) = self.failures.iter().position(|(op, _)| *op == operation) {
            if let Some((_, err)) = self.failures.remove(pos) {
                return Err(err);
            }
        }
        Ok(())
    }
}

/// In-memory [`AutoscalingApi`] implementation
pub struct InMemoryAutoscaling {
    state: Mutex<State>,
    region: String,
    account_id: String,
    policy_retention: u32,
}

impl Default for InMemoryAutoscaling {
    fn default() -> Self {
        Self::new()
    }
}

impl InMemoryAutoscaling {
    pub fn new() -> Self {
        Self {
            state: Mutex::new(State::default()),
            region: DEFAULT_REGION.to_string(),
            account_id: DEFAULT_ACCOUNT.to_string(),
            policy_retention: 0,
        }
    }

    /// Keep deleted policies, and those of a deregistered target, visible for
    /// `describes` describe calls
    pub fn with_policy_retention(mut self, describes: u32) -> Self {
        self.policy_retention = describes;
        self
    }

    pub fn with_region(mut self, region: impl Into<String>) -> Self {
        self.region = region.into();
        self
    }

    /// Fail the next call to `operation` with `error`
    pub fn inject_failure(&self, operation: &'static str, error: AwsError) {
        self.lock().failures.push_back((operation, error));
    }

    /// Number of calls made to `operation`, including failed ones
    pub fn call_count(&self, operation: &str) -> u32 {
        self.lock().calls.get(operation).copied().unwrap_or(0)
    }

    /// Number of register/deregister/put/delete calls made so far
    pub fn mutating_calls(&self) -> u32 {
        let state = self.lock();
        [
            "RegisterScalableTarget",
            "DeregisterScalableTarget",
            "PutScalingPolicy",
            "DeleteScalingPolicy",
        ]
        .iter()
        .map(|op| state.calls.get(op).copied().unwrap_or(0))
        .sum()
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, State> {
        // A poisoned lock only means a test panicked mid-call; the maps are still consistent.
        self.state.lock().unwrap_or_else(|e| e.into_inner())
    }

    fn target_arn(&self, id: &str) -> String {
        format!(
            "arn:aws:application-autoscaling:{}:{}:scalable-target/{}",
            self.region, self.account_id, id
        )
    }

    fn policy_arn(&self, id: &str, key: &PolicyKey) -> String {
        format!(
            "arn:aws:autoscaling:{}:{}:scalingPolicy:{}:resource/{}/{}:policyName/{}",
            self.region,
            self.account_id,
            id,
            key.target.service_namespace,
            key.target.resource_id,
            key.policy_name
        )
    }

    fn alarms_for(&self, key: &PolicyKey, id: &str) -> Vec<Alarm> {
        ["AlarmHigh", "AlarmLow"]
            .iter()
            .map(|suffix| {
                let name = format!("TargetTracking-{}-{}-{}", key.target.resource_id, suffix, id);
                Alarm {
                    alarm_arn: format!(
                        "arn:aws:cloudwatch:{}:{}:alarm:{}",
                        self.region, self.account_id, name
                    ),
                    alarm_name: name,
                }
            })
            .collect()
    }
}

fn target_matches(filter: &TargetFilter, key: &TargetKey) -> bool {
    key.service_namespace == filter.service_namespace
        && (filter.resource_ids.is_empty() || filter.resource_ids.contains(&key.resource_id))
        && filter
            .scalable_dimension
            .as_ref()
            .is_none_or(|d| *d == key.scalable_dimension)
}

fn policy_matches(filter: &PolicyFilter, key: &PolicyKey) -> bool {
    key.target.service_namespace == filter.service_namespace
        && filter
            .resource_id
            .as_ref()
            .is_none_or(|r| *r == key.target.resource_id)
        && filter
            .scalable_dimension
            .as_ref()
            .is_none_or(|d| *d == key.target.scalable_dimension)
        && (filter.policy_names.is_empty() || filter.policy_names.contains(&key.policy_name))
}

#[async_trait]
impl AutoscalingApi for InMemoryAutoscaling {
    async fn describe_scalable_targets(
        &self,
        filter: &TargetFilter,
    ) -> Result<Vec<RemoteTargetState>, AwsError> {
        let mut state = self.lock();
        state.begin("DescribeScalableTargets")?;
        let now = Utc::now();
        Ok(state
            .targets
            .iter()
            .filter(|(key, _)| target_matches(filter, key))
            .map(|(_, target)| RemoteTargetState {
                observed_at: now,
                ..target.clone()
            })
            .collect())
    }

    async fn register_scalable_target(
        &self,
        input: &RegisterTargetInput,
    ) -> Result<RegisterTargetOutput, AwsError> {
        const OP: &str = "RegisterScalableTarget";
        let mut state = self.lock();
        state.begin(OP)?;

        let existing = state.targets.get(&input.key).cloned();
        let min = input
            .min_capacity
            .or(existing.as_ref().map(|t| t.min_capacity));
        let max = input
            .max_capacity
            .or(existing.as_ref().map(|t| t.max_capacity));
        let (Some(min), Some(max)) = (min, max) else {
            return Err(AwsError::validation(
                OP,
                "MinCapacity and MaxCapacity are required when registering a new scalable target",
            ));
        };
        if min < 0 || min > max {
            return Err(AwsError::validation(
                OP,
                format!("invalid capacity bounds: min {min}, max {max}"),
            ));
        }

        let stamp = state.next_stamp();
        let target = match existing {
            Some(mut target) => {
                target.min_capacity = min;
                target.max_capacity = max;
                if input.role_arn.is_some() {
                    target.role_arn = input.role_arn.clone();
                }
                if input.suspended_state.is_some() {
                    target.suspended_state = input.suspended_state.clone();
                }
                target.last_modified_time = Some(stamp);
                target
            }
            None => {
                let id = state.next_id();
                RemoteTargetState {
                    key: input.key.clone(),
                    min_capacity: min,
                    max_capacity: max,
                    role_arn: input.role_arn.clone().or_else(|| {
                        Some(format!(
                            "arn:aws:iam::{}:role/aws-service-role/AWSServiceRoleForApplicationAutoScaling",
                            self.account_id
                        ))
                    }),
                    suspended_state: Some(input.suspended_state.clone().unwrap_or_default()),
                    arn: Some(self.target_arn(&id)),
                    creation_time: Some(stamp),
                    last_modified_time: Some(stamp),
                    observed_at: stamp,
                }
            }
        };
        debug!(target = %input.key, min, max, "registered scalable target");
        let arn = target.arn.clone();
        state.targets.insert(input.key.clone(), target);
        Ok(RegisterTargetOutput { arn })
    }

    async fn deregister_scalable_target(&self, key: &TargetKey) -> Result<(), AwsError> {
        const OP: &str = "DeregisterScalableTarget";
        let mut state = self.lock();
        state.begin(OP)?;

        if state.targets.remove(key).is_none() {
            return Err(AwsError::object_not_found(
                OP,
                format!("No scalable target found for {key}"),
            ));
        }

        // The service drops the target's policies along with it, but describe
        // calls may keep reporting them for a while.
        let orphaned: Vec<PolicyKey> = state
            .policies
            .keys()
            .filter(|p| p.target == *key)
            .cloned()
            .collect();
        for policy_key in orphaned {
            if let Some(policy) = state.policies.remove(&policy_key)
                && self.policy_retention > 0
            {
                state
                    .lingering
                    .insert(policy_key, (policy, self.policy_retention));
            }
        }
        Ok(())
    }

    async fn describe_scaling_policies(
        &self,
        filter: &PolicyFilter,
    ) -> Result<Vec<RemotePolicyState>, AwsError> {
        let mut state = self.lock();
        state.begin("DescribeScalingPolicies")?;
        let now = Utc::now();

        let mut found: Vec<RemotePolicyState> = state
            .policies
            .iter()
            .filter(|(key, _)| policy_matches(filter, key))
            .map(|(_, p)| RemotePolicyState {
                observed_at: now,
                ..p.clone()
            })
            .collect();

        let mut expired = vec![];
        for (key, (policy, remaining)) in state.lingering.iter_mut() {
            if policy_matches(filter, key) {
                found.push(RemotePolicyState {
                    observed_at: now,
                    ..policy.clone()
                });
                *remaining = remaining.saturating_sub(1);
                if *remaining == 0 {
                    expired.push(key.clone());
                }
            }
        }
        for key in expired {
            state.lingering.remove(&key);
        }

        Ok(found)
    }

    async fn put_scaling_policy(&self, input: &PutPolicyInput) -> Result<PutPolicyOutput, AwsError> {
        const OP: &str = "PutScalingPolicy";
        let mut state = self.lock();
        state.begin(OP)?;

        if !state.targets.contains_key(&input.key.target) {
            return Err(AwsError::object_not_found(
                OP,
                format!("No scalable target registered for {}", input.key.target),
            ));
        }
        if input.policy_type == PolicyType::TargetTrackingScaling && input.target_tracking.is_none() {
            return Err(AwsError::validation(
                OP,
                "TargetTrackingScalingPolicyConfiguration is required for TargetTrackingScaling",
            ));
        }

        let stamp = state.next_stamp();
        let policy = match state.policies.get(&input.key).cloned() {
            Some(mut policy) => {
                policy.policy_type = input.policy_type;
                policy.target_tracking = input.target_tracking.clone();
                policy.last_modified_time = Some(stamp);
                policy
            }
            None => {
                let id = state.next_id();
                RemotePolicyState {
                    key: input.key.clone(),
                    policy_type: input.policy_type,
                    target_tracking: input.target_tracking.clone(),
                    arn: self.policy_arn(&id, &input.key),
                    alarms: self.alarms_for(&input.key, &id),
                    creation_time: Some(stamp),
                    last_modified_time: Some(stamp),
                    observed_at: stamp,
                }
            }
        };
        debug!(policy = %input.key, "put scaling policy");
        let output = PutPolicyOutput {
            arn: policy.arn.clone(),
            alarms: policy.alarms.clone(),
        };
        state.policies.insert(input.key.clone(), policy);
        Ok(output)
    }

    async fn delete_scaling_policy(&self, key: &PolicyKey) -> Result<(), AwsError> {
        const OP: &str = "DeleteScalingPolicy";
        let mut state = self.lock();
        state.begin(OP)?;

        if let Some(policy) = state.policies.remove(key) {
            if self.policy_retention > 0 {
                state
                    .lingering
                    .insert(key.clone(), (policy, self.policy_retention));
            }
            return Ok(());
        }
        if state.lingering.remove(key).is_some() {
            return Ok(());
        }
        Err(AwsError::object_not_found(
            OP,
            format!("No scaling policy found for {key}"),
        ))
    }

    fn region(&self) -> Option<String> {
        Some(self.region.clone())
    }

    fn account_id(&self) -> Option<String> {
        Some(self.account_id.clone())
    }
}
