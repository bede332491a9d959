//! Desired/observed comparison
//!
//! Only the fields the remote system lets us mutate are compared. Optional
//! desired fields left unset are server-defaulted and never produce a change.

use std::fmt;

use crate::aws::{PolicyKey, RegisterTargetInput, RemotePolicyState, RemoteTargetState, TargetKey};
use crate::controller::error::{Error, Result};
use crate::crd::{ScalableTargetSpec, ScalingPolicySpec, SuspendedState};

/// One mutable field whose desired value differs from the observed one
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct FieldChange {
    pub field: &'static str,
    pub desired: String,
    pub observed: String,
}

/// Set of field changes; empty means no remote call is needed
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct ChangeSet {
    changes: Vec<FieldChange>,
}

impl ChangeSet {
    pub fn is_empty(&self) -> bool {
        self.changes.is_empty()
    }

    pub fn len(&self) -> usize {
        self.changes.len()
    }

    pub fn changes(&self) -> &[FieldChange] {
        &self.changes
    }

    /// Names of the changed fields
    pub fn fields(&self) -> Vec<&'static str> {
        self.changes.iter().map(|c| c.field).collect()
    }

    pub fn contains(&self, field: &str) -> bool {
        self.changes.iter().any(|c| c.field == field)
    }

    fn compare<T: PartialEq + fmt::Debug>(&mut self, field: &'static str, desired: Option<&T>, observed: &T) {
        if let Some(desired) = desired
            && desired != observed
        {
            self.changes.push(FieldChange {
                field,
                desired: format!("{:?}", desired),
                observed: format!("{:?}", observed),
            });
        }
    }
}

impl fmt::Display for ChangeSet {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let parts: Vec<String> = self
            .changes
            .iter()
            .map(|c| format!("{}: {} -> {}", c.field, c.observed, c.desired))
            .collect();
        f.write_str(&parts.join(", "))
    }
}

/// Remote identity of a ScalableTarget spec
pub fn target_key(spec: &ScalableTargetSpec) -> TargetKey {
    TargetKey::new(
        &spec.service_namespace,
        &spec.resource_id,
        &spec.scalable_dimension,
    )
}

/// Remote identity of a ScalingPolicy spec
pub fn policy_key(spec: &ScalingPolicySpec) -> PolicyKey {
    PolicyKey::new(
        TargetKey::new(
            &spec.service_namespace,
            &spec.resource_id,
            &spec.scalable_dimension,
        ),
        &spec.policy_name,
    )
}

/// Compare a target spec against its described state
pub fn diff_target(desired: &ScalableTargetSpec, observed: &RemoteTargetState) -> ChangeSet {
    let mut changes = ChangeSet::default();
    changes.compare("minCapacity", desired.min_capacity.as_ref(), &observed.min_capacity);
    changes.compare("maxCapacity", desired.max_capacity.as_ref(), &observed.max_capacity);

    if let Some(role) = &desired.role_arn {
        changes.compare(
            "roleARN",
            Some(&Some(role.clone())),
            &observed.role_arn,
        );
    }

    if let Some(suspended) = &desired.suspended_state {
        let remote = observed.suspended_state.clone().unwrap_or_default();
        diff_suspended(&mut changes, suspended, &remote);
    }
    changes
}

/// RegisterScalableTarget input for a spec
///
/// An empty change set sends every desired field, as a create does. Otherwise
/// only changed fields are sent; `suspendedState` goes whole when any of its
/// flags changed.
pub fn register_input(spec: &ScalableTargetSpec, changes: &ChangeSet) -> RegisterTargetInput {
    let all = changes.is_empty();
    let send = |field: &str| all || changes.contains(field);
    let suspended_changed = changes
        .changes
        .iter()
        .any(|c| c.field.starts_with("suspendedState."));
    RegisterTargetInput {
        key: target_key(spec),
        min_capacity: spec.min_capacity.filter(|_| send("minCapacity")),
        max_capacity: spec.max_capacity.filter(|_| send("maxCapacity")),
        role_arn: spec.role_arn.clone().filter(|_| send("roleARN")),
        suspended_state: spec
            .suspended_state
            .clone()
            .filter(|_| all || suspended_changed),
    }
}

fn diff_suspended(changes: &mut ChangeSet, desired: &SuspendedState, observed: &SuspendedState) {
    changes.compare(
        "suspendedState.dynamicScalingInSuspended",
        desired.dynamic_scaling_in_suspended.as_ref(),
        &observed.dynamic_scaling_in_suspended.unwrap_or(false),
    );
    changes.compare(
        "suspendedState.dynamicScalingOutSuspended",
        desired.dynamic_scaling_out_suspended.as_ref(),
        &observed.dynamic_scaling_out_suspended.unwrap_or(false),
    );
    changes.compare(
        "suspendedState.scheduledScalingSuspended",
        desired.scheduled_scaling_suspended.as_ref(),
        &observed.scheduled_scaling_suspended.unwrap_or(false),
    );
}

/// Compare a policy spec against its described state
pub fn diff_policy(desired: &ScalingPolicySpec, observed: &RemotePolicyState) -> ChangeSet {
    let mut changes = ChangeSet::default();
    changes.compare("policyType", Some(&desired.policy_type), &observed.policy_type);

    let Some(config) = &desired.target_tracking_scaling_policy_configuration else {
        return changes;
    };
    let Some(remote) = &observed.target_tracking else {
        changes.changes.push(FieldChange {
            field: "targetTrackingScalingPolicyConfiguration",
            desired: format!("{:?}", config),
            observed: "None".to_string(),
        });
        return changes;
    };

    // Exact comparison: the remote system echoes the value it was given.
    if config.target_value != remote.target_value {
        changes.changes.push(FieldChange {
            field: "targetTrackingScalingPolicyConfiguration.targetValue",
            desired: config.target_value.to_string(),
            observed: remote.target_value.to_string(),
        });
    }
    changes.compare(
        "targetTrackingScalingPolicyConfiguration.scaleInCooldown",
        config.scale_in_cooldown.map(Some).as_ref(),
        &remote.scale_in_cooldown,
    );
    changes.compare(
        "targetTrackingScalingPolicyConfiguration.scaleOutCooldown",
        config.scale_out_cooldown.map(Some).as_ref(),
        &remote.scale_out_cooldown,
    );
    changes.compare(
        "targetTrackingScalingPolicyConfiguration.disableScaleIn",
        config.disable_scale_in.as_ref(),
        &remote.disable_scale_in.unwrap_or(false),
    );

    if let Some(metric) = &config.predefined_metric_specification {
        let remote_metric = remote.predefined_metric_specification.as_ref();
        changes.compare(
            "targetTrackingScalingPolicyConfiguration.predefinedMetricSpecification.predefinedMetricType",
            Some(&Some(metric.predefined_metric_type.clone())),
            &remote_metric.map(|m| m.predefined_metric_type.clone()),
        );
        if let Some(label) = &metric.resource_label {
            changes.compare(
                "targetTrackingScalingPolicyConfiguration.predefinedMetricSpecification.resourceLabel",
                Some(&Some(label.clone())),
                &remote_metric.and_then(|m| m.resource_label.clone()),
            );
        }
    }
    changes
}

/// Reject a change of identity fields once the resource has been synced
///
/// The remote API has no rename operation, so a new identity would silently
/// create a second remote object and orphan the first.
pub fn identity_change(synced_identity: Option<&str>, current: &str) -> Result<()> {
    match synced_identity {
        Some(synced) if synced != current => Err(Error::ValidationError(format!(
            "identity fields are immutable: resource was synced as {} but spec now names {}",
            synced, current
        ))),
        _ => Ok(()),
    }
}
