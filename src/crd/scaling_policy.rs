use kube::CustomResource;
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};

use super::common::SyncState;

/// ScalingPolicy attaches a scaling rule to a registered scalable target
#[derive(CustomResource, Serialize, Deserialize, Clone, Debug, JsonSchema, PartialEq)]
#[kube(
    group = "applicationautoscaling.services.k8s.aws",
    version = "v1alpha1",
    kind = "ScalingPolicy",
    plural = "scalingpolicies",
    namespaced,
    status = "ScalingPolicyStatus",
    printcolumn = r#"{"name":"Policy", "type":"string", "jsonPath":".spec.policyName"}"#,
    printcolumn = r#"{"name":"ResourceID", "type":"string", "jsonPath":".spec.resourceID"}"#,
    printcolumn = r#"{"name":"Phase", "type":"string", "jsonPath":".status.phase"}"#,
    printcolumn = r#"{"name":"Age", "type":"date", "jsonPath":".metadata.creationTimestamp"}"#
)]
#[serde(rename_all = "camelCase")]
pub struct ScalingPolicySpec {
    pub service_namespace: String,

    #[serde(rename = "resourceID")]
    pub resource_id: String,

    pub scalable_dimension: String,

    /// Name of the policy; immutable once synced
    pub policy_name: String,

    /// Policy type
    #[serde(default)]
    pub policy_type: PolicyType,

    /// Target tracking configuration, required for TargetTrackingScaling
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub target_tracking_scaling_policy_configuration:
        Option<TargetTrackingScalingPolicyConfiguration>,
}

/// Scaling policy type
#[derive(Serialize, Deserialize, Clone, Copy, Debug, JsonSchema, Default, PartialEq, Eq)]
pub enum PolicyType {
    #[default]
    TargetTrackingScaling,
    StepScaling,
    PredictiveScaling,
}

impl PolicyType {
    pub fn as_str(&self) -> &'static str {
        match self {
            PolicyType::TargetTrackingScaling => "TargetTrackingScaling",
            PolicyType::StepScaling => "StepScaling",
            PolicyType::PredictiveScaling => "PredictiveScaling",
        }
    }
}

impl std::str::FromStr for PolicyType {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "TargetTrackingScaling" => Ok(PolicyType::TargetTrackingScaling),
            "StepScaling" => Ok(PolicyType::StepScaling),
            "PredictiveScaling" => Ok(PolicyType::PredictiveScaling),
            other => Err(format!("unknown policy type {other}")),
        }
    }
}

impl std::fmt::Display for PolicyType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Target tracking configuration
#[derive(Serialize, Deserialize, Clone, Debug, JsonSchema, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct TargetTrackingScalingPolicyConfiguration {
    /// Metric value the policy keeps the target at
    pub target_value: f64,

    /// Seconds after a scale-in activity before another may start
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub scale_in_cooldown: Option<i32>,

    /// Seconds after a scale-out activity before another may start
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub scale_out_cooldown: Option<i32>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub disable_scale_in: Option<bool>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub predefined_metric_specification: Option<PredefinedMetricSpecification>,
}

/// Predefined metric driving a target tracking policy
#[derive(Serialize, Deserialize, Clone, Debug, JsonSchema, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct PredefinedMetricSpecification {
    /// e.g. "SageMakerVariantInvocationsPerInstance", "DynamoDBReadCapacityUtilization"
    pub predefined_metric_type: String,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub resource_label: Option<String>,
}

/// CloudWatch alarm created for a policy
#[derive(Serialize, Deserialize, Clone, Debug, JsonSchema, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct Alarm {
    pub alarm_name: String,

    #[serde(rename = "alarmARN")]
    pub alarm_arn: String,
}

/// Status of the ScalingPolicy
#[derive(Serialize, Deserialize, Clone, Debug, JsonSchema, Default, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct ScalingPolicyStatus {
    #[serde(flatten)]
    pub sync: SyncState,

    /// Alarms reported by the remote system
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub alarms: Vec<Alarm>,

    /// When the policy started waiting for its scalable target (RFC 3339)
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub dependency_wait_started_at: Option<String>,
}
