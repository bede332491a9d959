use kube::CustomResource;
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};

use super::common::SyncState;

/// ScalableTarget registers a resource dimension with Application Auto Scaling
#[derive(CustomResource, Serialize, Deserialize, Clone, Debug, JsonSchema, PartialEq)]
#[kube(
    group = "applicationautoscaling.services.k8s.aws",
    version = "v1alpha1",
    kind = "ScalableTarget",
    plural = "scalabletargets",
    namespaced,
    status = "ScalableTargetStatus",
    printcolumn = r#"{"name":"ResourceID", "type":"string", "jsonPath":".spec.resourceID"}"#,
    printcolumn = r#"{"name":"Min", "type":"integer", "jsonPath":".spec.minCapacity"}"#,
    printcolumn = r#"{"name":"Max", "type":"integer", "jsonPath":".spec.maxCapacity"}"#,
    printcolumn = r#"{"name":"Phase", "type":"string", "jsonPath":".status.phase"}"#,
    printcolumn = r#"{"name":"Age", "type":"date", "jsonPath":".metadata.creationTimestamp"}"#
)]
#[serde(rename_all = "camelCase")]
pub struct ScalableTargetSpec {
    /// Namespace of the AWS service owning the resource (e.g. "sagemaker", "dynamodb")
    pub service_namespace: String,

    /// Identifier of the resource, e.g. "endpoint/my-endpoint/variant/variant-1"
    #[serde(rename = "resourceID")]
    pub resource_id: String,

    /// Scalable dimension, e.g. "sagemaker:variant:DesiredInstanceCount"
    pub scalable_dimension: String,

    /// Lower capacity bound
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub min_capacity: Option<i32>,

    /// Upper capacity bound
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub max_capacity: Option<i32>,

    /// IAM role used to modify the target (service-linked role when unset)
    #[serde(rename = "roleARN", default, skip_serializing_if = "Option::is_none")]
    pub role_arn: Option<String>,

    /// Suspension flags for scaling activities
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub suspended_state: Option<SuspendedState>,
}

/// Scaling activity suspension flags
#[derive(Serialize, Deserialize, Clone, Debug, JsonSchema, Default, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct SuspendedState {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub dynamic_scaling_in_suspended: Option<bool>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub dynamic_scaling_out_suspended: Option<bool>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub scheduled_scaling_suspended: Option<bool>,
}

/// Status of the ScalableTarget
#[derive(Serialize, Deserialize, Clone, Debug, JsonSchema, Default, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct ScalableTargetStatus {
    #[serde(flatten)]
    pub sync: SyncState,

    /// Role reported by the remote system
    #[serde(rename = "roleARN", default, skip_serializing_if = "Option::is_none")]
    pub role_arn: Option<String>,
}
