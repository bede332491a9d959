//! AdoptedResource CRD definition
//!
//! An AdoptedResource names a pre-existing remote object by its identity and
//! asks the operator to bind it to a new managed custom resource without
//! issuing a create call.

use std::collections::BTreeMap;

use kube::CustomResource;
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};

use super::common::Condition;

#[derive(CustomResource, Serialize, Deserialize, Clone, Debug, JsonSchema, PartialEq)]
#[kube(
    group = "services.k8s.aws",
    version = "v1alpha1",
    kind = "AdoptedResource",
    plural = "adoptedresources",
    namespaced,
    status = "AdoptedResourceStatus",
    printcolumn = r#"{"name":"Kind", "type":"string", "jsonPath":".spec.kubernetes.kind"}"#,
    printcolumn = r#"{"name":"Target", "type":"string", "jsonPath":".spec.kubernetes.metadata.name"}"#,
    printcolumn = r#"{"name":"Age", "type":"date", "jsonPath":".metadata.creationTimestamp"}"#
)]
#[serde(rename_all = "camelCase")]
pub struct AdoptedResourceSpec {
    /// Remote identity of the object to adopt
    pub aws: AwsIdentifiers,

    /// Custom resource to create for the adopted object
    pub kubernetes: ResourceWithMetadata,
}

/// Remote identity fields
#[derive(Serialize, Deserialize, Clone, Debug, JsonSchema, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct AwsIdentifiers {
    /// Resource identifier (the remote resourceID)
    #[serde(rename = "nameOrID")]
    pub name_or_id: String,

    /// Remaining identity fields: serviceNamespace, scalableDimension, policyName
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub additional_keys: BTreeMap<String, String>,
}

/// Target custom resource description
#[derive(Serialize, Deserialize, Clone, Debug, JsonSchema, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct ResourceWithMetadata {
    pub group: String,

    /// "ScalableTarget" or "ScalingPolicy"
    pub kind: String,

    pub metadata: TargetMetadata,
}

#[derive(Serialize, Deserialize, Clone, Debug, JsonSchema, PartialEq)]
pub struct TargetMetadata {
    pub name: String,

    /// Defaults to the AdoptedResource's namespace
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub namespace: Option<String>,
}

#[derive(Serialize, Deserialize, Clone, Debug, JsonSchema, Default, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct AdoptedResourceStatus {
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub conditions: Vec<Condition>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub observed_generation: Option<i64>,

    /// Consecutive failed adoption attempts
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub retry_count: Option<u32>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_error: Option<String>,

    /// Earliest time a failed adoption is attempted again (RFC 3339)
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub next_attempt_time: Option<String>,
}
