//! Status types shared by the managed Application Auto Scaling kinds

use schemars::JsonSchema;
use serde::{Deserialize, Serialize};

/// API group of the managed kinds
pub const GROUP: &str = "applicationautoscaling.services.k8s.aws";

/// API version of the managed kinds
pub const VERSION: &str = "v1alpha1";

/// Annotation set on custom resources created through adoption
pub const ADOPTED_ANNOTATION: &str = "services.k8s.aws/adopted";

/// Annotation controlling what happens to the remote object on deletion
pub const DELETION_POLICY_ANNOTATION: &str = "services.k8s.aws/deletion-policy";

/// Sync lifecycle phase of a managed resource
#[derive(Serialize, Deserialize, Clone, Copy, Debug, JsonSchema, Default, PartialEq, Eq, Hash)]
pub enum SyncPhase {
    /// No remote counterpart has been observed yet
    #[default]
    Pending,
    /// A remote call is in flight or scheduled
    Syncing,
    /// Remote state matches the desired spec
    Synced,
    /// Deletion requested, remote delete pending
    Deleting,
    /// Remote object is gone
    Deleted,
}

impl std::fmt::Display for SyncPhase {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            SyncPhase::Pending => write!(f, "Pending"),
            SyncPhase::Syncing => write!(f, "Syncing"),
            SyncPhase::Synced => write!(f, "Synced"),
            SyncPhase::Deleting => write!(f, "Deleting"),
            SyncPhase::Deleted => write!(f, "Deleted"),
        }
    }
}

/// Kubernetes-style condition
#[derive(Serialize, Deserialize, Clone, Debug, JsonSchema, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct Condition {
    /// Type of condition
    #[serde(rename = "type")]
    pub type_: String,

    /// Status of the condition: True, False, or Unknown
    pub status: String,

    /// Reason for the condition's last transition
    pub reason: String,

    /// Human-readable message
    pub message: String,

    /// Last time the condition transitioned
    pub last_transition_time: String,

    /// Generation observed when condition was set
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub observed_generation: Option<i64>,
}

/// Identifiers of the remote object backing a custom resource
#[derive(Serialize, Deserialize, Clone, Debug, JsonSchema, Default, PartialEq)]
pub struct ResourceMetadata {
    /// ARN of the remote object
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub arn: Option<String>,

    /// AWS account owning the remote object
    #[serde(rename = "ownerAccountID", default, skip_serializing_if = "Option::is_none")]
    pub owner_account_id: Option<String>,

    /// Region of the remote object
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub region: Option<String>,
}

/// Sync bookkeeping common to every managed kind
#[derive(Serialize, Deserialize, Clone, Debug, JsonSchema, Default, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct SyncState {
    /// Current sync phase
    #[serde(default)]
    pub phase: SyncPhase,

    /// Kubernetes-style conditions
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub conditions: Vec<Condition>,

    /// Observed generation of the resource
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub observed_generation: Option<i64>,

    /// Remote object identifiers
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub ack_resource_metadata: Option<ResourceMetadata>,

    /// Remote creation time (RFC 3339)
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub creation_time: Option<String>,

    /// Last remote modification time (RFC 3339)
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_modified_time: Option<String>,

    /// Identity key the resource was last synced under
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub synced_identity: Option<String>,

    /// Consecutive failed reconciliations
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub retry_count: Option<u32>,

    /// Last reconciliation error
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_error: Option<String>,

    /// Time of the last reconciliation error (RFC 3339)
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_error_time: Option<String>,

    /// Earliest time a failed resource is reconciled again (RFC 3339).
    /// Unset after a failure that waits for a spec change.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub next_attempt_time: Option<String>,
}

impl SyncState {
    /// ARN recorded for the remote object, if any
    pub fn arn(&self) -> Option<&str> {
        self.ack_resource_metadata
            .as_ref()
            .and_then(|m| m.arn.as_deref())
    }

    /// Whether the named condition is currently True
    pub fn condition_is_true(&self, type_: &str) -> bool {
        self.conditions
            .iter()
            .any(|c| c.type_ == type_ && c.status == "True")
    }
}

/// Whether the deletion policy annotation asks to keep the remote object
pub fn retains_remote_on_delete(meta: &kube::core::ObjectMeta) -> bool {
    meta.annotations
        .as_ref()
        .and_then(|a| a.get(DELETION_POLICY_ANNOTATION))
        .is_some_and(|v| v.eq_ignore_ascii_case("retain"))
}

/// Whether the resource was created through adoption
pub fn is_adopted(meta: &kube::core::ObjectMeta) -> bool {
    meta.annotations
        .as_ref()
        .and_then(|a| a.get(ADOPTED_ANNOTATION))
        .is_some_and(|v| v == "true")
}
