//! Status and conditions management for managed autoscaling resources
//!
//! Status builders are pure: they take the previous status and what the
//! current pass observed, and return the next status. [`StatusWriter`] is the
//! only part that talks to the API server.

use std::fmt::Debug;
use std::time::Duration;

use chrono::{DateTime, SecondsFormat, Utc};
use kube::api::{Patch, PatchParams};
use kube::core::NamespaceResourceScope;
use kube::runtime::controller::Action;
use kube::{Api, Client, Resource, ResourceExt};
use serde::Serialize;
use serde::de::DeserializeOwned;

use crate::controller::error::{Error, Result};
use crate::controller::remote::Mutation;
use crate::crd::{Condition, ResourceMetadata, SyncPhase, SyncState};

/// Field manager used for every status write
pub const FIELD_MANAGER: &str = "autoscaling-operator";

/// Condition types reported on managed resources
pub mod condition_types {
    /// Remote object matches the desired spec
    pub const RESOURCE_SYNCED: &str = "ACK.ResourceSynced";
    /// Last reconcile failed and will be retried
    pub const RECOVERABLE: &str = "ACK.Recoverable";
    /// Last reconcile failed and needs a spec change or operator action
    pub const TERMINAL: &str = "ACK.Terminal";
    /// Resource was bound to a pre-existing remote object
    pub const ADOPTED: &str = "ACK.Adopted";
}

/// Condition status values
pub mod condition_status {
    pub const TRUE: &str = "True";
    pub const FALSE: &str = "False";
    pub const UNKNOWN: &str = "Unknown";
}

/// Timestamps are written as RFC 3339 with millisecond precision
pub fn format_timestamp(ts: DateTime<Utc>) -> String {
    ts.to_rfc3339_opts(SecondsFormat::Millis, true)
}

/// Builder for creating and updating status conditions
pub struct ConditionBuilder {
    conditions: Vec<Condition>,
    generation: Option<i64>,
    now: String,
}

impl ConditionBuilder {
    pub fn new(generation: Option<i64>) -> Self {
        Self::from_existing(Vec::new(), generation)
    }

    pub fn from_existing(existing: Vec<Condition>, generation: Option<i64>) -> Self {
        Self {
            conditions: existing,
            generation,
            now: format_timestamp(Utc::now()),
        }
    }

    /// Use a fixed clock for transition times
    pub fn at(mut self, now: DateTime<Utc>) -> Self {
        self.now = format_timestamp(now);
        self
    }

    /// Set a condition, updating if it exists or adding if it doesn't.
    /// The transition time only moves when the status value changes.
    pub fn set_condition(mut self, type_: &str, status: &str, reason: &str, message: &str) -> Self {
        if let Some(existing) = self.conditions.iter_mut().find(|c| c.type_ == type_) {
            if existing.status != status {
                existing.status = status.to_string();
                existing.last_transition_time = self.now.clone();
            }
            existing.reason = reason.to_string();
            existing.message = message.to_string();
            existing.observed_generation = self.generation;
        } else {
            self.conditions.push(Condition {
                type_: type_.to_string(),
                status: status.to_string(),
                reason: reason.to_string(),
                message: message.to_string(),
                last_transition_time: self.now.clone(),
                observed_generation: self.generation,
            });
        }
        self
    }

    pub fn remove_condition(mut self, type_: &str) -> Self {
        self.conditions.retain(|c| c.type_ != type_);
        self
    }

    /// Set the ACK.ResourceSynced condition
    pub fn synced(self, is_synced: bool, reason: &str, message: &str) -> Self {
        let status = if is_synced {
            condition_status::TRUE
        } else {
            condition_status::FALSE
        };
        self.set_condition(condition_types::RESOURCE_SYNCED, status, reason, message)
    }

    /// Mark the last failure as recoverable, replacing any terminal condition
    pub fn recoverable(self, reason: &str, message: &str) -> Self {
        self.remove_condition(condition_types::TERMINAL).set_condition(
            condition_types::RECOVERABLE,
            condition_status::TRUE,
            reason,
            message,
        )
    }

    /// Mark the last failure as terminal, replacing any recoverable condition
    pub fn terminal(self, reason: &str, message: &str) -> Self {
        self.remove_condition(condition_types::RECOVERABLE).set_condition(
            condition_types::TERMINAL,
            condition_status::TRUE,
            reason,
            message,
        )
    }

    /// Drop failure conditions after a successful pass
    pub fn clear_errors(self) -> Self {
        self.remove_condition(condition_types::RECOVERABLE)
            .remove_condition(condition_types::TERMINAL)
    }

    /// Set ACK.Adopted to True. Once True it is never rewritten.
    pub fn adopted(self, message: &str) -> Self {
        let already = self
            .conditions
            .iter()
            .any(|c| c.type_ == condition_types::ADOPTED && c.status == condition_status::TRUE);
        if already {
            return self;
        }
        self.set_condition(
            condition_types::ADOPTED,
            condition_status::TRUE,
            "Adopted",
            message,
        )
    }

    pub fn build(self) -> Vec<Condition> {
        self.conditions
    }
}

/// Remote attributes observed during a successful pass
#[derive(Clone, Debug, Default, PartialEq)]
pub struct RemoteSnapshot {
    pub arn: Option<String>,
    pub region: Option<String>,
    pub owner_account_id: Option<String>,
    pub creation_time: Option<DateTime<Utc>>,
    /// Modification time reported by the remote system, when it reports one
    pub last_modified_time: Option<DateTime<Utc>>,
    pub mutation: Mutation,
    /// Resource was bound through adoption
    pub adopted: bool,
}

/// lastModifiedTime for a successful pass
///
/// Remote value when reported; otherwise creationTime after a create, the
/// current time after an update, and the previous value when nothing changed.
pub fn last_modified_time(
    previous: Option<&SyncState>,
    snapshot: &RemoteSnapshot,
    now: DateTime<Utc>,
) -> Option<String> {
    if let Some(ts) = snapshot.last_modified_time {
        return Some(format_timestamp(ts));
    }
    match snapshot.mutation {
        Mutation::Updated => Some(format_timestamp(now)),
        Mutation::Created => Some(format_timestamp(snapshot.creation_time.unwrap_or(now))),
        Mutation::None => previous
            .and_then(|s| s.last_modified_time.clone())
            .or_else(|| snapshot.creation_time.map(format_timestamp)),
    }
}

fn success_status(
    previous: Option<&SyncState>,
    generation: Option<i64>,
    phase: SyncPhase,
    identity: &str,
    snapshot: &RemoteSnapshot,
    now: DateTime<Utc>,
    synced_reason: (bool, &str, &str),
) -> SyncState {
    let existing = previous.map(|s| s.conditions.clone()).unwrap_or_default();
    let (is_synced, reason, message) = synced_reason;
    let mut conditions = ConditionBuilder::from_existing(existing, generation).at(now);
    if snapshot.adopted {
        conditions = conditions.adopted("Bound to existing remote object");
    }
    let conditions = conditions
        .synced(is_synced, reason, message)
        .clear_errors()
        .build();

    SyncState {
        phase,
        conditions,
        observed_generation: generation,
        ack_resource_metadata: Some(ResourceMetadata {
            arn: snapshot
                .arn
                .clone()
                .or_else(|| previous.and_then(|s| s.arn().map(str::to_string))),
            owner_account_id: snapshot.owner_account_id.clone(),
            region: snapshot.region.clone(),
        }),
        creation_time: snapshot
            .creation_time
            .map(format_timestamp)
            .or_else(|| previous.and_then(|s| s.creation_time.clone())),
        last_modified_time: last_modified_time(previous, snapshot, now),
        synced_identity: Some(identity.to_string()),
        retry_count: Some(0),
        last_error: None,
        last_error_time: None,
        next_attempt_time: None,
    }
}

/// Status after a pass that found the remote object matching the spec
pub fn synced_status(
    previous: Option<&SyncState>,
    generation: Option<i64>,
    identity: &str,
    snapshot: &RemoteSnapshot,
    now: DateTime<Utc>,
) -> SyncState {
    success_status(
        previous,
        generation,
        SyncPhase::Synced,
        identity,
        snapshot,
        now,
        (true, "Synced", "Resource is synced with the remote object"),
    )
}

/// Status after a pass that issued a remote call or has yet to confirm convergence
pub fn syncing_status(
    previous: Option<&SyncState>,
    generation: Option<i64>,
    identity: &str,
    snapshot: &RemoteSnapshot,
    now: DateTime<Utc>,
) -> SyncState {
    let message = match snapshot.mutation {
        Mutation::Created => "Remote object created, confirming",
        Mutation::Updated => "Remote object updated, confirming",
        Mutation::None => "Confirming remote state",
    };
    success_status(
        previous,
        generation,
        SyncPhase::Syncing,
        identity,
        snapshot,
        now,
        (false, "Syncing", message),
    )
}

/// Status after a failed pass. Phase is unchanged; the retry count grows.
///
/// `retry_after` of `None` records a failure that waits for a spec change.
pub fn failed_status(
    previous: Option<&SyncState>,
    generation: Option<i64>,
    error: &Error,
    terminal: bool,
    retry_after: Option<Duration>,
    now: DateTime<Utc>,
) -> SyncState {
    let mut state = previous.cloned().unwrap_or_default();
    let message = error.to_string();
    let builder = ConditionBuilder::from_existing(std::mem::take(&mut state.conditions), generation)
        .at(now)
        .synced(false, error.reason(), &message);
    state.conditions = if terminal {
        builder.terminal(error.reason(), &message).build()
    } else {
        builder.recoverable(error.reason(), &message).build()
    };
    state.observed_generation = generation;
    state.retry_count = Some(state.retry_count.unwrap_or(0).saturating_add(1));
    state.last_error = Some(message);
    state.last_error_time = Some(format_timestamp(now));
    state.next_attempt_time = next_attempt_time(retry_after, now);
    state
}

/// RFC 3339 time `retry_after` from `now`
pub fn next_attempt_time(retry_after: Option<Duration>, now: DateTime<Utc>) -> Option<String> {
    let delay = chrono::Duration::from_std(retry_after?).ok()?;
    Some(format_timestamp(now + delay))
}

/// Status while the remote object is being removed, or once it is gone
pub fn deleting_status(
    previous: Option<&SyncState>,
    generation: Option<i64>,
    phase: SyncPhase,
    now: DateTime<Utc>,
) -> SyncState {
    let mut state = previous.cloned().unwrap_or_default();
    let (reason, message) = if phase == SyncPhase::Deleted {
        ("Deleted", "Remote object deleted")
    } else {
        ("Deleting", "Remote object is being deleted")
    };
    state.conditions = ConditionBuilder::from_existing(std::mem::take(&mut state.conditions), generation)
        .at(now)
        .synced(false, reason, message)
        .clear_errors()
        .build();
    state.phase = phase;
    state.observed_generation = generation;
    state.next_attempt_time = None;
    state
}

/// Check if the spec has changed since the last observed generation
pub fn spec_changed(generation: Option<i64>, status: Option<&SyncState>) -> bool {
    let observed = status.and_then(|s| s.observed_generation);
    match (generation, observed) {
        (Some(current), Some(observed)) => current != observed,
        _ => true,
    }
}

/// Why a wake-up of a failed resource does not start a new pass
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum RetryHold {
    /// The next attempt is due after this long
    For(Duration),
    /// Only a new generation starts a pass
    UntilSpecChange,
}

impl RetryHold {
    pub fn action(&self) -> Action {
        match self {
            RetryHold::For(remaining) => Action::requeue(*remaining),
            RetryHold::UntilSpecChange => Action::await_change(),
        }
    }
}

/// Hold for a wake-up that arrives before a failed pass is due again
///
/// Every status write wakes the controller. A failed pass is repeated once
/// its recorded next attempt time has passed, or as soon as the generation
/// moves past the one that failed.
pub fn retry_hold(
    generation: Option<i64>,
    observed_generation: Option<i64>,
    failed: bool,
    next_attempt_time: Option<&str>,
    now: DateTime<Utc>,
) -> Option<RetryHold> {
    if !failed {
        return None;
    }
    match (generation, observed_generation) {
        (Some(current), Some(observed)) if current == observed => {}
        _ => return None,
    }
    let Some(next) = next_attempt_time else {
        return Some(RetryHold::UntilSpecChange);
    };
    let due = DateTime::parse_from_rfc3339(next).ok()?.with_timezone(&Utc);
    let remaining = due.signed_duration_since(now).to_std().ok()?;
    (!remaining.is_zero()).then_some(RetryHold::For(remaining))
}

/// [`retry_hold`] over the shared sync bookkeeping
pub fn sync_retry_hold(
    generation: Option<i64>,
    status: Option<&SyncState>,
    now: DateTime<Utc>,
) -> Option<RetryHold> {
    let state = status?;
    retry_hold(
        generation,
        state.observed_generation,
        state.last_error.is_some(),
        state.next_attempt_time.as_deref(),
        now,
    )
}

/// Writes status subresources
///
/// Uses server-side apply so that fields dropped from a status (a cleared
/// error, a finished dependency wait) are removed from the object.
#[derive(Clone)]
pub struct StatusWriter {
    client: Client,
}

impl StatusWriter {
    pub fn new(client: Client) -> Self {
        Self { client }
    }

    pub async fn write<K, S>(&self, obj: &K, status: &S) -> Result<()>
    where
        K: Resource<Scope = NamespaceResourceScope, DynamicType = ()>
            + Clone
            + DeserializeOwned
            + Debug,
        S: Serialize,
    {
        let ns = obj.namespace().ok_or(Error::MissingObjectKey("namespace"))?;
        let api: Api<K> = Api::namespaced(self.client.clone(), &ns);
        let patch = serde_json::json!({
            "apiVersion": K::api_version(&()),
            "kind": K::kind(&()),
            "status": status,
        });
        api.patch_status(
            &obj.name_any(),
            &PatchParams::apply(FIELD_MANAGER).force(),
            &Patch::Apply(&patch),
        )
        .await?;
        Ok(())
    }
}
