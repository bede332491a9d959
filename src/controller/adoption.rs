//! Adoption of pre-existing remote objects
//!
//! An [`AdoptedResource`] names a remote scalable target or scaling policy by
//! identity only. The resolver describes it, expects exactly one match, and
//! synthesizes a spec from what the remote system reports. The managed custom
//! resource is then created with the adopted annotation so its own reconciler
//! never issues a create for it.

use std::collections::BTreeMap;
use std::str::FromStr;
use std::sync::Arc;

use chrono::{DateTime, Utc};
use kube::api::PostParams;
use kube::core::ObjectMeta;
use kube::runtime::controller::Action;
use kube::{Api, ResourceExt};
use tracing::{debug, info, instrument, warn};

use crate::aws::{PolicyFilter, PolicyKey, TargetFilter, TargetKey};
use crate::config::OperatorConfig;
use crate::controller::context::Context;
use crate::controller::diff::{policy_key, target_key};
use crate::controller::error::{Error, FailureAction, Result, requeue_after_error};
use crate::controller::remote::AwsReconciler;
use crate::controller::status::{
    ConditionBuilder, condition_types, next_attempt_time, retry_hold,
};
use crate::crd::{
    ADOPTED_ANNOTATION, AdoptedResource, AdoptedResourceSpec, AdoptedResourceStatus, GROUP,
    ScalableTarget, ScalableTargetSpec, ScalingPolicy, ScalingPolicySpec, is_adopted,
};

/// Keys read from `spec.aws.additionalKeys`
pub mod additional_keys {
    pub const SERVICE_NAMESPACE: &str = "serviceNamespace";
    pub const SCALABLE_DIMENSION: &str = "scalableDimension";
    pub const POLICY_NAME: &str = "policyName";
}

/// Managed kinds that can be adopted
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum AdoptedKind {
    ScalableTarget,
    ScalingPolicy,
}

impl FromStr for AdoptedKind {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "ScalableTarget" => Ok(AdoptedKind::ScalableTarget),
            "ScalingPolicy" => Ok(AdoptedKind::ScalingPolicy),
            other => Err(Error::ValidationError(format!(
                "kind {other:?} cannot be adopted"
            ))),
        }
    }
}

/// Identity of the remote object to adopt
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct AdoptionRequest {
    pub service_namespace: String,
    pub resource_id: String,
    pub scalable_dimension: String,
    pub policy_name: Option<String>,
}

impl AdoptionRequest {
    pub fn target(
        service_namespace: impl Into<String>,
        resource_id: impl Into<String>,
        scalable_dimension: impl Into<String>,
    ) -> Self {
        Self {
            service_namespace: service_namespace.into(),
            resource_id: resource_id.into(),
            scalable_dimension: scalable_dimension.into(),
            policy_name: None,
        }
    }

    pub fn policy(
        service_namespace: impl Into<String>,
        resource_id: impl Into<String>,
        scalable_dimension: impl Into<String>,
        policy_name: impl Into<String>,
    ) -> Self {
        Self {
            policy_name: Some(policy_name.into()),
            ..Self::target(service_namespace, resource_id, scalable_dimension)
        }
    }

    /// Read the kind and identity from an AdoptedResource spec
    pub fn from_adopted(spec: &AdoptedResourceSpec) -> Result<(AdoptedKind, Self)> {
        if spec.kubernetes.group != GROUP {
            return Err(Error::ValidationError(format!(
                "group {:?} is not managed by this operator",
                spec.kubernetes.group
            )));
        }
        let kind: AdoptedKind = spec.kubernetes.kind.parse()?;
        if spec.aws.name_or_id.is_empty() {
            return Err(Error::ValidationError("aws.nameOrID is required".to_string()));
        }

        let keys = &spec.aws.additional_keys;
        let service_namespace = required_key(keys, additional_keys::SERVICE_NAMESPACE)?;
        let scalable_dimension = required_key(keys, additional_keys::SCALABLE_DIMENSION)?;
        let request = match kind {
            AdoptedKind::ScalableTarget => {
                Self::target(service_namespace, &spec.aws.name_or_id, scalable_dimension)
            }
            AdoptedKind::ScalingPolicy => Self::policy(
                service_namespace,
                &spec.aws.name_or_id,
                scalable_dimension,
                required_key(keys, additional_keys::POLICY_NAME)?,
            ),
        };
        Ok((kind, request))
    }

    pub fn target_key(&self) -> TargetKey {
        TargetKey::new(
            &self.service_namespace,
            &self.resource_id,
            &self.scalable_dimension,
        )
    }
}

fn required_key<'a>(keys: &'a BTreeMap<String, String>, key: &str) -> Result<&'a str> {
    keys.get(key)
        .map(String::as_str)
        .filter(|v| !v.is_empty())
        .ok_or_else(|| Error::ValidationError(format!("aws.additionalKeys.{key} is required")))
}

fn exactly_one<T>(mut found: Vec<T>, what: &str) -> Result<T> {
    match found.len() {
        0 => Err(Error::NotFound(format!("{what} does not exist"))),
        1 => found
            .pop()
            .ok_or_else(|| Error::NotFound(format!("{what} does not exist"))),
        n => Err(Error::AdoptionAmbiguous(format!(
            "{n} remote objects match {what}"
        ))),
    }
}

/// Describe the target named by `request` and synthesize its spec
#[instrument(skip(aws), fields(resource_id = %request.resource_id))]
pub async fn resolve_target(
    aws: &AwsReconciler,
    request: &AdoptionRequest,
) -> Result<ScalableTargetSpec> {
    let key = request.target_key();
    let found = aws.describe_targets(&TargetFilter::for_key(&key)).await?;
    let state = exactly_one(found, &format!("scalable target {key}"))?;

    Ok(ScalableTargetSpec {
        service_namespace: state.key.service_namespace,
        resource_id: state.key.resource_id,
        scalable_dimension: state.key.scalable_dimension,
        min_capacity: Some(state.min_capacity),
        max_capacity: Some(state.max_capacity),
        role_arn: state.role_arn,
        suspended_state: state.suspended_state,
    })
}

/// Describe the policy named by `request` and synthesize its spec
#[instrument(skip(aws), fields(resource_id = %request.resource_id))]
pub async fn resolve_policy(
    aws: &AwsReconciler,
    request: &AdoptionRequest,
) -> Result<ScalingPolicySpec> {
    let policy_name = request
        .policy_name
        .clone()
        .ok_or_else(|| Error::ValidationError("policyName is required to adopt a scaling policy".to_string()))?;
    let key = PolicyKey::new(request.target_key(), policy_name);
    let found = aws.describe_policies(&PolicyFilter::for_key(&key)).await?;
    let state = exactly_one(found, &format!("scaling policy {key}"))?;

    Ok(ScalingPolicySpec {
        service_namespace: state.key.target.service_namespace,
        resource_id: state.key.target.resource_id,
        scalable_dimension: state.key.target.scalable_dimension,
        policy_name: state.key.policy_name,
        policy_type: state.policy_type,
        target_tracking_scaling_policy_configuration: state.target_tracking,
    })
}

/// Managed custom resource synthesized for an adoption
#[derive(Clone, Debug)]
pub enum AdoptedObject {
    Target(ScalableTarget),
    Policy(ScalingPolicy),
}

impl AdoptedObject {
    pub fn name(&self) -> String {
        match self {
            AdoptedObject::Target(t) => t.name_any(),
            AdoptedObject::Policy(p) => p.name_any(),
        }
    }

    /// Identity key of the remote object the resource names
    pub fn identity(&self) -> String {
        match self {
            AdoptedObject::Target(t) => target_key(&t.spec).to_string(),
            AdoptedObject::Policy(p) => policy_key(&p.spec).to_string(),
        }
    }

    pub fn is_adopted(&self) -> bool {
        match self {
            AdoptedObject::Target(t) => is_adopted(&t.metadata),
            AdoptedObject::Policy(p) => is_adopted(&p.metadata),
        }
    }
}

/// Accept a custom resource that already holds the adopted name only when it
/// is itself an adoption of the same remote object
pub fn check_existing(existing: &AdoptedObject, wanted: &AdoptedObject) -> Result<()> {
    if !existing.is_adopted() {
        return Err(Error::PermanentError(format!(
            "{} already exists and is not an adopted resource",
            existing.name()
        )));
    }
    let (have, want) = (existing.identity(), wanted.identity());
    if have != want {
        return Err(Error::PermanentError(format!(
            "{} already exists for {have}, not {want}",
            existing.name()
        )));
    }
    Ok(())
}

fn adopted_meta(name: &str, namespace: &str) -> ObjectMeta {
    ObjectMeta {
        name: Some(name.to_string()),
        namespace: Some(namespace.to_string()),
        annotations: Some(BTreeMap::from([(
            ADOPTED_ANNOTATION.to_string(),
            "true".to_string(),
        )])),
        ..Default::default()
    }
}

/// Resolve an AdoptedResource into the custom resource to create
///
/// `default_namespace` is used when the spec does not name one.
pub async fn adopt(
    spec: &AdoptedResourceSpec,
    default_namespace: &str,
    aws: &AwsReconciler,
) -> Result<AdoptedObject> {
    let (kind, request) = AdoptionRequest::from_adopted(spec)?;
    let name = &spec.kubernetes.metadata.name;
    if name.is_empty() {
        return Err(Error::ValidationError(
            "kubernetes.metadata.name is required".to_string(),
        ));
    }
    let namespace = spec
        .kubernetes
        .metadata
        .namespace
        .as_deref()
        .unwrap_or(default_namespace);

    Ok(match kind {
        AdoptedKind::ScalableTarget => {
            let mut target = ScalableTarget::new(name, resolve_target(aws, &request).await?);
            target.metadata = adopted_meta(name, namespace);
            AdoptedObject::Target(target)
        }
        AdoptedKind::ScalingPolicy => {
            let mut policy = ScalingPolicy::new(name, resolve_policy(aws, &request).await?);
            policy.metadata = adopted_meta(name, namespace);
            AdoptedObject::Policy(policy)
        }
    })
}

fn already_exists(err: &kube::Error) -> bool {
    matches!(err, kube::Error::Api(e) if e.code == 409)
}

async fn create_adopted(ctx: &Context, object: &AdoptedObject) -> Result<()> {
    let pp = PostParams::default();
    let existing = match object {
        AdoptedObject::Target(target) => {
            let ns = target.namespace().ok_or(Error::MissingObjectKey("namespace"))?;
            let api: Api<ScalableTarget> = Api::namespaced(ctx.client.clone(), &ns);
            match api.create(&pp, target).await {
                Ok(_) => return Ok(()),
                Err(e) if already_exists(&e) => AdoptedObject::Target(api.get(&target.name_any()).await?),
                Err(e) => return Err(e.into()),
            }
        }
        AdoptedObject::Policy(policy) => {
            let ns = policy.namespace().ok_or(Error::MissingObjectKey("namespace"))?;
            let api: Api<ScalingPolicy> = Api::namespaced(ctx.client.clone(), &ns);
            match api.create(&pp, policy).await {
                Ok(_) => return Ok(()),
                Err(e) if already_exists(&e) => AdoptedObject::Policy(api.get(&policy.name_any()).await?),
                Err(e) => return Err(e.into()),
            }
        }
    };
    check_existing(&existing, object)?;
    info!("{} already adopts the same remote object, leaving it in place", object.name());
    Ok(())
}

/// Status after a successful adoption
pub fn adoption_success(adopted: &AdoptedResource, bound_to: &str, now: DateTime<Utc>) -> AdoptedResourceStatus {
    let existing = adopted.status.as_ref().map(|s| s.conditions.clone()).unwrap_or_default();
    AdoptedResourceStatus {
        conditions: ConditionBuilder::from_existing(existing, adopted.metadata.generation)
            .at(now)
            .adopted(&format!("Remote object bound to {bound_to}"))
            .clear_errors()
            .build(),
        observed_generation: adopted.metadata.generation,
        retry_count: Some(0),
        last_error: None,
        next_attempt_time: None,
    }
}

/// Status and reaction for a failed adoption attempt
pub fn adoption_failure(
    adopted: &AdoptedResource,
    error: &Error,
    config: &OperatorConfig,
    now: DateTime<Utc>,
) -> (AdoptedResourceStatus, FailureAction) {
    let action = error.failure_action();
    let previous = adopted.status.clone().unwrap_or_default();
    let retries = previous.retry_count.unwrap_or(0);
    let message = error.to_string();
    let builder = ConditionBuilder::from_existing(previous.conditions, adopted.metadata.generation).at(now);
    let conditions = if action.is_terminal() {
        builder.terminal(error.reason(), &message)
    } else {
        builder.recoverable(error.reason(), &message)
    };
    let status = AdoptedResourceStatus {
        conditions: conditions.build(),
        observed_generation: adopted.metadata.generation,
        retry_count: Some(retries.saturating_add(1)),
        last_error: Some(message),
        next_attempt_time: next_attempt_time(action.retry_after(error, retries, &config.backoff), now),
    };
    (status, action)
}

/// Reconcile an AdoptedResource
#[instrument(skip(adopted, ctx), fields(name = %adopted.name_any(), namespace = adopted.namespace().unwrap_or_default()))]
pub async fn reconcile_adopted(adopted: Arc<AdoptedResource>, ctx: Arc<Context>) -> Result<Action> {
    let ns = adopted.namespace().ok_or(Error::MissingObjectKey("namespace"))?;
    let status = adopted.status.clone().unwrap_or_default();

    let already_adopted = status
        .conditions
        .iter()
        .any(|c| c.type_ == condition_types::ADOPTED && c.status == "True");
    if already_adopted {
        return Ok(Action::await_change());
    }

    if let Some(hold) = retry_hold(
        adopted.metadata.generation,
        status.observed_generation,
        status.last_error.is_some(),
        status.next_attempt_time.as_deref(),
        Utc::now(),
    ) {
        debug!(?hold, "Last adoption attempt not due for retry");
        return Ok(hold.action());
    }

    let result = async {
        let object = adopt(&adopted.spec, &ns, &ctx.aws).await?;
        create_adopted(&ctx, &object).await?;
        Ok::<_, Error>(object)
    }
    .await;

    match result {
        Ok(object) => {
            info!("Adopted remote object as {}", object.name());
            let status = adoption_success(&adopted, &object.name(), Utc::now());
            ctx.status.write(adopted.as_ref(), &status).await?;
            Ok(Action::await_change())
        }
        Err(e) => {
            let (status, action) = adoption_failure(&adopted, &e, &ctx.config, Utc::now());
            if let Err(write_err) = ctx.status.write(adopted.as_ref(), &status).await {
                warn!("Failed to record adoption error: {}", write_err);
            }
            action.into_result(e, &ctx.config.backoff)
        }
    }
}

/// Error policy for the AdoptedResource controller
pub fn adoption_error_policy(adopted: Arc<AdoptedResource>, error: &Error, ctx: Arc<Context>) -> Action {
    let retry_count = adopted
        .status
        .as_ref()
        .and_then(|s| s.retry_count)
        .unwrap_or(0);
    requeue_after_error(&adopted.name_any(), retry_count, error, &ctx.config.backoff)
}
