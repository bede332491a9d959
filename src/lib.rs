pub mod aws;
pub mod config;
pub mod controller;
pub mod crd;
pub mod health;
pub mod poll;

pub use aws::{AutoscalingApi, AwsError, InMemoryAutoscaling, SdkAutoscalingClient};
pub use config::{Backend, OperatorArgs, OperatorConfig};
pub use controller::{
    AwsReconciler, BackoffConfig, Context, Error, FINALIZER, IdentityRegistry, Result,
    adoption_error_policy, policy_error_policy, reconcile_adopted, reconcile_policy,
    reconcile_target, target_error_policy,
};
pub use crd::{AdoptedResource, ScalableTarget, ScalingPolicy, SyncPhase};
pub use health::{HealthState, Metrics};

use std::sync::Arc;

use futures::StreamExt;
use kube::api::ListParams;
use kube::runtime::controller::Config as ControllerConfig;
use kube::runtime::reflector::{ObjectRef, Store};
use kube::runtime::watcher::Config as WatcherConfig;
use kube::runtime::Controller;
use kube::{Api, Client, Resource};
use serde::de::DeserializeOwned;

type ControllerResult<K, E> = std::result::Result<
    (ObjectRef<K>, kube::runtime::controller::Action),
    kube::runtime::controller::Error<Error, E>,
>;

const PHASES: [SyncPhase; 5] = [
    SyncPhase::Pending,
    SyncPhase::Syncing,
    SyncPhase::Synced,
    SyncPhase::Deleting,
    SyncPhase::Deleted,
];

/// Helper to create a namespaced or cluster-wide API based on scope.
fn scoped_api<T>(client: Client, namespace: Option<&str>) -> Api<T>
where
    T: Resource<Scope = k8s_openapi::NamespaceResourceScope>,
    <T as Resource>::DynamicType: Default,
    T: Clone + DeserializeOwned + std::fmt::Debug,
{
    match namespace {
        Some(ns) => Api::namespaced(client, ns),
        None => Api::all(client),
    }
}

fn controller_config(ctx: &Context) -> ControllerConfig {
    ControllerConfig::default().concurrency(ctx.config.concurrency)
}

/// List every resource of a kind, retrying with backoff until the API server answers
async fn list_all<K>(api: &Api<K>, kind: &str, backoff: &BackoffConfig) -> Vec<K>
where
    K: Clone + DeserializeOwned + std::fmt::Debug,
{
    let mut attempt = 0u32;
    loop {
        match api.list(&ListParams::default()).await {
            Ok(list) => return list.items,
            Err(e) => {
                let delay = backoff.delay_for_attempt(attempt);
                tracing::warn!("Failed to list {} resources: {}, retrying in {:?}", kind, e, delay);
                tokio::time::sleep(delay).await;
                attempt = attempt.saturating_add(1);
            }
        }
    }
}

/// Refresh the resources-by-phase gauges from a controller's cache
fn record_phases<K>(ctx: &Context, kind: &str, store: &Store<K>, phase_of: fn(&K) -> SyncPhase)
where
    K: Resource + Clone + 'static,
    K::DynamicType: Eq + std::hash::Hash + Clone,
{
    let Some(health) = &ctx.health_state else {
        return;
    };
    let objects = store.state();
    for phase in PHASES {
        let count = objects.iter().filter(|o| phase_of(o.as_ref()) == phase).count();
        health
            .metrics
            .set_resources_by_phase(kind, &phase.to_string(), count as i64);
    }
}

/// Log a controller stream item; NotFound after deletion is expected and kept at debug
fn log_result<K, E>(kind: &str, result: ControllerResult<K, E>)
where
    K: Resource,
    E: std::error::Error,
{
    match result {
        Ok((obj, _action)) => {
            tracing::debug!("Reconciled {}: {}", kind, obj.name);
        }
        Err(e) => {
            let is_not_found = matches!(
                &e,
                kube::runtime::controller::Error::ReconcilerFailed(err, _) if err.is_not_found()
            );
            if is_not_found {
                tracing::debug!("{} no longer exists (likely deleted): {:?}", kind, e);
            } else {
                tracing::error!("{} reconciliation error: {:?}", kind, e);
            }
        }
    }
}

/// Run the ScalableTarget controller.
///
/// When `namespace` is `Some(ns)`, only watches resources in that namespace.
/// When `namespace` is `None`, watches resources cluster-wide.
pub async fn run_target_controller_scoped(ctx: Arc<Context>, namespace: Option<&str>) {
    let scope_msg = namespace.unwrap_or("cluster-wide");
    tracing::info!(
        "Starting controller for ScalableTarget resources (scope: {})",
        scope_msg
    );

    let targets: Api<ScalableTarget> = scoped_api(ctx.client.clone(), namespace);
    let watcher_config = WatcherConfig::default().any_semantic();

    // Synced resources keep their identities over resources that never synced
    let existing = list_all(&targets, "ScalableTarget", &ctx.config.backoff).await;
    let restored = controller::restore_target_claims(&ctx.identities, &existing);
    tracing::info!("Restored {} ScalableTarget identity claims", restored);

    let controller = Controller::new(targets, watcher_config).with_config(controller_config(&ctx));
    let store = controller.store();
    let metrics_ctx = ctx.clone();

    controller
        .run(reconcile_target, target_error_policy, ctx)
        .for_each(|result| {
            record_phases(&metrics_ctx, "ScalableTarget", &store, |t: &ScalableTarget| {
                t.status.as_ref().map(|s| s.sync.phase).unwrap_or_default()
            });
            log_result("ScalableTarget", result);
            futures::future::ready(())
        })
        .await;

    tracing::error!("ScalableTarget controller stream ended unexpectedly");
}

/// Run the ScalingPolicy controller.
///
/// Policies are also woken when a ScalableTarget with the same identity
/// changes, so a policy waiting on its target proceeds as soon as the target
/// is registered.
pub async fn run_policy_controller_scoped(ctx: Arc<Context>, namespace: Option<&str>) {
    let scope_msg = namespace.unwrap_or("cluster-wide");
    tracing::info!(
        "Starting controller for ScalingPolicy resources (scope: {})",
        scope_msg
    );

    let policies: Api<ScalingPolicy> = scoped_api(ctx.client.clone(), namespace);
    let targets: Api<ScalableTarget> = scoped_api(ctx.client.clone(), namespace);
    let watcher_config = WatcherConfig::default().any_semantic();

    let existing = list_all(&policies, "ScalingPolicy", &ctx.config.backoff).await;
    let restored = controller::restore_policy_claims(&ctx.identities, &existing);
    tracing::info!("Restored {} ScalingPolicy identity claims", restored);

    let controller =
        Controller::new(policies, watcher_config.clone()).with_config(controller_config(&ctx));
    let store = controller.store();
    let lookup = store.clone();
    let metrics_ctx = ctx.clone();

    controller
        .watches(targets, watcher_config, move |target: ScalableTarget| {
            let key = controller::diff::target_key(&target.spec);
            lookup
                .state()
                .into_iter()
                .filter(|p| controller::diff::policy_key(&p.spec).target == key)
                .map(|p| ObjectRef::from_obj(p.as_ref()))
                .collect::<Vec<_>>()
        })
        .run(reconcile_policy, policy_error_policy, ctx)
        .for_each(|result| {
            record_phases(&metrics_ctx, "ScalingPolicy", &store, |p: &ScalingPolicy| {
                p.status.as_ref().map(|s| s.sync.phase).unwrap_or_default()
            });
            log_result("ScalingPolicy", result);
            futures::future::ready(())
        })
        .await;

    tracing::error!("ScalingPolicy controller stream ended unexpectedly");
}

/// Run the AdoptedResource controller.
pub async fn run_adoption_controller_scoped(ctx: Arc<Context>, namespace: Option<&str>) {
    let scope_msg = namespace.unwrap_or("cluster-wide");
    tracing::info!(
        "Starting controller for AdoptedResource resources (scope: {})",
        scope_msg
    );

    let adopted: Api<AdoptedResource> = scoped_api(ctx.client.clone(), namespace);
    let watcher_config = WatcherConfig::default().any_semantic();

    Controller::new(adopted, watcher_config)
        .with_config(controller_config(&ctx))
        .run(reconcile_adopted, adoption_error_policy, ctx)
        .for_each(|result| {
            log_result("AdoptedResource", result);
            futures::future::ready(())
        })
        .await;

    tracing::error!("AdoptedResource controller stream ended unexpectedly");
}
