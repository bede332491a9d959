use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use clap::Parser;
use kube::Client;
use kube_leader_election::{LeaseLock, LeaseLockParams};
use tokio::signal;
use tracing::{error, info, warn};

use autoscaling_operator::health::{HealthState, run_health_server};
use autoscaling_operator::{
    AutoscalingApi, Backend, Context, InMemoryAutoscaling, OperatorArgs, OperatorConfig,
    SdkAutoscalingClient, run_adoption_controller_scoped, run_policy_controller_scoped,
    run_target_controller_scoped,
};

/// Lease configuration
const LEASE_NAME: &str = "autoscaling-operator-leader";
const LEASE_TTL_SECS: u64 = 15;
const LEASE_RENEW_INTERVAL_SECS: u64 = 5;

/// Grace period for in-flight reconciliations to complete during shutdown
const SHUTDOWN_GRACE_PERIOD_SECS: u64 = 5;

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    // Install the TLS crypto provider before any TLS operations
    if rustls::crypto::aws_lc_rs::default_provider()
        .install_default()
        .is_err()
        && rustls::crypto::CryptoProvider::get_default().is_none()
    {
        return Err("Failed to install rustls crypto provider and no provider is available".into());
    }

    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::from_default_env()
                .add_directive("autoscaling_operator=info".parse()?)
                .add_directive("kube=info".parse()?)
                .add_directive("kube_leader_election=info".parse()?),
        )
        .init();

    let args = OperatorArgs::parse();
    let config = OperatorConfig::from(&args);
    info!(backend = ?args.backend, namespace = ?config.namespace, "Starting autoscaling-operator");

    let client = Client::try_default().await?;
    info!("Connected to Kubernetes cluster");

    let api: Arc<dyn AutoscalingApi> = match args.backend {
        Backend::Aws => Arc::new(
            SdkAutoscalingClient::new(
                args.aws_region.clone(),
                args.aws_endpoint_url.clone(),
                args.aws_account_id.clone(),
            )
            .await,
        ),
        Backend::Memory => {
            warn!("Using the in-memory backend; remote state is lost on restart");
            Arc::new(InMemoryAutoscaling::new())
        }
    };

    let pod_name = args.pod_name.clone().unwrap_or_else(|| {
        warn!("POD_NAME not set, using hostname");
        hostname::get()
            .map(|h| h.to_string_lossy().to_string())
            .unwrap_or_else(|_| "unknown".to_string())
    });
    let lease_namespace = args.pod_namespace.clone();

    info!(
        holder_id = %pod_name,
        namespace = %lease_namespace,
        lease_name = LEASE_NAME,
        "Initializing leader election"
    );

    let health_state = Arc::new(HealthState::new());
    let is_leader = Arc::new(AtomicBool::new(false));

    // Health checks should answer even as non-leader
    let health_handle = {
        let health_state = health_state.clone();
        let addr = args.health_addr;
        tokio::spawn(async move {
            if let Err(e) = run_health_server(health_state, addr).await {
                error!("Health server error: {}", e);
            }
        })
    };

    let lease_params = || LeaseLockParams {
        holder_id: pod_name.clone(),
        lease_name: LEASE_NAME.to_string(),
        lease_ttl: Duration::from_secs(LEASE_TTL_SECS),
    };
    let lease_lock = LeaseLock::new(client.clone(), &lease_namespace, lease_params());

    info!("Waiting to acquire leadership...");
    loop {
        match lease_lock.try_acquire_or_renew().await {
            Ok(result) if result.acquired_lease => {
                info!("Acquired leadership");
                is_leader.store(true, Ordering::SeqCst);
                break;
            }
            Ok(_) => info!("Another instance is leader, waiting..."),
            Err(e) => warn!("Failed to acquire lease: {}, retrying...", e),
        }
        tokio::time::sleep(Duration::from_secs(LEASE_RENEW_INTERVAL_SECS)).await;
    }

    let lease_renewal_handle = {
        let is_leader = is_leader.clone();
        let lease_lock = LeaseLock::new(client.clone(), &lease_namespace, lease_params());
        tokio::spawn(async move {
            loop {
                tokio::time::sleep(Duration::from_secs(LEASE_RENEW_INTERVAL_SECS)).await;
                match lease_lock.try_acquire_or_renew().await {
                    Ok(result) if result.acquired_lease => {}
                    Ok(_) => {
                        error!("Lost leadership! Shutting down...");
                        is_leader.store(false, Ordering::SeqCst);
                        // Exit so Kubernetes restarts us and we re-enter election
                        std::process::exit(1);
                    }
                    Err(e) => {
                        error!("Failed to renew lease: {}. Shutting down...", e);
                        is_leader.store(false, Ordering::SeqCst);
                        std::process::exit(1);
                    }
                }
            }
        })
    };

    // One context for every controller so identity claims are shared
    let ctx = Arc::new(Context::new(client.clone(), api, config.clone()).with_health(health_state.clone()));
    health_state.set_ready(true).await;

    let target_handle = {
        let ctx = ctx.clone();
        let namespace = config.namespace.clone();
        tokio::spawn(async move { run_target_controller_scoped(ctx, namespace.as_deref()).await })
    };
    let policy_handle = {
        let ctx = ctx.clone();
        let namespace = config.namespace.clone();
        tokio::spawn(async move { run_policy_controller_scoped(ctx, namespace.as_deref()).await })
    };
    let adoption_handle = {
        let ctx = ctx.clone();
        let namespace = config.namespace.clone();
        tokio::spawn(async move { run_adoption_controller_scoped(ctx, namespace.as_deref()).await })
    };

    tokio::select! {
        result = target_handle => {
            if let Err(e) = result {
                error!("ScalableTarget controller task panicked: {}", e);
            }
        }
        result = policy_handle => {
            if let Err(e) = result {
                error!("ScalingPolicy controller task panicked: {}", e);
            }
        }
        result = adoption_handle => {
            if let Err(e) = result {
                error!("AdoptedResource controller task panicked: {}", e);
            }
        }
        result = health_handle => {
            if let Err(e) = result {
                error!("Health server task panicked: {}", e);
            }
        }
        // Lease renewal only exits via process::exit() or panic
        Err(e) = lease_renewal_handle => {
            error!("Lease renewal task panicked: {}", e);
        }
        _ = shutdown_signal() => {
            info!("Received shutdown signal, initiating graceful shutdown...");
            health_state.set_ready(false).await;
            info!(
                "Waiting {}s for in-flight reconciliations to complete...",
                SHUTDOWN_GRACE_PERIOD_SECS
            );
            tokio::time::sleep(Duration::from_secs(SHUTDOWN_GRACE_PERIOD_SECS)).await;
        }
    }

    info!("Operator stopped");
    Ok(())
}

/// Wait for SIGTERM or SIGINT
async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = signal::ctrl_c().await {
            error!("Failed to listen for Ctrl+C: {}", e);
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match signal::unix::signal(signal::unix::SignalKind::terminate()) {
            Ok(mut sigterm) => {
                sigterm.recv().await;
            }
            Err(e) => {
                error!("Failed to install SIGTERM handler: {}", e);
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {},
        _ = terminate => {},
    }
}
