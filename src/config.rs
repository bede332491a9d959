//! Operator configuration
//!
//! Every flag can also be supplied through its environment variable, which is
//! how the operator Deployment configures it.

use std::net::SocketAddr;
use std::time::Duration;

use clap::{Parser, ValueEnum};

use crate::controller::BackoffConfig;

/// Which Application Auto Scaling control plane to talk to
#[derive(Clone, Copy, Debug, PartialEq, Eq, ValueEnum)]
pub enum Backend {
    /// The AWS API through the SDK default credential chain
    Aws,
    /// An in-process control plane, for local development
    Memory,
}

#[derive(Parser, Debug, Clone)]
#[command(name = "autoscaling-operator")]
#[command(about = "Kubernetes operator for Application Auto Scaling targets and policies", long_about = None)]
#[command(version)]
pub struct OperatorArgs {
    /// Namespace to watch (all namespaces when unset)
    #[arg(long, env = "WATCH_NAMESPACE")]
    pub namespace: Option<String>,

    /// Maximum concurrent reconciliations per resource kind
    #[arg(long, env = "RECONCILE_CONCURRENCY", default_value_t = 8)]
    pub concurrency: u16,

    /// AWS region (SDK default chain when unset)
    #[arg(long, env = "AWS_REGION")]
    pub aws_region: Option<String>,

    /// Override the Application Auto Scaling endpoint
    #[arg(long, env = "AWS_ENDPOINT_URL")]
    pub aws_endpoint_url: Option<String>,

    /// Account ID reported in resource status
    #[arg(long, env = "AWS_ACCOUNT_ID")]
    pub aws_account_id: Option<String>,

    /// Remote control plane implementation
    #[arg(long, env = "AUTOSCALING_BACKEND", value_enum, default_value_t = Backend::Aws)]
    pub backend: Backend,

    /// Address for the health and metrics server
    #[arg(long, env = "HEALTH_ADDR", default_value = "0.0.0.0:8080")]
    pub health_addr: SocketAddr,

    /// Seconds a policy may wait for its scalable target before failing terminally
    #[arg(long, env = "DEPENDENCY_WAIT_SECS", default_value_t = 600)]
    pub dependency_wait_secs: u64,

    /// Seconds between drift checks of synced resources
    #[arg(long, env = "RESYNC_SECS", default_value_t = 300)]
    pub resync_secs: u64,

    /// Leader election holder identity (hostname when unset)
    #[arg(long, env = "POD_NAME")]
    pub pod_name: Option<String>,

    /// Namespace holding the leader election lease
    #[arg(long, env = "POD_NAMESPACE", default_value = "default")]
    pub pod_namespace: String,
}

/// Runtime settings shared by every reconcile through the controller context
#[derive(Clone, Debug)]
pub struct OperatorConfig {
    pub namespace: Option<String>,
    pub concurrency: u16,
    pub dependency_wait: Duration,
    pub resync_interval: Duration,
    /// Requeue interval while a resource is Syncing
    pub syncing_requeue: Duration,
    pub backoff: BackoffConfig,
}

impl Default for OperatorConfig {
    fn default() -> Self {
        Self {
            namespace: None,
            concurrency: 8,
            dependency_wait: Duration::from_secs(600),
            resync_interval: Duration::from_secs(300),
            syncing_requeue: Duration::from_secs(5),
            backoff: BackoffConfig::default(),
        }
    }
}

impl From<&OperatorArgs> for OperatorConfig {
    fn from(args: &OperatorArgs) -> Self {
        Self {
            namespace: args.namespace.clone(),
            concurrency: args.concurrency.max(1),
            dependency_wait: Duration::from_secs(args.dependency_wait_secs),
            resync_interval: Duration::from_secs(args.resync_secs),
            ..Default::default()
        }
    }
}
