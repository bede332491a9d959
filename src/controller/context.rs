use std::sync::Arc;

use kube::Client;

use crate::aws::AutoscalingApi;
use crate::config::OperatorConfig;
use crate::controller::identity::IdentityRegistry;
use crate::controller::remote::AwsReconciler;
use crate::controller::status::StatusWriter;
use crate::health::HealthState;

/// Shared context for the controllers
#[derive(Clone)]
pub struct Context {
    /// Kubernetes client
    pub client: Client,
    /// Remote control plane access
    pub aws: AwsReconciler,
    pub config: OperatorConfig,
    /// Identity claims, shared by every controller in the process
    pub identities: Arc<IdentityRegistry>,
    pub status: StatusWriter,
    /// Health state for metrics
    pub health_state: Option<Arc<HealthState>>,
}

impl Context {
    pub fn new(client: Client, api: Arc<dyn AutoscalingApi>, config: OperatorConfig) -> Self {
        Self {
            status: StatusWriter::new(client.clone()),
            client,
            aws: AwsReconciler::new(api),
            config,
            identities: Arc::new(IdentityRegistry::new()),
            health_state: None,
        }
    }

    /// Attach health state; remote calls and reconciles are then recorded as metrics
    pub fn with_health(mut self, health_state: Arc<HealthState>) -> Self {
        self.aws = self.aws.with_health(health_state.clone());
        self.health_state = Some(health_state);
        self
    }

    pub(crate) fn record_reconcile(&self, kind: &str, namespace: &str, name: &str, secs: f64) {
        if let Some(health) = &self.health_state {
            health.metrics.record_reconcile(kind, namespace, name, secs);
            health.touch_reconcile(chrono::Utc::now().timestamp().max(0) as u64);
        }
    }

    pub(crate) fn record_error(&self, kind: &str, namespace: &str, name: &str) {
        if let Some(health) = &self.health_state {
            health.metrics.record_error(kind, namespace, name);
        }
    }
}
