//! AWS SDK backed [`AutoscalingApi`]

use std::fmt::Debug;

use async_trait::async_trait;
use aws_config::{BehaviorVersion, Region};
use aws_sdk_applicationautoscaling::Client;
use aws_sdk_applicationautoscaling::error::{DisplayErrorContext, ProvideErrorMetadata, SdkError};
use aws_sdk_applicationautoscaling::primitives::DateTime as SdkDateTime;
use aws_sdk_applicationautoscaling::types as sdk;
use chrono::{DateTime, Utc};
use tracing::{debug, instrument};

use super::{
    AutoscalingApi, AwsError, AwsErrorKind, PolicyFilter, PolicyKey, PutPolicyInput,
    PutPolicyOutput, RegisterTargetInput, RegisterTargetOutput, RemotePolicyState,
    RemoteTargetState, TargetFilter, TargetKey,
};
use crate::crd::{
    Alarm, PolicyType, PredefinedMetricSpecification, SuspendedState,
    TargetTrackingScalingPolicyConfiguration,
};

/// Application Auto Scaling client built from the default credential chain
#[derive(Clone)]
pub struct SdkAutoscalingClient {
    client: Client,
    region: Option<String>,
    account_id: Option<String>,
}

impl SdkAutoscalingClient {
    /// Load SDK configuration from the environment
    ///
    /// `endpoint_url` overrides the service endpoint, for local emulators.
    #[instrument(skip_all, fields(region = ?region))]
    pub async fn new(
        region: Option<String>,
        endpoint_url: Option<String>,
        account_id: Option<String>,
    ) -> Self {
        let mut loader = aws_config::defaults(BehaviorVersion::latest());
        if let Some(region) = &region {
            loader = loader.region(Region::new(region.clone()));
        }
        if let Some(endpoint) = endpoint_url {
            loader = loader.endpoint_url(endpoint);
        }
        let config = loader.load().await;
        let region = config.region().map(|r| r.to_string()).or(region);
        debug!(region = ?region, "Application Auto Scaling client configured");

        Self {
            client: Client::new(&config),
            region,
            account_id,
        }
    }
}

fn map_sdk_error<E, R>(operation: &'static str, err: SdkError<E, R>) -> AwsError
where
    E: ProvideErrorMetadata + std::error::Error + Send + Sync + 'static,
    R: Debug,
{
    match &err {
        SdkError::TimeoutError(_) | SdkError::DispatchFailure(_) | SdkError::ResponseError(_) => {
            AwsError::new(
                AwsErrorKind::Transient,
                operation,
                "DispatchFailure",
                DisplayErrorContext(&err).to_string(),
            )
        }
        _ => {
            let code = err.code().unwrap_or("Unknown").to_string();
            let message = err
                .message()
                .map(str::to_string)
                .unwrap_or_else(|| DisplayErrorContext(&err).to_string());
            AwsError::from_code(operation, &code, message)
        }
    }
}

fn to_chrono(value: &SdkDateTime) -> Option<DateTime<Utc>> {
    DateTime::from_timestamp(value.secs(), value.subsec_nanos())
}

fn to_sdk_suspended(state: &SuspendedState) -> sdk::SuspendedState {
    sdk::SuspendedState::builder()
        .set_dynamic_scaling_in_suspended(state.dynamic_scaling_in_suspended)
        .set_dynamic_scaling_out_suspended(state.dynamic_scaling_out_suspended)
        .set_scheduled_scaling_suspended(state.scheduled_scaling_suspended)
        .build()
}

fn from_sdk_suspended(state: &sdk::SuspendedState) -> SuspendedState {
    SuspendedState {
        dynamic_scaling_in_suspended: state.dynamic_scaling_in_suspended(),
        dynamic_scaling_out_suspended: state.dynamic_scaling_out_suspended(),
        scheduled_scaling_suspended: state.scheduled_scaling_suspended(),
    }
}

fn to_sdk_target_tracking(
    operation: &'static str,
    config: &TargetTrackingScalingPolicyConfiguration,
) -> Result<sdk::TargetTrackingScalingPolicyConfiguration, AwsError> {
    let predefined = config
        .predefined_metric_specification
        .as_ref()
        .map(|spec| {
            sdk::PredefinedMetricSpecification::builder()
                .predefined_metric_type(sdk::MetricType::from(spec.predefined_metric_type.as_str()))
                .set_resource_label(spec.resource_label.clone())
                .build()
        })
        .transpose()
        .map_err(|e| AwsError::validation(operation, e.to_string()))?;

    sdk::TargetTrackingScalingPolicyConfiguration::builder()
        .target_value(config.target_value)
        .set_scale_in_cooldown(config.scale_in_cooldown)
        .set_scale_out_cooldown(config.scale_out_cooldown)
        .set_disable_scale_in(config.disable_scale_in)
        .set_predefined_metric_specification(predefined)
        .build()
        .map_err(|e| AwsError::validation(operation, e.to_string()))
}

fn from_sdk_target_tracking(
    config: &sdk::TargetTrackingScalingPolicyConfiguration,
) -> TargetTrackingScalingPolicyConfiguration {
    TargetTrackingScalingPolicyConfiguration {
        target_value: config.target_value(),
        scale_in_cooldown: config.scale_in_cooldown(),
        scale_out_cooldown: config.scale_out_cooldown(),
        disable_scale_in: config.disable_scale_in(),
        predefined_metric_specification: config.predefined_metric_specification().map(|spec| {
            PredefinedMetricSpecification {
                predefined_metric_type: spec.predefined_metric_type().as_str().to_string(),
                resource_label: spec.resource_label().map(str::to_string),
            }
        }),
    }
}

fn from_sdk_target(target: &sdk::ScalableTarget, observed_at: DateTime<Utc>) -> RemoteTargetState {
    RemoteTargetState {
        key: TargetKey::new(
            target.service_namespace().as_str(),
            target.resource_id(),
            target.scalable_dimension().as_str(),
        ),
        min_capacity: target.min_capacity(),
        max_capacity: target.max_capacity(),
        role_arn: Some(target.role_arn().to_string()).filter(|r| !r.is_empty()),
        suspended_state: target.suspended_state().map(from_sdk_suspended),
        arn: target.scalable_target_arn().map(str::to_string),
        creation_time: to_chrono(target.creation_time()),
        last_modified_time: None,
        observed_at,
    }
}

fn from_sdk_policy(
    policy: &sdk::ScalingPolicy,
    observed_at: DateTime<Utc>,
) -> Result<RemotePolicyState, AwsError> {
    let policy_type = policy
        .policy_type()
        .as_str()
        .parse::<PolicyType>()
        .map_err(|e| AwsError::new(AwsErrorKind::Other, "DescribeScalingPolicies", "UnknownPolicyType", e))?;

    Ok(RemotePolicyState {
        key: PolicyKey::new(
            TargetKey::new(
                policy.service_namespace().as_str(),
                policy.resource_id(),
                policy.scalable_dimension().as_str(),
            ),
            policy.policy_name(),
        ),
        policy_type,
        target_tracking: policy
            .target_tracking_scaling_policy_configuration()
            .map(from_sdk_target_tracking),
        arn: policy.policy_arn().to_string(),
        alarms: policy.alarms().iter().map(from_sdk_alarm).collect(),
        creation_time: to_chrono(policy.creation_time()),
        last_modified_time: None,
        observed_at,
    })
}

fn from_sdk_alarm(alarm: &sdk::Alarm) -> Alarm {
    Alarm {
        alarm_name: alarm.alarm_name().to_string(),
        alarm_arn: alarm.alarm_arn().to_string(),
    }
}

#[async_trait]
impl AutoscalingApi for SdkAutoscalingClient {
    #[instrument(skip(self), fields(namespace = %filter.service_namespace))]
    async fn describe_scalable_targets(
        &self,
        filter: &TargetFilter,
    ) -> Result<Vec<RemoteTargetState>, AwsError> {
        const OP: &str = "DescribeScalableTargets";
        let mut found = vec![];
        let mut next_token: Option<String> = None;
        loop {
            let output = self
                .client
                .describe_scalable_targets()
                .service_namespace(sdk::ServiceNamespace::from(filter.service_namespace.as_str()))
                .set_resource_ids(
                    Some(filter.resource_ids.clone()).filter(|ids| !ids.is_empty()),
                )
                .set_scalable_dimension(
                    filter
                        .scalable_dimension
                        .as_deref()
                        .map(sdk::ScalableDimension::from),
                )
                .set_next_token(next_token.take())
                .send()
                .await
                .map_err(|e| map_sdk_error(OP, e))?;

            let now = Utc::now();
            found.extend(
                output
                    .scalable_targets()
                    .iter()
                    .map(|t| from_sdk_target(t, now)),
            );
            match output.next_token() {
                Some(token) if !token.is_empty() => next_token = Some(token.to_string()),
                _ => break,
            }
        }
        Ok(found)
    }

    #[instrument(skip(self, input), fields(target = %input.key))]
    async fn register_scalable_target(
        &self,
        input: &RegisterTargetInput,
    ) -> Result<RegisterTargetOutput, AwsError> {
        const OP: &str = "RegisterScalableTarget";
        let output = self
            .client
            .register_scalable_target()
            .service_namespace(sdk::ServiceNamespace::from(input.key.service_namespace.as_str()))
            .resource_id(&input.key.resource_id)
            .scalable_dimension(sdk::ScalableDimension::from(
                input.key.scalable_dimension.as_str(),
            ))
            .set_min_capacity(input.min_capacity)
            .set_max_capacity(input.max_capacity)
            .set_role_arn(input.role_arn.clone())
            .set_suspended_state(input.suspended_state.as_ref().map(to_sdk_suspended))
            .send()
            .await
            .map_err(|e| map_sdk_error(OP, e))?;

        Ok(RegisterTargetOutput {
            arn: output.scalable_target_arn().map(str::to_string),
        })
    }

    #[instrument(skip(self), fields(target = %key))]
    async fn deregister_scalable_target(&self, key: &TargetKey) -> Result<(), AwsError> {
        self.client
            .deregister_scalable_target()
            .service_namespace(sdk::ServiceNamespace::from(key.service_namespace.as_str()))
            .resource_id(&key.resource_id)
            .scalable_dimension(sdk::ScalableDimension::from(key.scalable_dimension.as_str()))
            .send()
            .await
            .map_err(|e| map_sdk_error("DeregisterScalableTarget", e))?;
        Ok(())
    }

    #[instrument(skip(self), fields(namespace = %filter.service_namespace))]
    async fn describe_scaling_policies(
        &self,
        filter: &PolicyFilter,
    ) -> Result<Vec<RemotePolicyState>, AwsError> {
        const OP: &str = "DescribeScalingPolicies";
        let mut found = vec![];
        let mut next_token: Option<String> = None;
        loop {
            let output = self
                .client
                .describe_scaling_policies()
                .service_namespace(sdk::ServiceNamespace::from(filter.service_namespace.as_str()))
                .set_resource_id(filter.resource_id.clone())
                .set_scalable_dimension(
                    filter
                        .scalable_dimension
                        .as_deref()
                        .map(sdk::ScalableDimension::from),
                )
                .set_policy_names(
                    Some(filter.policy_names.clone()).filter(|names| !names.is_empty()),
                )
                .set_next_token(next_token.take())
                .send()
                .await
                .map_err(|e| map_sdk_error(OP, e))?;

            let now = Utc::now();
            for policy in output.scaling_policies() {
                found.push(from_sdk_policy(policy, now)?);
            }
            match output.next_token() {
                Some(token) if !token.is_empty() => next_token = Some(token.to_string()),
                _ => break,
            }
        }
        Ok(found)
    }

    #[instrument(skip(self, input), fields(policy = %input.key))]
    async fn put_scaling_policy(&self, input: &PutPolicyInput) -> Result<PutPolicyOutput, AwsError> {
        const OP: &str = "PutScalingPolicy";
        let target_tracking = input
            .target_tracking
            .as_ref()
            .map(|c| to_sdk_target_tracking(OP, c))
            .transpose()?;

        let output = self
            .client
            .put_scaling_policy()
            .policy_name(&input.key.policy_name)
            .service_namespace(sdk::ServiceNamespace::from(
                input.key.target.service_namespace.as_str(),
            ))
            .resource_id(&input.key.target.resource_id)
            .scalable_dimension(sdk::ScalableDimension::from(
                input.key.target.scalable_dimension.as_str(),
            ))
            .policy_type(sdk::PolicyType::from(input.policy_type.as_str()))
            .set_target_tracking_scaling_policy_configuration(target_tracking)
            .send()
            .await
            .map_err(|e| map_sdk_error(OP, e))?;

        Ok(PutPolicyOutput {
            arn: output.policy_arn().to_string(),
            alarms: output.alarms().iter().map(from_sdk_alarm).collect(),
        })
    }

    #[instrument(skip(self), fields(policy = %key))]
    async fn delete_scaling_policy(&self, key: &PolicyKey) -> Result<(), AwsError> {
        self.client
            .delete_scaling_policy()
            .policy_name(&key.policy_name)
            .service_namespace(sdk::ServiceNamespace::from(
                key.target.service_namespace.as_str(),
            ))
            .resource_id(&key.target.resource_id)
            .scalable_dimension(sdk::ScalableDimension::from(
                key.target.scalable_dimension.as_str(),
            ))
            .send()
            .await
            .map_err(|e| map_sdk_error("DeleteScalingPolicy", e))?;
        Ok(())
    }

    fn region(&self) -> Option<String> {
        self.region.clone()
    }

    fn account_id(&self) -> Option<String> {
        self.account_id.clone()
    }
}
