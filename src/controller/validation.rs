//! Local validation of ScalableTarget and ScalingPolicy specs
//!
//! Anything rejected here never reaches the remote control plane and is
//! surfaced as a terminal condition until the spec changes.

use crate::controller::error::{Error, Result};
use crate::crd::{PolicyType, ScalableTargetSpec, ScalingPolicySpec};

/// Service namespaces accepted by Application Auto Scaling
pub const SERVICE_NAMESPACES: &[&str] = &[
    "appstream",
    "cassandra",
    "comprehend",
    "custom-resource",
    "dynamodb",
    "ec2",
    "ecs",
    "elasticache",
    "elasticmapreduce",
    "kafka",
    "lambda",
    "neptune",
    "rds",
    "sagemaker",
    "workspaces",
];

/// Maximum length of a resource ID or policy name
pub const MAX_IDENTIFIER_LEN: usize = 1600;
pub const MAX_POLICY_NAME_LEN: usize = 256;

/// Validate a ScalableTarget spec
pub fn validate_target_spec(spec: &ScalableTargetSpec) -> Result<()> {
    validate_identity(
        &spec.service_namespace,
        &spec.resource_id,
        &spec.scalable_dimension,
    )?;
    validate_capacity(spec.min_capacity, spec.max_capacity)?;

    if let Some(role) = &spec.role_arn
        && !role.starts_with("arn:")
    {
        return Err(Error::ValidationError(format!(
            "roleARN must be an ARN: {}",
            role
        )));
    }
    Ok(())
}

/// Validate a ScalingPolicy spec
pub fn validate_policy_spec(spec: &ScalingPolicySpec) -> Result<()> {
    validate_identity(
        &spec.service_namespace,
        &spec.resource_id,
        &spec.scalable_dimension,
    )?;
    validate_policy_name(&spec.policy_name)?;

    if spec.policy_type != PolicyType::TargetTrackingScaling {
        return Err(Error::ValidationError(format!(
            "policy type {} is not supported, use TargetTrackingScaling",
            spec.policy_type
        )));
    }

    let Some(config) = &spec.target_tracking_scaling_policy_configuration else {
        return Err(Error::ValidationError(
            "targetTrackingScalingPolicyConfiguration is required for TargetTrackingScaling"
                .to_string(),
        ));
    };

    if !config.target_value.is_finite() {
        return Err(Error::ValidationError(format!(
            "targetValue must be finite: {}",
            config.target_value
        )));
    }

    for (field, value) in [
        ("scaleInCooldown", config.scale_in_cooldown),
        ("scaleOutCooldown", config.scale_out_cooldown),
    ] {
        if let Some(v) = value
            && v < 0
        {
            return Err(Error::ValidationError(format!(
                "{} must not be negative: {}",
                field, v
            )));
        }
    }

    match &config.predefined_metric_specification {
        Some(metric) if metric.predefined_metric_type.trim().is_empty() => Err(
            Error::ValidationError("predefinedMetricType must not be empty".to_string()),
        ),
        Some(_) => Ok(()),
        None => Err(Error::ValidationError(
            "predefinedMetricSpecification is required".to_string(),
        )),
    }
}

fn validate_identity(namespace: &str, resource_id: &str, dimension: &str) -> Result<()> {
    if !SERVICE_NAMESPACES.contains(&namespace) {
        return Err(Error::ValidationError(format!(
            "unknown service namespace: {:?}",
            namespace
        )));
    }

    if resource_id.trim().is_empty() {
        return Err(Error::ValidationError(
            "resourceID must not be empty".to_string(),
        ));
    }
    if resource_id.len() > MAX_IDENTIFIER_LEN {
        return Err(Error::ValidationError(format!(
            "resourceID exceeds {} characters",
            MAX_IDENTIFIER_LEN
        )));
    }

    // e.g. "sagemaker:variant:DesiredInstanceCount"
    let prefix_ok = dimension
        .strip_prefix(namespace)
        .and_then(|rest| rest.strip_prefix(':'))
        .is_some_and(|rest| !rest.is_empty());
    if !prefix_ok {
        return Err(Error::ValidationError(format!(
            "scalableDimension {:?} does not belong to service namespace {:?}",
            dimension, namespace
        )));
    }
    Ok(())
}

fn validate_capacity(min: Option<i32>, max: Option<i32>) -> Result<()> {
    if let Some(min) = min
        && min < 0
    {
        return Err(Error::ValidationError(format!(
            "minCapacity must not be negative: {}",
            min
        )));
    }
    if let Some(max) = max
        && max < 0
    {
        return Err(Error::ValidationError(format!(
            "maxCapacity must not be negative: {}",
            max
        )));
    }
    if let (Some(min), Some(max)) = (min, max)
        && min > max
    {
        return Err(Error::ValidationError(format!(
            "minCapacity {} exceeds maxCapacity {}",
            min, max
        )));
    }
    Ok(())
}

fn validate_policy_name(name: &str) -> Result<()> {
    if name.is_empty() || name.len() > MAX_POLICY_NAME_LEN {
        return Err(Error::ValidationError(format!(
            "policyName must be 1 to {} characters",
            MAX_POLICY_NAME_LEN
        )));
    }
    // The remote API uses ':' as a separator in policy ARNs
    if name.chars().any(|c| c.is_control() || c == ':') {
        return Err(Error::ValidationError(format!(
            "policyName contains invalid characters: {:?}",
            name
        )));
    }
    Ok(())
}
