//! Unit tests for spec validation

use autoscaling_operator::controller::Error;
use autoscaling_operator::controller::validation::{
    MAX_POLICY_NAME_LEN, validate_policy_spec, validate_target_spec,
};
use autoscaling_operator::crd::PolicyType;

use crate::common::*;

fn assert_validation_error(result: Result<(), Error>, needle: &str) {
    match result {
        Err(Error::ValidationError(msg)) => {
            assert!(msg.contains(needle), "expected {needle:?} in {msg:?}")
        }
        other => panic!("expected validation error, got {other:?}"),
    }
}

mod target_validation_tests {
    use super::*;

    #[test]
    fn test_fixture_is_valid() {
        assert!(validate_target_spec(&target_spec()).is_ok());
    }

    #[test]
    fn test_unknown_service_namespace() {
        let mut spec = target_spec();
        spec.service_namespace = "sagemakr".to_string();
        assert_validation_error(validate_target_spec(&spec), "service namespace");
    }

    #[test]
    fn test_empty_resource_id() {
        let mut spec = target_spec();
        spec.resource_id = "  ".to_string();
        assert_validation_error(validate_target_spec(&spec), "resourceID");
    }

    #[test]
    fn test_dimension_must_match_namespace() {
        let mut spec = target_spec();
        spec.scalable_dimension = "dynamodb:table:ReadCapacityUnits".to_string();
        assert_validation_error(validate_target_spec(&spec), "scalableDimension");

        spec.scalable_dimension = "sagemaker:".to_string();
        assert_validation_error(validate_target_spec(&spec), "scalableDimension");
    }

    #[test]
    fn test_min_above_max() {
        let mut spec = target_spec();
        spec.min_capacity = Some(5);
        spec.max_capacity = Some(2);
        assert_validation_error(validate_target_spec(&spec), "exceeds");
    }

    #[test]
    fn test_negative_capacity() {
        let mut spec = target_spec();
        spec.min_capacity = Some(-1);
        assert_validation_error(validate_target_spec(&spec), "minCapacity");
    }

    #[test]
    fn test_equal_bounds_allowed() {
        let mut spec = target_spec();
        spec.min_capacity = Some(0);
        spec.max_capacity = Some(0);
        assert!(validate_target_spec(&spec).is_ok());
    }

    #[test]
    fn test_role_must_be_arn() {
        let mut spec = target_spec();
        spec.role_arn = Some("my-role".to_string());
        assert_validation_error(validate_target_spec(&spec), "roleARN");
    }
}

mod policy_validation_tests {
    use super::*;

    #[test]
    fn test_fixture_is_valid() {
        assert!(validate_policy_spec(&policy_spec()).is_ok());
    }

    #[test]
    fn test_step_scaling_unsupported() {
        let mut spec = policy_spec();
        spec.policy_type = PolicyType::StepScaling;
        assert_validation_error(validate_policy_spec(&spec), "not supported");
    }

    #[test]
    fn test_configuration_required() {
        let mut spec = policy_spec();
        spec.target_tracking_scaling_policy_configuration = None;
        assert_validation_error(
            validate_policy_spec(&spec),
            "targetTrackingScalingPolicyConfiguration",
        );
    }

    #[test]
    fn test_target_value_must_be_finite() {
        let mut spec = policy_spec();
        if let Some(config) = spec.target_tracking_scaling_policy_configuration.as_mut() {
            config.target_value = f64::NAN;
        }
        assert_validation_error(validate_policy_spec(&spec), "targetValue");
    }

    #[test]
    fn test_negative_cooldown() {
        let mut spec = policy_spec();
        if let Some(config) = spec.target_tracking_scaling_policy_configuration.as_mut() {
            config.scale_out_cooldown = Some(-5);
        }
        assert_validation_error(validate_policy_spec(&spec), "scaleOutCooldown");
    }

    #[test]
    fn test_policy_name_too_long() {
        let mut spec = policy_spec();
        spec.policy_name = "p".repeat(MAX_POLICY_NAME_LEN + 1);
        assert!(validate_policy_spec(&spec).is_err());
    }

    #[test]
    fn test_policy_name_rejects_colon() {
        let mut spec = policy_spec();
        spec.policy_name = "scale:in".to_string();
        assert!(validate_policy_spec(&spec).is_err());
    }

    #[test]
    fn test_metric_specification_required() {
        let mut spec = policy_spec();
        if let Some(config) = spec.target_tracking_scaling_policy_configuration.as_mut() {
            config.predefined_metric_specification = None;
        }
        assert_validation_error(validate_policy_spec(&spec), "predefinedMetricSpecification");
    }

    #[test]
    fn test_validation_errors_are_terminal() {
        let mut spec = policy_spec();
        spec.policy_type = PolicyType::PredictiveScaling;
        let err = validate_policy_spec(&spec).unwrap_err();
        assert!(err.is_terminal());
        assert!(!err.is_retryable());
    }
}
