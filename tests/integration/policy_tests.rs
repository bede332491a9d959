//! ScalingPolicy lifecycle against the in-memory control plane

use std::time::Duration;

use autoscaling_operator::controller::diff::policy_key;
use autoscaling_operator::controller::status::{RetryHold, condition_types, format_timestamp};
use autoscaling_operator::controller::{Error, FailureAction, Mutation, policy_failure};
use autoscaling_operator::crd::{ScalingPolicyStatus, SyncPhase};
use chrono::Utc;

use crate::common::*;
use crate::harness::*;

mod policy_lifecycle_tests {
    use super::*;

    #[tokio::test]
    async fn test_create_policy_after_target() {
        let h = Harness::new();
        let mut target = ScalableTargetBuilder::new("churn-endpoint", "ml").build();
        h.converge_target(&mut target).await;

        let mut policy = ScalingPolicyBuilder::new("invocations", "ml").build();
        let pass = h.sync_policy(&mut policy).await.unwrap();
        assert_eq!(pass.mutation, Mutation::Created);
        assert_eq!(pass.status.sync.phase, SyncPhase::Syncing);
        assert_eq!(pass.status.alarms.len(), 2);
        assert!(pass.status.sync.arn().unwrap().contains("policyName/invocations-per-instance"));

        let pass = h.sync_policy(&mut policy).await.unwrap();
        assert_eq!(pass.mutation, Mutation::None);
        assert_eq!(pass.status.sync.phase, SyncPhase::Synced);
        assert!(pass.status.sync.condition_is_true(condition_types::RESOURCE_SYNCED));
    }

    #[tokio::test]
    async fn test_policy_update() {
        let h = Harness::new();
        let mut target = ScalableTargetBuilder::new("churn-endpoint", "ml").build();
        h.converge_target(&mut target).await;
        let mut policy = ScalingPolicyBuilder::new("invocations", "ml").build();
        h.converge_policy(&mut policy).await;
        let before = policy.status.clone().unwrap();
        let puts = h.api.call_count("PutScalingPolicy");

        policy.spec = ScalingPolicyBuilder::new("invocations", "ml")
            .with_target_value(55.0)
            .with_scale_in_cooldown(900)
            .build()
            .spec;
        bump_generation(&mut policy.metadata);
        let pass = h.sync_policy(&mut policy).await.unwrap();
        assert_eq!(pass.mutation, Mutation::Updated);
        assert!(pass.status.sync.last_modified_time > before.sync.last_modified_time);
        assert_eq!(pass.status.sync.arn(), before.sync.arn());
        assert_eq!(h.api.call_count("PutScalingPolicy"), puts + 1);

        let remote = h.aws.describe_policy(&policy_key(&policy.spec)).await.unwrap().unwrap();
        let config = remote.target_tracking.unwrap();
        assert_eq!(config.target_value, 55.0);
        assert_eq!(config.scale_in_cooldown, Some(900));
    }

    #[tokio::test]
    async fn test_two_policies_share_a_target() {
        let h = Harness::new();
        let mut target = ScalableTargetBuilder::new("churn-endpoint", "ml").build();
        h.converge_target(&mut target).await;

        let mut invocations = ScalingPolicyBuilder::new("invocations", "ml").build();
        let mut latency = ScalingPolicyBuilder::new("latency", "ml")
            .with_policy_name("model-latency")
            .build();
        h.converge_policy(&mut invocations).await;
        h.converge_policy(&mut latency).await;
        assert_ne!(
            invocations.status.unwrap().sync.synced_identity,
            latency.status.unwrap().sync.synced_identity
        );
    }
}

mod dependency_tests {
    use super::*;

    #[tokio::test]
    async fn test_policy_waits_for_target() {
        let h = Harness::new();
        let mut policy = ScalingPolicyBuilder::new("invocations", "ml").build();

        let (err, action) = h.sync_policy(&mut policy).await.unwrap_err();
        assert!(matches!(err, Error::DependencyNotReady(_)));
        assert_eq!(action, FailureAction::Retry);
        assert_eq!(h.api.call_count("PutScalingPolicy"), 0);

        let status = policy.status.clone().unwrap();
        let started = status.dependency_wait_started_at.clone().unwrap();
        assert!(status.sync.condition_is_true(condition_types::RECOVERABLE));
        assert_eq!(status.sync.phase, SyncPhase::Pending);

        // A second miss keeps the original start of the wait
        let (_, action) = h.sync_policy(&mut policy).await.unwrap_err();
        assert_eq!(action, FailureAction::Retry);
        let status = policy.status.clone().unwrap();
        assert_eq!(status.dependency_wait_started_at, Some(started));
        assert_eq!(status.sync.retry_count, Some(2));

        let mut target = ScalableTargetBuilder::new("churn-endpoint", "ml").build();
        h.converge_target(&mut target).await;

        let pass = h.sync_policy(&mut policy).await.unwrap();
        assert_eq!(pass.mutation, Mutation::Created);
        assert!(pass.status.dependency_wait_started_at.is_none());
        assert_eq!(pass.status.sync.retry_count, Some(0));
    }

    #[tokio::test]
    async fn test_dependency_wait_retries_on_backoff() {
        let h = Harness::new();
        let mut policy = ScalingPolicyBuilder::new("invocations", "ml").build();
        let now = Utc::now();

        assert!(matches!(h.wake_policy(&mut policy, now).await, Wake::Ran(Err(_))));
        let describes = h.api.call_count("DescribeScalingPolicies");

        let mut target = ScalableTargetBuilder::new("churn-endpoint", "ml").build();
        h.converge_target(&mut target).await;

        // The target's own status writes do not cut the policy's backoff short
        let Wake::Held(RetryHold::For(remaining)) = h.wake_policy(&mut policy, now).await else {
            panic!("wake-up before the backoff should be held");
        };
        assert_eq!(h.api.call_count("DescribeScalingPolicies"), describes);

        let due = now
            + chrono::Duration::from_std(remaining).unwrap()
            + chrono::Duration::milliseconds(1);
        let Wake::Ran(Ok(pass)) = h.wake_policy(&mut policy, due).await else {
            panic!("pass should run once the backoff has passed");
        };
        assert_eq!(pass.mutation, Mutation::Created);
    }

    #[tokio::test]
    async fn test_renamed_policy_releases_first_identity() {
        let h = Harness::new();
        let mut first = ScalingPolicyBuilder::new("invocations", "ml")
            .with_policy_name("x")
            .build();
        let (err, _) = h.sync_policy(&mut first).await.unwrap_err();
        assert!(matches!(err, Error::DependencyNotReady(_)));

        first.spec.policy_name = "y".to_string();
        bump_generation(&mut first.metadata);
        let (err, _) = h.sync_policy(&mut first).await.unwrap_err();
        assert!(matches!(err, Error::DependencyNotReady(_)));

        let mut target = ScalableTargetBuilder::new("churn-endpoint", "ml").build();
        h.converge_target(&mut target).await;

        let mut second = ScalingPolicyBuilder::new("latency", "ml")
            .with_policy_name("x")
            .build();
        h.converge_policy(&mut second).await;
        h.converge_policy(&mut first).await;
    }

    #[tokio::test]
    async fn test_dependency_wait_expires() {
        let h = Harness::new();
        let mut policy = ScalingPolicyBuilder::new("invocations", "ml").build();
        let now = Utc::now();
        let started = now - chrono::Duration::seconds(601);
        policy.status = Some(ScalingPolicyStatus {
            dependency_wait_started_at: Some(format_timestamp(started)),
            ..Default::default()
        });

        let err = Error::DependencyNotReady("scalable target is not registered".to_string());
        let (status, action) = policy_failure(&policy, &err, &h.config, now);
        assert_eq!(action, FailureAction::Cooldown);
        assert!(status.sync.condition_is_true(condition_types::TERMINAL));
        assert!(status.sync.last_error.unwrap().contains("waited 601s"));
        assert_eq!(status.dependency_wait_started_at, Some(format_timestamp(started)));
    }

    #[tokio::test]
    async fn test_dependency_wait_is_configurable() {
        let mut h = Harness::new();
        h.config.dependency_wait = Duration::ZERO;
        let mut policy = ScalingPolicyBuilder::new("invocations", "ml").build();

        let (_, action) = h.sync_policy(&mut policy).await.unwrap_err();
        assert_eq!(action, FailureAction::Cooldown);
        assert!(policy.status.unwrap().sync.condition_is_true(condition_types::TERMINAL));
    }

    #[tokio::test]
    async fn test_target_deregistered_under_policy() {
        let h = Harness::new();
        let mut target = ScalableTargetBuilder::new("churn-endpoint", "ml").build();
        h.converge_target(&mut target).await;
        let mut policy = ScalingPolicyBuilder::new("invocations", "ml").build();
        h.converge_policy(&mut policy).await;

        let key = policy_key(&policy.spec);
        h.aws.delete_target(&key.target).await.unwrap();

        let (err, _) = h.sync_policy(&mut policy).await.unwrap_err();
        assert!(matches!(err, Error::DependencyNotReady(_)));
        let status = policy.status.unwrap();
        assert_eq!(status.sync.phase, SyncPhase::Synced);
        assert!(status.dependency_wait_started_at.is_some());
    }
}
