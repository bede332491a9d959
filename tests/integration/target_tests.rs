//! ScalableTarget lifecycle against the in-memory control plane

use std::time::Duration;

use autoscaling_operator::aws::{AutoscalingApi, AwsError, InMemoryAutoscaling, RegisterTargetInput};
use autoscaling_operator::controller::diff::target_key;
use autoscaling_operator::controller::status::{RetryHold, condition_types};
use autoscaling_operator::controller::{
    Error, FailureAction, IdentityRegistry, Mutation, restore_target_claims,
};
use autoscaling_operator::crd::SyncPhase;
use chrono::Utc;

use crate::common::*;
use crate::harness::*;

mod lifecycle_tests {
    use super::*;

    #[tokio::test]
    async fn test_create_then_synced() {
        let h = Harness::with_api(InMemoryAutoscaling::new().with_region("eu-west-1"));
        let mut target = ScalableTargetBuilder::new("churn-endpoint", "ml").build();

        let pass = h.sync_target(&mut target).await.unwrap();
        assert_eq!(pass.mutation, Mutation::Created);
        assert_eq!(pass.status.sync.phase, SyncPhase::Syncing);
        assert_eq!(pass.requeue, Duration::from_secs(5));
        assert!(pass.status.sync.arn().is_some());
        assert!(pass.status.role_arn.is_some());

        let metadata = pass.status.sync.ack_resource_metadata.clone().unwrap();
        assert_eq!(metadata.region.as_deref(), Some("eu-west-1"));
        assert!(pass.status.sync.arn().unwrap().contains(":eu-west-1:"));
        assert_eq!(metadata.owner_account_id.as_deref(), Some("000000000000"));
        assert_eq!(
            pass.status.sync.synced_identity,
            Some(target_key(&target.spec).to_string())
        );

        let pass = h.sync_target(&mut target).await.unwrap();
        assert_eq!(pass.mutation, Mutation::None);
        assert_eq!(pass.status.sync.phase, SyncPhase::Synced);
        assert_eq!(pass.requeue, Duration::from_secs(300));
        assert!(pass.status.sync.condition_is_true(condition_types::RESOURCE_SYNCED));
        assert_eq!(pass.status.sync.observed_generation, Some(1));
        assert_eq!(h.api.mutating_calls(), 1);
    }

    #[tokio::test]
    async fn test_resync_is_idempotent() {
        let h = Harness::new();
        let mut target = ScalableTargetBuilder::new("churn-endpoint", "ml").build();
        h.converge_target(&mut target).await;
        let synced = target.status.clone().unwrap();

        for _ in 0..3 {
            let pass = h.sync_target(&mut target).await.unwrap();
            assert_eq!(pass.mutation, Mutation::None);
        }
        let status = target.status.clone().unwrap();
        assert_eq!(h.api.mutating_calls(), 1);
        assert_eq!(status.sync.phase, SyncPhase::Synced);
        assert_eq!(status.sync.last_modified_time, synced.sync.last_modified_time);
        assert_eq!(status.sync.creation_time, synced.sync.creation_time);
    }

    #[tokio::test]
    async fn test_spec_update_moves_last_modified() {
        let h = Harness::new();
        let mut target = ScalableTargetBuilder::new("churn-endpoint", "ml").build();
        h.converge_target(&mut target).await;
        let before = target.status.clone().unwrap();

        target.spec.max_capacity = Some(4);
        bump_generation(&mut target.metadata);
        let pass = h.sync_target(&mut target).await.unwrap();
        assert_eq!(pass.mutation, Mutation::Updated);
        assert_eq!(pass.status.sync.phase, SyncPhase::Syncing);
        assert!(pass.status.sync.last_modified_time > before.sync.last_modified_time);
        assert_eq!(pass.status.sync.creation_time, before.sync.creation_time);

        let pass = h.sync_target(&mut target).await.unwrap();
        assert_eq!(pass.status.sync.phase, SyncPhase::Synced);
        assert_eq!(pass.status.sync.observed_generation, Some(2));

        let remote = h.aws.describe_target(&target_key(&target.spec)).await.unwrap().unwrap();
        assert_eq!(remote.max_capacity, 4);
        assert_eq!(h.api.mutating_calls(), 2);
    }

    #[tokio::test]
    async fn test_out_of_band_drift_is_corrected() {
        let h = Harness::new();
        let mut target = ScalableTargetBuilder::new("churn-endpoint", "ml").build();
        h.converge_target(&mut target).await;

        let key = target_key(&target.spec);
        h.api
            .register_scalable_target(&RegisterTargetInput {
                key: key.clone(),
                min_capacity: Some(3),
                max_capacity: Some(10),
                role_arn: None,
                suspended_state: None,
            })
            .await
            .unwrap();

        let pass = h.sync_target(&mut target).await.unwrap();
        assert_eq!(pass.mutation, Mutation::Updated);
        let remote = h.aws.describe_target(&key).await.unwrap().unwrap();
        assert_eq!((remote.min_capacity, remote.max_capacity), (1, 2));
    }

    #[tokio::test]
    async fn test_suspended_state_applied() {
        let h = Harness::new();
        let mut target = ScalableTargetBuilder::new("churn-endpoint", "ml").build();
        h.converge_target(&mut target).await;

        target.spec = ScalableTargetBuilder::new("churn-endpoint", "ml")
            .with_suspended_scale_in()
            .build()
            .spec;
        let pass = h.sync_target(&mut target).await.unwrap();
        assert_eq!(pass.mutation, Mutation::Updated);

        let remote = h.aws.describe_target(&target_key(&target.spec)).await.unwrap().unwrap();
        let suspended = remote.suspended_state.unwrap();
        assert_eq!(suspended.dynamic_scaling_in_suspended, Some(true));
    }
}

mod failure_tests {
    use super::*;

    #[tokio::test]
    async fn test_invalid_spec_never_reaches_remote() {
        let h = Harness::new();
        let mut target = ScalableTargetBuilder::new("churn-endpoint", "ml")
            .with_capacity(5, 2)
            .build();

        let (err, action) = h.sync_target(&mut target).await.unwrap_err();
        assert!(matches!(err, Error::ValidationError(_)));
        assert_eq!(action, FailureAction::AwaitChange);
        assert_eq!(h.api.call_count("DescribeScalableTargets"), 0);

        let status = target.status.unwrap();
        assert_eq!(status.sync.phase, SyncPhase::Pending);
        assert!(status.sync.condition_is_true(condition_types::TERMINAL));
        assert!(status.sync.last_error.unwrap().contains("exceeds"));
    }

    #[tokio::test]
    async fn test_throttling_is_retried() {
        let h = Harness::new();
        h.api.inject_failure(
            "RegisterScalableTarget",
            AwsError::from_code("RegisterScalableTarget", "ThrottlingException", "Rate exceeded"),
        );
        let mut target = ScalableTargetBuilder::new("churn-endpoint", "ml").build();

        let (err, action) = h.sync_target(&mut target).await.unwrap_err();
        assert!(err.is_retryable());
        assert_eq!(action, FailureAction::Retry);
        let status = target.status.clone().unwrap();
        assert_eq!(status.sync.retry_count, Some(1));
        assert!(status.sync.condition_is_true(condition_types::RECOVERABLE));

        let pass = h.sync_target(&mut target).await.unwrap();
        assert_eq!(pass.mutation, Mutation::Created);
        assert_eq!(pass.status.sync.retry_count, Some(0));
        assert!(pass.status.sync.last_error.is_none());
        assert!(!pass.status.sync.condition_is_true(condition_types::RECOVERABLE));
    }

    #[tokio::test]
    async fn test_failed_pass_waits_for_backoff() {
        let h = Harness::new();
        h.api.inject_failure(
            "RegisterScalableTarget",
            AwsError::from_code("RegisterScalableTarget", "ThrottlingException", "Rate exceeded"),
        );
        let mut target = ScalableTargetBuilder::new("churn-endpoint", "ml").build();
        let now = Utc::now();

        let Wake::Ran(Err((_, action))) = h.wake_target(&mut target, now).await else {
            panic!("first pass should run and fail");
        };
        assert_eq!(action, FailureAction::Retry);
        let failed = target.status.clone();
        let describes = h.api.call_count("DescribeScalableTargets");

        // Recording the failure wakes the controller again right away
        let Wake::Held(RetryHold::For(remaining)) = h.wake_target(&mut target, now).await else {
            panic!("wake-up before the backoff should be held");
        };
        let backoff = &h.config.backoff;
        assert!(remaining <= backoff.initial_delay.mul_f64(1.0 + backoff.jitter));
        assert_eq!(target.status, failed);
        assert_eq!(h.api.call_count("DescribeScalableTargets"), describes);
        assert_eq!(h.api.call_count("RegisterScalableTarget"), 1);

        let due = now
            + chrono::Duration::from_std(remaining).unwrap()
            + chrono::Duration::milliseconds(1);
        let Wake::Ran(Ok(pass)) = h.wake_target(&mut target, due).await else {
            panic!("pass should run once the backoff has passed");
        };
        assert_eq!(pass.mutation, Mutation::Created);
        assert!(pass.status.sync.next_attempt_time.is_none());
    }

    #[tokio::test]
    async fn test_terminal_failure_waits_for_spec_change() {
        let h = Harness::new();
        let mut target = ScalableTargetBuilder::new("churn-endpoint", "ml")
            .with_capacity(5, 2)
            .build();
        let now = Utc::now();

        assert!(matches!(h.wake_target(&mut target, now).await, Wake::Ran(Err(_))));
        let failed = target.status.clone();
        for minutes in [0, 10, 60] {
            let wake = h.wake_target(&mut target, now + chrono::Duration::minutes(minutes)).await;
            assert!(matches!(wake, Wake::Held(RetryHold::UntilSpecChange)));
        }
        assert_eq!(target.status, failed);
        assert_eq!(target.status.as_ref().unwrap().sync.retry_count, Some(1));

        target.spec.min_capacity = Some(1);
        bump_generation(&mut target.metadata);
        let Wake::Ran(Ok(pass)) = h.wake_target(&mut target, now).await else {
            panic!("a new generation should run a pass");
        };
        assert_eq!(pass.mutation, Mutation::Created);
    }

    #[tokio::test]
    async fn test_remote_validation_error_is_terminal() {
        let h = Harness::new();
        h.api.inject_failure(
            "RegisterScalableTarget",
            AwsError::from_code("RegisterScalableTarget", "ValidationException", "resource does not exist"),
        );
        let mut target = ScalableTargetBuilder::new("churn-endpoint", "ml").build();

        let (err, action) = h.sync_target(&mut target).await.unwrap_err();
        assert!(!err.is_retryable());
        assert!(action.is_terminal());
        assert!(target.status.unwrap().sync.condition_is_true(condition_types::TERMINAL));
    }

    #[tokio::test]
    async fn test_identity_change_rejected() {
        let h = Harness::new();
        let mut target = ScalableTargetBuilder::new("churn-endpoint", "ml").build();
        h.converge_target(&mut target).await;

        target.spec.resource_id = "endpoint/other/variant/AllTraffic".to_string();
        let (err, action) = h.sync_target(&mut target).await.unwrap_err();
        assert!(err.is_terminal());
        assert_eq!(action, FailureAction::AwaitChange);
        assert_eq!(h.api.mutating_calls(), 1);

        // Still tracked under the identity it was synced with
        let status = target.status.unwrap();
        assert!(status.sync.synced_identity.unwrap().contains(RESOURCE_ID));
    }

    #[tokio::test]
    async fn test_two_resources_one_identity() {
        let h = Harness::new();
        let mut first = ScalableTargetBuilder::new("first", "ml").build();
        let mut second = ScalableTargetBuilder::new("second", "ml").with_capacity(1, 8).build();
        h.converge_target(&mut first).await;

        let (err, action) = h.sync_target(&mut second).await.unwrap_err();
        assert!(matches!(err, Error::IdentityConflict { ref owner, .. } if owner.ends_with("/ml/first")));
        assert_eq!(action, FailureAction::Cooldown);
        assert!(second.status.as_ref().unwrap().sync.condition_is_true(condition_types::TERMINAL));

        // The first resource's bounds are untouched
        let remote = h.aws.describe_target(&target_key(&first.spec)).await.unwrap().unwrap();
        assert_eq!(remote.max_capacity, 2);
        assert_eq!(h.api.mutating_calls(), 1);

        let wake = h.wake_target(&mut second, Utc::now()).await;
        assert!(matches!(wake, Wake::Held(RetryHold::For(d)) if d > Duration::from_secs(290)));
    }

    #[tokio::test]
    async fn test_restart_keeps_synced_owner() {
        let mut h = Harness::new();
        let mut first = ScalableTargetBuilder::new("first", "ml").build();
        let mut second = ScalableTargetBuilder::new("second", "ml").with_capacity(1, 9).build();
        h.converge_target(&mut first).await;

        // A restart forgets every in-memory claim
        h.identities = IdentityRegistry::new();
        assert_eq!(restore_target_claims(&h.identities, [&second, &first]), 1);

        let (err, action) = h.sync_target(&mut second).await.unwrap_err();
        assert!(matches!(err, Error::IdentityConflict { ref owner, .. } if owner.ends_with("/ml/first")));
        assert_eq!(action, FailureAction::Cooldown);

        let remote = h.aws.describe_target(&target_key(&first.spec)).await.unwrap().unwrap();
        assert_eq!(remote.max_capacity, 2);
        assert_eq!(h.api.mutating_calls(), 1);

        let pass = h.sync_target(&mut first).await.unwrap();
        assert_eq!(pass.mutation, Mutation::None);
    }
}
