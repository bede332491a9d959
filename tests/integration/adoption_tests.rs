//! Adoption of remote objects that already exist

use std::sync::Arc;

use async_trait::async_trait;
use autoscaling_operator::aws::{
    AutoscalingApi, AwsError, InMemoryAutoscaling, PolicyFilter, PolicyKey, PutPolicyInput,
    PutPolicyOutput, RegisterTargetInput, RegisterTargetOutput, RemotePolicyState,
    RemoteTargetState, TargetFilter, TargetKey,
};
use autoscaling_operator::controller::diff::target_key;
use autoscaling_operator::controller::status::{
    RetryHold, condition_types, format_timestamp, retry_hold,
};
use autoscaling_operator::controller::{
    AdoptedObject, AwsReconciler, Error, FailureAction, Mutation, adopt, adoption_failure,
    adoption_success, check_existing,
};
use autoscaling_operator::crd::{ADOPTED_ANNOTATION, AdoptedResource, SyncPhase, is_adopted};
use chrono::{DateTime, Duration};

use crate::common::*;
use crate::harness::*;

/// Reports every described object twice, as an over-broad filter would
struct DuplicatingApi(InMemoryAutoscaling);

#[async_trait]
impl AutoscalingApi for DuplicatingApi {
    async fn describe_scalable_targets(
        &self,
        filter: &TargetFilter,
    ) -> Result<Vec<RemoteTargetState>, AwsError> {
        let found = self.0.describe_scalable_targets(filter).await?;
        Ok(found.iter().chain(found.iter()).cloned().collect())
    }

    async fn register_scalable_target(
        &self,
        input: &RegisterTargetInput,
    ) -> Result<RegisterTargetOutput, AwsError> {
        self.0.register_scalable_target(input).await
    }

    async fn deregister_scalable_target(&self, key: &TargetKey) -> Result<(), AwsError> {
        self.0.deregister_scalable_target(key).await
    }

    async fn describe_scaling_policies(
        &self,
        filter: &PolicyFilter,
    ) -> Result<Vec<RemotePolicyState>, AwsError> {
        let found = self.0.describe_scaling_policies(filter).await?;
        Ok(found.iter().chain(found.iter()).cloned().collect())
    }

    async fn put_scaling_policy(&self, input: &PutPolicyInput) -> Result<PutPolicyOutput, AwsError> {
        self.0.put_scaling_policy(input).await
    }

    async fn delete_scaling_policy(&self, key: &PolicyKey) -> Result<(), AwsError> {
        self.0.delete_scaling_policy(key).await
    }

    fn region(&self) -> Option<String> {
        self.0.region()
    }

    fn account_id(&self) -> Option<String> {
        self.0.account_id()
    }
}

/// Register the fixture target out of band, as if created outside the cluster
async fn register_existing(api: &dyn AutoscalingApi, min: i32, max: i32) {
    api.register_scalable_target(&RegisterTargetInput {
        key: TargetKey::new(SERVICE_NAMESPACE, RESOURCE_ID, SCALABLE_DIMENSION),
        min_capacity: Some(min),
        max_capacity: Some(max),
        role_arn: None,
        suspended_state: None,
    })
    .await
    .unwrap();
}

mod adopt_target_tests {
    use super::*;

    #[tokio::test]
    async fn test_adopt_exactly_one_match() {
        let h = Harness::new();
        register_existing(h.api.as_ref(), 2, 6).await;
        let mutations = h.api.mutating_calls();

        let adopted = adopt(&adopt_target_spec("churn-endpoint"), "ml", &h.aws)
            .await
            .unwrap();
        let AdoptedObject::Target(mut target) = adopted else {
            panic!("expected a scalable target");
        };
        assert_eq!(target.metadata.name.as_deref(), Some("churn-endpoint"));
        assert_eq!(target.metadata.namespace.as_deref(), Some("ml"));
        assert!(is_adopted(&target.metadata));
        assert_eq!(
            target.metadata.annotations.as_ref().unwrap()[ADOPTED_ANNOTATION],
            "true"
        );
        assert_eq!(target.spec.min_capacity, Some(2));
        assert_eq!(target.spec.max_capacity, Some(6));
        assert_eq!(
            target_key(&target.spec),
            TargetKey::new(SERVICE_NAMESPACE, RESOURCE_ID, SCALABLE_DIMENSION)
        );

        let pass = h.sync_target(&mut target).await.unwrap();
        assert_eq!(pass.mutation, Mutation::None);
        assert!(pass.status.sync.condition_is_true(condition_types::ADOPTED));
        assert_eq!(pass.status.sync.phase, SyncPhase::Syncing);

        let pass = h.sync_target(&mut target).await.unwrap();
        assert_eq!(pass.status.sync.phase, SyncPhase::Synced);
        assert!(pass.status.sync.condition_is_true(condition_types::ADOPTED));
        assert_eq!(h.api.mutating_calls(), mutations);
    }

    #[tokio::test]
    async fn test_adopt_missing_target() {
        let h = Harness::new();
        let err = adopt(&adopt_target_spec("churn-endpoint"), "ml", &h.aws)
            .await
            .unwrap_err();
        assert!(err.is_not_found());
        assert!(!err.is_terminal());
    }

    #[tokio::test]
    async fn test_adopted_resource_never_creates() {
        let h = Harness::new();
        let mut target = ScalableTargetBuilder::new("churn-endpoint", "ml").adopted().build();

        let (err, action) = h.sync_target(&mut target).await.unwrap_err();
        assert!(err.is_not_found());
        assert_eq!(action, FailureAction::Retry);
        assert_eq!(h.api.mutating_calls(), 0);
    }

    #[tokio::test]
    async fn test_adopt_ambiguous_match() {
        let api = Arc::new(DuplicatingApi(InMemoryAutoscaling::new()));
        register_existing(api.as_ref(), 1, 2).await;
        let aws = AwsReconciler::new(api);

        let err = adopt(&adopt_target_spec("churn-endpoint"), "ml", &aws)
            .await
            .unwrap_err();
        assert!(matches!(err, Error::AdoptionAmbiguous(ref msg) if msg.starts_with("2 remote objects")));
        assert!(err.is_terminal());
    }

    #[tokio::test]
    async fn test_adopted_spec_drift_is_applied() {
        let h = Harness::new();
        register_existing(h.api.as_ref(), 1, 2).await;
        let AdoptedObject::Target(mut target) =
            adopt(&adopt_target_spec("churn-endpoint"), "ml", &h.aws).await.unwrap()
        else {
            panic!("expected a scalable target");
        };
        h.converge_target(&mut target).await;

        target.spec.max_capacity = Some(5);
        let pass = h.sync_target(&mut target).await.unwrap();
        assert_eq!(pass.mutation, Mutation::Updated);
        assert!(pass.status.sync.condition_is_true(condition_types::ADOPTED));
    }
}

mod adopt_policy_tests {
    use super::*;

    #[tokio::test]
    async fn test_adopt_policy() {
        let h = Harness::new();
        let mut target = ScalableTargetBuilder::new("churn-endpoint", "ml").build();
        h.converge_target(&mut target).await;
        let mut existing = ScalingPolicyBuilder::new("existing", "ml").with_target_value(42.0).build();
        h.converge_policy(&mut existing).await;
        let mutations = h.api.mutating_calls();

        let spec = adopt_policy_spec("adopted-invocations", "invocations-per-instance");
        let AdoptedObject::Policy(mut policy) = adopt(&spec, "other", &h.aws).await.unwrap() else {
            panic!("expected a scaling policy");
        };
        assert_eq!(policy.metadata.namespace.as_deref(), Some("other"));
        assert_eq!(policy.spec.policy_name, "invocations-per-instance");
        let config = policy.spec.target_tracking_scaling_policy_configuration.clone().unwrap();
        assert_eq!(config.target_value, 42.0);

        // The original resource still owns the identity
        let (err, _) = h.sync_policy(&mut policy).await.unwrap_err();
        assert!(matches!(err, Error::IdentityConflict { .. }));
        assert_eq!(h.api.mutating_calls(), mutations);
    }

    #[tokio::test]
    async fn test_adopt_missing_policy() {
        let h = Harness::new();
        register_existing(h.api.as_ref(), 1, 2).await;
        let spec = adopt_policy_spec("adopted-invocations", "does-not-exist");
        let err = adopt(&spec, "ml", &h.aws).await.unwrap_err();
        assert!(err.is_not_found());
    }

    #[tokio::test]
    async fn test_adopt_ambiguous_policy() {
        let inner = InMemoryAutoscaling::new();
        register_existing(&inner, 1, 2).await;
        let api = Arc::new(DuplicatingApi(inner));
        let aws = AwsReconciler::new(api.clone());
        api.put_scaling_policy(&PutPolicyInput {
            key: PolicyKey::new(
                TargetKey::new(SERVICE_NAMESPACE, RESOURCE_ID, SCALABLE_DIMENSION),
                "invocations-per-instance",
            ),
            policy_type: policy_spec().policy_type,
            target_tracking: policy_spec().target_tracking_scaling_policy_configuration,
        })
        .await
        .unwrap();

        let spec = adopt_policy_spec("adopted-invocations", "invocations-per-instance");
        let err = adopt(&spec, "ml", &aws).await.unwrap_err();
        assert!(matches!(err, Error::AdoptionAmbiguous(_)));
    }
}

mod adoption_request_tests {
    use super::*;

    #[tokio::test]
    async fn test_foreign_group_rejected() {
        let h = Harness::new();
        let mut spec = adopt_target_spec("churn-endpoint");
        spec.kubernetes.group = "s3.services.k8s.aws".to_string();
        let err = adopt(&spec, "ml", &h.aws).await.unwrap_err();
        assert!(matches!(err, Error::ValidationError(_)));
        assert_eq!(h.api.call_count("DescribeScalableTargets"), 0);
    }

    #[tokio::test]
    async fn test_unknown_kind_rejected() {
        let h = Harness::new();
        let mut spec = adopt_target_spec("churn-endpoint");
        spec.kubernetes.kind = "Bucket".to_string();
        assert!(adopt(&spec, "ml", &h.aws).await.unwrap_err().is_terminal());
    }

    #[tokio::test]
    async fn test_missing_additional_key_rejected() {
        let h = Harness::new();
        let mut spec = adopt_target_spec("churn-endpoint");
        spec.aws.additional_keys.remove("scalableDimension");
        let err = adopt(&spec, "ml", &h.aws).await.unwrap_err();
        assert!(err.to_string().contains("scalableDimension"));
    }

    #[tokio::test]
    async fn test_policy_requires_policy_name() {
        let h = Harness::new();
        let mut spec = adopt_target_spec("churn-endpoint");
        spec.kubernetes.kind = "ScalingPolicy".to_string();
        let err = adopt(&spec, "ml", &h.aws).await.unwrap_err();
        assert!(matches!(err, Error::ValidationError(ref msg) if msg.contains("policyName")));
    }
}

mod existing_resource_tests {
    use super::*;

    async fn adopted_target(h: &Harness) -> AdoptedObject {
        adopt(&adopt_target_spec("churn-endpoint"), "ml", &h.aws)
            .await
            .unwrap()
    }

    #[tokio::test]
    async fn test_same_adoption_is_accepted() {
        let h = Harness::new();
        register_existing(h.api.as_ref(), 1, 2).await;
        let wanted = adopted_target(&h).await;
        let existing = adopted_target(&h).await;
        check_existing(&existing, &wanted).unwrap();
    }

    #[tokio::test]
    async fn test_unrelated_resource_is_not_claimed() {
        let h = Harness::new();
        register_existing(h.api.as_ref(), 1, 2).await;
        let wanted = adopted_target(&h).await;
        let existing = AdoptedObject::Target(
            ScalableTargetBuilder::new("churn-endpoint", "ml")
                .with_capacity(1, 9)
                .build(),
        );

        let err = check_existing(&existing, &wanted).unwrap_err();
        assert!(err.is_terminal());
        assert!(err.to_string().contains("not an adopted resource"));
    }

    #[tokio::test]
    async fn test_adoption_of_another_object_is_not_claimed() {
        let h = Harness::new();
        register_existing(h.api.as_ref(), 1, 2).await;
        let wanted = adopted_target(&h).await;
        let existing = AdoptedObject::Target(
            ScalableTargetBuilder::new("churn-endpoint", "ml")
                .with_resource_id("endpoint/other/variant/AllTraffic")
                .adopted()
                .build(),
        );

        let err = check_existing(&existing, &wanted).unwrap_err();
        assert!(err.is_terminal());
        assert!(err.to_string().contains("endpoint/other/variant/AllTraffic"));
    }
}

mod adoption_status_tests {
    use super::*;

    fn adopted_resource() -> AdoptedResource {
        let mut adopted = AdoptedResource::new("adopt-churn", adopt_target_spec("churn-endpoint"));
        adopted.metadata.namespace = Some("ml".to_string());
        adopted.metadata.generation = Some(1);
        adopted
    }

    #[tokio::test]
    async fn test_missing_object_backs_off_exponentially() {
        let mut h = Harness::new();
        h.config.backoff.jitter = 0.0;
        let now = DateTime::from_timestamp(1_750_000_000, 0).unwrap();
        let mut adopted = adopted_resource();

        let mut next_attempts = Vec::new();
        for _ in 0..3 {
            let err = adopt(&adopted.spec, "ml", &h.aws).await.unwrap_err();
            let (status, action) = adoption_failure(&adopted, &err, &h.config, now);
            assert_eq!(action, FailureAction::Retry);
            assert!(status.conditions.iter().any(|c| c.type_ == condition_types::RECOVERABLE));
            next_attempts.push(status.next_attempt_time.clone().unwrap());
            adopted.status = Some(status);
        }
        let expected: Vec<String> = [5, 10, 20]
            .iter()
            .map(|secs| format_timestamp(now + Duration::seconds(*secs)))
            .collect();
        assert_eq!(next_attempts, expected);

        let status = adopted.status.clone().unwrap();
        assert_eq!(status.retry_count, Some(3));
        assert_eq!(
            retry_hold(
                adopted.metadata.generation,
                status.observed_generation,
                status.last_error.is_some(),
                status.next_attempt_time.as_deref(),
                now,
            ),
            Some(RetryHold::For(std::time::Duration::from_secs(20)))
        );

        register_existing(h.api.as_ref(), 1, 2).await;
        let object = adopt(&adopted.spec, "ml", &h.aws).await.unwrap();
        let status = adoption_success(&adopted, &object.name(), now);
        assert_eq!(status.retry_count, Some(0));
        assert!(status.last_error.is_none());
        assert!(status.next_attempt_time.is_none());
        assert!(status.conditions.iter().any(|c| c.type_ == condition_types::ADOPTED && c.status == "True"));
        assert!(!status.conditions.iter().any(|c| c.type_ == condition_types::RECOVERABLE));
    }
}
