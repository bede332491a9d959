//! Unit tests for identity ownership

use std::sync::Arc;
use std::time::Duration;

use autoscaling_operator::controller::Error;
use autoscaling_operator::controller::diff::target_key;
use autoscaling_operator::controller::identity::{IdentityRegistry, owner_key};

use crate::common::*;

mod claim_tests {
    use super::*;

    #[test]
    fn test_owner_key_format() {
        assert_eq!(
            owner_key("ScalableTarget", "default", "endpoint"),
            "ScalableTarget/default/endpoint"
        );
    }

    #[test]
    fn test_two_resources_same_identity() {
        let registry = IdentityRegistry::new();
        let identity = target_key(&target_spec()).to_string();
        let first = owner_key("ScalableTarget", "default", "a");
        let second = owner_key("ScalableTarget", "other", "b");

        registry.claim(&identity, &first).unwrap();
        match registry.claim(&identity, &second) {
            Err(Error::IdentityConflict { owner, identity: id }) => {
                assert_eq!(owner, first);
                assert_eq!(id, identity);
            }
            other => panic!("expected identity conflict, got {other:?}"),
        }
        assert_eq!(registry.len(), 1);
    }

    #[test]
    fn test_conflict_is_terminal() {
        let registry = IdentityRegistry::new();
        registry.claim("id", "a").unwrap();
        let err = registry.claim("id", "b").unwrap_err();
        assert!(err.is_terminal());
        assert!(!err.is_retryable());
    }

    #[test]
    fn test_distinct_identities_independent() {
        let registry = IdentityRegistry::new();
        registry.claim("one", "a").unwrap();
        registry.claim("two", "b").unwrap();
        assert_eq!(registry.owner("one").as_deref(), Some("a"));
        assert_eq!(registry.owner("two").as_deref(), Some("b"));
    }

    #[test]
    fn test_release_frees_identity() {
        let registry = IdentityRegistry::new();
        registry.claim("id", "a").unwrap();
        assert!(registry.release("id", "a"));
        assert!(!registry.release("id", "a"));
        registry.claim("id", "b").unwrap();
        assert_eq!(registry.owner("id").as_deref(), Some("b"));
    }
}

mod lock_tests {
    use super::*;

    #[tokio::test]
    async fn test_conflicting_owner_does_not_wait() {
        let registry = IdentityRegistry::new();
        let _guard = registry.acquire("id", "a").await.unwrap();
        let result = tokio::time::timeout(Duration::from_secs(1), registry.acquire("id", "b")).await;
        assert!(matches!(result, Ok(Err(Error::IdentityConflict { .. }))));
    }

    #[tokio::test]
    async fn test_different_identities_in_parallel() {
        let registry = Arc::new(IdentityRegistry::new());
        let first = registry.acquire("one", "a").await.unwrap();
        let second = tokio::time::timeout(Duration::from_secs(1), registry.acquire("two", "b"))
            .await
            .unwrap()
            .unwrap();
        assert_eq!(first.identity, "one");
        assert_eq!(second.identity, "two");
    }
}
