pub mod adoption;
pub mod context;
pub mod diff;
pub mod error;
pub mod finalizer;
pub mod identity;
pub mod policy_reconciler;
pub mod remote;
pub mod state_machine;
pub mod status;
pub mod target_reconciler;
pub mod teardown;
pub mod validation;

pub use adoption::{
    AdoptedKind, AdoptedObject, AdoptionRequest, adopt, adoption_error_policy, adoption_failure,
    adoption_success, check_existing, reconcile_adopted, resolve_policy, resolve_target,
};
pub use context::Context;
pub use diff::{ChangeSet, FieldChange, diff_policy, diff_target, identity_change};
pub use error::{BackoffConfig, Error, FailureAction, Result};
pub use finalizer::FINALIZER;
pub use identity::IdentityRegistry;
pub use policy_reconciler::{
    PolicyPass, finalize_policy, policy_error_policy, policy_failure, reconcile_policy,
    restore_policy_claims, sync_policy,
};
pub use remote::{AllowCreate, AwsReconciler, CreateGate, DenyCreate, Ensured, Mutation};
pub use state_machine::{SyncEvent, SyncStateMachine, TransitionContext};
pub use status::{ConditionBuilder, StatusWriter, spec_changed};
pub use target_reconciler::{
    TargetPass, finalize_target, reconcile_target, restore_target_claims, sync_target,
    target_error_policy, target_failure,
};
pub use validation::{validate_policy_spec, validate_target_spec};
