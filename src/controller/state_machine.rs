//! Sync lifecycle state machine for managed autoscaling resources
//!
//! Pending -> Syncing -> Synced, back to Syncing whenever a pass has to
//! mutate the remote object, and Deleting -> Deleted once the custom
//! resource is being removed. Deleted is absorbing.

use std::fmt;

use crate::crd::SyncPhase;

/// Events that trigger phase transitions
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum SyncEvent {
    /// First reconcile of a resource
    ReconcileStarted,
    /// An adoption request resolved to a remote object
    AdoptionResolved,
    /// The pass issued a mutating call (spec change or out-of-band drift)
    SpecChanged,
    /// The pass found nothing to change
    Converged,
    /// Deletion timestamp has been set on the resource
    DeletionRequested,
    /// Remote delete returned success or not-found
    RemoteDeleted,
}

impl fmt::Display for SyncEvent {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            SyncEvent::ReconcileStarted => write!(f, "ReconcileStarted"),
            SyncEvent::AdoptionResolved => write!(f, "AdoptionResolved"),
            SyncEvent::SpecChanged => write!(f, "SpecChanged"),
            SyncEvent::Converged => write!(f, "Converged"),
            SyncEvent::DeletionRequested => write!(f, "DeletionRequested"),
            SyncEvent::RemoteDeleted => write!(f, "RemoteDeleted"),
        }
    }
}

/// What the current pass observed
#[derive(Debug, Clone, Default)]
pub struct TransitionContext {
    /// A mutating remote call was issued during this pass
    pub mutated: bool,
    /// Field changes still outstanding after the pass
    pub pending_changes: usize,
    /// The remote delete has been confirmed
    pub remote_deleted: bool,
    /// The resource was created through adoption
    pub adopted: bool,
}

impl TransitionContext {
    pub fn new(mutated: bool, pending_changes: usize) -> Self {
        Self {
            mutated,
            pending_changes,
            ..Default::default()
        }
    }

    pub fn deleted() -> Self {
        Self {
            remote_deleted: true,
            ..Default::default()
        }
    }

    pub fn adopted(mut self, adopted: bool) -> Self {
        self.adopted = adopted;
        self
    }
}

/// A state transition definition
#[derive(Debug)]
pub struct Transition {
    pub from: SyncPhase,
    pub to: SyncPhase,
    pub event: SyncEvent,
    pub description: &'static str,
}

impl Transition {
    const fn new(
        from: SyncPhase,
        to: SyncPhase,
        event: SyncEvent,
        description: &'static str,
    ) -> Self {
        Self {
            from,
            to,
            event,
            description,
        }
    }
}

/// Result of attempting a state transition
#[derive(Debug)]
pub enum TransitionResult {
    Success {
        from: SyncPhase,
        to: SyncPhase,
        event: SyncEvent,
        description: &'static str,
    },
    InvalidTransition {
        current: SyncPhase,
        event: SyncEvent,
    },
    GuardFailed {
        from: SyncPhase,
        to: SyncPhase,
        event: SyncEvent,
        reason: String,
    },
}

impl TransitionResult {
    /// Phase after the attempt; unchanged unless the transition succeeded
    pub fn phase_or(&self, current: SyncPhase) -> SyncPhase {
        match self {
            TransitionResult::Success { to, .. } => *to,
            _ => current,
        }
    }
}

/// Transition table for [`SyncPhase`]
pub struct SyncStateMachine {
    transitions: Vec<Transition>,
}

impl Default for SyncStateMachine {
    fn default() -> Self {
        Self::new()
    }
}

impl SyncStateMachine {
    pub fn new() -> Self {
        use SyncEvent::*;
        use SyncPhase::*;

        Self {
            transitions: vec![
                // === Pending ===
                Transition::new(Pending, Syncing, ReconcileStarted, "First reconcile"),
                Transition::new(Pending, Syncing, AdoptionResolved, "Adopted remote object found"),
                Transition::new(Pending, Deleting, DeletionRequested, "Deletion requested before first sync"),
                // === Syncing ===
                Transition::new(Syncing, Synced, Converged, "Remote object matches spec"),
                Transition::new(Syncing, Syncing, SpecChanged, "Further changes applied"),
                Transition::new(Syncing, Deleting, DeletionRequested, "Deletion requested while syncing"),
                // === Synced ===
                Transition::new(Synced, Syncing, SpecChanged, "Spec change or drift applied"),
                Transition::new(Synced, Synced, Converged, "Resync found no drift"),
                Transition::new(Synced, Deleting, DeletionRequested, "Deletion requested"),
                // === Deleting ===
                Transition::new(Deleting, Deleted, RemoteDeleted, "Remote object removed"),
            ],
        }
    }

    /// Attempt to transition to a new state based on an event
    pub fn transition(
        &self,
        current: &SyncPhase,
        event: SyncEvent,
        ctx: &TransitionContext,
    ) -> TransitionResult {
        let transition = self
            .transitions
            .iter()
            .find(|t| t.from == *current && t.event == event);

        match transition {
            Some(t) => {
                if let Some(reason) = self.check_guard(t, ctx) {
                    TransitionResult::GuardFailed {
                        from: t.from,
                        to: t.to,
                        event,
                        reason,
                    }
                } else {
                    TransitionResult::Success {
                        from: t.from,
                        to: t.to,
                        event,
                        description: t.description,
                    }
                }
            }
            None => TransitionResult::InvalidTransition {
                current: *current,
                event,
            },
        }
    }

    /// Check if a transition is valid (ignoring guards)
    pub fn can_transition(&self, from: &SyncPhase, event: &SyncEvent) -> bool {
        self.transitions
            .iter()
            .any(|t| t.from == *from && t.event == *event)
    }

    /// Get all valid events for a given state
    pub fn valid_events(&self, state: &SyncPhase) -> Vec<&SyncEvent> {
        self.transitions
            .iter()
            .filter(|t| t.from == *state)
            .map(|t| &t.event)
            .collect()
    }

    fn check_guard(&self, transition: &Transition, ctx: &TransitionContext) -> Option<String> {
        match transition.event {
            SyncEvent::Converged if ctx.mutated || ctx.pending_changes > 0 => Some(format!(
                "{} change(s) still pending",
                ctx.pending_changes.max(1)
            )),
            SyncEvent::RemoteDeleted if !ctx.remote_deleted => {
                Some("remote delete not confirmed".to_string())
            }
            _ => None,
        }
    }
}

/// Determine the event a pass represents
pub fn determine_event(
    current_phase: &SyncPhase,
    ctx: &TransitionContext,
    has_deletion_timestamp: bool,
) -> SyncEvent {
    // Deletion always takes priority
    if has_deletion_timestamp {
        return match current_phase {
            SyncPhase::Deleting | SyncPhase::Deleted => SyncEvent::RemoteDeleted,
            _ => SyncEvent::DeletionRequested,
        };
    }

    match current_phase {
        SyncPhase::Pending if ctx.adopted => SyncEvent::AdoptionResolved,
        SyncPhase::Pending => SyncEvent::ReconcileStarted,
        _ if ctx.mutated || ctx.pending_changes > 0 => SyncEvent::SpecChanged,
        _ => SyncEvent::Converged,
    }
}

/// Phase after a successful pass
pub fn next_phase(
    sm: &SyncStateMachine,
    current: SyncPhase,
    ctx: &TransitionContext,
    has_deletion_timestamp: bool,
) -> SyncPhase {
    let event = determine_event(&current, ctx, has_deletion_timestamp);
    sm.transition(&current, event, ctx).phase_or(current)
}
