//! The registration lifecycle's pure state-machine kernel.
//!
//! No I/O, no shared mutable state: every function here is a pure transformation
//! over values passed in by the caller (`protoreg-pipeline`'s CAS `compute` closure).
//! Exposes the five operations named in §4.1: [`validate_state`], [`validate_event`],
//! [`check_transition`], [`evaluate_guard`], [`run_entry_action`], composed by
//! [`apply_transition`].
//!
//! ```
//! use protoreg_kernel::{apply_transition, TransitionContext};
//! use protoreg_types::{Governance, LifecycleEvent, LifecycleState, Manifest, ManifestMetadata, ManifestType, Urn};
//!
//! let manifest = Manifest {
//!     urn: Urn::new("urn:svc:orders"),
//!     manifest_type: ManifestType::Api,
//!     namespace: "commerce".to_string(),
//!     metadata: ManifestMetadata {
//!         tags: vec![],
//!         governance: Governance { owner: "team".into(), classification: "internal".into(), pii: false },
//!     },
//!     dependencies: vec![],
//!     agent: None,
//!     api: None,
//!     extra: serde_json::Map::new(),
//! };
//!
//! let next = apply_transition(
//!     "m1",
//!     LifecycleState::Draft,
//!     &manifest,
//!     LifecycleEvent::SubmitForReview,
//!     &TransitionContext::default(),
//! ).unwrap();
//! assert_eq!(next, LifecycleState::Reviewed);
//! ```

use protoreg_types::{LifecycleEvent, LifecycleState, Manifest, ManifestState, RegistryError, Urn};

/// Caller-supplied context a guard may need: reviewer identity, review/rejection
/// text, and (for `register`) a conflicting URN the orchestrator already looked up
/// in the catalog.
#[derive(Debug, Clone, Default)]
pub struct TransitionContext {
    pub reviewer: Option<String>,
    pub review_notes: Option<String>,
    pub rejection_reason: Option<String>,
    pub conflicting_urn: Option<Urn>,
}

/// Structural sanity check on a manifest state before a transition is attempted.
/// Always cheap; never performs I/O.
pub fn validate_state(state: &ManifestState) -> Result<(), RegistryError> {
    if state.manifest.urn.as_str().is_empty() {
        return Err(RegistryError::Validation {
            reason: "manifest state has an empty URN".to_string(),
        });
    }
    if state.manifest_id.is_empty() {
        return Err(RegistryError::Validation {
            reason: "manifest state has an empty manifest id".to_string(),
        });
    }
    Ok(())
}

/// `LifecycleEvent` is a closed Rust enum, so every value the type system admits is
/// already a recognized event; this function exists to keep the five-operation shape
/// of §4.1 explicit rather than folding validation into `check_transition`.
pub fn validate_event(_event: LifecycleEvent) -> Result<(), RegistryError> {
    Ok(())
}

/// The transition table (state x event -> state) from §4.1. `None` means the
/// transition is forbidden from that state.
pub fn check_transition(from: LifecycleState, event: LifecycleEvent) -> Option<LifecycleState> {
    use LifecycleEvent::*;
    use LifecycleState::*;

    match (from, event) {
        (Draft, SubmitForReview) => Some(Reviewed),
        (Reviewed, Approve) => Some(Approved),
        (Reviewed, Reject) => Some(Rejected),
        (Reviewed, RevertToDraft) => Some(Draft),
        (Approved, Reject) => Some(Rejected),
        (Approved, Register) => Some(Registered),
        (Approved, RevertToDraft) => Some(Draft),
        (Rejected, RevertToDraft) => Some(Draft),
        _ => None,
    }
}

/// The guard predicates of §4.1. Each returns a human-readable reason on failure.
pub fn evaluate_guard(
    event: LifecycleEvent,
    manifest: &Manifest,
    ctx: &TransitionContext,
) -> Result<(), RegistryError> {
    match event {
        LifecycleEvent::SubmitForReview => {
            if manifest.urn.as_str().is_empty() {
                return Err(RegistryError::GuardFailed {
                    reason: "manifest must be present with a non-empty URN".to_string(),
                });
            }
        }
        LifecycleEvent::Approve => {
            let reviewer_ok = ctx.reviewer.as_deref().is_some_and(|s| !s.is_empty());
            let notes_ok = ctx.review_notes.as_deref().is_some_and(|s| !s.is_empty());
            if !reviewer_ok || !notes_ok {
                return Err(RegistryError::GuardFailed {
                    reason: "reviewer identity and non-empty review notes are required"
                        .to_string(),
                });
            }
        }
        LifecycleEvent::Reject => {
            let reason_ok = ctx
                .rejection_reason
                .as_deref()
                .is_some_and(|s| !s.is_empty());
            if !reason_ok {
                return Err(RegistryError::GuardFailed {
                    reason: "a rejection reason is required".to_string(),
                });
            }
        }
        LifecycleEvent::Register => {
            if manifest.urn.as_str().is_empty() {
                return Err(RegistryError::GuardFailed {
                    reason: "manifest must have a URN to register".to_string(),
                });
            }
            if let Some(conflicting) = &ctx.conflicting_urn {
                return Err(RegistryError::Conflict {
                    reason: format!("urn_conflict: {conflicting} is already registered"),
                });
            }
        }
        LifecycleEvent::RevertToDraft => {}
    }
    Ok(())
}

/// Structured logging only; must not mutate state or perform fallible I/O.
pub fn run_entry_action(
    manifest_id: &str,
    from: LifecycleState,
    to: LifecycleState,
    event: LifecycleEvent,
) {
    tracing::info!(
        manifest_id,
        from = %from,
        to = %to,
        event = %event,
        "lifecycle transition"
    );
}

/// Composes the five operations above into the single call `protoreg-pipeline`'s CAS
/// `compute` closure makes. `REGISTERED` is terminal: any event addressed to it is
/// reported as a `conflict` (no legal transition exists, matching spec's
/// `no_transitions` kind, which this taxonomy folds into `conflict`).
pub fn apply_transition(
    manifest_id: &str,
    current_state: LifecycleState,
    manifest: &Manifest,
    event: LifecycleEvent,
    ctx: &TransitionContext,
) -> Result<LifecycleState, RegistryError> {
    validate_event(event)?;

    if current_state == LifecycleState::Registered {
        return Err(RegistryError::Conflict {
            reason: format!("no_transitions: {current_state} accepts no further events"),
        });
    }

    let Some(target) = check_transition(current_state, event) else {
        return Err(RegistryError::Conflict {
            reason: format!("event {event} is not legal from state {current_state}"),
        });
    };

    evaluate_guard(event, manifest, ctx)?;
    run_entry_action(manifest_id, current_state, target, event);
    Ok(target)
}

#[cfg(test)]
mod tests {
    use super::*;
    use protoreg_types::{Governance, ManifestMetadata, ManifestType};

    fn manifest_with_urn(urn: &str) -> Manifest {
        Manifest {
            urn: Urn::new(urn),
            manifest_type: ManifestType::Api,
            namespace: "commerce".to_string(),
            metadata: ManifestMetadata {
                tags: vec![],
                governance: Governance {
                    owner: "team".to_string(),
                    classification: "internal".to_string(),
                    pii: false,
                },
            },
            dependencies: vec![],
            agent: None,
            api: None,
            extra: serde_json::Map::new(),
        }
    }

    #[test]
    fn full_transition_table_matches_spec() {
        use LifecycleEvent::*;
        use LifecycleState::*;

        let cases: &[(LifecycleState, LifecycleEvent, Option<LifecycleState>)] = &[
            (Draft, SubmitForReview, Some(Reviewed)),
            (Draft, Approve, None),
            (Draft, Reject, None),
            (Draft, Register, None),
            (Draft, RevertToDraft, None),
            (Reviewed, Approve, Some(Approved)),
            (Reviewed, Reject, Some(Rejected)),
            (Reviewed, RevertToDraft, Some(Draft)),
            (Reviewed, SubmitForReview, None),
            (Approved, Reject, Some(Rejected)),
            (Approved, Register, Some(Registered)),
            (Approved, RevertToDraft, Some(Draft)),
            (Approved, Approve, None),
            (Registered, SubmitForReview, None),
            (Registered, Register, None),
            (Rejected, RevertToDraft, Some(Draft)),
            (Rejected, Approve, None),
        ];

        for (from, event, expected) in cases {
            assert_eq!(check_transition(*from, *event), *expected, "{from:?} {event:?}");
        }
    }

    #[test]
    fn registered_rejects_any_event_as_conflict() {
        let manifest = manifest_with_urn("urn:svc:orders");
        let err = apply_transition(
            "m1",
            LifecycleState::Registered,
            &manifest,
            LifecycleEvent::SubmitForReview,
            &TransitionContext::default(),
        )
        .unwrap_err();
        assert!(matches!(err, RegistryError::Conflict { .. }));
        assert_eq!(err.kind(), "conflict");
    }

    #[test]
    fn submit_for_review_guard_requires_urn() {
        let manifest = manifest_with_urn("");
        let err = apply_transition(
            "m1",
            LifecycleState::Draft,
            &manifest,
            LifecycleEvent::SubmitForReview,
            &TransitionContext::default(),
        )
        .unwrap_err();
        assert!(matches!(err, RegistryError::GuardFailed { .. }));
    }

    #[test]
    fn approve_guard_requires_reviewer_and_notes() {
        let manifest = manifest_with_urn("urn:svc:orders");
        let err = apply_transition(
            "m1",
            LifecycleState::Reviewed,
            &manifest,
            LifecycleEvent::Approve,
            &TransitionContext {
                reviewer: Some(String::new()),
                review_notes: Some(String::new()),
                ..Default::default()
            },
        )
        .unwrap_err();
        assert!(matches!(err, RegistryError::GuardFailed { .. }));

        let ok = apply_transition(
            "m1",
            LifecycleState::Reviewed,
            &manifest,
            LifecycleEvent::Approve,
            &TransitionContext {
                reviewer: Some("alice".to_string()),
                review_notes: Some("looks good".to_string()),
                ..Default::default()
            },
        );
        assert_eq!(ok.unwrap(), LifecycleState::Approved);
    }

    #[test]
    fn register_guard_rejects_on_conflicting_urn() {
        let manifest = manifest_with_urn("urn:svc:orders");
        let err = apply_transition(
            "m1",
            LifecycleState::Approved,
            &manifest,
            LifecycleEvent::Register,
            &TransitionContext {
                conflicting_urn: Some(Urn::new("urn:svc:orders")),
                ..Default::default()
            },
        )
        .unwrap_err();
        assert!(matches!(err, RegistryError::Conflict { .. }));
    }

    #[test]
    fn reject_guard_requires_reason() {
        let manifest = manifest_with_urn("urn:svc:orders");
        let err = apply_transition(
            "m1",
            LifecycleState::Reviewed,
            &manifest,
            LifecycleEvent::Reject,
            &TransitionContext::default(),
        )
        .unwrap_err();
        assert!(matches!(err, RegistryError::GuardFailed { .. }));

        let ok = apply_transition(
            "m1",
            LifecycleState::Reviewed,
            &manifest,
            LifecycleEvent::Reject,
            &TransitionContext {
                rejection_reason: Some("incomplete spec".to_string()),
                ..Default::default()
            },
        );
        assert_eq!(ok.unwrap(), LifecycleState::Rejected);
    }

    #[test]
    fn validate_state_rejects_empty_urn() {
        let state = ManifestState {
            current_state: LifecycleState::Draft,
            manifest: manifest_with_urn(""),
            manifest_id: "m1".to_string(),
            created_at: chrono::Utc::now(),
            updated_at: chrono::Utc::now(),
            last_transition: None,
            reviewer: None,
            review_notes: None,
            rejection_reason: None,
        };
        assert!(validate_state(&state).is_err());
    }
}
