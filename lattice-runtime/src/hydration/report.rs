//! Hydration diagnostics and the per-root state machine.

use std::fmt;

/// How a structural mismatch was dealt with.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Resolution {
    /// The existing node was replaced by a freshly created one.
    Replaced,
    /// Nothing was there; a node was created.
    Inserted,
    /// An unexpected node was removed and the compatible node after it
    /// claimed.
    Discarded,
    /// Could not be resolved locally; the nearest boundary (or the root)
    /// re-renders.
    Escalated,
}

/// A single structural mismatch.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Mismatch {
    pub expected: String,
    pub found: Option<String>,
    pub resolution: Resolution,
}

impl fmt::Display for Mismatch {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &self.found {
            Some(found) => write!(
                f,
                "expected {}, found {} ({:?})",
                self.expected, found, self.resolution
            ),
            None => write!(
                f,
                "expected {}, found nothing ({:?})",
                self.expected, self.resolution
            ),
        }
    }
}

/// What a hydration walk did.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct HydrationReport {
    /// Existing nodes reused.
    pub claimed: usize,
    /// Nodes created by the cursor.
    pub created: usize,
    /// Foreign nodes stepped over.
    pub skipped_foreign: usize,
    /// Server-rendered nodes thrown away (extra siblings, opaque inserts,
    /// fallbacks, aborts).
    pub discarded: usize,
    /// Boundaries that re-rendered their content client-side.
    pub fallbacks: usize,
    pub mismatches: Vec<Mismatch>,
}

impl HydrationReport {
    /// Whether every node was claimed with nothing created or discarded.
    pub fn is_exact(&self) -> bool {
        self.created == 0 && self.discarded == 0 && self.fallbacks == 0 && self.mismatches.is_empty()
    }

    pub(crate) fn record(&mut self, mismatch: Mismatch) {
        tracing::warn!(%mismatch, "hydration mismatch");
        self.mismatches.push(mismatch);
    }
}

/// Lifecycle of one hydration root.
///
/// ```text
/// Idle ──► Claiming ──► Claimed ──────────┐
///   │          ├──────► PartiallyClaimed ─┼──► Interactive
///   │          └──────► Aborted ──────────┘
///   └──────────────────────────────────────► Interactive   (client render)
/// ```
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HydrationState {
    Idle,
    Claiming,
    Claimed,
    PartiallyClaimed,
    Aborted,
    Interactive,
}

impl HydrationState {
    pub fn can_transition_to(self, next: HydrationState) -> bool {
        use HydrationState::*;
        matches!(
            (self, next),
            (Idle, Claiming)
                | (Idle, Interactive)
                | (Claiming, Claimed)
                | (Claiming, PartiallyClaimed)
                | (Claiming, Aborted)
                | (Claimed, Interactive)
                | (PartiallyClaimed, Interactive)
                | (Aborted, Interactive)
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use HydrationState::*;

    #[test]
    fn no_way_back_to_claiming() {
        for state in [Claimed, PartiallyClaimed, Aborted, Interactive] {
            assert!(!state.can_transition_to(Claiming));
        }
        assert!(!Interactive.can_transition_to(Idle));
    }

    #[test]
    fn every_claim_outcome_reaches_interactive() {
        for outcome in [Claimed, PartiallyClaimed, Aborted] {
            assert!(Claiming.can_transition_to(outcome));
            assert!(outcome.can_transition_to(Interactive));
        }
    }

    #[test]
    fn mismatch_display() {
        let mismatch = Mismatch {
            expected: "<p>".into(),
            found: Some("text \"x\"".into()),
            resolution: Resolution::Replaced,
        };
        assert_eq!(mismatch.to_string(), "expected <p>, found text \"x\" (Replaced)");
    }
}
