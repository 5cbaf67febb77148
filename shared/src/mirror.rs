//! Client-side state mirror.
//!
//! Applies full/delta state messages to a local copy of the client's
//! projection and decides which ticks to acknowledge. Patch application is
//! all-or-nothing per message: a structural failure leaves the mirror on its
//! previous state, marks it desynced and withholds the acknowledgment; the
//! server's ack timeout then forces the full-state resync.

use log::warn;
use serde_json::Value;

use crate::patch::{apply_patch, PatchOp};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MirrorOutcome {
    /// The update was applied; acknowledge this tick.
    Applied { tick: u64 },
    /// The update predates the mirror's current tick (unordered delivery)
    /// and was ignored.
    Stale,
    /// The mirror is out of sync and waiting for the next full state.
    AwaitingResync,
}

#[derive(Debug, Default)]
pub struct StateMirror {
    state: Value,
    last_applied: Option<u64>,
    desynced: bool,
}

impl StateMirror {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn state(&self) -> &Value {
        &self.state
    }

    pub fn last_applied(&self) -> Option<u64> {
        self.last_applied
    }

    pub fn is_desynced(&self) -> bool {
        self.desynced
    }

    /// Replaces the mirror wholesale and discards any desync bookkeeping.
    pub fn apply_full(&mut self, state: Value, tick: u64) -> MirrorOutcome {
        if self.is_stale(tick) {
            return MirrorOutcome::Stale;
        }

        self.state = state;
        self.last_applied = Some(tick);
        self.desynced = false;
        MirrorOutcome::Applied { tick }
    }

    /// Applies a cumulative patch list in order.
    pub fn apply_delta(&mut self, patches: &[PatchOp], tick: u64) -> MirrorOutcome {
        if self.is_stale(tick) {
            return MirrorOutcome::Stale;
        }
        if self.desynced {
            return MirrorOutcome::AwaitingResync;
        }

        let mut next = self.state.clone();
        match apply_patch(&mut next, patches) {
            Ok(()) => {
                self.state = next;
                self.last_applied = Some(tick);
                MirrorOutcome::Applied { tick }
            }
            Err(e) => {
                warn!("state delta at tick {tick} failed to apply, awaiting resync: {e}");
                self.desynced = true;
                MirrorOutcome::AwaitingResync
            }
        }
    }

    fn is_stale(&self, tick: u64) -> bool {
        matches!(self.last_applied, Some(applied) if tick <= applied)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::patch::PathSegment;
    use serde_json::json;

    fn replace(key: &str, value: Value) -> PatchOp {
        PatchOp::Replace {
            path: vec![PathSegment::key(key)],
            value,
        }
    }

    #[test]
    fn test_full_state_replaces_mirror() {
        let mut mirror = StateMirror::new();
        let outcome = mirror.apply_full(json!({"x": 0, "y": 0}), 0);

        assert_eq!(outcome, MirrorOutcome::Applied { tick: 0 });
        assert_eq!(mirror.state(), &json!({"x": 0, "y": 0}));
        assert_eq!(mirror.last_applied(), Some(0));
    }

    #[test]
    fn test_delta_applies_and_acknowledges() {
        let mut mirror = StateMirror::new();
        mirror.apply_full(json!({"x": 0}), 0);

        let outcome = mirror.apply_delta(&[replace("x", json!(1))], 500);

        assert_eq!(outcome, MirrorOutcome::Applied { tick: 500 });
        assert_eq!(mirror.state(), &json!({"x": 1}));
    }

    #[test]
    fn test_stale_updates_are_dropped() {
        let mut mirror = StateMirror::new();
        mirror.apply_full(json!({"x": 5}), 1000);

        assert_eq!(
            mirror.apply_delta(&[replace("x", json!(0))], 500),
            MirrorOutcome::Stale
        );
        assert_eq!(mirror.apply_full(json!({"x": 0}), 1000), MirrorOutcome::Stale);
        assert_eq!(mirror.state(), &json!({"x": 5}));
    }

    #[test]
    fn test_failed_delta_keeps_previous_state() {
        let mut mirror = StateMirror::new();
        mirror.apply_full(json!({"x": 0}), 0);

        // Parent `ghost` does not exist; nothing from the list may stick.
        let patches = vec![
            replace("x", json!(7)),
            PatchOp::Add {
                path: vec![PathSegment::key("ghost"), PathSegment::key("child")],
                value: json!(1),
            },
        ];
        let outcome = mirror.apply_delta(&patches, 500);

        assert_eq!(outcome, MirrorOutcome::AwaitingResync);
        assert_eq!(mirror.state(), &json!({"x": 0}));
        assert!(mirror.is_desynced());
    }

    #[test]
    fn test_desynced_mirror_ignores_deltas_until_full_state() {
        let mut mirror = StateMirror::new();
        mirror.apply_full(json!({"x": 0}), 0);
        mirror.apply_delta(
            &[PatchOp::Replace {
                path: vec![PathSegment::key("missing")],
                value: json!(1),
            }],
            500,
        );
        assert!(mirror.is_desynced());

        assert_eq!(
            mirror.apply_delta(&[replace("x", json!(2))], 1000),
            MirrorOutcome::AwaitingResync
        );

        let outcome = mirror.apply_full(json!({"x": 2}), 1500);
        assert_eq!(outcome, MirrorOutcome::Applied { tick: 1500 });
        assert!(!mirror.is_desynced());
        assert_eq!(mirror.state(), &json!({"x": 2}));
    }
}
