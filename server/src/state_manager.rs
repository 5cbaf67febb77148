//! Per-client diff engines.
//!
//! `ClientStateManager` tracks one client's last-sent projection and turns
//! canonical-state changes into patch lists. `UnreliableClientStateManager`
//! layers unordered-transport semantics on top: unacknowledged patches
//! accumulate and are retransmitted cumulatively, and an acknowledgment
//! timeout falls back to full-state resynchronization.

use std::collections::BTreeMap;

use log::warn;
use serde_json::Value;
use shared::patch::{diff, squash, PatchOp};

use crate::projection::ProjectionTable;

/// What the sync pass decided to transmit to one client this tick.
#[derive(Debug, Clone, PartialEq)]
pub enum SyncOutput {
    FullState(Value),
    Delta(Vec<PatchOp>),
}

/// Diff engine for a single client.
///
/// Full-state policy: a full state is sent only on the first sync after
/// attach; every later sync emits a delta unless the caller forces a resync.
pub struct ClientStateManager {
    projection: ProjectionTable,
    last_sent: Option<Value>,
    needs_full_state: bool,
}

impl ClientStateManager {
    pub fn new(projection: ProjectionTable) -> Self {
        Self {
            projection,
            last_sent: None,
            needs_full_state: true,
        }
    }

    /// Computes the initial projection and records it as last-sent. The first
    /// sync after this always emits a full state.
    pub fn attach(&mut self, canonical: &Value) {
        self.last_sent = Some(self.projection.project(canonical));
        self.needs_full_state = true;
    }

    pub fn needs_full_state(&self) -> bool {
        self.needs_full_state
    }

    /// Recomputes the projection and diffs it against the last-sent view.
    /// A diff failure (structurally incompatible projection) falls back to a
    /// full-state send; per-client sync corruption never takes the session
    /// down.
    pub fn sync(&mut self, canonical: &Value, force_full: bool) -> SyncOutput {
        let projected = self.projection.project(canonical);

        if self.needs_full_state || force_full {
            self.needs_full_state = false;
            self.last_sent = Some(projected.clone());
            return SyncOutput::FullState(projected);
        }

        let Some(previous) = self.last_sent.as_ref() else {
            self.last_sent = Some(projected.clone());
            return SyncOutput::FullState(projected);
        };

        let output = match diff(previous, &projected) {
            Ok(patches) => SyncOutput::Delta(patches),
            Err(e) => {
                warn!("projection diff failed, falling back to a full state: {e}");
                SyncOutput::FullState(projected.clone())
            }
        };
        self.last_sent = Some(projected);
        output
    }
}

/// Diff engine for a client on an unordered, lossy channel.
///
/// Reliability is reconstructed at the protocol layer: every delta carries the
/// squashed concatenation of all unacknowledged patches (so one received
/// packet heals any number of lost predecessors), and going longer than the
/// ack timeout without an acknowledgment abandons delta history entirely.
pub struct UnreliableClientStateManager {
    inner: ClientStateManager,
    ack_timeout: u64,
    last_acknowledged: u64,
    pending: BTreeMap<u64, Vec<PatchOp>>,
}

impl UnreliableClientStateManager {
    pub fn new(projection: ProjectionTable, ack_timeout: u64) -> Self {
        Self {
            inner: ClientStateManager::new(projection),
            ack_timeout,
            last_acknowledged: 0,
            pending: BTreeMap::new(),
        }
    }

    /// Attaches at join time. The timeout window is seeded with the join tick
    /// so that a client which never acknowledges anything still converges on
    /// full states instead of accumulating delta history forever.
    pub fn attach(&mut self, canonical: &Value, joined_at: u64) {
        self.inner.attach(canonical);
        self.last_acknowledged = joined_at;
        self.pending.clear();
    }

    pub fn last_acknowledged(&self) -> u64 {
        self.last_acknowledged
    }

    /// Tick times of every sent-but-unacknowledged delta, ascending.
    pub fn pending_ticks(&self) -> Vec<u64> {
        self.pending.keys().copied().collect()
    }

    /// Records that the client applied state up to `tick` and retires the
    /// covered delta history.
    pub fn acknowledge(&mut self, tick: u64) {
        self.last_acknowledged = self.last_acknowledged.max(tick);
        self.pending = self.pending.split_off(&tick.saturating_add(1));
    }

    pub fn should_send_full_state(&self, tick: u64) -> bool {
        self.inner.needs_full_state() || self.ack_timed_out(tick)
    }

    fn ack_timed_out(&self, tick: u64) -> bool {
        tick.saturating_sub(self.last_acknowledged) > self.ack_timeout
    }

    pub fn sync(&mut self, tick: u64, canonical: &Value) -> SyncOutput {
        match self.inner.sync(canonical, self.ack_timed_out(tick)) {
            SyncOutput::FullState(state) => {
                // Nothing to replay against a fresh snapshot.
                self.pending.clear();
                SyncOutput::FullState(state)
            }
            SyncOutput::Delta(patches) => {
                if !patches.is_empty() {
                    self.pending.insert(tick, patches);
                }
                let cumulative: Vec<PatchOp> =
                    self.pending.values().flatten().cloned().collect();
                SyncOutput::Delta(squash(&cumulative))
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use shared::patch::{PatchOp, PathSegment};

    const ACK_TIMEOUT: u64 = 1000;

    fn manager() -> UnreliableClientStateManager {
        UnreliableClientStateManager::new(ProjectionTable::include_all(), ACK_TIMEOUT)
    }

    fn replace(key: &str, value: serde_json::Value) -> PatchOp {
        PatchOp::Replace {
            path: vec![PathSegment::key(key)],
            value,
        }
    }

    #[test]
    fn test_first_sync_sends_full_state() {
        let mut manager = manager();
        manager.attach(&json!({"x": 0}), 0);

        let output = manager.sync(0, &json!({"x": 0}));
        assert_eq!(output, SyncOutput::FullState(json!({"x": 0})));
    }

    #[test]
    fn test_subsequent_syncs_send_deltas() {
        let mut manager = manager();
        manager.attach(&json!({"x": 0}), 0);
        manager.sync(0, &json!({"x": 0}));
        manager.acknowledge(0);

        let output = manager.sync(500, &json!({"x": 1}));
        assert_eq!(output, SyncOutput::Delta(vec![replace("x", json!(1))]));
    }

    #[test]
    fn test_unchanged_state_sends_empty_delta_without_storing() {
        let mut manager = manager();
        manager.attach(&json!({"x": 0}), 0);
        manager.sync(0, &json!({"x": 0}));
        manager.acknowledge(0);

        let output = manager.sync(500, &json!({"x": 0}));
        assert_eq!(output, SyncOutput::Delta(Vec::new()));
        assert!(manager.pending_ticks().is_empty());
    }

    #[test]
    fn test_unacknowledged_deltas_accumulate() {
        let mut manager = manager();
        manager.attach(&json!({"x": 0, "y": 0}), 0);
        manager.sync(0, &json!({"x": 0, "y": 0}));

        manager.sync(500, &json!({"x": 1, "y": 0}));
        let output = manager.sync(1000, &json!({"x": 1, "y": 2}));

        // The wire patch covers both unacknowledged ticks.
        assert_eq!(
            output,
            SyncOutput::Delta(vec![replace("x", json!(1)), replace("y", json!(2))])
        );
        assert_eq!(manager.pending_ticks(), vec![500, 1000]);
    }

    #[test]
    fn test_cumulative_delta_squashes_same_path() {
        let mut manager = manager();
        manager.attach(&json!({"x": 0, "y": 0}), 0);
        manager.sync(0, &json!({"x": 0, "y": 0}));

        manager.sync(500, &json!({"x": 1, "y": 0}));
        let output = manager.sync(1000, &json!({"x": 2, "y": 0}));

        // Last write wins on the same path.
        assert_eq!(output, SyncOutput::Delta(vec![replace("x", json!(2))]));
    }

    #[test]
    fn test_acknowledge_purges_covered_history() {
        let mut manager = manager();
        manager.attach(&json!({"x": 0}), 0);
        manager.sync(0, &json!({"x": 0}));
        manager.sync(500, &json!({"x": 1}));
        manager.sync(1000, &json!({"x": 2}));

        manager.acknowledge(500);

        assert_eq!(manager.last_acknowledged(), 500);
        assert_eq!(manager.pending_ticks(), vec![1000]);

        manager.acknowledge(1000);
        assert!(manager.pending_ticks().is_empty());
    }

    #[test]
    fn test_acknowledge_never_regresses() {
        let mut manager = manager();
        manager.attach(&json!({"x": 0}), 0);
        manager.acknowledge(800);
        manager.acknowledge(300);

        assert_eq!(manager.last_acknowledged(), 800);
    }

    #[test]
    fn test_ack_timeout_forces_full_state_and_clears_pending() {
        let mut manager = manager();
        manager.attach(&json!({"x": 0}), 0);
        manager.sync(0, &json!({"x": 0}));

        // Within the window (strictly): deltas.
        assert!(matches!(
            manager.sync(500, &json!({"x": 1})),
            SyncOutput::Delta(_)
        ));
        assert!(matches!(
            manager.sync(1000, &json!({"x": 2})),
            SyncOutput::Delta(_)
        ));

        // 1500ms since the last acknowledgment: resync.
        let output = manager.sync(1500, &json!({"x": 2}));
        assert_eq!(output, SyncOutput::FullState(json!({"x": 2})));
        assert!(manager.pending_ticks().is_empty());

        // Still unacknowledged: full states keep coming.
        assert!(matches!(
            manager.sync(2000, &json!({"x": 3})),
            SyncOutput::FullState(_)
        ));

        // A fresh acknowledgment restores delta streaming.
        manager.acknowledge(2000);
        assert!(matches!(
            manager.sync(2500, &json!({"x": 4})),
            SyncOutput::Delta(_)
        ));
    }

    #[test]
    fn test_late_joiner_window_starts_at_join() {
        let mut manager = manager();
        manager.attach(&json!({"x": 0}), 50_000);
        manager.sync(50_000, &json!({"x": 0}));

        assert!(matches!(
            manager.sync(50_500, &json!({"x": 1})),
            SyncOutput::Delta(_)
        ));
        assert!(matches!(
            manager.sync(51_500, &json!({"x": 2})),
            SyncOutput::FullState(_)
        ));
    }

    #[test]
    fn test_incompatible_projection_falls_back_to_full_state() {
        let mut manager = manager();
        manager.attach(&json!({"x": 0}), 0);
        manager.sync(0, &json!({"x": 0}));
        manager.acknowledge(0);
        manager.sync(500, &json!({"x": 1}));

        // The canonical root degenerates to a scalar; diffing is impossible
        // and the manager must recover with a full state, not panic.
        let output = manager.sync(900, &json!(42));
        assert_eq!(output, SyncOutput::FullState(json!(42)));
        assert!(manager.pending_ticks().is_empty());
    }

    #[test]
    fn test_base_manager_full_state_only_on_first_send() {
        let mut manager = ClientStateManager::new(ProjectionTable::include_all());
        manager.attach(&json!({"x": 0}));

        assert!(matches!(
            manager.sync(&json!({"x": 0}), false),
            SyncOutput::FullState(_)
        ));
        assert!(matches!(
            manager.sync(&json!({"x": 1}), false),
            SyncOutput::Delta(_)
        ));
        assert!(matches!(
            manager.sync(&json!({"x": 2}), false),
            SyncOutput::Delta(_)
        ));

        // A forced resync does not change the policy afterwards.
        assert!(matches!(
            manager.sync(&json!({"x": 3}), true),
            SyncOutput::FullState(_)
        ));
        assert!(matches!(
            manager.sync(&json!({"x": 4}), false),
            SyncOutput::Delta(_)
        ));
    }

    #[test]
    fn test_projection_scopes_the_delta() {
        let projection = ProjectionTable::include_all().exclude(["secret"]);
        let mut manager = UnreliableClientStateManager::new(projection, ACK_TIMEOUT);
        manager.attach(&json!({"x": 0, "secret": 1}), 0);
        manager.sync(0, &json!({"x": 0, "secret": 1}));
        manager.acknowledge(0);

        // Only the secret changed; the client's delta is empty.
        let output = manager.sync(500, &json!({"x": 0, "secret": 2}));
        assert_eq!(output, SyncOutput::Delta(Vec::new()));
    }
}
