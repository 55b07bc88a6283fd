//! Bridge election and failover.
//!
//! ```text
//! Regular --(grace elapsed, no usable bridge)--> Candidate
//! Candidate --(wins)--> Bridge
//! Candidate --(loses, rejected, withdraws)--> Regular
//! Bridge --(internet lost, outranked)--> Regular
//! ```
//!
//! A round has two timed phases: a random jitter before the candidacy is
//! broadcast, then a collection window. [`decide_winner`] picks the
//! strongest router signal, ties going to the lowest node id, and refuses
//! to crown a lone candidate whose signal is below the viability threshold.

use crate::routing::RoutingTable;
use crate::scheduler::TaskHandle;
use canopy_core::config::clamp_bridge_rssi;
use canopy_core::{BridgeConfig, BridgeSelectionStrategy, ConfigError, ElectionConfig, Millis, NodeId, Rssi};
use rand::Rng;
use serde::{Deserialize, Serialize};
use std::cmp::Reverse;
use std::collections::{BTreeMap, VecDeque};
use std::fmt;
use tracing::{debug, info, warn};

/// Role of this node in gateway selection
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum BridgeRole {
    /// Ordinary mesh node
    Regular,
    /// Standing in the current election round
    Candidate,
    /// Internet gateway for the mesh
    Bridge,
}

/// A node's declared candidacy
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CandidateInfo {
    /// Standing node
    pub node_id: NodeId,
    /// Router signal strength seen by the candidate
    pub rssi: Rssi,
    /// Candidate uptime at announcement
    pub uptime_ms: u64,
    /// Free heap reported by the platform
    pub free_memory: u32,
    /// Local clock when the candidacy was received
    pub seen_at: Millis,
}

/// Why a round ended without this node (or anyone) winning
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum RejectionReason {
    /// Nobody stood
    NoCandidates,
    /// Lone candidate below the viability threshold
    InsufficientSignal {
        /// Candidate's router signal
        rssi: Rssi,
        /// Configured minimum
        threshold: Rssi,
    },
    /// Candidate could not see its router during the scan
    RouterNotVisible,
    /// Winner failed to join the router
    AssociationFailed,
}

impl fmt::Display for RejectionReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            RejectionReason::NoCandidates => write!(f, "no candidates"),
            RejectionReason::InsufficientSignal { .. } => write!(f, "insufficient signal quality"),
            RejectionReason::RouterNotVisible => write!(f, "router not visible"),
            RejectionReason::AssociationFailed => write!(f, "router association failed"),
        }
    }
}

/// Result of evaluating a round
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ElectionOutcome {
    /// Node that takes the bridge role
    Winner(NodeId),
    /// Nobody takes the role this round
    Rejected(RejectionReason),
}

/// Diagnostic log entry for one round
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ElectionRecord {
    /// Local clock when the round closed
    pub timestamp: Millis,
    /// Candidacies considered
    pub candidates: Vec<CandidateInfo>,
    /// Node that took the role, if any
    pub winner: Option<NodeId>,
    /// Human-readable outcome
    pub reason: String,
}

/// What this node knows about another bridge
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BridgeInfo {
    /// Reporting bridge
    pub node_id: NodeId,
    /// Bridge reports a working uplink
    pub internet: bool,
    /// Router signal strength reported by the bridge
    pub rssi: Rssi,
    /// Operator-assigned priority, higher wins
    pub priority: u8,
    /// Local clock of the latest report
    pub last_seen: Millis,
}

impl BridgeInfo {
    /// Reports internet and was heard from within `timeout_ms`
    pub fn is_healthy(&self, now: Millis, timeout_ms: Millis) -> bool {
        self.internet && now.saturating_sub(self.last_seen) <= timeout_ms
    }

    fn rank(&self) -> (u8, Rssi, Reverse<NodeId>) {
        (self.priority, self.rssi, Reverse(self.node_id))
    }
}

/// Effect of a status report on the known-bridge set
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BridgeUpdate {
    /// Bridge was not known before
    pub is_new: bool,
    /// Reported internet flag differs from what was known
    pub internet_changed: bool,
}

/// Local bridge bookkeeping
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BridgeState {
    /// Current role
    pub role: BridgeRole,
    /// Uplink is working
    pub internet_reachable: bool,
    /// Advertised priority
    pub priority: u8,
    /// Last measured signal strength of our router
    pub router_rssi: Rssi,
    /// When the role last flipped between bridge and regular
    pub last_role_change: Option<Millis>,
}

/// Timed phase of the current round
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ElectionPhase {
    /// No round in progress
    Idle,
    /// Waiting out the random delay before announcing
    Jitter,
    /// Collecting candidacies until the deadline
    Collecting {
        /// Deadline for accepting candidacies
        until: Millis,
    },
}

/// Pick the round winner: strongest signal, then lowest node id.
pub fn decide_winner(candidates: &[CandidateInfo], minimum_rssi: Rssi) -> ElectionOutcome {
    match candidates {
        [] => ElectionOutcome::Rejected(RejectionReason::NoCandidates),
        [only] if only.rssi < minimum_rssi => {
            ElectionOutcome::Rejected(RejectionReason::InsufficientSignal {
                rssi: only.rssi,
                threshold: minimum_rssi,
            })
        }
        _ => candidates
            .iter()
            .max_by_key(|c| (c.rssi, Reverse(c.node_id)))
            .map(|c| ElectionOutcome::Winner(c.node_id))
            .unwrap_or(ElectionOutcome::Rejected(RejectionReason::NoCandidates)),
    }
}

/// Bridge election state machine and known-bridge registry
#[derive(Debug)]
pub struct BridgeElection {
    node_id: NodeId,
    election: ElectionConfig,
    bridge: BridgeConfig,
    state: BridgeState,
    phase: ElectionPhase,
    phase_task: Option<TaskHandle>,
    candidates: BTreeMap<NodeId, CandidateInfo>,
    known: BTreeMap<NodeId, BridgeInfo>,
    history: VecDeque<ElectionRecord>,
}

impl BridgeElection {
    /// Create a regular node's election state
    pub fn new(node_id: NodeId, mut election: ElectionConfig, bridge: BridgeConfig) -> Self {
        election.minimum_bridge_rssi = clamp_bridge_rssi(election.minimum_bridge_rssi);
        let state = BridgeState {
            role: BridgeRole::Regular,
            internet_reachable: false,
            priority: bridge.priority,
            router_rssi: canopy_core::RSSI_FLOOR,
            last_role_change: None,
        };
        Self {
            node_id,
            election,
            bridge,
            state,
            phase: ElectionPhase::Idle,
            phase_task: None,
            candidates: BTreeMap::new(),
            known: BTreeMap::new(),
            history: VecDeque::new(),
        }
    }

    /// Current bookkeeping
    pub fn state(&self) -> &BridgeState {
        &self.state
    }

    /// Current role
    pub fn role(&self) -> BridgeRole {
        self.state.role
    }

    /// Acting as bridge
    pub fn is_bridge(&self) -> bool {
        self.state.role == BridgeRole::Bridge
    }

    /// Current round phase
    pub fn phase(&self) -> ElectionPhase {
        self.phase
    }

    /// Election settings in effect
    pub fn election_config(&self) -> &ElectionConfig {
        &self.election
    }

    /// Bridge settings in effect
    pub fn bridge_config(&self) -> &BridgeConfig {
        &self.bridge
    }

    /// Whether a new round may start now.
    pub fn should_start(&self, now: Millis, uptime_ms: Millis, has_usable_bridge: bool) -> bool {
        if !self.election.enabled || self.state.role != BridgeRole::Regular {
            return false;
        }
        if self.phase != ElectionPhase::Idle || has_usable_bridge {
            return false;
        }
        if uptime_ms < self.election.startup_delay_ms {
            debug!(uptime_ms, "Election deferred, startup grace period");
            return false;
        }
        if let Some(changed) = self.state.last_role_change {
            if now.saturating_sub(changed) < self.election.role_change_cooldown_ms {
                debug!(since_ms = now - changed, "Election deferred, role change cooldown");
                return false;
            }
        }
        true
    }

    /// Enter candidacy and wait for the jitter delay
    pub fn begin_candidacy(&mut self, now: Millis) {
        let horizon = self.election.window_ms + self.election.random_delay_max_ms;
        self.candidates
            .retain(|_, c| now.saturating_sub(c.seen_at) <= horizon);
        self.state.role = BridgeRole::Candidate;
        self.phase = ElectionPhase::Jitter;
        info!(node_id = %self.node_id, "Entering bridge candidacy");
    }

    /// Random delay before the candidacy is broadcast
    pub fn jitter_delay<R: Rng + ?Sized>(&self, rng: &mut R) -> Millis {
        rng.gen_range(self.election.random_delay_min_ms..=self.election.random_delay_max_ms)
    }

    /// Remember the timer driving the current phase
    pub fn set_phase_task(&mut self, task: TaskHandle) {
        self.phase_task = Some(task);
    }

    /// Take the timer driving the current phase, for cancellation
    pub fn take_phase_task(&mut self) -> Option<TaskHandle> {
        self.phase_task.take()
    }

    /// Add our own candidacy and start collecting. Returns the window length.
    pub fn open_window(&mut self, own: CandidateInfo, now: Millis) -> Millis {
        self.candidates.insert(own.node_id, own);
        self.phase = ElectionPhase::Collecting {
            until: now + self.election.window_ms,
        };
        self.phase_task = None;
        self.election.window_ms
    }

    /// Record a candidacy heard from the mesh
    pub fn observe_candidacy(&mut self, info: CandidateInfo) {
        debug!(candidate = %info.node_id, rssi = info.rssi, "Candidacy observed");
        self.candidates.insert(info.node_id, info);
    }

    /// Close the window and decide the round.
    ///
    /// Leaves the role at `Regular`; the caller promotes when the winner is
    /// this node and the router association succeeds.
    pub fn evaluate(&mut self, now: Millis) -> ElectionOutcome {
        let horizon = self.election.window_ms + self.election.random_delay_max_ms;
        let candidates: Vec<CandidateInfo> = std::mem::take(&mut self.candidates)
            .into_values()
            .filter(|c| now.saturating_sub(c.seen_at) <= horizon)
            .collect();
        let outcome = decide_winner(&candidates, self.election.minimum_bridge_rssi);

        let (winner, reason) = match &outcome {
            ElectionOutcome::Winner(id) => {
                info!(winner = %id, candidates = candidates.len(), "Election decided");
                (Some(*id), "highest signal strength".to_string())
            }
            ElectionOutcome::Rejected(reason) => {
                warn!(%reason, candidates = candidates.len(), "Election rejected");
                (None, reason.to_string())
            }
        };
        self.push_record(ElectionRecord {
            timestamp: now,
            candidates,
            winner,
            reason,
        });

        self.state.role = BridgeRole::Regular;
        self.phase = ElectionPhase::Idle;
        self.phase_task = None;
        outcome
    }

    /// Leave the round without a result
    pub fn withdraw(&mut self, now: Millis, reason: RejectionReason) {
        warn!(node_id = %self.node_id, %reason, "Withdrawing from election");
        self.candidates.remove(&self.node_id);
        self.push_record(ElectionRecord {
            timestamp: now,
            candidates: Vec::new(),
            winner: None,
            reason: reason.to_string(),
        });
        self.state.role = BridgeRole::Regular;
        self.phase = ElectionPhase::Idle;
        self.phase_task = None;
    }

    /// Another node took over while this round was running
    pub fn abort_for(&mut self, now: Millis, winner: NodeId) {
        if self.phase == ElectionPhase::Idle {
            return;
        }
        info!(winner = %winner, "Election superseded by takeover");
        let candidates = std::mem::take(&mut self.candidates).into_values().collect();
        self.push_record(ElectionRecord {
            timestamp: now,
            candidates,
            winner: Some(winner),
            reason: "superseded by takeover".to_string(),
        });
        self.state.role = BridgeRole::Regular;
        self.phase = ElectionPhase::Idle;
        self.phase_task = None;
    }

    /// Take the bridge role
    pub fn promote(&mut self, now: Millis, router_rssi: Rssi) {
        self.state.role = BridgeRole::Bridge;
        self.state.internet_reachable = true;
        self.state.router_rssi = router_rssi;
        self.state.last_role_change = Some(now);
        self.phase = ElectionPhase::Idle;
        info!(node_id = %self.node_id, rssi = router_rssi, "Promoted to bridge");
    }

    /// Give up the bridge role
    pub fn demote(&mut self, now: Millis, reason: &str) {
        self.state.role = BridgeRole::Regular;
        self.state.internet_reachable = false;
        self.state.last_role_change = Some(now);
        info!(node_id = %self.node_id, reason, "Bridge role released");
    }

    /// Update the uplink flag
    pub fn set_internet(&mut self, reachable: bool) {
        self.state.internet_reachable = reachable;
    }

    /// Update the measured router signal
    pub fn set_router_rssi(&mut self, rssi: Rssi) {
        self.state.router_rssi = rssi;
    }

    /// Store a status report from another bridge.
    ///
    /// Returns `None` when the report was ignored because the registry is
    /// full of bridges with a better signal.
    pub fn record_bridge(&mut self, info: BridgeInfo, now: Millis) -> Option<BridgeUpdate> {
        if info.node_id == self.node_id {
            return None;
        }
        if let Some(existing) = self.known.get_mut(&info.node_id) {
            let internet_changed = existing.internet != info.internet;
            *existing = info;
            return Some(BridgeUpdate {
                is_new: false,
                internet_changed,
            });
        }

        if self.known.len() >= self.bridge.max_known_bridges {
            self.expire(now);
        }
        if self.known.len() >= self.bridge.max_known_bridges {
            let worst = self
                .known
                .values()
                .min_by_key(|b| (b.rssi, Reverse(b.node_id)))
                .map(|b| (b.node_id, b.rssi));
            match worst {
                Some((id, rssi)) if rssi < info.rssi => {
                    debug!(evicted = %id, "Known-bridge registry full, evicting weakest");
                    self.known.remove(&id);
                }
                _ => return None,
            }
        }

        debug!(bridge = %info.node_id, internet = info.internet, "New bridge registered");
        let internet_changed = info.internet;
        self.known.insert(info.node_id, info);
        Some(BridgeUpdate {
            is_new: true,
            internet_changed,
        })
    }

    /// Forget bridges not heard from within the timeout
    pub fn expire(&mut self, now: Millis) -> Vec<NodeId> {
        let timeout = self.bridge.timeout_ms;
        let stale: Vec<NodeId> = self
            .known
            .values()
            .filter(|b| now.saturating_sub(b.last_seen) > timeout)
            .map(|b| b.node_id)
            .collect();
        for id in &stale {
            self.known.remove(id);
            info!(bridge = %id, "Bridge expired");
        }
        stale
    }

    /// Every bridge heard from, healthy or not
    pub fn known_bridges(&self) -> Vec<BridgeInfo> {
        self.known.values().cloned().collect()
    }

    /// Info about one known bridge
    pub fn bridge(&self, node: NodeId) -> Option<&BridgeInfo> {
        self.known.get(&node)
    }

    fn own_info(&self, now: Millis) -> BridgeInfo {
        BridgeInfo {
            node_id: self.node_id,
            internet: self.state.internet_reachable,
            rssi: self.state.router_rssi,
            priority: self.state.priority,
            last_seen: now,
        }
    }

    /// Healthy bridges reachable through `routing`, self included when
    /// acting as bridge, with their hop counts.
    pub fn usable_bridges(&self, now: Millis, routing: &RoutingTable) -> Vec<(BridgeInfo, u32)> {
        let mut usable: Vec<(BridgeInfo, u32)> = self
            .known
            .values()
            .filter(|b| b.is_healthy(now, self.bridge.timeout_ms))
            .filter_map(|b| routing.hop_count(b.node_id).map(|hops| (b.clone(), hops)))
            .collect();
        if self.is_bridge() && self.state.internet_reachable {
            usable.push((self.own_info(now), 0));
        }
        usable
    }

    /// Bridge this node should send gateway traffic to
    pub fn recommended(&self, now: Millis, routing: &RoutingTable) -> Option<NodeId> {
        let usable = self.usable_bridges(now, routing);
        let best = match self.bridge.strategy {
            BridgeSelectionStrategy::PriorityBased => usable
                .iter()
                .max_by_key(|(b, hops)| (b.priority, Reverse(*hops), Reverse(b.node_id))),
            BridgeSelectionStrategy::BestSignal => usable
                .iter()
                .max_by_key(|(b, _)| (b.rssi, Reverse(b.node_id))),
            BridgeSelectionStrategy::Nearest => {
                usable.iter().min_by_key(|(b, hops)| (*hops, b.node_id))
            }
        };
        best.map(|(b, _)| b.node_id)
    }

    /// Whether this bridge should step down in favour of `other`.
    pub fn should_yield_to(&self, other: &BridgeInfo) -> bool {
        if !self.is_bridge() || self.bridge.multi_bridge || !other.internet {
            return false;
        }
        other.rank() > self.own_info(other.last_seen).rank()
    }

    /// Rounds in chronological order
    pub fn history(&self) -> Vec<ElectionRecord> {
        self.history.iter().cloned().collect()
    }

    fn push_record(&mut self, record: ElectionRecord) {
        while self.history.len() >= self.election.history_len.max(1) {
            self.history.pop_front();
        }
        self.history.push_back(record);
    }

    /// Allow several simultaneous bridges
    pub fn set_multi_bridge(&mut self, enabled: bool) {
        self.bridge.multi_bridge = enabled;
    }

    /// Change the recommendation policy
    pub fn set_strategy(&mut self, strategy: BridgeSelectionStrategy) {
        self.bridge.strategy = strategy;
    }

    /// Change the lone-candidate threshold; returns the clamped value
    pub fn set_minimum_rssi(&mut self, rssi: Rssi) -> Rssi {
        self.election.minimum_bridge_rssi = clamp_bridge_rssi(rssi);
        self.election.minimum_bridge_rssi
    }

    /// Change the startup grace period
    pub fn set_startup_delay(&mut self, delay_ms: Millis) {
        self.election.startup_delay_ms = delay_ms;
    }

    /// Change the candidacy jitter range
    pub fn set_random_delay(&mut self, min_ms: Millis, max_ms: Millis) -> Result<(), ConfigError> {
        if min_ms > max_ms {
            return Err(ConfigError::InvertedDelayRange { min_ms, max_ms });
        }
        self.election.random_delay_min_ms = min_ms;
        self.election.random_delay_max_ms = max_ms;
        Ok(())
    }

    /// Change the advertised bridge priority
    pub fn set_priority(&mut self, priority: u8) {
        self.state.priority = priority;
        self.bridge.priority = priority;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::protocol::Subtree;
    use crate::topology::TopologyTree;
    use rand::rngs::StdRng;
    use rand::SeedableRng;

    fn candidate(id: u32, rssi: Rssi) -> CandidateInfo {
        CandidateInfo {
            node_id: NodeId(id),
            rssi,
            uptime_ms: 120_000,
            free_memory: 40_000,
            seen_at: 0,
        }
    }

    fn bridge_info(id: u32, rssi: Rssi, priority: u8) -> BridgeInfo {
        BridgeInfo {
            node_id: NodeId(id),
            internet: true,
            rssi,
            priority,
            last_seen: 0,
        }
    }

    fn create_test_election() -> BridgeElection {
        BridgeElection::new(NodeId(1), ElectionConfig::default(), BridgeConfig::default())
    }

    /// Node 1 with neighbours 2 and 3, and 4 behind 3.
    fn create_test_routing() -> RoutingTable {
        let mut tree = TopologyTree::new(NodeId(1), false);
        tree.update_neighbor(Subtree::leaf(NodeId(2)));
        tree.update_neighbor(Subtree {
            node_id: NodeId(3),
            root: false,
            subs: vec![Subtree::leaf(NodeId(4))],
        });
        let mut routing = RoutingTable::new(NodeId(1));
        routing.recompute(&tree);
        routing
    }

    #[test]
    fn test_equal_signal_goes_to_lowest_id() {
        let outcome = decide_winner(&[candidate(9, -60), candidate(4, -60), candidate(7, -70)], -80);
        assert_eq!(outcome, ElectionOutcome::Winner(NodeId(4)));
    }

    #[test]
    fn test_strongest_signal_wins() {
        let outcome = decide_winner(&[candidate(2, -75), candidate(8, -55)], -80);
        assert_eq!(outcome, ElectionOutcome::Winner(NodeId(8)));
    }

    #[test]
    fn test_lone_weak_candidate_rejected() {
        let outcome = decide_winner(&[candidate(3, -87)], -80);
        match outcome {
            ElectionOutcome::Rejected(reason) => {
                assert_eq!(reason.to_string(), "insufficient signal quality");
            }
            other => panic!("expected rejection, got {other:?}"),
        }
        assert_eq!(
            decide_winner(&[candidate(3, -70)], -80),
            ElectionOutcome::Winner(NodeId(3))
        );
    }

    #[test]
    fn test_weak_candidates_win_when_contested() {
        let outcome = decide_winner(&[candidate(3, -90), candidate(5, -88)], -80);
        assert_eq!(outcome, ElectionOutcome::Winner(NodeId(5)));
    }

    #[test]
    fn test_round_records_history() {
        let mut election = create_test_election();
        election.begin_candidacy(0);
        assert_eq!(election.role(), BridgeRole::Candidate);

        election.open_window(candidate(1, -87), 2_000);
        let outcome = election.evaluate(7_000);
        assert!(matches!(outcome, ElectionOutcome::Rejected(_)));
        assert_eq!(election.role(), BridgeRole::Regular);
        assert_eq!(election.phase(), ElectionPhase::Idle);

        let history = election.history();
        assert_eq!(history.len(), 1);
        assert_eq!(history[0].reason, "insufficient signal quality");
        assert_eq!(history[0].winner, None);
    }

    #[test]
    fn test_history_is_bounded() {
        let mut election = create_test_election();
        for round in 0..15u64 {
            election.begin_candidacy(round * 10_000);
            election.withdraw(round * 10_000, RejectionReason::RouterNotVisible);
        }
        let history = election.history();
        assert_eq!(history.len(), 10);
        assert_eq!(history[0].timestamp, 50_000);
    }

    #[test]
    fn test_start_conditions() {
        let mut election = create_test_election();
        assert!(!election.should_start(30_000, 30_000, false));
        assert!(election.should_start(61_000, 61_000, false));
        assert!(!election.should_start(61_000, 61_000, true));

        election.promote(61_000, -60);
        election.demote(70_000, "internet lost");
        // Cooldown since the last role change
        assert!(!election.should_start(100_000, 100_000, false));
        assert!(election.should_start(131_000, 131_000, false));
    }

    #[test]
    fn test_jitter_within_range() {
        let election = create_test_election();
        let mut rng = StdRng::seed_from_u64(7);
        for _ in 0..100 {
            let delay = election.jitter_delay(&mut rng);
            assert!((1000..=3000).contains(&delay));
        }
    }

    #[test]
    fn test_set_random_delay_rejects_inverted_range() {
        let mut election = create_test_election();
        assert!(election.set_random_delay(5000, 1000).is_err());
        assert!(election.set_random_delay(500, 500).is_ok());
        assert_eq!(election.set_minimum_rssi(-120), -100);
    }

    #[test]
    fn test_recommendation_strategies() {
        let routing = create_test_routing();
        let mut election = create_test_election();
        election.record_bridge(bridge_info(2, -70, 5), 0);
        election.record_bridge(bridge_info(4, -50, 9), 0);

        assert_eq!(election.recommended(0, &routing), Some(NodeId(4)));
        election.set_strategy(BridgeSelectionStrategy::Nearest);
        assert_eq!(election.recommended(0, &routing), Some(NodeId(2)));
        election.set_strategy(BridgeSelectionStrategy::BestSignal);
        assert_eq!(election.recommended(0, &routing), Some(NodeId(4)));
    }

    #[test]
    fn test_unreachable_or_stale_bridge_not_usable() {
        let routing = create_test_routing();
        let mut election = create_test_election();
        election.record_bridge(bridge_info(99, -40, 9), 0);
        assert_eq!(election.recommended(0, &routing), None);

        election.record_bridge(bridge_info(2, -70, 5), 0);
        assert_eq!(election.recommended(60_000, &routing), Some(NodeId(2)));
        assert_eq!(election.recommended(60_001, &routing), None);
    }

    #[test]
    fn test_known_bridges_bounded() {
        let mut election = BridgeElection::new(
            NodeId(1),
            ElectionConfig::default(),
            BridgeConfig {
                max_known_bridges: 2,
                ..BridgeConfig::default()
            },
        );
        election.record_bridge(bridge_info(2, -70, 5), 0);
        election.record_bridge(bridge_info(3, -80, 5), 0);

        // Weaker than everything known: ignored
        assert!(election.record_bridge(bridge_info(4, -90, 5), 0).is_none());
        // Stronger: evicts the weakest
        let update = election.record_bridge(bridge_info(5, -60, 5), 0).unwrap();
        assert!(update.is_new);
        let ids: Vec<NodeId> = election.known_bridges().iter().map(|b| b.node_id).collect();
        assert_eq!(ids, vec![NodeId(2), NodeId(5)]);

        // Stale entries are expired before anything is evicted
        let mut fresh = bridge_info(6, -95, 5);
        fresh.last_seen = 70_000;
        assert!(election.record_bridge(fresh, 70_000).unwrap().is_new);
        let ids: Vec<NodeId> = election.known_bridges().iter().map(|b| b.node_id).collect();
        assert_eq!(ids, vec![NodeId(6)]);
    }

    #[test]
    fn test_internet_flag_change_detected() {
        let mut election = create_test_election();
        let first = election.record_bridge(bridge_info(2, -70, 5), 0).unwrap();
        assert!(first.is_new && first.internet_changed);

        let mut lost = bridge_info(2, -70, 5);
        lost.internet = false;
        let update = election.record_bridge(lost, 1000).unwrap();
        assert!(!update.is_new && update.internet_changed);
    }

    #[test]
    fn test_yield_to_higher_priority_bridge() {
        let mut election = create_test_election();
        election.promote(0, -60);

        assert!(election.should_yield_to(&bridge_info(7, -80, 8)));
        assert!(!election.should_yield_to(&bridge_info(7, -80, 2)));
        // Equal priority and signal: lower id keeps the role
        assert!(!election.should_yield_to(&bridge_info(7, -60, 5)));

        election.set_multi_bridge(true);
        assert!(!election.should_yield_to(&bridge_info(7, -80, 8)));
    }
}
