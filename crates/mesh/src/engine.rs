//! Mesh engine - the context object that owns every subsystem.
//!
//! One engine per node. It is driven from a single thread: the platform
//! calls the `on_*` entry points when the transport or radio reports
//! something, and calls [`MeshEngine::tick`] to run deferred tasks that
//! have come due. Application-facing notifications are collected as
//! [`MeshEvent`]s and handed out by [`MeshEngine::drain_events`].

use crate::connection::{ConnId, ConnectionManager, LinkLoss};
use crate::election::{
    BridgeElection, BridgeInfo, BridgeRole, CandidateInfo, ElectionOutcome, ElectionPhase,
    ElectionRecord, RejectionReason,
};
use crate::error::{MeshError, MeshResult};
use crate::events::{DropReason, MeshEvent};
use crate::protocol::{Codec, Frame, JsonCodec, Subtree};
use crate::queue::{DeliveryScope, MessageQueue, Priority, QueueState, QueuedMessage};
use crate::routing::{RouteEntry, RoutingTable};
use crate::scheduler::{Scheduler, Task, TaskHandle};
use crate::topology::{link_to_cut, TopologyTree};
use crate::transport::{LinkHandle, Radio, Transport};
use canopy_core::{BridgeSelectionStrategy, MeshConfig, Millis, NodeId, Rssi};
use rand::rngs::StdRng;
use rand::SeedableRng;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeSet, VecDeque};
use tracing::{debug, error, info, warn};

/// Channel used when auto-detection finds no mesh.
const FALLBACK_CHANNEL: u8 = 1;

/// Point-in-time snapshot for diagnostics
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MeshStatus {
    /// Local node
    pub node_id: NodeId,
    /// Current bridge role
    pub role: BridgeRole,
    /// Radio channel in use
    pub channel: u8,
    /// Handshaken direct links
    pub connections: usize,
    /// Nodes in the topology view, self included
    pub mesh_size: usize,
    /// Bridge gateway traffic currently goes to
    pub bridge: Option<NodeId>,
    /// Offline queue depth
    pub queue_len: usize,
    /// Offline queue fill level
    pub queue_state: QueueState,
    /// Engine has not been stopped
    pub running: bool,
}

/// How [`MeshEngine::send_to_gateway`] disposed of a payload
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum GatewaySend {
    /// Handed to the link towards this bridge (or surfaced locally)
    Delivered(NodeId),
    /// Held in the offline queue under this id
    Queued(u64),
}

#[derive(Debug, Default)]
struct Timers {
    sync: Option<TaskHandle>,
    monitor: Option<TaskHandle>,
    status: Option<TaskHandle>,
}

/// Mesh coordination engine for one node.
pub struct MeshEngine<T, S, R, C = JsonCodec> {
    config: MeshConfig,
    node_id: NodeId,
    channel: u8,
    /// Channel our router was last seen on
    router_channel: u8,
    transport: T,
    scheduler: S,
    radio: R,
    codec: C,
    connections: ConnectionManager,
    topology: TopologyTree,
    routing: RoutingTable,
    election: BridgeElection,
    queue: MessageQueue,
    events: VecDeque<MeshEvent>,
    /// Peers the application has been told about
    announced: BTreeSet<NodeId>,
    timers: Timers,
    rng: StdRng,
    started_at: Millis,
    free_memory: u32,
    gateway_available: bool,
    running: bool,
}

impl<T, S, R> MeshEngine<T, S, R, JsonCodec>
where
    T: Transport,
    S: Scheduler,
    R: Radio,
{
    /// Start a node with the default JSON wire format
    pub fn init(config: MeshConfig, transport: T, scheduler: S, radio: R) -> MeshResult<Self> {
        Self::init_with_codec(config, transport, scheduler, radio, JsonCodec)
    }
}

impl<T, S, R, C> MeshEngine<T, S, R, C>
where
    T: Transport,
    S: Scheduler,
    R: Radio,
    C: Codec,
{
    /// Validate `config`, resolve the radio channel and start the
    /// periodic timers.
    pub fn init_with_codec(
        config: MeshConfig,
        transport: T,
        mut scheduler: S,
        mut radio: R,
        codec: C,
    ) -> MeshResult<Self> {
        config.validate()?;

        let node_id = config.node_id;
        let channel = resolve_channel(&config, &mut radio);
        let rng = match config.election.rng_seed {
            Some(seed) => StdRng::seed_from_u64(seed),
            None => StdRng::from_entropy(),
        };
        let started_at = scheduler.now_ms();

        let mut timers = Timers {
            sync: Some(scheduler.schedule(config.connection.sync_interval_ms, Task::SyncTick)),
            ..Timers::default()
        };
        if config.can_become_bridge() {
            timers.monitor = Some(
                scheduler.schedule(config.election.check_interval_ms, Task::BridgeMonitor),
            );
        }

        info!(
            node_id = %node_id,
            mesh_id = %config.mesh_id,
            channel,
            bridge_eligible = config.can_become_bridge(),
            "Mesh engine started"
        );

        Ok(Self {
            node_id,
            channel,
            router_channel: config.router.as_ref().map(|r| r.channel).unwrap_or(0),
            transport,
            scheduler,
            radio,
            codec,
            connections: ConnectionManager::new(config.connection.clone()),
            topology: TopologyTree::new(node_id, config.root),
            routing: RoutingTable::new(node_id),
            election: BridgeElection::new(node_id, config.election.clone(), config.bridge.clone()),
            queue: MessageQueue::new(config.queue.capacity)
                .with_max_attempts(config.queue.max_attempts),
            events: VecDeque::new(),
            announced: BTreeSet::new(),
            timers,
            rng,
            started_at,
            free_memory: 0,
            gateway_available: false,
            running: true,
            config,
        })
    }

    /// Close every link, cancel every timer and give up the bridge role.
    ///
    /// Cleanup tasks already scheduled still run on later ticks.
    pub fn stop(&mut self) {
        if !self.running {
            return;
        }
        for task in [
            self.timers.sync.take(),
            self.timers.monitor.take(),
            self.timers.status.take(),
            self.election.take_phase_task(),
        ]
        .into_iter()
        .flatten()
        {
            self.scheduler.cancel(task);
        }
        if self.election.is_bridge() {
            let now = self.scheduler.now_ms();
            self.election.demote(now, "engine stopped");
            self.radio.disassociate();
        }
        for conn in self.connections.ids() {
            self.connections
                .close(conn, DropReason::Closed, &mut self.transport, &mut self.scheduler);
        }
        self.running = false;
        info!(node_id = %self.node_id, "Mesh engine stopped");
    }

    /// Run every task that has come due. Returns how many ran.
    pub fn tick(&mut self) -> usize {
        let mut ran = 0;
        while let Some((_, task)) = self.scheduler.pop_due() {
            self.run_task(task);
            ran += 1;
        }
        ran
    }

    /// Execute one deferred task. Exposed for schedulers that dispatch
    /// tasks themselves instead of going through [`MeshEngine::tick`].
    pub fn run_task(&mut self, task: Task) {
        match task {
            Task::ReleaseLink(link) => self.connections.release_link(link, &mut self.transport),
            Task::DestroyConnection(conn) => {
                if let Err(e) = self.connections.destroy(conn, &mut self.transport) {
                    warn!(conn = %conn, error = %e, "Deferred destroy skipped");
                }
            }
            Task::NotifyDropped { node_id, reason } => self.notify_dropped(node_id, reason),
            _ if !self.running => debug!(?task, "Engine stopped, task ignored"),
            Task::RetryConnect(conn) => {
                self.connections
                    .retry(conn, &mut self.transport, &mut self.scheduler)
            }
            Task::SyncTick => self.sync_tick(),
            Task::BridgeMonitor => self.bridge_monitor(),
            Task::ElectionJitter => self.start_collecting(),
            Task::EvaluateElection => self.evaluate_election(),
            Task::BridgeStatusBroadcast => self.status_tick(),
            Task::AnnounceBridgeTo(node) => self.announce_bridge_to(node),
        }
    }

    // ---- transport entry points ----

    /// The transport accepted a link a peer opened
    pub fn on_incoming(&mut self, link: LinkHandle) {
        if !self.running || self.connections.live_count() >= self.config.max_connections {
            warn!(%link, limit = self.config.max_connections, "Rejecting inbound link");
            self.connections
                .reject(link, &mut self.transport, &mut self.scheduler);
            return;
        }
        let now = self.scheduler.now_ms();
        let conn = self.connections.accept(link, now);
        self.send_node_sync(conn);
    }

    /// An outbound link finished connecting
    pub fn on_connected(&mut self, link: LinkHandle) {
        let Some(conn) = self.connections.begin_callback(link) else {
            debug!(%link, "Connect for unknown link");
            return;
        };
        let now = self.scheduler.now_ms();
        if self
            .connections
            .on_connected(conn, &mut self.transport, now)
        {
            self.send_node_sync(conn);
        }
        self.connections.end_callback();
    }

    /// The transport reported an error on a link
    pub fn on_error(&mut self, link: LinkHandle, code: i32) {
        let Some(conn) = self.connections.begin_callback(link) else {
            debug!(%link, code, "Error for unknown link");
            return;
        };
        if let Some(loss) = self.connections.on_error(conn, code, &mut self.scheduler) {
            self.handle_link_loss(loss);
        }
        self.connections.end_callback();
    }

    /// The transport reported a link closed
    pub fn on_closed(&mut self, link: LinkHandle) {
        let Some(conn) = self.connections.begin_callback(link) else {
            debug!(%link, "Close for unknown link");
            return;
        };
        if let Some(loss) = self.connections.on_closed(conn, &mut self.scheduler) {
            self.handle_link_loss(loss);
        }
        self.connections.end_callback();
    }

    /// Bytes arrived on a link. Malformed frames are dropped.
    pub fn on_data(&mut self, link: LinkHandle, bytes: &[u8]) {
        let Some(conn) = self.connections.begin_callback(link) else {
            debug!(%link, len = bytes.len(), "Data for unknown link");
            return;
        };
        let now = self.scheduler.now_ms();
        self.connections.touch(conn, now);
        match self.codec.decode(bytes) {
            Ok(frame) => self.handle_frame(conn, frame),
            Err(e) => warn!(conn = %conn, error = %e, "Dropping malformed frame"),
        }
        self.connections.end_callback();
    }

    // ---- radio entry points ----

    /// Station link to the router came up
    pub fn on_router_connected(&mut self, rssi: Rssi) {
        self.election.set_router_rssi(rssi);
        if self.election.is_bridge() && !self.election.state().internet_reachable {
            info!(rssi, "Router connection restored");
            self.election.set_internet(true);
            self.events.push_back(MeshEvent::BridgeStatusChanged {
                bridge: self.node_id,
                has_internet: true,
            });
            self.broadcast_bridge_status();
            self.refresh_gateway(true);
        }
    }

    /// Station link to the router went down
    pub fn on_router_disconnected(&mut self) {
        if self.election.is_bridge() {
            warn!(node_id = %self.node_id, "Router connection lost");
            self.election.set_internet(false);
            self.step_down("internet lost");
        }
    }

    // ---- commands ----

    /// Open an outbound link
    pub fn dial(&mut self, address: &str) -> MeshResult<ConnId> {
        if !self.running {
            return Err(MeshError::InvalidState("engine stopped".to_string()));
        }
        if self.connections.live_count() >= self.config.max_connections {
            return Err(MeshError::ConnectionLimit {
                limit: self.config.max_connections,
            });
        }
        self.connections
            .dial(address, &mut self.transport, &mut self.scheduler)
    }

    /// Close a link from our side
    pub fn close_connection(&mut self, conn: ConnId) -> bool {
        self.close_conn(conn, DropReason::Closed)
    }

    /// Abandon a scheduled reconnect
    pub fn cancel_pending_retry(&mut self, conn: ConnId) -> bool {
        self.connections
            .cancel_pending_retry(conn, &mut self.scheduler)
    }

    /// Send a payload to one node
    pub fn send_single(&mut self, dest: NodeId, payload: Vec<u8>) -> MeshResult<()> {
        if dest == self.node_id {
            self.events.push_back(MeshEvent::Receive {
                from: self.node_id,
                payload,
            });
            return Ok(());
        }
        let frame = Frame::Single {
            from: self.node_id,
            dest,
            payload,
        };
        self.send_frame_to(dest, &frame)
    }

    /// Send a payload to every node. Returns how many neighbours it was
    /// handed to.
    pub fn send_broadcast(&mut self, payload: Vec<u8>) -> MeshResult<usize> {
        let frame = Frame::Broadcast {
            from: self.node_id,
            payload,
        };
        self.flood_frame(&frame, None)
    }

    /// Send a payload to the internet gateway, queueing it while no
    /// usable bridge is reachable.
    pub fn send_to_gateway(&mut self, payload: Vec<u8>, priority: Priority) -> MeshResult<GatewaySend> {
        if let Some(bridge) = self.recommended_bridge() {
            if bridge == self.node_id {
                self.events.push_back(MeshEvent::Uplink {
                    from: self.node_id,
                    priority,
                    payload,
                });
                return Ok(GatewaySend::Delivered(bridge));
            }
            let frame = Frame::Gateway {
                from: self.node_id,
                dest: bridge,
                priority,
                payload: payload.clone(),
            };
            match self.send_frame_to(bridge, &frame) {
                Ok(()) => return Ok(GatewaySend::Delivered(bridge)),
                Err(e) => warn!(bridge = %bridge, error = %e, "Gateway send failed, queueing"),
            }
        }
        self.enqueue_offline(payload, priority, DeliveryScope::Gateway)
            .map(GatewaySend::Queued)
    }

    /// Hold a payload until a bridge becomes available
    pub fn enqueue_offline(
        &mut self,
        payload: Vec<u8>,
        priority: Priority,
        scope: DeliveryScope,
    ) -> MeshResult<u64> {
        let now = self.scheduler.now_ms();
        let before = self.queue.state();
        let enqueued = self.queue.enqueue(payload, priority, scope, now)?;
        if let Some(evicted) = enqueued.evicted {
            self.events.push_back(MeshEvent::MessageDropped {
                id: evicted.id,
                priority: evicted.priority,
            });
        }
        self.note_queue_state(before);
        Ok(enqueued.id)
    }

    /// Allow or forbid several simultaneous bridges
    pub fn enable_multi_bridge(&mut self, enabled: bool) {
        info!(enabled, "Multi-bridge mode changed");
        self.election.set_multi_bridge(enabled);
    }

    /// Change the recommended-bridge policy
    pub fn set_bridge_selection_strategy(&mut self, strategy: BridgeSelectionStrategy) {
        info!(?strategy, "Bridge selection strategy changed");
        self.election.set_strategy(strategy);
    }

    /// Change the lone-candidate signal threshold; returns the value
    /// actually applied after clamping
    pub fn set_minimum_bridge_rssi(&mut self, rssi: Rssi) -> Rssi {
        self.election.set_minimum_rssi(rssi)
    }

    /// Change the grace period before the first election
    pub fn set_election_startup_delay(&mut self, delay_ms: Millis) {
        self.election.set_startup_delay(delay_ms);
    }

    /// Change the candidacy jitter range
    pub fn set_election_random_delay(&mut self, min_ms: Millis, max_ms: Millis) -> MeshResult<()> {
        self.election.set_random_delay(min_ms, max_ms)?;
        Ok(())
    }

    /// Change the priority this node advertises as a bridge
    pub fn set_bridge_priority(&mut self, priority: u8) {
        self.election.set_priority(priority);
    }

    /// Report free heap, advertised in candidacies
    pub fn set_free_memory(&mut self, bytes: u32) {
        self.free_memory = bytes;
    }

    /// Take the bridge role without an election
    pub fn become_bridge(&mut self) -> MeshResult<()> {
        if let Some(task) = self.election.take_phase_task() {
            self.scheduler.cancel(task);
        }
        if let Some(seen) = self.scan_for_router() {
            self.election.set_router_rssi(seen);
        }
        self.assume_bridge_role("manual promotion")
    }

    // ---- queries ----

    /// Local node id
    pub fn node_id(&self) -> NodeId {
        self.node_id
    }

    /// Radio channel in use
    pub fn channel(&self) -> u8 {
        self.channel
    }

    /// Configuration the engine was started with
    pub fn config(&self) -> &MeshConfig {
        &self.config
    }

    /// Whether [`MeshEngine::stop`] has not been called
    pub fn is_running(&self) -> bool {
        self.running
    }

    /// Every route, ordered by destination
    pub fn routing_table(&self) -> Vec<RouteEntry> {
        self.routing.routes().into_iter().cloned().collect()
    }

    /// Hops to `node`; `Some(0)` for self
    pub fn hop_count(&self, node: NodeId) -> Option<u32> {
        self.routing.hop_count(node)
    }

    /// Path from self to `node`, both ends included; empty if unreachable
    pub fn path_to_node(&self, node: NodeId) -> Vec<NodeId> {
        self.topology.path_to(node)
    }

    /// Known nodes in id order
    pub fn node_list(&self, include_self: bool) -> Vec<NodeId> {
        self.topology.node_list(include_self)
    }

    /// Topology view
    pub fn topology(&self) -> &TopologyTree {
        &self.topology
    }

    /// Connection manager, read-only
    pub fn connections(&self) -> &ConnectionManager {
        &self.connections
    }

    /// Offline queue, read-only
    pub fn queue(&self) -> &MessageQueue {
        &self.queue
    }

    /// Entries currently queued, in flush order
    pub fn queued_messages(&self) -> Vec<QueuedMessage> {
        self.queue.iter().cloned().collect()
    }

    /// Healthy, reachable bridges
    pub fn active_bridges(&self) -> Vec<BridgeInfo> {
        let now = self.scheduler.now_ms();
        self.election
            .usable_bridges(now, &self.routing)
            .into_iter()
            .map(|(info, _)| info)
            .collect()
    }

    /// Every bridge heard from recently, healthy or not
    pub fn bridges(&self) -> Vec<BridgeInfo> {
        self.election.known_bridges()
    }

    /// Bridge gateway traffic should go to under the active policy
    pub fn recommended_bridge(&self) -> Option<NodeId> {
        self.election
            .recommended(self.scheduler.now_ms(), &self.routing)
    }

    /// Recent election rounds, oldest first
    pub fn election_history(&self) -> Vec<ElectionRecord> {
        self.election.history()
    }

    /// Whether gateway traffic can leave the mesh right now
    pub fn has_internet_connection(&self) -> bool {
        self.recommended_bridge().is_some()
    }

    /// Current bridge role
    pub fn role(&self) -> BridgeRole {
        self.election.role()
    }

    /// Acting as bridge
    pub fn is_bridge(&self) -> bool {
        self.election.is_bridge()
    }

    /// Diagnostic snapshot
    pub fn status(&self) -> MeshStatus {
        MeshStatus {
            node_id: self.node_id,
            role: self.election.role(),
            channel: self.channel,
            connections: self.connections.established().len(),
            mesh_size: self.topology.len(),
            bridge: self.recommended_bridge(),
            queue_len: self.queue.len(),
            queue_state: self.queue.state(),
            running: self.running,
        }
    }

    /// Take every pending application event
    pub fn drain_events(&mut self) -> Vec<MeshEvent> {
        self.events.drain(..).collect()
    }

    /// Take the oldest pending application event
    pub fn poll_event(&mut self) -> Option<MeshEvent> {
        self.events.pop_front()
    }

    /// Scheduler, read-only
    pub fn scheduler(&self) -> &S {
        &self.scheduler
    }

    /// Scheduler, for driving its clock
    pub fn scheduler_mut(&mut self) -> &mut S {
        &mut self.scheduler
    }

    /// Transport, read-only
    pub fn transport(&self) -> &T {
        &self.transport
    }

    /// Transport, mutable
    pub fn transport_mut(&mut self) -> &mut T {
        &mut self.transport
    }

    /// Radio, mutable
    pub fn radio_mut(&mut self) -> &mut R {
        &mut self.radio
    }

    // ---- frame handling ----

    fn handle_frame(&mut self, conn: ConnId, frame: Frame) {
        if let Frame::NodeSync { from, subtree } = frame {
            if subtree.node_id != from {
                warn!(conn = %conn, from = %from, "Node sync with mismatched subtree, dropping");
                return;
            }
            self.handle_node_sync(conn, from, subtree);
            return;
        }

        let Some(peer) = self.connections.get(conn).and_then(|c| c.peer) else {
            warn!(conn = %conn, "Frame before handshake, dropping");
            return;
        };
        if frame.origin() == self.node_id {
            debug!(conn = %conn, "Own frame looped back, dropping");
            return;
        }

        if frame.is_flooded() {
            if let Err(e) = self.flood_frame(&frame, Some(conn)) {
                warn!(peer = %peer, error = %e, "Failed to forward flooded frame");
            }
            self.handle_local(frame);
            return;
        }

        match frame.destination() {
            Some(dest) if dest != self.node_id => {
                if let Err(e) = self.send_frame_to(dest, &frame) {
                    debug!(dest = %dest, error = %e, "Dropping frame with no onward route");
                }
            }
            _ => self.handle_local(frame),
        }
    }

    fn handle_node_sync(&mut self, conn: ConnId, from: NodeId, subtree: Subtree) {
        let known_peer = self.connections.get(conn).and_then(|c| c.peer);

        if from == self.node_id {
            warn!(conn = %conn, "Connected to ourselves, closing");
            self.close_conn(conn, DropReason::Closed);
            return;
        }
        if known_peer.is_some_and(|p| p != from) {
            warn!(conn = %conn, from = %from, "Peer identity changed, closing");
            self.close_conn(conn, DropReason::Closed);
            return;
        }
        let duplicate = self
            .connections
            .established()
            .iter()
            .any(|(other, peer)| *other != conn && *peer == from);
        if duplicate {
            warn!(conn = %conn, peer = %from, "Duplicate link to peer, closing");
            self.close_conn(conn, DropReason::Closed);
            return;
        }

        if !self.topology.has_neighbor(from) {
            if self.topology.contains(from) {
                warn!(conn = %conn, peer = %from, "Link would form a cycle, closing");
                self.close_conn(conn, DropReason::Closed);
                return;
            }
            for stale in self.connections.retrying_for(from) {
                self.connections
                    .cancel_pending_retry(stale, &mut self.scheduler);
            }
            self.connections.set_peer(conn, from);
            if self.announced.insert(from) {
                info!(peer = %from, conn = %conn, "New connection");
                self.events.push_back(MeshEvent::NewConnection(from));
            }
            if self.election.is_bridge() {
                self.scheduler.schedule(
                    self.election.election_config().announce_delay_ms,
                    Task::AnnounceBridgeTo(from),
                );
            }
        }

        if let Some(cycle) = self.topology.loop_through(&subtree) {
            warn!(peer = %from, ?cycle, "Announcement closes a loop");
            let far = match link_to_cut(&cycle) {
                Some((high, low)) if high == self.node_id => Some(low),
                Some((high, low)) if low == self.node_id => Some(high),
                _ => None,
            };
            if let Some((far, cut)) =
                far.and_then(|far| self.connections.find_by_peer(far).map(|cut| (far, cut)))
            {
                warn!(peer = %far, conn = %cut, "Cutting link to break loop");
                self.close_conn(cut, DropReason::Closed);
                if far == from {
                    return;
                }
            }
        }

        if self.topology.update_neighbor(subtree) {
            self.after_topology_change(Some(from));
        }
    }

    fn handle_local(&mut self, frame: Frame) {
        match frame {
            Frame::Single { from, payload, .. } | Frame::Broadcast { from, payload } => {
                self.events.push_back(MeshEvent::Receive { from, payload });
            }
            Frame::Gateway {
                from,
                priority,
                payload,
                ..
            } => self.handle_gateway(from, priority, payload),
            Frame::BridgeStatus {
                from,
                internet,
                rssi,
                priority,
                ..
            } => self.handle_bridge_status(from, internet, rssi, priority),
            Frame::Candidacy {
                from,
                rssi,
                uptime_ms,
                free_memory,
            } => {
                let now = self.scheduler.now_ms();
                self.election.observe_candidacy(CandidateInfo {
                    node_id: from,
                    rssi,
                    uptime_ms,
                    free_memory,
                    seen_at: now,
                });
                self.try_start_election();
            }
            Frame::Takeover {
                from,
                previous,
                rssi,
                priority,
            } => self.handle_takeover(from, previous, rssi, priority),
            Frame::NodeSync { .. } => {}
        }
    }

    fn handle_gateway(&mut self, from: NodeId, priority: Priority, payload: Vec<u8>) {
        if self.election.is_bridge() {
            self.events.push_back(MeshEvent::Uplink {
                from,
                priority,
                payload,
            });
            return;
        }
        // No longer the bridge: pass it on to whoever is
        match self.recommended_bridge() {
            Some(bridge) => {
                let frame = Frame::Gateway {
                    from,
                    dest: bridge,
                    priority,
                    payload,
                };
                if let Err(e) = self.send_frame_to(bridge, &frame) {
                    warn!(from = %from, error = %e, "Dropping relayed gateway frame");
                }
            }
            None => warn!(from = %from, ?priority, "No bridge for relayed gateway frame, dropping"),
        }
    }

    fn handle_bridge_status(&mut self, from: NodeId, internet: bool, rssi: Rssi, priority: u8) {
        let now = self.scheduler.now_ms();
        let info = BridgeInfo {
            node_id: from,
            internet,
            rssi,
            priority,
            last_seen: now,
        };
        if let Some(update) = self.election.record_bridge(info.clone(), now) {
            if update.internet_changed {
                info!(bridge = %from, internet, "Bridge status changed");
                self.events.push_back(MeshEvent::BridgeStatusChanged {
                    bridge: from,
                    has_internet: internet,
                });
            }
        }

        if internet && self.election.is_bridge() && !self.election.bridge_config().multi_bridge {
            warn!(other = %from, "Split-brain: another bridge is active");
            if self.election.should_yield_to(&info) {
                self.step_down("outranked by another bridge");
            } else {
                self.broadcast_bridge_status();
            }
        }

        self.refresh_gateway(internet);
        if !internet && self.recommended_bridge().is_none() {
            self.try_start_election();
        }
    }

    fn handle_takeover(&mut self, from: NodeId, previous: Option<NodeId>, rssi: Rssi, priority: u8) {
        let now = self.scheduler.now_ms();
        info!(bridge = %from, previous = ?previous, "Bridge takeover announced");
        let info = BridgeInfo {
            node_id: from,
            internet: true,
            rssi,
            priority,
            last_seen: now,
        };
        if let Some(update) = self.election.record_bridge(info.clone(), now) {
            if update.internet_changed {
                self.events.push_back(MeshEvent::BridgeStatusChanged {
                    bridge: from,
                    has_internet: true,
                });
            }
        }

        if self.election.phase() != ElectionPhase::Idle {
            if let Some(task) = self.election.take_phase_task() {
                self.scheduler.cancel(task);
            }
            self.election.abort_for(now, from);
        }
        if self.election.should_yield_to(&info) {
            self.step_down("outranked by another bridge");
        }
        self.refresh_gateway(true);
    }

    fn handle_link_loss(&mut self, loss: LinkLoss) {
        // Peer may still be reachable over a newer link
        if self.connections.find_by_peer(loss.peer).is_some() {
            return;
        }
        debug!(peer = %loss.peer, retrying = loss.retrying, "Lost link to neighbour");
        if self.topology.remove_neighbor(loss.peer) {
            self.after_topology_change(None);
        }
    }

    fn after_topology_change(&mut self, skip: Option<NodeId>) {
        self.routing.recompute(&self.topology);
        self.events.push_back(MeshEvent::TopologyChanged);
        self.broadcast_node_sync(skip);
        self.refresh_gateway(false);
    }

    fn notify_dropped(&mut self, node_id: Option<NodeId>, reason: DropReason) {
        if let Some(node) = node_id {
            if self.connections.find_by_peer(node).is_some() || !self.announced.remove(&node) {
                debug!(peer = %node, ?reason, "Drop superseded, not reported");
                return;
            }
        }
        info!(peer = ?node_id, ?reason, "Dropped connection");
        self.events
            .push_back(MeshEvent::DroppedConnection { node_id, reason });
    }

    fn close_conn(&mut self, conn: ConnId, reason: DropReason) -> bool {
        let known = self.connections.get(conn).is_some();
        if let Some(loss) =
            self.connections
                .close(conn, reason, &mut self.transport, &mut self.scheduler)
        {
            self.handle_link_loss(loss);
        }
        known
    }

    // ---- periodic work ----

    fn sync_tick(&mut self) {
        let now = self.scheduler.now_ms();
        self.broadcast_node_sync(None);

        let timeout = self.config.connection.node_timeout_ms;
        for conn in self.connections.stale(now, timeout) {
            warn!(conn = %conn, timeout_ms = timeout, "Link silent too long, closing");
            self.close_conn(conn, DropReason::TimedOut);
        }

        for bridge in self.election.expire(now) {
            self.events.push_back(MeshEvent::BridgeStatusChanged {
                bridge,
                has_internet: false,
            });
        }
        self.refresh_gateway(false);

        if let Some(max_age) = self.config.queue.max_age_ms {
            let before = self.queue.state();
            for old in self.queue.prune(now, max_age) {
                self.events.push_back(MeshEvent::MessageDropped {
                    id: old.id,
                    priority: old.priority,
                });
            }
            self.note_queue_state(before);
        }

        self.timers.sync = Some(
            self.scheduler
                .schedule(self.config.connection.sync_interval_ms, Task::SyncTick),
        );
    }

    fn bridge_monitor(&mut self) {
        self.try_start_election();
        self.timers.monitor = Some(self.scheduler.schedule(
            self.election.election_config().check_interval_ms,
            Task::BridgeMonitor,
        ));
    }

    fn status_tick(&mut self) {
        if !self.election.is_bridge() {
            self.timers.status = None;
            return;
        }
        self.broadcast_bridge_status();
        self.timers.status = Some(self.scheduler.schedule(
            self.election.bridge_config().status_interval_ms,
            Task::BridgeStatusBroadcast,
        ));
    }

    fn announce_bridge_to(&mut self, node: NodeId) {
        if !self.election.is_bridge() {
            return;
        }
        if !self.routing.is_reachable(node) {
            debug!(peer = %node, "Peer left before bridge announcement");
            return;
        }
        let state = self.election.state();
        let frame = Frame::BridgeStatus {
            from: self.node_id,
            dest: Some(node),
            internet: state.internet_reachable,
            rssi: state.router_rssi,
            priority: state.priority,
        };
        if let Err(e) = self.send_frame_to(node, &frame) {
            warn!(peer = %node, error = %e, "Bridge announcement failed");
        }
    }

    // ---- election ----

    fn try_start_election(&mut self) {
        if !self.running || !self.config.can_become_bridge() {
            return;
        }
        let now = self.scheduler.now_ms();
        let uptime = now.saturating_sub(self.started_at);
        let usable = self.recommended_bridge().is_some();
        if !self.election.should_start(now, uptime, usable) {
            return;
        }
        self.election.begin_candidacy(now);
        let delay = self.election.jitter_delay(&mut self.rng);
        let task = self.scheduler.schedule(delay, Task::ElectionJitter);
        self.election.set_phase_task(task);
        debug!(delay_ms = delay, "Candidacy jitter scheduled");
    }

    fn start_collecting(&mut self) {
        if self.election.phase() != ElectionPhase::Jitter {
            return;
        }
        let now = self.scheduler.now_ms();
        let Some(rssi) = self.scan_for_router() else {
            self.election
                .withdraw(now, RejectionReason::RouterNotVisible);
            self.events.push_back(MeshEvent::ElectionRejected {
                reason: RejectionReason::RouterNotVisible,
            });
            return;
        };
        self.election.set_router_rssi(rssi);

        let uptime_ms = now.saturating_sub(self.started_at);
        let own = CandidateInfo {
            node_id: self.node_id,
            rssi,
            uptime_ms,
            free_memory: self.free_memory,
            seen_at: now,
        };
        let window = self.election.open_window(own, now);
        let frame = Frame::Candidacy {
            from: self.node_id,
            rssi,
            uptime_ms,
            free_memory: self.free_memory,
        };
        if let Err(e) = self.flood_frame(&frame, None) {
            warn!(error = %e, "Failed to broadcast candidacy");
        }
        let task = self.scheduler.schedule(window, Task::EvaluateElection);
        self.election.set_phase_task(task);
        info!(rssi, window_ms = window, "Candidacy announced");
    }

    fn evaluate_election(&mut self) {
        if !matches!(self.election.phase(), ElectionPhase::Collecting { .. }) {
            return;
        }
        let now = self.scheduler.now_ms();
        match self.election.evaluate(now) {
            ElectionOutcome::Winner(id) if id == self.node_id => {
                if let Err(e) = self.assume_bridge_role("election winner") {
                    error!(error = %e, "Could not take bridge role after winning");
                }
            }
            ElectionOutcome::Winner(id) => debug!(winner = %id, "Election lost"),
            ElectionOutcome::Rejected(reason) => {
                self.events.push_back(MeshEvent::ElectionRejected { reason });
            }
        }
    }

    fn assume_bridge_role(&mut self, reason: &str) -> MeshResult<()> {
        let router = self
            .config
            .router
            .clone()
            .ok_or_else(|| MeshError::InvalidState("no router credentials".to_string()))?;
        let now = self.scheduler.now_ms();
        let previous = self.recommended_bridge();
        let channel = match router.channel {
            0 => self.router_channel,
            ch => ch,
        };

        if let Err(e) = self
            .radio
            .associate(&router.ssid, &router.password, channel)
        {
            error!(ssid = %router.ssid, error = %e, "Router association failed");
            self.election
                .withdraw(now, RejectionReason::AssociationFailed);
            self.events.push_back(MeshEvent::ElectionRejected {
                reason: RejectionReason::AssociationFailed,
            });
            return Err(e.into());
        }

        let rssi = self.election.state().router_rssi;
        self.election.promote(now, rssi);
        self.events.push_back(MeshEvent::BridgeRoleChanged {
            is_bridge: true,
            reason: reason.to_string(),
        });
        self.events.push_back(MeshEvent::BridgeStatusChanged {
            bridge: self.node_id,
            has_internet: true,
        });

        let frame = Frame::Takeover {
            from: self.node_id,
            previous,
            rssi,
            priority: self.election.state().priority,
        };
        if let Err(e) = self.flood_frame(&frame, None) {
            warn!(error = %e, "Failed to broadcast takeover");
        }
        if let Some(task) = self.timers.status.take() {
            self.scheduler.cancel(task);
        }
        self.timers.status = Some(self.scheduler.schedule(
            self.election.bridge_config().status_interval_ms,
            Task::BridgeStatusBroadcast,
        ));
        self.refresh_gateway(true);
        Ok(())
    }

    fn step_down(&mut self, reason: &str) {
        if !self.election.is_bridge() {
            return;
        }
        let now = self.scheduler.now_ms();
        self.election.demote(now, reason);
        if let Some(task) = self.timers.status.take() {
            self.scheduler.cancel(task);
        }
        self.radio.disassociate();
        self.events.push_back(MeshEvent::BridgeRoleChanged {
            is_bridge: false,
            reason: reason.to_string(),
        });
        self.events.push_back(MeshEvent::BridgeStatusChanged {
            bridge: self.node_id,
            has_internet: false,
        });
        self.broadcast_bridge_status();
        self.refresh_gateway(false);
    }

    /// Strongest signal of our router in a fresh scan
    fn scan_for_router(&mut self) -> Option<Rssi> {
        let ssid = self.config.router.as_ref()?.ssid.clone();
        let best = self
            .radio
            .scan()
            .into_iter()
            .filter(|r| r.ssid == ssid)
            .max_by_key(|r| r.rssi)?;
        self.router_channel = best.channel;
        Some(best.rssi)
    }

    // ---- gateway and queue ----

    /// Recompute gateway availability and flush when a bridge appears, or
    /// on any bridge-available event while entries are waiting.
    fn refresh_gateway(&mut self, bridge_event: bool) {
        let available = self.recommended_bridge().is_some();
        let rising = available && !self.gateway_available;
        self.gateway_available = available;
        if available && (rising || bridge_event) && !self.queue.is_empty() {
            self.flush_queue();
        }
    }

    fn flush_queue(&mut self) {
        let Some(bridge) = self.recommended_bridge() else {
            return;
        };
        let before = self.queue.state();
        let node_id = self.node_id;
        let connections = &mut self.connections;
        let transport = &mut self.transport;
        let codec = &self.codec;
        let routing = &self.routing;
        let events = &mut self.events;

        let report = self.queue.flush(|msg| match msg.scope {
            DeliveryScope::Gateway if bridge == node_id => {
                events.push_back(MeshEvent::Uplink {
                    from: node_id,
                    priority: msg.priority,
                    payload: msg.payload.clone(),
                });
                Ok(())
            }
            DeliveryScope::Gateway => {
                let frame = Frame::Gateway {
                    from: node_id,
                    dest: bridge,
                    priority: msg.priority,
                    payload: msg.payload.clone(),
                };
                send_routed(connections, transport, codec, routing, bridge, &frame)
            }
            DeliveryScope::Single(dest) => {
                let frame = Frame::Single {
                    from: node_id,
                    dest,
                    payload: msg.payload.clone(),
                };
                send_routed(connections, transport, codec, routing, dest, &frame)
            }
            DeliveryScope::Broadcast => {
                let frame = Frame::Broadcast {
                    from: node_id,
                    payload: msg.payload.clone(),
                };
                flood(connections, transport, codec, &frame, None).map(|_| ())
            }
        });

        for dead in report.failed {
            self.events.push_back(MeshEvent::MessageDropped {
                id: dead.id,
                priority: dead.priority,
            });
        }
        if let Some(e) = report.error {
            warn!(error = %e, remaining = report.remaining, "Flush halted until next bridge event");
        }
        self.note_queue_state(before);
    }

    fn note_queue_state(&mut self, before: QueueState) {
        let state = self.queue.state();
        if state != before {
            self.events.push_back(MeshEvent::QueueStateChanged {
                state,
                len: self.queue.len(),
            });
        }
    }

    // ---- wire helpers ----

    fn send_node_sync(&mut self, conn: ConnId) {
        let peer = self.connections.get(conn).and_then(|c| c.peer);
        let frame = Frame::NodeSync {
            from: self.node_id,
            subtree: self.topology.subtree(peer),
        };
        let result = self
            .codec
            .encode(&frame)
            .map_err(MeshError::from)
            .and_then(|bytes| self.connections.send(conn, bytes, &mut self.transport));
        if let Err(e) = result {
            debug!(conn = %conn, error = %e, "Node sync not sent");
        }
    }

    fn broadcast_node_sync(&mut self, skip: Option<NodeId>) {
        for (conn, peer) in self.connections.established() {
            if Some(peer) != skip {
                self.send_node_sync(conn);
            }
        }
    }

    fn broadcast_bridge_status(&mut self) {
        let state = self.election.state();
        let frame = Frame::BridgeStatus {
            from: self.node_id,
            dest: None,
            internet: state.internet_reachable,
            rssi: state.router_rssi,
            priority: state.priority,
        };
        if let Err(e) = self.flood_frame(&frame, None) {
            warn!(error = %e, "Failed to broadcast bridge status");
        }
    }

    fn send_frame_to(&mut self, dest: NodeId, frame: &Frame) -> MeshResult<()> {
        send_routed(
            &mut self.connections,
            &mut self.transport,
            &self.codec,
            &self.routing,
            dest,
            frame,
        )
    }

    fn flood_frame(&mut self, frame: &Frame, except: Option<ConnId>) -> MeshResult<usize> {
        flood(
            &mut self.connections,
            &mut self.transport,
            &self.codec,
            frame,
            except,
        )
    }
}

/// Hand `frame` to the neighbour on the route to `dest`.
fn send_routed<T: Transport, C: Codec>(
    connections: &mut ConnectionManager,
    transport: &mut T,
    codec: &C,
    routing: &RoutingTable,
    dest: NodeId,
    frame: &Frame,
) -> MeshResult<()> {
    let conn = routing
        .find_next_hop(dest)
        .and_then(|hop| connections.find_by_peer(hop))
        .ok_or(MeshError::NoRoute { destination: dest })?;
    let bytes = codec.encode(frame)?;
    connections.send(conn, bytes, transport)
}

/// Hand `frame` to every handshaken neighbour except `except`.
fn flood<T: Transport, C: Codec>(
    connections: &mut ConnectionManager,
    transport: &mut T,
    codec: &C,
    frame: &Frame,
    except: Option<ConnId>,
) -> MeshResult<usize> {
    let bytes = codec.encode(frame)?;
    let mut sent = 0;
    for (conn, peer) in connections.established() {
        if Some(conn) == except {
            continue;
        }
        match connections.send(conn, bytes.clone(), transport) {
            Ok(()) => sent += 1,
            Err(e) => warn!(peer = %peer, error = %e, "Flood send failed"),
        }
    }
    Ok(sent)
}

/// Pick the configured channel, or the one the mesh is already using.
fn resolve_channel<R: Radio>(config: &MeshConfig, radio: &mut R) -> u8 {
    if config.channel != 0 {
        return config.channel;
    }
    match radio
        .scan()
        .into_iter()
        .filter(|r| r.ssid == config.mesh_id)
        .max_by_key(|r| r.rssi)
    {
        Some(record) => {
            info!(channel = record.channel, rssi = record.rssi, "Found mesh during channel scan");
            record.channel
        }
        None => {
            warn!(mesh_id = %config.mesh_id, "Mesh not found during scan, using fallback channel");
            FALLBACK_CHANNEL
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::{RadioError, TransportError};
    use crate::scheduler::ManualScheduler;
    use crate::transport::{NoRadio, ScanRecord};
    use canopy_core::RouterCredentials;

    #[derive(Debug, Default)]
    struct NullTransport {
        next: u64,
        sent: Vec<(LinkHandle, Vec<u8>)>,
        released: Vec<LinkHandle>,
    }

    impl Transport for NullTransport {
        fn connect(&mut self, _addr: &str) -> Result<LinkHandle, TransportError> {
            self.next += 1;
            Ok(LinkHandle(self.next))
        }

        fn send(&mut self, link: LinkHandle, bytes: &[u8]) -> Result<(), TransportError> {
            self.sent.push((link, bytes.to_vec()));
            Ok(())
        }

        fn close(&mut self, _link: LinkHandle) {}

        fn release(&mut self, link: LinkHandle) {
            self.released.push(link);
        }
    }

    #[derive(Debug, Default)]
    struct ScriptedRadio {
        records: Vec<ScanRecord>,
        associated: Option<String>,
    }

    impl Radio for ScriptedRadio {
        fn scan(&mut self) -> Vec<ScanRecord> {
            self.records.clone()
        }

        fn associate(&mut self, ssid: &str, _password: &str, _channel: u8) -> Result<(), RadioError> {
            self.associated = Some(ssid.to_string());
            Ok(())
        }

        fn disassociate(&mut self) {
            self.associated = None;
        }
    }

    type TestEngine = MeshEngine<NullTransport, ManualScheduler, NoRadio>;

    fn create_test_engine() -> TestEngine {
        let config = MeshConfig::for_node(NodeId(1), "orchard");
        MeshEngine::init(config, NullTransport::default(), ManualScheduler::new(), NoRadio).unwrap()
    }

    #[test]
    fn test_engine_creation() {
        let engine = create_test_engine();
        let status = engine.status();
        assert_eq!(status.node_id, NodeId(1));
        assert_eq!(status.role, BridgeRole::Regular);
        assert_eq!(status.mesh_size, 1);
        assert!(status.running);
        assert_eq!(engine.hop_count(NodeId(1)), Some(0));
        assert_eq!(engine.path_to_node(NodeId(1)), vec![NodeId(1)]);
    }

    #[test]
    fn test_invalid_config_rejected() {
        let mut config = MeshConfig::for_node(NodeId(1), "orchard");
        config.queue.capacity = 0;
        let result = TestEngine::init(config, NullTransport::default(), ManualScheduler::new(), NoRadio);
        assert!(matches!(result, Err(MeshError::Config(_))));
    }

    #[test]
    fn test_channel_auto_detect() {
        let mut config = MeshConfig::for_node(NodeId(1), "orchard");
        config.channel = 0;
        let radio = ScriptedRadio {
            records: vec![
                ScanRecord { ssid: "orchard".into(), rssi: -70, channel: 6 },
                ScanRecord { ssid: "orchard".into(), rssi: -50, channel: 11 },
                ScanRecord { ssid: "cafe".into(), rssi: -30, channel: 3 },
            ],
            associated: None,
        };
        let engine = MeshEngine::init(config.clone(), NullTransport::default(), ManualScheduler::new(), radio).unwrap();
        assert_eq!(engine.channel(), 11);

        let engine = MeshEngine::init(config, NullTransport::default(), ManualScheduler::new(), NoRadio).unwrap();
        assert_eq!(engine.channel(), FALLBACK_CHANNEL);
    }

    #[test]
    fn test_gateway_send_queues_without_bridge() {
        let mut engine = create_test_engine();
        let sent = engine.send_to_gateway(b"temp=21".to_vec(), Priority::Normal).unwrap();
        assert!(matches!(sent, GatewaySend::Queued(_)));
        assert_eq!(engine.queue().len(), 1);
        assert!(!engine.has_internet_connection());
        assert!(engine
            .drain_events()
            .contains(&MeshEvent::QueueStateChanged { state: QueueState::Normal, len: 1 }));
    }

    #[test]
    fn test_malformed_data_dropped_without_state_change() {
        let mut engine = create_test_engine();
        engine.on_incoming(LinkHandle(50));
        let conn = engine.connections().iter().next().unwrap().id;

        engine.on_data(LinkHandle(50), b"\x00garbage");
        let c = engine.connections().get(conn).unwrap();
        assert_eq!(c.state, crate::connection::LinkState::Connected);
        assert!(engine.drain_events().is_empty());
    }

    #[test]
    fn test_inbound_limit_enforced() {
        let mut engine = create_test_engine();
        for link in 0..6 {
            engine.on_incoming(LinkHandle(link));
        }
        assert_eq!(engine.connections().live_count(), 4);

        // Rejected handles are released after the cleanup delay
        engine.scheduler_mut().advance(5_000);
        engine.tick();
        assert_eq!(engine.transport().released.len(), 2);
    }

    #[test]
    fn test_manual_bridge_uplinks_locally() {
        let mut config = MeshConfig::for_node(NodeId(1), "orchard");
        config.router = Some(RouterCredentials {
            ssid: "hq".into(),
            password: "pw".into(),
            channel: 0,
        });
        let radio = ScriptedRadio {
            records: vec![ScanRecord { ssid: "hq".into(), rssi: -55, channel: 6 }],
            associated: None,
        };
        let mut engine = MeshEngine::init(config, NullTransport::default(), ManualScheduler::new(), radio).unwrap();
        engine.send_to_gateway(b"queued".to_vec(), Priority::High).unwrap();

        engine.become_bridge().unwrap();
        assert!(engine.is_bridge());
        assert!(engine.queue().is_empty());
        assert_eq!(engine.recommended_bridge(), Some(NodeId(1)));

        let events = engine.drain_events();
        assert!(events.contains(&MeshEvent::Uplink {
            from: NodeId(1),
            priority: Priority::High,
            payload: b"queued".to_vec(),
        }));

        engine.on_router_disconnected();
        assert!(!engine.is_bridge());
        assert!(engine.radio_mut().associated.is_none());
    }

    #[test]
    fn test_stop_closes_and_ignores_timers() {
        let mut engine = create_test_engine();
        engine.on_incoming(LinkHandle(9));
        engine.stop();
        assert!(!engine.is_running());
        assert!(engine.dial("10.0.0.9:5555").is_err());

        engine.scheduler_mut().advance(120_000);
        engine.tick();
        assert!(engine.connections().is_empty());
        assert_eq!(engine.transport().released, vec![LinkHandle(9)]);
    }

    #[test]
    fn test_runtime_election_settings() {
        let mut engine = create_test_engine();
        assert!(engine.set_election_random_delay(3000, 1000).is_err());
        assert!(engine.set_election_random_delay(100, 200).is_ok());
        assert_eq!(engine.set_minimum_bridge_rssi(0), -30);
    }
}
