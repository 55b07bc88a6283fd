//! Connection manager: one state machine per direct link.
//!
//! ```text
//! Connecting -> Connected -> Error -> RetryScheduled -> Connecting ...
//!                                  \-> Exhausted (attempt limit)
//! any state -> Closed -> (deferred) destroyed
//! ```
//!
//! Teardown is always deferred. A connection is never removed from inside a
//! transport callback made on its own behalf; close and exhaustion schedule
//! a [`Task::DestroyConnection`] instead, and failed link handles are handed
//! back with a spaced [`Task::ReleaseLink`].

use crate::error::{MeshError, MeshResult};
use crate::events::DropReason;
use crate::scheduler::{Scheduler, Task, TaskHandle};
use crate::transport::{LinkHandle, Transport};
use canopy_core::{ConnectionConfig, Millis, NodeId};
use std::collections::{BTreeMap, HashMap, VecDeque};
use std::fmt;
use tracing::{debug, error, info, warn};

/// Frames held for a link that is still connecting.
const MAX_BUFFERED_FRAMES: usize = 16;

/// Local identifier of a connection, stable across reconnect attempts.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct ConnId(pub u64);

impl fmt::Display for ConnId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "conn#{}", self.0)
    }
}

/// Lifecycle state of a connection
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LinkState {
    /// Transport attempt in flight
    Connecting,
    /// Link is up
    Connected,
    /// Transport reported a failure; resolved within the same step
    Error,
    /// Waiting for the backoff delay before dialing again
    RetryScheduled,
    /// Attempt limit reached; destruction pending
    Exhausted,
    /// Closed; destruction pending
    Closed,
}

impl LinkState {
    /// No further transitions except destruction
    pub fn is_terminal(self) -> bool {
        matches!(self, LinkState::Closed | LinkState::Exhausted)
    }
}

/// Which side opened the link
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Direction {
    /// We dialed; eligible for retry
    Outbound,
    /// Peer dialed us
    Inbound,
}

/// One direct link.
#[derive(Debug)]
pub struct Connection {
    /// Local identifier
    pub id: ConnId,
    /// Who opened the link
    pub direction: Direction,
    /// Dial address for outbound links
    pub address: Option<String>,
    /// Current transport handle, absent between retry attempts
    pub link: Option<LinkHandle>,
    /// Peer identity, known once the handshake completes
    pub peer: Option<NodeId>,
    /// Lifecycle state
    pub state: LinkState,
    /// Failed attempts since the last successful connect
    pub attempts: u32,
    /// Deadline of the pending retry
    pub next_retry_at: Option<Millis>,
    /// Last time anything arrived on the link
    pub last_activity: Millis,
    retry_task: Option<TaskHandle>,
    outbound: VecDeque<Vec<u8>>,
}

impl Connection {
    fn new(id: ConnId, direction: Direction, address: Option<String>, now: Millis) -> Self {
        Self {
            id,
            direction,
            address,
            link: None,
            peer: None,
            state: LinkState::Connecting,
            attempts: 0,
            next_retry_at: None,
            last_activity: now,
            retry_task: None,
            outbound: VecDeque::new(),
        }
    }

    /// Connected and handshaken
    pub fn is_established(&self) -> bool {
        self.state == LinkState::Connected && self.peer.is_some()
    }

    /// Frames waiting for the link to come up
    pub fn pending_outbound(&self) -> usize {
        self.outbound.len()
    }
}

/// An established link went away; topology must forget the peer.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct LinkLoss {
    /// Connection that lost its link
    pub conn: ConnId,
    /// Neighbour reached over the link
    pub peer: NodeId,
    /// A reconnect attempt is scheduled
    pub retrying: bool,
}

/// Counters for diagnostics
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ConnectionStats {
    /// Outbound connections opened
    pub dialed: u64,
    /// Inbound links registered
    pub accepted: u64,
    /// Inbound links refused at the connection limit
    pub rejected: u64,
    /// Reconnect attempts started
    pub retries: u64,
    /// Connections that hit the attempt limit
    pub exhausted: u64,
    /// Connections removed by deferred cleanup
    pub destroyed: u64,
    /// Transport handles handed back
    pub released: u64,
}

/// Retry delay for the `attempt`-th consecutive failure (1-based):
/// `min(initial * 2^(attempt-1), max)`.
pub fn retry_delay(attempt: u32, initial_ms: Millis, max_ms: Millis) -> Millis {
    let factor = 1u64
        .checked_shl(attempt.saturating_sub(1))
        .unwrap_or(u64::MAX);
    initial_ms.saturating_mul(factor).min(max_ms)
}

/// Owns every [`Connection`] and drives its state machine.
#[derive(Debug)]
pub struct ConnectionManager {
    config: ConnectionConfig,
    next_id: u64,
    connections: BTreeMap<ConnId, Connection>,
    by_link: HashMap<LinkHandle, ConnId>,
    /// Connections whose transport callback is currently executing
    callbacks: Vec<ConnId>,
    /// Deadline of the most recently scheduled cleanup task
    last_cleanup_at: Option<Millis>,
    stats: ConnectionStats,
}

impl ConnectionManager {
    /// Create an empty manager
    pub fn new(config: ConnectionConfig) -> Self {
        Self {
            config,
            next_id: 1,
            connections: BTreeMap::new(),
            by_link: HashMap::new(),
            callbacks: Vec::new(),
            last_cleanup_at: None,
            stats: ConnectionStats::default(),
        }
    }

    /// Active configuration
    pub fn config(&self) -> &ConnectionConfig {
        &self.config
    }

    /// Open an outbound connection to `address`.
    ///
    /// A synchronous connect failure counts as the first failed attempt
    /// and schedules a retry like any later transport error.
    pub fn dial<T, S>(
        &mut self,
        address: &str,
        transport: &mut T,
        scheduler: &mut S,
    ) -> MeshResult<ConnId>
    where
        T: Transport + ?Sized,
        S: Scheduler + ?Sized,
    {
        let duplicate = self
            .connections
            .values()
            .any(|c| !c.state.is_terminal() && c.address.as_deref() == Some(address));
        if duplicate {
            return Err(MeshError::DuplicateLink {
                address: address.to_string(),
            });
        }

        let id = self.allocate_id();
        let now = scheduler.now_ms();
        self.connections.insert(
            id,
            Connection::new(id, Direction::Outbound, Some(address.to_string()), now),
        );
        self.stats.dialed += 1;
        info!(conn = %id, address, "Dialing peer");

        self.start_attempt(id, transport, scheduler);
        Ok(id)
    }

    /// Register a link the peer opened; it is connected immediately.
    pub fn accept(&mut self, link: LinkHandle, now: Millis) -> ConnId {
        let id = self.allocate_id();
        let mut conn = Connection::new(id, Direction::Inbound, None, now);
        conn.state = LinkState::Connected;
        conn.link = Some(link);
        self.connections.insert(id, conn);
        self.by_link.insert(link, id);
        self.stats.accepted += 1;
        info!(conn = %id, %link, "Accepted inbound link");
        id
    }

    /// Refuse an inbound link the node has no room for. The handle is
    /// released on the same spaced cleanup lane as closed connections.
    pub fn reject<T, S>(&mut self, link: LinkHandle, transport: &mut T, scheduler: &mut S)
    where
        T: Transport + ?Sized,
        S: Scheduler + ?Sized,
    {
        transport.close(link);
        self.stats.rejected += 1;
        self.schedule_cleanup(scheduler, Task::ReleaseLink(link));
    }

    /// Enter a transport callback for `link`. Returns `None` for links
    /// that are unknown or already detached.
    pub fn begin_callback(&mut self, link: LinkHandle) -> Option<ConnId> {
        let id = *self.by_link.get(&link)?;
        self.callbacks.push(id);
        Some(id)
    }

    /// Leave the innermost transport callback
    pub fn end_callback(&mut self) {
        self.callbacks.pop();
    }

    /// Whether a callback for `conn` is executing right now
    pub fn in_callback(&self, conn: ConnId) -> bool {
        self.callbacks.contains(&conn)
    }

    /// Transport finished connecting. Flushes buffered frames.
    pub fn on_connected<T>(&mut self, conn: ConnId, transport: &mut T, now: Millis) -> bool
    where
        T: Transport + ?Sized,
    {
        let Some(c) = self.connections.get_mut(&conn) else {
            return false;
        };
        if c.state != LinkState::Connecting {
            debug!(conn = %conn, state = ?c.state, "Ignoring connect for connection not in Connecting");
            return false;
        }
        let Some(link) = c.link else {
            return false;
        };

        c.state = LinkState::Connected;
        c.attempts = 0;
        c.last_activity = now;
        info!(conn = %conn, %link, "Link connected");

        while let Some(bytes) = c.outbound.pop_front() {
            if let Err(e) = transport.send(link, &bytes) {
                warn!(conn = %conn, error = %e, "Dropping buffered frame");
            }
        }
        true
    }

    /// Transport reported an error on the current link of `conn`.
    ///
    /// The failed handle is released later; outbound connections are
    /// retried with backoff until the attempt limit is reached.
    pub fn on_error<S>(&mut self, conn: ConnId, code: i32, scheduler: &mut S) -> Option<LinkLoss>
    where
        S: Scheduler + ?Sized,
    {
        let (link, lost_peer) = {
            let c = self.connections.get_mut(&conn)?;
            if c.state.is_terminal() {
                return None;
            }
            warn!(conn = %conn, code, state = ?c.state, attempts = c.attempts, "Transport error");
            let lost_peer = match c.state {
                LinkState::Connected => c.peer,
                _ => None,
            };
            c.state = LinkState::Error;
            c.outbound.clear();
            (c.link.take(), lost_peer)
        };

        if let Some(link) = link {
            self.by_link.remove(&link);
            self.schedule_cleanup(scheduler, Task::ReleaseLink(link));
        }

        let retrying = self.fail_attempt(conn, lost_peer, scheduler);
        lost_peer.map(|peer| LinkLoss {
            conn,
            peer,
            retrying,
        })
    }

    /// Transport reported the link closed.
    pub fn on_closed<S>(&mut self, conn: ConnId, scheduler: &mut S) -> Option<LinkLoss>
    where
        S: Scheduler + ?Sized,
    {
        self.mark_closed(conn, DropReason::Closed, scheduler)
    }

    /// Close `conn` from our side.
    pub fn close<T, S>(
        &mut self,
        conn: ConnId,
        reason: DropReason,
        transport: &mut T,
        scheduler: &mut S,
    ) -> Option<LinkLoss>
    where
        T: Transport + ?Sized,
        S: Scheduler + ?Sized,
    {
        let link = {
            let c = self.connections.get(&conn)?;
            if c.state.is_terminal() {
                return None;
            }
            c.link
        };
        // Detach first so a synchronous close callback finds nothing
        if let Some(link) = link {
            self.by_link.remove(&link);
            transport.close(link);
        }
        self.mark_closed(conn, reason, scheduler)
    }

    /// Abandon a scheduled retry because the peer came back another way.
    pub fn cancel_pending_retry<S>(&mut self, conn: ConnId, scheduler: &mut S) -> bool
    where
        S: Scheduler + ?Sized,
    {
        let Some(c) = self.connections.get_mut(&conn) else {
            return false;
        };
        if c.state != LinkState::RetryScheduled {
            return false;
        }
        if let Some(task) = c.retry_task.take() {
            scheduler.cancel(task);
        }
        c.next_retry_at = None;
        c.state = LinkState::Closed;
        info!(conn = %conn, "Pending retry superseded");
        self.schedule_cleanup(scheduler, Task::DestroyConnection(conn));
        true
    }

    /// Fired by [`Task::RetryConnect`].
    pub fn retry<T, S>(&mut self, conn: ConnId, transport: &mut T, scheduler: &mut S)
    where
        T: Transport + ?Sized,
        S: Scheduler + ?Sized,
    {
        let Some(c) = self.connections.get_mut(&conn) else {
            return;
        };
        if c.state != LinkState::RetryScheduled {
            debug!(conn = %conn, state = ?c.state, "Stale retry ignored");
            return;
        }
        c.retry_task = None;
        c.next_retry_at = None;
        c.state = LinkState::Connecting;
        self.stats.retries += 1;
        debug!(conn = %conn, attempt = c.attempts + 1, "Retrying connection");
        self.start_attempt(conn, transport, scheduler);
    }

    /// Fired by [`Task::DestroyConnection`]. Refuses to run while a
    /// callback for the same connection is on the stack.
    pub fn destroy<T>(&mut self, conn: ConnId, transport: &mut T) -> MeshResult<()>
    where
        T: Transport + ?Sized,
    {
        if self.in_callback(conn) {
            error!(conn = %conn, "Refusing to destroy connection inside its own callback");
            return Err(MeshError::InvalidState(format!(
                "{conn} destroyed inside its own callback"
            )));
        }
        let Some(c) = self.connections.get(&conn) else {
            return Err(MeshError::ConnectionNotFound(conn));
        };
        if !c.state.is_terminal() {
            return Err(MeshError::InvalidState(format!(
                "{conn} is {:?}, not closed",
                c.state
            )));
        }

        if let Some(c) = self.connections.remove(&conn) {
            if let Some(link) = c.link {
                self.by_link.remove(&link);
                transport.release(link);
                self.stats.released += 1;
            }
        }
        self.stats.destroyed += 1;
        debug!(conn = %conn, "Connection destroyed");
        Ok(())
    }

    /// Fired by [`Task::ReleaseLink`].
    pub fn release_link<T>(&mut self, link: LinkHandle, transport: &mut T)
    where
        T: Transport + ?Sized,
    {
        transport.release(link);
        self.stats.released += 1;
        debug!(%link, "Released link handle");
    }

    /// Send bytes on `conn`, buffering while it is still connecting.
    pub fn send<T>(&mut self, conn: ConnId, bytes: Vec<u8>, transport: &mut T) -> MeshResult<()>
    where
        T: Transport + ?Sized,
    {
        let c = self
            .connections
            .get_mut(&conn)
            .ok_or(MeshError::ConnectionNotFound(conn))?;
        match (c.state, c.link) {
            (LinkState::Connected, Some(link)) => {
                transport.send(link, &bytes)?;
                Ok(())
            }
            (LinkState::Connecting, _) => {
                if c.outbound.len() >= MAX_BUFFERED_FRAMES {
                    c.outbound.pop_front();
                }
                c.outbound.push_back(bytes);
                Ok(())
            }
            _ => Err(MeshError::LinkDown(conn)),
        }
    }

    /// Note traffic on `conn`
    pub fn touch(&mut self, conn: ConnId, now: Millis) {
        if let Some(c) = self.connections.get_mut(&conn) {
            c.last_activity = now;
        }
    }

    /// Record the identity learned from the handshake
    pub fn set_peer(&mut self, conn: ConnId, peer: NodeId) {
        if let Some(c) = self.connections.get_mut(&conn) {
            c.peer = Some(peer);
        }
    }

    /// Established connection to `peer`, if any
    pub fn find_by_peer(&self, peer: NodeId) -> Option<ConnId> {
        self.connections
            .values()
            .find(|c| c.is_established() && c.peer == Some(peer))
            .map(|c| c.id)
    }

    /// Connections to `peer` that are waiting to redial
    pub fn retrying_for(&self, peer: NodeId) -> Vec<ConnId> {
        self.connections
            .values()
            .filter(|c| c.state == LinkState::RetryScheduled && c.peer == Some(peer))
            .map(|c| c.id)
            .collect()
    }

    /// Look up a connection
    pub fn get(&self, conn: ConnId) -> Option<&Connection> {
        self.connections.get(&conn)
    }

    /// All connections, ordered by id
    pub fn iter(&self) -> impl Iterator<Item = &Connection> {
        self.connections.values()
    }

    /// Established links with their peers
    pub fn established(&self) -> Vec<(ConnId, NodeId)> {
        self.connections
            .values()
            .filter_map(|c| match (c.state, c.peer) {
                (LinkState::Connected, Some(peer)) => Some((c.id, peer)),
                _ => None,
            })
            .collect()
    }

    /// Connections that are not closed or exhausted
    pub fn live_count(&self) -> usize {
        self.connections
            .values()
            .filter(|c| !c.state.is_terminal())
            .count()
    }

    /// Connected links silent for longer than `timeout_ms`
    pub fn stale(&self, now: Millis, timeout_ms: Millis) -> Vec<ConnId> {
        self.connections
            .values()
            .filter(|c| {
                c.state == LinkState::Connected && now.saturating_sub(c.last_activity) > timeout_ms
            })
            .map(|c| c.id)
            .collect()
    }

    /// Every connection id, for shutdown
    pub fn ids(&self) -> Vec<ConnId> {
        self.connections.keys().copied().collect()
    }

    /// Total connections held, including ones awaiting destruction
    pub fn len(&self) -> usize {
        self.connections.len()
    }

    /// No connections at all
    pub fn is_empty(&self) -> bool {
        self.connections.is_empty()
    }

    /// Diagnostic counters
    pub fn stats(&self) -> &ConnectionStats {
        &self.stats
    }

    fn allocate_id(&mut self) -> ConnId {
        let id = ConnId(self.next_id);
        self.next_id += 1;
        id
    }

    fn start_attempt<T, S>(&mut self, conn: ConnId, transport: &mut T, scheduler: &mut S)
    where
        T: Transport + ?Sized,
        S: Scheduler + ?Sized,
    {
        let Some(address) = self.connections.get(&conn).and_then(|c| c.address.clone()) else {
            return;
        };
        match transport.connect(&address) {
            Ok(link) => {
                if let Some(c) = self.connections.get_mut(&conn) {
                    c.link = Some(link);
                }
                self.by_link.insert(link, conn);
            }
            Err(e) => {
                warn!(conn = %conn, address = %address, error = %e, "Connect attempt failed");
                if let Some(c) = self.connections.get_mut(&conn) {
                    c.state = LinkState::Error;
                }
                self.fail_attempt(conn, None, scheduler);
            }
        }
    }

    /// Resolve the Error state. Returns whether a retry was scheduled.
    fn fail_attempt<S>(&mut self, conn: ConnId, lost_peer: Option<NodeId>, scheduler: &mut S) -> bool
    where
        S: Scheduler + ?Sized,
    {
        let now = scheduler.now_ms();
        let (initial, max, limit) = (
            self.config.initial_retry_delay_ms,
            self.config.max_retry_delay_ms,
            self.config.max_attempts,
        );
        let Some(c) = self.connections.get_mut(&conn) else {
            return false;
        };

        if c.direction == Direction::Inbound || c.address.is_none() {
            c.state = LinkState::Closed;
            let peer = c.peer;
            if lost_peer.is_some() {
                scheduler.schedule(
                    0,
                    Task::NotifyDropped {
                        node_id: peer,
                        reason: DropReason::Closed,
                    },
                );
            }
            self.schedule_cleanup(scheduler, Task::DestroyConnection(conn));
            return false;
        }

        c.attempts += 1;
        if c.attempts >= limit {
            c.state = LinkState::Exhausted;
            let peer = c.peer;
            warn!(conn = %conn, attempts = c.attempts, "Retry attempts exhausted");
            self.stats.exhausted += 1;
            // Surfaced after the current callback returns, never inline
            scheduler.schedule(
                0,
                Task::NotifyDropped {
                    node_id: peer,
                    reason: DropReason::RetriesExhausted,
                },
            );
            self.schedule_cleanup(scheduler, Task::DestroyConnection(conn));
            return false;
        }

        let delay = retry_delay(c.attempts, initial, max);
        c.state = LinkState::RetryScheduled;
        c.next_retry_at = Some(now + delay);
        c.retry_task = Some(scheduler.schedule(delay, Task::RetryConnect(conn)));
        debug!(conn = %conn, attempt = c.attempts, delay_ms = delay, "Retry scheduled");
        true
    }

    fn mark_closed<S>(&mut self, conn: ConnId, reason: DropReason, scheduler: &mut S) -> Option<LinkLoss>
    where
        S: Scheduler + ?Sized,
    {
        let lost_peer = {
            let c = self.connections.get_mut(&conn)?;
            if c.state.is_terminal() {
                return None;
            }
            if let Some(task) = c.retry_task.take() {
                scheduler.cancel(task);
            }
            let lost_peer = match c.state {
                LinkState::Connected => c.peer,
                _ => None,
            };
            c.state = LinkState::Closed;
            c.next_retry_at = None;
            c.outbound.clear();
            if let Some(link) = c.link {
                self.by_link.remove(&link);
            }
            info!(conn = %conn, ?reason, "Connection closed");
            lost_peer
        };

        if lost_peer.is_some() {
            scheduler.schedule(
                0,
                Task::NotifyDropped {
                    node_id: lost_peer,
                    reason,
                },
            );
        }
        self.schedule_cleanup(scheduler, Task::DestroyConnection(conn));
        lost_peer.map(|peer| LinkLoss {
            conn,
            peer,
            retrying: false,
        })
    }

    /// Schedule a cleanup task after the safety delay, spaced from the
    /// previous cleanup so bursts of closes are released one at a time.
    fn schedule_cleanup<S>(&mut self, scheduler: &mut S, task: Task) -> TaskHandle
    where
        S: Scheduler + ?Sized,
    {
        let now = scheduler.now_ms();
        let earliest = now + self.config.cleanup_delay_ms;
        let at = match self.last_cleanup_at {
            Some(last) => earliest.max(last + self.config.cleanup_spacing_ms),
            None => earliest,
        };
        self.last_cleanup_at = Some(at);
        scheduler.schedule(at - now, task)
    }
}
