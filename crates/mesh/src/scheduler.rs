//! Deferred work for the cooperative engine.
//!
//! Every wait in the mesh (retry backoff, cleanup delay, election jitter,
//! periodic sync) is a [`Task`] registered with a [`Scheduler`]. Tasks are
//! plain data naming a transition, so cancelling one is a table removal and
//! firing one is a match in the engine.

use crate::connection::ConnId;
use crate::events::DropReason;
use crate::transport::LinkHandle;
use canopy_core::{Millis, NodeId};
use std::collections::{BTreeMap, HashMap};

/// Cancelable reference to a scheduled task.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct TaskHandle(u64);

/// Deferred transitions understood by the engine.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Task {
    /// Dial the connection's address again
    RetryConnect(ConnId),
    /// Hand a detached link back to the transport
    ReleaseLink(LinkHandle),
    /// Remove a closed connection and release its link
    DestroyConnection(ConnId),
    /// Tell the application a connection is gone
    NotifyDropped {
        /// Peer, when the handshake had completed
        node_id: Option<NodeId>,
        /// Why the link went away
        reason: DropReason,
    },
    /// Periodic node sync, inactivity sweep and housekeeping
    SyncTick,
    /// Periodic check whether an election is needed
    BridgeMonitor,
    /// Candidacy jitter elapsed, start collecting
    ElectionJitter,
    /// Collection window closed, pick a winner
    EvaluateElection,
    /// Periodic status broadcast while acting as bridge
    BridgeStatusBroadcast,
    /// Direct bridge announcement to a freshly joined node
    AnnounceBridgeTo(NodeId),
}

/// Timer service the engine runs on.
pub trait Scheduler {
    /// Current time on the scheduler clock
    fn now_ms(&self) -> Millis;

    /// Run `task` once `delay_ms` has elapsed
    fn schedule(&mut self, delay_ms: Millis, task: Task) -> TaskHandle;

    /// Cancel a pending task. Returns `false` if it already fired or was
    /// never scheduled.
    fn cancel(&mut self, handle: TaskHandle) -> bool;

    /// Take the next task whose deadline has passed, earliest first
    fn pop_due(&mut self) -> Option<(TaskHandle, Task)>;
}

/// Deterministic scheduler driven by an explicit clock.
///
/// Tasks with the same deadline fire in the order they were scheduled.
#[derive(Debug, Default)]
pub struct ManualScheduler {
    now: Millis,
    next_id: u64,
    queue: BTreeMap<(Millis, u64), Task>,
    deadlines: HashMap<u64, Millis>,
}

impl ManualScheduler {
    /// Create a scheduler with the clock at zero
    pub fn new() -> Self {
        Self::default()
    }

    /// Move the clock forward
    pub fn advance(&mut self, delta_ms: Millis) {
        self.now = self.now.saturating_add(delta_ms);
    }

    /// Move the clock to an absolute time; never goes backwards
    pub fn advance_to(&mut self, at_ms: Millis) {
        self.now = self.now.max(at_ms);
    }

    /// Number of tasks still waiting
    pub fn pending(&self) -> usize {
        self.queue.len()
    }

    /// Whether `handle` is still waiting to fire
    pub fn is_scheduled(&self, handle: TaskHandle) -> bool {
        self.deadlines.contains_key(&handle.0)
    }

    /// Deadline of the earliest pending task
    pub fn next_deadline(&self) -> Option<Millis> {
        self.queue.keys().next().map(|(at, _)| *at)
    }

    /// Pending tasks in firing order, for inspection
    pub fn pending_tasks(&self) -> impl Iterator<Item = (Millis, &Task)> {
        self.queue.iter().map(|((at, _), task)| (*at, task))
    }
}

impl Scheduler for ManualScheduler {
    fn now_ms(&self) -> Millis {
        self.now
    }

    fn schedule(&mut self, delay_ms: Millis, task: Task) -> TaskHandle {
        let id = self.next_id;
        self.next_id += 1;
        let at = self.now.saturating_add(delay_ms);
        self.queue.insert((at, id), task);
        self.deadlines.insert(id, at);
        TaskHandle(id)
    }

    fn cancel(&mut self, handle: TaskHandle) -> bool {
        match self.deadlines.remove(&handle.0) {
            Some(at) => self.queue.remove(&(at, handle.0)).is_some(),
            None => false,
        }
    }

    fn pop_due(&mut self) -> Option<(TaskHandle, Task)> {
        let (&(at, id), _) = self.queue.iter().next()?;
        if at > self.now {
            return None;
        }
        let task = self.queue.remove(&(at, id))?;
        self.deadlines.remove(&id);
        Some((TaskHandle(id), task))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_tasks_fire_in_deadline_order() {
        let mut scheduler = ManualScheduler::new();
        scheduler.schedule(300, Task::SyncTick);
        scheduler.schedule(100, Task::BridgeMonitor);
        scheduler.schedule(100, Task::ElectionJitter);

        assert!(scheduler.pop_due().is_none());
        scheduler.advance(1000);

        let order: Vec<Task> = std::iter::from_fn(|| scheduler.pop_due())
            .map(|(_, task)| task)
            .collect();
        assert_eq!(
            order,
            vec![Task::BridgeMonitor, Task::ElectionJitter, Task::SyncTick]
        );
    }

    #[test]
    fn test_cancel_is_race_free() {
        let mut scheduler = ManualScheduler::new();
        let handle = scheduler.schedule(50, Task::EvaluateElection);
        assert!(scheduler.is_scheduled(handle));

        scheduler.advance(50);
        let (fired, _) = scheduler.pop_due().unwrap();
        assert_eq!(fired, handle);

        // Already fired, so cancelling is a no-op
        assert!(!scheduler.cancel(handle));
        assert_eq!(scheduler.pending(), 0);
    }

    #[test]
    fn test_cancelled_task_never_fires() {
        let mut scheduler = ManualScheduler::new();
        let handle = scheduler.schedule(10, Task::RetryConnect(ConnId(1)));
        assert!(scheduler.cancel(handle));
        scheduler.advance(100);
        assert!(scheduler.pop_due().is_none());
    }

    #[test]
    fn test_clock_never_goes_backwards() {
        let mut scheduler = ManualScheduler::new();
        scheduler.advance_to(500);
        scheduler.advance_to(100);
        assert_eq!(scheduler.now_ms(), 500);
        scheduler.schedule(0, Task::SyncTick);
        assert_eq!(scheduler.next_deadline(), Some(500));
    }
}
