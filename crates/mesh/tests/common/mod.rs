//! In-memory multi-node harness for end-to-end mesh tests

#![allow(dead_code)]

use canopy_core::{MeshConfig, NodeId, RouterCredentials, Rssi};
use canopy_mesh::{
    LinkHandle, ManualScheduler, MeshEngine, MeshEvent, Radio, RadioError, ScanRecord, Scheduler,
    Transport, TransportError,
};
use std::cell::RefCell;
use std::collections::{HashMap, HashSet, VecDeque};
use std::rc::Rc;

pub const ROUTER_SSID: &str = "hq-router";

pub type TestEngine = MeshEngine<LoopbackTransport, ManualScheduler, FakeRadio>;

/// Something the network will report to one node
#[derive(Debug)]
enum Delivery {
    Incoming(LinkHandle),
    Connected(LinkHandle),
    Data(LinkHandle, Vec<u8>),
    Closed(LinkHandle),
    Error(LinkHandle, i32),
}

/// Shared wiring between every node's transport
#[derive(Debug, Default)]
pub struct Network {
    next_link: u64,
    addresses: HashMap<String, usize>,
    /// (node, link) -> (peer node, peer link)
    pairs: HashMap<(usize, LinkHandle), (usize, LinkHandle)>,
    pending: VecDeque<(usize, Delivery)>,
    pub released: HashSet<(usize, LinkHandle)>,
    pub frames_sent: usize,
    /// Nodes whose outgoing frames vanish without an error
    pub muted: HashSet<usize>,
}

impl Network {
    fn allocate(&mut self) -> LinkHandle {
        self.next_link += 1;
        LinkHandle(self.next_link)
    }

    fn unlink(&mut self, node: usize, link: LinkHandle) -> Option<(usize, LinkHandle)> {
        let peer = self.pairs.remove(&(node, link))?;
        self.pairs.remove(&peer);
        Some(peer)
    }
}

/// Transport whose links are in-process queues
#[derive(Debug)]
pub struct LoopbackTransport {
    node: usize,
    net: Rc<RefCell<Network>>,
}

impl Transport for LoopbackTransport {
    fn connect(&mut self, addr: &str) -> Result<LinkHandle, TransportError> {
        let mut net = self.net.borrow_mut();
        let target = *net.addresses.get(addr).ok_or(TransportError::Refused)?;
        let local = net.allocate();
        let remote = net.allocate();
        net.pairs.insert((self.node, local), (target, remote));
        net.pairs.insert((target, remote), (self.node, local));
        net.pending.push_back((self.node, Delivery::Connected(local)));
        net.pending.push_back((target, Delivery::Incoming(remote)));
        Ok(local)
    }

    fn send(&mut self, link: LinkHandle, bytes: &[u8]) -> Result<(), TransportError> {
        let mut net = self.net.borrow_mut();
        let (peer, peer_link) = *net
            .pairs
            .get(&(self.node, link))
            .ok_or(TransportError::NotConnected)?;
        net.frames_sent += 1;
        if net.muted.contains(&self.node) {
            return Ok(());
        }
        net.pending
            .push_back((peer, Delivery::Data(peer_link, bytes.to_vec())));
        Ok(())
    }

    fn close(&mut self, link: LinkHandle) {
        let mut net = self.net.borrow_mut();
        if let Some((peer, peer_link)) = net.unlink(self.node, link) {
            net.pending.push_back((peer, Delivery::Closed(peer_link)));
        }
    }

    fn release(&mut self, link: LinkHandle) {
        self.net.borrow_mut().released.insert((self.node, link));
    }
}

/// Radio with a scripted scan result
#[derive(Debug, Default)]
pub struct FakeRadio {
    pub visible: Vec<ScanRecord>,
    pub fail_association: bool,
    pub associated: Option<String>,
}

impl FakeRadio {
    pub fn with_router(rssi: Rssi) -> Self {
        Self {
            visible: vec![ScanRecord {
                ssid: ROUTER_SSID.to_string(),
                rssi,
                channel: 6,
            }],
            ..Self::default()
        }
    }
}

impl Radio for FakeRadio {
    fn scan(&mut self) -> Vec<ScanRecord> {
        self.visible.clone()
    }

    fn associate(&mut self, ssid: &str, _password: &str, _channel: u8) -> Result<(), RadioError> {
        if self.fail_association {
            return Err(RadioError::AssociationFailed {
                ssid: ssid.to_string(),
            });
        }
        self.associated = Some(ssid.to_string());
        Ok(())
    }

    fn disassociate(&mut self) {
        self.associated = None;
    }
}

/// Config for a node that holds router credentials
pub fn bridge_capable_config(node_id: u32) -> MeshConfig {
    let mut config = MeshConfig::for_node(NodeId(node_id), "orchard");
    config.router = Some(RouterCredentials {
        ssid: ROUTER_SSID.to_string(),
        password: "secret".to_string(),
        channel: 0,
    });
    config.election.rng_seed = Some(u64::from(node_id));
    config
}

/// Several engines on one loopback network with lock-stepped clocks
pub struct MeshHarness {
    net: Rc<RefCell<Network>>,
    nodes: Vec<TestEngine>,
    alive: Vec<bool>,
    now: u64,
}

impl MeshHarness {
    pub fn new() -> Self {
        Self {
            net: Rc::new(RefCell::new(Network::default())),
            nodes: Vec::new(),
            alive: Vec::new(),
            now: 0,
        }
    }

    /// Add a plain mesh node
    pub fn add_node(&mut self, node_id: u32) -> usize {
        self.add_with(MeshConfig::for_node(NodeId(node_id), "orchard"), FakeRadio::default())
    }

    /// Add a node with router credentials that sees the router at `rssi`
    pub fn add_bridge_capable(&mut self, node_id: u32, rssi: Rssi) -> usize {
        self.add_with(bridge_capable_config(node_id), FakeRadio::with_router(rssi))
    }

    pub fn add_with(&mut self, config: MeshConfig, radio: FakeRadio) -> usize {
        let idx = self.nodes.len();
        self.net
            .borrow_mut()
            .addresses
            .insert(address(idx), idx);
        let transport = LoopbackTransport {
            node: idx,
            net: Rc::clone(&self.net),
        };
        let mut scheduler = ManualScheduler::new();
        scheduler.advance_to(self.now);
        let engine = MeshEngine::init(config, transport, scheduler, radio).unwrap();
        self.nodes.push(engine);
        self.alive.push(true);
        idx
    }

    pub fn node(&mut self, idx: usize) -> &mut TestEngine {
        &mut self.nodes[idx]
    }

    pub fn node_id(&self, idx: usize) -> NodeId {
        self.nodes[idx].node_id()
    }

    pub fn now(&self) -> u64 {
        self.now
    }

    pub fn net(&self) -> std::cell::Ref<'_, Network> {
        self.net.borrow()
    }

    /// `from` dials `to` and the handshake runs to completion
    pub fn connect(&mut self, from: usize, to: usize) {
        self.nodes[from].dial(&address(to)).unwrap();
        self.pump();
    }

    /// Power a node off: its links reset and its address stops answering
    pub fn kill(&mut self, idx: usize) {
        self.alive[idx] = false;
        let mut net = self.net.borrow_mut();
        net.addresses.remove(&address(idx));
        let links: Vec<(usize, LinkHandle)> = net
            .pairs
            .keys()
            .filter(|(node, _)| *node == idx)
            .copied()
            .collect();
        for (node, link) in links {
            if let Some((peer, peer_link)) = net.unlink(node, link) {
                net.pending.push_back((peer, Delivery::Error(peer_link, -104)));
            }
        }
    }

    /// A node hangs: its links stay open but nothing it sends arrives
    pub fn mute(&mut self, idx: usize) {
        self.net.borrow_mut().muted.insert(idx);
    }

    /// Established link ends summed over every live node
    pub fn link_ends(&self) -> usize {
        (0..self.nodes.len())
            .filter(|idx| self.alive[*idx])
            .map(|idx| self.nodes[idx].connections().established().len())
            .sum()
    }

    /// Deliver queued network activity until the network is quiet
    pub fn pump(&mut self) {
        for _ in 0..100_000 {
            let next = self.net.borrow_mut().pending.pop_front();
            let Some((idx, delivery)) = next else {
                return;
            };
            if !self.alive[idx] {
                continue;
            }
            let engine = &mut self.nodes[idx];
            match delivery {
                Delivery::Incoming(link) => engine.on_incoming(link),
                Delivery::Connected(link) => engine.on_connected(link),
                Delivery::Data(link, bytes) => engine.on_data(link, &bytes),
                Delivery::Closed(link) => engine.on_closed(link),
                Delivery::Error(link, code) => engine.on_error(link, code),
            }
        }
        panic!("network never went quiet");
    }

    /// Advance every live clock by `delta_ms`, firing tasks in deadline
    /// order across nodes
    pub fn advance(&mut self, delta_ms: u64) {
        let target = self.now + delta_ms;
        loop {
            let next = self
                .nodes
                .iter()
                .zip(&self.alive)
                .filter(|(_, alive)| **alive)
                .filter_map(|(engine, _)| engine.scheduler().next_deadline())
                .filter(|at| *at <= target)
                .min();
            let Some(at) = next else {
                break;
            };
            self.step_to(at);
        }
        self.step_to(target);
    }

    fn step_to(&mut self, at: u64) {
        self.now = self.now.max(at);
        for idx in 0..self.nodes.len() {
            if !self.alive[idx] {
                continue;
            }
            self.nodes[idx].scheduler_mut().advance_to(self.now);
            self.nodes[idx].tick();
            self.pump();
        }
    }

    pub fn events(&mut self, idx: usize) -> Vec<MeshEvent> {
        self.nodes[idx].drain_events()
    }

    /// Indices of live nodes currently acting as bridge
    pub fn bridges(&self) -> Vec<usize> {
        (0..self.nodes.len())
            .filter(|idx| self.alive[*idx] && self.nodes[*idx].is_bridge())
            .collect()
    }

    pub fn scheduler_now(&self, idx: usize) -> u64 {
        self.nodes[idx].scheduler().now_ms()
    }
}

pub fn address(idx: usize) -> String {
    format!("node-{idx}:5555")
}

/// Count events matching `pred`
pub fn count<F: Fn(&MeshEvent) -> bool>(events: &[MeshEvent], pred: F) -> usize {
    events.iter().filter(|e| pred(e)).count()
}
