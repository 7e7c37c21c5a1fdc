//! Bully-style leader election: the node with the highest `node_id` in the
//! cluster directory becomes leader, announces itself with `COORDINATOR`,
//! and is kept alive in followers' eyes by periodic `HEARTBEAT`s. A
//! smart-acceptance rule keeps a live higher-priority node from ever
//! yielding to a lower one, and lets followers fall back to a lower-id
//! leader only once every higher-id peer has been silent for a full grace
//! period — this is the split-brain guard described in §4.2 of the spec.
//!
//! Grounded in `backend/src/bully/bully_node.py`'s `BullyNode` class from
//! the original program (`start_election`, `_become_leader`,
//! `_should_accept_leader`), ported onto a `tokio` task per thread and a
//! `parking_lot::Mutex` per lock, per the re-architecture notes in §9.

use async_trait::async_trait;
use parking_lot::Mutex;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};
use wardnet_common::{ClusterConfig, Frame, NodeId};
use wardnet_transport::{TcpHandler, Transport, UdpHandler};

/// Invoked on every accepted `current_leader` change (including this node
/// electing itself), outside any internal lock. Stands in for the
/// out-of-scope terminal UI / notification monitor.
pub trait LeadershipSink: Send + Sync {
    fn on_leader_change(&self, leader: NodeId, term: u64);
}

/// A sink that discards every notification.
pub struct NoopSink;
impl LeadershipSink for NoopSink {
    fn on_leader_change(&self, _leader: NodeId, _term: u64) {}
}

/// Adapts a plain closure to [`LeadershipSink`].
pub struct FnSink<F>(pub F);
impl<F> LeadershipSink for FnSink<F>
where
    F: Fn(NodeId, u64) + Send + Sync,
{
    fn on_leader_change(&self, leader: NodeId, term: u64) {
        (self.0)(leader, term)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum NodeState {
    Follower,
    Leader,
}

#[derive(Debug, Clone)]
pub struct ElectionStatus {
    pub node_id: NodeId,
    pub state: NodeState,
    pub current_leader: Option<NodeId>,
    pub is_leader: bool,
    pub term: u64,
}

struct Inner {
    state: NodeState,
    current_leader: Option<NodeId>,
    election_in_progress: bool,
    term: u64,
    last_heartbeat_received: Instant,
    node_last_seen: HashMap<NodeId, Instant>,
}

/// One node's election state machine. Construct with [`Election::new`],
/// call [`Election::register_handlers`] before the shared [`Transport`]
/// starts listening, then [`Election::start`] once it has.
pub struct Election {
    config: ClusterConfig,
    transport: Arc<Transport>,
    sink: Arc<dyn LeadershipSink>,
    inner: Mutex<Inner>,
    cancel: CancellationToken,
}

impl Election {
    pub fn new(config: ClusterConfig, transport: Arc<Transport>, sink: Arc<dyn LeadershipSink>) -> Arc<Self> {
        let now = Instant::now();
        let node_last_seen = config.cluster_directory.keys().map(|&id| (id, now)).collect();
        Arc::new(Self {
            config,
            transport,
            sink,
            inner: Mutex::new(Inner {
                state: NodeState::Follower,
                current_leader: None,
                election_in_progress: false,
                term: 0,
                last_heartbeat_received: now,
                node_last_seen,
            }),
            cancel: CancellationToken::new(),
        })
    }

    pub fn node_id(&self) -> NodeId {
        self.config.node_id
    }

    pub fn is_leader(&self) -> bool {
        self.inner.lock().state == NodeState::Leader
    }

    pub fn current_leader(&self) -> Option<NodeId> {
        self.inner.lock().current_leader
    }

    pub fn status(&self) -> ElectionStatus {
        let inner = self.inner.lock();
        ElectionStatus {
            node_id: self.config.node_id,
            state: inner.state,
            current_leader: inner.current_leader,
            is_leader: inner.state == NodeState::Leader,
            term: inner.term,
        }
    }

    /// Binds this node's handlers onto the shared transport. Must be
    /// called before `transport.start()`, so no inbound frame is dropped
    /// for want of a registered handler.
    pub fn register_handlers(self: &Arc<Self>) {
        self.transport.register_tcp("ELECTION", Arc::new(TcpElectionHandler(self.clone())));
        self.transport.register_tcp("COORDINATOR", Arc::new(TcpCoordinatorHandler(self.clone())));
        self.transport.register_udp("HEARTBEAT", Arc::new(UdpHeartbeatHandler(self.clone())));
        self.transport.register_udp("BUSINESS_EVENT", Arc::new(UdpBusinessEventHandler(self.clone())));
    }

    /// Best-effort, fire-and-forget notice to every peer that a leader-gated
    /// transaction committed. Not part of the correctness-critical protocol;
    /// a peer that never receives it observes nothing incorrect.
    pub async fn broadcast_business_event(&self) {
        let frame = Frame::business_event(self.node_id());
        for peer in self.config.cluster_directory.values() {
            self.transport.send_udp(&peer.host, peer.udp_port, &frame).await;
        }
    }

    /// Spawns the heartbeat and monitor loops, then waits a short settling
    /// window for an inbound `COORDINATOR`/`HEARTBEAT` before forcing an
    /// election. The caller's transport must already be listening.
    pub async fn start(self: &Arc<Self>) {
        let hb = self.clone();
        tokio::spawn(async move { hb.heartbeat_loop().await });
        let mon = self.clone();
        tokio::spawn(async move { mon.monitor_loop().await });

        tokio::time::sleep(Duration::from_secs(2)).await;
        if self.current_leader().is_none() {
            self.clone().start_election().await;
        }
    }

    pub fn stop(&self) {
        self.cancel.cancel();
    }

    /// Idempotent under the `election_in_progress` guard: starts a Bully
    /// election round, either declaring this node leader immediately (no
    /// higher peer, or none answered) or waiting for a `COORDINATOR`.
    pub async fn start_election(self: Arc<Self>) {
        let term = {
            let mut inner = self.inner.lock();
            if inner.election_in_progress {
                debug!(node_id = self.node_id(), "election already in progress, skipping");
                return;
            }
            inner.election_in_progress = true;
            inner.term += 1;
            // Stale from a prior round; only a COORDINATOR/HEARTBEAT accepted
            // during *this* round may settle the wait loop below.
            inner.current_leader = None;
            inner.term
        };
        info!(node_id = self.node_id(), term, "starting election");

        let higher: Vec<NodeId> =
            self.config.cluster_directory.keys().copied().filter(|&id| id > self.node_id()).collect();

        if higher.is_empty() {
            info!(node_id = self.node_id(), "no higher-id peers, becoming leader");
            self.become_leader().await;
            return;
        }

        let mut ok_count = 0usize;
        for &peer_id in &higher {
            let peer = &self.config.cluster_directory[&peer_id];
            let frame = Frame::election(self.node_id());
            let response =
                self.transport.send_tcp(&peer.host, peer.tcp_port, &frame, self.config.tcp_send_timeout()).await;
            if matches!(response, Some(Frame::Ok { .. })) {
                ok_count += 1;
                debug!(node_id = self.node_id(), from = peer_id, "received OK");
            }
        }

        if ok_count == 0 {
            info!(node_id = self.node_id(), "no OK responses, becoming leader");
            self.become_leader().await;
            return;
        }

        info!(node_id = self.node_id(), ok_count, "waiting for COORDINATOR");
        self.inner.lock().state = NodeState::Follower;

        let deadline = Instant::now() + self.config.election_timeout();
        loop {
            if self.inner.lock().current_leader.is_some() {
                self.inner.lock().election_in_progress = false;
                info!(node_id = self.node_id(), "COORDINATOR received, election settled");
                return;
            }
            if Instant::now() >= deadline {
                break;
            }
            tokio::time::sleep(Duration::from_millis(200)).await;
        }

        warn!(node_id = self.node_id(), "no COORDINATOR received, restarting election");
        self.inner.lock().election_in_progress = false;
        let this = self.clone();
        tokio::spawn(async move { this.start_election().await });
    }

    async fn become_leader(self: Arc<Self>) {
        let term = {
            let mut inner = self.inner.lock();
            inner.state = NodeState::Leader;
            inner.current_leader = Some(self.node_id());
            inner.term
        };
        warn!(node_id = self.node_id(), term, "becoming leader");

        let announce_timeout = self.config.coordinator_announce_timeout();
        let mut announcements = tokio::task::JoinSet::new();
        for peer in self.config.cluster_directory.values().cloned() {
            let transport = self.transport.clone();
            let frame = Frame::coordinator(self.node_id());
            announcements.spawn(async move {
                transport.send_tcp(&peer.host, peer.tcp_port, &frame, announce_timeout).await;
            });
        }
        while announcements.join_next().await.is_some() {}

        self.sink.on_leader_change(self.node_id(), term);
        self.inner.lock().election_in_progress = false;
    }

    /// Smart-acceptance rule: when would this node accept `leader_id` as
    /// the current leader?
    fn should_accept_leader(&self, leader_id: NodeId) -> bool {
        if leader_id > self.node_id() {
            return true;
        }

        let inner = self.inner.lock();
        if inner.state == NodeState::Leader {
            // A live higher-priority node must never yield to a lower one.
            return false;
        }

        let now = Instant::now();
        for &peer_id in self.config.cluster_directory.keys() {
            if peer_id > leader_id {
                if let Some(&last_seen) = inner.node_last_seen.get(&peer_id) {
                    if now.duration_since(last_seen) < self.config.grace_period() {
                        return false;
                    }
                }
            }
        }
        true
    }

    fn update_node_activity(&self, node_id: NodeId) {
        if node_id == self.node_id() {
            return;
        }
        if let Some(slot) = self.inner.lock().node_last_seen.get_mut(&node_id) {
            *slot = Instant::now();
        }
    }

    async fn handle_election(self: Arc<Self>, frame: Frame) -> Option<Frame> {
        let Frame::Election { sender_id, .. } = frame else { return None };
        debug!(node_id = self.node_id(), from = sender_id, "received ELECTION");
        self.update_node_activity(sender_id);

        if self.node_id() > sender_id {
            let this = self.clone();
            tokio::spawn(async move { this.start_election().await });
            Some(Frame::ok(self.node_id()))
        } else {
            None
        }
    }

    async fn handle_coordinator(self: Arc<Self>, frame: Frame) -> Option<Frame> {
        let Frame::Coordinator { sender_id: new_leader, .. } = frame else { return None };
        debug!(node_id = self.node_id(), from = new_leader, "received COORDINATOR");
        self.update_node_activity(new_leader);

        if !self.should_accept_leader(new_leader) {
            warn!(node_id = self.node_id(), new_leader, "rejected COORDINATOR");
            let in_progress = self.inner.lock().election_in_progress;
            if !in_progress {
                let this = self.clone();
                tokio::spawn(async move { this.start_election().await });
            }
            return None;
        }

        let term = {
            let mut inner = self.inner.lock();
            inner.current_leader = Some(new_leader);
            inner.state = NodeState::Follower;
            inner.last_heartbeat_received = Instant::now();
            inner.term
        };
        info!(node_id = self.node_id(), new_leader, "accepted COORDINATOR");
        self.sink.on_leader_change(new_leader, term);
        None
    }

    async fn handle_heartbeat(self: Arc<Self>, frame: Frame) {
        let Frame::Heartbeat { sender_id: leader_id, .. } = frame else { return };
        self.inner.lock().last_heartbeat_received = Instant::now();
        self.update_node_activity(leader_id);

        if !self.should_accept_leader(leader_id) {
            warn!(node_id = self.node_id(), leader_id, "rejected leader via HEARTBEAT");
            let in_progress = self.inner.lock().election_in_progress;
            if !in_progress {
                let this = self.clone();
                tokio::spawn(async move { this.start_election().await });
            }
            return;
        }

        let changed_term = {
            let mut inner = self.inner.lock();
            if inner.current_leader != Some(leader_id) {
                inner.current_leader = Some(leader_id);
                inner.state = NodeState::Follower;
                Some(inner.term)
            } else {
                None
            }
        };
        if let Some(term) = changed_term {
            info!(node_id = self.node_id(), leader_id, "leader discovered via HEARTBEAT");
            self.sink.on_leader_change(leader_id, term);
        }
    }

    async fn handle_business_event(self: Arc<Self>, frame: Frame) {
        if let Frame::BusinessEvent { sender_id, .. } = frame {
            debug!(node_id = self.node_id(), from = sender_id, "received business event");
        }
    }

    async fn heartbeat_loop(self: Arc<Self>) {
        loop {
            tokio::select! {
                _ = self.cancel.cancelled() => return,
                _ = tokio::time::sleep(self.config.heartbeat_interval()) => {}
            }
            if self.is_leader() {
                let frame = Frame::heartbeat(self.node_id());
                for peer in self.config.cluster_directory.values() {
                    self.transport.send_udp(&peer.host, peer.udp_port, &frame).await;
                }
            }
        }
    }

    async fn monitor_loop(self: Arc<Self>) {
        loop {
            tokio::select! {
                _ = self.cancel.cancelled() => return,
                _ = tokio::time::sleep(Duration::from_secs(1)) => {}
            }

            let should_elect = {
                let mut inner = self.inner.lock();
                if inner.state == NodeState::Follower
                    && inner.last_heartbeat_received.elapsed() > self.config.election_timeout()
                {
                    warn!(node_id = self.node_id(), "leader timeout, starting election");
                    inner.last_heartbeat_received = Instant::now();
                    true
                } else {
                    false
                }
            };
            if should_elect {
                let this = self.clone();
                tokio::spawn(async move { this.start_election().await });
            }
        }
    }
}

struct TcpElectionHandler(Arc<Election>);
#[async_trait]
impl TcpHandler for TcpElectionHandler {
    async fn handle(&self, frame: Frame) -> Option<Frame> {
        self.0.clone().handle_election(frame).await
    }
}

struct TcpCoordinatorHandler(Arc<Election>);
#[async_trait]
impl TcpHandler for TcpCoordinatorHandler {
    async fn handle(&self, frame: Frame) -> Option<Frame> {
        self.0.clone().handle_coordinator(frame).await
    }
}

struct UdpHeartbeatHandler(Arc<Election>);
#[async_trait]
impl UdpHandler for UdpHeartbeatHandler {
    async fn handle(&self, frame: Frame) {
        self.0.clone().handle_heartbeat(frame).await
    }
}

struct UdpBusinessEventHandler(Arc<Election>);
#[async_trait]
impl UdpHandler for UdpBusinessEventHandler {
    async fn handle(&self, frame: Frame) {
        self.0.clone().handle_business_event(frame).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap as StdHashMap;
    use wardnet_common::PeerInfo;

    /// Boots `count` nodes on loopback with OS-assigned ports, wires up
    /// each one's election handlers against a fresh transport, and returns
    /// the elections in `node_id` order alongside their transports (so
    /// tests can `stop()` a transport to simulate a node going down).
    async fn spin_up_cluster(count: u32) -> Vec<(Arc<Election>, Arc<Transport>)> {
        // Bind every transport first so we know the real ports before
        // building each node's directory of its peers.
        let mut transports = Vec::new();
        for id in 1..=count {
            let transport = Transport::new("127.0.0.1", 0, 0);
            transport.start().await.unwrap();
            transports.push((id, transport));
        }

        let mut addrs = StdHashMap::new();
        for (id, transport) in &transports {
            addrs.insert(*id, (transport.local_tcp_port().await, transport.local_udp_port().await));
        }

        let mut nodes = Vec::new();
        for (id, transport) in transports {
            let mut directory = StdHashMap::new();
            for (&other_id, &(tcp, udp)) in &addrs {
                if other_id != id {
                    directory.insert(other_id, PeerInfo::new("127.0.0.1", tcp, udp));
                }
            }
            let config = ClusterConfig {
                node_id: id,
                cluster_directory: directory,
                heartbeat_interval_ms: 100,
                election_timeout_ms: 800,
                grace_period_ms: 2_000,
                tcp_send_timeout_ms: 500,
                coordinator_announce_timeout_ms: 500,
            };
            let election = Election::new(config, transport.clone(), Arc::new(NoopSink));
            election.register_handlers();
            nodes.push((election, transport));
        }

        for (election, _) in &nodes {
            election.start().await;
        }
        nodes
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn highest_id_wins_when_all_nodes_live() {
        let nodes = spin_up_cluster(4).await;
        tokio::time::sleep(Duration::from_secs(3)).await;

        let leaders: Vec<_> = nodes.iter().map(|(e, _)| e.current_leader()).collect();
        assert!(leaders.iter().all(|l| *l == Some(4)), "expected all nodes to agree on leader 4, got {leaders:?}");

        let is_leader_flags: Vec<_> = nodes.iter().map(|(e, _)| e.is_leader()).collect();
        assert_eq!(is_leader_flags.iter().filter(|&&l| l).count(), 1);
        assert!(nodes[3].0.is_leader());
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn failover_elects_next_highest_id() {
        let nodes = spin_up_cluster(4).await;
        tokio::time::sleep(Duration::from_secs(3)).await;
        assert!(nodes[3].0.is_leader());

        // Kill node 4 by tearing down its transport; its peers stop
        // hearing from it entirely.
        nodes[3].1.stop();
        nodes[3].0.stop();

        tokio::time::sleep(Duration::from_secs(3)).await;

        for (election, _) in &nodes[..3] {
            assert_eq!(election.current_leader(), Some(3), "node {} did not fail over to 3", election.node_id());
        }
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn single_node_cluster_becomes_leader_immediately() {
        let nodes = spin_up_cluster(1).await;
        tokio::time::sleep(Duration::from_millis(500)).await;
        assert!(nodes[0].0.is_leader());
        assert_eq!(nodes[0].0.current_leader(), Some(1));
    }
}
