//! Ricart-Agrawala mutual exclusion: `acquire()` broadcasts a timestamped
//! request to every peer and blocks until every peer has replied, `release()`
//! answers any request it deferred while holding (or wanting) the section.
//! Ordering uses a Lamport logical clock paired with `node_id` as the
//! tie-break, per §4.3 of the spec — total order across the cluster without
//! relying on synchronized wall clocks.
//!
//! Grounded in the mutual-exclusion half of `backend/src/bully/bully_node.py`
//! (the same node class also drives the election in the original program;
//! this port splits it into its own crate so the Coordinator can compose it
//! independently, per the redesign notes in §9).

use async_trait::async_trait;
use parking_lot::Mutex;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tracing::debug;
use wardnet_common::{ClusterConfig, Frame, NodeId, PeerInfo};
use wardnet_transport::{TcpHandler, Transport};

#[derive(Debug, thiserror::Error, PartialEq, Eq)]
pub enum MutexError {
    #[error("mutex acquisition timed out before every peer replied")]
    Timeout,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MutexState {
    Idle,
    Requesting,
    InCs,
}

#[derive(Debug, Clone)]
pub struct MutexStatus {
    pub state: MutexState,
    pub pending_replies: usize,
    pub deferred_count: usize,
}

struct Inner {
    clock: u64,
    want_cs: bool,
    in_cs: bool,
    request_ts: Option<u64>,
    pending_replies: usize,
    deferred: Vec<NodeId>,
}

/// One node's view of the distributed mutex. Construct with
/// [`DistributedMutex::new`] and call [`DistributedMutex::register_handlers`]
/// before the shared [`Transport`] starts listening.
pub struct DistributedMutex {
    node_id: NodeId,
    peers: HashMap<NodeId, PeerInfo>,
    transport: Arc<Transport>,
    tcp_send_timeout: Duration,
    inner: Mutex<Inner>,
}

impl DistributedMutex {
    pub fn new(config: &ClusterConfig, transport: Arc<Transport>) -> Arc<Self> {
        Arc::new(Self {
            node_id: config.node_id,
            peers: config.cluster_directory.clone(),
            transport,
            tcp_send_timeout: config.tcp_send_timeout(),
            inner: Mutex::new(Inner {
                clock: 0,
                want_cs: false,
                in_cs: false,
                request_ts: None,
                pending_replies: 0,
                deferred: Vec::new(),
            }),
        })
    }

    pub fn register_handlers(self: &Arc<Self>) {
        self.transport.register_tcp("MUTEX_REQUEST", Arc::new(MutexRequestHandler(self.clone())));
        self.transport.register_tcp("MUTEX_REPLY", Arc::new(MutexReplyHandler(self.clone())));
        self.transport.register_tcp("MUTEX_RELEASE", Arc::new(MutexReleaseHandler(self.clone())));
    }

    pub fn node_id(&self) -> NodeId {
        self.node_id
    }

    pub fn status(&self) -> MutexStatus {
        let inner = self.inner.lock();
        let state = if inner.in_cs {
            MutexState::InCs
        } else if inner.want_cs {
            MutexState::Requesting
        } else {
            MutexState::Idle
        };
        MutexStatus { state, pending_replies: inner.pending_replies, deferred_count: inner.deferred.len() }
    }

    pub fn is_in_cs(&self) -> bool {
        self.inner.lock().in_cs
    }

    /// Blocks until every peer has replied to this node's request or
    /// `deadline` elapses, whichever comes first. On timeout the request is
    /// abandoned (`want_cs` cleared) but any requests this node itself
    /// deferred are left untouched, to be answered on the next `release()`.
    pub async fn acquire(self: &Arc<Self>, deadline: Duration) -> Result<(), MutexError> {
        let (ts, peer_count) = {
            let mut inner = self.inner.lock();
            inner.clock += 1;
            inner.want_cs = true;
            inner.request_ts = Some(inner.clock);
            inner.pending_replies = self.peers.len();
            (inner.clock, self.peers.len())
        };

        if peer_count == 0 {
            self.inner.lock().in_cs = true;
            return Ok(());
        }

        let frame = Frame::mutex_request(self.node_id, ts as f64);
        let mut sends = tokio::task::JoinSet::new();
        for peer in self.peers.values().cloned() {
            let transport = self.transport.clone();
            let frame = frame.clone();
            let timeout = self.tcp_send_timeout;
            sends.spawn(async move {
                transport.send_tcp(&peer.host, peer.tcp_port, &frame, timeout).await;
            });
        }
        while sends.join_next().await.is_some() {}

        let wait_until = Instant::now() + deadline;
        loop {
            if self.inner.lock().pending_replies == 0 {
                self.inner.lock().in_cs = true;
                return Ok(());
            }
            if Instant::now() >= wait_until {
                let mut inner = self.inner.lock();
                inner.want_cs = false;
                inner.request_ts = None;
                inner.pending_replies = 0;
                return Err(MutexError::Timeout);
            }
            tokio::time::sleep(Duration::from_millis(15)).await;
        }
    }

    /// Leaves the critical section: clears `want_cs`/`in_cs`, broadcasts an
    /// informational `MUTEX_RELEASE`, and replies to every peer this node
    /// deferred while it held or wanted the section.
    pub async fn release(&self) {
        let deferred = {
            let mut inner = self.inner.lock();
            inner.want_cs = false;
            inner.in_cs = false;
            inner.request_ts = None;
            std::mem::take(&mut inner.deferred)
        };

        let release_frame = Frame::mutex_release(self.node_id);
        let reply_frame = Frame::mutex_reply(self.node_id);
        let mut sends = tokio::task::JoinSet::new();

        for peer in self.peers.values().cloned() {
            let transport = self.transport.clone();
            let frame = release_frame.clone();
            let timeout = self.tcp_send_timeout;
            sends.spawn(async move {
                transport.send_tcp(&peer.host, peer.tcp_port, &frame, timeout).await;
            });
        }
        for peer_id in deferred {
            let Some(peer) = self.peers.get(&peer_id).cloned() else { continue };
            let transport = self.transport.clone();
            let frame = reply_frame.clone();
            let timeout = self.tcp_send_timeout;
            sends.spawn(async move {
                transport.send_tcp(&peer.host, peer.tcp_port, &frame, timeout).await;
            });
        }
        while sends.join_next().await.is_some() {}
    }

    async fn handle_request(self: Arc<Self>, frame: Frame) -> Option<Frame> {
        let Frame::MutexRequest { sender_id, ts, .. } = frame else { return None };
        let their_ts = ts as u64;

        let should_defer = {
            let mut inner = self.inner.lock();
            inner.clock = inner.clock.max(their_ts) + 1;
            let my_priority = (inner.request_ts.unwrap_or(0), self.node_id);
            let their_priority = (their_ts, sender_id);
            let defer = inner.in_cs || (inner.want_cs && my_priority < their_priority);
            if defer && !inner.deferred.contains(&sender_id) {
                inner.deferred.push(sender_id);
            }
            defer
        };

        if should_defer {
            debug!(node_id = self.node_id, from = sender_id, their_ts, "deferring MUTEX_REQUEST");
        } else if let Some(peer) = self.peers.get(&sender_id).cloned() {
            let transport = self.transport.clone();
            let reply = Frame::mutex_reply(self.node_id);
            let timeout = self.tcp_send_timeout;
            tokio::spawn(async move {
                transport.send_tcp(&peer.host, peer.tcp_port, &reply, timeout).await;
            });
        }
        None
    }

    async fn handle_reply(self: Arc<Self>, frame: Frame) -> Option<Frame> {
        if let Frame::MutexReply { sender_id, .. } = frame {
            let mut inner = self.inner.lock();
            if inner.pending_replies > 0 {
                inner.pending_replies -= 1;
            }
            debug!(node_id = self.node_id, from = sender_id, remaining = inner.pending_replies, "received MUTEX_REPLY");
        }
        None
    }

    async fn handle_release(self: Arc<Self>, frame: Frame) -> Option<Frame> {
        if let Frame::MutexRelease { sender_id, .. } = frame {
            debug!(node_id = self.node_id, from = sender_id, "received MUTEX_RELEASE");
        }
        None
    }
}

struct MutexRequestHandler(Arc<DistributedMutex>);
#[async_trait]
impl TcpHandler for MutexRequestHandler {
    async fn handle(&self, frame: Frame) -> Option<Frame> {
        self.0.clone().handle_request(frame).await
    }
}

struct MutexReplyHandler(Arc<DistributedMutex>);
#[async_trait]
impl TcpHandler for MutexReplyHandler {
    async fn handle(&self, frame: Frame) -> Option<Frame> {
        self.0.clone().handle_reply(frame).await
    }
}

struct MutexReleaseHandler(Arc<DistributedMutex>);
#[async_trait]
impl TcpHandler for MutexReleaseHandler {
    async fn handle(&self, frame: Frame) -> Option<Frame> {
        self.0.clone().handle_release(frame).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Mutex as StdMutex;

    async fn spin_up_cluster(count: u32) -> Vec<Arc<DistributedMutex>> {
        let mut transports = Vec::new();
        for id in 1..=count {
            let transport = Transport::new("127.0.0.1", 0, 0);
            transport.start().await.unwrap();
            transports.push((id, transport));
        }

        let mut addrs = HashMap::new();
        for (id, transport) in &transports {
            addrs.insert(*id, (transport.local_tcp_port().await, transport.local_udp_port().await));
        }

        let mut mutexes = Vec::new();
        for (id, transport) in transports {
            let mut directory = HashMap::new();
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
            let mutex = DistributedMutex::new(&config, transport);
            mutex.register_handlers();
            mutexes.push(mutex);
        }
        mutexes
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn single_node_acquires_immediately() {
        let mutexes = spin_up_cluster(1).await;
        mutexes[0].acquire(Duration::from_secs(1)).await.unwrap();
        assert!(mutexes[0].is_in_cs());
        mutexes[0].release().await;
        assert!(!mutexes[0].is_in_cs());
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn concurrent_acquires_are_mutually_exclusive() {
        let mutexes = spin_up_cluster(4).await;
        let inside = Arc::new(AtomicUsize::new(0));
        let violations = Arc::new(AtomicUsize::new(0));
        let order = Arc::new(StdMutex::new(Vec::new()));

        let mut handles = Vec::new();
        for mutex in mutexes {
            let inside = inside.clone();
            let violations = violations.clone();
            let order = order.clone();
            handles.push(tokio::spawn(async move {
                mutex.acquire(Duration::from_secs(5)).await.unwrap();
                let now_inside = inside.fetch_add(1, Ordering::SeqCst) + 1;
                if now_inside > 1 {
                    violations.fetch_add(1, Ordering::SeqCst);
                }
                order.lock().unwrap().push(mutex.node_id);
                tokio::time::sleep(Duration::from_millis(30)).await;
                inside.fetch_sub(1, Ordering::SeqCst);
                mutex.release().await;
            }));
        }
        for handle in handles {
            handle.await.unwrap();
        }

        assert_eq!(violations.load(Ordering::SeqCst), 0);
        assert_eq!(order.lock().unwrap().len(), 4);
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn acquire_times_out_when_a_peer_never_replies() {
        let mutexes = spin_up_cluster(2).await;
        // node 2 grabs the section and never releases it.
        mutexes[1].acquire(Duration::from_secs(1)).await.unwrap();

        let result = mutexes[0].acquire(Duration::from_millis(300)).await;
        assert_eq!(result, Err(MutexError::Timeout));
        assert!(!mutexes[0].is_in_cs());
    }
}
