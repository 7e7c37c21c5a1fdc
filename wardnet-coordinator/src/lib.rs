//! `run_leader_gated_txn`: the one operation external callers see. Checks
//! leadership, acquires the distributed mutex, runs a local store
//! transaction, commits, and releases the mutex on every exit path.
//!
//! Grounded in `backend/src/main.py`'s request-handling flow in the
//! original program, which gates every write against `is_leader()` before
//! touching SQLite; here that gate, the mutex acquisition and the store
//! transaction are fused into one guaranteed-cleanup call per §4.4.

use std::sync::Arc;
use std::time::Duration;
use tracing::warn;
use wardnet_common::NodeId;
use wardnet_election::Election;
use wardnet_mutex::{DistributedMutex, MutexError};
use wardnet_store::{LocalStore, StoreError, Transaction};

#[derive(Debug, thiserror::Error)]
pub enum CoordinatorError<E: std::fmt::Debug + std::fmt::Display> {
    #[error("this node is not the leader (current leader: {current_leader:?})")]
    NotLeader { current_leader: Option<NodeId> },
    #[error("mutex acquisition timed out")]
    MutexTimeout,
    #[error("work closure failed: {0}")]
    Work(E),
    #[error("store commit failed: {0}")]
    StoreCommit(StoreError),
}

impl<E: std::fmt::Debug + std::fmt::Display> From<MutexError> for CoordinatorError<E> {
    fn from(_: MutexError) -> Self {
        CoordinatorError::MutexTimeout
    }
}

/// Composes [`Election`], [`DistributedMutex`] and a [`LocalStore`] behind
/// the single `run_leader_gated_txn` entry point.
pub struct Coordinator {
    election: Arc<Election>,
    mutex: Arc<DistributedMutex>,
    store: Arc<dyn LocalStore>,
}

impl Coordinator {
    pub fn new(election: Arc<Election>, mutex: Arc<DistributedMutex>, store: Arc<dyn LocalStore>) -> Self {
        Self { election, mutex, store }
    }

    /// Runs `work` inside a leader-gated, mutually-exclusive local store
    /// transaction. `work` receives a mutable [`Transaction`] and returns
    /// its own result type `R` or error `E`; on success the transaction is
    /// committed before this returns `Ok(R)`, on any failure it is rolled
    /// back. The mutex is always released before returning, regardless of
    /// which step failed. On a successful commit, a best-effort
    /// `BUSINESS_EVENT` frame is broadcast to every peer (informational
    /// only, outside the correctness-critical mutex/election traffic).
    pub async fn run_leader_gated_txn<F, R, E>(
        &self,
        work: F,
        timeout: Duration,
    ) -> Result<R, CoordinatorError<E>>
    where
        F: FnOnce(&mut Transaction) -> Result<R, E>,
        E: std::fmt::Debug + std::fmt::Display,
    {
        if !self.election.is_leader() {
            let current_leader = self.election.current_leader();
            return Err(CoordinatorError::NotLeader { current_leader });
        }

        self.mutex.acquire(timeout).await?;

        let mut tx = self.store.begin();
        let result = work(&mut tx);

        match result {
            Ok(value) => match self.store.commit(tx) {
                Ok(()) => {
                    self.mutex.release().await;
                    self.election.broadcast_business_event().await;
                    Ok(value)
                }
                Err(e) => {
                    warn!("store commit failed: {e}");
                    self.mutex.release().await;
                    Err(CoordinatorError::StoreCommit(e))
                }
            },
            Err(e) => {
                self.store.rollback(tx);
                self.mutex.release().await;
                Err(CoordinatorError::Work(e))
            }
        }
    }

    pub fn is_leader(&self) -> bool {
        self.election.is_leader()
    }

    pub fn current_leader(&self) -> Option<NodeId> {
        self.election.current_leader()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;
    use wardnet_common::{ClusterConfig, PeerInfo};
    use wardnet_election::NoopSink;
    use wardnet_store::{InMemoryStore, NewPatient};
    use wardnet_transport::Transport;

    #[tokio::test(flavor = "multi_thread")]
    async fn leader_gated_txn_commits_on_success() {
        let transport = Transport::new("127.0.0.1", 0, 0);
        transport.start().await.unwrap();
        let config = ClusterConfig {
            node_id: 1,
            cluster_directory: HashMap::new(),
            heartbeat_interval_ms: 100,
            election_timeout_ms: 500,
            grace_period_ms: 1_000,
            tcp_send_timeout_ms: 300,
            coordinator_announce_timeout_ms: 300,
        };
        let election = Election::new(config.clone(), transport.clone(), Arc::new(NoopSink));
        election.register_handlers();
        let mutex = DistributedMutex::new(&config, transport);
        mutex.register_handlers();
        election.start().await;
        tokio::time::sleep(Duration::from_millis(50)).await;
        assert!(election.is_leader());

        let store = Arc::new(InMemoryStore::new());
        store.seed_doctor(1, "Dr. Alvarez", "Emergency Medicine");
        store.seed_bed(1, 3);
        let coordinator = Coordinator::new(election, mutex, store.clone());

        let visit_id = coordinator
            .run_leader_gated_txn(
                |tx| tx.create_visit(NewPatient { name: "J. Doe".into(), arrival_reason: "chest pain".into() }),
                Duration::from_secs(1),
            )
            .await
            .unwrap();

        let tx = store.begin();
        assert!(tx.visit(visit_id).is_some());
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn leader_gated_txn_rolls_back_on_work_error() {
        let transport = Transport::new("127.0.0.1", 0, 0);
        transport.start().await.unwrap();
        let config = ClusterConfig {
            node_id: 1,
            cluster_directory: HashMap::new(),
            heartbeat_interval_ms: 100,
            election_timeout_ms: 500,
            grace_period_ms: 1_000,
            tcp_send_timeout_ms: 300,
            coordinator_announce_timeout_ms: 300,
        };
        let election = Election::new(config.clone(), transport.clone(), Arc::new(NoopSink));
        election.register_handlers();
        let mutex = DistributedMutex::new(&config, transport);
        mutex.register_handlers();
        election.start().await;
        tokio::time::sleep(Duration::from_millis(50)).await;

        // No doctors seeded: create_visit always fails.
        let store = Arc::new(InMemoryStore::new());
        let coordinator = Coordinator::new(election, mutex, store.clone());

        let result = coordinator
            .run_leader_gated_txn(
                |tx: &mut Transaction| tx.create_visit(NewPatient { name: "A".into(), arrival_reason: "x".into() }),
                Duration::from_secs(1),
            )
            .await;

        assert!(matches!(result, Err(CoordinatorError::Work(StoreError::NoAvailableDoctor))));
        assert!(!coordinator.mutex.is_in_cs());
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn non_leader_is_rejected_without_touching_the_store() {
        let transport = Transport::new("127.0.0.1", 0, 0);
        transport.start().await.unwrap();
        let mut directory = HashMap::new();
        directory.insert(2, PeerInfo::new("127.0.0.1", 1, 1));
        let config = ClusterConfig {
            node_id: 1,
            cluster_directory: directory,
            heartbeat_interval_ms: 100,
            election_timeout_ms: 200,
            grace_period_ms: 500,
            tcp_send_timeout_ms: 50,
            coordinator_announce_timeout_ms: 50,
        };
        let election = Election::new(config.clone(), transport.clone(), Arc::new(NoopSink));
        election.register_handlers();
        let mutex = DistributedMutex::new(&config, transport);
        mutex.register_handlers();
        // Deliberately never call election.start(): this node stays a
        // follower with no known leader.

        let store = Arc::new(InMemoryStore::new());
        let coordinator = Coordinator::new(election, mutex, store);

        let result: Result<u64, CoordinatorError<StoreError>> = coordinator
            .run_leader_gated_txn(|tx| tx.create_visit(NewPatient { name: "A".into(), arrival_reason: "x".into() }), Duration::from_millis(100))
            .await;

        assert!(matches!(result, Err(CoordinatorError::NotLeader { current_leader: None })));
    }
}
