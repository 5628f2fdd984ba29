//! Shared fakes and builders for rebalancer integration tests

#![allow(dead_code, clippy::unwrap_used, clippy::expect_used)]

use parking_lot::Mutex;
use partkv_core::{BatchPlan, Cluster, Node, NodeId, PartitionMove, Plan, StoreDefinition};
use partkv_rebalancer::{
    AdminClient, AdminError, MigrationError, PartitionMigrator, ServerState, StateTransition,
    StateTransitionRequest,
};
use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use std::time::Duration;
use tokio::time::Instant;

/// Install a test subscriber once; honours `RUST_LOG`
pub fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .with_test_writer()
        .try_init();
}

/// Something observable that happened during a run
#[derive(Debug, Clone, PartialEq)]
pub enum Event {
    Transition(StateTransition),
    MigrationStarted {
        stealer: NodeId,
        donor: NodeId,
        stores: Vec<String>,
        at: Instant,
    },
    MigrationFinished {
        stealer: NodeId,
        donor: NodeId,
        stores: Vec<String>,
        succeeded: bool,
        at: Instant,
    },
}

/// Ordered record shared by the fake admin and the fake migrator
#[derive(Debug, Clone, Default)]
pub struct EventLog(Arc<Mutex<Vec<Event>>>);

impl EventLog {
    pub fn push(&self, event: Event) {
        self.0.lock().push(event);
    }

    pub fn events(&self) -> Vec<Event> {
        self.0.lock().clone()
    }

    pub fn transitions(&self) -> Vec<StateTransition> {
        self.events()
            .into_iter()
            .filter_map(|e| match e {
                Event::Transition(t) => Some(t),
                _ => None,
            })
            .collect()
    }

    pub fn migrations_started(&self) -> usize {
        self.events()
            .iter()
            .filter(|e| matches!(e, Event::MigrationStarted { .. }))
            .count()
    }

    pub fn migrations_finished(&self) -> usize {
        self.events()
            .iter()
            .filter(|e| matches!(e, Event::MigrationFinished { .. }))
            .count()
    }
}

/// Admin client backed by fixed cluster state, recording every transition
pub struct RecordingAdmin {
    cluster: Cluster,
    stores: Vec<StoreDefinition>,
    log: EventLog,
    requests: Mutex<Vec<StateTransitionRequest>>,
    states: Mutex<HashMap<NodeId, ServerState>>,
    fail_transitions: Mutex<bool>,
    fail_rollbacks: Mutex<bool>,
    rollback_attempts: Mutex<usize>,
}

impl RecordingAdmin {
    pub fn new(cluster: Cluster, stores: Vec<StoreDefinition>, log: EventLog) -> Self {
        Self {
            cluster,
            stores,
            log,
            requests: Mutex::new(Vec::new()),
            states: Mutex::new(HashMap::new()),
            fail_transitions: Mutex::new(false),
            fail_rollbacks: Mutex::new(false),
            rollback_attempts: Mutex::new(0),
        }
    }

    pub fn set_state(&self, node: NodeId, state: ServerState) {
        self.states.lock().insert(node, state);
    }

    pub fn fail_transitions(&self) {
        *self.fail_transitions.lock() = true;
    }

    /// Forward transitions succeed, rollback transitions fail
    pub fn fail_rollbacks(&self) {
        *self.fail_rollbacks.lock() = true;
    }

    pub fn rollback_attempts(&self) -> usize {
        *self.rollback_attempts.lock()
    }

    pub fn requests(&self) -> Vec<StateTransitionRequest> {
        self.requests.lock().clone()
    }
}

#[async_trait::async_trait]
impl AdminClient for RecordingAdmin {
    async fn fetch_cluster_state(&self) -> Result<(Cluster, Vec<StoreDefinition>), AdminError> {
        Ok((self.cluster.clone(), self.stores.clone()))
    }

    async fn server_state(&self, node: &Node) -> Result<ServerState, AdminError> {
        Ok(self
            .states
            .lock()
            .get(&node.id)
            .copied()
            .unwrap_or(ServerState::Normal))
    }

    async fn read_only_format(&self, _node: &Node, _store: &str) -> Result<u32, AdminError> {
        Ok(2)
    }

    async fn transition_state(&self, request: StateTransitionRequest) -> Result<(), AdminError> {
        if *self.fail_transitions.lock() {
            return Err(AdminError::Rpc("metadata store unavailable".to_string()));
        }
        if request.transition.is_rollback() {
            *self.rollback_attempts.lock() += 1;
            if *self.fail_rollbacks.lock() {
                return Err(AdminError::Rpc("rollback rejected".to_string()));
            }
        }
        self.log.push(Event::Transition(request.transition));
        self.requests.lock().push(request);
        Ok(())
    }
}

/// Behaviour scripted for one stealer/donor pair
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Script {
    Succeed,
    Fail,
    Panic,
}

/// Migrator that sleeps, fails or panics per stealer/donor pair and checks
/// that no node is in two concurrent migrations
pub struct ScriptedMigrator {
    duration: Duration,
    scripts: HashMap<(NodeId, NodeId), Script>,
    log: EventLog,
    busy: Mutex<HashSet<NodeId>>,
    running: Mutex<usize>,
    peak: Mutex<usize>,
    violations: Mutex<Vec<String>>,
    attempts: Mutex<HashMap<(NodeId, NodeId), u32>>,
}

impl ScriptedMigrator {
    pub fn new(duration: Duration, log: EventLog) -> Self {
        Self {
            duration,
            scripts: HashMap::new(),
            log,
            busy: Mutex::new(HashSet::new()),
            running: Mutex::new(0),
            peak: Mutex::new(0),
            violations: Mutex::new(Vec::new()),
            attempts: Mutex::new(HashMap::new()),
        }
    }

    /// `stealer <- donor` behaves as `script`
    pub fn script(mut self, stealer: NodeId, donor: NodeId, script: Script) -> Self {
        self.scripts.insert((stealer, donor), script);
        self
    }

    pub fn peak_concurrency(&self) -> usize {
        *self.peak.lock()
    }

    pub fn violations(&self) -> Vec<String> {
        self.violations.lock().clone()
    }

    pub fn attempts(&self, stealer: NodeId, donor: NodeId) -> u32 {
        self.attempts
            .lock()
            .get(&(stealer, donor))
            .copied()
            .unwrap_or(0)
    }

    fn enter(&self, stealer: NodeId, donor: NodeId) {
        let mut busy = self.busy.lock();
        for node in [stealer, donor] {
            if !busy.insert(node) {
                self.violations
                    .lock()
                    .push(format!("node {} in two migrations", node));
            }
        }
        let mut running = self.running.lock();
        *running += 1;
        let mut peak = self.peak.lock();
        *peak = (*peak).max(*running);
    }

    fn leave(&self, stealer: NodeId, donor: NodeId) {
        let mut busy = self.busy.lock();
        busy.remove(&stealer);
        busy.remove(&donor);
        *self.running.lock() -= 1;
    }
}

#[async_trait::async_trait]
impl PartitionMigrator for ScriptedMigrator {
    async fn migrate(
        &self,
        _batch_id: usize,
        _task_id: usize,
        partition_move: &PartitionMove,
    ) -> Result<(), MigrationError> {
        let stealer = partition_move.stealer_id();
        let donor = partition_move.donor_id();
        let stores: Vec<String> = partition_move.stores().iter().cloned().collect();
        let script = self
            .scripts
            .get(&(stealer, donor))
            .copied()
            .unwrap_or(Script::Succeed);

        *self.attempts.lock().entry((stealer, donor)).or_default() += 1;
        self.enter(stealer, donor);
        self.log.push(Event::MigrationStarted {
            stealer,
            donor,
            stores: stores.clone(),
            at: Instant::now(),
        });

        tokio::time::sleep(self.duration).await;

        self.leave(stealer, donor);
        let succeeded = script == Script::Succeed;
        self.log.push(Event::MigrationFinished {
            stealer,
            donor,
            stores,
            succeeded,
            at: Instant::now(),
        });

        match script {
            Script::Succeed => Ok(()),
            Script::Fail => Err(MigrationError::TransferFailed(format!(
                "{} <- {} refused",
                stealer, donor
            ))),
            Script::Panic => panic!("migration {} <- {} crashed", stealer, donor),
        }
    }
}

/// Clusters where partition `i` moves from `moves[i].1` to `moves[i].0`
pub fn topology(nodes: u32, moves: &[(NodeId, NodeId)]) -> (Cluster, Cluster) {
    let mut current: Vec<Vec<u32>> = vec![Vec::new(); nodes as usize];
    let mut target: Vec<Vec<u32>> = vec![Vec::new(); nodes as usize];
    for (partition, &(stealer, donor)) in moves.iter().enumerate() {
        current[donor as usize].push(partition as u32);
        target[stealer as usize].push(partition as u32);
    }
    (cluster(current), cluster(target))
}

pub fn cluster(layout: Vec<Vec<u32>>) -> Cluster {
    Cluster::new(
        "test",
        layout
            .into_iter()
            .enumerate()
            .map(|(id, parts)| Node::new(id as u32, "localhost", 6660 + id as u16, parts)),
    )
    .unwrap()
}

/// One move per pair, partition `i` for pair `i`, over every store in `stores`
pub fn partition_moves(moves: &[(NodeId, NodeId)], stores: &[StoreDefinition]) -> Vec<PartitionMove> {
    let names: Vec<String> = stores.iter().map(|s| s.name.clone()).collect();
    moves
        .iter()
        .enumerate()
        .map(|(partition, &(stealer, donor))| {
            PartitionMove::new(stealer, donor, [partition as u32], names.clone()).unwrap()
        })
        .collect()
}

/// Single-batch plan for `moves` on an `nodes`-node cluster
pub fn single_batch_plan(
    nodes: u32,
    moves: &[(NodeId, NodeId)],
    stores: &[StoreDefinition],
) -> Plan {
    let (current, target) = topology(nodes, moves);
    let batch = BatchPlan::new(
        current.clone(),
        stores.to_vec(),
        target.clone(),
        stores.to_vec(),
        partition_moves(moves, stores),
    );
    Plan::new(current, stores.to_vec(), target, stores.to_vec(), vec![batch])
}
