// This file is part of Gear.
//
// Copyright (C) 2025 Gear Technologies Inc.
// SPDX-License-Identifier: GPL-3.0-or-later WITH Classpath-exception-2.0
//
// This program is free software: you can redistribute it and/or modify
// it under the terms of the GNU General Public License as published by
// the Free Software Foundation, either version 3 of the License, or
// (at your option) any later version.
//
// This program is distributed in the hope that it will be useful,
// but WITHOUT ANY WARRANTY; without even the implied warranty of
// MERCHANTABILITY or FITNESS FOR A PARTICULAR PURPOSE. See the
// GNU General Public License for more details.
//
// You should have received a copy of the GNU General Public License
// along with this program. If not, see <https://www.gnu.org/licenses/>.

//! Whole sessions between in-memory nodes.

use async_trait::async_trait;
use futures::future;
use libp2p::identity::Keypair;
use relayer_common::{
    MessageKind, PeerId, Topology,
    mock::{Mock, memory_address},
    peer::sort_peers_for_session,
};
use relayer_coordinator::{
    BullyConfig, BullyElector, Coordinator, CoordinatorConfig, Elector, SessionError,
    SessionErrorKind, StaticElector,
};
use relayer_network::{
    Communication, Host, HostConfig, Libp2pCommunication, SharedTopology, SubscriptionRegistry,
    mock::MockNetwork,
};
use relayer_tss::{
    FrostBackend, FrostKeyshare, KeygenProcess, KeyshareStore, ResharingProcess, ResultSink,
    SigningProcess, TssError, TssProcess,
};
use sha3::{Digest, Keccak256};
use std::{collections::BTreeSet, path::Path, sync::Arc, time::Duration};
use tempfile::TempDir;
use tokio::{sync::mpsc, time::Instant};
use tokio_util::sync::CancellationToken;
use tracing_subscriber::EnvFilter;

type Outcome = (Result<(), SessionError>, Vec<Option<Vec<u8>>>);

struct Node {
    peer: PeerId,
    network: MockNetwork,
    store: Arc<KeyshareStore<FrostKeyshare>>,
}

impl Node {
    fn new(network: &MockNetwork, dir: &Path) -> Self {
        let peer = PeerId::random();
        network.join(peer);
        Self {
            peer,
            network: network.clone(),
            store: Arc::new(KeyshareStore::new(dir.join(format!("{peer}.keyshare")))),
        }
    }

    fn coordinator(&self, topology: &Topology, config: CoordinatorConfig) -> Coordinator {
        self.coordinator_with(topology, config, Arc::new(StaticElector))
    }

    fn coordinator_with(
        &self,
        topology: &Topology,
        config: CoordinatorConfig,
        elector: Arc<dyn Elector>,
    ) -> Coordinator {
        Coordinator::new(
            self.network.join(self.peer),
            SharedTopology::new(topology.clone()),
            elector,
            config,
        )
    }

    fn bully(&self) -> Arc<dyn Elector> {
        Arc::new(BullyElector::new(
            self.network.join(self.peer),
            BullyConfig {
                election_wait: Duration::from_millis(100),
                bully_wait: Duration::from_millis(500),
                ping_interval: None,
            },
        ))
    }

    async fn keygen(&self, session_id: &str, topology: &Topology) -> Box<dyn TssProcess> {
        Box::new(
            KeygenProcess::new(
                session_id,
                self.network.join(self.peer),
                topology.clone(),
                FrostBackend,
                self.store.clone(),
            )
            .await,
        )
    }

    async fn signing(&self, session_id: &str, topology: &Topology, message: &[u8]) -> Box<dyn TssProcess> {
        Box::new(
            SigningProcess::new(
                session_id,
                self.network.join(self.peer),
                topology.clone(),
                FrostBackend,
                &self.store,
                message.to_vec(),
            )
            .await
            .unwrap(),
        )
    }

    async fn resharing(&self, session_id: &str, topology: &Topology) -> Box<dyn TssProcess> {
        Box::new(
            ResharingProcess::new(
                session_id,
                self.network.join(self.peer),
                topology.clone(),
                FrostBackend,
                self.store.clone(),
            )
            .await
            .unwrap(),
        )
    }

    async fn execute(
        &self,
        topology: &Topology,
        config: CoordinatorConfig,
        process: Box<dyn TssProcess>,
    ) -> Outcome {
        self.execute_with(topology, config, Arc::new(StaticElector), process)
            .await
    }

    async fn execute_with(
        &self,
        topology: &Topology,
        config: CoordinatorConfig,
        elector: Arc<dyn Elector>,
        process: Box<dyn TssProcess>,
    ) -> Outcome {
        let (sink, mut results) = mpsc::channel(8);
        let result = self
            .coordinator_with(topology, config, elector)
            .execute(CancellationToken::new(), vec![process], sink)
            .await;
        let mut outputs = vec![];
        while let Ok(output) = results.try_recv() {
            outputs.push(output);
        }
        (result, outputs)
    }
}

fn init_logger() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .with_test_writer()
        .try_init();
}

fn config() -> CoordinatorConfig {
    CoordinatorConfig::default()
        .with_tss_timeout(Duration::from_secs(60))
        .with_initiate_period(Duration::from_millis(100))
        .with_coordinator_grace(Duration::from_millis(500))
        .with_subset_standby(Duration::from_millis(500))
}

fn setup(count: usize) -> (TempDir, MockNetwork, Vec<Node>) {
    let dir = tempfile::tempdir().unwrap();
    let network = MockNetwork::new();
    let nodes = (0..count).map(|_| Node::new(&network, dir.path())).collect();
    (dir, network, nodes)
}

fn topology(nodes: &[Node], threshold: u16) -> Topology {
    Topology::mock((nodes.iter().map(|node| node.peer).collect(), threshold))
}

fn digest(message: &[u8]) -> Vec<u8> {
    Keccak256::digest(message).to_vec()
}

async fn keygen(nodes: &[Node], topology: &Topology) {
    let runs = nodes.iter().map(|node| async move {
        let process = node.keygen("keygen", topology).await;
        node.execute(topology, config(), process).await
    });
    for (result, _) in future::join_all(runs).await {
        result.unwrap();
    }
}

async fn sign(nodes: &[Node], topology: &Topology, session_id: &str, message: &[u8]) -> Vec<Outcome> {
    let runs = nodes.iter().map(|node| async move {
        let process = node.signing(session_id, topology, message).await;
        node.execute(topology, config(), process).await
    });
    future::join_all(runs).await
}

fn no_subscribers(registry: &SubscriptionRegistry, session_id: &str) -> bool {
    MessageKind::ALL
        .into_iter()
        .all(|kind| registry.subscribers(session_id, kind).is_empty())
}

/// The only signature produced by a signing session.
fn signature(outcomes: &[Outcome]) -> Vec<u8> {
    let mut signatures: Vec<_> = outcomes
        .iter()
        .flat_map(|(_, outputs)| outputs.iter().flatten().cloned())
        .collect();
    assert_eq!(signatures.len(), 1, "exactly one node returns the signature");
    signatures.remove(0)
}

#[tokio::test(start_paused = true)]
async fn keygen_three_nodes() {
    init_logger();

    let (_dir, _network, nodes) = setup(3);
    let topology = topology(&nodes, 1);

    keygen(&nodes, &topology).await;

    let expected: BTreeSet<_> = nodes.iter().map(|node| node.peer).collect();
    let public_key = nodes[0].store.get().unwrap().public_key;
    for node in &nodes {
        let keyshare = node.store.get().unwrap();
        assert_eq!(keyshare.threshold, 1);
        assert_eq!(keyshare.public_key, public_key);
        assert_eq!(keyshare.peers.iter().copied().collect::<BTreeSet<_>>(), expected);
        assert!(node.store.try_lock().is_some());
    }
}

#[tokio::test(start_paused = true)]
async fn signing_two_of_three() {
    init_logger();

    let (_dir, _network, nodes) = setup(3);
    let topology = topology(&nodes, 1);
    keygen(&nodes, &topology).await;

    let message = digest(b"Message");
    let outcomes = sign(&nodes, &topology, "signing1", &message).await;

    let signature = signature(&outcomes);
    nodes[0].store.get().unwrap().verify(&message, &signature).unwrap();

    let mut members = 0;
    for (result, outputs) in &outcomes {
        match result {
            Ok(()) => members += 1,
            Err(err) => {
                assert_eq!(err.kind(), SessionErrorKind::Subset);
                assert_eq!(outputs, &vec![None]);
            }
        }
    }
    assert_eq!(members, 2);
}

/// Goes offline once it would have to publish `Start`.
struct VanishingLeader {
    inner: Box<dyn TssProcess>,
    network: MockNetwork,
    peer: PeerId,
}

/// Goes offline as soon as it is asked to take part in the protocol.
struct VanishingParticipant {
    inner: Box<dyn TssProcess>,
    network: MockNetwork,
    peer: PeerId,
}

macro_rules! delegate_process {
    ($name:ident) => {
        #[async_trait]
        impl TssProcess for $name {
            fn session_id(&self) -> &str {
                self.inner.session_id()
            }

            fn valid_coordinators(&self) -> Vec<PeerId> {
                self.inner.valid_coordinators()
            }

            fn ready(
                &self,
                ready: &BTreeSet<PeerId>,
                excluded: &BTreeSet<PeerId>,
            ) -> Result<bool, TssError> {
                self.inner.ready(ready, excluded)
            }

            fn start_params(&self, ready: &BTreeSet<PeerId>) -> Result<Vec<u8>, TssError> {
                self.vanish_on_start(ready)
            }

            fn retryable(&self) -> bool {
                self.inner.retryable()
            }

            async fn run(
                &self,
                cancel: CancellationToken,
                is_coordinator: bool,
                result_sink: ResultSink,
                params: Vec<u8>,
            ) -> Result<(), TssError> {
                self.vanish_on_run(cancel, is_coordinator, result_sink, params)
                    .await
            }

            fn release_keyshare(&self) {
                self.inner.release_keyshare()
            }

            fn stop(&self) {
                self.inner.stop()
            }
        }
    };
}

impl VanishingLeader {
    fn vanish_on_start(&self, _ready: &BTreeSet<PeerId>) -> Result<Vec<u8>, TssError> {
        self.network.set_offline(self.peer);
        Err(TssError::NotReady("leader vanished".into()))
    }

    async fn vanish_on_run(
        &self,
        cancel: CancellationToken,
        is_coordinator: bool,
        result_sink: ResultSink,
        params: Vec<u8>,
    ) -> Result<(), TssError> {
        self.inner.run(cancel, is_coordinator, result_sink, params).await
    }
}

impl VanishingParticipant {
    fn vanish_on_start(&self, ready: &BTreeSet<PeerId>) -> Result<Vec<u8>, TssError> {
        self.inner.start_params(ready)
    }

    async fn vanish_on_run(
        &self,
        _cancel: CancellationToken,
        _is_coordinator: bool,
        _result_sink: ResultSink,
        _params: Vec<u8>,
    ) -> Result<(), TssError> {
        self.network.set_offline(self.peer);
        Err(TssError::Stopped)
    }
}

delegate_process!(VanishingLeader);
delegate_process!(VanishingParticipant);

#[tokio::test(start_paused = true)]
async fn signing_survives_leader_going_offline() {
    init_logger();

    let (_dir, network, nodes) = setup(3);
    let topology = topology(&nodes, 1);
    keygen(&nodes, &topology).await;

    let session_id = "signing-leader-offline";
    let ranked = sort_peers_for_session(&topology.peer_ids(), session_id);
    let message = digest(b"leader offline");
    let started = Instant::now();

    let runs = nodes.iter().map(|node| {
        let network = network.clone();
        let message = message.clone();
        let topology = topology.clone();
        let leader = ranked[0];
        async move {
            let mut process = node.signing(session_id, &topology, &message).await;
            if node.peer == leader {
                process = Box::new(VanishingLeader {
                    inner: process,
                    network,
                    peer: node.peer,
                });
            }
            (node.peer, node.execute(&topology, config(), process).await)
        }
    });
    let outcomes = future::join_all(runs).await;
    assert!(started.elapsed() < Duration::from_secs(5));

    let mut live = vec![];
    for (peer, outcome) in outcomes {
        if peer == ranked[0] {
            assert!(outcome.0.is_err());
        } else {
            outcome.0.clone().unwrap();
            live.push(outcome);
        }
    }
    let signature = signature(&live);
    nodes[0].store.get().unwrap().verify(&message, &signature).unwrap();
}

#[tokio::test(start_paused = true)]
async fn signing_retries_without_failed_participant() {
    init_logger();

    let (_dir, network, nodes) = setup(3);
    let topology = topology(&nodes, 1);
    keygen(&nodes, &topology).await;

    let session_id = "signing-retry";
    let ranked = sort_peers_for_session(&topology.peer_ids(), session_id);
    let message = digest(b"retry");

    let runs = nodes.iter().map(|node| {
        let network = network.clone();
        let message = message.clone();
        let topology = topology.clone();
        let (flaky, late) = (ranked[1], ranked[2]);
        async move {
            let mut process = node.signing(session_id, &topology, &message).await;
            if node.peer == flaky {
                process = Box::new(VanishingParticipant {
                    inner: process,
                    network,
                    peer: node.peer,
                });
            } else if node.peer == late {
                // let the flaky peer be the first to answer
                tokio::time::sleep(Duration::from_millis(50)).await;
            }
            (node.peer, node.execute(&topology, config(), process).await)
        }
    });
    let outcomes = future::join_all(runs).await;

    let mut live = vec![];
    for (peer, outcome) in outcomes {
        if peer == ranked[1] {
            assert!(outcome.0.is_err());
        } else {
            outcome.0.clone().unwrap();
            live.push(outcome);
        }
    }
    let signature = signature(&live);
    nodes[0].store.get().unwrap().verify(&message, &signature).unwrap();
}

#[tokio::test(start_paused = true)]
async fn resharing_expands_the_committee() {
    init_logger();

    let (dir, network, mut nodes) = setup(3);
    let old_topology = topology(&nodes, 1);
    keygen(&nodes, &old_topology).await;
    let public_key = nodes[0].store.get().unwrap().public_key;

    nodes.push(Node::new(&network, dir.path()));
    let topology = topology(&nodes, 1);
    let runs = nodes.iter().map(|node| {
        let topology = topology.clone();
        async move {
            let process = node.resharing("reshare-expand", &topology).await;
            node.execute(&topology, config(), process).await
        }
    });
    for (result, _) in future::join_all(runs).await {
        result.unwrap();
    }

    for node in &nodes {
        let keyshare = node.store.get().unwrap();
        assert_eq!(keyshare.public_key, public_key);
        assert_eq!(keyshare.peers.len(), 4);
    }

    // two of the four sign
    let message = digest(b"after expand");
    let outcomes = sign(&nodes, &topology, "signing-after-expand", &message).await;
    let signature = signature(&outcomes);
    nodes[3].store.get().unwrap().verify(&message, &signature).unwrap();
}

#[tokio::test(start_paused = true)]
async fn resharing_shrinks_the_committee() {
    init_logger();

    let (_dir, _network, nodes) = setup(4);
    let old_topology = topology(&nodes, 1);
    keygen(&nodes, &old_topology).await;
    let removed = nodes[3].store.get().unwrap();

    let remaining = &nodes[..3];
    let topology = topology(remaining, 1);
    let runs = remaining.iter().map(|node| {
        let topology = topology.clone();
        async move {
            let process = node.resharing("reshare-shrink", &topology).await;
            node.execute(&topology, config(), process).await
        }
    });
    for (result, _) in future::join_all(runs).await {
        result.unwrap();
    }

    for node in remaining {
        let keyshare = node.store.get().unwrap();
        assert_eq!(keyshare.peers.len(), 3);
        assert_eq!(keyshare.public_key, removed.public_key);
    }
    nodes[3].store.refresh();
    assert_eq!(nodes[3].store.get().unwrap(), removed);
}

#[tokio::test(start_paused = true)]
async fn session_times_out_without_ready_peers() {
    init_logger();

    let (_dir, _network, nodes) = setup(3);
    let topology = topology(&nodes, 1);
    keygen(&nodes, &topology).await;

    let session_id = "signing-alone";
    let ranked = sort_peers_for_session(&topology.peer_ids(), session_id);
    let Some(leader) = nodes.iter().find(|node| node.peer == ranked[0]) else {
        unreachable!("leader is one of the nodes");
    };

    let process = leader.signing(session_id, &topology, b"alone").await;
    let config = config().with_tss_timeout(Duration::from_secs(2));
    let (result, outputs) = leader.execute(&topology, config, process).await;

    assert_eq!(result, Err(SessionError::Timeout));
    assert!(outputs.is_empty());
    assert!(leader.store.try_lock().is_some());
    let registry = leader.network.join(leader.peer).registry().clone();
    assert!(no_subscribers(&registry, session_id));
}

#[tokio::test]
async fn timed_out_session_closes_its_streams() {
    init_logger();

    let dir = tempfile::tempdir().unwrap();
    let keys: Vec<_> = (0..3).map(|_| Keypair::generate_secp256k1()).collect();
    let addrs: Vec<_> = (0..3).map(|_| memory_address()).collect();
    let topology = Topology::new(
        keys.iter()
            .map(|key| key.public().to_peer_id())
            .zip(addrs.iter().cloned()),
        1,
    )
    .unwrap();

    let session_id = "keygen-stalled";
    let leader = sort_peers_for_session(&topology.peer_ids(), session_id)[0];
    let mut handle = None;
    let mut idle = vec![];
    for (key, addr) in keys.into_iter().zip(addrs) {
        let peer = key.public().to_peer_id();
        let config = HostConfig::new_memory(addr).with_request_timeout(Duration::from_secs(30));
        let (host, host_handle) =
            Host::new(key, SharedTopology::new(topology.clone()), config).unwrap();
        if peer == leader {
            tokio::spawn(host.run());
            handle = Some(host_handle);
        } else {
            // listening but never driven, so envelopes to it stay unacknowledged
            idle.push(host);
        }
    }
    let Some(handle) = handle else {
        unreachable!("leader is in the topology");
    };

    let comm: Arc<dyn Communication> = Arc::new(Libp2pCommunication::new(handle.clone()));
    let store = Arc::new(KeyshareStore::<FrostKeyshare>::new(
        dir.path().join("frost.keyshare"),
    ));
    let process = KeygenProcess::new(
        session_id,
        comm.clone(),
        topology.clone(),
        FrostBackend,
        store.clone(),
    )
    .await;
    let coordinator = Coordinator::new(
        comm,
        SharedTopology::new(topology),
        Arc::new(StaticElector),
        config().with_tss_timeout(Duration::from_secs(2)),
    );

    let (sink, _results) = mpsc::channel(1);
    let result = coordinator
        .execute(CancellationToken::new(), vec![Box::new(process)], sink)
        .await;

    assert_eq!(result, Err(SessionError::Timeout));
    assert_eq!(handle.open_streams(session_id), 0);
    assert!(no_subscribers(handle.registry(), session_id));
    assert!(store.try_lock().is_some());
    drop(idle);
}

#[tokio::test(start_paused = true)]
async fn non_member_frees_its_keyshare_while_standing_by() {
    init_logger();

    let (_dir, _network, nodes) = setup(3);
    let topology = topology(&nodes, 1);
    keygen(&nodes, &topology).await;

    let standby = Duration::from_secs(30);
    let (first, second) = (digest(b"first"), digest(b"second"));
    let started = Instant::now();

    let first_runs = nodes.iter().map(|node| {
        let (topology, first) = (&topology, &first);
        async move {
            let process = node.signing("signing-first", topology, first).await;
            let config = config().with_subset_standby(standby);
            let outcome = node.execute(topology, config, process).await;
            (outcome, started.elapsed())
        }
    });
    let second_session = async {
        // the members of the first session are done by then
        tokio::time::sleep(Duration::from_secs(1)).await;
        let runs = nodes.iter().map(|node| {
            let (topology, second) = (&topology, &second);
            async move {
                let process = node.signing("signing-second", topology, second).await;
                let locked_after = started.elapsed();
                (locked_after, node.execute(topology, config(), process).await)
            }
        });
        future::join_all(runs).await
    };
    let (first_outcomes, second_outcomes) =
        tokio::join!(future::join_all(first_runs), second_session);

    let mut outsiders = 0;
    for ((result, _), finished_after) in &first_outcomes {
        if let Err(err) = result {
            assert_eq!(err.kind(), SessionErrorKind::Subset);
            assert!(*finished_after >= standby);
            outsiders += 1;
        }
    }
    assert_eq!(outsiders, 1);

    for (locked_after, _) in &second_outcomes {
        assert!(*locked_after < Duration::from_secs(2));
    }
    let outcomes: Vec<Outcome> = second_outcomes.into_iter().map(|(_, outcome)| outcome).collect();
    let signature = signature(&outcomes);
    nodes[0].store.get().unwrap().verify(&second, &signature).unwrap();
}

#[tokio::test(start_paused = true)]
async fn bully_signing_skips_an_offline_top_peer() {
    init_logger();

    let (_dir, network, nodes) = setup(3);
    let topology = topology(&nodes, 1);
    keygen(&nodes, &topology).await;

    let session_id = "signing-bully";
    let ranked = sort_peers_for_session(&topology.peer_ids(), session_id);
    network.set_offline(ranked[0]);
    let message = digest(b"bully");
    let started = Instant::now();

    let runs = nodes
        .iter()
        .filter(|node| node.peer != ranked[0])
        .map(|node| {
            let (topology, message) = (&topology, &message);
            async move {
                let process = node.signing(session_id, topology, message).await;
                node.execute_with(topology, config(), node.bully(), process)
                    .await
            }
        });
    let outcomes = future::join_all(runs).await;
    assert!(started.elapsed() < Duration::from_secs(5));

    for (result, _) in &outcomes {
        result.clone().unwrap();
    }
    let signature = signature(&outcomes);
    nodes[0].store.get().unwrap().verify(&message, &signature).unwrap();
}

#[tokio::test]
async fn shutdown_refuses_new_sessions() {
    init_logger();

    let (_dir, _network, nodes) = setup(3);
    let topology = topology(&nodes, 1);
    let coordinator = nodes[0].coordinator(&topology, config());

    coordinator.shutdown().await;

    let process = nodes[0].keygen("late", &topology).await;
    let (sink, _results) = mpsc::channel(1);
    let result = coordinator
        .execute(CancellationToken::new(), vec![process], sink)
        .await;
    assert_eq!(result, Err(SessionError::ShuttingDown));
}
