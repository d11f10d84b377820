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

//! A running relayer: network host, topology, keyshare stores and coordinator.

use crate::config::{Config, ElectorConfig, TopologyConfig};
use anyhow::{Context, Result};
use libp2p::identity::Keypair;
use relayer_common::{PeerId, Topology};
use relayer_coordinator::{BullyElector, Coordinator, Elector, SessionError, StaticElector};
use relayer_network::{
    Communication, CommunicationError, Host, HostHandle, Libp2pCommunication, SharedTopology,
    TopologyProvider, TopologyStore, health,
};
use relayer_tss::{
    EcdsaKeyshare, FrostBackend, FrostKeyshare, KeygenProcess, KeyshareStore, ResharingProcess,
    SigningProcess, TssProcess,
};
use std::{fs, path::Path, sync::Arc, time::Duration};
use tokio::{sync::mpsc, task::JoinHandle};
use tokio_util::sync::CancellationToken;

pub struct Node {
    comm: Arc<dyn Communication>,
    host: HostHandle,
    host_task: JoinHandle<()>,
    topology: SharedTopology,
    topology_store: TopologyStore,
    coordinator: Coordinator,
    ecdsa: Arc<KeyshareStore<EcdsaKeyshare>>,
    frost: Arc<KeyshareStore<FrostKeyshare>>,
    signing_watchdog: Duration,
}

impl Node {
    /// Loads identity and topology, then starts the network host.
    pub async fn new(config: &Config) -> Result<Self> {
        let keypair = load_or_create_keypair(&config.network.key_path)?;
        let local = keypair.public().to_peer_id();

        let topology_store = TopologyStore::new(config.topology.store_path.clone());
        let topology = SharedTopology::new(load_topology(&config.topology, &topology_store)?);
        if !topology.is_allowed_peer(&local) {
            tracing::warn!(%local, "local peer is not part of the topology");
        }

        let (host, handle) = Host::new(keypair, topology.clone(), config.network.host.clone())
            .context("failed to create network host")?;
        let host_task = tokio::spawn(host.run());
        let comm: Arc<dyn Communication> = Arc::new(Libp2pCommunication::new(handle.clone()));

        let elector: Arc<dyn Elector> = match &config.elector {
            ElectorConfig::Static => Arc::new(StaticElector),
            ElectorConfig::Bully(bully) => Arc::new(BullyElector::new(comm.clone(), bully.clone())),
        };
        let coordinator = Coordinator::new(
            comm.clone(),
            topology.clone(),
            elector,
            config.coordinator.clone(),
        );

        tracing::info!(%local, peers = topology.snapshot().len(), "relayer node started");

        Ok(Self {
            comm,
            host: handle,
            host_task,
            topology,
            topology_store,
            coordinator,
            ecdsa: Arc::new(KeyshareStore::new(config.keyshare.ecdsa_path.clone())),
            frost: Arc::new(KeyshareStore::new(config.keyshare.frost_path.clone())),
            signing_watchdog: config.signing_watchdog,
        })
    }

    pub fn local_peer_id(&self) -> PeerId {
        self.comm.local_peer_id()
    }

    pub fn communication(&self) -> Arc<dyn Communication> {
        self.comm.clone()
    }

    pub fn coordinator(&self) -> &Coordinator {
        &self.coordinator
    }

    pub fn topology(&self) -> Topology {
        self.topology.snapshot()
    }

    /// Persists `topology` and makes it current for new sessions and connections.
    pub fn update_topology(&self, topology: Topology) -> Result<()> {
        self.topology_store
            .store_topology(&topology)
            .context("failed to persist topology")?;
        self.topology.swap(topology);
        Ok(())
    }

    /// Store for shares produced by an external ECDSA backend.
    pub fn ecdsa_keyshares(&self) -> &Arc<KeyshareStore<EcdsaKeyshare>> {
        &self.ecdsa
    }

    pub fn frost_keyshares(&self) -> &Arc<KeyshareStore<FrostKeyshare>> {
        &self.frost
    }

    pub async fn keygen(&self, cancel: CancellationToken, session_id: &str) -> Result<(), SessionError> {
        let process = KeygenProcess::new(
            session_id,
            self.comm.clone(),
            self.topology(),
            FrostBackend,
            self.frost.clone(),
        )
        .await;
        self.execute(cancel, Box::new(process)).await.map(|_| ())
    }

    /// Returns the signature on the node that led the session, `None` elsewhere.
    pub async fn sign(
        &self,
        cancel: CancellationToken,
        session_id: &str,
        digest: Vec<u8>,
    ) -> Result<Option<Vec<u8>>, SessionError> {
        let process = SigningProcess::new(
            session_id,
            self.comm.clone(),
            self.topology(),
            FrostBackend,
            &self.frost,
            digest,
        )
        .await?
        .with_watchdog(self.signing_watchdog);
        self.execute(cancel, Box::new(process)).await
    }

    pub async fn reshare(&self, cancel: CancellationToken, session_id: &str) -> Result<(), SessionError> {
        let process = ResharingProcess::new(
            session_id,
            self.comm.clone(),
            self.topology(),
            FrostBackend,
            self.frost.clone(),
        )
        .await?;
        self.execute(cancel, Box::new(process)).await.map(|_| ())
    }

    /// Topology peers that did not acknowledge a probe within `deadline`.
    pub async fn health(&self, deadline: Duration) -> Vec<(PeerId, CommunicationError)> {
        health::execute(self.comm.as_ref(), &self.topology().peer_ids(), deadline).await
    }

    /// Drains running sessions, then stops the host.
    pub async fn shutdown(self) {
        self.coordinator.shutdown().await;
        self.host.shutdown();
        if let Err(err) = self.host_task.await {
            tracing::error!("network host task failed: {err}");
        }
        tracing::info!("relayer node stopped");
    }

    async fn execute(
        &self,
        cancel: CancellationToken,
        process: Box<dyn TssProcess>,
    ) -> Result<Option<Vec<u8>>, SessionError> {
        let (sink, mut results) = mpsc::channel(4);
        self.coordinator.execute(cancel, vec![process], sink).await?;

        let mut output = None;
        while let Ok(result) = results.try_recv() {
            output = output.or(result);
        }
        Ok(output)
    }
}

/// Reads the protobuf-encoded identity at `path`, generating a secp256k1 one if absent.
pub fn load_or_create_keypair(path: &Path) -> Result<Keypair> {
    if path.exists() {
        let bytes = fs::read(path)
            .with_context(|| format!("failed to read network key {}", path.display()))?;
        return Keypair::from_protobuf_encoding(&bytes)
            .with_context(|| format!("invalid network key {}", path.display()));
    }

    let keypair = Keypair::generate_secp256k1();
    let bytes = keypair
        .to_protobuf_encoding()
        .context("failed to encode network key")?;
    if let Some(parent) = path.parent() {
        fs::create_dir_all(parent)
            .with_context(|| format!("failed to create {}", parent.display()))?;
    }
    fs::write(path, bytes)
        .with_context(|| format!("failed to write network key {}", path.display()))?;

    tracing::info!(peer = %keypair.public().to_peer_id(), "generated network key at {}", path.display());
    Ok(keypair)
}

fn load_topology(config: &TopologyConfig, store: &TopologyStore) -> Result<Topology> {
    let (Some(path), Some(key)) = (&config.path, config.encryption_key) else {
        return store
            .topology()
            .with_context(|| format!("no topology configured and none at {}", store.path().display()));
    };

    let topology = TopologyProvider::new(path.clone(), key)
        .network_topology(config.hash)
        .with_context(|| format!("failed to load topology from {}", path.display()))?;
    store
        .store_topology(&topology)
        .context("failed to persist topology")?;
    Ok(topology)
}
