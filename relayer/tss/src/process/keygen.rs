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

use super::{ProcessCore, ResultSink, TssProcess};
use crate::{
    error::TssError,
    keyshare::{Keyshare, KeyshareStore},
    mpc::{KeygenParams, MpcBackend},
};
use async_trait::async_trait;
use relayer_common::{MessageKind, PeerId, Topology};
use relayer_network::Communication;
use std::{collections::BTreeSet, sync::Arc};
use tokio_util::sync::CancellationToken;

/// Distributed key generation over the whole topology.
pub struct KeygenProcess<B: MpcBackend> {
    core: ProcessCore,
    backend: B,
    store: Arc<KeyshareStore<B::Keyshare>>,
}

impl<B: MpcBackend> KeygenProcess<B> {
    /// Waits for the store's in-use lock.
    pub async fn new(
        session_id: impl Into<String>,
        comm: Arc<dyn Communication>,
        topology: Topology,
        backend: B,
        store: Arc<KeyshareStore<B::Keyshare>>,
    ) -> Self {
        let guard = store.lock().await;
        Self {
            core: ProcessCore::new(session_id.into(), comm, topology, guard),
            backend,
            store,
        }
    }
}

#[async_trait]
impl<B: MpcBackend> TssProcess for KeygenProcess<B> {
    fn session_id(&self) -> &str {
        &self.core.session_id
    }

    fn valid_coordinators(&self) -> Vec<PeerId> {
        self.core.topology.peer_ids()
    }

    fn ready(
        &self,
        ready: &BTreeSet<PeerId>,
        excluded: &BTreeSet<PeerId>,
    ) -> Result<bool, TssError> {
        self.core.all_ready(ready, excluded)
    }

    fn start_params(&self, _ready: &BTreeSet<PeerId>) -> Result<Vec<u8>, TssError> {
        Ok(vec![])
    }

    fn retryable(&self) -> bool {
        false
    }

    async fn run(
        &self,
        cancel: CancellationToken,
        _is_coordinator: bool,
        _result_sink: ResultSink,
        params: Vec<u8>,
    ) -> Result<(), TssError> {
        let peers = self.core.topology.peer_ids();
        let protocol = self.backend.keygen(KeygenParams {
            session_id: self.core.session_id.clone(),
            local: self.core.local(),
            peers: peers.clone(),
            threshold: self.core.topology.threshold(),
        })?;

        tracing::debug!(session_id = %self.core.session_id, peers = peers.len(), "keygen started");
        self.core
            .runner(MessageKind::TssKeyGen, peers, &params, None)
            .run(protocol, &cancel, &self.core.stopper, |keyshare| async move {
                self.store.store(&keyshare)?;
                tracing::info!(
                    session_id = %self.core.session_id,
                    threshold = keyshare.threshold(),
                    "keygen finished"
                );
                Ok(())
            })
            .await
    }

    fn release_keyshare(&self) {
        self.core.release();
    }

    fn stop(&self) {
        self.core.stop();
    }
}
