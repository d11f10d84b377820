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
    keyshare::{Keyshare, KeyshareError, KeyshareStore},
    mpc::{MpcBackend, ResharingParams},
    party::reindex_for_resharing,
};
use async_trait::async_trait;
use relayer_common::{
    MessageKind, PeerId, Topology,
    peer::{peers_intersection, sort_peers},
};
use relayer_network::Communication;
use serde::{Deserialize, Serialize};
use std::{collections::BTreeSet, sync::Arc};
use tokio_util::sync::CancellationToken;

/// Parameters the leader sends with `Start`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ResharingStart {
    pub old_threshold: u16,
    /// Old shareholders still in the topology.
    pub old_subset: Vec<PeerId>,
}

/// Moves the key from its current holders to the current topology.
///
/// Peers joining the key run without a keyshare and only receive.
pub struct ResharingProcess<B: MpcBackend> {
    core: ProcessCore,
    backend: B,
    store: Arc<KeyshareStore<B::Keyshare>>,
    keyshare: Option<B::Keyshare>,
}

impl<B: MpcBackend> ResharingProcess<B> {
    pub async fn new(
        session_id: impl Into<String>,
        comm: Arc<dyn Communication>,
        topology: Topology,
        backend: B,
        store: Arc<KeyshareStore<B::Keyshare>>,
    ) -> Result<Self, TssError> {
        let guard = store.lock().await;
        let keyshare = match store.get() {
            Ok(keyshare) => Some(keyshare),
            Err(KeyshareError::NotFound(_)) => None,
            Err(err) => return Err(err.into()),
        };
        Ok(Self {
            core: ProcessCore::new(session_id.into(), comm, topology, guard),
            backend,
            store,
            keyshare,
        })
    }

    fn old_subset(&self, keyshare: &B::Keyshare) -> Vec<PeerId> {
        let subset = peers_intersection(keyshare.peers(), &self.core.topology.peer_ids());
        sort_peers(&subset)
    }

    fn validate(&self, start: &ResharingStart) -> Result<(), TssError> {
        if start.old_threshold < 1 || usize::from(start.old_threshold) > start.old_subset.len() {
            return Err(TssError::Validation(format!(
                "old threshold {} does not fit a subset of {}",
                start.old_threshold,
                start.old_subset.len()
            )));
        }
        if let Some(stranger) = start
            .old_subset
            .iter()
            .find(|peer| !self.core.topology.contains(peer))
        {
            return Err(TssError::Validation(format!(
                "old shareholder {stranger} is not in the topology"
            )));
        }

        let Some(keyshare) = &self.keyshare else {
            return Ok(());
        };
        if sort_peers(&start.old_subset) != self.old_subset(keyshare) {
            return Err(TssError::Validation(
                "old subset differs from the local view".into(),
            ));
        }
        if start.old_threshold != keyshare.threshold() {
            return Err(TssError::Validation(format!(
                "old threshold {} differs from the local {}",
                start.old_threshold,
                keyshare.threshold()
            )));
        }
        Ok(())
    }
}

#[async_trait]
impl<B: MpcBackend> TssProcess for ResharingProcess<B> {
    fn session_id(&self) -> &str {
        &self.core.session_id
    }

    fn valid_coordinators(&self) -> Vec<PeerId> {
        self.keyshare
            .as_ref()
            .map(|keyshare| keyshare.peers().to_vec())
            .unwrap_or_default()
    }

    fn ready(
        &self,
        ready: &BTreeSet<PeerId>,
        excluded: &BTreeSet<PeerId>,
    ) -> Result<bool, TssError> {
        self.core.all_ready(ready, excluded)
    }

    fn start_params(&self, _ready: &BTreeSet<PeerId>) -> Result<Vec<u8>, TssError> {
        let keyshare = self
            .keyshare
            .as_ref()
            .ok_or_else(|| TssError::Validation("leader holds no keyshare".into()))?;
        let start = ResharingStart {
            old_threshold: keyshare.threshold(),
            old_subset: self.old_subset(keyshare),
        };
        self.validate(&start)?;
        Ok(serde_json::to_vec(&start)?)
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
        let start: ResharingStart = serde_json::from_slice(&params)?;
        self.validate(&start)?;

        let new_peers = self.core.topology.peer_ids();
        let (old_parties, new_parties) = reindex_for_resharing(&start.old_subset, &new_peers);
        let protocol = self.backend.resharing(
            ResharingParams {
                session_id: self.core.session_id.clone(),
                local: self.core.local(),
                old_parties,
                old_threshold: start.old_threshold,
                new_parties,
                new_threshold: self.core.topology.threshold(),
            },
            self.keyshare.as_ref(),
        )?;

        tracing::debug!(
            session_id = %self.core.session_id,
            old = start.old_subset.len(),
            new = new_peers.len(),
            "resharing started"
        );
        self.core
            .runner(MessageKind::TssReshare, new_peers, &params, None)
            .run(protocol, &cancel, &self.core.stopper, |keyshare| async move {
                self.store.store(&keyshare)?;
                tracing::info!(
                    session_id = %self.core.session_id,
                    threshold = keyshare.threshold(),
                    peers = keyshare.peers().len(),
                    "resharing finished"
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
