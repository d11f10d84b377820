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
    mpc::{MpcBackend, SigningParams},
};
use async_trait::async_trait;
use relayer_common::{
    MessageKind, PeerId, Topology,
    peer::{peers_intersection, sort_peers_for_session},
};
use relayer_network::Communication;
use std::{collections::BTreeSet, sync::Arc, time::Duration};
use tokio_util::sync::CancellationToken;

/// Time the protocol may wait on the same peers before the attempt fails.
pub const DEFAULT_SIGNING_WATCHDOG: Duration = Duration::from_secs(3 * 60);

/// Threshold signing of one message by `threshold + 1` shareholders.
pub struct SigningProcess<B: MpcBackend> {
    core: ProcessCore,
    backend: B,
    keyshare: B::Keyshare,
    message: Vec<u8>,
    watchdog: Duration,
}

impl<B: MpcBackend> SigningProcess<B> {
    /// Locks the share for the lifetime of the process and loads it.
    pub async fn new(
        session_id: impl Into<String>,
        comm: Arc<dyn Communication>,
        topology: Topology,
        backend: B,
        store: &KeyshareStore<B::Keyshare>,
        message: Vec<u8>,
    ) -> Result<Self, TssError> {
        let guard = store.lock().await;
        let keyshare = store.get()?;
        Ok(Self {
            core: ProcessCore::new(session_id.into(), comm, topology, guard),
            backend,
            keyshare,
            message,
            watchdog: DEFAULT_SIGNING_WATCHDOG,
        })
    }

    pub fn with_watchdog(mut self, watchdog: Duration) -> Self {
        self.watchdog = watchdog;
        self
    }

    fn required(&self) -> usize {
        usize::from(self.keyshare.threshold()) + 1
    }

    fn signers(&self, params: &[u8]) -> Result<Vec<PeerId>, TssError> {
        let signers: Vec<PeerId> = serde_json::from_slice(params)?;
        let unique: BTreeSet<_> = signers.iter().collect();
        if unique.len() != signers.len() || signers.len() != self.required() {
            return Err(TssError::Validation(format!(
                "expected {} distinct signers, got {}",
                self.required(),
                signers.len()
            )));
        }
        if let Some(stranger) = signers
            .iter()
            .find(|peer| !self.keyshare.peers().contains(peer))
        {
            return Err(TssError::Validation(format!(
                "signer {stranger} holds no share of the key"
            )));
        }
        Ok(signers)
    }
}

#[async_trait]
impl<B: MpcBackend> TssProcess for SigningProcess<B> {
    fn session_id(&self) -> &str {
        &self.core.session_id
    }

    fn valid_coordinators(&self) -> Vec<PeerId> {
        self.keyshare.peers().to_vec()
    }

    fn ready(
        &self,
        ready: &BTreeSet<PeerId>,
        excluded: &BTreeSet<PeerId>,
    ) -> Result<bool, TssError> {
        let eligible = self
            .keyshare
            .peers()
            .iter()
            .filter(|peer| ready.contains(peer) && !excluded.contains(peer))
            .count();
        Ok(eligible >= self.required())
    }

    /// The leader plus the best ranked ready shareholders.
    ///
    /// The leader comes first even when ready peers outrank it, so the list is not
    /// in session rank order.
    fn start_params(&self, ready: &BTreeSet<PeerId>) -> Result<Vec<u8>, TssError> {
        let local = self.core.local();
        let ready: Vec<_> = ready.iter().copied().filter(|peer| *peer != local).collect();
        let candidates = peers_intersection(&ready, self.keyshare.peers());

        let mut signers = vec![local];
        signers.extend(
            sort_peers_for_session(&candidates, &self.core.session_id)
                .into_iter()
                .take(self.required() - 1),
        );
        if signers.len() != self.required() {
            return Err(TssError::NotReady(format!(
                "{} of {} signers ready",
                signers.len(),
                self.required()
            )));
        }
        Ok(serde_json::to_vec(&signers)?)
    }

    fn retryable(&self) -> bool {
        true
    }

    async fn run(
        &self,
        cancel: CancellationToken,
        is_coordinator: bool,
        result_sink: ResultSink,
        params: Vec<u8>,
    ) -> Result<(), TssError> {
        let local = self.core.local();
        let signers = self.signers(&params)?;
        if !signers.contains(&local) {
            result_sink
                .send(None)
                .await
                .map_err(|_| TssError::ResultSinkClosed)?;
            return Err(TssError::NotInSubset(local));
        }

        let protocol = self.backend.signing(
            SigningParams {
                session_id: self.core.session_id.clone(),
                local,
                signers: signers.clone(),
                message: self.message.clone(),
            },
            &self.keyshare,
        )?;

        tracing::debug!(session_id = %self.core.session_id, ?signers, "signing started");
        self.core
            .runner(MessageKind::TssKeySign, signers, &params, Some(self.watchdog))
            .run(protocol, &cancel, &self.core.stopper, |signature| async move {
                tracing::info!(session_id = %self.core.session_id, is_coordinator, "signing finished");
                let result = is_coordinator.then_some(signature);
                result_sink
                    .send(result)
                    .await
                    .map_err(|_| TssError::ResultSinkClosed)
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
