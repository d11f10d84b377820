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

//! Session-scoped MPC processes driven by the coordinator.

mod keygen;
mod resharing;
mod runner;
mod signing;

pub use keygen::KeygenProcess;
pub use resharing::{ResharingProcess, ResharingStart};
pub use runner::attempt_tag;
pub use signing::{DEFAULT_SIGNING_WATCHDOG, SigningProcess};

use crate::{error::TssError, keyshare::KeyshareGuard};
use async_trait::async_trait;
use parking_lot::Mutex;
use relayer_common::{MessageKind, PeerId, Topology};
use relayer_network::Communication;
use runner::Runner;
use std::{collections::BTreeSet, sync::Arc, time::Duration};
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

/// Receives `Some(signature)` on the signing leader and `None` elsewhere.
pub type ResultSink = mpsc::Sender<Option<Vec<u8>>>;

/// One MPC protocol run as seen by the coordinator.
#[async_trait]
pub trait TssProcess: Send + Sync {
    fn session_id(&self) -> &str;

    /// Peers eligible to lead the session. Empty when the local node has no view.
    fn valid_coordinators(&self) -> Vec<PeerId>;

    /// Whether the leader may start with `ready`, which includes the leader.
    ///
    /// Errors when the excluded peers make the session impossible.
    fn ready(
        &self,
        ready: &BTreeSet<PeerId>,
        excluded: &BTreeSet<PeerId>,
    ) -> Result<bool, TssError>;

    /// Leader-authored parameters sent with `Start`.
    fn start_params(&self, ready: &BTreeSet<PeerId>) -> Result<Vec<u8>, TssError>;

    fn retryable(&self) -> bool;

    async fn run(
        &self,
        cancel: CancellationToken,
        is_coordinator: bool,
        result_sink: ResultSink,
        params: Vec<u8>,
    ) -> Result<(), TssError>;

    /// Gives the keyshare back to the store while the process stays usable. Idempotent.
    fn release_keyshare(&self);

    /// Cancels a running attempt and releases the keyshare. Idempotent.
    fn stop(&self);
}

/// State shared by every process kind.
struct ProcessCore {
    session_id: String,
    comm: Arc<dyn Communication>,
    topology: Topology,
    guard: Mutex<Option<KeyshareGuard>>,
    stopper: CancellationToken,
}

impl ProcessCore {
    fn new(
        session_id: String,
        comm: Arc<dyn Communication>,
        topology: Topology,
        guard: KeyshareGuard,
    ) -> Self {
        Self {
            session_id,
            comm,
            topology,
            guard: Mutex::new(Some(guard)),
            stopper: CancellationToken::new(),
        }
    }

    fn local(&self) -> PeerId {
        self.comm.local_peer_id()
    }

    fn runner(
        &self,
        kind: MessageKind,
        participants: Vec<PeerId>,
        params: &[u8],
        watchdog: Option<Duration>,
    ) -> Runner {
        Runner {
            comm: self.comm.clone(),
            session_id: self.session_id.clone(),
            kind,
            participants,
            attempt: attempt_tag(&self.session_id, params),
            watchdog,
        }
    }

    /// Errors unless `ready` covers the whole topology and nobody is excluded.
    fn all_ready(
        &self,
        ready: &BTreeSet<PeerId>,
        excluded: &BTreeSet<PeerId>,
    ) -> Result<bool, TssError> {
        if !excluded.is_empty() {
            return Err(TssError::NotReady(format!(
                "every topology peer is required, {} excluded",
                excluded.len()
            )));
        }
        Ok(self.topology.peer_ids().iter().all(|peer| ready.contains(peer)))
    }

    fn stop(&self) {
        self.stopper.cancel();
        self.release();
    }

    fn release(&self) {
        if let Some(guard) = self.guard.lock().take() {
            guard.unlock();
            tracing::debug!(session_id = %self.session_id, "keyshare released");
        }
    }
}
