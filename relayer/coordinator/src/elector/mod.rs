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

//! Coordinator election.

mod bully;

pub use bully::{BullyConfig, BullyElector};

use async_trait::async_trait;
use relayer_common::{PeerId, peer::sort_peers_for_session};
use thiserror::Error;
use tokio_util::sync::CancellationToken;

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ElectorError {
    #[error("no coordinator candidates")]
    NoCandidates,
    #[error("election cancelled")]
    Cancelled,
}

/// Picks the peer that leads a session.
#[async_trait]
pub trait Elector: Send + Sync {
    async fn coordinator(
        &self,
        cancel: &CancellationToken,
        session_id: &str,
        peers: &[PeerId],
    ) -> Result<PeerId, ElectorError>;
}

/// Highest ranked peer of the session, no messages exchanged.
#[derive(Debug, Default, Clone, Copy)]
pub struct StaticElector;

#[async_trait]
impl Elector for StaticElector {
    async fn coordinator(
        &self,
        _cancel: &CancellationToken,
        session_id: &str,
        peers: &[PeerId],
    ) -> Result<PeerId, ElectorError> {
        sort_peers_for_session(peers, session_id)
            .first()
            .copied()
            .ok_or(ElectorError::NoCandidates)
    }
}
