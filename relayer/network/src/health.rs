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

//! Reachability probe over the regular message path.

use crate::{
    communication::Communication,
    error::{CommunicationError, TransportError},
};
use futures::future;
use relayer_common::{HEALTH_SESSION, MessageKind, PeerId};
use std::time::Duration;
use tokio::time;

/// Sends an empty [`MessageKind::Unknown`] envelope to each peer and returns the
/// ones that did not acknowledge it within `deadline`.
///
/// The local peer is never probed.
pub async fn execute(
    comm: &dyn Communication,
    peers: &[PeerId],
    deadline: Duration,
) -> Vec<(PeerId, CommunicationError)> {
    let local = comm.local_peer_id();

    let probes = peers.iter().filter(|peer| **peer != local).map(|peer| async move {
        let target = [*peer];
        let probe = comm.broadcast(&target, vec![], MessageKind::Unknown, HEALTH_SESSION);
        match time::timeout(deadline, probe).await {
            Ok(result) => result.err().map(|err| (*peer, err)),
            Err(_) => Some((*peer, CommunicationError::new(*peer, TransportError::Timeout))),
        }
    });

    let errors: Vec<_> = future::join_all(probes).await.into_iter().flatten().collect();
    comm.close_session(HEALTH_SESSION);

    tracing::debug!(
        probed = peers.len(),
        unreachable = errors.len(),
        "health check finished"
    );
    errors
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::mock::MockNetwork;

    #[tokio::test]
    async fn reports_exactly_offline_peers() {
        let network = MockNetwork::new();
        let peers: Vec<_> = (0..4).map(|_| PeerId::random()).collect();
        let comms: Vec<_> = peers.iter().map(|peer| network.join(*peer)).collect();

        let errors = execute(comms[0].as_ref(), &peers, Duration::from_secs(1)).await;
        assert!(errors.is_empty());

        network.set_offline(peers[2]);
        let errors = execute(comms[0].as_ref(), &peers, Duration::from_secs(1)).await;
        assert_eq!(errors.len(), 1);
        assert_eq!(errors[0].0, peers[2]);
        assert_eq!(errors[0].1.cause, TransportError::DialFailure);
    }
}
