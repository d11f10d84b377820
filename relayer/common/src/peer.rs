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

//! Deterministic peer-set ordering shared by every node.

use crate::PeerId;
use sha3::{Digest, Keccak256};
use std::{cmp::Ordering, collections::BTreeSet};

/// Keccak256 of the peer id string concatenated with the session id.
pub fn peer_session_hash(peer: &PeerId, session_id: &str) -> [u8; 32] {
    let mut hasher = Keccak256::new();
    hasher.update(peer.to_string().as_bytes());
    hasher.update(session_id.as_bytes());
    hasher.finalize().into()
}

/// Compares two peers by their session-salted rank, highest first.
pub fn session_order(a: &PeerId, b: &PeerId, session_id: &str) -> Ordering {
    peer_session_hash(b, session_id)
        .cmp(&peer_session_hash(a, session_id))
        .then_with(|| a.to_bytes().cmp(&b.to_bytes()))
}

/// Sorts peers by `keccak256(peer ∥ session)` descending, ties broken by raw id.
pub fn sort_peers_for_session(peers: &[PeerId], session_id: &str) -> Vec<PeerId> {
    let mut sorted: Vec<(PeerId, [u8; 32])> = peers
        .iter()
        .collect::<BTreeSet<_>>()
        .into_iter()
        .map(|peer| (*peer, peer_session_hash(peer, session_id)))
        .collect();
    sorted.sort_by(|(a, a_hash), (b, b_hash)| {
        b_hash
            .cmp(a_hash)
            .then_with(|| a.to_bytes().cmp(&b.to_bytes()))
    });
    sorted.into_iter().map(|(peer, _)| peer).collect()
}

/// Returns true if `peer` ranks strictly above `other` for the session.
pub fn is_peer_id_higher(peer: &PeerId, other: &PeerId, session_id: &str) -> bool {
    session_order(peer, other, session_id) == Ordering::Less
}

/// Session-independent canonical ordering, used for persisted peer lists.
pub fn sort_peers(peers: &[PeerId]) -> Vec<PeerId> {
    peers
        .iter()
        .copied()
        .collect::<BTreeSet<_>>()
        .into_iter()
        .collect()
}

/// Peers of `peers` that are also in `other`, keeping the order of `peers`.
pub fn peers_intersection(peers: &[PeerId], other: &[PeerId]) -> Vec<PeerId> {
    let other: BTreeSet<_> = other.iter().collect();
    peers
        .iter()
        .filter(|peer| other.contains(peer))
        .copied()
        .collect()
}

/// Peers of `peers` that are not in `other`, keeping the order of `peers`.
pub fn peers_difference(peers: &[PeerId], other: &[PeerId]) -> Vec<PeerId> {
    let other: BTreeSet<_> = other.iter().collect();
    peers
        .iter()
        .filter(|peer| !other.contains(peer))
        .copied()
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    fn peers(n: usize) -> Vec<PeerId> {
        (0..n).map(|_| PeerId::random()).collect()
    }

    #[test]
    fn session_sort_is_stable_across_input_order() {
        let peers = peers(7);
        let mut reversed = peers.clone();
        reversed.reverse();

        let sorted = sort_peers_for_session(&peers, "signing1");
        assert_eq!(sorted, sort_peers_for_session(&reversed, "signing1"));
        assert_eq!(sorted.len(), peers.len());

        for pair in sorted.windows(2) {
            assert!(
                peer_session_hash(&pair[0], "signing1") >= peer_session_hash(&pair[1], "signing1")
            );
            assert!(is_peer_id_higher(&pair[0], &pair[1], "signing1"));
            assert!(!is_peer_id_higher(&pair[1], &pair[0], "signing1"));
        }
    }

    #[test]
    fn duplicates_are_collapsed() {
        let peer = PeerId::random();
        let sorted = sort_peers_for_session(&[peer, peer, peer], "s");
        assert_eq!(sorted, vec![peer]);
        assert!(!is_peer_id_higher(&peer, &peer, "s"));
    }

    #[test]
    fn session_salt_changes_the_order() {
        let peers = peers(16);
        let orders: BTreeSet<_> = (0..8)
            .map(|i| sort_peers_for_session(&peers, &format!("session-{i}"))[0])
            .collect();
        // 8 sessions over 16 peers all electing the same first peer is practically impossible
        assert!(orders.len() > 1);
    }

    #[test]
    fn set_helpers_keep_order() {
        let all = peers(5);
        let some = vec![all[3], all[1]];

        assert_eq!(peers_intersection(&all, &some), vec![all[1], all[3]]);
        assert_eq!(peers_difference(&all, &some), vec![all[0], all[2], all[4]]);
        assert!(peers_intersection(&all, &[]).is_empty());
        assert_eq!(peers_difference(&all, &[]), all);
    }

    proptest! {
        #[test]
        fn canonical_sort_is_deterministic(n in 1usize..12, session in "[a-z0-9-]{1,16}") {
            let peers = peers(n);
            let mut shuffled = peers.clone();
            shuffled.rotate_left(n / 2);

            prop_assert_eq!(sort_peers(&peers), sort_peers(&shuffled));
            prop_assert_eq!(
                sort_peers_for_session(&peers, &session),
                sort_peers_for_session(&shuffled, &session)
            );
        }
    }
}
