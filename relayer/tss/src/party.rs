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

//! Party identifiers as seen by MPC backends.
//!
//! The FROST backend derives its identifiers from peer ids and never reads
//! [`Party::index`]. Indices and textual party ids are what index-based
//! backends, such as an external ECDSA one, receive through the protocol params.

use relayer_common::{PeerId, peer::sort_peers};
use std::{collections::BTreeMap, str::FromStr};
use thiserror::Error;

#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("invalid party id {0:?}")]
pub struct InvalidPartyId(pub String);

/// Party id of a peer: its textual peer id.
pub fn party_id(peer: &PeerId) -> String {
    peer.to_string()
}

pub fn peer_from_party_id(id: &str) -> Result<PeerId, InvalidPartyId> {
    PeerId::from_str(id).map_err(|_| InvalidPartyId(id.to_string()))
}

/// A peer with its 1-based MPC index.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Party {
    pub index: u16,
    pub peer: PeerId,
}

/// Canonically sorted parties, indexed from 1.
pub fn sorted_parties(peers: &[PeerId]) -> Vec<Party> {
    sort_peers(peers)
        .into_iter()
        .zip(1..)
        .map(|(peer, index)| Party { index, peer })
        .collect()
}

/// Indexes the old and new sets of a resharing.
///
/// Peers present in both keep their old index; peers only in `new` get indices
/// above every old one.
pub fn reindex_for_resharing(old: &[PeerId], new: &[PeerId]) -> (Vec<Party>, Vec<Party>) {
    let old = sorted_parties(old);
    let known: BTreeMap<PeerId, u16> = old.iter().map(|party| (party.peer, party.index)).collect();
    let mut next = old.iter().map(|party| party.index).max().unwrap_or(0);

    let new = sort_peers(new)
        .into_iter()
        .map(|peer| match known.get(&peer) {
            Some(&index) => Party { index, peer },
            None => {
                next += 1;
                Party { index: next, peer }
            }
        })
        .collect();
    (old, new)
}
