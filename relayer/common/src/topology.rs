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

use crate::{Multiaddr, PeerId, Protocol};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use thiserror::Error;

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum TopologyError {
    #[error("topology has no peers")]
    EmptyPeers,
    #[error("peer {0} is listed more than once")]
    DuplicatePeer(PeerId),
    #[error("address `{0}` does not end with a `/p2p/<peer-id>` component")]
    MissingPeerId(String),
    #[error("invalid peer address `{address}`: {reason}")]
    InvalidAddress { address: String, reason: String },
    #[error("threshold {threshold} is invalid for {peers} peers")]
    InvalidThreshold { threshold: u16, peers: usize },
}

/// Authenticated roster of relayer peers and the signing threshold.
///
/// `threshold + 1` peers are required to sign.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(try_from = "RawTopology", into = "RawTopology")]
pub struct Topology {
    peers: BTreeMap<PeerId, Multiaddr>,
    threshold: u16,
}

impl Topology {
    pub fn new(
        peers: impl IntoIterator<Item = (PeerId, Multiaddr)>,
        threshold: u16,
    ) -> Result<Self, TopologyError> {
        let mut map = BTreeMap::new();
        for (peer, address) in peers {
            if map.insert(peer, strip_peer_id(address)).is_some() {
                return Err(TopologyError::DuplicatePeer(peer));
            }
        }

        let topology = Self {
            peers: map,
            threshold,
        };
        topology.validate()?;
        Ok(topology)
    }

    fn validate(&self) -> Result<(), TopologyError> {
        if self.peers.is_empty() {
            return Err(TopologyError::EmptyPeers);
        }
        if self.threshold == 0 || self.threshold as usize + 1 > self.peers.len() {
            return Err(TopologyError::InvalidThreshold {
                threshold: self.threshold,
                peers: self.peers.len(),
            });
        }
        Ok(())
    }

    pub fn threshold(&self) -> u16 {
        self.threshold
    }

    pub fn len(&self) -> usize {
        self.peers.len()
    }

    pub fn is_empty(&self) -> bool {
        self.peers.is_empty()
    }

    pub fn contains(&self, peer: &PeerId) -> bool {
        self.peers.contains_key(peer)
    }

    /// Transport address of `peer`, without the `/p2p` suffix.
    pub fn address(&self, peer: &PeerId) -> Option<&Multiaddr> {
        self.peers.get(peer)
    }

    /// Peer ids in canonical order.
    pub fn peer_ids(&self) -> Vec<PeerId> {
        self.peers.keys().copied().collect()
    }

    pub fn iter(&self) -> impl Iterator<Item = (&PeerId, &Multiaddr)> {
        self.peers.iter()
    }
}

fn strip_peer_id(mut address: Multiaddr) -> Multiaddr {
    if let Some(Protocol::P2p(_)) = address.iter().last() {
        address.pop();
    }
    address
}

/// JSON form of the roster, as distributed to relayers.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RawTopology {
    pub peers: Vec<RawPeer>,
    pub threshold: u16,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RawPeer {
    pub peer_address: String,
}

impl TryFrom<RawTopology> for Topology {
    type Error = TopologyError;

    fn try_from(raw: RawTopology) -> Result<Self, Self::Error> {
        let peers = raw
            .peers
            .into_iter()
            .map(|RawPeer { peer_address }| {
                let address: Multiaddr =
                    peer_address
                        .parse()
                        .map_err(|err: libp2p::multiaddr::Error| {
                            TopologyError::InvalidAddress {
                                address: peer_address.clone(),
                                reason: err.to_string(),
                            }
                        })?;
                match address.iter().last() {
                    Some(Protocol::P2p(peer)) => Ok((peer, address)),
                    _ => Err(TopologyError::MissingPeerId(peer_address)),
                }
            })
            .collect::<Result<Vec<_>, _>>()?;

        Topology::new(peers, raw.threshold)
    }
}

impl From<Topology> for RawTopology {
    fn from(topology: Topology) -> Self {
        let peers = topology
            .peers
            .into_iter()
            .map(|(peer, address)| RawPeer {
                peer_address: address.with(Protocol::P2p(peer)).to_string(),
            })
            .collect();

        RawTopology {
            peers,
            threshold: topology.threshold,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn address(port: u16, peer: PeerId) -> String {
        format!("/ip4/127.0.0.1/tcp/{port}/p2p/{peer}")
    }

    #[test]
    fn parses_roster_json() {
        let (a, b, c) = (PeerId::random(), PeerId::random(), PeerId::random());
        let json = format!(
            r#"{{"peers":[{{"peerAddress":"{}"}},{{"peerAddress":"{}"}},{{"peerAddress":"{}"}}],"threshold":1}}"#,
            address(9000, a),
            address(9001, b),
            address(9002, c)
        );

        let topology: Topology = serde_json::from_str(&json).unwrap();
        assert_eq!(topology.len(), 3);
        assert_eq!(topology.threshold(), 1);
        assert!(topology.contains(&b));
        assert!(!topology.contains(&PeerId::random()));
        assert_eq!(
            topology.address(&a).unwrap().to_string(),
            "/ip4/127.0.0.1/tcp/9000"
        );

        let again: Topology =
            serde_json::from_slice(&serde_json::to_vec(&topology).unwrap()).unwrap();
        assert_eq!(again, topology);
    }

    #[test]
    fn rejects_invalid_rosters() {
        let peer = PeerId::random();

        let raw = RawTopology {
            peers: vec![],
            threshold: 1,
        };
        assert_eq!(Topology::try_from(raw), Err(TopologyError::EmptyPeers));

        let raw = RawTopology {
            peers: vec![
                RawPeer {
                    peer_address: address(1, peer),
                },
                RawPeer {
                    peer_address: address(2, peer),
                },
            ],
            threshold: 1,
        };
        assert_eq!(Topology::try_from(raw), Err(TopologyError::DuplicatePeer(peer)));

        let raw = RawTopology {
            peers: vec![RawPeer {
                peer_address: "/ip4/127.0.0.1/tcp/1".into(),
            }],
            threshold: 1,
        };
        assert!(matches!(
            Topology::try_from(raw),
            Err(TopologyError::MissingPeerId(_))
        ));

        let raw = RawTopology {
            peers: vec![RawPeer {
                peer_address: "not an address".into(),
            }],
            threshold: 1,
        };
        assert!(matches!(
            Topology::try_from(raw),
            Err(TopologyError::InvalidAddress { .. })
        ));
    }

    #[test]
    fn threshold_bounds() {
        let peers: Vec<_> = (0..3)
            .map(|i| (PeerId::random(), format!("/memory/{i}").parse().unwrap()))
            .collect();

        assert!(Topology::new(peers.clone(), 1).is_ok());
        assert!(Topology::new(peers.clone(), 2).is_ok());
        assert_eq!(
            Topology::new(peers.clone(), 0),
            Err(TopologyError::InvalidThreshold {
                threshold: 0,
                peers: 3
            })
        );
        assert_eq!(
            Topology::new(peers, 3),
            Err(TopologyError::InvalidThreshold {
                threshold: 3,
                peers: 3
            })
        );
    }
}
