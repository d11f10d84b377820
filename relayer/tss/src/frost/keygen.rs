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

//! Two-round Pedersen DKG.

use super::{
    blame_identifier, decode_message, encode_message, identifier, identifiers, keyshare_peers,
};
use crate::{
    keyshare::FrostKeyshare,
    mpc::{Handled, KeygenParams, MpcError, MpcProtocol, Outgoing, ProtocolAction},
};
use frost_secp256k1_tr::{Identifier, keys::dkg, rand_core::OsRng};
use relayer_common::PeerId;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

#[derive(Serialize, Deserialize)]
enum KeygenMessage {
    Round1(dkg::round1::Package),
    Round2(dkg::round2::Package),
}

type Actions = Vec<ProtocolAction<FrostKeyshare>>;

pub struct FrostKeygen {
    local: Identifier,
    ids: BTreeMap<Identifier, PeerId>,
    threshold: u16,
    round1_secret: Option<dkg::round1::SecretPackage>,
    round2_secret: Option<dkg::round2::SecretPackage>,
    round1: BTreeMap<Identifier, dkg::round1::Package>,
    round2: BTreeMap<Identifier, dkg::round2::Package>,
    finished: bool,
}

impl FrostKeygen {
    pub fn new(params: KeygenParams) -> Result<Self, MpcError> {
        let ids = identifiers(params.peers.iter().copied())?;
        if ids.len() != params.peers.len() {
            return Err(MpcError::new("duplicate keygen participants"));
        }
        let local = identifier(&params.local)?;
        if !ids.contains_key(&local) {
            return Err(MpcError::new("local peer is not a keygen participant"));
        }
        if usize::from(params.threshold) + 1 > ids.len() {
            return Err(MpcError::new(format!(
                "threshold {} needs more than {} participants",
                params.threshold,
                ids.len()
            )));
        }

        Ok(Self {
            local,
            ids,
            threshold: params.threshold,
            round1_secret: None,
            round2_secret: None,
            round1: BTreeMap::new(),
            round2: BTreeMap::new(),
            finished: false,
        })
    }

    fn others(&self) -> usize {
        self.ids.len() - 1
    }

    fn advance(&mut self) -> Result<Actions, MpcError> {
        let mut actions = vec![];

        if self.round2_secret.is_none() && self.round1.len() == self.others() {
            if let Some(secret) = self.round1_secret.take() {
                let (secret, packages) = dkg::part2(secret, &self.round1)
                    .map_err(|err| blame_identifier(&self.ids, err, "dkg round 2 failed"))?;
                for (id, package) in packages {
                    let peer = self.ids.get(&id).copied().ok_or_else(|| {
                        MpcError::new("dkg produced a package for an unknown participant")
                    })?;
                    let payload = encode_message(&KeygenMessage::Round2(package))?;
                    actions.push(ProtocolAction::Send(Outgoing::to(peer, payload)));
                }
                self.round2_secret = Some(secret);
            }
        }

        if !self.finished && self.round2.len() == self.others() {
            if let Some(secret) = self.round2_secret.as_ref() {
                let (key_package, public_key_package) =
                    dkg::part3(secret, &self.round1, &self.round2)
                        .map_err(|err| blame_identifier(&self.ids, err, "dkg finalization failed"))?;
                let peers: Vec<_> = self.ids.values().copied().collect();
                let keyshare = FrostKeyshare::from_packages(
                    key_package,
                    public_key_package,
                    self.threshold,
                    keyshare_peers(&peers),
                )?;
                self.finished = true;
                actions.push(ProtocolAction::Finish(keyshare));
            }
        }

        Ok(actions)
    }
}

impl MpcProtocol for FrostKeygen {
    type Output = FrostKeyshare;

    fn start(&mut self) -> Result<Actions, MpcError> {
        let max_signers = u16::try_from(self.ids.len())
            .map_err(|_| MpcError::new("too many keygen participants"))?;
        let (secret, package) = dkg::part1(self.local, max_signers, self.threshold + 1, OsRng)
            .map_err(|err| MpcError::new(format!("dkg round 1 failed: {err}")))?;
        self.round1_secret = Some(secret);

        let payload = encode_message(&KeygenMessage::Round1(package))?;
        let mut actions = vec![ProtocolAction::Send(Outgoing::broadcast(payload))];
        actions.extend(self.advance()?);
        Ok(actions)
    }

    fn handle(&mut self, from: PeerId, payload: &[u8]) -> Result<Handled<FrostKeyshare>, MpcError> {
        let id = identifier(&from)?;
        if id == self.local || !self.ids.contains_key(&id) {
            return Ok(Handled::rejected());
        }

        match decode_message(from, payload)? {
            KeygenMessage::Round1(package) => {
                self.round1.entry(id).or_insert(package);
            }
            KeygenMessage::Round2(package) => {
                self.round2.entry(id).or_insert(package);
            }
        }
        Ok(Handled::accepted(self.advance()?))
    }

    fn waiting_for(&self) -> Vec<PeerId> {
        if self.finished {
            return vec![];
        }
        let received = |id: &Identifier| match self.round2_secret {
            None => self.round1.contains_key(id),
            Some(_) => self.round2.contains_key(id),
        };
        self.ids
            .iter()
            .filter(|(id, _)| **id != self.local && !received(id))
            .map(|(_, peer)| *peer)
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::frost::tests::{keygen, sign};

    #[test]
    fn all_participants_agree_on_the_group_key() {
        let peers: Vec<_> = (0..4).map(|_| PeerId::random()).collect();
        let keyshares = keygen(&peers, 2);

        assert_eq!(keyshares.len(), 4);
        let public_key = &keyshares[&peers[0]].public_key;
        for keyshare in keyshares.values() {
            assert_eq!(&keyshare.public_key, public_key);
            assert_eq!(keyshare.threshold, 2);
            assert_eq!(keyshare.peers.len(), 4);
        }

        let signers = &peers[1..];
        let signatures = sign(&keyshares, signers, b"message").unwrap();
        for signature in signatures.values() {
            keyshares[&peers[0]].verify(b"message", signature).unwrap();
        }
    }

    #[test]
    fn waiting_for_tracks_missing_round_packages() {
        let peers: Vec<_> = (0..3).map(|_| PeerId::random()).collect();
        let mut protocol = FrostKeygen::new(KeygenParams {
            session_id: "keygen".into(),
            local: peers[0],
            peers: peers.clone(),
            threshold: 1,
        })
        .unwrap();

        protocol.start().unwrap();
        let mut waiting = protocol.waiting_for();
        waiting.sort();
        let mut expected = peers[1..].to_vec();
        expected.sort();
        assert_eq!(waiting, expected);

        let outsider = PeerId::random();
        assert!(!protocol.handle(outsider, b"{}").unwrap().accepted);
        assert_eq!(
            protocol.handle(peers[1], b"garbage").unwrap_err().culprit,
            Some(peers[1])
        );
    }

    #[test]
    fn rejects_unreachable_threshold() {
        let peers: Vec<_> = (0..2).map(|_| PeerId::random()).collect();
        let params = KeygenParams {
            session_id: "keygen".into(),
            local: peers[0],
            peers,
            threshold: 2,
        };
        assert!(FrostKeygen::new(params).is_err());
    }
}
