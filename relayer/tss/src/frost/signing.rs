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

//! Two-round FROST signing: commitments, then signature shares.

use super::{blame_identifier, decode_message, encode_message, identifier, identifiers};
use crate::{
    keyshare::FrostKeyshare,
    mpc::{Handled, MpcError, MpcProtocol, Outgoing, ProtocolAction, SigningParams},
};
use frost_secp256k1_tr::{
    self as frost, Identifier, SigningPackage,
    keys::{KeyPackage, PublicKeyPackage},
    rand_core::OsRng,
    round1::{SigningCommitments, SigningNonces},
    round2::SignatureShare,
};
use relayer_common::PeerId;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

#[derive(Serialize, Deserialize)]
enum SigningMessage {
    Commitments(SigningCommitments),
    Share(SignatureShare),
}

type Actions = Vec<ProtocolAction<Vec<u8>>>;

pub struct FrostSigning {
    local: Identifier,
    ids: BTreeMap<Identifier, PeerId>,
    message: Vec<u8>,
    key_package: KeyPackage,
    public_key_package: PublicKeyPackage,
    nonces: Option<SigningNonces>,
    commitments: BTreeMap<Identifier, SigningCommitments>,
    shares: BTreeMap<Identifier, SignatureShare>,
    package: Option<SigningPackage>,
    finished: bool,
}

impl FrostSigning {
    pub fn new(params: SigningParams, keyshare: &FrostKeyshare) -> Result<Self, MpcError> {
        let ids = identifiers(params.signers.iter().copied())?;
        let local = identifier(&params.local)?;
        if !ids.contains_key(&local) {
            return Err(MpcError::new("local peer is not a signer"));
        }
        if ids.len() <= usize::from(keyshare.threshold) {
            return Err(MpcError::new(format!(
                "{} signers cannot meet threshold {}",
                ids.len(),
                keyshare.threshold
            )));
        }

        Ok(Self {
            local,
            ids,
            message: params.message,
            key_package: keyshare.key_package()?,
            public_key_package: keyshare.public_key_package()?,
            nonces: None,
            commitments: BTreeMap::new(),
            shares: BTreeMap::new(),
            package: None,
            finished: false,
        })
    }

    fn advance(&mut self) -> Result<Actions, MpcError> {
        let mut actions = vec![];

        if self.package.is_none() && self.commitments.len() == self.ids.len() {
            if let Some(nonces) = self.nonces.take() {
                let package = SigningPackage::new(self.commitments.clone(), &self.message);
                let share = frost::round2::sign(&package, &nonces, &self.key_package)
                    .map_err(|err| MpcError::new(format!("signing round 2 failed: {err}")))?;

                self.shares.insert(self.local, share.clone());
                self.package = Some(package);
                let payload = encode_message(&SigningMessage::Share(share))?;
                actions.push(ProtocolAction::Send(Outgoing::broadcast(payload)));
            }
        }

        if !self.finished && self.shares.len() == self.ids.len() {
            if let Some(package) = self.package.as_ref() {
                let signature = frost::aggregate(package, &self.shares, &self.public_key_package)
                    .map_err(|err| blame_identifier(&self.ids, err, "aggregation failed"))?;
                let signature = signature
                    .serialize()
                    .map_err(|err| MpcError::new(format!("signature encoding failed: {err}")))?;
                self.finished = true;
                actions.push(ProtocolAction::Finish(signature));
            }
        }

        Ok(actions)
    }
}

impl MpcProtocol for FrostSigning {
    type Output = Vec<u8>;

    fn start(&mut self) -> Result<Actions, MpcError> {
        let (nonces, commitments) = frost::round1::commit(self.key_package.signing_share(), &mut OsRng);
        self.nonces = Some(nonces);
        self.commitments.insert(self.local, commitments.clone());

        let payload = encode_message(&SigningMessage::Commitments(commitments))?;
        let mut actions = vec![ProtocolAction::Send(Outgoing::broadcast(payload))];
        actions.extend(self.advance()?);
        Ok(actions)
    }

    fn handle(&mut self, from: PeerId, payload: &[u8]) -> Result<Handled<Vec<u8>>, MpcError> {
        let id = identifier(&from)?;
        if id == self.local || !self.ids.contains_key(&id) {
            return Ok(Handled::rejected());
        }

        match decode_message(from, payload)? {
            SigningMessage::Commitments(commitments) => {
                self.commitments.entry(id).or_insert(commitments);
            }
            SigningMessage::Share(share) => {
                self.shares.entry(id).or_insert(share);
            }
        }
        Ok(Handled::accepted(self.advance()?))
    }

    fn waiting_for(&self) -> Vec<PeerId> {
        if self.finished {
            return vec![];
        }
        let received = |id: &Identifier| match self.package {
            None => self.commitments.contains_key(id),
            Some(_) => self.shares.contains_key(id),
        };
        self.ids
            .iter()
            .filter(|(id, _)| !received(id))
            .map(|(_, peer)| *peer)
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::frost::tests::{keygen, sign};

    #[test]
    fn any_threshold_subset_signs() {
        let peers: Vec<_> = (0..3).map(|_| PeerId::random()).collect();
        let keyshares = keygen(&peers, 1);

        for signers in [&peers[..2], &peers[1..], &peers[..]] {
            let signatures = sign(&keyshares, signers, b"Message").unwrap();
            assert_eq!(signatures.len(), signers.len());
            for signature in signatures.values() {
                assert_eq!(signature.len(), 64);
                keyshares[&peers[2]].verify(b"Message", signature).unwrap();
            }
            assert!(keyshares[&peers[0]].verify(b"Other", &signatures[&signers[0]]).is_err());
        }
    }

    #[test]
    fn too_few_signers_are_rejected() {
        let peers: Vec<_> = (0..3).map(|_| PeerId::random()).collect();
        let keyshares = keygen(&peers, 1);
        assert!(sign(&keyshares, &peers[..1], b"Message").is_err());
    }
}
