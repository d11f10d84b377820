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

//! Share redistribution to a new committee under the same group key.
//!
//! Every old shareholder in the subset deals its Lagrange-weighted share with a
//! fresh polynomial of the new degree and Feldman commitments to it. A new
//! party's share is the sum of the deals it received, so the secret, and with
//! it the group key, stays the same.

use super::{
    bytes_to_point, bytes_to_scalar, decode_message, encode_message, identifier,
    identifier_scalar, keyshare_peers, point_bytes, point_verifying_key, point_verifying_share,
    scalar_share, share_scalar, verifying_key_point, verifying_share_point,
};
use crate::{
    keyshare::FrostKeyshare,
    mpc::{Handled, MpcError, MpcProtocol, Outgoing, ProtocolAction, ResharingParams},
};
use frost_secp256k1_tr::{
    Identifier,
    keys::{KeyPackage, PublicKeyPackage},
    rand_core::OsRng,
};
use k256::{ProjectivePoint, Scalar, elliptic_curve::Field};
use relayer_common::PeerId;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

#[derive(Serialize, Deserialize)]
struct Deal {
    /// Compressed points, constant term first.
    commitments: Vec<String>,
    share: String,
}

type Actions = Vec<ProtocolAction<FrostKeyshare>>;

struct OldKey {
    key_package: KeyPackage,
    public_key_package: PublicKeyPackage,
}

struct NewParty {
    id: Identifier,
    x: Scalar,
}

pub struct FrostResharing {
    local: PeerId,
    dealers: BTreeMap<PeerId, Scalar>,
    new_parties: BTreeMap<PeerId, NewParty>,
    new_threshold: u16,
    old_key: Option<OldKey>,
    received: BTreeMap<PeerId, (Vec<ProjectivePoint>, Scalar)>,
    finished: bool,
}

impl FrostResharing {
    pub fn new(params: ResharingParams, keyshare: Option<&FrostKeyshare>) -> Result<Self, MpcError> {
        let dealers = params
            .old_parties
            .iter()
            .map(|party| Ok((party.peer, identifier_scalar(&identifier(&party.peer)?)?)))
            .collect::<Result<BTreeMap<_, _>, MpcError>>()?;
        let new_parties = params
            .new_parties
            .iter()
            .map(|party| {
                let id = identifier(&party.peer)?;
                Ok((party.peer, NewParty { id, x: identifier_scalar(&id)? }))
            })
            .collect::<Result<BTreeMap<_, _>, MpcError>>()?;

        if dealers.len() <= usize::from(params.old_threshold) {
            return Err(MpcError::new(format!(
                "{} dealers cannot reconstruct a threshold {} key",
                dealers.len(),
                params.old_threshold
            )));
        }
        if new_parties.len() <= usize::from(params.new_threshold) || params.new_threshold == 0 {
            return Err(MpcError::new(format!(
                "threshold {} is invalid for {} new parties",
                params.new_threshold,
                new_parties.len()
            )));
        }
        if !new_parties.contains_key(&params.local) {
            return Err(MpcError::new("local peer is not part of the new committee"));
        }

        let old_key = keyshare
            .map(|keyshare| {
                Ok::<_, MpcError>(OldKey {
                    key_package: keyshare.key_package()?,
                    public_key_package: keyshare.public_key_package()?,
                })
            })
            .transpose()?;
        if dealers.contains_key(&params.local) && old_key.is_none() {
            return Err(MpcError::new("dealer has no keyshare"));
        }

        Ok(Self {
            local: params.local,
            dealers,
            new_parties,
            new_threshold: params.new_threshold,
            old_key,
            received: BTreeMap::new(),
            finished: false,
        })
    }

    /// Lagrange coefficient at zero of dealer `x` within the dealer set.
    fn lagrange(&self, x: &Scalar) -> Result<Scalar, MpcError> {
        let mut numerator = Scalar::ONE;
        let mut denominator = Scalar::ONE;
        for other in self.dealers.values().filter(|other| *other != x) {
            numerator *= other;
            denominator *= *other - x;
        }
        let inverse: Option<Scalar> = denominator.invert().into();
        inverse
            .map(|inverse| numerator * inverse)
            .ok_or_else(|| MpcError::new("duplicate dealer identifiers"))
    }

    fn deal(&mut self) -> Result<Actions, MpcError> {
        let (Some(x), Some(old)) = (self.dealers.get(&self.local), self.old_key.as_ref()) else {
            return Ok(vec![]);
        };
        let weighted = self.lagrange(x)? * share_scalar(old.key_package.signing_share())?;

        let mut coefficients = vec![weighted];
        coefficients.extend((0..self.new_threshold).map(|_| Scalar::random(&mut OsRng)));
        let commitments: Vec<_> = coefficients
            .iter()
            .map(|coefficient| ProjectivePoint::GENERATOR * coefficient)
            .collect();
        let encoded: Vec<_> = commitments
            .iter()
            .map(|point| hex::encode(point_bytes(point)))
            .collect();

        let mut actions = vec![];
        for (peer, party) in &self.new_parties {
            let share = evaluate(&coefficients, &party.x);
            if *peer == self.local {
                self.received.insert(self.local, (commitments.clone(), share));
                continue;
            }
            let deal = Deal {
                commitments: encoded.clone(),
                share: hex::encode(share.to_bytes()),
            };
            actions.push(ProtocolAction::Send(Outgoing::to(*peer, encode_message(&deal)?)));
        }
        Ok(actions)
    }

    fn verify_deal(&self, from: PeerId, deal: &Deal) -> Result<(Vec<ProjectivePoint>, Scalar), MpcError> {
        let blame = |reason: &str| MpcError::blame(from, format!("invalid deal: {reason}"));

        if deal.commitments.len() != usize::from(self.new_threshold) + 1 {
            return Err(blame("wrong polynomial degree"));
        }
        let commitments = deal
            .commitments
            .iter()
            .map(|point| {
                let bytes = hex::decode(point).map_err(|_| blame("commitment is not hex"))?;
                bytes_to_point(&bytes).map_err(|_| blame("commitment is not a point"))
            })
            .collect::<Result<Vec<_>, _>>()?;
        let share = hex::decode(&deal.share)
            .map_err(|_| blame("share is not hex"))
            .and_then(|bytes| bytes_to_scalar(&bytes).map_err(|_| blame("share is not a scalar")))?;

        let local = &self.new_parties[&self.local];
        if ProjectivePoint::GENERATOR * share != evaluate_commitments(&commitments, &local.x) {
            return Err(blame("share does not match commitments"));
        }

        // the constant term must commit to the dealer's weighted share
        if let Some(old) = &self.old_key {
            let x = self.dealers[&from];
            let dealer_share = old
                .public_key_package
                .verifying_shares()
                .get(&identifier(&from)?)
                .ok_or_else(|| blame("dealer has no verifying share"))?;
            let expected = verifying_share_point(dealer_share)? * self.lagrange(&x)?;
            if commitments[0] != expected {
                return Err(blame("constant term does not match the old key"));
            }
        }

        Ok((commitments, share))
    }

    fn finish(&mut self) -> Result<Actions, MpcError> {
        if self.finished || self.received.len() != self.dealers.len() {
            return Ok(vec![]);
        }

        let group_key = self
            .received
            .values()
            .fold(ProjectivePoint::IDENTITY, |acc, (commitments, _)| acc + commitments[0]);
        if let Some(old) = &self.old_key {
            if group_key != verifying_key_point(old.public_key_package.verifying_key())? {
                return Err(MpcError::new("reshared group key differs from the old one"));
            }
        }

        let secret = self
            .received
            .values()
            .fold(Scalar::ZERO, |acc, (_, share)| acc + share);

        let mut verifying_shares = BTreeMap::new();
        for party in self.new_parties.values() {
            let point = self
                .received
                .values()
                .fold(ProjectivePoint::IDENTITY, |acc, (commitments, _)| {
                    acc + evaluate_commitments(commitments, &party.x)
                });
            verifying_shares.insert(party.id, point_verifying_share(&point)?);
        }

        let local = &self.new_parties[&self.local];
        let verifying_key = point_verifying_key(&group_key)?;
        let verifying_share = verifying_shares
            .get(&local.id)
            .cloned()
            .ok_or_else(|| MpcError::new("missing local verifying share"))?;
        let key_package = KeyPackage::new(
            local.id,
            scalar_share(&secret)?,
            verifying_share,
            verifying_key,
            self.new_threshold + 1,
        );
        let public_key_package = PublicKeyPackage::new(verifying_shares, verifying_key);
        let peers: Vec<_> = self.new_parties.keys().copied().collect();
        let keyshare = FrostKeyshare::from_packages(
            key_package,
            public_key_package,
            self.new_threshold,
            keyshare_peers(&peers),
        )?;

        self.finished = true;
        Ok(vec![ProtocolAction::Finish(keyshare)])
    }
}

impl MpcProtocol for FrostResharing {
    type Output = FrostKeyshare;

    fn start(&mut self) -> Result<Actions, MpcError> {
        let mut actions = self.deal()?;
        actions.extend(self.finish()?);
        Ok(actions)
    }

    fn handle(&mut self, from: PeerId, payload: &[u8]) -> Result<Handled<FrostKeyshare>, MpcError> {
        if from == self.local || !self.dealers.contains_key(&from) {
            return Ok(Handled::rejected());
        }
        if self.received.contains_key(&from) {
            return Ok(Handled::accepted(vec![]));
        }

        let deal: Deal = decode_message(from, payload)?;
        let verified = self.verify_deal(from, &deal)?;
        self.received.insert(from, verified);
        Ok(Handled::accepted(self.finish()?))
    }

    fn waiting_for(&self) -> Vec<PeerId> {
        if self.finished {
            return vec![];
        }
        self.dealers
            .keys()
            .filter(|peer| !self.received.contains_key(peer))
            .copied()
            .collect()
    }
}

fn evaluate(coefficients: &[Scalar], x: &Scalar) -> Scalar {
    coefficients
        .iter()
        .rev()
        .fold(Scalar::ZERO, |acc, coefficient| acc * x + coefficient)
}

fn evaluate_commitments(commitments: &[ProjectivePoint], x: &Scalar) -> ProjectivePoint {
    commitments
        .iter()
        .rev()
        .fold(ProjectivePoint::IDENTITY, |acc, commitment| acc * x + commitment)
}
