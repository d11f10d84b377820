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

//! FROST over secp256k1 with BIP-340 (Taproot) signatures.

mod keygen;
mod resharing;
mod signing;

use crate::{
    keyshare::FrostKeyshare,
    mpc::{
        BoxedProtocol, KeygenParams, MpcBackend, MpcError, ResharingParams, SigningParams,
    },
};
use frost_secp256k1_tr::{
    self as frost, Identifier,
    keys::{KeyPackage, PublicKeyPackage, SigningShare, VerifyingShare},
};
use k256::{
    FieldBytes, ProjectivePoint, PublicKey, Scalar,
    elliptic_curve::{PrimeField, sec1::ToEncodedPoint},
};
use relayer_common::PeerId;
use serde::{Deserialize, Serialize, de::DeserializeOwned};
use std::collections::BTreeMap;

pub use keygen::FrostKeygen;
pub use resharing::FrostResharing;
pub use signing::FrostSigning;

/// Builds FROST-Taproot protocol instances.
#[derive(Debug, Default, Clone, Copy)]
pub struct FrostBackend;

impl MpcBackend for FrostBackend {
    type Keyshare = FrostKeyshare;

    fn keygen(&self, params: KeygenParams) -> Result<BoxedProtocol<FrostKeyshare>, MpcError> {
        Ok(Box::new(FrostKeygen::new(params)?))
    }

    fn signing(
        &self,
        params: SigningParams,
        keyshare: &FrostKeyshare,
    ) -> Result<BoxedProtocol<Vec<u8>>, MpcError> {
        Ok(Box::new(FrostSigning::new(params, keyshare)?))
    }

    fn resharing(
        &self,
        params: ResharingParams,
        keyshare: Option<&FrostKeyshare>,
    ) -> Result<BoxedProtocol<FrostKeyshare>, MpcError> {
        Ok(Box::new(FrostResharing::new(params, keyshare)?))
    }
}

#[derive(Serialize, Deserialize)]
struct KeyMaterial {
    key_package: KeyPackage,
    public_key_package: PublicKeyPackage,
}

impl FrostKeyshare {
    pub fn from_packages(
        key_package: KeyPackage,
        public_key_package: PublicKeyPackage,
        threshold: u16,
        peers: Vec<PeerId>,
    ) -> Result<Self, MpcError> {
        let public_key = hex::encode(encode_hex(public_key_package.verifying_key())?);
        let material = KeyMaterial {
            key_package,
            public_key_package,
        };
        let key = serde_json::to_vec(&material)
            .map_err(|err| MpcError::new(format!("failed to encode key material: {err}")))?;

        Ok(Self {
            key,
            public_key,
            threshold,
            peers,
        })
    }

    fn material(&self) -> Result<KeyMaterial, MpcError> {
        serde_json::from_slice(&self.key)
            .map_err(|err| MpcError::new(format!("failed to decode key material: {err}")))
    }

    pub fn key_package(&self) -> Result<KeyPackage, MpcError> {
        Ok(self.material()?.key_package)
    }

    pub fn public_key_package(&self) -> Result<PublicKeyPackage, MpcError> {
        Ok(self.material()?.public_key_package)
    }

    /// Checks a 64-byte BIP-340 signature against the group key.
    pub fn verify(&self, message: &[u8], signature: &[u8]) -> Result<(), MpcError> {
        let signature = frost::Signature::deserialize(signature)
            .map_err(|err| MpcError::new(format!("malformed signature: {err}")))?;
        self.public_key_package()?
            .verifying_key()
            .verify(message, &signature)
            .map_err(|err| MpcError::new(format!("invalid signature: {err}")))
    }
}

pub(crate) fn identifier(peer: &PeerId) -> Result<Identifier, MpcError> {
    Identifier::derive(&peer.to_bytes())
        .map_err(|err| MpcError::new(format!("failed to derive identifier of {peer}: {err}")))
}

pub(crate) fn identifiers(
    peers: impl IntoIterator<Item = PeerId>,
) -> Result<BTreeMap<Identifier, PeerId>, MpcError> {
    peers
        .into_iter()
        .map(|peer| Ok((identifier(&peer)?, peer)))
        .collect()
}

pub(crate) fn blame_identifier(
    ids: &BTreeMap<Identifier, PeerId>,
    err: frost::Error,
    context: &str,
) -> MpcError {
    match err.culprit().and_then(|culprit| ids.get(&culprit)) {
        Some(peer) => MpcError::blame(*peer, format!("{context}: {err}")),
        None => MpcError::new(format!("{context}: {err}")),
    }
}

pub(crate) fn encode_message<M: Serialize>(message: &M) -> Result<Vec<u8>, MpcError> {
    serde_json::to_vec(message).map_err(|err| MpcError::new(format!("encode failed: {err}")))
}

pub(crate) fn decode_message<M: DeserializeOwned>(
    from: PeerId,
    payload: &[u8],
) -> Result<M, MpcError> {
    serde_json::from_slice(payload)
        .map_err(|err| MpcError::blame(from, format!("malformed protocol message: {err}")))
}

/// Raw bytes of a FROST scalar or element, taken from its hex serde form.
fn encode_hex<T: Serialize>(value: &T) -> Result<Vec<u8>, MpcError> {
    match serde_json::to_value(value) {
        Ok(serde_json::Value::String(encoded)) => {
            hex::decode(encoded).map_err(|err| MpcError::new(format!("bad hex encoding: {err}")))
        }
        Ok(other) => Err(MpcError::new(format!("unexpected encoding {other}"))),
        Err(err) => Err(MpcError::new(format!("encode failed: {err}"))),
    }
}

fn decode_hex<T: DeserializeOwned>(bytes: &[u8]) -> Result<T, MpcError> {
    serde_json::from_value(serde_json::Value::String(hex::encode(bytes)))
        .map_err(|err| MpcError::new(format!("decode failed: {err}")))
}

pub(crate) fn bytes_to_scalar(bytes: &[u8]) -> Result<Scalar, MpcError> {
    if bytes.len() != 32 {
        return Err(MpcError::new(format!("scalar of {} bytes", bytes.len())));
    }
    Option::from(Scalar::from_repr(FieldBytes::clone_from_slice(bytes)))
        .ok_or_else(|| MpcError::new("scalar out of range"))
}

pub(crate) fn identifier_scalar(id: &Identifier) -> Result<Scalar, MpcError> {
    bytes_to_scalar(&encode_hex(id)?)
}

pub(crate) fn share_scalar(share: &SigningShare) -> Result<Scalar, MpcError> {
    bytes_to_scalar(&encode_hex(share)?)
}

pub(crate) fn scalar_share(scalar: &Scalar) -> Result<SigningShare, MpcError> {
    decode_hex(&scalar.to_repr())
}

pub(crate) fn bytes_to_point(bytes: &[u8]) -> Result<ProjectivePoint, MpcError> {
    PublicKey::from_sec1_bytes(bytes)
        .map(|key| key.to_projective())
        .map_err(|_| MpcError::new("invalid curve point"))
}

pub(crate) fn point_bytes(point: &ProjectivePoint) -> Vec<u8> {
    point.to_affine().to_encoded_point(true).as_bytes().to_vec()
}

pub(crate) fn verifying_share_point(share: &VerifyingShare) -> Result<ProjectivePoint, MpcError> {
    bytes_to_point(&encode_hex(share)?)
}

pub(crate) fn verifying_key_point(key: &frost::VerifyingKey) -> Result<ProjectivePoint, MpcError> {
    bytes_to_point(&encode_hex(key)?)
}

pub(crate) fn point_verifying_share(point: &ProjectivePoint) -> Result<VerifyingShare, MpcError> {
    decode_hex(&point_bytes(point))
}

pub(crate) fn point_verifying_key(point: &ProjectivePoint) -> Result<frost::VerifyingKey, MpcError> {
    decode_hex(&point_bytes(point))
}

/// Keeps the keyshare peer list in a stable order.
pub(crate) fn keyshare_peers(peers: &[PeerId]) -> Vec<PeerId> {
    relayer_common::peer::sort_peers(peers)
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use crate::{
        keyshare::Keyshare,
        mpc::{MpcProtocol, ProtocolAction},
    };
    use std::collections::VecDeque;

    /// Runs protocols in lock step, routing every message in memory.
    pub fn run_local<O: Send + 'static>(
        mut protocols: BTreeMap<PeerId, BoxedProtocol<O>>,
    ) -> Result<BTreeMap<PeerId, O>, MpcError> {
        let peers: Vec<_> = protocols.keys().copied().collect();
        let mut queue = VecDeque::new();
        let mut outputs = BTreeMap::new();

        let dispatch = |from: PeerId,
                            actions: Vec<ProtocolAction<O>>,
                            queue: &mut VecDeque<(PeerId, PeerId, Vec<u8>)>,
                            outputs: &mut BTreeMap<PeerId, O>| {
            for action in actions {
                match action {
                    ProtocolAction::Send(out) => match out.to {
                        Some(to) => queue.push_back((from, to, out.payload)),
                        None => {
                            for to in peers.iter().filter(|p| **p != from) {
                                queue.push_back((from, *to, out.payload.clone()));
                            }
                        }
                    },
                    ProtocolAction::Finish(output) => {
                        outputs.insert(from, output);
                    }
                }
            }
        };

        for (peer, protocol) in protocols.iter_mut() {
            let actions = protocol.start()?;
            dispatch(*peer, actions, &mut queue, &mut outputs);
        }
        while let Some((from, to, payload)) = queue.pop_front() {
            let Some(protocol) = protocols.get_mut(&to) else {
                continue;
            };
            let handled = protocol.handle(from, &payload)?;
            assert!(handled.accepted, "{to} rejected a message from {from}");
            dispatch(to, handled.actions, &mut queue, &mut outputs);
        }
        Ok(outputs)
    }

    pub fn keygen(peers: &[PeerId], threshold: u16) -> BTreeMap<PeerId, FrostKeyshare> {
        let protocols = peers
            .iter()
            .map(|peer| {
                let params = KeygenParams {
                    session_id: "keygen".into(),
                    local: *peer,
                    peers: peers.to_vec(),
                    threshold,
                };
                (*peer, FrostBackend.keygen(params).unwrap())
            })
            .collect();
        run_local(protocols).unwrap()
    }

    pub fn sign(
        keyshares: &BTreeMap<PeerId, FrostKeyshare>,
        signers: &[PeerId],
        message: &[u8],
    ) -> Result<BTreeMap<PeerId, Vec<u8>>, MpcError> {
        let protocols = signers
            .iter()
            .map(|peer| {
                let params = SigningParams {
                    session_id: "signing".into(),
                    local: *peer,
                    signers: signers.to_vec(),
                    message: message.to_vec(),
                };
                Ok((*peer, FrostBackend.signing(params, &keyshares[peer])?))
            })
            .collect::<Result<_, MpcError>>()?;
        run_local(protocols)
    }

    #[test]
    fn scalar_and_point_conversions_agree_with_frost() {
        let peers: Vec<_> = (0..3).map(|_| PeerId::random()).collect();
        let keyshares = keygen(&peers, 1);

        for keyshare in keyshares.values() {
            let key_package = keyshare.key_package().unwrap();
            let secret = share_scalar(key_package.signing_share()).unwrap();
            let public = verifying_share_point(key_package.verifying_share()).unwrap();
            assert_eq!(ProjectivePoint::GENERATOR * secret, public);

            let back = scalar_share(&secret).unwrap();
            assert_eq!(&back, key_package.signing_share());
            let back = point_verifying_share(&public).unwrap();
            assert_eq!(&back, key_package.verifying_share());
        }
    }

    #[test]
    fn keyshare_material_round_trips() {
        let peers: Vec<_> = (0..3).map(|_| PeerId::random()).collect();
        let keyshares = keygen(&peers, 1);
        let keyshare = &keyshares[&peers[0]];

        assert_eq!(keyshare.threshold(), 1);
        assert_eq!(keyshare.peers(), keyshare_peers(&peers).as_slice());
        assert_eq!(keyshare.public_key.len(), 66);

        let json = serde_json::to_vec(keyshare).unwrap();
        let decoded: FrostKeyshare = serde_json::from_slice(&json).unwrap();
        assert_eq!(decoded.key_package().unwrap(), keyshare.key_package().unwrap());
    }
}
