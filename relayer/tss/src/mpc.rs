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

//! Adapter seam between processes and MPC libraries.
//!
//! A backend turns a library's round loop into an [`MpcProtocol`]: a synchronous
//! state machine fed with inbound bytes that answers with [`ProtocolAction`]s.
//! Processes own the transport, the protocol never sees the network.

use crate::{keyshare::Keyshare, party::Party};
use relayer_common::PeerId;
use thiserror::Error;

/// Protocol failure, optionally blaming a peer.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("{message}")]
pub struct MpcError {
    pub culprit: Option<PeerId>,
    pub message: String,
}

impl MpcError {
    pub fn new(message: impl Into<String>) -> Self {
        Self {
            culprit: None,
            message: message.into(),
        }
    }

    pub fn blame(peer: PeerId, message: impl Into<String>) -> Self {
        Self {
            culprit: Some(peer),
            message: message.into(),
        }
    }
}

/// Bytes for one peer, or for every participant when `to` is `None`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Outgoing {
    pub payload: Vec<u8>,
    pub to: Option<PeerId>,
}

impl Outgoing {
    pub fn broadcast(payload: Vec<u8>) -> Self {
        Self { payload, to: None }
    }

    pub fn to(peer: PeerId, payload: Vec<u8>) -> Self {
        Self {
            payload,
            to: Some(peer),
        }
    }
}

#[derive(Debug)]
pub enum ProtocolAction<O> {
    Send(Outgoing),
    Finish(O),
}

/// Outcome of feeding one message into a protocol.
#[derive(Debug)]
pub struct Handled<O> {
    pub accepted: bool,
    pub actions: Vec<ProtocolAction<O>>,
}

impl<O> Handled<O> {
    pub fn accepted(actions: Vec<ProtocolAction<O>>) -> Self {
        Self {
            accepted: true,
            actions,
        }
    }

    pub fn rejected() -> Self {
        Self {
            accepted: false,
            actions: vec![],
        }
    }
}

pub trait MpcProtocol: Send {
    type Output: Send + 'static;

    /// First round messages.
    fn start(&mut self) -> Result<Vec<ProtocolAction<Self::Output>>, MpcError>;

    fn handle(&mut self, from: PeerId, payload: &[u8]) -> Result<Handled<Self::Output>, MpcError>;

    /// Peers whose messages the current round still needs.
    fn waiting_for(&self) -> Vec<PeerId>;
}

pub type BoxedProtocol<O> = Box<dyn MpcProtocol<Output = O>>;

#[derive(Debug, Clone)]
pub struct KeygenParams {
    pub session_id: String,
    pub local: PeerId,
    pub peers: Vec<PeerId>,
    pub threshold: u16,
}

#[derive(Debug, Clone)]
pub struct SigningParams {
    pub session_id: String,
    pub local: PeerId,
    pub signers: Vec<PeerId>,
    pub message: Vec<u8>,
}

#[derive(Debug, Clone)]
pub struct ResharingParams {
    pub session_id: String,
    pub local: PeerId,
    /// Dealers: the old shareholders taking part.
    pub old_parties: Vec<Party>,
    pub old_threshold: u16,
    pub new_parties: Vec<Party>,
    pub new_threshold: u16,
}

/// Builds protocol instances for one curve.
pub trait MpcBackend: Send + Sync + 'static {
    type Keyshare: Keyshare;

    fn keygen(&self, params: KeygenParams) -> Result<BoxedProtocol<Self::Keyshare>, MpcError>;

    /// Produces the final signature bytes.
    fn signing(
        &self,
        params: SigningParams,
        keyshare: &Self::Keyshare,
    ) -> Result<BoxedProtocol<Vec<u8>>, MpcError>;

    /// `keyshare` is `None` for peers joining the key.
    fn resharing(
        &self,
        params: ResharingParams,
        keyshare: Option<&Self::Keyshare>,
    ) -> Result<BoxedProtocol<Self::Keyshare>, MpcError>;
}
