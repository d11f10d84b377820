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

use libp2p::request_response::OutboundFailure;
use relayer_common::PeerId;
use thiserror::Error;

/// Failure of a single stream to a single peer.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum TransportError {
    #[error("peer is not part of the topology")]
    NotAllowed,
    #[error("dial failure")]
    DialFailure,
    #[error("stream timed out")]
    Timeout,
    #[error("connection closed before the message was acknowledged")]
    ConnectionClosed,
    #[error("remote does not support the relayer protocol")]
    UnsupportedProtocol,
    #[error("i/o error: {0}")]
    Io(String),
    #[error("stream released together with its session")]
    Released,
    #[error("payload of {0} bytes exceeds the frame limit")]
    PayloadTooLarge(usize),
    #[error("message serialization failed: {0}")]
    Serialization(String),
    #[error("network host is not running")]
    HostStopped,
}

impl From<OutboundFailure> for TransportError {
    fn from(failure: OutboundFailure) -> Self {
        match failure {
            OutboundFailure::DialFailure => TransportError::DialFailure,
            OutboundFailure::Timeout => TransportError::Timeout,
            OutboundFailure::ConnectionClosed => TransportError::ConnectionClosed,
            OutboundFailure::UnsupportedProtocols => TransportError::UnsupportedProtocol,
            OutboundFailure::Io(err) => TransportError::Io(err.to_string()),
        }
    }
}

/// Transport failure tagged with the peer it happened with.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("communication with {peer} failed: {cause}")]
pub struct CommunicationError {
    pub peer: PeerId,
    pub cause: TransportError,
}

impl CommunicationError {
    pub fn new(peer: PeerId, cause: TransportError) -> Self {
        Self { peer, cause }
    }
}
