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

use crate::{keyshare::KeyshareError, mpc::MpcError};
use relayer_common::PeerId;
use relayer_network::CommunicationError;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum TssError {
    #[error(transparent)]
    Communication(#[from] CommunicationError),
    #[error("local peer {0} is not part of the chosen signing subset")]
    NotInSubset(PeerId),
    #[error("mpc protocol panicked: {0}")]
    ProtocolPanic(String),
    #[error("mpc protocol failed: {0}")]
    Protocol(#[from] MpcError),
    #[error(transparent)]
    Keyshare(#[from] KeyshareError),
    #[error("invalid start parameters: {0}")]
    Validation(String),
    #[error("session cannot proceed: {0}")]
    NotReady(String),
    #[error("failed to encode or decode protocol data: {0}")]
    Serialization(String),
    #[error("process was stopped")]
    Stopped,
    #[error("result receiver was dropped")]
    ResultSinkClosed,
}

impl TssError {
    /// Peer to exclude from the next attempt, if the failure points at one.
    pub fn offending_peer(&self) -> Option<PeerId> {
        match self {
            TssError::Communication(err) => Some(err.peer),
            TssError::Protocol(err) => err.culprit,
            _ => None,
        }
    }
}

impl From<serde_json::Error> for TssError {
    fn from(err: serde_json::Error) -> Self {
        TssError::Serialization(err.to_string())
    }
}
