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

use crate::elector::ElectorError;
use relayer_common::PeerId;
use relayer_tss::TssError;
use thiserror::Error;

/// Discriminant of [`SessionError`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum SessionErrorKind {
    Communication,
    Coordinator,
    Subset,
    Timeout,
    Cancelled,
    ShuttingDown,
    Election,
    Keyshare,
    Validation,
    NotReady,
    Protocol,
}

/// Final outcome of a failed session, as seen by the driver.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum SessionError {
    #[error("communication with {peer} failed: {reason}")]
    Communication { peer: PeerId, reason: String },
    #[error("coordinator {0} stopped responding")]
    Coordinator(PeerId),
    #[error("local peer is not part of the signing subset")]
    NotInSubset,
    #[error("session timed out")]
    Timeout,
    #[error("session was cancelled")]
    Cancelled,
    #[error("coordinator is shutting down")]
    ShuttingDown,
    #[error(transparent)]
    Election(#[from] ElectorError),
    #[error("keyshare unavailable: {0}")]
    Keyshare(String),
    #[error("invalid session parameters: {0}")]
    Validation(String),
    #[error("session cannot proceed: {0}")]
    NotReady(String),
    #[error("mpc protocol failed: {message}")]
    Protocol {
        culprit: Option<PeerId>,
        message: String,
    },
}

impl SessionError {
    pub fn kind(&self) -> SessionErrorKind {
        match self {
            SessionError::Communication { .. } => SessionErrorKind::Communication,
            SessionError::Coordinator(_) => SessionErrorKind::Coordinator,
            SessionError::NotInSubset => SessionErrorKind::Subset,
            SessionError::Timeout => SessionErrorKind::Timeout,
            SessionError::Cancelled => SessionErrorKind::Cancelled,
            SessionError::ShuttingDown => SessionErrorKind::ShuttingDown,
            SessionError::Election(_) => SessionErrorKind::Election,
            SessionError::Keyshare(_) => SessionErrorKind::Keyshare,
            SessionError::Validation(_) => SessionErrorKind::Validation,
            SessionError::NotReady(_) => SessionErrorKind::NotReady,
            SessionError::Protocol { .. } => SessionErrorKind::Protocol,
        }
    }

    pub fn offending_peers(&self) -> Vec<PeerId> {
        match self {
            SessionError::Communication { peer, .. } | SessionError::Coordinator(peer) => {
                vec![*peer]
            }
            SessionError::Protocol {
                culprit: Some(peer),
                ..
            } => vec![*peer],
            _ => vec![],
        }
    }

    /// Peer to exclude from the participants of the next attempt.
    pub(crate) fn excludable_peer(&self) -> Option<PeerId> {
        match self {
            SessionError::Communication { peer, .. } => Some(*peer),
            SessionError::Protocol { culprit, .. } => *culprit,
            _ => None,
        }
    }
}

impl From<TssError> for SessionError {
    fn from(err: TssError) -> Self {
        match err {
            TssError::Communication(err) => SessionError::Communication {
                peer: err.peer,
                reason: err.cause.to_string(),
            },
            TssError::NotInSubset(_) => SessionError::NotInSubset,
            TssError::Protocol(err) => SessionError::Protocol {
                culprit: err.culprit,
                message: err.message,
            },
            TssError::ProtocolPanic(message) => SessionError::Protocol {
                culprit: None,
                message: format!("panic: {message}"),
            },
            TssError::Keyshare(err) => SessionError::Keyshare(err.to_string()),
            TssError::Validation(reason) => SessionError::Validation(reason),
            TssError::NotReady(reason) => SessionError::NotReady(reason),
            TssError::Serialization(reason) => SessionError::Protocol {
                culprit: None,
                message: reason,
            },
            TssError::Stopped => SessionError::Cancelled,
            TssError::ResultSinkClosed => SessionError::Protocol {
                culprit: None,
                message: "result receiver was dropped".into(),
            },
        }
    }
}
