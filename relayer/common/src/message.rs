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

use crate::{PeerId, SessionId, base64_bytes};
use serde::{Deserialize, Serialize};
use std::{
    fmt,
    str::FromStr,
    time::{SystemTime, UNIX_EPOCH},
};
use thiserror::Error;

/// Message kinds carried in [`WrappedMessage::message_type`].
///
/// Byte values are part of the wire format and must never change.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize,
    derive_more::Display,
)]
#[serde(try_from = "u8", into = "u8")]
#[repr(u8)]
pub enum MessageKind {
    TssKeyGen = 0,
    TssKeySign = 1,
    TssInitiate = 2,
    TssStart = 3,
    TssReady = 4,
    TssReshare = 5,
    CoordinatorElection = 6,
    CoordinatorAlive = 7,
    CoordinatorLeave = 8,
    CoordinatorSelect = 9,
    CoordinatorPing = 10,
    CoordinatorPingResponse = 11,
    TssFail = 12,
    Unknown = 13,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
#[error("unknown message kind {0}")]
pub struct InvalidMessageKind(pub u8);

impl MessageKind {
    pub const ALL: [MessageKind; 14] = [
        MessageKind::TssKeyGen,
        MessageKind::TssKeySign,
        MessageKind::TssInitiate,
        MessageKind::TssStart,
        MessageKind::TssReady,
        MessageKind::TssReshare,
        MessageKind::CoordinatorElection,
        MessageKind::CoordinatorAlive,
        MessageKind::CoordinatorLeave,
        MessageKind::CoordinatorSelect,
        MessageKind::CoordinatorPing,
        MessageKind::CoordinatorPingResponse,
        MessageKind::TssFail,
        MessageKind::Unknown,
    ];

    /// Kinds exchanged by the Bully elector.
    pub const ELECTION: [MessageKind; 6] = [
        MessageKind::CoordinatorElection,
        MessageKind::CoordinatorAlive,
        MessageKind::CoordinatorSelect,
        MessageKind::CoordinatorPing,
        MessageKind::CoordinatorPingResponse,
        MessageKind::CoordinatorLeave,
    ];
}

impl From<MessageKind> for u8 {
    fn from(kind: MessageKind) -> Self {
        kind as u8
    }
}

impl TryFrom<u8> for MessageKind {
    type Error = InvalidMessageKind;

    fn try_from(value: u8) -> Result<Self, Self::Error> {
        Self::ALL
            .get(value as usize)
            .copied()
            .ok_or(InvalidMessageKind(value))
    }
}

/// On-the-wire envelope of every peer-to-peer message.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct WrappedMessage {
    pub message_type: MessageKind,
    #[serde(rename = "message_id")]
    pub session_id: SessionId,
    #[serde(with = "base64_bytes")]
    pub payload: Vec<u8>,
    /// Authenticated sender, stamped by the receiving side.
    #[serde(skip)]
    pub from: Option<PeerId>,
}

impl WrappedMessage {
    pub fn new(message_type: MessageKind, session_id: impl Into<SessionId>, payload: Vec<u8>) -> Self {
        Self {
            message_type,
            session_id: session_id.into(),
            payload,
            from: None,
        }
    }

    pub fn to_json(&self) -> serde_json::Result<Vec<u8>> {
        serde_json::to_vec(self)
    }

    pub fn from_json(bytes: &[u8]) -> serde_json::Result<Self> {
        serde_json::from_slice(bytes)
    }
}

/// Handle returned by `subscribe`, formatted as `<session>-<kind>-<nonce>`.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct SubscriptionId {
    session_id: SessionId,
    kind: MessageKind,
    nonce: u32,
}

impl SubscriptionId {
    /// Creates an id whose nonce is the sub-second part of the current time.
    pub fn new(session_id: impl Into<SessionId>, kind: MessageKind) -> Self {
        let nonce = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .map(|elapsed| elapsed.subsec_nanos())
            .unwrap_or_default();
        Self::with_nonce(session_id, kind, nonce)
    }

    pub fn with_nonce(session_id: impl Into<SessionId>, kind: MessageKind, nonce: u32) -> Self {
        Self {
            session_id: session_id.into(),
            kind,
            nonce,
        }
    }

    pub fn session_id(&self) -> &str {
        &self.session_id
    }

    pub fn kind(&self) -> MessageKind {
        self.kind
    }

    pub fn nonce(&self) -> u32 {
        self.nonce
    }

    /// Same session and kind, next nonce.
    pub fn bump(&self) -> Self {
        Self::with_nonce(self.session_id.clone(), self.kind, self.nonce.wrapping_add(1))
    }
}

impl fmt::Display for SubscriptionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}-{}-{}", self.session_id, u8::from(self.kind), self.nonce)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("malformed subscription id `{0}`")]
pub struct InvalidSubscriptionId(pub String);

impl FromStr for SubscriptionId {
    type Err = InvalidSubscriptionId;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let invalid = || InvalidSubscriptionId(s.to_string());

        // session ids may contain dashes themselves
        let mut parts = s.rsplitn(3, '-');
        let nonce = parts.next().ok_or_else(invalid)?;
        let kind = parts.next().ok_or_else(invalid)?;
        let session_id = parts.next().ok_or_else(invalid)?;

        let nonce = nonce.parse().map_err(|_| invalid())?;
        let kind = kind
            .parse::<u8>()
            .ok()
            .and_then(|kind| MessageKind::try_from(kind).ok())
            .ok_or_else(invalid)?;

        Ok(Self::with_nonce(session_id, kind, nonce))
    }
}
