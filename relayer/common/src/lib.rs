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

//! Relayer common types: peer ordering, wire envelope and topology roster.

pub mod message;
pub mod peer;
pub mod topology;

#[cfg(feature = "mock")]
pub mod mock;

pub use libp2p::{Multiaddr, PeerId, multiaddr::Protocol};
pub use message::{MessageKind, SubscriptionId, WrappedMessage};
pub use topology::{Topology, TopologyError};

/// Opaque session identifier, hashed as raw bytes.
pub type SessionId = String;

/// Session used by reachability probes.
pub const HEALTH_SESSION: &str = "health-session";

/// Serde helper encoding byte vectors as standard base64 strings.
pub mod base64_bytes {
    use base64::{Engine, engine::general_purpose::STANDARD};
    use serde::{Deserialize, Deserializer, Serializer, de::Error};

    pub fn serialize<S: Serializer>(bytes: &[u8], serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&STANDARD.encode(bytes))
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Vec<u8>, D::Error> {
        let encoded = String::deserialize(deserializer)?;
        STANDARD.decode(encoded).map_err(D::Error::custom)
    }
}
