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

//! Session-oriented peer-to-peer layer of the relayer.
//!
//! A single [`Host`] carries every envelope; [`Communication`] adds session and
//! kind typed routing on top of it, and [`health`] probes reachability.

pub mod codec;
pub mod communication;
pub mod error;
pub mod gate;
pub mod health;
pub mod host;
pub mod stream;
pub mod subscription;
pub mod topology;

#[cfg(any(test, feature = "mock"))]
pub mod mock;

pub use communication::{Communication, Libp2pCommunication, Subscription};
pub use error::{CommunicationError, TransportError};
pub use host::{Host, HostConfig, HostHandle, TransportType};
pub use subscription::SubscriptionRegistry;
pub use topology::{SharedTopology, TopologyProvider, TopologyStore};

#[cfg(test)]
pub(crate) mod tests {
    use tracing_subscriber::EnvFilter;

    pub fn init_logger() {
        let _ = tracing_subscriber::fmt()
            .with_env_filter(EnvFilter::from_default_env())
            .with_test_writer()
            .try_init();
    }
}
