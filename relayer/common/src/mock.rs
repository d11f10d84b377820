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

use crate::{MessageKind, Multiaddr, PeerId, Protocol, Topology, WrappedMessage};
use rand::Rng;

pub trait Mock {
    type Args;

    fn mock(args: Self::Args) -> Self;
}

/// Random in-memory address, unique enough for a single test process.
pub fn memory_address() -> Multiaddr {
    Multiaddr::empty().with(Protocol::Memory(rand::thread_rng().r#gen()))
}

impl Mock for Topology {
    /// Peers to include and the threshold.
    type Args = (Vec<PeerId>, u16);

    fn mock((peers, threshold): Self::Args) -> Self {
        Topology::new(
            peers.into_iter().map(|peer| (peer, memory_address())),
            threshold,
        )
        .expect("mock topology must be valid")
    }
}

impl Mock for WrappedMessage {
    type Args = (MessageKind, &'static str);

    fn mock((kind, session_id): Self::Args) -> Self {
        let payload = (0..32).map(|_| rand::random::<u8>()).collect();
        WrappedMessage::new(kind, session_id, payload)
    }
}
