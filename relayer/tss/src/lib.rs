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

//! Threshold signature processes of the relayer.
//!
//! [`process`] holds the keygen, signing and resharing processes the
//! coordinator drives. They talk to MPC libraries through the [`mpc`] seam;
//! [`frost`] is the bundled FROST-Taproot backend.

pub mod error;
pub mod frost;
pub mod keyshare;
pub mod mpc;
pub mod party;
pub mod process;

pub use error::TssError;
pub use frost::FrostBackend;
pub use keyshare::{EcdsaKeyshare, FrostKeyshare, Keyshare, KeyshareError, KeyshareStore};
pub use mpc::{MpcBackend, MpcError};
pub use process::{KeygenProcess, ResharingProcess, ResultSink, SigningProcess, TssProcess};

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
