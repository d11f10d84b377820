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

//! Leader election and session execution.
//!
//! [`Coordinator::execute`] elects a leader for each process, runs the
//! `Initiate`/`Ready`/`Start` handshake and retries retryable failures without
//! the peer that caused them.

pub mod elector;
pub mod error;
pub mod executor;

pub use elector::{BullyConfig, BullyElector, Elector, ElectorError, StaticElector};
pub use error::{SessionError, SessionErrorKind};
pub use executor::{Coordinator, CoordinatorConfig};

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
