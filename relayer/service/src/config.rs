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

//! Runtime configuration of a node, produced from merged [`Params`](crate::params::Params).

use relayer_coordinator::{BullyConfig, CoordinatorConfig};
use relayer_network::HostConfig;
use std::{path::PathBuf, time::Duration};

#[derive(Debug, Clone)]
pub struct Config {
    pub base_path: PathBuf,
    pub network: NetworkConfig,
    pub topology: TopologyConfig,
    pub keyshare: KeyshareConfig,
    pub coordinator: CoordinatorConfig,
    pub signing_watchdog: Duration,
    pub elector: ElectorConfig,
}

#[derive(Debug, Clone)]
pub struct NetworkConfig {
    pub host: HostConfig,
    pub key_path: PathBuf,
}

#[derive(Debug, Clone)]
pub struct TopologyConfig {
    /// Encrypted roster; without it the persisted snapshot is used.
    pub path: Option<PathBuf>,
    pub encryption_key: Option<[u8; 32]>,
    pub hash: Option<[u8; 32]>,
    pub store_path: PathBuf,
}

#[derive(Debug, Clone)]
pub struct KeyshareConfig {
    pub ecdsa_path: PathBuf,
    pub frost_path: PathBuf,
}

#[derive(Debug, Clone)]
pub enum ElectorConfig {
    Static,
    Bully(BullyConfig),
}

impl Config {
    pub fn log_info(&self) {
        tracing::info!("💾 Base path: {}", self.base_path.display());
        tracing::info!("🔑 Network key: {}", self.network.key_path.display());
        tracing::info!(
            "🛜 Listen addresses: {:?} ({:?})",
            self.network.host.listen_addresses,
            self.network.host.transport_type
        );
        match &self.topology.path {
            Some(path) => tracing::info!("📜 Topology: {}", path.display()),
            None => tracing::info!(
                "📜 Topology: {} (persisted)",
                self.topology.store_path.display()
            ),
        }
        tracing::info!(
            "🗝  Keyshares: {}, {}",
            self.keyshare.ecdsa_path.display(),
            self.keyshare.frost_path.display()
        );
        tracing::info!(
            "⏱  Session timeout {:?}, {} retries, elector {:?}",
            self.coordinator.tss_timeout,
            self.coordinator.retry_count,
            self.elector
        );
    }
}
