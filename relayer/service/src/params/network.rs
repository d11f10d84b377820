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

use super::MergeParams;
use crate::config::NetworkConfig;
use anyhow::{Result, ensure};
use clap::{Args, ValueEnum};
use relayer_common::Multiaddr;
use relayer_network::{HostConfig, TransportType, host::DEFAULT_LISTEN_PORT};
use serde::Deserialize;
use std::{
    path::{Path, PathBuf},
    time::Duration,
};

#[derive(Clone, Copy, Debug, PartialEq, Eq, Deserialize, ValueEnum)]
#[serde(rename_all = "lowercase")]
pub enum Transport {
    Tcp,
    Memory,
}

impl From<Transport> for TransportType {
    fn from(transport: Transport) -> Self {
        match transport {
            Transport::Tcp => TransportType::Tcp,
            Transport::Memory => TransportType::Memory,
        }
    }
}

/// Peer-to-peer host parameters.
#[derive(Clone, Debug, Default, Deserialize, Args)]
#[serde(deny_unknown_fields)]
pub struct NetworkParams {
    /// TCP port for peer traffic.
    #[arg(long, conflicts_with = "listen_addresses")]
    pub port: Option<u16>,

    /// Listen on these multiaddresses instead of `/ip4/0.0.0.0/tcp/<port>`.
    #[arg(long = "listen-addr", value_name = "LISTEN_ADDR", num_args = 1..)]
    pub listen_addresses: Option<Vec<Multiaddr>>,

    /// Protobuf-encoded secp256k1 identity, created on first start.
    #[arg(long = "network-key", value_name = "PATH")]
    pub key_path: Option<PathBuf>,

    #[arg(long, value_enum)]
    pub transport: Option<Transport>,

    /// Per-message delivery timeout.
    #[arg(long)]
    pub request_timeout_secs: Option<u64>,
}

impl NetworkParams {
    pub fn into_config(self, base_path: &Path) -> Result<NetworkConfig> {
        let transport = self.transport.unwrap_or(Transport::Tcp);
        let port = self.port.unwrap_or(DEFAULT_LISTEN_PORT);

        let mut host = match self.listen_addresses {
            Some(addresses) => {
                ensure!(!addresses.is_empty(), "`listen_addresses` must not be empty");
                HostConfig {
                    listen_addresses: addresses,
                    ..HostConfig::new_local(port)
                }
            }
            None => {
                ensure!(
                    transport == Transport::Tcp,
                    "memory transport needs explicit `listen_addresses`"
                );
                HostConfig::new_local(port)
            }
        };
        host.transport_type = transport.into();
        if let Some(secs) = self.request_timeout_secs {
            host = host.with_request_timeout(Duration::from_secs(secs));
        }

        Ok(NetworkConfig {
            host,
            key_path: self
                .key_path
                .unwrap_or_else(|| base_path.join("net").join("secret_key")),
        })
    }
}

impl MergeParams for NetworkParams {
    fn merge(self, with: Self) -> Self {
        Self {
            port: self.port.or(with.port),
            listen_addresses: self.listen_addresses.or(with.listen_addresses),
            key_path: self.key_path.or(with.key_path),
            transport: self.transport.or(with.transport),
            request_timeout_secs: self.request_timeout_secs.or(with.request_timeout_secs),
        }
    }
}
