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

//! Node parameters, read from a TOML file and overridden from the command line.

use crate::config::Config;
use anyhow::{Context, Result};
use clap::Args;
use directories::ProjectDirs;
use serde::Deserialize;
use std::{
    fs,
    path::{Path, PathBuf},
};

mod elector;
mod keyshare;
mod network;
mod topology;
mod tss;

pub use elector::{ElectorKind, ElectorParams};
pub use keyshare::KeyshareParams;
pub use network::{NetworkParams, Transport};
pub use topology::TopologyParams;
pub use tss::TssParams;

/// Combines two sets of parameters, preferring the values of `self`.
pub trait MergeParams: Sized {
    fn merge(self, with: Self) -> Self;
}

/// Every parameter the node accepts.
#[derive(Clone, Debug, Default, Deserialize, Args)]
#[serde(deny_unknown_fields)]
pub struct Params {
    /// Base directory for node files.
    #[arg(long)]
    pub base_path: Option<PathBuf>,

    #[clap(flatten)]
    #[serde(default)]
    pub network: NetworkParams,

    #[clap(flatten)]
    #[serde(default)]
    pub topology: TopologyParams,

    #[clap(flatten)]
    #[serde(default)]
    pub keyshare: KeyshareParams,

    #[clap(flatten)]
    #[serde(default)]
    pub tss: TssParams,

    #[clap(flatten)]
    #[serde(default)]
    pub elector: ElectorParams,
}

impl Params {
    pub fn from_file(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let content = fs::read_to_string(path)
            .with_context(|| format!("failed to read params file {}", path.display()))?;
        toml::from_str(&content)
            .with_context(|| format!("failed to parse params file {}", path.display()))
    }

    pub fn into_config(self) -> Result<Config> {
        let base_path = match self.base_path {
            Some(base_path) => base_path,
            None => default_base()?,
        };

        Ok(Config {
            network: self.network.into_config(&base_path)?,
            topology: self.topology.into_config(&base_path)?,
            keyshare: self.keyshare.into_config(&base_path),
            coordinator: self.tss.coordinator_config(),
            signing_watchdog: self.tss.signing_watchdog(),
            elector: self.elector.into_config(),
            base_path,
        })
    }
}

impl MergeParams for Params {
    fn merge(self, with: Self) -> Self {
        Self {
            base_path: self.base_path.or(with.base_path),
            network: self.network.merge(with.network),
            topology: self.topology.merge(with.topology),
            keyshare: self.keyshare.merge(with.keyshare),
            tss: self.tss.merge(with.tss),
            elector: self.elector.merge(with.elector),
        }
    }
}

fn default_base() -> Result<PathBuf> {
    ProjectDirs::from("com", "Gear", "relayer")
        .map(|dirs| dirs.data_dir().to_path_buf())
        .context("couldn't find home directory, set `base_path`")
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::ElectorConfig;
    use relayer_common::Multiaddr;
    use relayer_network::TransportType;
    use std::time::Duration;

    const FILE: &str = r#"
        base_path = "/var/lib/relayer"

        [network]
        listen_addresses = ["/memory/9100"]
        transport = "memory"

        [topology]
        path = "/etc/relayer/topology.enc"
        encryption_key = "0101010101010101010101010101010101010101010101010101010101010101"

        [tss]
        timeout_secs = 600
        retry_count = 5

        [elector]
        kind = "bully"
        election_wait_ms = 500
    "#;

    #[test]
    fn file_params_map_into_config() {
        let params: Params = toml::from_str(FILE).unwrap();
        let config = params.into_config().unwrap();

        assert_eq!(config.base_path, PathBuf::from("/var/lib/relayer"));
        assert_eq!(config.network.host.transport_type, TransportType::Memory);
        assert_eq!(
            config.network.host.listen_addresses,
            vec!["/memory/9100".parse::<Multiaddr>().unwrap()]
        );
        assert_eq!(
            config.network.key_path,
            PathBuf::from("/var/lib/relayer/net/secret_key")
        );
        assert_eq!(config.topology.encryption_key, Some([1; 32]));
        assert_eq!(
            config.topology.store_path,
            PathBuf::from("/var/lib/relayer/topology.json")
        );
        assert_eq!(config.coordinator.tss_timeout, Duration::from_secs(600));
        assert_eq!(config.coordinator.retry_count, 5);
        assert_eq!(config.coordinator.initiate_period, Duration::from_secs(15));
        assert_eq!(config.signing_watchdog, Duration::from_secs(180));

        let ElectorConfig::Bully(bully) = config.elector else {
            panic!("bully elector expected");
        };
        assert_eq!(bully.election_wait, Duration::from_millis(500));
        assert_eq!(bully.bully_wait, Duration::from_secs(10));
        assert_eq!(bully.ping_interval, None);
    }

    #[test]
    fn command_line_wins_over_file() {
        let file: Params = toml::from_str(FILE).unwrap();
        let cli = Params {
            network: NetworkParams {
                port: Some(9200),
                ..Default::default()
            },
            tss: TssParams {
                retry_count: Some(1),
                ..Default::default()
            },
            ..Default::default()
        };

        let merged = cli.merge(file);
        assert_eq!(merged.network.port, Some(9200));
        assert_eq!(merged.network.listen_addresses.map(|a| a.len()), Some(1));
        assert_eq!(merged.network.transport, Some(Transport::Memory));
        assert_eq!(merged.tss.retry_count, Some(1));
        assert_eq!(merged.tss.timeout_secs, Some(600));
        assert_eq!(merged.base_path, Some(PathBuf::from("/var/lib/relayer")));
    }

    #[test]
    fn unknown_fields_are_rejected() {
        assert!(toml::from_str::<Params>("[network]\nprot = 1\n").is_err());
        assert!(toml::from_str::<Params>("colour = \"red\"\n").is_err());
    }

    #[test]
    fn bad_encryption_key_is_reported() {
        let params: Params = toml::from_str(
            r#"
            base_path = "/tmp/relayer"
            [topology]
            path = "topology.enc"
            encryption_key = "abcd"
            "#,
        )
        .unwrap();
        let err = params.into_config().unwrap_err();
        assert!(format!("{err:#}").contains("encryption_key"));
    }
}
