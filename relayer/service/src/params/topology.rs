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
use crate::config::TopologyConfig;
use anyhow::{Context, Result, ensure};
use clap::Args;
use relayer_network::TopologyStore;
use serde::Deserialize;
use std::path::{Path, PathBuf};

/// Where the committee roster comes from.
#[derive(Clone, Debug, Default, Deserialize, Args)]
#[serde(deny_unknown_fields)]
pub struct TopologyParams {
    /// Encrypted roster distributed to the committee.
    #[arg(long = "topology-path", value_name = "PATH")]
    pub path: Option<PathBuf>,

    /// Hex encoded 32-byte key of the encrypted roster.
    #[arg(long = "topology-key", value_name = "HEX")]
    pub encryption_key: Option<String>,

    /// Hex encoded keccak256 of the roster plaintext.
    #[arg(long = "topology-hash", value_name = "HEX")]
    pub hash: Option<String>,

    /// Decoded roster snapshot, `<base>/topology.json` by default.
    #[arg(long = "topology-store", value_name = "PATH")]
    pub store_path: Option<PathBuf>,
}

impl TopologyParams {
    pub fn into_config(self, base_path: &Path) -> Result<TopologyConfig> {
        let encryption_key = self
            .encryption_key
            .as_deref()
            .map(parse_bytes32)
            .transpose()
            .context("invalid `topology.encryption_key`")?;
        let hash = self
            .hash
            .as_deref()
            .map(parse_bytes32)
            .transpose()
            .context("invalid `topology.hash`")?;

        ensure!(
            self.path.is_none() || encryption_key.is_some(),
            "`topology.path` needs `topology.encryption_key`"
        );

        Ok(TopologyConfig {
            path: self.path,
            encryption_key,
            hash,
            store_path: self
                .store_path
                .unwrap_or_else(|| base_path.join(TopologyStore::FILE_NAME)),
        })
    }
}

impl MergeParams for TopologyParams {
    fn merge(self, with: Self) -> Self {
        Self {
            path: self.path.or(with.path),
            encryption_key: self.encryption_key.or(with.encryption_key),
            hash: self.hash.or(with.hash),
            store_path: self.store_path.or(with.store_path),
        }
    }
}

fn parse_bytes32(value: &str) -> Result<[u8; 32]> {
    let bytes = hex::decode(value.trim_start_matches("0x"))?;
    bytes
        .try_into()
        .map_err(|bytes: Vec<u8>| anyhow::anyhow!("expected 32 bytes, got {}", bytes.len()))
}
