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
use crate::config::ElectorConfig;
use clap::{Args, ValueEnum};
use relayer_coordinator::BullyConfig;
use serde::Deserialize;
use std::time::Duration;

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Deserialize, ValueEnum)]
#[serde(rename_all = "lowercase")]
pub enum ElectorKind {
    /// Highest peer by session hash, no messages.
    #[default]
    Static,
    Bully,
}

/// Leader election; sub-second timings are given in milliseconds.
#[derive(Clone, Debug, Default, Deserialize, Args)]
#[serde(deny_unknown_fields)]
pub struct ElectorParams {
    #[arg(long = "elector", value_enum)]
    pub kind: Option<ElectorKind>,

    #[arg(long, value_name = "MS")]
    pub election_wait_ms: Option<u64>,

    #[arg(long, value_name = "MS")]
    pub bully_wait_ms: Option<u64>,

    /// Enables leader liveness pings.
    #[arg(long, value_name = "MS")]
    pub ping_interval_ms: Option<u64>,
}

impl ElectorParams {
    pub fn into_config(self) -> ElectorConfig {
        match self.kind.unwrap_or_default() {
            ElectorKind::Static => ElectorConfig::Static,
            ElectorKind::Bully => {
                let default = BullyConfig::default();
                ElectorConfig::Bully(BullyConfig {
                    election_wait: self
                        .election_wait_ms
                        .map(Duration::from_millis)
                        .unwrap_or(default.election_wait),
                    bully_wait: self
                        .bully_wait_ms
                        .map(Duration::from_millis)
                        .unwrap_or(default.bully_wait),
                    ping_interval: self
                        .ping_interval_ms
                        .map(Duration::from_millis)
                        .or(default.ping_interval),
                })
            }
        }
    }
}

impl MergeParams for ElectorParams {
    fn merge(self, with: Self) -> Self {
        Self {
            kind: self.kind.or(with.kind),
            election_wait_ms: self.election_wait_ms.or(with.election_wait_ms),
            bully_wait_ms: self.bully_wait_ms.or(with.bully_wait_ms),
            ping_interval_ms: self.ping_interval_ms.or(with.ping_interval_ms),
        }
    }
}
