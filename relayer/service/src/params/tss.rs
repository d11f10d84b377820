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
use clap::Args;
use relayer_coordinator::CoordinatorConfig;
use relayer_tss::process::DEFAULT_SIGNING_WATCHDOG;
use serde::Deserialize;
use std::time::Duration;

/// Session timings, all in seconds.
#[derive(Clone, Debug, Default, Deserialize, Args)]
#[serde(deny_unknown_fields)]
pub struct TssParams {
    /// Upper bound for a whole session including retries.
    #[arg(long = "tss-timeout-secs", value_name = "SECS")]
    pub timeout_secs: Option<u64>,

    /// Attempts after the first one.
    #[arg(long)]
    pub retry_count: Option<usize>,

    #[arg(long, value_name = "SECS")]
    pub initiate_period_secs: Option<u64>,

    /// How long a follower waits for the leader before failing over.
    #[arg(long, value_name = "SECS")]
    pub coordinator_grace_secs: Option<u64>,

    /// How long a signer outside the chosen subset stays available for a retry.
    #[arg(long, value_name = "SECS")]
    pub subset_standby_secs: Option<u64>,

    /// Signing aborts when no round progress is made for this long.
    #[arg(long, value_name = "SECS")]
    pub signing_watchdog_secs: Option<u64>,
}

impl TssParams {
    pub fn coordinator_config(&self) -> CoordinatorConfig {
        let mut config = CoordinatorConfig::default();
        if let Some(secs) = self.timeout_secs {
            config = config.with_tss_timeout(Duration::from_secs(secs));
        }
        if let Some(retry_count) = self.retry_count {
            config = config.with_retry_count(retry_count);
        }
        if let Some(secs) = self.initiate_period_secs {
            config = config.with_initiate_period(Duration::from_secs(secs));
        }
        if let Some(secs) = self.coordinator_grace_secs {
            config = config.with_coordinator_grace(Duration::from_secs(secs));
        }
        if let Some(secs) = self.subset_standby_secs {
            config = config.with_subset_standby(Duration::from_secs(secs));
        }
        config
    }

    pub fn signing_watchdog(&self) -> Duration {
        self.signing_watchdog_secs
            .map(Duration::from_secs)
            .unwrap_or(DEFAULT_SIGNING_WATCHDOG)
    }
}

impl MergeParams for TssParams {
    fn merge(self, with: Self) -> Self {
        Self {
            timeout_secs: self.timeout_secs.or(with.timeout_secs),
            retry_count: self.retry_count.or(with.retry_count),
            initiate_period_secs: self.initiate_period_secs.or(with.initiate_period_secs),
            coordinator_grace_secs: self.coordinator_grace_secs.or(with.coordinator_grace_secs),
            subset_standby_secs: self.subset_standby_secs.or(with.subset_standby_secs),
            signing_watchdog_secs: self.signing_watchdog_secs.or(with.signing_watchdog_secs),
        }
    }
}
