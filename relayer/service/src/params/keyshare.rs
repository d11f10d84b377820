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
use crate::config::KeyshareConfig;
use clap::Args;
use serde::Deserialize;
use std::path::{Path, PathBuf};

#[derive(Clone, Debug, Default, Deserialize, Args)]
#[serde(deny_unknown_fields)]
pub struct KeyshareParams {
    /// ECDSA keyshare file, `<base>/ecdsa.keyshare` by default.
    #[arg(long = "ecdsa-keyshare", value_name = "PATH")]
    pub ecdsa_path: Option<PathBuf>,

    /// FROST keyshare file, `<base>/frost.keyshare` by default.
    #[arg(long = "frost-keyshare", value_name = "PATH")]
    pub frost_path: Option<PathBuf>,
}

impl KeyshareParams {
    pub fn into_config(self, base_path: &Path) -> KeyshareConfig {
        KeyshareConfig {
            ecdsa_path: self
                .ecdsa_path
                .unwrap_or_else(|| base_path.join("ecdsa.keyshare")),
            frost_path: self
                .frost_path
                .unwrap_or_else(|| base_path.join("frost.keyshare")),
        }
    }
}

impl MergeParams for KeyshareParams {
    fn merge(self, with: Self) -> Self {
        Self {
            ecdsa_path: self.ecdsa_path.or(with.ecdsa_path),
            frost_path: self.frost_path.or(with.frost_path),
        }
    }
}
