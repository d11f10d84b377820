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

use anyhow::{Context, Result};
use clap::Parser;
use relayer_service::{MergeParams, Node, Params};
use std::path::PathBuf;
use tracing_subscriber::EnvFilter;

#[derive(Debug, Parser)]
#[command(version, about = "Threshold-signature bridge relayer")]
struct Cli {
    /// TOML file with node parameters; command-line values take precedence.
    #[arg(long, short)]
    config: Option<PathBuf>,

    /// Log filter directives, `RUST_LOG` syntax.
    #[arg(long)]
    log: Option<String>,

    #[clap(flatten)]
    params: Params,
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    let filter = match cli.log {
        Some(directives) => EnvFilter::try_new(directives).context("invalid `--log` filter")?,
        None => EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
    };
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .try_init()
        .map_err(|err| anyhow::anyhow!(err))
        .context("failed to initialize logger")?;

    let params = match cli.config {
        Some(path) => cli.params.merge(Params::from_file(path)?),
        None => cli.params,
    };
    let config = params.into_config().context("invalid configuration")?;
    config.log_info();

    let node = Node::new(&config)
        .await
        .context("failed to start relayer node")?;

    tokio::signal::ctrl_c()
        .await
        .context("failed to listen for Ctrl-C")?;
    tracing::info!("Received SIGINT, shutting down");
    node.shutdown().await;

    Ok(())
}
