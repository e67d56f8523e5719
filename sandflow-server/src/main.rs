// Copyright 2025 Sandflow (https://github.com/sandflow)
//
// This program is free software: you can redistribute it and/or modify
// it under the terms of the GNU Affero General Public License as published by
// the Free Software Foundation, either version 3 of the License, or
// (at your option) any later version.
//
// This program is distributed in the hope that it will be useful,
// but WITHOUT ANY WARRANTY; without even the implied warranty of
// MERCHANTABILITY or FITNESS FOR A PARTICULAR PURPOSE. See the
// GNU Affero General Public License for more details.
//
// You should have received a copy of the GNU Affero General Public License
// along with this program. If not, see <https://www.gnu.org/licenses/>.

use clap::Parser;
use sandflow_core::{SandflowConfig, SandflowError};
use sandflow_server::run_server;
use std::path::PathBuf;
use std::process::ExitCode;
use tokio_util::sync::CancellationToken;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

#[derive(Parser, Debug)]
#[command(author, version, about = "Sandflow analytics collector", long_about = None)]
struct Args {
    /// Path to configuration file (TOML)
    #[arg(short, long)]
    config: Option<PathBuf>,

    /// Ingest listen port (overrides config file)
    #[arg(long, env = "SANDFLOW_INGEST_PORT")]
    ingest_port: Option<u16>,

    /// Control listen port (overrides config file)
    #[arg(long, env = "SANDFLOW_CONTROL_PORT")]
    control_port: Option<u16>,

    /// Data directory for the wal backend (overrides config file)
    #[arg(long, env = "SANDFLOW_DATA_DIR")]
    data_dir: Option<PathBuf>,
}

/// Exit codes: 0 clean, 1 configuration, 2 store unavailable at startup,
/// 3 cache unavailable at startup.
fn exit_code(e: &SandflowError) -> u8 {
    match e {
        SandflowError::Config(_) => 1,
        SandflowError::StoreUnavailable(_) => 2,
        SandflowError::CacheUnavailable(_) => 3,
        _ => 1,
    }
}

#[tokio::main]
async fn main() -> ExitCode {
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "sandflow=info,tower_http=info".into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    let args = Args::parse();

    let mut config = match SandflowConfig::load(args.config.as_deref()) {
        Ok(config) => config,
        Err(e) => {
            eprintln!("configuration error: {}", e);
            return ExitCode::from(1);
        }
    };
    if let Some(port) = args.ingest_port {
        config.listen.ingest_port = port;
    }
    if let Some(port) = args.control_port {
        config.listen.control_port = port;
    }
    if let Some(dir) = args.data_dir {
        config.store.data_dir = dir;
    }

    match run_server(config, CancellationToken::new()).await {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            tracing::error!(error = %e, "fatal");
            ExitCode::from(exit_code(&e))
        }
    }
}
