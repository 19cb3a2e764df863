// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 naskel.com

//! fieldmesh gateway daemon.
//!
//! Boots the control plane, registers the configured plugin modules,
//! restores persisted nodes/groups/tags/subscriptions, starts the
//! autostart set and runs until SIGINT/SIGTERM.
//!
//! # Usage
//!
//! ```bash
//! # Run with a configuration directory
//! fieldmeshd --config /etc/fieldmesh
//!
//! # Foreground with debug logging
//! fieldmeshd --config ./demo --log debug
//! ```

use clap::Parser;
use crossbeam::channel::bounded;
use fieldmesh::config::{BootConfig, BOOT_FILE};
use fieldmesh::{JsonStore, Manager};
use std::path::PathBuf;
use std::process::ExitCode;
use std::sync::Arc;
use tracing_subscriber::EnvFilter;

/// Industrial IoT gateway daemon
#[derive(Parser, Debug)]
#[command(name = "fieldmeshd")]
#[command(about = "fieldmesh - industrial IoT gateway runtime fabric")]
#[command(version)]
struct Args {
    /// Detach-friendly mode: no interactive console output. Process
    /// supervision (forking, pidfiles) is left to the service manager.
    #[arg(long)]
    daemon: bool,

    /// Configuration directory (boot document and state store)
    #[arg(long, default_value = ".")]
    config: PathBuf,

    /// Log level (trace, debug, info, warn, error)
    #[arg(long, default_value = "info")]
    log: String,
}

fn main() -> ExitCode {
    let args = Args::parse();

    let filter = EnvFilter::try_new(&args.log).unwrap_or_else(|_| EnvFilter::new("info"));
    let builder = tracing_subscriber::fmt().with_env_filter(filter);
    if args.daemon {
        builder.with_ansi(false).init();
    } else {
        builder.init();
    }

    match run(&args) {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            tracing::error!("initialization failed: {}", e);
            ExitCode::FAILURE
        }
    }
}

fn run(args: &Args) -> fieldmesh::Result<()> {
    let boot = BootConfig::load(args.config.join(BOOT_FILE))?;
    let store = Arc::new(JsonStore::open(args.config.join("state.json"))?);

    let manager = Manager::new(store)?;
    manager.register_builtin_plugins(&boot.plugins);

    if let Err(e) = manager.load() {
        tracing::warn!("state restore incomplete: {}", e);
    }
    manager.autostart(&boot.autostart);

    let (stop_tx, stop_rx) = bounded::<()>(1);
    ctrlc::set_handler(move || {
        let _ = stop_tx.try_send(());
    })
    .map_err(|e| {
        tracing::error!("signal handler installation failed: {}", e);
        fieldmesh::ErrorCode::EInternal
    })?;

    tracing::info!(
        "fieldmesh up: {} nodes, config dir {}",
        manager.nodes(None).len(),
        args.config.display()
    );

    let _ = stop_rx.recv();
    tracing::info!("shutdown requested");
    manager.shutdown();
    Ok(())
}
