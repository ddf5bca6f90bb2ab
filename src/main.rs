// Netpilot - Daemon Entry Point
// Copyright (C) 2026 Christos A. Daggas
// SPDX-License-Identifier: MIT

//! # netpilotd
//!
//! Runs the connection manager until interrupted.

use std::env;
use std::path::PathBuf;
use std::process::ExitCode;

use netpilot::{Manager, ManagerConfig, VERSION};

/// Human-readable daemon name.
const APP_NAME: &str = "netpilotd";

fn print_version() {
    println!("{} {}", APP_NAME, VERSION);
    println!("Copyright (C) 2026 Christos A. Daggas");
    println!("License: MIT");
}

fn print_help() {
    println!("Usage: {} [OPTIONS]", env::args().next().unwrap_or_else(|| APP_NAME.to_string()));
    println!();
    println!("Host connection manager daemon.");
    println!();
    println!("Options:");
    println!("  -h, --help           Show this help message and exit");
    println!("  -v, --version        Show version information and exit");
    println!("  -d, --debug          Enable debug logging");
    println!("  -c, --config <PATH>  Read configuration from PATH");
    println!("  -w, --write-config <PATH>");
    println!("                       Write the effective configuration to PATH and exit");
    println!();
    println!("Environment variables:");
    println!("  RUST_LOG             Set log level (trace, debug, info, warn, error)");
}

/// Parsed command line.
struct Options {
    debug: bool,
    config_path: Option<PathBuf>,
    write_config: Option<PathBuf>,
}

/// `Ok(None)` means the process should exit successfully.
fn parse_args() -> Result<Option<Options>, String> {
    let mut options = Options {
        debug: false,
        config_path: None,
        write_config: None,
    };
    let mut args = env::args().skip(1);
    while let Some(arg) = args.next() {
        match arg.as_str() {
            "-h" | "--help" => {
                print_help();
                return Ok(None);
            }
            "-v" | "--version" => {
                print_version();
                return Ok(None);
            }
            "-d" | "--debug" => options.debug = true,
            "-c" | "--config" => {
                let path = args
                    .next()
                    .ok_or_else(|| format!("Option {} requires a path", arg))?;
                options.config_path = Some(PathBuf::from(path));
            }
            "-w" | "--write-config" => {
                let path = args
                    .next()
                    .ok_or_else(|| format!("Option {} requires a path", arg))?;
                options.write_config = Some(PathBuf::from(path));
            }
            _ => return Err(format!("Unknown option: {}", arg)),
        }
    }
    Ok(Some(options))
}

fn load_config(path: Option<PathBuf>) -> Result<ManagerConfig, netpilot::Error> {
    let Some(path) = path.or_else(ManagerConfig::default_path) else {
        return Ok(ManagerConfig::default());
    };
    if !path.exists() {
        return Ok(ManagerConfig::default());
    }
    ManagerConfig::load_from_file(&path)
}

fn main() -> ExitCode {
    let options = match parse_args() {
        Ok(Some(options)) => options,
        Ok(None) => return ExitCode::SUCCESS,
        Err(message) => {
            eprintln!("{}", message);
            eprintln!("Try '--help' for more information.");
            return ExitCode::FAILURE;
        }
    };

    let config = match load_config(options.config_path) {
        Ok(config) => config,
        Err(e) => {
            eprintln!("Failed to load configuration: {}", e);
            return ExitCode::FAILURE;
        }
    };

    if let Some(path) = options.write_config {
        return match config.save_to_file(&path) {
            Ok(()) => {
                println!("Wrote configuration to {}", path.display());
                ExitCode::SUCCESS
            }
            Err(e) => {
                eprintln!("Failed to write configuration: {}", e);
                ExitCode::FAILURE
            }
        };
    }

    let directive = if options.debug { "debug" } else { config.log_level.as_str() };
    let filter = tracing_subscriber::EnvFilter::from_default_env();
    let filter = match directive.parse() {
        Ok(directive) => filter.add_directive(directive),
        Err(e) => {
            eprintln!("Ignoring log level {:?}: {}", directive, e);
            filter
        }
    };
    tracing_subscriber::fmt().with_env_filter(filter).init();

    tracing::info!("Starting {} v{}", APP_NAME, VERSION);

    let runtime = match tokio::runtime::Builder::new_current_thread().enable_all().build() {
        Ok(runtime) => runtime,
        Err(e) => {
            tracing::error!("Failed to build runtime: {}", e);
            return ExitCode::FAILURE;
        }
    };

    runtime.block_on(async move {
        let mut manager = match Manager::new(config) {
            Ok(manager) => manager,
            Err(e) => {
                tracing::error!("Failed to create manager: {}", e);
                return ExitCode::FAILURE;
            }
        };
        if let Err(e) = manager.start() {
            tracing::error!("Failed to start manager: {}", e);
            return ExitCode::FAILURE;
        }

        manager
            .run(async {
                if let Err(e) = tokio::signal::ctrl_c().await {
                    tracing::warn!("Failed to listen for Ctrl-C: {}", e);
                    std::future::pending::<()>().await;
                }
            })
            .await;
        manager.shutdown().await;

        tracing::info!("{} exited", APP_NAME);
        ExitCode::SUCCESS
    })
}
