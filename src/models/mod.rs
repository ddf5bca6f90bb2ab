// Netpilot - Shared Models
// Copyright (C) 2026 Christos A. Daggas
// SPDX-License-Identifier: MIT

//! # Netpilot Models
//!
//! Plain data types shared by the engine, the daemon and drivers:
//!
//! - **Technology**: link technology identifiers and technology lists
//! - **ConnectState**: the service connection state enum
//! - **ConnectFailure**: driver-reported failure taxonomy
//! - **ManagerConfig**: TOML configuration
//! - **Error**: administrative error type

pub mod config;
pub mod error;
pub mod failure;
pub mod state;
pub mod technology;

pub use config::{AutoConnectConfig, ManagerConfig};
pub use error::{Error, Result};
pub use failure::ConnectFailure;
pub use state::ConnectState;
pub use technology::Technology;

/// Configuration / data directory name (under XDG dirs).
pub const CONFIG_DIR_NAME: &str = "netpilot";

/// Name of the machine-wide default profile.
pub const DEFAULT_PROFILE_NAME: &str = "default";
