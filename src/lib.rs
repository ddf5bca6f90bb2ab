// Netpilot - Library Root
// Copyright (C) 2026 Christos A. Daggas
// SPDX-License-Identifier: MIT

//! # Netpilot
//!
//! The decision engine of a host-resident connection manager. It tracks
//! every candidate network attachment point as a service, ranks them,
//! binds them to configuration profiles and drives auto-connect with
//! per-service backoff. Link drivers plug in through
//! [`services::Driver`].

pub mod models;
pub mod scheduler;
pub mod services;
pub mod storage;

#[cfg(test)]
mod testing;

pub use models::{ConnectFailure, ConnectState, Error, ManagerConfig, Result, Technology};
pub use services::{Driver, Manager, ServiceId, ServiceSpec};

/// Crate version.
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
