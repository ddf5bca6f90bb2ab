// Netpilot - Connection Engine
// Copyright (C) 2026 Christos A. Daggas
// SPDX-License-Identifier: MIT

//! The connection decision engine.
//!
//! This module contains the components the manager is built from:
//! - Service: per-candidate state machine and auto-connect bookkeeping
//! - Ranking: the total order over services
//! - Profile: persisted configuration scopes and service binding
//! - Device: the driver capability interface
//! - Manager: orchestration of all of the above
//! - Notifier / Properties: the management-layer boundary

pub mod device;
pub mod event_history;
pub mod manager;
pub mod notifier;
pub mod profile;
pub mod properties;
pub mod ranking;
pub mod service;
pub mod termination;

use serde::{Deserialize, Serialize};
use std::fmt;

pub use device::{
    ConnectCompletion, ConnectRequest, ConnectionParams, DisconnectCompletion, Driver,
    DriverEvent, EventSender, TerminationCompletion, TerminationReason,
};
pub use event_history::EventHistory;
pub use manager::Manager;
pub use notifier::{PropertyChange, PropertySource, PropertyValue};
pub use profile::{Profile, ProfileIdentifier};
pub use service::{AutoConnectBlocker, SecurityLevel, Service, ServiceSpec};

macro_rules! handle_type {
    ($(#[$meta:meta])* $name:ident, $prefix:literal) => {
        $(#[$meta])*
        #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
        pub struct $name(pub u64);

        impl fmt::Display for $name {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                write!(f, concat!($prefix, "{}"), self.0)
            }
        }
    };
}

handle_type!(
    /// Non-owning handle to a service; equal to its serial number.
    ServiceId,
    "service_"
);
handle_type!(
    /// Non-owning handle to a profile.
    ProfileId,
    "profile_"
);
handle_type!(
    /// Non-owning handle to a device.
    DeviceId,
    "device_"
);
