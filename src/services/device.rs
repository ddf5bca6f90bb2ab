// Netpilot - Driver Interface
// Copyright (C) 2026 Christos A. Daggas
// SPDX-License-Identifier: MIT

//! Capability interface implemented once per technology.
//!
//! The manager never blocks on a driver. `connect` and `disconnect` return
//! straight away; the driver reports the outcome later through the
//! completion it was handed, which posts a [`DriverEvent`] back onto the
//! manager's event channel.

use std::fmt;
use std::net::IpAddr;
use tokio::sync::mpsc;
use tracing::warn;

use super::service::ServiceSpec;
use super::{DeviceId, ServiceId};
use crate::models::{ConnectFailure, ConnectState, Result, Technology};
use crate::storage::Store;

/// Layer 3 parameters reported by a successful connect.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ConnectionParams {
    pub name_servers: Vec<IpAddr>,
}

/// Signals from drivers to the manager.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DriverEvent {
    /// Outcome of a `connect` call.
    ConnectResult {
        service: ServiceId,
        result: std::result::Result<ConnectionParams, ConnectFailure>,
    },
    /// A `disconnect` call finished.
    Disconnected { service: ServiceId },
    /// The carrier for a service came up.
    LinkUp { service: ServiceId },
    /// The carrier for a service was lost.
    LinkDown { service: ServiceId },
    /// Outcome of a connectivity check on a connected service.
    ConnectivityResult { service: ServiceId, state: ConnectState },
    /// Signal strength update (0-100).
    StrengthChanged { service: ServiceId, strength: u8 },
    /// A device finished its termination actions.
    TerminationDone { device: DeviceId },
}

/// Sending half of the manager's event channel.
#[derive(Debug, Clone)]
pub struct EventSender {
    tx: mpsc::UnboundedSender<DriverEvent>,
}

impl EventSender {
    pub fn new(tx: mpsc::UnboundedSender<DriverEvent>) -> Self {
        Self { tx }
    }

    pub fn send(&self, event: DriverEvent) {
        if self.tx.send(event).is_err() {
            warn!("Event dropped: manager is gone");
        }
    }
}

/// What a driver needs to start a connection.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ConnectRequest {
    pub service: ServiceId,
    pub storage_identifier: String,
    pub technology: Technology,
}

/// One-shot completion for a `connect` call.
#[derive(Debug)]
pub struct ConnectCompletion {
    service: ServiceId,
    events: EventSender,
}

impl ConnectCompletion {
    pub fn new(service: ServiceId, events: EventSender) -> Self {
        Self { service, events }
    }

    pub fn succeeded(self, params: ConnectionParams) {
        self.complete(Ok(params));
    }

    pub fn failed(self, failure: ConnectFailure) {
        self.complete(Err(failure));
    }

    pub fn complete(self, result: std::result::Result<ConnectionParams, ConnectFailure>) {
        self.events.send(DriverEvent::ConnectResult {
            service: self.service,
            result,
        });
    }
}

/// One-shot completion for a `disconnect` call.
#[derive(Debug)]
pub struct DisconnectCompletion {
    service: ServiceId,
    events: EventSender,
}

impl DisconnectCompletion {
    pub fn new(service: ServiceId, events: EventSender) -> Self {
        Self { service, events }
    }

    pub fn complete(self) {
        self.events.send(DriverEvent::Disconnected {
            service: self.service,
        });
    }
}

/// Why termination actions are being run.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TerminationReason {
    Shutdown,
    Suspend,
    DarkSuspend,
}

impl fmt::Display for TerminationReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Self::Shutdown => "shutdown",
            Self::Suspend => "suspend",
            Self::DarkSuspend => "dark suspend",
        };
        f.write_str(s)
    }
}

/// One-shot completion for termination actions.
#[derive(Debug)]
pub struct TerminationCompletion {
    device: DeviceId,
    events: EventSender,
}

impl TerminationCompletion {
    pub fn new(device: DeviceId, events: EventSender) -> Self {
        Self { device, events }
    }

    pub fn complete(self) {
        self.events.send(DriverEvent::TerminationDone {
            device: self.device,
        });
    }
}

/// Technology-specific link driver.
pub trait Driver: fmt::Debug {
    fn technology(&self) -> Technology;

    /// Provider type string exposed to the management layer.
    fn provider_type(&self) -> &str {
        self.technology().as_str()
    }

    fn connect(&mut self, request: ConnectRequest, completion: ConnectCompletion) -> Result<()>;

    fn disconnect(&mut self, service: ServiceId, completion: DisconnectCompletion) -> Result<()>;

    /// Kernel link the device is bound to, if it has one.
    fn link_name(&self) -> Option<&str> {
        None
    }

    /// Whether this driver manages the named kernel link.
    fn claim_link(&mut self, _link_name: &str) -> bool {
        false
    }

    /// Services remembered in `store` that the driver does not currently
    /// see (hidden networks, configured tunnels).
    fn remembered_services(&mut self, _store: &dyn Store) -> Vec<ServiceSpec> {
        Vec::new()
    }

    /// Start actions that must finish before shutdown or suspend.
    fn prepare_for_termination(&mut self, _reason: TerminationReason, completion: TerminationCompletion) {
        completion.complete();
    }
}

/// A registered driver instance.
#[derive(Debug)]
pub struct Device {
    id: DeviceId,
    driver: Box<dyn Driver>,
    claimed_links: Vec<String>,
}

impl Device {
    pub fn new(id: DeviceId, driver: Box<dyn Driver>) -> Self {
        Self {
            id,
            driver,
            claimed_links: Vec::new(),
        }
    }

    pub fn id(&self) -> DeviceId {
        self.id
    }

    pub fn technology(&self) -> Technology {
        self.driver.technology()
    }

    pub fn driver_mut(&mut self) -> &mut dyn Driver {
        self.driver.as_mut()
    }

    pub fn claimed_links(&self) -> &[String] {
        &self.claimed_links
    }

    /// Offer a link to the driver, recording it if claimed.
    pub fn offer_link(&mut self, link_name: &str) -> bool {
        if self.claimed_links.iter().any(|l| l == link_name) {
            return true;
        }
        if self.driver.claim_link(link_name) {
            self.claimed_links.push(link_name.to_string());
            return true;
        }
        false
    }

    pub fn release_link(&mut self, link_name: &str) -> bool {
        let before = self.claimed_links.len();
        self.claimed_links.retain(|l| l != link_name);
        before != self.claimed_links.len()
    }
}
