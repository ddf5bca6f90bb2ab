// Netpilot - Connection State
// Copyright (C) 2026 Christos A. Daggas
// SPDX-License-Identifier: MIT

//! Service connection states.

use serde::{Deserialize, Serialize};
use std::fmt;

/// Connection state of a service.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Default)]
#[serde(rename_all = "kebab-case")]
pub enum ConnectState {
    /// Invalid placeholder; never set on a live service.
    Unknown,
    /// Not connected and not trying to connect.
    #[default]
    Idle,
    /// Link layer association in progress.
    Associating,
    /// Link is up, layer 3 configuration in progress.
    Configuring,
    /// Layer 3 configured; connectivity not yet verified.
    Connected,
    /// Configured but connectivity checks failed.
    NoConnectivity,
    /// Connectivity check was redirected (captive portal found).
    RedirectFound,
    /// Connectivity check results suggest a captive portal.
    PortalSuspected,
    /// Connectivity to the internet verified.
    Online,
    /// The last connection attempt failed or the connection was lost.
    Failure,
}

impl ConnectState {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Unknown => "unknown",
            Self::Idle => "idle",
            Self::Associating => "association",
            Self::Configuring => "configuration",
            Self::Connected => "ready",
            Self::NoConnectivity => "no-connectivity",
            Self::RedirectFound => "redirect-found",
            Self::PortalSuspected => "portal-suspected",
            Self::Online => "online",
            Self::Failure => "failure",
        }
    }

    /// States that count as "connected" for policy purposes.
    pub fn is_connected(&self) -> bool {
        matches!(
            self,
            Self::Connected
                | Self::NoConnectivity
                | Self::RedirectFound
                | Self::PortalSuspected
                | Self::Online
        )
    }

    /// States in which a connection attempt is in flight.
    pub fn is_connecting(&self) -> bool {
        matches!(self, Self::Associating | Self::Configuring)
    }

    /// Connected, but without verified internet reachability.
    pub fn is_portalled(&self) -> bool {
        matches!(
            self,
            Self::NoConnectivity | Self::RedirectFound | Self::PortalSuspected
        )
    }

    pub fn is_online(&self) -> bool {
        matches!(self, Self::Online)
    }

    pub fn is_failed(&self) -> bool {
        matches!(self, Self::Failure)
    }

    /// Connected or connecting.
    pub fn is_active(&self) -> bool {
        self.is_connected() || self.is_connecting()
    }
}

impl fmt::Display for ConnectState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_connected_states() {
        for state in [
            ConnectState::Connected,
            ConnectState::NoConnectivity,
            ConnectState::RedirectFound,
            ConnectState::PortalSuspected,
            ConnectState::Online,
        ] {
            assert!(state.is_connected(), "{} should be connected", state);
            assert!(!state.is_connecting());
        }
        assert!(!ConnectState::Failure.is_connected());
        assert!(!ConnectState::Idle.is_active());
    }

    #[test]
    fn test_connecting_states() {
        assert!(ConnectState::Associating.is_connecting());
        assert!(ConnectState::Configuring.is_connecting());
        assert!(!ConnectState::Connected.is_connecting());
    }
}
