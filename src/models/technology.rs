// Netpilot - Technology Identifiers
// Copyright (C) 2026 Christos A. Daggas
// SPDX-License-Identifier: MIT

//! Link technologies a service can belong to.

use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;
use std::time::Duration;

use super::error::{Error, Result};

/// Maximum auto-connect cooldown for cellular bearers.
const CELLULAR_MAX_COOLDOWN: Duration = Duration::from_secs(30 * 60);

/// Technology of a service or device.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Technology {
    /// Wired Ethernet.
    Ethernet,
    /// 802.11 wireless.
    Wifi,
    /// WiMAX bearer.
    Wimax,
    /// Cellular modem bearer.
    Cellular,
    /// Tunnel / VPN.
    Vpn,
    /// Unrecognized technology.
    Unknown,
}

impl Technology {
    /// All known technologies, in declaration order.
    pub const ALL: [Technology; 5] = [
        Technology::Ethernet,
        Technology::Wifi,
        Technology::Wimax,
        Technology::Cellular,
        Technology::Vpn,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Ethernet => "ethernet",
            Self::Wifi => "wifi",
            Self::Wimax => "wimax",
            Self::Cellular => "cellular",
            Self::Vpn => "vpn",
            Self::Unknown => "unknown",
        }
    }

    /// Look up a technology by name, returning `Unknown` for anything else.
    pub fn from_name(name: &str) -> Self {
        match name.trim() {
            "ethernet" => Self::Ethernet,
            "wifi" => Self::Wifi,
            "wimax" => Self::Wimax,
            "cellular" => Self::Cellular,
            "vpn" => Self::Vpn,
            _ => Self::Unknown,
        }
    }

    /// Whether this technology provides connectivity on its own.
    ///
    /// Tunnels ride on top of another connection.
    pub fn is_primary_connectivity(&self) -> bool {
        !matches!(self, Self::Vpn | Self::Unknown)
    }

    /// Whether this technology is a tunnel (logical, not physical).
    pub fn is_tunnel(&self) -> bool {
        matches!(self, Self::Vpn)
    }

    /// Built-in auto-connect cooldown cap, if this technology overrides the default.
    pub fn builtin_max_cooldown(&self) -> Option<Duration> {
        match self {
            Self::Cellular => Some(CELLULAR_MAX_COOLDOWN),
            _ => None,
        }
    }

    /// Parse a comma separated technology list, rejecting unknown or
    /// repeated names.
    pub fn parse_list(list: &str) -> Result<Vec<Technology>> {
        let mut order = Vec::new();
        for part in list.split(',') {
            if part.trim().is_empty() {
                continue;
            }
            let technology = part.parse::<Technology>()?;
            if order.contains(&technology) {
                return Err(Error::DuplicateTechnology(part.trim().to_string()));
            }
            order.push(technology);
        }
        Ok(order)
    }

    /// Join a technology list back into its comma separated form.
    pub fn join_list(list: &[Technology]) -> String {
        list.iter()
            .map(|t| t.as_str())
            .collect::<Vec<_>>()
            .join(",")
    }
}

impl FromStr for Technology {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        match Self::from_name(s) {
            Self::Unknown => Err(Error::UnknownTechnology(s.trim().to_string())),
            technology => Ok(technology),
        }
    }
}

impl fmt::Display for Technology {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}
