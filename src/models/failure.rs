// Netpilot - Connection Failure Reasons
// Copyright (C) 2026 Christos A. Daggas
// SPDX-License-Identifier: MIT

//! Failure taxonomy reported by drivers through connect completions.
//!
//! Failures are surfaced through the service `Error` property, never thrown.

use serde::{Deserialize, Serialize};
use std::fmt;

/// Reason the last connection attempt (or connection) failed.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Default)]
#[serde(rename_all = "kebab-case")]
pub enum ConnectFailure {
    #[default]
    None,
    /// Authentication, authorization and accounting rejected us.
    Aaa,
    /// Bearer activation failed.
    Activation,
    /// The passphrase was rejected.
    BadPassphrase,
    /// The WEP key was rejected.
    BadWepKey,
    /// Generic connect failure.
    Connect,
    /// Name resolution failed.
    DnsLookup,
    /// No address could be acquired.
    Dhcp,
    /// Outer EAP authentication failed.
    EapAuthentication,
    /// Local TLS certificate was rejected.
    EapLocalTls,
    /// Remote TLS certificate could not be verified.
    EapRemoteTls,
    /// HTTP connectivity check failed.
    HttpGet,
    /// Internal error.
    Internal,
    /// Tunnel certificate authentication failed.
    IpsecCertAuth,
    /// Tunnel pre-shared key authentication failed.
    IpsecPskAuth,
    /// A different network is required.
    NeedEvdo,
    /// The home network is required.
    NeedHomeNetwork,
    /// Over-the-air provisioning failed.
    Otasp,
    /// The network is out of range.
    OutOfRange,
    /// A SIM PIN is required.
    PinMissing,
    /// Link layer (PPP) authentication failed.
    PppAuth,
    /// Could not associate with the network.
    NotAssociated,
    /// Could not authenticate with the network.
    NotAuthenticated,
    /// The access point refused us for having too many clients.
    TooManyStas,
    /// Anything else.
    Unknown,
}

impl ConnectFailure {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::None => "no-failure",
            Self::Aaa => "aaa-failed",
            Self::Activation => "activation-failed",
            Self::BadPassphrase => "bad-passphrase",
            Self::BadWepKey => "bad-wepkey",
            Self::Connect => "connect-failed",
            Self::DnsLookup => "dns-lookup-failed",
            Self::Dhcp => "dhcp-failed",
            Self::EapAuthentication => "eap-authentication-failed",
            Self::EapLocalTls => "eap-local-tls-failed",
            Self::EapRemoteTls => "eap-remote-tls-failed",
            Self::HttpGet => "http-get-failed",
            Self::Internal => "internal-error",
            Self::IpsecCertAuth => "ipsec-cert-auth-failed",
            Self::IpsecPskAuth => "ipsec-psk-auth-failed",
            Self::NeedEvdo => "need-evdo",
            Self::NeedHomeNetwork => "need-home-network",
            Self::Otasp => "otasp-failed",
            Self::OutOfRange => "out-of-range",
            Self::PinMissing => "pin-missing",
            Self::PppAuth => "ppp-auth-failed",
            Self::NotAssociated => "not-associated",
            Self::NotAuthenticated => "not-authenticated",
            Self::TooManyStas => "too-many-stas",
            Self::Unknown => "unknown-failure",
        }
    }

    pub fn is_failure(&self) -> bool {
        !matches!(self, Self::None)
    }
}

impl fmt::Display for ConnectFailure {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}
