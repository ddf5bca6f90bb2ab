// Netpilot - Error Types
// Copyright (C) 2026 Christos A. Daggas
// SPDX-License-Identifier: MIT

//! Shared error types for administrative operations.
//!
//! Connection failures reported by drivers are not errors; they travel as
//! [`ConnectFailure`](super::ConnectFailure) values through the service state.

use thiserror::Error;

/// Result type alias for Netpilot operations.
pub type Result<T> = std::result::Result<T, Error>;

/// Main error type for Netpilot operations.
#[derive(Debug, Error)]
pub enum Error {
    // ========================================
    // Profile Errors
    // ========================================
    #[error("Invalid profile name: {0}")]
    InvalidProfileName(String),

    #[error("Profile not found: {0}")]
    ProfileNotFound(String),

    #[error("Profile {0} is already on the stack")]
    ProfileAlreadyOnStack(String),

    #[error("{0} is not the active profile")]
    NotActiveProfile(String),

    #[error("Cannot push machine-wide profile {0} above a user profile")]
    MachineProfileAboveUser(String),

    #[error("Profile stack cannot be emptied")]
    ProfileStackBottom,

    #[error("Profile {0} is in use")]
    ProfileInUse(String),

    // ========================================
    // Service Errors
    // ========================================
    #[error("Service not found: {0}")]
    ServiceNotFound(String),

    #[error("Service already registered: {0}")]
    ServiceAlreadyRegistered(String),

    #[error("Service {0} is not connectable")]
    NotConnectable(String),

    #[error("Service {0} is already connected")]
    AlreadyConnected(String),

    #[error("Connection to {0} is already in progress")]
    InProgress(String),

    #[error("Service {0} is not connected")]
    NotConnected(String),

    #[error("Device not found: {0}")]
    DeviceNotFound(String),

    #[error("Device {0} is blacklisted")]
    DeviceBlacklisted(String),

    #[error("Driver error: {0}")]
    Driver(String),

    // ========================================
    // Property Errors
    // ========================================
    #[error("Unknown property: {0}")]
    UnknownProperty(String),

    #[error("Property {0} is read-only")]
    ReadOnlyProperty(String),

    #[error("Invalid value for {property}: {reason}")]
    InvalidPropertyValue { property: String, reason: String },

    // ========================================
    // Technology Errors
    // ========================================
    #[error("{0} is an unknown technology name")]
    UnknownTechnology(String),

    #[error("{0} is duplicated in the list")]
    DuplicateTechnology(String),

    // ========================================
    // Storage Errors
    // ========================================
    #[error("Storage not found: {0}")]
    StorageNotFound(String),

    #[error("Storage already exists: {0}")]
    StorageAlreadyExists(String),

    #[error("Storage schema version mismatch: expected {expected}, found {found}")]
    SchemaMismatch { expected: String, found: String },

    #[error("Failed to read configuration: {0}")]
    ConfigReadFailed(String),

    #[error("Failed to write configuration: {0}")]
    ConfigWriteFailed(String),

    #[error("Failed to parse configuration: {0}")]
    ConfigParseFailed(String),

    // ========================================
    // System Errors
    // ========================================
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Manager is not running")]
    NotRunning,

    #[error("Connections are disabled in offline mode")]
    OfflineMode,

    // ========================================
    // Generic Errors
    // ========================================
    #[error("Internal error: {0}")]
    Internal(String),
}

impl Error {
    /// Create a new invalid property value error.
    pub fn invalid_value(property: impl Into<String>, reason: impl Into<String>) -> Self {
        Self::InvalidPropertyValue {
            property: property.into(),
            reason: reason.into(),
        }
    }

    /// Check if this error rejects caller-supplied arguments.
    pub fn is_invalid_arguments(&self) -> bool {
        matches!(
            self,
            Self::InvalidProfileName(_)
                | Self::MachineProfileAboveUser(_)
                | Self::UnknownTechnology(_)
                | Self::DuplicateTechnology(_)
                | Self::InvalidPropertyValue { .. }
        )
    }

    /// Check if this error reports a missing object.
    pub fn is_not_found(&self) -> bool {
        matches!(
            self,
            Self::ProfileNotFound(_)
                | Self::ServiceNotFound(_)
                | Self::DeviceNotFound(_)
                | Self::StorageNotFound(_)
        )
    }
}

// Convert from toml parse errors
impl From<toml::de::Error> for Error {
    fn from(err: toml::de::Error) -> Self {
        Error::ConfigParseFailed(err.to_string())
    }
}

// Convert from toml serialize errors
impl From<toml::ser::Error> for Error {
    fn from(err: toml::ser::Error) -> Self {
        Error::ConfigWriteFailed(err.to_string())
    }
}

// Convert from serde_json errors
impl From<serde_json::Error> for Error {
    fn from(err: serde_json::Error) -> Self {
        Error::ConfigParseFailed(err.to_string())
    }
}
