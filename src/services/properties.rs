// Netpilot - Service Properties
// Copyright (C) 2026 Christos A. Daggas
// SPDX-License-Identifier: MIT

//! Static property table for services.
//!
//! Maps each externally visible property name to a getter and, for
//! writable properties, a validating setter. The `Profile` property needs
//! manager state and is resolved by the manager itself.

use super::notifier::PropertyValue;
use super::service::Service;
use crate::models::{Error, Result};

pub const NAME: &str = "Name";
pub const TYPE: &str = "Type";
pub const STATE: &str = "State";
pub const ERROR: &str = "Error";
pub const STRENGTH: &str = "Strength";
pub const PRIORITY: &str = "Priority";
pub const AUTO_CONNECT: &str = "AutoConnect";
pub const CONNECTABLE: &str = "Connectable";
pub const PROFILE: &str = "Profile";
pub const GUID: &str = "GUID";
pub const SECURITY_LEVEL: &str = "SecurityLevel";
pub const HAS_EVER_CONNECTED: &str = "HasEverConnected";
pub const DISCONNECTS: &str = "Diagnostics.Disconnects";
pub const MISCONNECTS: &str = "Diagnostics.Misconnects";
pub const RECENT_ISSUES: &str = "Diagnostics.RecentConnectionIssues";

type Getter = fn(&mut Service) -> PropertyValue;

/// Applies a value; returns whether the service changed.
type Setter = fn(&mut Service, &PropertyValue) -> Result<bool>;

/// One entry of the property table.
pub struct ServiceProperty {
    pub name: &'static str,
    pub get: Getter,
    pub set: Option<Setter>,
    /// A change should be saved to the owning profile.
    pub persisted: bool,
}

fn expect_bool(property: &str, value: &PropertyValue) -> Result<bool> {
    match value {
        PropertyValue::Bool(b) => Ok(*b),
        _ => Err(Error::invalid_value(property, "expected a boolean")),
    }
}

fn expect_i32(property: &str, value: &PropertyValue) -> Result<i32> {
    let raw = match value {
        PropertyValue::Int(i) => *i,
        PropertyValue::Uint(u) => i64::try_from(*u)
            .map_err(|_| Error::invalid_value(property, "out of range"))?,
        _ => return Err(Error::invalid_value(property, "expected an integer")),
    };
    i32::try_from(raw).map_err(|_| Error::invalid_value(property, "out of range"))
}

fn expect_string<'a>(property: &str, value: &'a PropertyValue) -> Result<&'a str> {
    match value {
        PropertyValue::String(s) => Ok(s),
        _ => Err(Error::invalid_value(property, "expected a string")),
    }
}

static SERVICE_PROPERTIES: &[ServiceProperty] = &[
    ServiceProperty {
        name: NAME,
        get: |s| s.friendly_name().into(),
        set: None,
        persisted: false,
    },
    ServiceProperty {
        name: TYPE,
        get: |s| s.technology().as_str().into(),
        set: None,
        persisted: false,
    },
    ServiceProperty {
        name: STATE,
        get: |s| s.state().as_str().into(),
        set: None,
        persisted: false,
    },
    ServiceProperty {
        name: ERROR,
        get: |s| s.failure().as_str().into(),
        set: None,
        persisted: false,
    },
    ServiceProperty {
        name: STRENGTH,
        get: |s| s.strength().into(),
        set: None,
        persisted: false,
    },
    ServiceProperty {
        name: PRIORITY,
        get: |s| s.priority().into(),
        set: Some(|s, v| Ok(s.set_priority(expect_i32(PRIORITY, v)?))),
        persisted: true,
    },
    ServiceProperty {
        name: AUTO_CONNECT,
        get: |s| s.auto_connect().into(),
        set: Some(|s, v| Ok(s.set_auto_connect_full(expect_bool(AUTO_CONNECT, v)?))),
        persisted: true,
    },
    ServiceProperty {
        name: CONNECTABLE,
        get: |s| s.connectable().into(),
        set: None,
        persisted: false,
    },
    ServiceProperty {
        name: GUID,
        get: |s| s.guid().into(),
        set: Some(|s, v| Ok(s.set_guid(expect_string(GUID, v)?))),
        persisted: true,
    },
    ServiceProperty {
        name: SECURITY_LEVEL,
        get: |s| s.security_level().into(),
        set: None,
        persisted: false,
    },
    ServiceProperty {
        name: HAS_EVER_CONNECTED,
        get: |s| s.has_ever_connected().into(),
        set: None,
        persisted: false,
    },
    ServiceProperty {
        name: DISCONNECTS,
        get: |s| s.disconnect_history().into(),
        set: None,
        persisted: false,
    },
    ServiceProperty {
        name: MISCONNECTS,
        get: |s| s.misconnect_history().into(),
        set: None,
        persisted: false,
    },
    ServiceProperty {
        name: RECENT_ISSUES,
        get: |s| s.has_recent_connection_issues().into(),
        set: None,
        persisted: false,
    },
];

/// All table entries.
pub fn service_properties() -> &'static [ServiceProperty] {
    SERVICE_PROPERTIES
}

pub fn lookup(name: &str) -> Result<&'static ServiceProperty> {
    SERVICE_PROPERTIES
        .iter()
        .find(|p| p.name == name)
        .ok_or_else(|| Error::UnknownProperty(name.to_string()))
}

pub fn get(service: &mut Service, name: &str) -> Result<PropertyValue> {
    Ok((lookup(name)?.get)(service))
}

/// Validate and apply a value.
pub fn set(service: &mut Service, name: &str, value: &PropertyValue) -> Result<bool> {
    let property = lookup(name)?;
    let setter = property
        .set
        .ok_or_else(|| Error::ReadOnlyProperty(name.to_string()))?;
    setter(service, value)
}
