// Netpilot - Change Notifier
// Copyright (C) 2026 Christos A. Daggas
// SPDX-License-Identifier: MIT

//! Property change notifications for the management layer.

use serde::Serialize;
use tokio::sync::mpsc;
use tracing::debug;

use super::{ProfileId, ServiceId};

/// A property value as seen by the management layer.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(untagged)]
pub enum PropertyValue {
    Bool(bool),
    Int(i64),
    Uint(u64),
    String(String),
    Strings(Vec<String>),
}

impl From<bool> for PropertyValue {
    fn from(v: bool) -> Self {
        Self::Bool(v)
    }
}

impl From<i32> for PropertyValue {
    fn from(v: i32) -> Self {
        Self::Int(i64::from(v))
    }
}

impl From<u8> for PropertyValue {
    fn from(v: u8) -> Self {
        Self::Uint(u64::from(v))
    }
}

impl From<usize> for PropertyValue {
    fn from(v: usize) -> Self {
        Self::Uint(v as u64)
    }
}

impl From<String> for PropertyValue {
    fn from(v: String) -> Self {
        Self::String(v)
    }
}

impl From<&str> for PropertyValue {
    fn from(v: &str) -> Self {
        Self::String(v.to_string())
    }
}

impl From<Vec<String>> for PropertyValue {
    fn from(v: Vec<String>) -> Self {
        Self::Strings(v)
    }
}

/// Object a property belongs to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(tag = "kind", content = "id", rename_all = "lowercase")]
pub enum PropertySource {
    Manager,
    Service(ServiceId),
    Profile(ProfileId),
}

/// One emitted change.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct PropertyChange {
    pub source: PropertySource,
    pub name: String,
    pub value: PropertyValue,
}

impl PropertyChange {
    /// JSON form handed to the management layer.
    pub fn to_json(&self) -> crate::models::Result<String> {
        Ok(serde_json::to_string(self)?)
    }
}

/// Fans changes out to subscribers.
#[derive(Debug, Default)]
pub struct ChangeNotifier {
    subscribers: Vec<mpsc::UnboundedSender<PropertyChange>>,
}

impl ChangeNotifier {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn subscribe(&mut self) -> mpsc::UnboundedReceiver<PropertyChange> {
        let (tx, rx) = mpsc::unbounded_channel();
        self.subscribers.push(tx);
        rx
    }

    pub fn subscriber_count(&self) -> usize {
        self.subscribers.len()
    }

    pub fn emit(&mut self, source: PropertySource, name: &str, value: impl Into<PropertyValue>) {
        let change = PropertyChange {
            source,
            name: name.to_string(),
            value: value.into(),
        };
        debug!("Property {:?}.{} changed to {:?}", change.source, change.name, change.value);
        self.subscribers.retain(|tx| tx.send(change.clone()).is_ok());
    }
}
