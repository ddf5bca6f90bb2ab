// Netpilot - Service State Machine
// Copyright (C) 2026 Christos A. Daggas
// SPDX-License-Identifier: MIT

//! A Service is one candidate network attachment point: a wireless network,
//! a wired link, a cellular bearer or a tunnel.
//!
//! The service owns its connection state machine, auto-connect eligibility
//! and failure backoff, and knows how to load and save its configuration
//! from a profile [`Store`]. It holds only handles to its profile and
//! device; the manager owns everything.

use std::fmt;
use std::net::IpAddr;
use std::time::Duration;
use tracing::{debug, info};

use super::event_history::EventHistory;
use super::{DeviceId, ProfileId, ServiceId};
use crate::models::{ConnectFailure, ConnectState, Technology};
use crate::scheduler::{Dispatcher, Task, TaskHandle};
use crate::storage::Store;

/// Window during which connection drops are remembered.
pub const DISCONNECTS_MONITOR_WINDOW: Duration = Duration::from_secs(5 * 60);

/// Window during which failed connection attempts are remembered.
pub const MISCONNECTS_MONITOR_WINDOW: Duration = Duration::from_secs(5 * 60);

/// Maximum number of events kept in each history.
pub const MAX_HISTORY_EVENTS: usize = 20;

// Storage keys
pub const STORAGE_NAME: &str = "Name";
pub const STORAGE_TYPE: &str = "Type";
pub const STORAGE_AUTO_CONNECT: &str = "AutoConnect";
pub const STORAGE_PRIORITY: &str = "Priority";
pub const STORAGE_GUID: &str = "GUID";
pub const STORAGE_HAS_EVER_CONNECTED: &str = "HasEverConnected";

/// Security properties of a service, ranked as a 3-bit value.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct SecurityLevel {
    /// Traffic is protected by a strong cipher.
    pub strong_crypto: bool,
    /// Keys are rotated during the session.
    pub key_rotation: bool,
    /// The remote endpoint is authenticated.
    pub endpoint_auth: bool,
}

impl SecurityLevel {
    pub fn value(&self) -> u8 {
        (u8::from(self.strong_crypto) << 2)
            | (u8::from(self.key_rotation) << 1)
            | u8::from(self.endpoint_auth)
    }
}

/// Driver-provided description of a new service.
#[derive(Debug, Clone)]
pub struct ServiceSpec {
    /// Stable key for the service's storage group.
    pub storage_identifier: String,
    /// User-visible name.
    pub friendly_name: String,
    pub connectable: bool,
    pub strength: u8,
    pub security: SecurityLevel,
    /// Credentials are provisioned by an administrator.
    pub managed_credentials: bool,
    /// Auto-connect value before any configuration is loaded.
    pub auto_connect_by_default: bool,
}

impl ServiceSpec {
    pub fn new(storage_identifier: impl Into<String>, friendly_name: impl Into<String>) -> Self {
        Self {
            storage_identifier: storage_identifier.into(),
            friendly_name: friendly_name.into(),
            connectable: true,
            strength: 0,
            security: SecurityLevel::default(),
            managed_credentials: false,
            auto_connect_by_default: false,
        }
    }
}

/// Reason a service is not eligible for auto-connect.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AutoConnectBlocker {
    TechnologyDisabled,
    NotConnectable,
    Connected,
    Connecting,
    ExplicitlyDisconnected,
    Throttled,
    NoConnectivity,
}

impl AutoConnectBlocker {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::TechnologyDisabled => "technology not auto connectable",
            Self::NotConnectable => "not connectable",
            Self::Connected => "already connected",
            Self::Connecting => "connecting",
            Self::ExplicitlyDisconnected => "explicitly disconnected",
            Self::Throttled => "throttled",
            Self::NoConnectivity => "no underlying connectivity",
        }
    }

    /// Blockers that are routine enough to log only at debug level.
    pub fn is_quiet(&self) -> bool {
        matches!(self, Self::Connected | Self::Connecting)
    }
}

impl fmt::Display for AutoConnectBlocker {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Manager-level facts a service needs to judge auto-connect eligibility.
#[derive(Debug, Clone, Copy)]
pub struct AutoConnectContext {
    /// Auto-connect is administratively allowed for the technology.
    pub technology_allowed: bool,
    /// Some service already provides connectivity.
    pub has_connectivity: bool,
}

/// Manager-level facts that decide whether a drop is an instability signal.
#[derive(Debug, Clone, Copy)]
pub struct EventContext {
    pub running: bool,
    pub suspending: bool,
    /// Offline mode is tearing connections down.
    pub offline: bool,
}

/// Layer 3 connection carried by a connected service.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct Connection {
    pub name_servers: Vec<IpAddr>,
    /// Routing metric; lower is preferred.
    pub metric: u32,
    /// This connection backs the default physical service.
    pub is_primary_physical: bool,
    /// Name resolution uses this connection's servers.
    pub use_dns: bool,
}

/// Result of a state change, for the manager to act on.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct StateTransition {
    pub from: ConnectState,
    pub to: ConnectState,
    /// The service should be saved to its profile.
    pub persist: bool,
}

/// A connectable network attachment point.
#[derive(Debug)]
pub struct Service {
    id: ServiceId,
    unique_name: String,
    friendly_name: String,
    storage_identifier: String,
    technology: Technology,
    device: DeviceId,
    profile: ProfileId,

    state: ConnectState,
    previous_state: ConnectState,
    failure: ConnectFailure,
    /// The drop that led into Idle was already classified.
    drop_noted: bool,

    connectable: bool,
    auto_connect_by_default: bool,
    auto_connect: bool,
    retain_auto_connect: bool,
    priority: i32,
    security: SecurityLevel,
    strength: u8,
    managed_credentials: bool,
    has_ever_connected: bool,
    explicitly_disconnected: bool,
    guid: String,

    auto_connect_cooldown: Duration,
    reenable_auto_connect: Option<TaskHandle>,
    disconnects: EventHistory,
    misconnects: EventHistory,

    connection: Option<Connection>,
}

impl Service {
    /// Create a service from a driver spec. It starts owned by `profile`
    /// (normally the ephemeral profile until bound).
    pub fn new(
        id: ServiceId,
        device: DeviceId,
        technology: Technology,
        spec: ServiceSpec,
        profile: ProfileId,
    ) -> Self {
        Self {
            id,
            unique_name: id.0.to_string(),
            friendly_name: spec.friendly_name,
            storage_identifier: spec.storage_identifier,
            technology,
            device,
            profile,
            state: ConnectState::Idle,
            previous_state: ConnectState::Idle,
            failure: ConnectFailure::None,
            drop_noted: false,
            connectable: spec.connectable,
            auto_connect_by_default: spec.auto_connect_by_default,
            auto_connect: spec.auto_connect_by_default,
            retain_auto_connect: false,
            priority: 0,
            security: spec.security,
            strength: spec.strength.min(100),
            managed_credentials: spec.managed_credentials,
            has_ever_connected: false,
            explicitly_disconnected: false,
            guid: String::new(),
            auto_connect_cooldown: Duration::ZERO,
            reenable_auto_connect: None,
            disconnects: EventHistory::new(MAX_HISTORY_EVENTS, DISCONNECTS_MONITOR_WINDOW),
            misconnects: EventHistory::new(MAX_HISTORY_EVENTS, MISCONNECTS_MONITOR_WINDOW),
            connection: None,
        }
    }

    // ========================================================================
    // Accessors
    // ========================================================================

    pub fn id(&self) -> ServiceId {
        self.id
    }

    pub fn serial_number(&self) -> u64 {
        self.id.0
    }

    pub fn unique_name(&self) -> &str {
        &self.unique_name
    }

    pub fn friendly_name(&self) -> &str {
        &self.friendly_name
    }

    pub fn storage_identifier(&self) -> &str {
        &self.storage_identifier
    }

    pub fn technology(&self) -> Technology {
        self.technology
    }

    pub fn device(&self) -> DeviceId {
        self.device
    }

    pub fn profile(&self) -> ProfileId {
        self.profile
    }

    pub fn set_profile(&mut self, profile: ProfileId) {
        self.profile = profile;
    }

    pub fn state(&self) -> ConnectState {
        self.state
    }

    pub fn failure(&self) -> ConnectFailure {
        self.failure
    }

    pub fn is_connected(&self) -> bool {
        self.state.is_connected()
    }

    pub fn is_connecting(&self) -> bool {
        self.state.is_connecting()
    }

    pub fn is_active(&self) -> bool {
        self.state.is_active()
    }

    pub fn connectable(&self) -> bool {
        self.connectable
    }

    pub fn set_connectable(&mut self, connectable: bool) -> bool {
        let changed = self.connectable != connectable;
        self.connectable = connectable;
        changed
    }

    pub fn auto_connect(&self) -> bool {
        self.auto_connect
    }

    pub fn retain_auto_connect(&self) -> bool {
        self.retain_auto_connect
    }

    /// Change auto-connect without marking it for persistence.
    pub fn set_auto_connect(&mut self, auto_connect: bool) -> bool {
        let changed = self.auto_connect != auto_connect;
        self.auto_connect = auto_connect;
        changed
    }

    /// Change auto-connect as a user or administrator setting: the value
    /// is retained and persisted from now on.
    pub fn set_auto_connect_full(&mut self, auto_connect: bool) -> bool {
        let changed = self.auto_connect != auto_connect || !self.retain_auto_connect;
        self.auto_connect = auto_connect;
        self.retain_auto_connect = true;
        changed
    }

    pub fn priority(&self) -> i32 {
        self.priority
    }

    pub fn set_priority(&mut self, priority: i32) -> bool {
        let changed = self.priority != priority;
        self.priority = priority;
        changed
    }

    pub fn security_level(&self) -> u8 {
        self.security.value()
    }

    pub fn strength(&self) -> u8 {
        self.strength
    }

    pub fn set_strength(&mut self, strength: u8) -> bool {
        let strength = strength.min(100);
        let changed = self.strength != strength;
        self.strength = strength;
        changed
    }

    pub fn managed_credentials(&self) -> bool {
        self.managed_credentials
    }

    pub fn has_ever_connected(&self) -> bool {
        self.has_ever_connected
    }

    pub fn explicitly_disconnected(&self) -> bool {
        self.explicitly_disconnected
    }

    pub fn set_explicitly_disconnected(&mut self, value: bool) {
        self.explicitly_disconnected = value;
    }

    pub fn guid(&self) -> &str {
        &self.guid
    }

    pub fn set_guid(&mut self, guid: impl Into<String>) -> bool {
        let guid = guid.into();
        let changed = self.guid != guid;
        self.guid = guid;
        changed
    }

    pub fn auto_connect_cooldown(&self) -> Duration {
        self.auto_connect_cooldown
    }

    pub fn is_throttled(&self) -> bool {
        self.reenable_auto_connect.is_some()
    }

    pub fn connection(&self) -> Option<&Connection> {
        self.connection.as_ref()
    }

    pub fn connection_mut(&mut self) -> Option<&mut Connection> {
        self.connection.as_mut()
    }

    pub fn set_connection(&mut self, connection: Option<Connection>) {
        self.connection = connection;
    }

    pub fn disconnect_count(&mut self) -> usize {
        self.disconnects.count()
    }

    pub fn misconnect_count(&mut self) -> usize {
        self.misconnects.count()
    }

    pub fn disconnect_history(&mut self) -> Vec<String> {
        self.disconnects.wall_clock_strings()
    }

    pub fn misconnect_history(&mut self) -> Vec<String> {
        self.misconnects.wall_clock_strings()
    }

    /// Whether the service dropped or failed to connect recently.
    pub fn has_recent_connection_issues(&mut self) -> bool {
        !self.disconnects.is_empty() || !self.misconnects.is_empty()
    }

    // ========================================================================
    // State machine
    // ========================================================================

    /// Move to `new_state`. Returns `None` if the state did not change.
    pub fn set_state(
        &mut self,
        new_state: ConnectState,
        dispatcher: &mut Dispatcher,
        events: EventContext,
    ) -> Option<StateTransition> {
        if new_state == self.state {
            return None;
        }
        info!(
            "Service {} ({}): state {} -> {}",
            self.unique_name, self.friendly_name, self.state, new_state
        );

        // Classification looks at the state being left. A drop that went
        // through Idle on its way to Failure counts once.
        if new_state == ConnectState::Failure {
            if !(self.state == ConnectState::Idle && self.drop_noted) {
                self.note_disconnect_event(events);
            }
        } else if new_state == ConnectState::Idle && self.state.is_active() {
            self.note_disconnect_event(events);
            self.drop_noted = true;
        }
        if new_state.is_active() {
            self.drop_noted = false;
        }

        let from = self.state;
        self.previous_state = from;
        self.state = new_state;

        if new_state != ConnectState::Failure {
            self.failure = ConnectFailure::None;
        }
        if !new_state.is_connected() {
            self.connection = None;
        }

        let mut persist = false;
        if new_state == ConnectState::Connected {
            self.has_ever_connected = true;
            self.reset_auto_connect_cooldown(dispatcher);
            persist = true;
        }

        Some(StateTransition {
            from,
            to: new_state,
            persist,
        })
    }

    /// Enter `Failure` with the given reason.
    ///
    /// Returns the transition, or `None` if the service was already failed
    /// (the reason is still updated).
    pub fn set_failure(
        &mut self,
        failure: ConnectFailure,
        dispatcher: &mut Dispatcher,
        events: EventContext,
    ) -> Option<StateTransition> {
        let transition = self.set_state(ConnectState::Failure, dispatcher, events);
        self.failure = failure;
        transition
    }

    /// Record an unexpected drop in the matching history.
    pub fn note_disconnect_event(&mut self, events: EventContext) {
        if self.explicitly_disconnected {
            debug!("Service {}: user-initiated disconnect ignored", self.unique_name);
            return;
        }
        if !events.running {
            debug!("Service {}: disconnect while stopping ignored", self.unique_name);
            return;
        }
        if events.suspending {
            debug!("Service {}: disconnect while suspending ignored", self.unique_name);
            return;
        }
        if events.offline {
            debug!("Service {}: disconnect in offline mode ignored", self.unique_name);
            return;
        }

        // Services may pass through Idle on their way to Failure.
        let state = if self.state == ConnectState::Idle {
            self.previous_state
        } else {
            self.state
        };
        if state.is_connected() {
            info!("Service {}: noting an unexpected connection drop", self.unique_name);
            self.disconnects.record_now();
        } else if state.is_connecting() {
            info!("Service {}: noting an unexpected failure to connect", self.unique_name);
            self.misconnects.record_now();
        } else {
            debug!(
                "Service {}: not connected or connecting, transition ignored",
                self.unique_name
            );
        }
    }

    // ========================================================================
    // Auto-connect
    // ========================================================================

    /// Ordered eligibility check; the first failing predicate is returned.
    pub fn is_auto_connectable(&self, context: &AutoConnectContext) -> Result<(), AutoConnectBlocker> {
        if !context.technology_allowed {
            return Err(AutoConnectBlocker::TechnologyDisabled);
        }
        if !self.connectable {
            return Err(AutoConnectBlocker::NotConnectable);
        }
        if self.is_connected() {
            return Err(AutoConnectBlocker::Connected);
        }
        if self.is_connecting() {
            return Err(AutoConnectBlocker::Connecting);
        }
        if self.explicitly_disconnected {
            return Err(AutoConnectBlocker::ExplicitlyDisconnected);
        }
        if self.reenable_auto_connect.is_some() {
            return Err(AutoConnectBlocker::Throttled);
        }
        if !self.technology.is_primary_connectivity() && !context.has_connectivity {
            return Err(AutoConnectBlocker::NoConnectivity);
        }
        Ok(())
    }

    /// Delay the next auto-connect by the current cooldown, then grow it.
    pub fn throttle_future_auto_connects(
        &mut self,
        dispatcher: &mut Dispatcher,
        min_cooldown: Duration,
        max_cooldown: Duration,
    ) {
        if !self.auto_connect_cooldown.is_zero() {
            info!(
                "Service {}: throttling future auto-connects for {} ms",
                self.unique_name,
                self.auto_connect_cooldown.as_millis()
            );
            let handle = dispatcher.post_delayed(
                Task::ReenableAutoConnect(self.id),
                self.auto_connect_cooldown,
            );
            self.reenable_auto_connect = Some(handle);
        }
        let doubled = self
            .auto_connect_cooldown
            .checked_mul(2)
            .unwrap_or(max_cooldown);
        self.auto_connect_cooldown = doubled.max(min_cooldown).min(max_cooldown);
    }

    /// Forget past failures: zero the cooldown and lift any throttle.
    pub fn reset_auto_connect_cooldown(&mut self, dispatcher: &mut Dispatcher) {
        self.auto_connect_cooldown = Duration::ZERO;
        if let Some(handle) = self.reenable_auto_connect.take() {
            dispatcher.cancel(handle);
        }
    }

    /// The reenable timer fired.
    pub fn on_reenable_auto_connect(&mut self) {
        debug!("Service {}: auto-connect reenabled", self.unique_name);
        self.reenable_auto_connect = None;
    }

    // ========================================================================
    // Persistence
    // ========================================================================

    /// Load configuration from `store`. Returns false if the store holds
    /// no group for this service.
    pub fn load(&mut self, store: &dyn Store) -> bool {
        let group = self.storage_identifier.clone();
        if !store.contains_group(&group) {
            return false;
        }

        match store.get_bool(&group, STORAGE_AUTO_CONNECT) {
            Some(auto_connect) => {
                self.auto_connect = auto_connect;
                self.retain_auto_connect = true;
            }
            None => {
                self.auto_connect = self.auto_connect_by_default;
                self.retain_auto_connect = false;
            }
        }
        self.priority = store
            .get_int(&group, STORAGE_PRIORITY)
            .map(|p| p.clamp(i64::from(i32::MIN), i64::from(i32::MAX)) as i32)
            .unwrap_or(0);
        self.guid = store.get_string(&group, STORAGE_GUID).unwrap_or_default();
        self.has_ever_connected = store
            .get_bool(&group, STORAGE_HAS_EVER_CONNECTED)
            .unwrap_or(false);
        debug!("Service {}: loaded from group {}", self.unique_name, group);
        true
    }

    /// Write configuration into `store`.
    pub fn save(&self, store: &mut dyn Store) -> bool {
        let group = self.storage_identifier.as_str();
        store.set_string(group, STORAGE_NAME, &self.friendly_name);
        store.set_string(group, STORAGE_TYPE, self.technology.as_str());
        if self.retain_auto_connect {
            store.set_bool(group, STORAGE_AUTO_CONNECT, self.auto_connect);
        } else {
            store.delete_key(group, STORAGE_AUTO_CONNECT);
        }
        if self.priority != 0 {
            store.set_int(group, STORAGE_PRIORITY, i64::from(self.priority));
        } else {
            store.delete_key(group, STORAGE_PRIORITY);
        }
        if self.guid.is_empty() {
            store.delete_key(group, STORAGE_GUID);
        } else {
            store.set_string(group, STORAGE_GUID, &self.guid);
        }
        store.set_bool(group, STORAGE_HAS_EVER_CONNECTED, self.has_ever_connected);
        true
    }

    /// Reset all configuration to its unconfigured defaults.
    pub fn unload(&mut self) {
        self.auto_connect = self.auto_connect_by_default;
        self.retain_auto_connect = false;
        self.priority = 0;
        self.guid.clear();
        self.has_ever_connected = false;
        self.explicitly_disconnected = false;
    }
}
