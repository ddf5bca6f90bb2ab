// Netpilot - Connection Manager
// Copyright (C) 2026 Christos A. Daggas
// SPDX-License-Identifier: MIT

//! The manager owns every device, service and profile and makes all
//! connection decisions.
//!
//! Everything here runs on one logical thread. Drivers report back through
//! the event channel, and work that must happen later goes through the
//! [`Dispatcher`]. Re-sorting is coalesced: any number of
//! [`Manager::sort_services`] calls within one dispatch cycle result in a
//! single sort.

use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::future::Future;
use tokio::sync::mpsc;
use tokio::time::Instant;
use tracing::{debug, error, info, warn};

use super::device::{
    ConnectCompletion, ConnectRequest, ConnectionParams, Device, DisconnectCompletion, Driver,
    DriverEvent, EventSender, TerminationCompletion, TerminationReason,
};
use super::notifier::{ChangeNotifier, PropertyChange, PropertySource, PropertyValue};
use super::profile::{Profile, ProfileIdentifier};
use super::properties;
use super::ranking::{self, RankingContext};
use super::service::{
    AutoConnectContext, Connection, EventContext, Service, ServiceSpec, StateTransition,
};
use super::termination::{TerminationActions, TerminationOutcome};
use super::{DeviceId, ProfileId, ServiceId};
use crate::models::{
    ConnectFailure, ConnectState, Error, ManagerConfig, Result, Technology, DEFAULT_PROFILE_NAME,
};
use crate::scheduler::{Dispatcher, PendingTask, Task};
use crate::storage::{
    FileStorageProvider, MemoryStorageProvider, OpenMode, StorageProvider,
};

/// Routing metric of the best connected service.
pub const METRIC_BASE: u32 = 1000;

/// Metric increment between consecutive connected services.
pub const METRIC_STEP: u32 = 1;

// Manager properties
pub const PROP_ACTIVE_PROFILE: &str = "ActiveProfile";
pub const PROP_PROFILES: &str = "Profiles";
pub const PROP_SERVICES: &str = "Services";
pub const PROP_DEFAULT_SERVICE: &str = "DefaultService";
pub const PROP_DEFAULT_PHYSICAL_SERVICE: &str = "DefaultPhysicalService";
pub const PROP_DEFAULT_TECHNOLOGY: &str = "DefaultTechnology";
pub const PROP_CONNECTED_TECHNOLOGIES: &str = "ConnectedTechnologies";
pub const PROP_STATE: &str = "State";
pub const PROP_TECHNOLOGY_ORDER: &str = "TechnologyOrder";
pub const PROP_AVAILABLE_TECHNOLOGIES: &str = "AvailableTechnologies";
pub const PROP_ENABLED_TECHNOLOGIES: &str = "EnabledTechnologies";
pub const PROP_DEVICES: &str = "Devices";
pub const PROP_OFFLINE_MODE: &str = "OfflineMode";

const EPHEMERAL_PROFILE_ID: ProfileId = ProfileId(0);

/// What woke the run loop.
enum Wake {
    Shutdown,
    Event(Option<DriverEvent>),
    Timer,
}

fn owning_profile<'a>(
    profiles: &'a mut [Profile],
    ephemeral: &'a mut Profile,
    id: ProfileId,
) -> Option<&'a mut Profile> {
    if ephemeral.id() == id {
        return Some(ephemeral);
    }
    profiles.iter_mut().find(|p| p.id() == id)
}

async fn sleep_until_deadline(deadline: Option<Instant>) {
    match deadline {
        Some(deadline) => tokio::time::sleep_until(deadline).await,
        None => std::future::pending::<()>().await,
    }
}

/// Values last announced to subscribers, so only changes are emitted.
#[derive(Debug, Default)]
struct Announced {
    services: Vec<String>,
    connected_technologies: Vec<String>,
    default_technology: String,
    state: String,
}

/// The connection manager.
pub struct Manager {
    config: ManagerConfig,
    dispatcher: Dispatcher,
    sort_task: PendingTask,
    connect_best_task: PendingTask,

    devices: Vec<Device>,
    services: Vec<Service>,
    /// Index 0 is the bottom of the stack.
    profiles: Vec<Profile>,
    ephemeral: Profile,
    storage: Box<dyn StorageProvider>,

    technology_order: Vec<Technology>,
    auto_connect_disabled: BTreeSet<Technology>,
    auto_connect_enabled: bool,
    offline_mode: bool,
    device_blacklist: BTreeSet<String>,

    default_logical: Option<ServiceId>,
    default_physical: Option<ServiceId>,

    running: bool,
    suspending: bool,
    dark_resume: bool,
    termination: TerminationActions,
    last_termination: Option<TerminationOutcome>,

    events_tx: EventSender,
    events_rx: mpsc::UnboundedReceiver<DriverEvent>,
    notifier: ChangeNotifier,
    announced: Announced,

    next_service_serial: u64,
    next_profile_id: u64,
    next_device_id: u64,
}

impl Manager {
    /// Create a manager with the storage backend selected by `config`.
    pub fn new(config: ManagerConfig) -> Result<Self> {
        let storage: Box<dyn StorageProvider> = if config.in_memory_storage {
            Box::new(MemoryStorageProvider::new())
        } else {
            Box::new(FileStorageProvider::new(
                config.resolved_storage_dir(),
                config.resolved_user_storage_dir(),
            ))
        };
        Self::with_storage(config, storage)
    }

    /// Create a manager on top of an explicit storage provider.
    pub fn with_storage(config: ManagerConfig, storage: Box<dyn StorageProvider>) -> Result<Self> {
        let technology_order = Technology::parse_list(&config.technology_order)?;
        let (tx, rx) = mpsc::unbounded_channel();
        Ok(Self {
            auto_connect_disabled: config.auto_connect.disabled_technologies.iter().copied().collect(),
            auto_connect_enabled: config.auto_connect.enabled,
            offline_mode: config.offline_mode,
            device_blacklist: config.device_blacklist.iter().cloned().collect(),
            config,
            dispatcher: Dispatcher::new(),
            sort_task: PendingTask::new(),
            connect_best_task: PendingTask::new(),
            devices: Vec::new(),
            services: Vec::new(),
            profiles: Vec::new(),
            ephemeral: Profile::new_ephemeral(EPHEMERAL_PROFILE_ID),
            storage,
            technology_order,
            default_logical: None,
            default_physical: None,
            running: false,
            suspending: false,
            dark_resume: false,
            termination: TerminationActions::new(),
            last_termination: None,
            events_tx: EventSender::new(tx),
            events_rx: rx,
            notifier: ChangeNotifier::new(),
            announced: Announced::default(),
            next_service_serial: 1,
            next_profile_id: 1,
            next_device_id: 1,
        })
    }

    // ========================================================================
    // Lifecycle
    // ========================================================================

    /// Open the default profile and start making decisions.
    pub fn start(&mut self) -> Result<()> {
        if self.running {
            return Ok(());
        }
        if self.profiles.is_empty() {
            let ident = ProfileIdentifier::machine(DEFAULT_PROFILE_NAME);
            let store = self.storage.open(&ident, OpenMode::CreateOrOpen)?;
            let id = self.allocate_profile_id();
            self.push_profile_internal(Profile::new(id, ident, store));
        }
        self.running = true;
        info!("Manager started");
        self.notifier.emit(PropertySource::Manager, "Running", true);
        self.sort_services();
        Ok(())
    }

    /// Persist everything and disconnect all services.
    pub fn stop(&mut self) {
        if !self.running {
            return;
        }
        self.running = false;
        self.sort_task.cancel(&mut self.dispatcher);
        self.connect_best_task.cancel(&mut self.dispatcher);

        for idx in 0..self.services.len() {
            self.persist_service(idx);
        }
        for profile in &mut self.profiles {
            if let Err(e) = profile.save() {
                error!("Failed to save profile {}: {}", profile.name(), e);
            }
        }

        let active: Vec<ServiceId> = self
            .services
            .iter()
            .filter(|s| s.is_active())
            .map(|s| s.id())
            .collect();
        for id in active {
            if let Err(e) = self.request_disconnect(id) {
                warn!("Failed to disconnect {} on stop: {}", id, e);
            }
        }
        for service in &mut self.services {
            service.reset_auto_connect_cooldown(&mut self.dispatcher);
        }

        info!("Manager stopped");
        self.notifier.emit(PropertySource::Manager, "Running", false);
    }

    /// Run shutdown termination actions, then stop.
    pub async fn shutdown(&mut self) {
        self.start_termination(TerminationReason::Shutdown);
        while self.termination.is_running() {
            let deadline = self.dispatcher.next_deadline();
            let wake = tokio::select! {
                event = self.events_rx.recv() => Wake::Event(event),
                _ = sleep_until_deadline(deadline) => Wake::Timer,
            };
            match wake {
                Wake::Event(Some(event)) => self.handle_driver_event(event),
                Wake::Timer => {
                    self.run_due_tasks();
                }
                Wake::Event(None) | Wake::Shutdown => break,
            }
        }
        self.stop();
    }

    /// Process events and timers until `shutdown` resolves.
    pub async fn run<F>(&mut self, shutdown: F)
    where
        F: Future<Output = ()>,
    {
        tokio::pin!(shutdown);
        loop {
            let deadline = self.dispatcher.next_deadline();
            let wake = tokio::select! {
                biased;
                _ = &mut shutdown => Wake::Shutdown,
                event = self.events_rx.recv() => Wake::Event(event),
                _ = sleep_until_deadline(deadline) => Wake::Timer,
            };
            match wake {
                Wake::Shutdown => {
                    info!("Shutdown requested");
                    break;
                }
                Wake::Event(Some(event)) => self.handle_driver_event(event),
                Wake::Event(None) => break,
                Wake::Timer => {
                    self.run_due_tasks();
                }
            }
        }
    }

    /// Handle every queued event and due task without waiting.
    pub fn dispatch_pending(&mut self) {
        loop {
            let mut progressed = false;
            while let Ok(event) = self.events_rx.try_recv() {
                self.handle_driver_event(event);
                progressed = true;
            }
            progressed |= self.run_due_tasks();
            if !progressed {
                break;
            }
        }
    }

    fn run_due_tasks(&mut self) -> bool {
        let mut ran = false;
        while let Some((_, task)) = self.dispatcher.pop_due(Instant::now()) {
            self.run_task(task);
            ran = true;
        }
        ran
    }

    fn run_task(&mut self, task: Task) {
        match task {
            Task::SortServices => {
                self.sort_task.clear();
                self.sort_services_task();
            }
            Task::ReenableAutoConnect(id) => {
                if let Some(idx) = self.index_of(id) {
                    self.services[idx].on_reenable_auto_connect();
                    self.sort_services();
                }
            }
            Task::ConnectToBestServices => {
                self.connect_best_task.clear();
                self.connect_to_best_services_task();
            }
            Task::TerminationTimeout => {
                if let Some(outcome) = self.termination.on_timeout() {
                    self.on_termination_finished(outcome);
                }
            }
        }
    }

    pub fn is_running(&self) -> bool {
        self.running
    }

    pub fn config(&self) -> &ManagerConfig {
        &self.config
    }

    /// Events posted here are handled on the manager's thread.
    pub fn event_sender(&self) -> EventSender {
        self.events_tx.clone()
    }

    pub fn subscribe(&mut self) -> mpsc::UnboundedReceiver<PropertyChange> {
        self.notifier.subscribe()
    }

    pub fn is_sort_pending(&self) -> bool {
        self.sort_task.is_pending(&self.dispatcher)
    }

    // ========================================================================
    // Devices
    // ========================================================================

    /// Register a driver. It is offered the storage of every pushed profile
    /// so it can instantiate remembered services. Drivers bound to a
    /// blacklisted link are refused.
    pub fn register_device(&mut self, driver: Box<dyn Driver>) -> Result<DeviceId> {
        if let Some(link) = driver.link_name() {
            if self.device_blacklist.contains(link) {
                info!("Not managing blacklisted {} device on {}", driver.technology(), link);
                return Err(Error::DeviceBlacklisted(link.to_string()));
            }
        }
        let id = DeviceId(self.next_device_id);
        self.next_device_id += 1;
        info!("Registering {} device {}", driver.technology(), id);
        self.devices.push(Device::new(id, driver));

        let mut specs = Vec::new();
        if let Some(device) = self.devices.last_mut() {
            for profile in &self.profiles {
                specs.extend(device.driver_mut().remembered_services(profile.store()));
            }
        }
        self.register_remembered(id, specs);
        self.announce_devices();
        Ok(id)
    }

    /// Remove a device and every service it provides.
    pub fn deregister_device(&mut self, id: DeviceId) -> Result<()> {
        let pos = self
            .devices
            .iter()
            .position(|d| d.id() == id)
            .ok_or_else(|| Error::DeviceNotFound(id.to_string()))?;
        let owned: Vec<ServiceId> = self
            .services
            .iter()
            .filter(|s| s.device() == id)
            .map(|s| s.id())
            .collect();
        for service in owned {
            self.deregister_service(service)?;
        }
        self.devices.remove(pos);
        if let Some(outcome) = self.termination.forget_device(id, &mut self.dispatcher) {
            self.on_termination_finished(outcome);
        }
        info!("Deregistered device {}", id);
        self.announce_devices();
        Ok(())
    }

    /// Offer a kernel link to the drivers. Returns the claiming device.
    /// Blacklisted links are never offered.
    pub fn claim_link(&mut self, link_name: &str) -> Option<DeviceId> {
        if self.device_blacklist.contains(link_name) {
            debug!("Link {} is blacklisted", link_name);
            return None;
        }
        let claimed = self
            .devices
            .iter_mut()
            .find_map(|d| d.offer_link(link_name).then(|| d.id()));
        match claimed {
            Some(id) => info!("Link {} claimed by {}", link_name, id),
            None => debug!("No driver claimed link {}", link_name),
        }
        claimed
    }

    /// Release a previously claimed link.
    pub fn release_link(&mut self, link_name: &str) -> bool {
        self.devices.iter_mut().any(|d| d.release_link(link_name))
    }

    /// Stop managing a kernel link. Any existing claim is released.
    pub fn add_device_to_blacklist(&mut self, link_name: &str) {
        if !self.device_blacklist.insert(link_name.to_string()) {
            return;
        }
        info!("Blacklisted link {}", link_name);
        for device in &mut self.devices {
            device.release_link(link_name);
        }
    }

    pub fn is_device_blacklisted(&self, link_name: &str) -> bool {
        self.device_blacklist.contains(link_name)
    }

    /// Devices of one technology, in registration order.
    pub fn devices_by_technology(&self, technology: Technology) -> Vec<DeviceId> {
        self.devices
            .iter()
            .filter(|d| d.technology() == technology)
            .map(|d| d.id())
            .collect()
    }

    pub fn device_ids(&self) -> Vec<String> {
        self.devices.iter().map(|d| d.id().to_string()).collect()
    }

    /// Technologies with at least one registered device.
    pub fn available_technologies(&self) -> Vec<String> {
        Technology::ALL
            .iter()
            .filter(|t| !self.devices_by_technology(**t).is_empty())
            .map(|t| t.as_str().to_string())
            .collect()
    }

    /// Available technologies allowed to connect: none in offline mode,
    /// otherwise those whose auto-connect is not disabled.
    pub fn enabled_technologies(&self) -> Vec<String> {
        if self.offline_mode {
            return Vec::new();
        }
        self.available_technologies()
            .into_iter()
            .filter(|name| !self.auto_connect_disabled.contains(&Technology::from_name(name)))
            .collect()
    }

    fn announce_devices(&mut self) {
        let devices = self.device_ids();
        let available = self.available_technologies();
        let enabled = self.enabled_technologies();
        self.notifier.emit(PropertySource::Manager, PROP_DEVICES, devices);
        self.notifier
            .emit(PropertySource::Manager, PROP_AVAILABLE_TECHNOLOGIES, available);
        self.notifier
            .emit(PropertySource::Manager, PROP_ENABLED_TECHNOLOGIES, enabled);
    }

    fn device_mut(&mut self, id: DeviceId) -> Result<&mut Device> {
        self.devices
            .iter_mut()
            .find(|d| d.id() == id)
            .ok_or_else(|| Error::DeviceNotFound(id.to_string()))
    }

    // ========================================================================
    // Service registry
    // ========================================================================

    /// Register a driver-discovered service and bind it to a profile.
    pub fn register_service(&mut self, device: DeviceId, spec: ServiceSpec) -> Result<ServiceId> {
        let technology = self
            .devices
            .iter()
            .find(|d| d.id() == device)
            .map(|d| d.technology())
            .ok_or_else(|| Error::DeviceNotFound(device.to_string()))?;
        if self
            .services
            .iter()
            .any(|s| s.device() == device && s.storage_identifier() == spec.storage_identifier)
        {
            return Err(Error::ServiceAlreadyRegistered(spec.storage_identifier));
        }

        let id = ServiceId(self.next_service_serial);
        self.next_service_serial += 1;
        let service = Service::new(id, device, technology, spec, self.ephemeral.id());
        debug!("Registering service {} ({})", id, service.storage_identifier());
        self.services.push(service);

        let idx = self.services.len() - 1;
        if !self.match_profile_with_service(idx) {
            self.adopt_into_ephemeral(idx);
        }
        self.sort_services();
        Ok(id)
    }

    /// Remove a service from the registry.
    pub fn deregister_service(&mut self, id: ServiceId) -> Result<()> {
        let idx = self.service_index(id)?;
        let mut service = self.services.remove(idx);
        service.reset_auto_connect_cooldown(&mut self.dispatcher);
        if service.is_active() {
            let device = service.device();
            let events = self.events_tx.clone();
            if let Ok(device) = self.device_mut(device) {
                if let Err(e) = device
                    .driver_mut()
                    .disconnect(id, DisconnectCompletion::new(id, events))
                {
                    warn!("Failed to disconnect deregistered service {}: {}", id, e);
                }
            }
        }
        info!("Deregistered service {} ({})", id, service.friendly_name());
        self.sort_services();
        Ok(())
    }

    pub fn find_service(&self, id: ServiceId) -> Option<&Service> {
        self.services.iter().find(|s| s.id() == id)
    }

    pub fn find_service_by_storage_id(&self, storage_identifier: &str) -> Option<&Service> {
        self.services
            .iter()
            .find(|s| s.storage_identifier() == storage_identifier)
    }

    /// Services in ranking order as of the last sort.
    pub fn services(&self) -> impl Iterator<Item = &Service> {
        self.services.iter()
    }

    pub fn service_count(&self) -> usize {
        self.services.len()
    }

    fn index_of(&self, id: ServiceId) -> Option<usize> {
        self.services.iter().position(|s| s.id() == id)
    }

    fn service_index(&self, id: ServiceId) -> Result<usize> {
        self.index_of(id)
            .ok_or_else(|| Error::ServiceNotFound(id.to_string()))
    }

    fn register_remembered(&mut self, device: DeviceId, specs: Vec<ServiceSpec>) {
        for spec in specs {
            let already = self.services.iter().any(|s| {
                s.device() == device && s.storage_identifier() == spec.storage_identifier
            });
            if already {
                continue;
            }
            let storage_identifier = spec.storage_identifier.clone();
            match self.register_service(device, spec) {
                Ok(id) => info!("Created remembered service {} ({})", id, storage_identifier),
                Err(e) => warn!("Failed to create remembered service {}: {}", storage_identifier, e),
            }
        }
    }

    // ========================================================================
    // Profiles
    // ========================================================================

    fn allocate_profile_id(&mut self) -> ProfileId {
        let id = ProfileId(self.next_profile_id);
        self.next_profile_id += 1;
        id
    }


    fn profile_name(&self, id: ProfileId) -> String {
        if self.ephemeral.id() == id {
            return self.ephemeral.name();
        }
        self.profiles
            .iter()
            .find(|p| p.id() == id)
            .map(|p| p.name())
            .unwrap_or_default()
    }

    /// Name of the profile at the top of the stack.
    pub fn active_profile_name(&self) -> Option<String> {
        self.profiles.last().map(|p| p.name())
    }

    /// Names of all pushed profiles, bottom first.
    pub fn profile_names(&self) -> Vec<String> {
        self.profiles.iter().map(|p| p.name()).collect()
    }

    /// Name of the profile owning a service.
    pub fn service_profile_name(&self, id: ServiceId) -> Result<String> {
        let idx = self.service_index(id)?;
        Ok(self.profile_name(self.services[idx].profile()))
    }

    /// Create profile storage without pushing it.
    pub fn create_profile(&mut self, name: &str) -> Result<String> {
        let ident = ProfileIdentifier::parse(name)?;
        let store = self.storage.open(&ident, OpenMode::CreateNew)?;
        let mut profile = Profile::new(ProfileId(u64::MAX), ident, store);
        profile.save()?;
        info!("Created profile {}", profile.name());
        Ok(profile.name())
    }

    /// Delete profile storage. The profile must not be on the stack.
    pub fn remove_profile(&mut self, name: &str) -> Result<()> {
        let ident = ProfileIdentifier::parse(name)?;
        if self.profiles.iter().any(|p| *p.identifier() == ident) {
            return Err(Error::ProfileInUse(ident.to_string()));
        }
        self.storage.remove(&ident)?;
        info!("Removed profile {}", ident);
        Ok(())
    }

    /// Open an existing profile and push it on top of the stack.
    pub fn push_profile(&mut self, name: &str) -> Result<String> {
        let ident = ProfileIdentifier::parse(name)?;
        if self.profiles.iter().any(|p| *p.identifier() == ident) {
            return Err(Error::ProfileAlreadyOnStack(ident.to_string()));
        }
        if !ident.is_user() && self.profiles.last().map_or(false, |p| p.is_user()) {
            return Err(Error::MachineProfileAboveUser(ident.to_string()));
        }
        let store = self.storage.open(&ident, OpenMode::OpenExisting)?;
        let id = self.allocate_profile_id();
        self.push_profile_internal(Profile::new(id, ident.clone(), store));
        Ok(ident.to_string())
    }

    fn push_profile_internal(&mut self, profile: Profile) {
        info!("Pushing profile {}", profile.name());
        self.profiles.push(profile);
        let top = self.profiles.len() - 1;

        // Offer every registered service to the new profile.
        let mut changed = Vec::new();
        for service in &mut self.services {
            let before = service.profile();
            if self.profiles[top].configure_service(service) && before != service.profile() {
                changed.push(service.id());
            }
        }
        let top_name = self.profiles[top].name();
        for id in changed {
            info!("Service {} now configured by profile {}", id, top_name);
            self.notifier.emit(
                PropertySource::Service(id),
                properties::PROFILE,
                top_name.as_str(),
            );
        }

        // Let drivers instantiate services remembered in the new profile.
        let mut remembered = Vec::new();
        for device in &mut self.devices {
            let specs = device.driver_mut().remembered_services(self.profiles[top].store());
            remembered.push((device.id(), specs));
        }
        for (device, specs) in remembered {
            self.register_remembered(device, specs);
        }

        self.announce_profiles();
        self.sort_services();
    }

    /// Pop the active profile. With a name, it must match the top.
    pub fn pop_profile(&mut self, name: Option<&str>) -> Result<()> {
        let top = self
            .profiles
            .last()
            .ok_or_else(|| Error::ProfileNotFound("profile stack is empty".into()))?;
        if let Some(name) = name {
            let ident = ProfileIdentifier::parse(name)?;
            if *top.identifier() != ident {
                return Err(Error::NotActiveProfile(ident.to_string()));
            }
        }
        if self.profiles.len() == 1 {
            return Err(Error::ProfileStackBottom);
        }
        self.pop_profile_internal();
        Ok(())
    }

    /// Pop every user profile off the stack.
    pub fn pop_all_user_profiles(&mut self) -> usize {
        let mut popped = 0;
        while self.profiles.len() > 1 && self.profiles.last().map_or(false, |p| p.is_user()) {
            self.pop_profile_internal();
            popped += 1;
        }
        popped
    }

    fn pop_profile_internal(&mut self) {
        let Some(mut departing) = self.profiles.pop() else {
            return;
        };
        info!("Popping profile {}", departing.name());
        let departing_id = departing.id();

        let owned: Vec<ServiceId> = self
            .services
            .iter()
            .filter(|s| s.profile() == departing_id)
            .map(|s| s.id())
            .collect();
        for idx in 0..self.services.len() {
            if self.services[idx].profile() == departing_id {
                if let Err(e) = departing.update_service(&self.services[idx]) {
                    warn!("Failed to save {} into departing profile: {}", self.services[idx].id(), e);
                }
            }
        }
        if let Err(e) = departing.save() {
            warn!("Failed to save departing profile {}: {}", departing.name(), e);
        }

        for service in &mut self.services {
            service.set_explicitly_disconnected(false);
        }

        for id in owned {
            let Some(idx) = self.index_of(id) else {
                continue;
            };
            self.services[idx].unload();
            if self.match_profile_with_service(idx) {
                let name = self.profile_name(self.services[idx].profile());
                self.notifier
                    .emit(PropertySource::Service(id), properties::PROFILE, name);
            } else {
                info!("Service {} has no remaining profile; unloading", id);
                if let Err(e) = self.deregister_service(id) {
                    warn!("Failed to deregister {}: {}", id, e);
                }
            }
        }

        self.announce_profiles();
        self.sort_services();
    }

    /// Walk the stack top-down; the first profile that can configure the
    /// service from stored data takes it.
    fn match_profile_with_service(&mut self, idx: usize) -> bool {
        let service = &mut self.services[idx];
        self.profiles
            .iter()
            .rev()
            .any(|profile| profile.configure_service(service))
    }

    fn adopt_into_ephemeral(&mut self, idx: usize) {
        if let Err(e) = self.ephemeral.adopt_service(&mut self.services[idx]) {
            warn!("Ephemeral profile failed to adopt service: {}", e);
        }
    }

    /// Move a service's configuration to a pushed profile.
    pub fn move_service_to_profile(&mut self, id: ServiceId, profile_name: &str) -> Result<()> {
        let ident = ProfileIdentifier::parse(profile_name)?;
        let idx = self.service_index(id)?;
        let target = self
            .profiles
            .iter()
            .position(|p| *p.identifier() == ident)
            .ok_or_else(|| Error::ProfileNotFound(ident.to_string()))?;
        let from = self.services[idx].profile();
        if self.profiles[target].id() == from {
            return Ok(());
        }

        self.profiles[target].adopt_service(&mut self.services[idx])?;
        // The handle has already moved; only the stored group goes
        if let Some(previous) = owning_profile(&mut self.profiles, &mut self.ephemeral, from) {
            previous.abandon_service(&self.services[idx])?;
        }
        let name = self.profiles[target].name();
        info!("Moved service {} to profile {}", id, name);
        self.notifier
            .emit(PropertySource::Service(id), properties::PROFILE, name);
        self.sort_services();
        Ok(())
    }

    fn announce_profiles(&mut self) {
        let names = self.profile_names();
        let active = self.active_profile_name().unwrap_or_default();
        self.notifier.emit(PropertySource::Manager, PROP_PROFILES, names);
        self.notifier
            .emit(PropertySource::Manager, PROP_ACTIVE_PROFILE, active);
    }

    fn profile_positions(&self) -> HashMap<ProfileId, usize> {
        self.profiles
            .iter()
            .enumerate()
            .map(|(pos, p)| (p.id(), pos))
            .collect()
    }

    /// Save a service into its owning profile.
    fn persist_service(&mut self, idx: usize) {
        let service = &self.services[idx];
        let Some(profile) =
            owning_profile(&mut self.profiles, &mut self.ephemeral, service.profile())
        else {
            warn!("Service {} has no owning profile", service.id());
            return;
        };
        if let Err(e) = profile.update_service(service) {
            error!("Failed to persist service {}: {}", service.id(), e);
        }
    }

    // ========================================================================
    // State transitions
    // ========================================================================

    fn event_context(&self) -> EventContext {
        EventContext {
            running: self.running,
            suspending: self.suspending,
            offline: self.offline_mode,
        }
    }

    fn apply_state(&mut self, idx: usize, state: ConnectState) {
        let events = self.event_context();
        let transition = self.services[idx].set_state(state, &mut self.dispatcher, events);
        self.after_transition(idx, transition);
    }

    fn apply_failure(&mut self, idx: usize, failure: ConnectFailure) {
        let events = self.event_context();
        let transition = self.services[idx].set_failure(failure, &mut self.dispatcher, events);
        if transition.is_none() {
            let id = self.services[idx].id();
            self.notifier
                .emit(PropertySource::Service(id), properties::ERROR, failure.as_str());
        }
        self.after_transition(idx, transition);
    }

    fn after_transition(&mut self, idx: usize, transition: Option<StateTransition>) {
        let Some(transition) = transition else {
            return;
        };
        if transition.persist {
            self.persist_service(idx);
        }
        let service = &self.services[idx];
        let id = service.id();
        let failure = service.failure();
        self.notifier
            .emit(PropertySource::Service(id), properties::STATE, transition.to.as_str());
        self.notifier
            .emit(PropertySource::Service(id), properties::ERROR, failure.as_str());
        self.sort_services();
    }

    /// Route a driver signal to its handler.
    pub fn handle_driver_event(&mut self, event: DriverEvent) {
        debug!("Driver event {:?}", event);
        match event {
            DriverEvent::ConnectResult { service, result } => self.on_connect_result(service, result),
            DriverEvent::Disconnected { service } => {
                if let Some(idx) = self.index_of(service) {
                    self.apply_state(idx, ConnectState::Idle);
                }
            }
            DriverEvent::LinkUp { service } => {
                if let Some(idx) = self.index_of(service) {
                    if self.services[idx].state() == ConnectState::Associating {
                        self.apply_state(idx, ConnectState::Configuring);
                    }
                }
            }
            DriverEvent::LinkDown { service } => {
                if let Some(idx) = self.index_of(service) {
                    if self.services[idx].is_active() {
                        self.apply_state(idx, ConnectState::Idle);
                    }
                }
            }
            DriverEvent::ConnectivityResult { service, state } => {
                if let Some(idx) = self.index_of(service) {
                    if self.services[idx].is_connected() && state.is_connected() {
                        self.apply_state(idx, state);
                    } else {
                        debug!("Ignoring connectivity result {} for {}", state, service);
                    }
                }
            }
            DriverEvent::StrengthChanged { service, strength } => {
                if let Some(idx) = self.index_of(service) {
                    if self.services[idx].set_strength(strength) {
                        let value = self.services[idx].strength();
                        self.notifier
                            .emit(PropertySource::Service(service), properties::STRENGTH, value);
                        self.sort_services();
                    }
                }
            }
            DriverEvent::TerminationDone { device } => {
                if let Some(outcome) = self.termination.device_done(device, &mut self.dispatcher) {
                    self.on_termination_finished(outcome);
                }
            }
        }
    }

    fn on_connect_result(
        &mut self,
        id: ServiceId,
        result: std::result::Result<ConnectionParams, ConnectFailure>,
    ) {
        let Some(idx) = self.index_of(id) else {
            debug!("Connect result for unknown service {}", id);
            return;
        };
        if !self.services[idx].is_connecting() {
            debug!("Service {} is no longer connecting; result ignored", id);
            return;
        }
        match result {
            Ok(params) => {
                self.apply_state(idx, ConnectState::Connected);
                self.services[idx].set_connection(Some(Connection {
                    name_servers: params.name_servers,
                    ..Connection::default()
                }));
            }
            Err(failure) => {
                let failure = if failure.is_failure() {
                    failure
                } else {
                    ConnectFailure::Unknown
                };
                info!("Service {} failed to connect: {}", id, failure);
                self.apply_failure(idx, failure);
            }
        }
    }

    // ========================================================================
    // Sorting and auto-connect
    // ========================================================================

    /// Request a re-sort. Coalesced with any sort already pending.
    pub fn sort_services(&mut self) {
        if !self.sort_task.post(&mut self.dispatcher, Task::SortServices) {
            debug!("Sort already pending");
        }
    }

    fn sort_services_task(&mut self) {
        debug!("Sorting {} services", self.services.len());
        let positions = self.profile_positions();
        let ctx = RankingContext {
            technology_order: &self.technology_order,
            profile_positions: &positions,
            compare_connectivity_state: self.config.connectivity_aware_sorting,
        };
        ranking::sort(&mut self.services, &ctx);

        self.assign_metrics();
        self.update_default_services();
        self.announce_manager_properties();
        self.auto_connect();
    }

    fn assign_metrics(&mut self) {
        let mut metric = METRIC_BASE;
        let mut found_physical = false;
        let mut found_dns = false;
        for service in &mut self.services {
            let is_tunnel = service.technology().is_tunnel();
            let Some(connection) = service.connection_mut() else {
                continue;
            };
            connection.metric = metric;
            metric += METRIC_STEP;

            connection.is_primary_physical = !found_physical && !is_tunnel;
            found_physical |= connection.is_primary_physical;

            connection.use_dns = !found_dns && !connection.name_servers.is_empty();
            found_dns |= connection.use_dns;
        }
    }

    fn update_default_services(&mut self) {
        let logical = self
            .services
            .iter()
            .find(|s| s.is_connected())
            .map(|s| s.id());
        let physical = self
            .services
            .iter()
            .find(|s| s.is_connected() && !s.technology().is_tunnel())
            .map(|s| s.id());

        if logical != self.default_logical {
            info!(
                "Default service changed: {:?} -> {:?}",
                self.default_logical, logical
            );
            self.default_logical = logical;
            let name = logical.map(|id| id.to_string()).unwrap_or_default();
            self.notifier
                .emit(PropertySource::Manager, PROP_DEFAULT_SERVICE, name);
        }
        if physical != self.default_physical {
            info!(
                "Default physical service changed: {:?} -> {:?}",
                self.default_physical, physical
            );
            self.default_physical = physical;
            let name = physical.map(|id| id.to_string()).unwrap_or_default();
            self.notifier
                .emit(PropertySource::Manager, PROP_DEFAULT_PHYSICAL_SERVICE, name);
        }
    }

    fn announce_manager_properties(&mut self) {
        let services: Vec<String> = self.services.iter().map(|s| s.id().to_string()).collect();
        if services != self.announced.services {
            self.announced.services = services.clone();
            self.notifier
                .emit(PropertySource::Manager, PROP_SERVICES, services);
        }

        let connected = self.connected_technologies();
        if connected != self.announced.connected_technologies {
            self.announced.connected_technologies = connected.clone();
            self.notifier
                .emit(PropertySource::Manager, PROP_CONNECTED_TECHNOLOGIES, connected);
        }

        let default_technology = self.default_technology();
        if default_technology != self.announced.default_technology {
            self.announced.default_technology = default_technology.clone();
            self.notifier
                .emit(PropertySource::Manager, PROP_DEFAULT_TECHNOLOGY, default_technology);
        }

        let state = self.state().to_string();
        if state != self.announced.state {
            self.announced.state = state.clone();
            self.notifier.emit(PropertySource::Manager, PROP_STATE, state);
        }
    }

    fn auto_connect(&mut self) {
        if !self.auto_connect_enabled {
            info!("Auto-connect suppressed: disabled");
            return;
        }
        if !self.running {
            debug!("Auto-connect suppressed: not running");
            return;
        }
        if self.offline_mode {
            debug!("Auto-connect suppressed: offline mode");
            return;
        }
        if self.suspending && !self.dark_resume {
            info!("Auto-connect suppressed: suspending");
            return;
        }
        if self.services.is_empty() {
            debug!("Auto-connect skipped: no services");
            return;
        }

        let has_connectivity = self.services.iter().any(|s| s.is_connected());
        let min_cooldown = self.config.auto_connect.min_cooldown();
        let candidates: Vec<ServiceId> = self
            .services
            .iter()
            .filter(|s| s.auto_connect())
            .map(|s| s.id())
            .collect();

        for id in candidates {
            let Some(idx) = self.index_of(id) else {
                continue;
            };
            let technology = self.services[idx].technology();
            let ctx = AutoConnectContext {
                technology_allowed: !self.auto_connect_disabled.contains(&technology),
                has_connectivity,
            };
            if let Err(blocker) = self.services[idx].is_auto_connectable(&ctx) {
                if blocker.is_quiet() {
                    debug!("Auto-connect of {} suppressed: {}", id, blocker);
                } else {
                    info!("Auto-connect of {} suppressed: {}", id, blocker);
                }
                continue;
            }

            info!("Auto-connecting to service {}", id);
            let max_cooldown = self.config.auto_connect.max_cooldown(technology);
            self.services[idx].throttle_future_auto_connects(
                &mut self.dispatcher,
                min_cooldown,
                max_cooldown,
            );
            if let Err(e) = self.start_connect(idx) {
                warn!("Auto-connect of {} failed to start: {}", id, e);
            }
        }
    }

    fn start_connect(&mut self, idx: usize) -> Result<()> {
        let service = &self.services[idx];
        let request = ConnectRequest {
            service: service.id(),
            storage_identifier: service.storage_identifier().to_string(),
            technology: service.technology(),
        };
        let device_id = service.device();
        let completion = ConnectCompletion::new(request.service, self.events_tx.clone());
        self.device_mut(device_id)?
            .driver_mut()
            .connect(request, completion)?;
        self.apply_state(idx, ConnectState::Associating);
        Ok(())
    }

    fn request_disconnect(&mut self, id: ServiceId) -> Result<()> {
        let idx = self.service_index(id)?;
        let device_id = self.services[idx].device();
        let completion = DisconnectCompletion::new(id, self.events_tx.clone());
        self.device_mut(device_id)?
            .driver_mut()
            .disconnect(id, completion)
    }

    /// Explicitly connect the best service of each technology.
    pub fn connect_to_best_services(&mut self) -> Result<()> {
        self.check_can_connect()?;
        if !self
            .connect_best_task
            .post(&mut self.dispatcher, Task::ConnectToBestServices)
        {
            debug!("Connect to best services already pending");
        }
        Ok(())
    }

    fn check_can_connect(&self) -> Result<()> {
        if !self.running {
            return Err(Error::NotRunning);
        }
        if self.offline_mode {
            return Err(Error::OfflineMode);
        }
        Ok(())
    }

    fn connect_to_best_services_task(&mut self) {
        if let Err(e) = self.check_can_connect() {
            debug!("Connect to best services dropped: {}", e);
            return;
        }
        let positions = self.profile_positions();
        let ctx = RankingContext {
            technology_order: &self.technology_order,
            profile_positions: &positions,
            compare_connectivity_state: false,
        };
        let mut order: Vec<usize> = (0..self.services.len()).collect();
        order.sort_by(|&a, &b| ranking::compare(&self.services[a], &self.services[b], &ctx));
        let order: Vec<ServiceId> = order.into_iter().map(|i| self.services[i].id()).collect();

        let is_connected = self.services.iter().any(|s| s.is_connected());
        let mut connecting_technologies = BTreeSet::new();
        for id in order {
            let Some(idx) = self.index_of(id) else {
                continue;
            };
            let service = &self.services[idx];
            if !service.connectable() {
                // Nothing ranked below is connectable either
                break;
            }
            if !service.auto_connect() || service.explicitly_disconnected() {
                continue;
            }
            let technology = service.technology();
            if !technology.is_primary_connectivity() && !is_connected {
                continue;
            }
            if !connecting_technologies.insert(technology) {
                continue;
            }
            if !service.is_connected() && !service.is_connecting() {
                info!("Connecting to best {} service {}", technology, id);
                if let Err(e) = self.start_connect(idx) {
                    warn!("Failed to connect {}: {}", id, e);
                }
            }
        }
        self.sort_services();
    }

    // ========================================================================
    // User operations
    // ========================================================================

    /// User-initiated connect.
    pub fn connect_service(&mut self, id: ServiceId) -> Result<()> {
        let idx = self.service_index(id)?;
        self.check_can_connect()?;
        let service = &self.services[idx];
        if !service.connectable() {
            return Err(Error::NotConnectable(id.to_string()));
        }
        if service.is_connected() {
            return Err(Error::AlreadyConnected(id.to_string()));
        }
        if service.is_connecting() {
            return Err(Error::InProgress(id.to_string()));
        }
        info!("User connect requested for {}", id);
        self.services[idx].set_explicitly_disconnected(false);
        self.start_connect(idx)
    }

    /// User-initiated disconnect. Blocks auto-connect until the next
    /// explicit connect or profile change.
    pub fn disconnect_service(&mut self, id: ServiceId) -> Result<()> {
        let idx = self.service_index(id)?;
        if !self.services[idx].is_active() {
            return Err(Error::NotConnected(id.to_string()));
        }
        info!("User disconnect requested for {}", id);
        self.services[idx].set_explicitly_disconnected(true);
        self.request_disconnect(id)
    }

    /// Forget a service's configuration in its owning profile.
    pub fn remove_service_configuration(&mut self, id: ServiceId) -> Result<()> {
        let idx = self.service_index(id)?;
        if self.services[idx].is_active() {
            self.services[idx].set_explicitly_disconnected(true);
            self.request_disconnect(id)?;
        }
        let profile_id = self.services[idx].profile();
        if let Some(profile) = owning_profile(&mut self.profiles, &mut self.ephemeral, profile_id) {
            profile.abandon_service(&self.services[idx])?;
        }
        self.services[idx].unload();
        if !self.match_profile_with_service(idx) {
            self.adopt_into_ephemeral(idx);
        }
        let name = self.profile_name(self.services[idx].profile());
        info!("Removed configuration of {}; now in profile {}", id, name);
        self.notifier
            .emit(PropertySource::Service(id), properties::PROFILE, name);
        self.sort_services();
        Ok(())
    }

    pub fn has_recent_connection_issues(&mut self, id: ServiceId) -> Result<bool> {
        let idx = self.service_index(id)?;
        Ok(self.services[idx].has_recent_connection_issues())
    }

    // ========================================================================
    // Technologies
    // ========================================================================

    pub fn technology_order(&self) -> String {
        Technology::join_list(&self.technology_order)
    }

    /// Replace the technology preference order and re-sort.
    pub fn set_technology_order(&mut self, order: &str) -> Result<()> {
        let order = Technology::parse_list(order)?;
        info!("Technology order set to {}", Technology::join_list(&order));
        self.technology_order = order;
        let joined = self.technology_order();
        self.notifier
            .emit(PropertySource::Manager, PROP_TECHNOLOGY_ORDER, joined);
        self.sort_services();
        Ok(())
    }

    pub fn set_technology_auto_connect(&mut self, technology: Technology, enabled: bool) {
        let changed = if enabled {
            self.auto_connect_disabled.remove(&technology)
        } else {
            self.auto_connect_disabled.insert(technology)
        };
        if changed {
            info!(
                "Auto-connect {} for {}",
                if enabled { "enabled" } else { "disabled" },
                technology
            );
            let technologies = self.enabled_technologies();
            self.notifier
                .emit(PropertySource::Manager, PROP_ENABLED_TECHNOLOGIES, technologies);
            self.sort_services();
        }
    }

    pub fn is_technology_auto_connect_enabled(&self, technology: Technology) -> bool {
        !self.auto_connect_disabled.contains(&technology)
    }

    /// Global auto-connect switch.
    pub fn set_auto_connect_enabled(&mut self, enabled: bool) {
        if self.auto_connect_enabled != enabled {
            self.auto_connect_enabled = enabled;
            info!("Auto-connect globally {}", if enabled { "enabled" } else { "suppressed" });
            self.sort_services();
        }
    }

    pub fn is_offline_mode(&self) -> bool {
        self.offline_mode
    }

    /// Offline mode tears down every connection and suppresses new ones
    /// until it is turned off again.
    pub fn set_offline_mode(&mut self, offline: bool) {
        if self.offline_mode == offline {
            return;
        }
        self.offline_mode = offline;
        info!("Offline mode {}", if offline { "enabled" } else { "disabled" });
        if offline {
            let active: Vec<ServiceId> = self
                .services
                .iter()
                .filter(|s| s.is_active())
                .map(|s| s.id())
                .collect();
            for id in active {
                if let Err(e) = self.request_disconnect(id) {
                    warn!("Failed to disconnect {} for offline mode: {}", id, e);
                }
            }
        }
        self.notifier
            .emit(PropertySource::Manager, PROP_OFFLINE_MODE, offline);
        let technologies = self.enabled_technologies();
        self.notifier
            .emit(PropertySource::Manager, PROP_ENABLED_TECHNOLOGIES, technologies);
        self.sort_services();
    }

    pub fn connected_technologies(&self) -> Vec<String> {
        let set: BTreeSet<&str> = self
            .services
            .iter()
            .filter(|s| s.is_connected())
            .map(|s| s.technology().as_str())
            .collect();
        set.into_iter().map(String::from).collect()
    }

    pub fn default_technology(&self) -> String {
        self.default_service()
            .map(|s| s.technology().as_str().to_string())
            .unwrap_or_default()
    }

    /// Best connected service, possibly a tunnel.
    pub fn default_service(&self) -> Option<&Service> {
        self.default_logical.and_then(|id| self.find_service(id))
    }

    /// Best connected non-tunnel service.
    pub fn default_physical_service(&self) -> Option<&Service> {
        self.default_physical.and_then(|id| self.find_service(id))
    }

    /// Overall connection state.
    pub fn state(&self) -> &'static str {
        match self.default_service() {
            Some(service) if service.state().is_online() => "online",
            Some(_) => "ready",
            None => "idle",
        }
    }

    // ========================================================================
    // Power management
    // ========================================================================

    pub fn on_suspend_imminent(&mut self) {
        info!("Suspend imminent");
        self.suspending = true;
        self.dark_resume = false;
        self.start_termination(TerminationReason::Suspend);
    }

    pub fn on_dark_suspend_imminent(&mut self) {
        info!("Dark suspend imminent");
        self.suspending = true;
        self.dark_resume = true;
        self.start_termination(TerminationReason::DarkSuspend);
    }

    /// The system woke up: forgive failures from before the sleep.
    pub fn on_resume(&mut self) {
        info!("Resumed");
        self.suspending = false;
        self.dark_resume = false;
        for service in &mut self.services {
            service.reset_auto_connect_cooldown(&mut self.dispatcher);
        }
        self.sort_services();
    }

    pub fn is_suspending(&self) -> bool {
        self.suspending
    }

    pub fn last_termination(&self) -> Option<TerminationOutcome> {
        self.last_termination
    }

    fn start_termination(&mut self, reason: TerminationReason) {
        let timeout = self.config.termination_timeout();
        let devices: Vec<DeviceId> = self.devices.iter().map(|d| d.id()).collect();
        self.last_termination = None;
        if devices.is_empty() {
            self.on_termination_finished(TerminationOutcome::Completed(reason));
            return;
        }
        self.termination
            .start(reason, devices, &mut self.dispatcher, timeout);
        let events = self.events_tx.clone();
        for device in &mut self.devices {
            let completion = TerminationCompletion::new(device.id(), events.clone());
            device.driver_mut().prepare_for_termination(reason, completion);
        }
    }

    fn on_termination_finished(&mut self, outcome: TerminationOutcome) {
        match outcome {
            TerminationOutcome::Completed(reason) => info!("{} actions done", reason),
            TerminationOutcome::TimedOut(reason) => warn!("{} actions timed out", reason),
        }
        self.last_termination = Some(outcome);
    }

    // ========================================================================
    // Properties
    // ========================================================================

    pub fn get_service_property(&mut self, id: ServiceId, name: &str) -> Result<PropertyValue> {
        let idx = self.service_index(id)?;
        if name == properties::PROFILE {
            return Ok(self.profile_name(self.services[idx].profile()).into());
        }
        properties::get(&mut self.services[idx], name)
    }

    /// Every readable property of a service.
    pub fn service_properties(&mut self, id: ServiceId) -> Result<BTreeMap<String, PropertyValue>> {
        let idx = self.service_index(id)?;
        let mut map: BTreeMap<String, PropertyValue> = properties::service_properties()
            .iter()
            .map(|p| (p.name.to_string(), (p.get)(&mut self.services[idx])))
            .collect();
        map.insert(
            properties::PROFILE.to_string(),
            self.profile_name(self.services[idx].profile()).into(),
        );
        Ok(map)
    }

    /// Validate and apply a property. Persisted properties are saved to
    /// the owning profile; any change triggers a re-sort.
    pub fn set_service_property(
        &mut self,
        id: ServiceId,
        name: &str,
        value: PropertyValue,
    ) -> Result<()> {
        let idx = self.service_index(id)?;
        if name == properties::PROFILE {
            return match &value {
                PropertyValue::String(profile) => self.move_service_to_profile(id, profile),
                _ => Err(Error::invalid_value(name, "expected a profile name")),
            };
        }
        let property = properties::lookup(name)?;
        if !properties::set(&mut self.services[idx], name, &value)? {
            return Ok(());
        }
        if property.persisted {
            self.persist_service(idx);
        }
        let current = (property.get)(&mut self.services[idx]);
        self.notifier
            .emit(PropertySource::Service(id), property.name, current);
        self.sort_services();
        Ok(())
    }

    /// Manager-level properties.
    pub fn manager_properties(&self) -> BTreeMap<String, PropertyValue> {
        let mut map = BTreeMap::new();
        map.insert(
            PROP_ACTIVE_PROFILE.to_string(),
            self.active_profile_name().unwrap_or_default().into(),
        );
        map.insert(PROP_PROFILES.to_string(), self.profile_names().into());
        map.insert(
            PROP_SERVICES.to_string(),
            self.services
                .iter()
                .map(|s| s.id().to_string())
                .collect::<Vec<_>>()
                .into(),
        );
        map.insert(
            PROP_DEFAULT_SERVICE.to_string(),
            self.default_logical
                .map(|id| id.to_string())
                .unwrap_or_default()
                .into(),
        );
        map.insert(
            PROP_DEFAULT_PHYSICAL_SERVICE.to_string(),
            self.default_physical
                .map(|id| id.to_string())
                .unwrap_or_default()
                .into(),
        );
        map.insert(PROP_DEFAULT_TECHNOLOGY.to_string(), self.default_technology().into());
        map.insert(
            PROP_CONNECTED_TECHNOLOGIES.to_string(),
            self.connected_technologies().into(),
        );
        map.insert(PROP_STATE.to_string(), self.state().into());
        map.insert(PROP_TECHNOLOGY_ORDER.to_string(), self.technology_order().into());
        map.insert(PROP_DEVICES.to_string(), self.device_ids().into());
        map.insert(
            PROP_AVAILABLE_TECHNOLOGIES.to_string(),
            self.available_technologies().into(),
        );
        map.insert(
            PROP_ENABLED_TECHNOLOGIES.to_string(),
            self.enabled_technologies().into(),
        );
        map.insert(PROP_OFFLINE_MODE.to_string(), self.offline_mode.into());
        map
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::storage::Store;
    use crate::testing::{ConnectBehavior, MockDriver, MockHandle};
    use std::net::{IpAddr, Ipv4Addr};
    use std::time::Duration;

    fn manager() -> (Manager, MemoryStorageProvider) {
        let provider = MemoryStorageProvider::new();
        let manager = Manager::with_storage(ManagerConfig::in_memory(), Box::new(provider.clone()))
            .unwrap();
        (manager, provider)
    }

    fn started() -> (Manager, MemoryStorageProvider) {
        let (mut manager, provider) = manager();
        manager.start().unwrap();
        manager.dispatch_pending();
        (manager, provider)
    }

    fn add_device(manager: &mut Manager, technology: Technology, behavior: ConnectBehavior) -> (DeviceId, MockHandle) {
        let (driver, handle) = MockDriver::new(technology);
        handle.set_behavior(behavior);
        (manager.register_device(Box::new(driver)).unwrap(), handle)
    }

    fn auto_spec(storage_id: &str) -> ServiceSpec {
        let mut spec = ServiceSpec::new(storage_id, storage_id);
        spec.auto_connect_by_default = true;
        spec
    }

    fn dns() -> Vec<IpAddr> {
        vec![IpAddr::V4(Ipv4Addr::new(8, 8, 8, 8))]
    }

    fn drain(rx: &mut mpsc::UnboundedReceiver<PropertyChange>) -> Vec<PropertyChange> {
        let mut changes = Vec::new();
        while let Ok(change) = rx.try_recv() {
            changes.push(change);
        }
        changes
    }

    fn seed_user_profile(provider: &MemoryStorageProvider, name: &str, group: &str) {
        let ident = ProfileIdentifier::parse(name).unwrap();
        let mut store = provider.seed(&ident);
        store.set_string(group, "Name", group);
        store.set_string(group, "Type", "wifi");
        store.set_int(group, "Priority", 3);
        store.flush().unwrap();
    }

    #[tokio::test(start_paused = true)]
    async fn test_start_pushes_default_profile() {
        let (manager, _) = started();
        assert!(manager.is_running());
        assert_eq!(manager.profile_names(), vec!["default".to_string()]);
        assert_eq!(manager.active_profile_name().as_deref(), Some("default"));
    }

    #[tokio::test(start_paused = true)]
    async fn test_registrations_coalesce_into_one_sort() {
        let (mut manager, _) = started();
        let (device, _) = add_device(&mut manager, Technology::Wifi, ConnectBehavior::Hold);
        for name in ["wifi_a", "wifi_b", "wifi_c"] {
            manager
                .register_service(device, ServiceSpec::new(name, name))
                .unwrap();
        }
        assert!(manager.is_sort_pending());
        assert_eq!(manager.dispatcher.len(), 1);
        manager.dispatch_pending();
        assert!(!manager.is_sort_pending());
    }

    #[tokio::test(start_paused = true)]
    async fn test_duplicate_registration_rejected() {
        let (mut manager, _) = started();
        let (device, _) = add_device(&mut manager, Technology::Wifi, ConnectBehavior::Hold);
        manager
            .register_service(device, ServiceSpec::new("wifi_a", "A"))
            .unwrap();
        let err = manager
            .register_service(device, ServiceSpec::new("wifi_a", "A"))
            .unwrap_err();
        assert!(matches!(err, Error::ServiceAlreadyRegistered(_)));
        assert!(manager
            .register_service(DeviceId(99), ServiceSpec::new("x", "x"))
            .unwrap_err()
            .is_not_found());
    }

    #[tokio::test(start_paused = true)]
    async fn test_auto_connect_success_marks_default_and_persists() {
        let (mut manager, provider) = started();
        let (device, handle) =
            add_device(&mut manager, Technology::Ethernet, ConnectBehavior::Succeed(dns()));
        let id = manager.register_service(device, auto_spec("ethernet_any")).unwrap();
        let direct = manager.register_service(device, auto_spec("ethernet_other")).unwrap();
        manager.move_service_to_profile(id, "default").unwrap();
        manager.dispatch_pending();

        assert_eq!(handle.connects(), vec![id, direct]);
        let service = manager.find_service(id).unwrap();
        assert_eq!(service.state(), ConnectState::Connected);
        assert!(service.has_ever_connected());
        assert_eq!(manager.default_service().map(|s| s.id()), Some(id));
        assert_eq!(manager.state(), "ready");

        // Persisted into the default profile on connect
        let store = provider
            .open(&ProfileIdentifier::machine("default"), OpenMode::OpenExisting)
            .unwrap();
        assert_eq!(store.get_bool("ethernet_any", "HasEverConnected"), Some(true));
    }

    #[tokio::test(start_paused = true)]
    async fn test_metrics_and_default_services() {
        let (mut manager, _) = started();
        let (eth, _) = add_device(&mut manager, Technology::Ethernet, ConnectBehavior::Succeed(Vec::new()));
        let (wifi, _) = add_device(&mut manager, Technology::Wifi, ConnectBehavior::Succeed(dns()));
        let (vpn, vpn_handle) = add_device(&mut manager, Technology::Vpn, ConnectBehavior::Succeed(dns()));

        let vpn_id = manager.register_service(vpn, auto_spec("vpn_office")).unwrap();
        let eth_id = manager.register_service(eth, auto_spec("ethernet_any")).unwrap();
        let wifi_id = manager.register_service(wifi, auto_spec("wifi_home")).unwrap();
        manager.dispatch_pending();

        // The tunnel waited for underlying connectivity
        assert_eq!(vpn_handle.connects(), vec![vpn_id]);

        let order: Vec<ServiceId> = manager.services().map(|s| s.id()).collect();
        assert_eq!(order, vec![vpn_id, eth_id, wifi_id]);

        let conn = |id| manager.find_service(id).unwrap().connection().unwrap().clone();
        let (v, e, w) = (conn(vpn_id), conn(eth_id), conn(wifi_id));
        assert_eq!((v.metric, e.metric, w.metric), (1000, 1001, 1002));
        assert!(!v.is_primary_physical);
        assert!(e.is_primary_physical);
        assert!(!w.is_primary_physical);
        assert!(v.use_dns);
        assert!(!e.use_dns);
        assert!(!w.use_dns);

        assert_eq!(manager.default_service().map(|s| s.id()), Some(vpn_id));
        assert_eq!(manager.default_physical_service().map(|s| s.id()), Some(eth_id));
        assert_eq!(
            manager.connected_technologies(),
            vec!["ethernet".to_string(), "vpn".to_string(), "wifi".to_string()]
        );
    }

    #[tokio::test(start_paused = true)]
    async fn test_failed_auto_connects_back_off() {
        let (mut manager, _) = started();
        let (device, handle) = add_device(
            &mut manager,
            Technology::Wifi,
            ConnectBehavior::Fail(ConnectFailure::Dhcp),
        );
        let id = manager.register_service(device, auto_spec("wifi_flaky")).unwrap();
        manager.dispatch_pending();

        // The first failure retries at once; the second is throttled
        assert_eq!(handle.connects().len(), 2);
        let service = manager.find_service(id).unwrap();
        assert_eq!(service.state(), ConnectState::Failure);
        assert_eq!(service.failure(), ConnectFailure::Dhcp);
        assert_eq!(service.auto_connect_cooldown(), Duration::from_millis(2000));

        tokio::time::advance(Duration::from_millis(999)).await;
        manager.dispatch_pending();
        assert_eq!(handle.connects().len(), 2);

        tokio::time::advance(Duration::from_millis(1)).await;
        manager.dispatch_pending();
        assert_eq!(handle.connects().len(), 3);
        assert_eq!(
            manager.find_service(id).unwrap().auto_connect_cooldown(),
            Duration::from_millis(4000)
        );
        assert!(manager.has_recent_connection_issues(id).unwrap());
    }

    #[tokio::test(start_paused = true)]
    async fn test_pushing_profile_claims_ephemeral_service() {
        let (mut manager, provider) = started();
        seed_user_profile(&provider, "~chronos/session", "wifi_home");
        let (device, _) = add_device(&mut manager, Technology::Wifi, ConnectBehavior::Hold);
        let id = manager
            .register_service(device, ServiceSpec::new("wifi_home", "Home"))
            .unwrap();
        assert_eq!(manager.service_profile_name(id).unwrap(), "ephemeral");

        let mut rx = manager.subscribe();
        manager.push_profile("~chronos/session").unwrap();
        assert_eq!(manager.service_profile_name(id).unwrap(), "~chronos/session");
        assert_eq!(manager.find_service(id).unwrap().priority(), 3);

        let changes = drain(&mut rx);
        assert!(changes.contains(&PropertyChange {
            source: PropertySource::Service(id),
            name: properties::PROFILE.to_string(),
            value: PropertyValue::String("~chronos/session".into()),
        }));
    }

    #[tokio::test(start_paused = true)]
    async fn test_popping_profile_unloads_unmatched_service() {
        let (mut manager, provider) = started();
        seed_user_profile(&provider, "~chronos/session", "wifi_home");
        let (device, _) = add_device(&mut manager, Technology::Wifi, ConnectBehavior::Hold);
        manager.push_profile("~chronos/session").unwrap();
        let id = manager
            .register_service(device, ServiceSpec::new("wifi_home", "Home"))
            .unwrap();
        assert_eq!(manager.service_profile_name(id).unwrap(), "~chronos/session");

        manager.pop_profile(Some("~chronos/session")).unwrap();
        assert!(manager.find_service(id).is_none());
        assert_eq!(manager.profile_names(), vec!["default".to_string()]);
    }

    #[tokio::test(start_paused = true)]
    async fn test_popping_profile_rematches_lower_profile() {
        let (mut manager, provider) = started();
        seed_user_profile(&provider, "~chronos/session", "wifi_home");
        let (device, _) = add_device(&mut manager, Technology::Wifi, ConnectBehavior::Hold);
        let id = manager
            .register_service(device, ServiceSpec::new("wifi_home", "Home"))
            .unwrap();
        manager.move_service_to_profile(id, "default").unwrap();
        manager.push_profile("~chronos/session").unwrap();
        assert_eq!(manager.service_profile_name(id).unwrap(), "~chronos/session");

        // Matching again against the same stack keeps the binding
        let idx = manager.index_of(id).unwrap();
        assert!(manager.match_profile_with_service(idx));
        assert_eq!(manager.service_profile_name(id).unwrap(), "~chronos/session");

        manager.pop_all_user_profiles();
        assert_eq!(manager.service_profile_name(id).unwrap(), "default");
        assert_eq!(manager.find_service(id).unwrap().priority(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_profile_stack_rules() {
        let (mut manager, provider) = started();
        assert!(matches!(
            manager.push_profile("default").unwrap_err(),
            Error::ProfileAlreadyOnStack(_)
        ));
        assert!(manager.push_profile("~nobody/missing").unwrap_err().is_not_found());
        assert!(manager.push_profile("bad name").unwrap_err().is_invalid_arguments());
        assert!(matches!(
            manager.pop_profile(None).unwrap_err(),
            Error::ProfileStackBottom
        ));

        manager.create_profile("~chronos/session").unwrap();
        assert!(matches!(
            manager.create_profile("~chronos/session").unwrap_err(),
            Error::StorageAlreadyExists(_)
        ));
        manager.create_profile("lab").unwrap();
        manager.push_profile("~chronos/session").unwrap();
        assert!(matches!(
            manager.push_profile("lab").unwrap_err(),
            Error::MachineProfileAboveUser(_)
        ));
        assert!(matches!(
            manager.pop_profile(Some("default")).unwrap_err(),
            Error::NotActiveProfile(_)
        ));
        assert!(matches!(
            manager.remove_profile("~chronos/session").unwrap_err(),
            Error::ProfileInUse(_)
        ));

        manager.pop_profile(None).unwrap();
        manager.remove_profile("~chronos/session").unwrap();
        assert!(!provider.exists(&ProfileIdentifier::user("chronos", "session")));
    }

    #[tokio::test(start_paused = true)]
    async fn test_pushed_profile_offers_remembered_services() {
        let (mut manager, provider) = started();
        seed_user_profile(&provider, "~chronos/session", "wifi_hidden");
        let (_, _) = add_device(&mut manager, Technology::Wifi, ConnectBehavior::Hold);
        assert!(manager.find_service_by_storage_id("wifi_hidden").is_none());

        manager.push_profile("~chronos/session").unwrap();
        let service = manager.find_service_by_storage_id("wifi_hidden").unwrap();
        assert_eq!(service.priority(), 3);
        assert_eq!(
            manager.service_profile_name(service.id()).unwrap(),
            "~chronos/session"
        );
    }

    #[tokio::test(start_paused = true)]
    async fn test_user_connect_and_disconnect() {
        let (mut manager, _) = started();
        let (device, handle) = add_device(&mut manager, Technology::Wifi, ConnectBehavior::Hold);
        let id = manager
            .register_service(device, ServiceSpec::new("wifi_cafe", "Cafe"))
            .unwrap();
        manager.dispatch_pending();
        assert!(handle.connects().is_empty());

        assert!(matches!(
            manager.disconnect_service(id).unwrap_err(),
            Error::NotConnected(_)
        ));
        manager.connect_service(id).unwrap();
        assert!(matches!(
            manager.connect_service(id).unwrap_err(),
            Error::InProgress(_)
        ));

        handle.complete_next(Ok(ConnectionParams::default()));
        manager.dispatch_pending();
        assert!(matches!(
            manager.connect_service(id).unwrap_err(),
            Error::AlreadyConnected(_)
        ));

        manager.disconnect_service(id).unwrap();
        manager.dispatch_pending();
        let service = manager.find_service(id).unwrap();
        assert_eq!(service.state(), ConnectState::Idle);
        assert!(service.explicitly_disconnected());
        assert_eq!(handle.disconnects(), vec![id]);
        // A user disconnect is not an instability signal
        assert!(!manager.has_recent_connection_issues(id).unwrap());
    }

    #[tokio::test(start_paused = true)]
    async fn test_connect_to_best_services_one_per_technology() {
        let (mut manager, _) = started();
        manager.set_auto_connect_enabled(false);
        let (wifi, wifi_handle) = add_device(&mut manager, Technology::Wifi, ConnectBehavior::Hold);
        let (cell, cell_handle) = add_device(&mut manager, Technology::Cellular, ConnectBehavior::Hold);
        let (vpn, vpn_handle) = add_device(&mut manager, Technology::Vpn, ConnectBehavior::Hold);

        let weak = manager.register_service(wifi, auto_spec("wifi_weak")).unwrap();
        let mut strong_spec = auto_spec("wifi_strong");
        strong_spec.strength = 90;
        let strong = manager.register_service(wifi, strong_spec).unwrap();
        let cellular = manager.register_service(cell, auto_spec("cellular_lte")).unwrap();
        manager.register_service(vpn, auto_spec("vpn_office")).unwrap();
        let mut off_spec = ServiceSpec::new("wifi_off", "Off");
        off_spec.connectable = false;
        manager.register_service(wifi, off_spec).unwrap();
        manager.dispatch_pending();

        manager.connect_to_best_services().unwrap();
        manager.connect_to_best_services().unwrap();
        manager.dispatch_pending();

        assert_eq!(wifi_handle.connects(), vec![strong]);
        assert_eq!(cell_handle.connects(), vec![cellular]);
        // The tunnel needs a primary service that is already connected
        assert!(vpn_handle.connects().is_empty());
        assert_eq!(manager.find_service(weak).unwrap().state(), ConnectState::Idle);
    }

    #[tokio::test(start_paused = true)]
    async fn test_connectivity_result_updates_state() {
        let (mut manager, _) = started();
        let (device, _) = add_device(&mut manager, Technology::Wifi, ConnectBehavior::Succeed(dns()));
        let id = manager.register_service(device, auto_spec("wifi_home")).unwrap();
        manager.dispatch_pending();

        let events = manager.event_sender();
        events.send(DriverEvent::ConnectivityResult {
            service: id,
            state: ConnectState::Online,
        });
        manager.dispatch_pending();
        assert_eq!(manager.find_service(id).unwrap().state(), ConnectState::Online);
        assert_eq!(manager.state(), "online");

        events.send(DriverEvent::LinkDown { service: id });
        manager.dispatch_pending();
        assert!(manager.has_recent_connection_issues(id).unwrap());
    }

    #[tokio::test(start_paused = true)]
    async fn test_suspend_blocks_auto_connect_and_resume_resets_cooldowns() {
        let (mut manager, _) = started();
        let (device, handle) = add_device(
            &mut manager,
            Technology::Wifi,
            ConnectBehavior::Fail(ConnectFailure::OutOfRange),
        );
        let id = manager.register_service(device, auto_spec("wifi_far")).unwrap();
        manager.dispatch_pending();
        assert_eq!(handle.connects().len(), 2);

        handle.set_hold_termination(true);
        manager.on_suspend_imminent();
        manager.dispatch_pending();
        assert!(manager.termination.is_running());

        tokio::time::advance(Duration::from_millis(9500)).await;
        manager.dispatch_pending();
        assert_eq!(
            manager.last_termination(),
            Some(TerminationOutcome::TimedOut(TerminationReason::Suspend))
        );
        // Reenable fired during suspend but auto-connect stayed off
        assert_eq!(handle.connects().len(), 2);

        manager.on_resume();
        assert_eq!(
            manager.find_service(id).unwrap().auto_connect_cooldown(),
            Duration::ZERO
        );
        manager.dispatch_pending();
        assert_eq!(handle.connects().len(), 4);
    }

    #[tokio::test(start_paused = true)]
    async fn test_termination_completes_when_drivers_report() {
        let (mut manager, _) = started();
        let (_, quick) = add_device(&mut manager, Technology::Wifi, ConnectBehavior::Hold);
        let (_, slow) = add_device(&mut manager, Technology::Cellular, ConnectBehavior::Hold);
        slow.set_hold_termination(true);

        manager.on_dark_suspend_imminent();
        manager.dispatch_pending();
        assert_eq!(quick.terminations(), vec![TerminationReason::DarkSuspend]);
        assert_eq!(manager.last_termination(), None);

        slow.complete_terminations();
        manager.dispatch_pending();
        assert_eq!(
            manager.last_termination(),
            Some(TerminationOutcome::Completed(TerminationReason::DarkSuspend))
        );
    }

    #[tokio::test(start_paused = true)]
    async fn test_technology_order() {
        let (mut manager, _) = started();
        assert_eq!(manager.technology_order(), "vpn,ethernet,wifi,wimax,cellular");
        assert!(matches!(
            manager.set_technology_order("wifi,bogus").unwrap_err(),
            Error::UnknownTechnology(_)
        ));
        assert!(matches!(
            manager.set_technology_order("wifi,wifi").unwrap_err(),
            Error::DuplicateTechnology(_)
        ));

        let (eth, _) = add_device(&mut manager, Technology::Ethernet, ConnectBehavior::Hold);
        let (wifi, _) = add_device(&mut manager, Technology::Wifi, ConnectBehavior::Hold);
        let eth_id = manager.register_service(eth, ServiceSpec::new("ethernet_any", "Wired")).unwrap();
        let wifi_id = manager.register_service(wifi, ServiceSpec::new("wifi_home", "Home")).unwrap();
        manager.dispatch_pending();
        assert_eq!(manager.services().next().map(|s| s.id()), Some(eth_id));

        manager.set_technology_order("wifi,ethernet").unwrap();
        manager.dispatch_pending();
        assert_eq!(manager.services().next().map(|s| s.id()), Some(wifi_id));
    }

    #[tokio::test(start_paused = true)]
    async fn test_disabled_technology_does_not_auto_connect() {
        let (mut manager, _) = started();
        manager.set_technology_auto_connect(Technology::Wifi, false);
        let (device, handle) = add_device(&mut manager, Technology::Wifi, ConnectBehavior::Hold);
        manager.register_service(device, auto_spec("wifi_home")).unwrap();
        manager.dispatch_pending();
        assert!(handle.connects().is_empty());

        manager.set_technology_auto_connect(Technology::Wifi, true);
        manager.dispatch_pending();
        assert_eq!(handle.connects().len(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_set_property_persists_and_notifies() {
        let (mut manager, provider) = started();
        let (device, _) = add_device(&mut manager, Technology::Wifi, ConnectBehavior::Hold);
        let id = manager
            .register_service(device, ServiceSpec::new("wifi_home", "Home"))
            .unwrap();
        manager
            .set_service_property(id, properties::PROFILE, PropertyValue::String("default".into()))
            .unwrap();

        let mut rx = manager.subscribe();
        manager
            .set_service_property(id, properties::PRIORITY, PropertyValue::Int(9))
            .unwrap();
        assert_eq!(
            manager.get_service_property(id, properties::PRIORITY).unwrap(),
            PropertyValue::Int(9)
        );
        let changes = drain(&mut rx);
        assert_eq!(changes.len(), 1);
        assert_eq!(changes[0].name, properties::PRIORITY);

        let store = provider
            .open(&ProfileIdentifier::machine("default"), OpenMode::OpenExisting)
            .unwrap();
        assert_eq!(store.get_int("wifi_home", "Priority"), Some(9));

        assert!(manager
            .set_service_property(id, properties::STATE, PropertyValue::String("online".into()))
            .is_err());
        let all = manager.service_properties(id).unwrap();
        assert_eq!(all.get(properties::PROFILE), Some(&PropertyValue::String("default".into())));
    }

    #[tokio::test(start_paused = true)]
    async fn test_remove_service_configuration() {
        let (mut manager, provider) = started();
        let (device, _) = add_device(&mut manager, Technology::Wifi, ConnectBehavior::Hold);
        let id = manager
            .register_service(device, ServiceSpec::new("wifi_home", "Home"))
            .unwrap();
        manager.move_service_to_profile(id, "default").unwrap();
        manager
            .set_service_property(id, properties::PRIORITY, PropertyValue::Int(4))
            .unwrap();

        manager.remove_service_configuration(id).unwrap();
        assert_eq!(manager.service_profile_name(id).unwrap(), "ephemeral");
        assert_eq!(manager.find_service(id).unwrap().priority(), 0);
        let store = provider
            .open(&ProfileIdentifier::machine("default"), OpenMode::OpenExisting)
            .unwrap();
        assert!(!store.contains_group("wifi_home"));
    }

    #[tokio::test(start_paused = true)]
    async fn test_claim_link_and_deregister_device() {
        let (mut manager, _) = started();
        let (device, handle) = add_device(&mut manager, Technology::Ethernet, ConnectBehavior::Hold);
        handle.add_link("eth0");
        assert_eq!(manager.claim_link("eth0"), Some(device));
        assert_eq!(manager.claim_link("wlan0"), None);
        assert!(manager.release_link("eth0"));

        let id = manager
            .register_service(device, ServiceSpec::new("ethernet_any", "Wired"))
            .unwrap();
        manager.deregister_device(device).unwrap();
        assert!(manager.find_service(id).is_none());
        assert!(manager.deregister_device(device).unwrap_err().is_not_found());
    }

    #[tokio::test(start_paused = true)]
    async fn test_stop_saves_and_disconnects() {
        let (mut manager, _) = started();
        let (device, handle) = add_device(&mut manager, Technology::Ethernet, ConnectBehavior::Succeed(Vec::new()));
        let id = manager.register_service(device, auto_spec("ethernet_any")).unwrap();
        manager.dispatch_pending();
        assert!(manager.find_service(id).unwrap().is_connected());

        manager.shutdown().await;
        assert!(!manager.is_running());
        assert_eq!(handle.disconnects(), vec![id]);
        assert_eq!(
            manager.last_termination(),
            Some(TerminationOutcome::Completed(TerminationReason::Shutdown))
        );

        // Late disconnect completions do not count as drops
        manager.dispatch_pending();
        assert!(!manager.has_recent_connection_issues(id).unwrap());
    }

    #[tokio::test(start_paused = true)]
    async fn test_default_physical_changes_under_fixed_tunnel() {
        let (mut manager, _) = started();
        let (eth, _) = add_device(&mut manager, Technology::Ethernet, ConnectBehavior::Succeed(Vec::new()));
        let (wifi, _) = add_device(&mut manager, Technology::Wifi, ConnectBehavior::Succeed(dns()));
        let (vpn, _) = add_device(&mut manager, Technology::Vpn, ConnectBehavior::Succeed(dns()));
        let vpn_id = manager.register_service(vpn, auto_spec("vpn_office")).unwrap();
        let eth_id = manager.register_service(eth, auto_spec("ethernet_any")).unwrap();
        let wifi_id = manager.register_service(wifi, auto_spec("wifi_home")).unwrap();
        manager.dispatch_pending();
        manager.set_technology_auto_connect(Technology::Ethernet, false);
        manager.dispatch_pending();
        assert_eq!(manager.default_physical_service().map(|s| s.id()), Some(eth_id));

        let mut rx = manager.subscribe();
        manager.event_sender().send(DriverEvent::LinkDown { service: eth_id });
        manager.dispatch_pending();

        assert_eq!(manager.default_service().map(|s| s.id()), Some(vpn_id));
        assert_eq!(manager.default_physical_service().map(|s| s.id()), Some(wifi_id));
        let changes: Vec<PropertyChange> = drain(&mut rx)
            .into_iter()
            .filter(|c| c.source == PropertySource::Manager)
            .collect();
        assert!(!changes.iter().any(|c| c.name == PROP_DEFAULT_SERVICE));
        let physical: Vec<&PropertyValue> = changes
            .iter()
            .filter(|c| c.name == PROP_DEFAULT_PHYSICAL_SERVICE)
            .map(|c| &c.value)
            .collect();
        assert_eq!(physical, vec![&PropertyValue::String(wifi_id.to_string())]);
        assert_eq!(
            manager.manager_properties().get(PROP_DEFAULT_PHYSICAL_SERVICE),
            Some(&PropertyValue::String(wifi_id.to_string()))
        );
    }

    #[tokio::test(start_paused = true)]
    async fn test_offline_mode_suppresses_connections() {
        let (mut manager, _) = started();
        let mut rx = manager.subscribe();
        manager.set_offline_mode(true);
        let changes = drain(&mut rx);
        assert!(changes
            .iter()
            .any(|c| c.name == PROP_OFFLINE_MODE && c.value == PropertyValue::Bool(true)));

        let (device, handle) =
            add_device(&mut manager, Technology::Ethernet, ConnectBehavior::Succeed(Vec::new()));
        let id = manager.register_service(device, auto_spec("ethernet_any")).unwrap();
        manager.dispatch_pending();
        assert!(handle.connects().is_empty());
        assert!(manager.enabled_technologies().is_empty());
        assert!(matches!(manager.connect_service(id).unwrap_err(), Error::OfflineMode));
        assert!(matches!(
            manager.connect_to_best_services().unwrap_err(),
            Error::OfflineMode
        ));

        manager.set_offline_mode(false);
        manager.dispatch_pending();
        assert_eq!(handle.connects(), vec![id]);
        assert!(manager.find_service(id).unwrap().is_connected());
        assert_eq!(manager.enabled_technologies(), vec!["ethernet".to_string()]);

        // Going offline tears the connection down without counting a drop
        manager.set_offline_mode(true);
        manager.dispatch_pending();
        assert_eq!(handle.disconnects(), vec![id]);
        assert_eq!(manager.find_service(id).unwrap().state(), ConnectState::Idle);
        assert!(!manager.has_recent_connection_issues(id).unwrap());
        assert_eq!(handle.connects().len(), 1);
        assert_eq!(
            manager.manager_properties().get(PROP_OFFLINE_MODE),
            Some(&PropertyValue::Bool(true))
        );
    }

    #[tokio::test(start_paused = true)]
    async fn test_blacklisted_links_are_not_managed() {
        let mut config = ManagerConfig::in_memory();
        config.device_blacklist = vec!["eth1".to_string()];
        let mut manager =
            Manager::with_storage(config, Box::new(MemoryStorageProvider::new())).unwrap();
        manager.start().unwrap();

        let (driver, _) = MockDriver::new(Technology::Ethernet);
        assert!(matches!(
            manager.register_device(Box::new(driver.bound_to("eth1"))).unwrap_err(),
            Error::DeviceBlacklisted(link) if link == "eth1"
        ));
        let (driver, _) = MockDriver::new(Technology::Ethernet);
        assert!(manager.register_device(Box::new(driver.bound_to("eth0"))).is_ok());

        let (_, handle) = add_device(&mut manager, Technology::Ethernet, ConnectBehavior::Hold);
        handle.add_link("eth1");
        handle.add_link("eth2");
        assert_eq!(manager.claim_link("eth1"), None);
        let claimer = manager.claim_link("eth2").unwrap();

        manager.add_device_to_blacklist("eth2");
        assert!(manager.is_device_blacklisted("eth2"));
        assert_eq!(manager.claim_link("eth2"), None);
        let device = manager.devices.iter().find(|d| d.id() == claimer).unwrap();
        assert!(device.claimed_links().is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn test_device_and_technology_properties() {
        let (mut manager, _) = started();
        let mut rx = manager.subscribe();
        let (eth, _) = add_device(&mut manager, Technology::Ethernet, ConnectBehavior::Hold);
        let (wifi_a, _) = add_device(&mut manager, Technology::Wifi, ConnectBehavior::Hold);
        let (wifi_b, _) = add_device(&mut manager, Technology::Wifi, ConnectBehavior::Hold);

        assert_eq!(manager.devices_by_technology(Technology::Wifi), vec![wifi_a, wifi_b]);
        assert!(manager.devices_by_technology(Technology::Cellular).is_empty());
        assert_eq!(
            manager.available_technologies(),
            vec!["ethernet".to_string(), "wifi".to_string()]
        );
        let changes = drain(&mut rx);
        let devices: Vec<&PropertyValue> = changes
            .iter()
            .filter(|c| c.name == PROP_DEVICES)
            .map(|c| &c.value)
            .collect();
        assert_eq!(devices.len(), 3);
        assert_eq!(
            devices[2],
            &PropertyValue::Strings(vec![eth.to_string(), wifi_a.to_string(), wifi_b.to_string()])
        );

        manager.set_technology_auto_connect(Technology::Wifi, false);
        let enabled: Vec<PropertyValue> = drain(&mut rx)
            .into_iter()
            .filter(|c| c.name == PROP_ENABLED_TECHNOLOGIES)
            .map(|c| c.value)
            .collect();
        assert_eq!(enabled, vec![PropertyValue::Strings(vec!["ethernet".to_string()])]);

        manager.deregister_device(eth).unwrap();
        let props = manager.manager_properties();
        assert_eq!(
            props.get(PROP_DEVICES),
            Some(&PropertyValue::Strings(vec![wifi_a.to_string(), wifi_b.to_string()]))
        );
        assert_eq!(
            props.get(PROP_AVAILABLE_TECHNOLOGIES),
            Some(&PropertyValue::Strings(vec!["wifi".to_string()]))
        );
        assert_eq!(
            props.get(PROP_ENABLED_TECHNOLOGIES),
            Some(&PropertyValue::Strings(Vec::new()))
        );
    }

    #[tokio::test(start_paused = true)]
    async fn test_driver_refusing_connect_surfaces_error() {
        let (mut manager, _) = started();
        let (device, handle) = add_device(
            &mut manager,
            Technology::Cellular,
            ConnectBehavior::Reject("modem powered off".to_string()),
        );
        let id = manager
            .register_service(device, ServiceSpec::new("cellular_lte", "LTE"))
            .unwrap();
        manager.dispatch_pending();

        assert!(matches!(
            manager.connect_service(id).unwrap_err(),
            Error::Driver(reason) if reason == "modem powered off"
        ));
        assert_eq!(handle.connects(), vec![id]);
        assert_eq!(manager.find_service(id).unwrap().state(), ConnectState::Idle);
    }

    #[tokio::test(start_paused = true)]
    async fn test_stopped_manager_does_not_connect() {
        let (mut manager, _) = manager();
        let (device, handle) = add_device(&mut manager, Technology::Wifi, ConnectBehavior::Hold);
        let id = manager.register_service(device, auto_spec("wifi_home")).unwrap();
        manager.dispatch_pending();
        assert!(handle.connects().is_empty());
        assert!(matches!(manager.connect_service(id).unwrap_err(), Error::NotRunning));
        assert!(matches!(
            manager.connect_to_best_services().unwrap_err(),
            Error::NotRunning
        ));

        manager.start().unwrap();
        manager.dispatch_pending();
        assert_eq!(handle.connects(), vec![id]);
    }

    #[tokio::test(start_paused = true)]
    async fn test_dark_suspend_allows_auto_connect() {
        let (mut manager, _) = started();
        let (device, handle) = add_device(&mut manager, Technology::Wifi, ConnectBehavior::Hold);

        manager.on_suspend_imminent();
        manager.dispatch_pending();
        manager.register_service(device, auto_spec("wifi_home")).unwrap();
        manager.dispatch_pending();
        assert!(handle.connects().is_empty());

        manager.on_dark_suspend_imminent();
        manager.dispatch_pending();
        manager.sort_services();
        manager.dispatch_pending();
        assert_eq!(handle.connects().len(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_run_exits_on_shutdown_signal() {
        let (mut manager, _) = started();
        manager.run(async {}).await;
        assert!(manager.is_running());
    }
}
