// Netpilot - Profiles
// Copyright (C) 2026 Christos A. Daggas
// SPDX-License-Identifier: MIT

//! Configuration profiles.
//!
//! A profile is a named, persisted configuration scope. Machine-wide
//! profiles are named `name`; user profiles are named `~user/name`. The
//! manager keeps them on a stack and binds each service to the topmost
//! profile holding configuration for it.

use once_cell::sync::Lazy;
use regex::Regex;
use std::fmt;
use tracing::{debug, info};

use super::service::Service;
use super::ProfileId;
use crate::models::{Error, Result};
use crate::storage::{KeyValueStore, Store};

static PROFILE_NAME_RE: Lazy<Option<Regex>> = Lazy::new(|| {
    Regex::new(r"^(?:~(?P<user>[A-Za-z0-9_.\-]+)/)?(?P<name>[A-Za-z0-9_.\-]+)$").ok()
});

/// Parsed profile name.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct ProfileIdentifier {
    /// Owning user for user-scoped profiles.
    pub user: Option<String>,
    pub name: String,
}

impl ProfileIdentifier {
    pub fn machine(name: impl Into<String>) -> Self {
        Self {
            user: None,
            name: name.into(),
        }
    }

    pub fn user(user: impl Into<String>, name: impl Into<String>) -> Self {
        Self {
            user: Some(user.into()),
            name: name.into(),
        }
    }

    /// Parse `name` or `~user/name`.
    pub fn parse(input: &str) -> Result<Self> {
        let re = PROFILE_NAME_RE
            .as_ref()
            .ok_or_else(|| Error::Internal("profile name pattern".into()))?;
        let caps = re
            .captures(input)
            .ok_or_else(|| Error::InvalidProfileName(input.to_string()))?;
        let name = caps
            .name("name")
            .map(|m| m.as_str().to_string())
            .ok_or_else(|| Error::InvalidProfileName(input.to_string()))?;
        Ok(Self {
            user: caps.name("user").map(|m| m.as_str().to_string()),
            name,
        })
    }

    pub fn is_user(&self) -> bool {
        self.user.is_some()
    }
}

impl fmt::Display for ProfileIdentifier {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &self.user {
            Some(user) => write!(f, "~{}/{}", user, self.name),
            None => f.write_str(&self.name),
        }
    }
}

/// A configuration scope and its storage.
#[derive(Debug)]
pub struct Profile {
    id: ProfileId,
    ident: ProfileIdentifier,
    store: KeyValueStore,
    ephemeral: bool,
}

impl Profile {
    pub fn new(id: ProfileId, ident: ProfileIdentifier, store: KeyValueStore) -> Self {
        Self {
            id,
            ident,
            store,
            ephemeral: false,
        }
    }

    /// The off-stack owner of unconfigured services. Never persisted.
    pub fn new_ephemeral(id: ProfileId) -> Self {
        Self {
            id,
            ident: ProfileIdentifier::machine("ephemeral"),
            store: KeyValueStore::volatile(),
            ephemeral: true,
        }
    }

    pub fn id(&self) -> ProfileId {
        self.id
    }

    pub fn identifier(&self) -> &ProfileIdentifier {
        &self.ident
    }

    pub fn name(&self) -> String {
        self.ident.to_string()
    }

    pub fn is_ephemeral(&self) -> bool {
        self.ephemeral
    }

    pub fn is_user(&self) -> bool {
        self.ident.is_user()
    }

    pub fn store(&self) -> &KeyValueStore {
        &self.store
    }

    pub fn contains_service(&self, service: &Service) -> bool {
        self.store.contains_group(service.storage_identifier())
    }

    /// Load `service` from stored data. On success the service is bound to
    /// this profile.
    pub fn configure_service(&self, service: &mut Service) -> bool {
        if !service.load(&self.store) {
            return false;
        }
        service.set_profile(self.id);
        debug!("Profile {} configured service {}", self.name(), service.unique_name());
        true
    }

    /// Take ownership of `service` and persist it here.
    pub fn adopt_service(&mut self, service: &mut Service) -> Result<()> {
        service.set_profile(self.id);
        if self.ephemeral {
            return Ok(());
        }
        service.save(&mut self.store);
        self.store.flush()?;
        info!("Profile {} adopted service {}", self.name(), service.unique_name());
        Ok(())
    }

    /// Drop `service`'s stored configuration.
    pub fn abandon_service(&mut self, service: &Service) -> Result<bool> {
        let removed = self.store.delete_group(service.storage_identifier());
        if removed && !self.ephemeral {
            self.store.flush()?;
            info!("Profile {} abandoned service {}", self.name(), service.unique_name());
        }
        Ok(removed)
    }

    /// Save `service` into this profile and flush.
    pub fn update_service(&mut self, service: &Service) -> Result<()> {
        if self.ephemeral {
            return Ok(());
        }
        service.save(&mut self.store);
        self.store.flush()
    }

    /// Write profile metadata and flush.
    pub fn save(&mut self) -> Result<()> {
        if self.ephemeral {
            return Ok(());
        }
        let name = self.name();
        self.store.set_profile_name(&name);
        self.store.flush()
    }
}
