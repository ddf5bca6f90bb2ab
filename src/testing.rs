// Netpilot - Test Fixtures
// Copyright (C) 2026 Christos A. Daggas
// SPDX-License-Identifier: MIT

//! Recording driver used by the engine tests.

use std::cell::RefCell;
use std::net::IpAddr;
use std::rc::Rc;

use crate::models::{ConnectFailure, Error, Result, Technology};
use crate::services::device::{
    ConnectCompletion, ConnectRequest, ConnectionParams, DisconnectCompletion, Driver,
    TerminationCompletion, TerminationReason,
};
use crate::services::service::{ServiceSpec, STORAGE_NAME, STORAGE_TYPE};
use crate::services::ServiceId;
use crate::storage::Store;

/// How the mock answers `connect`.
#[derive(Debug, Clone)]
pub enum ConnectBehavior {
    /// Complete at once with these name servers.
    Succeed(Vec<IpAddr>),
    /// Complete at once with this failure.
    Fail(ConnectFailure),
    /// Keep the completion until the test calls `complete_next`.
    Hold,
    /// Refuse the call outright.
    Reject(String),
}

#[derive(Debug)]
struct MockState {
    behavior: ConnectBehavior,
    hold_termination: bool,
    links: Vec<String>,
    connects: Vec<ServiceId>,
    disconnects: Vec<ServiceId>,
    terminations: Vec<TerminationReason>,
    held_connects: Vec<ConnectCompletion>,
    held_terminations: Vec<TerminationCompletion>,
}

/// Test-side view of a [`MockDriver`] after it moved into the manager.
#[derive(Debug, Clone)]
pub struct MockHandle {
    state: Rc<RefCell<MockState>>,
}

impl MockHandle {
    pub fn set_behavior(&self, behavior: ConnectBehavior) {
        self.state.borrow_mut().behavior = behavior;
    }

    pub fn set_hold_termination(&self, hold: bool) {
        self.state.borrow_mut().hold_termination = hold;
    }

    pub fn add_link(&self, link: &str) {
        self.state.borrow_mut().links.push(link.to_string());
    }

    pub fn connects(&self) -> Vec<ServiceId> {
        self.state.borrow().connects.clone()
    }

    pub fn disconnects(&self) -> Vec<ServiceId> {
        self.state.borrow().disconnects.clone()
    }

    pub fn terminations(&self) -> Vec<TerminationReason> {
        self.state.borrow().terminations.clone()
    }

    /// Finish the oldest held connect.
    pub fn complete_next(&self, result: std::result::Result<ConnectionParams, ConnectFailure>) {
        let completion = {
            let mut state = self.state.borrow_mut();
            if state.held_connects.is_empty() {
                None
            } else {
                Some(state.held_connects.remove(0))
            }
        };
        if let Some(completion) = completion {
            completion.complete(result);
        }
    }

    /// Finish every held termination action.
    pub fn complete_terminations(&self) {
        let held: Vec<_> = self.state.borrow_mut().held_terminations.drain(..).collect();
        for completion in held {
            completion.complete();
        }
    }
}

/// A driver that records every call.
#[derive(Debug)]
pub struct MockDriver {
    technology: Technology,
    link_name: Option<String>,
    state: Rc<RefCell<MockState>>,
}

impl MockDriver {
    pub fn new(technology: Technology) -> (Self, MockHandle) {
        let state = Rc::new(RefCell::new(MockState {
            behavior: ConnectBehavior::Hold,
            hold_termination: false,
            links: Vec::new(),
            connects: Vec::new(),
            disconnects: Vec::new(),
            terminations: Vec::new(),
            held_connects: Vec::new(),
            held_terminations: Vec::new(),
        }));
        let handle = MockHandle {
            state: Rc::clone(&state),
        };
        (
            Self {
                technology,
                link_name: None,
                state,
            },
            handle,
        )
    }

    /// Bind the device to a kernel link.
    pub fn bound_to(mut self, link_name: &str) -> Self {
        self.link_name = Some(link_name.to_string());
        self
    }
}

impl Driver for MockDriver {
    fn technology(&self) -> Technology {
        self.technology
    }

    fn link_name(&self) -> Option<&str> {
        self.link_name.as_deref()
    }

    fn connect(&mut self, request: ConnectRequest, completion: ConnectCompletion) -> Result<()> {
        let behavior = {
            let mut state = self.state.borrow_mut();
            state.connects.push(request.service);
            state.behavior.clone()
        };
        match behavior {
            ConnectBehavior::Succeed(name_servers) => {
                completion.succeeded(ConnectionParams { name_servers })
            }
            ConnectBehavior::Fail(failure) => completion.failed(failure),
            ConnectBehavior::Hold => self.state.borrow_mut().held_connects.push(completion),
            ConnectBehavior::Reject(reason) => return Err(Error::Driver(reason)),
        }
        Ok(())
    }

    fn disconnect(&mut self, service: ServiceId, completion: DisconnectCompletion) -> Result<()> {
        self.state.borrow_mut().disconnects.push(service);
        completion.complete();
        Ok(())
    }

    fn claim_link(&mut self, link_name: &str) -> bool {
        self.state.borrow().links.iter().any(|l| l == link_name)
    }

    fn remembered_services(&mut self, store: &dyn Store) -> Vec<ServiceSpec> {
        store
            .groups_with_string(STORAGE_TYPE, self.technology.as_str())
            .into_iter()
            .map(|group| {
                let name = store
                    .get_string(&group, STORAGE_NAME)
                    .unwrap_or_else(|| group.clone());
                ServiceSpec::new(group, name)
            })
            .collect()
    }

    fn prepare_for_termination(&mut self, reason: TerminationReason, completion: TerminationCompletion) {
        let mut state = self.state.borrow_mut();
        state.terminations.push(reason);
        if state.hold_termination {
            state.held_terminations.push(completion);
        } else {
            drop(state);
            completion.complete();
        }
    }
}
