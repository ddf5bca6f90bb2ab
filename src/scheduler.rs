// Netpilot - Task Dispatcher
// Copyright (C) 2026 Christos A. Daggas
// SPDX-License-Identifier: MIT

//! Deferred and delayed task scheduling for the manager.
//!
//! All engine work runs on one logical thread. Work that must happen "later"
//! (coalesced sorts, auto-connect reenable timers, termination deadlines) is
//! posted here as a [`Task`] value and dispatched by the manager's run loop
//! once its deadline passes. Every posted task gets a [`TaskHandle`] that
//! can be used to cancel it.

use std::collections::{BTreeMap, HashMap};
use std::time::Duration;
use tokio::time::Instant;
use tracing::debug;

use crate::services::ServiceId;

/// Work the manager knows how to perform later.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Task {
    /// Re-sort services, recompute the default service, auto-connect.
    SortServices,
    /// Lift the auto-connect throttle of a service.
    ReenableAutoConnect(ServiceId),
    /// Explicit connect-to-best-services request.
    ConnectToBestServices,
    /// Deadline for in-flight termination actions.
    TerminationTimeout,
}

/// Handle to a posted task.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct TaskHandle(u64);

/// Time-ordered queue of pending tasks.
#[derive(Debug, Default)]
pub struct Dispatcher {
    next_id: u64,
    queue: BTreeMap<(Instant, u64), Task>,
    deadlines: HashMap<u64, Instant>,
}

impl Dispatcher {
    pub fn new() -> Self {
        Self::default()
    }

    /// Post a task to run on the next dispatch cycle.
    pub fn post(&mut self, task: Task) -> TaskHandle {
        self.post_delayed(task, Duration::ZERO)
    }

    /// Post a task to run once `delay` has elapsed.
    pub fn post_delayed(&mut self, task: Task, delay: Duration) -> TaskHandle {
        let id = self.next_id;
        self.next_id += 1;
        let deadline = Instant::now() + delay;
        self.queue.insert((deadline, id), task);
        self.deadlines.insert(id, deadline);
        debug!("Posted {:?} (#{}) with delay {:?}", task, id, delay);
        TaskHandle(id)
    }

    /// Cancel a pending task. Returns false if it already ran or was canceled.
    pub fn cancel(&mut self, handle: TaskHandle) -> bool {
        match self.deadlines.remove(&handle.0) {
            Some(deadline) => self.queue.remove(&(deadline, handle.0)).is_some(),
            None => false,
        }
    }

    /// Whether a task is still waiting to run.
    pub fn is_pending(&self, handle: TaskHandle) -> bool {
        self.deadlines.contains_key(&handle.0)
    }

    /// Remove and return the earliest task whose deadline is at or before `now`.
    pub fn pop_due(&mut self, now: Instant) -> Option<(TaskHandle, Task)> {
        let (&(deadline, id), _) = self.queue.iter().next()?;
        if deadline > now {
            return None;
        }
        let task = self.queue.remove(&(deadline, id))?;
        self.deadlines.remove(&id);
        Some((TaskHandle(id), task))
    }

    /// Deadline of the earliest pending task.
    pub fn next_deadline(&self) -> Option<Instant> {
        self.queue.keys().next().map(|(deadline, _)| *deadline)
    }

    pub fn len(&self) -> usize {
        self.queue.len()
    }

    pub fn is_empty(&self) -> bool {
        self.queue.is_empty()
    }
}

/// A single-slot deferred task: posting while one is pending is a no-op.
#[derive(Debug, Default)]
pub struct PendingTask {
    handle: Option<TaskHandle>,
}

impl PendingTask {
    pub fn new() -> Self {
        Self::default()
    }

    /// Post `task` unless one is already outstanding. Returns whether a new
    /// task was posted.
    pub fn post(&mut self, dispatcher: &mut Dispatcher, task: Task) -> bool {
        if self.is_pending(dispatcher) {
            return false;
        }
        self.handle = Some(dispatcher.post(task));
        true
    }

    /// Post `task` after `delay` unless one is already outstanding.
    pub fn post_delayed(&mut self, dispatcher: &mut Dispatcher, task: Task, delay: Duration) -> bool {
        if self.is_pending(dispatcher) {
            return false;
        }
        self.handle = Some(dispatcher.post_delayed(task, delay));
        true
    }

    pub fn is_pending(&self, dispatcher: &Dispatcher) -> bool {
        self.handle.map(|h| dispatcher.is_pending(h)).unwrap_or(false)
    }

    /// Cancel the outstanding task, if any.
    pub fn cancel(&mut self, dispatcher: &mut Dispatcher) {
        if let Some(handle) = self.handle.take() {
            dispatcher.cancel(handle);
        }
    }

    /// Forget the slot's handle once its task has been dispatched.
    pub fn clear(&mut self) {
        self.handle = None;
    }
}
