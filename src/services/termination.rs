// Netpilot - Termination Actions
// Copyright (C) 2026 Christos A. Daggas
// SPDX-License-Identifier: MIT

//! Bounded "finish this before shutdown / suspend" bookkeeping.
//!
//! Each device is asked to prepare and reports back through a completion.
//! The round ends when every device has reported or the deadline passes,
//! whichever comes first.

use std::collections::BTreeSet;
use std::time::Duration;
use tracing::{info, warn};

use super::device::TerminationReason;
use super::DeviceId;
use crate::scheduler::{Dispatcher, PendingTask, Task};

/// How a round of termination actions ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TerminationOutcome {
    Completed(TerminationReason),
    TimedOut(TerminationReason),
}

#[derive(Debug, Default)]
pub struct TerminationActions {
    reason: Option<TerminationReason>,
    pending: BTreeSet<DeviceId>,
    deadline: PendingTask,
}

impl TerminationActions {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn is_running(&self) -> bool {
        self.reason.is_some()
    }

    /// Begin a round. Any round already in progress is abandoned.
    pub fn start(
        &mut self,
        reason: TerminationReason,
        devices: impl IntoIterator<Item = DeviceId>,
        dispatcher: &mut Dispatcher,
        timeout: Duration,
    ) {
        if let Some(previous) = self.reason {
            warn!("Abandoning {} actions for {}", previous, reason);
        }
        self.deadline.cancel(dispatcher);
        self.reason = Some(reason);
        self.pending = devices.into_iter().collect();
        info!(
            "Running {} actions on {} devices (deadline {} ms)",
            reason,
            self.pending.len(),
            timeout.as_millis()
        );
        self.deadline
            .post_delayed(dispatcher, Task::TerminationTimeout, timeout);
    }

    /// A device reported completion. Returns the outcome if this was the
    /// last device outstanding.
    pub fn device_done(
        &mut self,
        device: DeviceId,
        dispatcher: &mut Dispatcher,
    ) -> Option<TerminationOutcome> {
        let reason = self.reason?;
        self.pending.remove(&device);
        if !self.pending.is_empty() {
            return None;
        }
        self.finish(dispatcher);
        info!("All {} actions completed", reason);
        Some(TerminationOutcome::Completed(reason))
    }

    /// A device went away mid-round.
    pub fn forget_device(
        &mut self,
        device: DeviceId,
        dispatcher: &mut Dispatcher,
    ) -> Option<TerminationOutcome> {
        if self.pending.contains(&device) {
            return self.device_done(device, dispatcher);
        }
        None
    }

    /// The deadline task fired.
    pub fn on_timeout(&mut self) -> Option<TerminationOutcome> {
        self.deadline.clear();
        let reason = self.reason.take()?;
        warn!(
            "{} actions timed out with {} devices outstanding",
            reason,
            self.pending.len()
        );
        self.pending.clear();
        Some(TerminationOutcome::TimedOut(reason))
    }

    fn finish(&mut self, dispatcher: &mut Dispatcher) {
        self.deadline.cancel(dispatcher);
        self.reason = None;
        self.pending.clear();
    }
}
