// Netpilot - Event History
// Copyright (C) 2026 Christos A. Daggas
// SPDX-License-Identifier: MIT

//! Bounded, time-windowed record of timestamped events.

use chrono::{DateTime, Utc};
use std::collections::VecDeque;
use std::time::Duration;
use tokio::time::Instant;

#[derive(Debug, Clone, Copy)]
struct Event {
    monotonic: Instant,
    wall_clock: DateTime<Utc>,
}

/// Keeps at most `max_events` events, none older than `window`.
///
/// Expiry happens on every access, so counts always reflect the window.
#[derive(Debug, Clone)]
pub struct EventHistory {
    max_events: usize,
    window: Duration,
    events: VecDeque<Event>,
}

impl EventHistory {
    pub fn new(max_events: usize, window: Duration) -> Self {
        Self {
            max_events,
            window,
            events: VecDeque::with_capacity(max_events),
        }
    }

    /// Record an event happening now.
    pub fn record_now(&mut self) {
        self.record(Instant::now(), Utc::now());
    }

    /// Record an event at the given time.
    pub fn record(&mut self, monotonic: Instant, wall_clock: DateTime<Utc>) {
        self.expire(monotonic);
        self.events.push_back(Event {
            monotonic,
            wall_clock,
        });
        while self.events.len() > self.max_events {
            self.events.pop_front();
        }
    }

    fn expire(&mut self, now: Instant) {
        while let Some(oldest) = self.events.front() {
            if now.saturating_duration_since(oldest.monotonic) > self.window {
                self.events.pop_front();
            } else {
                break;
            }
        }
    }

    /// Number of events inside the window.
    pub fn count(&mut self) -> usize {
        self.expire(Instant::now());
        self.events.len()
    }

    pub fn is_empty(&mut self) -> bool {
        self.count() == 0
    }

    /// Wall-clock stamps of the events inside the window, oldest first.
    pub fn wall_clock_strings(&mut self) -> Vec<String> {
        self.expire(Instant::now());
        self.events
            .iter()
            .map(|e| e.wall_clock.format("%Y-%m-%dT%H:%M:%S%.3fZ").to_string())
            .collect()
    }
}
