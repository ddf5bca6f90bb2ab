// Netpilot - Service Ranking
// Copyright (C) 2026 Christos A. Daggas
// SPDX-License-Identifier: MIT

//! Total order over services.
//!
//! Criteria are evaluated in sequence and the first one that tells the two
//! services apart decides. The serial number is the final tie-break, so two
//! distinct services never compare equal.

use std::cmp::Ordering;
use std::collections::HashMap;

use super::service::Service;
use super::ProfileId;
use crate::models::{ConnectState, Technology};

/// Manager state the comparator reads.
#[derive(Debug, Clone, Copy)]
pub struct RankingContext<'a> {
    /// Technology priority list, most preferred first.
    pub technology_order: &'a [Technology],
    /// Stack position of every pushed profile (0 is the bottom).
    pub profile_positions: &'a HashMap<ProfileId, usize>,
    /// Prefer services by connection state first.
    pub compare_connectivity_state: bool,
}

/// `true` ranks first.
fn prefer(a: bool, b: bool) -> Ordering {
    b.cmp(&a)
}

/// Higher ranks first.
fn prefer_higher<T: Ord>(a: T, b: T) -> Ordering {
    b.cmp(&a)
}

fn compare_connectivity(a: ConnectState, b: ConnectState) -> Ordering {
    prefer(a.is_online(), b.is_online())
        .then_with(|| prefer(a.is_connected(), b.is_connected()))
        .then_with(|| prefer(!a.is_portalled(), !b.is_portalled()))
        .then_with(|| prefer(a.is_connecting(), b.is_connecting()))
        .then_with(|| prefer(!a.is_failed(), !b.is_failed()))
}

fn compare_technology(a: Technology, b: Technology, order: &[Technology]) -> Ordering {
    for technology in order {
        let decided = prefer(a == *technology, b == *technology);
        if decided != Ordering::Equal {
            return decided;
        }
    }
    Ordering::Equal
}

/// Position of the owning profile; `None` for the ephemeral profile.
fn profile_rank(service: &Service, positions: &HashMap<ProfileId, usize>) -> Option<usize> {
    positions.get(&service.profile()).copied()
}

/// Compare two services. `Less` means `a` ranks ahead of `b`.
pub fn compare(a: &Service, b: &Service, ctx: &RankingContext<'_>) -> Ordering {
    let connectivity = if ctx.compare_connectivity_state && a.state() != b.state() {
        compare_connectivity(a.state(), b.state())
    } else {
        Ordering::Equal
    };

    connectivity
        .then_with(|| prefer(a.connectable(), b.connectable()))
        .then_with(|| compare_technology(a.technology(), b.technology(), ctx.technology_order))
        .then_with(|| prefer_higher(a.priority(), b.priority()))
        .then_with(|| prefer(a.managed_credentials(), b.managed_credentials()))
        .then_with(|| prefer(a.auto_connect(), b.auto_connect()))
        .then_with(|| prefer_higher(a.security_level(), b.security_level()))
        // None (ephemeral) sorts below any stack position.
        .then_with(|| {
            prefer_higher(
                profile_rank(a, ctx.profile_positions),
                profile_rank(b, ctx.profile_positions),
            )
        })
        .then_with(|| prefer(a.has_ever_connected(), b.has_ever_connected()))
        .then_with(|| prefer_higher(a.strength(), b.strength()))
        .then_with(|| a.serial_number().cmp(&b.serial_number()))
}

/// Sort services in place.
pub fn sort(services: &mut [Service], ctx: &RankingContext<'_>) {
    services.sort_by(|a, b| compare(a, b, ctx));
}
