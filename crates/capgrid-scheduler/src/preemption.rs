//! Victim selection for priority preemption.
//!
//! Given a candidate that does not fit into a cluster's free capacity,
//! pick the RUNNING deployments to evict:
//! 1. Only deployments with strictly lower priority are eligible
//! 2. Eligible victims are taken lowest priority first, larger footprint
//!    first among equals, earliest submission first after that
//! 3. Victims that turn out not to be needed are dropped again, so the
//!    final set is minimal

use capgrid_state::{DeploymentId, DeploymentRecord, Resources};
use tracing::debug;

/// What the selector needs to know about a running deployment.
#[derive(Debug, Clone, PartialEq)]
pub struct RunningState {
    pub deployment_id: DeploymentId,
    pub priority: i64,
    pub created_tick: u64,
    pub resources: Resources,
}

impl From<&DeploymentRecord> for RunningState {
    fn from(record: &DeploymentRecord) -> Self {
        Self {
            deployment_id: record.id,
            priority: record.priority,
            created_tick: record.created_tick,
            resources: record.resources,
        }
    }
}

/// An eviction decision: who goes, and what their release frees.
#[derive(Debug, Clone, PartialEq)]
pub struct Eviction {
    pub victims: Vec<RunningState>,
    pub freed: Resources,
}

/// Choose victims so that `request` fits into `available` plus their
/// released resources.
///
/// Returns an empty eviction when the request already fits, and `None`
/// when no set of strictly lower-priority deployments frees enough.
pub fn select_victims(
    request: &Resources,
    priority: i64,
    available: &Resources,
    capacity: &Resources,
    running: &[RunningState],
) -> Option<Eviction> {
    if request.fits_within(available) {
        return Some(Eviction {
            victims: Vec::new(),
            freed: Resources::ZERO,
        });
    }

    let mut eligible: Vec<&RunningState> = running.iter().filter(|r| r.priority < priority).collect();
    eligible.sort_by(|a, b| {
        a.priority
            .cmp(&b.priority)
            .then_with(|| b.resources.footprint(capacity).cmp(&a.resources.footprint(capacity)))
            .then(a.created_tick.cmp(&b.created_tick))
    });

    let mut pool = *available;
    let mut chosen: Vec<&RunningState> = Vec::new();
    for victim in eligible {
        pool += victim.resources;
        chosen.push(victim);
        if request.fits_within(&pool) {
            break;
        }
    }

    if !request.fits_within(&pool) {
        debug!(%request, priority, "no lower-priority victim set frees enough capacity");
        return None;
    }

    // The last victim is needed by construction; earlier ones may have
    // been made redundant by it.
    for i in (0..chosen.len().saturating_sub(1)).rev() {
        if let Some(without) = pool.checked_sub(&chosen[i].resources) {
            if request.fits_within(&without) {
                pool = without;
                chosen.remove(i);
            }
        }
    }

    let freed = chosen.iter().fold(Resources::ZERO, |acc, v| acc + v.resources);
    Some(Eviction {
        victims: chosen.into_iter().cloned().collect(),
        freed,
    })
}
