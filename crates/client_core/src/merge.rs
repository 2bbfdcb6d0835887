//! Deterministic reconciliation of the cached page with authoritative
//! snapshots and advisory mutation events. Everything here is a pure
//! `state -> state'` function so the policy can be tested exhaustively
//! without a transport or a store.
//!
//! The asymmetry between insertion and update/delete is deliberate:
//! update and delete only need identity, which the client always has, while
//! insertion needs membership in the active filter and a position in the
//! server ordering. When that knowledge is missing the cache is marked
//! stale instead of guessing.

use std::collections::HashSet;

use shared::{domain::Record, protocol::ListEvent};

use crate::cache::{CacheState, FilterEval, FilterOutcome, ListSnapshot};

/// Unconditional replacement by a fresh authoritative snapshot. The only
/// exception is a snapshot older than the one currently held (late arrival
/// that slipped past the request-id guard); it is ignored so `fetched_at`
/// never moves backwards.
pub fn apply_snapshot(cache: &CacheState, snapshot: ListSnapshot) -> CacheState {
    if snapshot.fetched_at < cache.snapshot.fetched_at {
        return cache.clone();
    }
    CacheState {
        snapshot,
        pending_stale: false,
    }
}

/// Flags the current page as possibly out of date. Used on reconnect and
/// whenever event delivery may have gapped; cleared by the next snapshot.
pub fn mark_stale(cache: &CacheState) -> CacheState {
    CacheState {
        snapshot: cache.snapshot.clone(),
        pending_stale: true,
    }
}

pub fn apply_event(cache: &CacheState, event: &ListEvent, filter: &dyn FilterEval) -> CacheState {
    match event {
        ListEvent::Created { record } => apply_created(cache, record, filter),
        ListEvent::Updated { record } => apply_updated(cache, record),
        ListEvent::Deleted { id } => apply_deleted(cache, std::slice::from_ref(id), filter),
        ListEvent::BulkDeleted { ids } => apply_deleted(cache, ids, filter),
    }
}

fn apply_created(cache: &CacheState, record: &Record, filter: &dyn FilterEval) -> CacheState {
    if cache.snapshot.contains(record.id) {
        // Duplicate delivery of a create is patched like an update.
        return apply_updated(cache, record);
    }

    let mut next = cache.clone();
    let snapshot = &mut next.snapshot;
    match filter.record_matches(snapshot.filter.as_deref(), record) {
        FilterOutcome::Matches if snapshot.page_index == 0 => {
            snapshot.items.insert(0, record.clone());
            snapshot.items.truncate(snapshot.page_size as usize);
            snapshot.total_count += 1;
        }
        FilterOutcome::Matches => {
            // In the set, but prepending shifts every later page's window,
            // so the count is trustworthy and the items are not.
            snapshot.total_count += 1;
            next.pending_stale = true;
        }
        FilterOutcome::DoesNotMatch => {}
        FilterOutcome::Unknown => {
            next.pending_stale = true;
        }
    }
    next
}

fn apply_updated(cache: &CacheState, record: &Record) -> CacheState {
    let Some(position) = cache
        .snapshot
        .items
        .iter()
        .position(|item| item.id == record.id)
    else {
        // The record may live on another page; strict no-op.
        return cache.clone();
    };

    if cache.snapshot.items[position].updated_at > record.updated_at {
        // Replayed event older than what a snapshot already gave us.
        return cache.clone();
    }

    let mut next = cache.clone();
    next.snapshot.items[position] = record.clone();
    next
}

/// Single and bulk deletion share one body so a bulk event is a single
/// atomic cache transition with no observable intermediate states.
fn apply_deleted(
    cache: &CacheState,
    ids: &[shared::domain::RecordId],
    filter: &dyn FilterEval,
) -> CacheState {
    let mut next = cache.clone();
    let snapshot = &mut next.snapshot;
    let mut seen = HashSet::new();
    for id in ids {
        if !seen.insert(*id) {
            continue;
        }
        let before = snapshot.items.len();
        snapshot.items.retain(|item| item.id != *id);
        if snapshot.items.len() < before {
            snapshot.total_count = snapshot.total_count.saturating_sub(1);
        } else if filter.id_in_filtered_set(snapshot.filter.as_deref(), *id)
            == FilterOutcome::Matches
        {
            // Not on this page, but known to be in the filtered set.
            snapshot.total_count = snapshot.total_count.saturating_sub(1);
        }
    }
    snapshot.total_count = snapshot.total_count.max(snapshot.items.len() as u64);
    next
}

#[cfg(test)]
#[path = "tests/merge_tests.rs"]
mod tests;
