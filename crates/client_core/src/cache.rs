use chrono::{DateTime, Utc};

use shared::domain::{Record, RecordId};

/// One authoritative page of the collection as returned by a single store
/// query. Replaced wholesale on every successful fetch, never mutated by the
/// fetch path; only the merge functions in [`crate::merge`] derive successors
/// from it.
#[derive(Debug, Clone, PartialEq)]
pub struct ListSnapshot {
    pub items: Vec<Record>,
    pub total_count: u64,
    pub page_index: u32,
    pub page_size: u32,
    pub filter: Option<String>,
    pub fetched_at: DateTime<Utc>,
}

impl ListSnapshot {
    /// The snapshot a view starts from before its first fetch resolves.
    /// `fetched_at` is pinned to the minimum representable instant so any
    /// real fetch replaces it.
    pub fn empty(page_index: u32, page_size: u32, filter: Option<String>) -> Self {
        Self {
            items: Vec::new(),
            total_count: 0,
            page_index,
            page_size,
            filter,
            fetched_at: DateTime::<Utc>::MIN_UTC,
        }
    }

    pub fn contains(&self, id: RecordId) -> bool {
        self.items.iter().any(|record| record.id == id)
    }
}

/// The currently displayed state: the last authoritative snapshot plus any
/// accepted incremental patches. `pending_stale` marks that an event could
/// not be safely merged and the page may be out of date until the next fetch.
#[derive(Debug, Clone, PartialEq)]
pub struct CacheState {
    pub snapshot: ListSnapshot,
    pub pending_stale: bool,
}

impl CacheState {
    pub fn new(page_index: u32, page_size: u32, filter: Option<String>) -> Self {
        Self {
            snapshot: ListSnapshot::empty(page_index, page_size, filter),
            pending_stale: false,
        }
    }
}

/// Whether a record belongs to the active filter, as far as the client can
/// tell. `Unknown` is the honest answer for filters that only the server can
/// evaluate; the merge functions fall back to marking the cache stale.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FilterOutcome {
    Matches,
    DoesNotMatch,
    Unknown,
}

pub trait FilterEval: Send + Sync {
    fn record_matches(&self, filter: Option<&str>, record: &Record) -> FilterOutcome;

    /// Membership by id alone, for deletions of records not on this page.
    /// Without a record payload there is usually nothing to evaluate, so the
    /// default is `Unknown`.
    fn id_in_filtered_set(&self, filter: Option<&str>, id: RecordId) -> FilterOutcome {
        let _ = (filter, id);
        FilterOutcome::Unknown
    }
}

/// Case-insensitive substring match over the record's text projection. The
/// reference store applies the same rule server-side, which makes this
/// approximation exact for that store.
pub struct SubstringFilter;

impl FilterEval for SubstringFilter {
    fn record_matches(&self, filter: Option<&str>, record: &Record) -> FilterOutcome {
        let Some(needle) = filter.map(str::trim).filter(|needle| !needle.is_empty()) else {
            return FilterOutcome::Matches;
        };
        if record.search_text().contains(&needle.to_lowercase()) {
            FilterOutcome::Matches
        } else {
            FilterOutcome::DoesNotMatch
        }
    }
}

/// Evaluator for stores whose filters the client cannot reproduce. Anything
/// filtered is `Unknown`; an unfiltered view still matches everything.
pub struct OpaqueFilter;

impl FilterEval for OpaqueFilter {
    fn record_matches(&self, filter: Option<&str>, _record: &Record) -> FilterOutcome {
        match filter {
            Some(_) => FilterOutcome::Unknown,
            None => FilterOutcome::Matches,
        }
    }
}
