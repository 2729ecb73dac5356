//! Shared recursive watches.
//!
//! Directories below the same root-level directory share one native subtree
//! watch anchored at that directory. The watch lives exactly as long as at
//! least one entry relies on it.

use std::path::{Path, PathBuf};
use std::sync::Arc;

use arc_swap::ArcSwap;

use crate::registrar::{HandleId, WatchHandle};

use super::entry::{DirectoryWatchEntry, update_list};

/// State of one anchor in the anchor map.
#[derive(Clone)]
pub(crate) enum SubtreeState {
    Active(Arc<SubtreeWatch>),
    /// The registrar refused a subtree watch here. Permanent.
    Failed,
}

impl SubtreeState {
    /// Whether this state is `Active(watch)` for exactly `watch`.
    pub(crate) fn is_watch(&self, watch: &Arc<SubtreeWatch>) -> bool {
        matches!(self, SubtreeState::Active(w) if Arc::ptr_eq(w, watch))
    }
}

/// A native subtree watch and the entries relying on it.
pub(crate) struct SubtreeWatch {
    anchor: PathBuf,
    handle: Arc<dyn WatchHandle>,
    entries: ArcSwap<Vec<Arc<DirectoryWatchEntry>>>,
}

impl SubtreeWatch {
    pub(crate) fn new(
        anchor: PathBuf,
        handle: Arc<dyn WatchHandle>,
        first: Arc<DirectoryWatchEntry>,
    ) -> Arc<Self> {
        Arc::new(Self {
            anchor,
            handle,
            entries: ArcSwap::from_pointee(vec![first]),
        })
    }

    pub(crate) fn anchor(&self) -> &Path {
        &self.anchor
    }

    pub(crate) fn handle(&self) -> &Arc<dyn WatchHandle> {
        &self.handle
    }

    pub(crate) fn handle_id(&self) -> HandleId {
        self.handle.id()
    }

    pub(crate) fn entry_count(&self) -> usize {
        self.entries.load().len()
    }

    /// Attach an entry. Fails once the entry set has drained to empty.
    pub(crate) fn add_entry(&self, entry: &Arc<DirectoryWatchEntry>) -> bool {
        update_list(&self.entries, |current| {
            if current.is_empty() {
                return None;
            }
            let mut next = current.to_vec();
            next.push(Arc::clone(entry));
            Some(next)
        })
        .is_some()
    }

    /// Detach an entry.
    ///
    /// Returns `true` only for the call that empties the set, so exactly one
    /// caller ends up cancelling the native handle.
    pub(crate) fn remove_entry(&self, entry: &Arc<DirectoryWatchEntry>) -> bool {
        let swapped = update_list(&self.entries, |current| {
            if !current.iter().any(|e| Arc::ptr_eq(e, entry)) {
                return None;
            }
            Some(
                current
                    .iter()
                    .filter(|e| !Arc::ptr_eq(e, entry))
                    .cloned()
                    .collect(),
            )
        });
        matches!(swapped, Some((_, next)) if next.is_empty())
    }

    /// Empty the entry set so no entry can attach any more.
    pub(crate) fn close(&self) -> Vec<Arc<DirectoryWatchEntry>> {
        let previous = self.entries.swap(Arc::new(Vec::new()));
        previous.to_vec()
    }

    pub(crate) fn is_closed(&self) -> bool {
        self.entries.load().is_empty()
    }
}
