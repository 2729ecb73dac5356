//! Concurrent path → entry registry and path helpers.
//!
//! Keys are lexically normalized absolute directory paths, so `/a/./b` and
//! `/a/b/` share one entry.

use std::path::{Component, Path, PathBuf};
use std::sync::Arc;

use dashmap::DashMap;
use dashmap::mapref::entry::Entry;

use super::entry::{DirectoryWatchEntry, ListenerSlot};

/// Lexically normalize a path (`.` and `..` resolved, trailing separators
/// dropped). Symlinks are not resolved.
pub fn normalize_path(path: &Path) -> PathBuf {
    PathBuf::from(path_clean::clean(path))
}

/// Root-level directory that anchors the subtree watch covering `path`.
///
/// `None` for a root itself, which is always watched directly. A directory
/// directly below a root is its own anchor.
pub fn subtree_anchor(path: &Path) -> Option<PathBuf> {
    let mut anchor = PathBuf::new();
    for component in path.components() {
        match component {
            Component::Prefix(_) | Component::RootDir => anchor.push(component.as_os_str()),
            Component::Normal(name) => {
                anchor.push(name);
                return Some(anchor);
            }
            Component::CurDir | Component::ParentDir => return None,
        }
    }
    None
}

/// Result of publishing a freshly created entry.
pub(crate) enum Published {
    /// The fresh entry is now the registered one.
    Inserted,
    /// A live entry was already registered and took the listener instead.
    Joined(Arc<DirectoryWatchEntry>),
}

/// Registry of watched directories.
#[derive(Default)]
pub(crate) struct PathRegistry {
    entries: DashMap<PathBuf, Arc<DirectoryWatchEntry>>,
}

impl PathRegistry {
    pub(crate) fn new() -> Self {
        Self::default()
    }

    pub(crate) fn get(&self, path: &Path) -> Option<Arc<DirectoryWatchEntry>> {
        self.entries.get(path).map(|e| Arc::clone(e.value()))
    }

    /// Publish `fresh` under its path.
    ///
    /// A live registered entry takes `slot` and wins; a torn down one is
    /// replaced.
    ///
    /// # Panics
    ///
    /// If both `fresh` and a live registered entry are direct watches. Direct
    /// installs for one path are serialized, so this means two native watches
    /// exist for the same directory.
    pub(crate) fn publish(&self, fresh: &Arc<DirectoryWatchEntry>, slot: &ListenerSlot) -> Published {
        match self.entries.entry(fresh.path().to_path_buf()) {
            Entry::Vacant(vacant) => {
                vacant.insert(Arc::clone(fresh));
                Published::Inserted
            }
            Entry::Occupied(mut occupied) => {
                let existing = Arc::clone(occupied.get());
                if existing.is_live() && !existing.is_subtree() && !fresh.is_subtree() {
                    panic!(
                        "direct watch for {} installed concurrently",
                        fresh.path().display()
                    );
                }
                if existing.try_add(slot.clone()) {
                    return Published::Joined(existing);
                }
                occupied.insert(Arc::clone(fresh));
                Published::Inserted
            }
        }
    }

    /// Remove `entry` if it is still the one registered under its path.
    pub(crate) fn remove_if_same(&self, entry: &Arc<DirectoryWatchEntry>) -> bool {
        self.entries
            .remove_if(entry.path(), |_, current| Arc::ptr_eq(current, entry))
            .is_some()
    }

    /// Entries watched through `handle_id` at or below `root`.
    pub(crate) fn under(
        &self,
        root: &Path,
        handle_id: crate::registrar::HandleId,
    ) -> Vec<Arc<DirectoryWatchEntry>> {
        self.entries
            .iter()
            .filter(|e| e.key().starts_with(root) && e.value().handle_id() == handle_id)
            .map(|e| Arc::clone(e.value()))
            .collect()
    }

    pub(crate) fn drain(&self) -> Vec<Arc<DirectoryWatchEntry>> {
        let keys: Vec<PathBuf> = self.entries.iter().map(|e| e.key().clone()).collect();
        keys.iter()
            .filter_map(|k| self.entries.remove(k).map(|(_, v)| v))
            .collect()
    }

    pub(crate) fn len(&self) -> usize {
        self.entries.len()
    }

    pub(crate) fn listener_count(&self) -> usize {
        self.entries.iter().map(|e| e.value().listener_count()).sum()
    }
}
