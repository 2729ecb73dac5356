//! Listener capability set.

/// Receives change notifications for one watched directory.
///
/// Callbacks run on the dispatch pool. Calls for one directory never overlap
/// and arrive in the order the native events were observed; calls for
/// different directories may run in parallel. A callback may still arrive
/// shortly after its token was removed if delivery was already in flight.
pub trait FileEventListener: Send + Sync {
    /// A direct child of the directory was created, deleted or modified.
    fn changed(&self, name: &str);

    /// Native events were lost; re-read whatever state depends on them.
    fn events_missed(&self) {}

    /// The watch is gone for good (directory removed, renamed or the service
    /// shut down). No further calls follow.
    fn listener_abandoned(&self) {}
}

impl<F> FileEventListener for F
where
    F: Fn(&str) + Send + Sync,
{
    fn changed(&self, name: &str) {
        self(name)
    }
}
