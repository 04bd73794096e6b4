//! Refresh bookkeeping owned by a route: local hit counters and the
//! per-key guard that keeps refreshes of one entry from overlapping.

use dashmap::DashMap;

use super::Fingerprint;

#[derive(Debug, Default)]
pub struct Refresher {
    counters: DashMap<Fingerprint, u64>,
    running: DashMap<Fingerprint, ()>,
}

impl Refresher {
    pub fn new() -> Self {
        Self::default()
    }

    /// Count a hit on `key`, wrapping to 0 every `max` hits.
    pub fn tick(&self, key: Fingerprint, max: u64) -> u64 {
        let mut counter = self.counters.entry(key).or_insert(0);
        *counter = (*counter + 1) % max.max(1);
        *counter
    }

    /// Claim the refresh of `key`; `None` while another one runs.
    pub fn begin(&self, key: Fingerprint) -> Option<RefreshGuard<'_>> {
        match self.running.entry(key) {
            dashmap::mapref::entry::Entry::Occupied(_) => None,
            dashmap::mapref::entry::Entry::Vacant(vacant) => {
                vacant.insert(());
                Some(RefreshGuard {
                    refresher: self,
                    key,
                })
            }
        }
    }

    /// Start counting `key` from zero; called whenever its entry is replaced.
    pub fn reset(&self, key: &Fingerprint) {
        self.counters.remove(key);
    }

    /// Drop the counters of entries that are gone.
    pub fn prune(&self, live: impl Fn(&Fingerprint) -> bool) -> usize {
        let before = self.counters.len();
        self.counters.retain(|key, _| live(key));
        before.saturating_sub(self.counters.len())
    }

    pub fn tracked(&self) -> usize {
        self.counters.len()
    }
}

/// Releases the refresh claim on drop
#[derive(Debug)]
pub struct RefreshGuard<'a> {
    refresher: &'a Refresher,
    key: Fingerprint,
}

impl Drop for RefreshGuard<'_> {
    fn drop(&mut self) {
        self.refresher.running.remove(&self.key);
    }
}
