use std::sync::atomic::{AtomicU64, Ordering};

/// Point-in-time copy of the operation counters of a [`MemorySource`](super::MemorySource).
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct SourceStats {
    pub finds: u64,
    pub counts: u64,
    pub inserts: u64,
    pub updates: u64,
    pub deletes: u64,
    pub find_and_modify: u64,
    pub aggregates: u64,
    pub distincts: u64,
    pub cursors_opened: u64,
    pub cursors_closed: u64,
    pub documents_returned: u64,
}

#[derive(Debug, Default)]
pub(crate) struct Counters {
    pub(crate) finds: AtomicU64,
    pub(crate) counts: AtomicU64,
    pub(crate) inserts: AtomicU64,
    pub(crate) updates: AtomicU64,
    pub(crate) deletes: AtomicU64,
    pub(crate) find_and_modify: AtomicU64,
    pub(crate) aggregates: AtomicU64,
    pub(crate) distincts: AtomicU64,
    pub(crate) cursors_opened: AtomicU64,
    pub(crate) cursors_closed: AtomicU64,
    pub(crate) documents_returned: AtomicU64,
}

pub(crate) fn bump(counter: &AtomicU64) {
    counter.fetch_add(1, Ordering::Relaxed);
}

impl Counters {
    pub(crate) fn snapshot(&self) -> SourceStats {
        let load = |c: &AtomicU64| c.load(Ordering::Relaxed);
        SourceStats {
            finds: load(&self.finds),
            counts: load(&self.counts),
            inserts: load(&self.inserts),
            updates: load(&self.updates),
            deletes: load(&self.deletes),
            find_and_modify: load(&self.find_and_modify),
            aggregates: load(&self.aggregates),
            distincts: load(&self.distincts),
            cursors_opened: load(&self.cursors_opened),
            cursors_closed: load(&self.cursors_closed),
            documents_returned: load(&self.documents_returned),
        }
    }

    pub(crate) fn reset(&self) {
        for c in [
            &self.finds,
            &self.counts,
            &self.inserts,
            &self.updates,
            &self.deletes,
            &self.find_and_modify,
            &self.aggregates,
            &self.distincts,
            &self.cursors_opened,
            &self.cursors_closed,
            &self.documents_returned,
        ] {
            c.store(0, Ordering::Relaxed);
        }
    }
}
