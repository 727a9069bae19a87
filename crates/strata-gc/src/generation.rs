//! Generations: object lists with allocation counters and thresholds

use std::time::Duration;

use crate::list::ObjectList;
use crate::object::{ListId, ObjRef};

/// Per-generation collection statistics
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct GenerationStats {
    /// Collections of this generation (including the younger ones it scans)
    pub collections: usize,
    /// Objects freed by those collections
    pub collected: usize,
    /// Objects moved to quarantine by those collections
    pub uncollectable: usize,
    /// Pause of the most recent collection
    pub last_pause: Duration,
    /// Pause accumulated over all collections
    pub total_pause: Duration,
}

pub(crate) struct Generation {
    pub(crate) list: ObjectList,
    /// Generation 0: objects tracked since its last collection.
    /// Older generations: collections of the next younger generation.
    pub(crate) count: usize,
    pub(crate) threshold: usize,
    pub(crate) stats: GenerationStats,
}

impl Generation {
    pub(crate) fn new(index: u8, threshold: usize) -> Self {
        Self {
            list: ObjectList::new(ListId::Generation(index)),
            count: 0,
            threshold,
            stats: GenerationStats::default(),
        }
    }

    /// Whether the counter has crossed a non-zero threshold.
    #[inline]
    pub(crate) fn over_threshold(&self) -> bool {
        self.threshold > 0 && self.count > self.threshold
    }

    #[inline]
    pub(crate) fn len(&self) -> usize {
        self.list.len()
    }

    pub(crate) fn objects(&self) -> Vec<ObjRef> {
        self.list.to_vec()
    }

    pub(crate) fn record(&mut self, collected: usize, uncollectable: usize, pause: Duration) {
        self.stats.collections += 1;
        self.stats.collected += collected;
        self.stats.uncollectable += uncollectable;
        self.stats.last_pause = pause;
        self.stats.total_pause += pause;
    }
}
