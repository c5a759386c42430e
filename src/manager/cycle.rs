use crate::module::ModuleId;
use crate::sample::Sample;
use std::collections::{HashMap, HashSet};
use std::sync::Arc;

/// Bookkeeping for the sample currently moving through the modules
#[derive(Debug)]
pub(crate) struct Cycle {
    pub sample: Arc<Sample>,
    /// One restricted sample per explicitly requested stream group
    pub groups: Vec<Arc<Sample>>,
    /// Flush epoch the capture started in
    pub epoch: u64,
    /// Modules scheduled for this sample, in enablement order
    pub expected: Vec<ModuleId>,
    /// Modules with a fresh result, in completion order
    pub ready: Vec<ModuleId>,
    /// Scheduled modules that are done, successfully or not
    pub finished: usize,
    /// Readiness events so far; the raw group sample counts as one
    pub events: usize,
    /// Events already handed to the caller by earlier acquires
    pub seen: usize,
    /// Returned by an acquire at least once
    pub delivered: bool,
}

impl Cycle {
    pub fn new(sample: Arc<Sample>, groups: Vec<Arc<Sample>>, epoch: u64, expected: Vec<ModuleId>) -> Self {
        let events = usize::from(!groups.is_empty());
        Self {
            sample,
            groups,
            epoch,
            expected,
            ready: Vec::new(),
            finished: 0,
            events,
            seen: 0,
            delivered: false,
        }
    }

    pub fn is_complete(&self) -> bool {
        self.finished >= self.expected.len()
    }

    pub fn mark_ready(&mut self, id: ModuleId) {
        self.ready.push(id);
        self.finished += 1;
        self.events += 1;
    }

    /// Module failed or was paused mid-cycle: done, but without a result
    pub fn mark_skipped(&mut self) {
        self.finished += 1;
    }

    /// Whether an acquire may return this cycle now
    pub fn deliverable(&self, wait_all: bool) -> bool {
        if wait_all {
            self.is_complete()
        } else {
            self.events > self.seen || self.is_complete()
        }
    }

    /// Record that an acquire returned this cycle
    pub fn deliver(&mut self) {
        self.seen = self.events;
        self.delivered = true;
    }

    /// Already handed out, finished, and nothing new since
    pub fn exhausted(&self) -> bool {
        self.delivered && self.is_complete() && self.seen >= self.events
    }

    /// Freeze the current readiness together with the stale results of
    /// paused modules
    pub fn snapshot(&self, stale: HashMap<ModuleId, Arc<Sample>>) -> Snapshot {
        Snapshot {
            sample: Arc::clone(&self.sample),
            groups: self.groups.clone(),
            ready: self.ready.clone(),
            stale,
        }
    }
}

/// Last results of the paused modules
pub(crate) fn stale_results(
    paused: &HashSet<ModuleId>,
    last_processed: &HashMap<ModuleId, Arc<Sample>>,
) -> HashMap<ModuleId, Arc<Sample>> {
    paused
        .iter()
        .filter_map(|id| last_processed.get(id).map(|sample| (*id, Arc::clone(sample))))
        .collect()
}

/// What queries see: frozen at acquire in pull mode, tracking the live
/// cycle in push mode
#[derive(Debug, Clone)]
pub(crate) struct Snapshot {
    pub sample: Arc<Sample>,
    pub groups: Vec<Arc<Sample>>,
    pub ready: Vec<ModuleId>,
    /// Paused modules at publish time, with the sample they last processed
    pub stale: HashMap<ModuleId, Arc<Sample>>,
}

impl Snapshot {
    pub fn is_ready(&self, id: ModuleId) -> bool {
        self.ready.contains(&id)
    }

    /// The sample behind a module's result: this frame's when ready, the
    /// last processed one when the module was paused
    pub fn result_of(&self, id: ModuleId) -> Option<&Arc<Sample>> {
        if self.is_ready(id) {
            Some(&self.sample)
        } else {
            self.stale.get(&id)
        }
    }
}
