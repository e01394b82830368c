//! Synchronized control of several measurements.
//!
//! All control operations funnel through the dispatch queue as a single
//! synchronized item the runner applies between blocks, under each child's
//! mutex, so every registered measurement observes the identical stream
//! prefix between any two boundary operations.

use std::sync::{Arc, Weak};

use parking_lot::Mutex;
use tracing::debug;

use crate::engine::Engine;
use crate::error::Result;
use crate::fence::wait_deadline;
use crate::measure::cell::{GroupMember, GroupOp};
use crate::measure::{Host, Measure, Measurement};
use crate::runner::{StreamItem, SyncAction};

/// Starts, stops and clears a set of measurements as if they processed the
/// identical stream prefix.
pub struct SyncGroup {
    engine: Engine,
    members: Mutex<Vec<Weak<dyn GroupMember>>>,
}

impl SyncGroup {
    pub fn new(engine: &Engine) -> Self {
        Self {
            engine: engine.clone(),
            members: Mutex::new(Vec::new()),
        }
    }

    /// A proxy host: measurements constructed against it are adopted into
    /// this group and do not start automatically.
    pub fn tagger(&self) -> Host<'_> {
        Host {
            engine: &self.engine,
            group: Some(self),
        }
    }

    /// Adds an existing measurement to the group.
    pub fn register<M: Measure>(&self, measurement: &Measurement<M>) {
        let member: Arc<dyn GroupMember> = measurement.cell.clone();
        self.adopt(member);
    }

    /// Removes a measurement from the group. Does nothing if it is not a
    /// member.
    pub fn unregister<M: Measure>(&self, measurement: &Measurement<M>) {
        let id = measurement.cell.measurement_id();
        self.members
            .lock()
            .retain(|w| w.upgrade().is_some_and(|m| m.member_id() != id));
    }

    pub(crate) fn adopt(&self, member: Arc<dyn GroupMember>) {
        debug!(id = member.member_id(), "measurement adopted into group");
        self.members.lock().push(Arc::downgrade(&member));
    }

    /// Starts all registered measurements on the same block boundary.
    pub fn start(&self) {
        let fence = self.engine.get_fence(true);
        self.send_op(GroupOp::Start { fence });
    }

    /// Starts all registered measurements with a shared capture bound.
    pub fn start_for(&self, duration_ps: i64, clear_first: bool) {
        let fence = self.engine.get_fence(true);
        self.send_op(GroupOp::StartFor {
            fence,
            duration: duration_ps,
            clear_first,
        });
    }

    /// Stops all registered measurements on the same block boundary.
    pub fn stop(&self) {
        self.send_op(GroupOp::Stop);
    }

    /// Clears all registered measurements on the same block boundary.
    pub fn clear(&self) {
        self.send_op(GroupOp::Clear);
    }

    /// Waits for every member to finish. Returns false if any member timed
    /// out; surfaces the first stored fault.
    pub fn wait_until_finished(&self, timeout_ms: i64) -> Result<bool> {
        let deadline = wait_deadline(timeout_ms);
        let mut all_finished = true;

        for member in self.alive_members() {
            all_finished &= member.group_wait_finished(deadline)?;
        }

        Ok(all_finished)
    }

    /// Whether any member is still collecting data.
    pub fn is_running(&self) -> bool {
        self.alive_members()
            .iter()
            .any(|m| m.group_is_running())
    }

    fn alive_members(&self) -> Vec<Arc<dyn GroupMember>> {
        let mut members = self.members.lock();
        members.retain(|w| w.upgrade().is_some());
        members.iter().filter_map(|w| w.upgrade()).collect()
    }

    fn send_op(&self, op: GroupOp) {
        let actions: Vec<SyncAction> = self
            .members
            .lock()
            .iter()
            .map(|member| SyncAction {
                member: Weak::clone(member),
                op: op.clone(),
            })
            .collect();

        if actions.is_empty() {
            return;
        }

        let _ = self.engine.core().send(StreamItem::Sync(actions));
    }
}
