//! Extension points around transaction boundaries.

use std::collections::VecDeque;

use meridian_common::error::MeridianResult;
use meridian_common::types::{BackendId, SubXactId};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum XactEvent {
    PreCommit,
    Commit,
    PrePrepare,
    Prepare,
    Abort,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SubXactEvent {
    StartSub,
    CommitSub,
    AbortSub,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct CallbackId(u64);

pub type XactCallback = Box<dyn FnMut(XactEvent) -> MeridianResult<()> + Send>;
/// Arguments: event, the sub-transaction, its parent.
pub type SubXactCallback =
    Box<dyn FnMut(SubXactEvent, SubXactId, SubXactId) -> MeridianResult<()> + Send>;

#[derive(Default)]
pub struct XactCallbacks {
    next_id: u64,
    xact: Vec<(CallbackId, XactCallback)>,
    once: Vec<(CallbackId, XactCallback)>,
    subxact: Vec<(CallbackId, SubXactCallback)>,
}

impl XactCallbacks {
    pub fn register_xact(&mut self, cb: XactCallback) -> CallbackId {
        let id = self.next_id();
        self.xact.push((id, cb));
        id
    }

    /// Callback for the current transaction only; dropped once it commits,
    /// aborts or prepares.
    pub fn register_xact_once(&mut self, cb: XactCallback) -> CallbackId {
        let id = self.next_id();
        self.once.push((id, cb));
        id
    }

    pub fn register_subxact(&mut self, cb: SubXactCallback) -> CallbackId {
        let id = self.next_id();
        self.subxact.push((id, cb));
        id
    }

    pub fn unregister(&mut self, id: CallbackId) -> bool {
        let before = self.len();
        self.xact.retain(|(i, _)| *i != id);
        self.once.retain(|(i, _)| *i != id);
        self.subxact.retain(|(i, _)| *i != id);
        before != self.len()
    }

    fn len(&self) -> usize {
        self.xact.len() + self.once.len() + self.subxact.len()
    }

    fn next_id(&mut self) -> CallbackId {
        self.next_id += 1;
        CallbackId(self.next_id)
    }

    /// Run every callback; stops at the first error.
    pub fn fire_xact(&mut self, event: XactEvent) -> MeridianResult<()> {
        for (_, cb) in self.xact.iter_mut().chain(self.once.iter_mut()) {
            cb(event)?;
        }
        self.retire_once(event);
        Ok(())
    }

    fn retire_once(&mut self, event: XactEvent) {
        if matches!(event, XactEvent::Commit | XactEvent::Abort | XactEvent::Prepare) {
            self.once.clear();
        }
    }

    /// Run every callback, logging failures. Used once the outcome is fixed.
    pub fn fire_xact_best_effort(&mut self, event: XactEvent) {
        for (id, cb) in self.xact.iter_mut().chain(self.once.iter_mut()) {
            if let Err(e) = cb(event) {
                tracing::warn!("transaction callback {:?} failed on {:?}: {}", id, event, e);
            }
        }
        self.retire_once(event);
    }

    pub fn fire_subxact(
        &mut self,
        event: SubXactEvent,
        sub: SubXactId,
        parent: SubXactId,
    ) -> MeridianResult<()> {
        for (_, cb) in self.subxact.iter_mut() {
            cb(event, sub, parent)?;
        }
        Ok(())
    }

    pub fn fire_subxact_best_effort(&mut self, event: SubXactEvent, sub: SubXactId, parent: SubXactId) {
        for (id, cb) in self.subxact.iter_mut() {
            if let Err(e) = cb(event, sub, parent) {
                tracing::warn!("subtransaction callback {:?} failed on {:?}: {}", id, event, e);
            }
        }
    }
}

/// Deferred work that must run before a transaction may commit. Running an
/// action may queue more work of either kind.
pub type PreCommitAction = Box<dyn FnOnce(&mut PreCommitQueue) -> MeridianResult<()> + Send>;

#[derive(Default)]
pub struct PreCommitQueue {
    triggers: VecDeque<PreCommitAction>,
    cursors: VecDeque<PreCommitAction>,
    rounds: usize,
}

impl PreCommitQueue {
    pub fn defer_trigger(&mut self, action: PreCommitAction) {
        self.triggers.push_back(action);
    }

    /// Materialization of a holdable cursor, run at pre-commit.
    pub fn register_holdable_cursor(&mut self, action: PreCommitAction) {
        self.cursors.push_back(action);
    }

    pub fn pending(&self) -> usize {
        self.triggers.len() + self.cursors.len()
    }

    /// Rounds taken by the last `run_to_fixed_point`.
    pub fn rounds(&self) -> usize {
        self.rounds
    }

    fn fire_deferred_triggers(&mut self) -> MeridianResult<()> {
        while let Some(action) = self.triggers.pop_front() {
            action(self)?;
        }
        Ok(())
    }

    /// Returns whether any cursor work ran.
    fn commit_holdable_cursors(&mut self) -> MeridianResult<bool> {
        if self.cursors.is_empty() {
            return Ok(false);
        }
        let batch: Vec<PreCommitAction> = self.cursors.drain(..).collect();
        for action in batch {
            action(self)?;
        }
        Ok(true)
    }

    /// Fire deferred triggers and materialize holdable cursors until neither
    /// produces more work.
    pub fn run_to_fixed_point(&mut self) -> MeridianResult<()> {
        self.rounds = 0;
        loop {
            self.rounds += 1;
            self.fire_deferred_triggers()?;
            if !self.commit_holdable_cursors()? {
                break;
            }
        }
        Ok(())
    }

    pub fn clear(&mut self) {
        self.triggers.clear();
        self.cursors.clear();
    }
}

/// Resource group accounting, told about every top-level transaction.
pub trait ResourceGroupHook: Send + Sync {
    fn on_xact_start(&self, backend: BackendId) -> MeridianResult<()>;
    fn on_xact_end(&self, backend: BackendId, committed: bool);
}

pub struct NoopResourceGroup;

impl ResourceGroupHook for NoopResourceGroup {
    fn on_xact_start(&self, _backend: BackendId) -> MeridianResult<()> {
        Ok(())
    }

    fn on_xact_end(&self, _backend: BackendId, _committed: bool) {}
}
