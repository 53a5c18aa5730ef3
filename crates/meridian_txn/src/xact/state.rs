//! The per-backend transaction state stack.
//!
//! Frames live in a `Vec` arena: index 0 is the top-level transaction, the
//! last element is the innermost open subtransaction. `parent` and
//! `fast_link` are indices into the arena, and a frame never outlives the
//! frames below it.

use std::fmt;

use meridian_common::config::XactConfig;
use meridian_common::error::{MeridianError, MeridianResult, XactError};
use meridian_common::types::{SubXactId, Xid};

use crate::resource::ResourceOwner;

/// Low-level transaction state.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TransState {
    Default,
    Start,
    InProgress,
    Commit,
    Abort,
    Prepare,
}

impl fmt::Display for TransState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            TransState::Default => "DEFAULT",
            TransState::Start => "START",
            TransState::InProgress => "INPROGRESS",
            TransState::Commit => "COMMIT",
            TransState::Abort => "ABORT",
            TransState::Prepare => "PREPARE",
        };
        f.write_str(s)
    }
}

/// Client-visible transaction block state.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TBlockState {
    /// Not in a transaction block.
    Default,
    /// Running a single statement.
    Started,

    // Top-level block states.
    Begin,
    InProgress,
    ImplicitInProgress,
    End,
    Abort,
    AbortEnd,
    AbortPending,
    Prepare,

    // Subtransaction states.
    SubBegin,
    SubInProgress,
    SubRelease,
    SubCommit,
    SubAbort,
    SubAbortEnd,
    SubAbortPending,
    SubRestart,
    SubAbortRestart,
}

impl TBlockState {
    pub fn as_str(self) -> &'static str {
        match self {
            TBlockState::Default => "DEFAULT",
            TBlockState::Started => "STARTED",
            TBlockState::Begin => "BEGIN",
            TBlockState::InProgress => "INPROGRESS",
            TBlockState::ImplicitInProgress => "IMPLICIT_INPROGRESS",
            TBlockState::End => "END",
            TBlockState::Abort => "ABORT",
            TBlockState::AbortEnd => "ABORT_END",
            TBlockState::AbortPending => "ABORT_PENDING",
            TBlockState::Prepare => "PREPARE",
            TBlockState::SubBegin => "SUBBEGIN",
            TBlockState::SubInProgress => "SUBINPROGRESS",
            TBlockState::SubRelease => "SUBRELEASE",
            TBlockState::SubCommit => "SUBCOMMIT",
            TBlockState::SubAbort => "SUBABORT",
            TBlockState::SubAbortEnd => "SUBABORT_END",
            TBlockState::SubAbortPending => "SUBABORT_PENDING",
            TBlockState::SubRestart => "SUBRESTART",
            TBlockState::SubAbortRestart => "SUBABORT_RESTART",
        }
    }

    /// Whether the block has failed and only waits for ROLLBACK.
    pub fn is_failed(self) -> bool {
        matches!(self, TBlockState::Abort | TBlockState::SubAbort)
    }
}

impl fmt::Display for TBlockState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug)]
pub struct TransactionFrame {
    pub xid: Xid,
    pub subxid: SubXactId,
    /// Savepoint name; `None` for the top level and unnamed internal
    /// subtransactions.
    pub name: Option<String>,
    pub savepoint_level: u32,
    pub state: TransState,
    pub block_state: TBlockState,
    pub nesting_level: u32,
    pub guc_nest_level: u32,
    /// Xids of committed children, ascending.
    pub child_xids: Vec<Xid>,
    pub parent: Option<usize>,
    /// Ancestor `fast_link_interval` frames below, set on every
    /// `fast_link_interval`-th frame.
    pub fast_link: Option<usize>,
    pub owner: ResourceOwner,
}

impl TransactionFrame {
    fn top() -> Self {
        Self {
            xid: Xid::INVALID,
            subxid: SubXactId::TOP,
            name: None,
            savepoint_level: 0,
            state: TransState::Default,
            block_state: TBlockState::Default,
            nesting_level: 1,
            guc_nest_level: 1,
            child_xids: Vec::new(),
            parent: None,
            fast_link: None,
            owner: ResourceOwner::new("TopTransaction"),
        }
    }
}

pub struct TransactionStack {
    frames: Vec<TransactionFrame>,
    /// Last subtransaction id handed out in this top-level transaction.
    current_subxid: u32,
    fast_link_interval: usize,
    subtrans_warn_limit: u32,
    warned: bool,
}

impl TransactionStack {
    pub fn new(config: &XactConfig) -> Self {
        Self {
            frames: vec![TransactionFrame::top()],
            current_subxid: SubXactId::TOP.0,
            fast_link_interval: config.fast_link_interval.max(1),
            subtrans_warn_limit: config.subtrans_warn_limit,
            warned: false,
        }
    }

    pub fn depth(&self) -> usize {
        self.frames.len()
    }

    pub fn is_top_level(&self) -> bool {
        self.frames.len() == 1
    }

    pub fn current_index(&self) -> usize {
        self.frames.len() - 1
    }

    pub fn top(&self) -> &TransactionFrame {
        &self.frames[0]
    }

    pub fn top_mut(&mut self) -> &mut TransactionFrame {
        &mut self.frames[0]
    }

    pub fn current(&self) -> &TransactionFrame {
        &self.frames[self.frames.len() - 1]
    }

    pub fn current_mut(&mut self) -> &mut TransactionFrame {
        let i = self.frames.len() - 1;
        &mut self.frames[i]
    }

    pub fn frame(&self, index: usize) -> &TransactionFrame {
        &self.frames[index]
    }

    pub fn frame_mut(&mut self, index: usize) -> &mut TransactionFrame {
        &mut self.frames[index]
    }

    pub fn frames(&self) -> &[TransactionFrame] {
        &self.frames
    }

    pub fn current_subxid(&self) -> SubXactId {
        SubXactId(self.current_subxid)
    }

    /// Open a subtransaction frame above the current one.
    pub fn push(&mut self, name: Option<String>) -> MeridianResult<usize> {
        if self.current_subxid == u32::MAX {
            return Err(XactError::TooManySubtransactions.into());
        }
        self.current_subxid += 1;
        if self.current_subxid >= self.subtrans_warn_limit && !self.warned {
            self.warned = true;
            tracing::warn!(
                "transaction has opened {} subtransactions; excessive savepoints risk xid wraparound",
                self.current_subxid
            );
        }

        let parent = self.current_index();
        let index = parent + 1;
        let k = self.fast_link_interval;
        let fast_link = (index >= k && index % k == 0).then(|| index - k);
        let p = &self.frames[parent];
        let frame = TransactionFrame {
            xid: Xid::INVALID,
            subxid: SubXactId(self.current_subxid),
            name,
            savepoint_level: p.savepoint_level,
            state: TransState::Default,
            block_state: TBlockState::Default,
            nesting_level: p.nesting_level + 1,
            guc_nest_level: p.guc_nest_level + 1,
            child_xids: Vec::new(),
            parent: Some(parent),
            fast_link,
            owner: ResourceOwner::new("SubTransaction"),
        };
        self.frames.push(frame);
        Ok(index)
    }

    /// Close the innermost subtransaction frame.
    pub fn pop(&mut self) -> MeridianResult<TransactionFrame> {
        if self.is_top_level() {
            return Err(MeridianError::internal_bug(
                "XACT-POP-001",
                "cannot pop the top-level transaction frame",
                format!("state={}", self.top().state),
            ));
        }
        self.frames
            .pop()
            .ok_or_else(|| MeridianError::internal_bug("XACT-POP-002", "empty stack", ""))
    }

    /// Back to a single idle top-level frame.
    pub fn reset(&mut self) {
        self.frames.truncate(1);
        self.frames[0] = TransactionFrame::top();
        self.current_subxid = SubXactId::TOP.0;
        self.warned = false;
    }

    /// Whether `xid` belongs to this stack: one of the open frames' xids or
    /// a committed child of an open frame. Aborted frames never match.
    pub fn is_current(&self, xid: Xid) -> bool {
        if !xid.is_normal() {
            return false;
        }
        let mut next = Some(self.current_index());
        while let Some(i) = next {
            let frame = &self.frames[i];
            if frame.state != TransState::Abort && frame.xid.is_valid() {
                if frame.xid == xid {
                    return true;
                }
                if frame
                    .child_xids
                    .binary_search_by(|c| c.cmp_logical(&xid))
                    .is_ok()
                {
                    return true;
                }
                // Every frame further out has a smaller xid and smaller
                // children.
                if xid.follows(frame.xid) {
                    return false;
                }
            }
            next = match frame.fast_link {
                Some(link) => {
                    let lx = self.frames[link].xid;
                    if lx.is_valid() && xid.precedes_or_equals(lx) {
                        Some(link)
                    } else {
                        frame.parent
                    }
                }
                None => frame.parent,
            };
        }
        false
    }

    /// Fold a committed child's xids into its parent, keeping them sorted.
    pub fn merge_into_parent(&mut self, child: &TransactionFrame) {
        let Some(p) = child.parent else {
            return;
        };
        let parent = &mut self.frames[p];
        parent
            .child_xids
            .reserve(child.child_xids.len() + usize::from(child.xid.is_valid()));
        if child.xid.is_valid() {
            parent.child_xids.push(child.xid);
        }
        parent.child_xids.extend_from_slice(&child.child_xids);
        debug_assert!(parent
            .child_xids
            .windows(2)
            .all(|w| w[0].precedes(w[1])));
    }

    /// Innermost frame named `name`, searching outward.
    pub fn find_savepoint(&self, name: &str) -> Option<usize> {
        (0..self.frames.len())
            .rev()
            .find(|&i| self.frames[i].name.as_deref() == Some(name))
    }

    /// One line per frame, innermost first.
    pub fn describe(&self) -> String {
        let mut out = String::new();
        for (i, f) in self.frames.iter().enumerate().rev() {
            out.push_str(&format!(
                "{}: name: {}; blockState: {}; state: {}, xid/subid/cid: {}/{}, nestlvl: {}, children: {}\n",
                i,
                f.name.as_deref().unwrap_or("unnamed"),
                f.block_state,
                f.state,
                f.xid,
                f.subxid,
                f.nesting_level,
                f.child_xids
                    .iter()
                    .map(|x| x.to_string())
                    .collect::<Vec<_>>()
                    .join(" ")
            ));
        }
        out
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn stack(interval: usize) -> TransactionStack {
        let config = XactConfig {
            fast_link_interval: interval,
            ..XactConfig::default()
        };
        TransactionStack::new(&config)
    }

    fn open(stack: &mut TransactionStack, xid: u32) -> usize {
        let i = stack.push(None).unwrap();
        let f = stack.frame_mut(i);
        f.state = TransState::InProgress;
        f.xid = Xid(xid);
        i
    }

    #[test]
    fn test_fast_links_every_k_frames() {
        let mut s = stack(4);
        for n in 1..=9 {
            open(&mut s, 100 + n);
        }
        assert_eq!(s.frame(4).fast_link, Some(0));
        assert_eq!(s.frame(8).fast_link, Some(4));
        assert_eq!(s.frame(5).fast_link, None);
    }

    #[test]
    fn test_is_current_through_deep_stack() {
        let mut s = stack(3);
        s.top_mut().state = TransState::InProgress;
        s.top_mut().xid = Xid(100);
        for n in 1..=20 {
            open(&mut s, 100 + n * 2);
        }
        for n in 0..=20 {
            assert!(s.is_current(Xid(100 + n * 2)), "xid {}", 100 + n * 2);
        }
        assert!(!s.is_current(Xid(101)));
        assert!(!s.is_current(Xid(99)));
        assert!(!s.is_current(Xid(200)));
    }

    #[test]
    fn test_aborted_frame_is_not_current() {
        let mut s = stack(100);
        s.top_mut().state = TransState::InProgress;
        s.top_mut().xid = Xid(10);
        let i = open(&mut s, 11);
        s.frame_mut(i).state = TransState::Abort;
        assert!(!s.is_current(Xid(11)));
        assert!(s.is_current(Xid(10)));
    }

    #[test]
    fn test_merge_keeps_children_sorted() {
        let mut s = stack(100);
        s.top_mut().state = TransState::InProgress;
        s.top_mut().xid = Xid(10);
        open(&mut s, 11);
        let c = open(&mut s, 12);
        s.frame_mut(c).child_xids.push(Xid(13));
        let child = s.pop().unwrap();
        s.merge_into_parent(&child);
        let mid = s.pop().unwrap();
        s.merge_into_parent(&mid);
        assert_eq!(s.top().child_xids, vec![Xid(11), Xid(12), Xid(13)]);
        assert!(s.is_current(Xid(13)));
    }

    #[test]
    fn test_pop_top_is_a_bug() {
        let mut s = stack(100);
        assert!(s.pop().unwrap_err().is_internal_bug());
    }

    #[test]
    fn test_subxact_counter_refuses_to_wrap() {
        let mut s = stack(100);
        s.current_subxid = u32::MAX - 1;
        s.push(None).unwrap();
        let err = s.push(None).unwrap_err();
        assert!(matches!(
            err,
            MeridianError::Xact(XactError::TooManySubtransactions)
        ));
    }
}
