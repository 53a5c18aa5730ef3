//! Statement-boundary and transaction-block commands.
//!
//! Every entry point dispatches on the block state of the current frame.
//! Block commands (`BEGIN`, `SAVEPOINT`, ...) only relabel frames; the work
//! happens at the next `commit_transaction_command`.

use meridian_common::error::{MeridianError, MeridianResult, XactError};

use super::state::{TBlockState, TransState};
use super::Backend;

impl Backend {
    // ── Statement boundaries ──

    /// Called before each statement.
    pub fn start_transaction_command(&mut self) -> MeridianResult<()> {
        match self.block_state() {
            TBlockState::Default => {
                self.start_transaction()?;
                self.stack.top_mut().block_state = if self.options.dtx_context.is_implicit_writer()
                {
                    TBlockState::ImplicitInProgress
                } else {
                    TBlockState::Started
                };
            }
            TBlockState::InProgress
            | TBlockState::ImplicitInProgress
            | TBlockState::SubInProgress
            | TBlockState::Abort
            | TBlockState::SubAbort => {}
            other => {
                return Err(MeridianError::invalid_state(
                    "start_transaction_command",
                    other,
                ))
            }
        }
        self.update_slot_xact_info();
        Ok(())
    }

    /// Called after each statement; performs whatever the block commands of
    /// the statement asked for.
    pub fn commit_transaction_command(&mut self) -> MeridianResult<()> {
        loop {
            match self.block_state() {
                TBlockState::Default => {
                    return Err(MeridianError::invalid_state(
                        "commit_transaction_command",
                        TBlockState::Default,
                    ));
                }
                TBlockState::Started | TBlockState::End => {
                    self.commit_transaction()?;
                    self.stack.top_mut().block_state = TBlockState::Default;
                }
                TBlockState::Begin => {
                    self.stack.top_mut().block_state = TBlockState::InProgress;
                }
                TBlockState::InProgress
                | TBlockState::ImplicitInProgress
                | TBlockState::SubInProgress => {
                    self.command_counter_increment()?;
                }
                TBlockState::Abort | TBlockState::SubAbort => {}
                TBlockState::AbortEnd => {
                    self.cleanup_transaction();
                    self.stack.top_mut().block_state = TBlockState::Default;
                }
                TBlockState::AbortPending => {
                    self.abort_transaction();
                    self.cleanup_transaction();
                    self.stack.top_mut().block_state = TBlockState::Default;
                }
                TBlockState::Prepare => {
                    let gid = self.prepare_gid.take().unwrap_or_default();
                    self.prepare_transaction(&gid)?;
                    self.stack.top_mut().block_state = TBlockState::Default;
                }
                TBlockState::SubBegin => {
                    self.start_subtransaction()?;
                    self.stack.current_mut().block_state = TBlockState::SubInProgress;
                }
                TBlockState::SubRelease => {
                    while self.block_state() == TBlockState::SubRelease {
                        self.commit_subtransaction()?;
                    }
                    let now = self.block_state();
                    if !matches!(now, TBlockState::InProgress | TBlockState::SubInProgress) {
                        return Err(MeridianError::invalid_state("RELEASE SAVEPOINT", now));
                    }
                }
                TBlockState::SubCommit => {
                    while self.block_state() == TBlockState::SubCommit {
                        self.commit_subtransaction()?;
                    }
                    match self.block_state() {
                        TBlockState::End => {
                            self.commit_transaction()?;
                            self.stack.top_mut().block_state = TBlockState::Default;
                        }
                        TBlockState::Prepare => {
                            let gid = self.prepare_gid.take().unwrap_or_default();
                            self.prepare_transaction(&gid)?;
                            self.stack.top_mut().block_state = TBlockState::Default;
                        }
                        other => {
                            return Err(MeridianError::internal_bug(
                                "XACT-BLOCK-001",
                                "subtransaction commit did not reach END or PREPARE",
                                format!("block state {}", other),
                            ));
                        }
                    }
                }
                TBlockState::SubAbortEnd => {
                    self.cleanup_subtransaction();
                    continue;
                }
                TBlockState::SubAbortPending => {
                    self.abort_subtransaction();
                    self.cleanup_subtransaction();
                    continue;
                }
                state @ (TBlockState::SubRestart | TBlockState::SubAbortRestart) => {
                    let frame = self.stack.current();
                    let name = frame.name.clone();
                    let savepoint_level = frame.savepoint_level;
                    if state == TBlockState::SubRestart {
                        self.abort_subtransaction();
                    }
                    self.cleanup_subtransaction();

                    self.stack.push(name)?;
                    let frame = self.stack.current_mut();
                    frame.savepoint_level = savepoint_level;
                    frame.block_state = TBlockState::SubBegin;
                    self.start_subtransaction()?;
                    self.stack.current_mut().block_state = TBlockState::SubInProgress;
                }
            }
            return Ok(());
        }
    }

    /// Error recovery: called when a statement failed.
    pub fn abort_current_transaction(&mut self) {
        loop {
            match self.block_state() {
                TBlockState::Default => {
                    if self.trans_state() != TransState::Default {
                        // Failed during start or commit outside any block.
                        self.abort_transaction();
                        self.cleanup_transaction();
                    }
                }
                TBlockState::Started
                | TBlockState::ImplicitInProgress
                | TBlockState::Begin
                | TBlockState::End
                | TBlockState::AbortPending
                | TBlockState::Prepare => {
                    self.abort_transaction();
                    self.cleanup_transaction();
                    self.stack.top_mut().block_state = TBlockState::Default;
                }
                TBlockState::InProgress => {
                    self.abort_transaction();
                    self.stack.top_mut().block_state = TBlockState::Abort;
                }
                TBlockState::Abort | TBlockState::SubAbort => {}
                TBlockState::AbortEnd => {
                    self.cleanup_transaction();
                    self.stack.top_mut().block_state = TBlockState::Default;
                }
                TBlockState::SubInProgress => {
                    self.abort_subtransaction();
                    self.stack.current_mut().block_state = TBlockState::SubAbort;
                }
                TBlockState::SubBegin
                | TBlockState::SubRelease
                | TBlockState::SubCommit
                | TBlockState::SubAbortPending
                | TBlockState::SubRestart => {
                    self.abort_subtransaction();
                    self.cleanup_subtransaction();
                    continue;
                }
                TBlockState::SubAbortEnd | TBlockState::SubAbortRestart => {
                    self.cleanup_subtransaction();
                    continue;
                }
            }
            return;
        }
    }

    /// Get out of any transaction at all, e.g. at backend exit.
    pub fn abort_out_of_any_transaction(&mut self) {
        loop {
            match self.block_state() {
                TBlockState::Default => {
                    if self.trans_state() != TransState::Default {
                        self.abort_transaction();
                        self.cleanup_transaction();
                    }
                }
                TBlockState::Started
                | TBlockState::ImplicitInProgress
                | TBlockState::Begin
                | TBlockState::InProgress
                | TBlockState::End
                | TBlockState::AbortPending
                | TBlockState::Prepare => {
                    self.abort_transaction();
                    self.cleanup_transaction();
                    self.stack.top_mut().block_state = TBlockState::Default;
                }
                TBlockState::Abort | TBlockState::AbortEnd => {
                    self.cleanup_transaction();
                    self.stack.top_mut().block_state = TBlockState::Default;
                }
                TBlockState::SubBegin
                | TBlockState::SubInProgress
                | TBlockState::SubRelease
                | TBlockState::SubCommit
                | TBlockState::SubAbortPending
                | TBlockState::SubRestart => {
                    self.abort_subtransaction();
                    self.cleanup_subtransaction();
                    continue;
                }
                TBlockState::SubAbort | TBlockState::SubAbortEnd | TBlockState::SubAbortRestart => {
                    self.cleanup_subtransaction();
                    continue;
                }
            }
            return;
        }
    }

    // ── Block commands ──

    /// `BEGIN`.
    pub fn begin_transaction_block(&mut self) -> MeridianResult<()> {
        match self.block_state() {
            TBlockState::Started | TBlockState::ImplicitInProgress => {
                self.stack.top_mut().block_state = TBlockState::Begin;
            }
            TBlockState::InProgress
            | TBlockState::SubInProgress
            | TBlockState::Abort
            | TBlockState::SubAbort => {
                tracing::warn!("there is already a transaction in progress");
            }
            other => return Err(MeridianError::invalid_state("BEGIN", other)),
        }
        Ok(())
    }

    /// `COMMIT`. Returns false when the block had failed and will roll back
    /// instead.
    pub fn end_transaction_block(&mut self) -> MeridianResult<bool> {
        match self.block_state() {
            TBlockState::InProgress => {
                self.stack.top_mut().block_state = TBlockState::End;
                Ok(true)
            }
            TBlockState::ImplicitInProgress => {
                if !self.options.dtx_context.is_implicit_writer() {
                    tracing::warn!("there is no transaction in progress");
                }
                self.stack.top_mut().block_state = TBlockState::End;
                Ok(true)
            }
            TBlockState::Abort => {
                self.stack.top_mut().block_state = TBlockState::AbortEnd;
                Ok(false)
            }
            TBlockState::SubInProgress => {
                let top = self.stack.current_index();
                for i in (1..=top).rev() {
                    let frame = self.stack.frame_mut(i);
                    if frame.block_state != TBlockState::SubInProgress {
                        return Err(MeridianError::invalid_state("COMMIT", frame.block_state));
                    }
                    frame.block_state = TBlockState::SubCommit;
                }
                let root = self.stack.top_mut();
                if root.block_state != TBlockState::InProgress {
                    return Err(MeridianError::invalid_state("COMMIT", root.block_state));
                }
                root.block_state = TBlockState::End;
                Ok(true)
            }
            TBlockState::SubAbort => {
                self.mark_subtransactions_for_abort()?;
                let root = self.stack.top_mut();
                root.block_state = match root.block_state {
                    TBlockState::InProgress => TBlockState::AbortPending,
                    TBlockState::Abort => TBlockState::AbortEnd,
                    other => return Err(MeridianError::invalid_state("COMMIT", other)),
                };
                Ok(false)
            }
            TBlockState::Started => {
                tracing::warn!("there is no transaction in progress");
                Ok(true)
            }
            other => Err(MeridianError::invalid_state("COMMIT", other)),
        }
    }

    /// `PREPARE TRANSACTION gid`. The actual prepare happens at the next
    /// `commit_transaction_command`.
    pub fn prepare_transaction_block(&mut self, gid: &str) -> MeridianResult<bool> {
        let result = self.end_transaction_block()?;
        if result {
            let top = self.stack.top_mut();
            if top.block_state == TBlockState::End {
                top.block_state = TBlockState::Prepare;
                self.prepare_gid = Some(gid.to_string());
                return Ok(true);
            }
            // COMMIT outside a block: nothing to prepare.
            return Ok(false);
        }
        Ok(false)
    }

    /// `ROLLBACK`.
    pub fn user_abort_transaction_block(&mut self) -> MeridianResult<()> {
        match self.block_state() {
            TBlockState::InProgress => {
                self.stack.top_mut().block_state = TBlockState::AbortPending;
            }
            TBlockState::Abort => {
                self.stack.top_mut().block_state = TBlockState::AbortEnd;
            }
            TBlockState::SubInProgress | TBlockState::SubAbort => {
                self.mark_subtransactions_for_abort()?;
                let root = self.stack.top_mut();
                root.block_state = match root.block_state {
                    TBlockState::InProgress => TBlockState::AbortPending,
                    TBlockState::Abort => TBlockState::AbortEnd,
                    other => return Err(MeridianError::invalid_state("ROLLBACK", other)),
                };
            }
            TBlockState::Started | TBlockState::ImplicitInProgress => {
                tracing::warn!("there is no transaction in progress");
                self.stack.top_mut().block_state = TBlockState::AbortPending;
            }
            other => return Err(MeridianError::invalid_state("ROLLBACK", other)),
        }
        Ok(())
    }

    /// Relabel every open subtransaction for rollback: live ones get
    /// aborted, already-aborted ones only cleaned up.
    fn mark_subtransactions_for_abort(&mut self) -> MeridianResult<()> {
        for i in (1..=self.stack.current_index()).rev() {
            let frame = self.stack.frame_mut(i);
            frame.block_state = match frame.block_state {
                TBlockState::SubInProgress => TBlockState::SubAbortPending,
                TBlockState::SubAbort => TBlockState::SubAbortEnd,
                other => return Err(MeridianError::invalid_state("ROLLBACK", other)),
            };
        }
        Ok(())
    }

    // ── Savepoints ──

    /// `SAVEPOINT name`.
    pub fn define_savepoint(&mut self, name: &str) -> MeridianResult<()> {
        match self.block_state() {
            TBlockState::InProgress | TBlockState::SubInProgress => {
                self.stack.push(Some(name.to_string()))?;
                self.stack.current_mut().block_state = TBlockState::SubBegin;
                Ok(())
            }
            TBlockState::ImplicitInProgress | TBlockState::Started => {
                Err(XactError::NoTransactionBlock("SAVEPOINT").into())
            }
            TBlockState::Abort | TBlockState::SubAbort => {
                Err(XactError::InFailedTransaction.into())
            }
            other => Err(MeridianError::invalid_state("SAVEPOINT", other)),
        }
    }

    /// `RELEASE SAVEPOINT name`: commits the named savepoint and everything
    /// opened after it.
    pub fn release_savepoint(&mut self, name: &str) -> MeridianResult<()> {
        match self.block_state() {
            TBlockState::InProgress => {
                return Err(XactError::NoSuchSavepoint(name.to_string()).into())
            }
            TBlockState::ImplicitInProgress | TBlockState::Started => {
                return Err(XactError::NoTransactionBlock("RELEASE SAVEPOINT").into())
            }
            TBlockState::Abort | TBlockState::SubAbort => {
                return Err(XactError::InFailedTransaction.into())
            }
            TBlockState::SubInProgress => {}
            other => return Err(MeridianError::invalid_state("RELEASE SAVEPOINT", other)),
        }

        let target = self.savepoint_target(name)?;
        for i in (target..=self.stack.current_index()).rev() {
            let frame = self.stack.frame_mut(i);
            if frame.block_state != TBlockState::SubInProgress {
                return Err(MeridianError::invalid_state(
                    "RELEASE SAVEPOINT",
                    frame.block_state,
                ));
            }
            frame.block_state = TBlockState::SubRelease;
        }
        Ok(())
    }

    /// `ROLLBACK TO SAVEPOINT name`: aborts everything after the savepoint
    /// and restarts it, keeping its name.
    pub fn rollback_to_savepoint(&mut self, name: &str) -> MeridianResult<()> {
        match self.block_state() {
            TBlockState::InProgress | TBlockState::Abort => {
                return Err(XactError::NoSuchSavepoint(name.to_string()).into())
            }
            TBlockState::ImplicitInProgress | TBlockState::Started => {
                return Err(XactError::NoTransactionBlock("ROLLBACK TO SAVEPOINT").into())
            }
            TBlockState::SubInProgress | TBlockState::SubAbort => {}
            other => {
                return Err(MeridianError::invalid_state(
                    "ROLLBACK TO SAVEPOINT",
                    other,
                ))
            }
        }

        let target = self.savepoint_target(name)?;
        for i in (target + 1..=self.stack.current_index()).rev() {
            let frame = self.stack.frame_mut(i);
            frame.block_state = match frame.block_state {
                TBlockState::SubInProgress => TBlockState::SubAbortPending,
                TBlockState::SubAbort => TBlockState::SubAbortEnd,
                other => {
                    return Err(MeridianError::invalid_state(
                        "ROLLBACK TO SAVEPOINT",
                        other,
                    ))
                }
            };
        }
        let frame = self.stack.frame_mut(target);
        frame.block_state = match frame.block_state {
            TBlockState::SubInProgress => TBlockState::SubRestart,
            TBlockState::SubAbort => TBlockState::SubAbortRestart,
            other => {
                return Err(MeridianError::invalid_state(
                    "ROLLBACK TO SAVEPOINT",
                    other,
                ))
            }
        };
        Ok(())
    }

    /// Frame index of the named savepoint, which must be a subtransaction
    /// at the current savepoint level.
    fn savepoint_target(&self, name: &str) -> MeridianResult<usize> {
        let level = self.stack.current().savepoint_level;
        match self.stack.find_savepoint(name) {
            Some(i) if i > 0 && self.stack.frame(i).savepoint_level == level => Ok(i),
            _ => Err(XactError::NoSuchSavepoint(name.to_string()).into()),
        }
    }

    // ── Internal subtransactions ──

    /// Open a subtransaction immediately, without waiting for a statement
    /// boundary. Used by callers that need to trap errors of a single step.
    pub fn begin_internal_subtransaction(&mut self, name: Option<&str>) -> MeridianResult<()> {
        match self.block_state() {
            TBlockState::Started
            | TBlockState::InProgress
            | TBlockState::ImplicitInProgress
            | TBlockState::End
            | TBlockState::Prepare
            | TBlockState::SubInProgress => {
                self.stack.push(name.map(str::to_string))?;
                self.stack.current_mut().block_state = TBlockState::SubBegin;
            }
            other => {
                return Err(MeridianError::invalid_state(
                    "begin_internal_subtransaction",
                    other,
                ))
            }
        }
        self.commit_transaction_command()?;
        self.start_transaction_command()
    }

    /// Commit the innermost internal subtransaction.
    pub fn release_current_subtransaction(&mut self) -> MeridianResult<()> {
        let state = self.block_state();
        if state != TBlockState::SubInProgress {
            return Err(MeridianError::invalid_state(
                "release_current_subtransaction",
                state,
            ));
        }
        self.commit_subtransaction()
    }

    /// Roll back and pop the innermost internal subtransaction.
    pub fn rollback_and_release_current_subtransaction(&mut self) -> MeridianResult<()> {
        match self.block_state() {
            TBlockState::SubInProgress => self.abort_subtransaction(),
            TBlockState::SubAbort => {}
            other => {
                return Err(MeridianError::invalid_state(
                    "rollback_and_release_current_subtransaction",
                    other,
                ))
            }
        }
        self.cleanup_subtransaction();
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use meridian_common::config::MeridianConfig;

    use super::*;
    use crate::shared::SharedState;
    use crate::xact::BackendOptions;

    fn backend() -> (Arc<SharedState>, Backend) {
        let shared = SharedState::in_memory(MeridianConfig::default()).unwrap();
        let backend = Backend::connect(&shared, BackendOptions::default()).unwrap();
        (shared, backend)
    }

    fn run(b: &mut Backend, f: impl FnOnce(&mut Backend) -> MeridianResult<()>) {
        b.start_transaction_command().unwrap();
        f(b).unwrap();
        b.commit_transaction_command().unwrap();
    }

    #[test]
    fn test_single_statement_commits_at_boundary() {
        let (_shared, mut b) = backend();
        b.start_transaction_command().unwrap();
        assert_eq!(b.block_state(), TBlockState::Started);
        assert!(!b.is_transaction_block());
        assert!(b.is_transaction_or_transaction_block());
        b.commit_transaction_command().unwrap();
        assert_eq!(b.block_state(), TBlockState::Default);
        assert_eq!(b.trans_state(), TransState::Default);
    }

    #[test]
    fn test_begin_commit_block() {
        let (shared, mut b) = backend();
        run(&mut b, |b| b.begin_transaction_block());
        assert_eq!(b.block_state(), TBlockState::InProgress);
        run(&mut b, |b| b.get_top_transaction_id().map(|_| ()));
        let xid = b.get_top_transaction_id_if_any().unwrap();
        run(&mut b, |b| b.end_transaction_block().map(|_| ()));
        assert_eq!(b.block_state(), TBlockState::Default);
        assert!(shared.xid_did_commit(xid));
    }

    #[test]
    fn test_failed_block_rejects_commit() {
        let (shared, mut b) = backend();
        run(&mut b, |b| b.begin_transaction_block());
        b.start_transaction_command().unwrap();
        let xid = b.get_top_transaction_id().unwrap();
        b.abort_current_transaction();
        assert_eq!(b.block_state(), TBlockState::Abort);
        assert!(b.block_state().is_failed());

        b.start_transaction_command().unwrap();
        assert!(!b.end_transaction_block().unwrap());
        b.commit_transaction_command().unwrap();
        assert_eq!(b.block_state(), TBlockState::Default);
        assert!(!shared.xid_did_commit(xid));
    }

    #[test]
    fn test_savepoint_outside_block_is_rejected() {
        let (_shared, mut b) = backend();
        b.start_transaction_command().unwrap();
        let err = b.define_savepoint("s1").unwrap_err();
        assert!(matches!(
            err,
            MeridianError::Xact(XactError::NoTransactionBlock("SAVEPOINT"))
        ));
        b.abort_current_transaction();
    }

    #[test]
    fn test_release_savepoint_commits_inner_frames() {
        let (_shared, mut b) = backend();
        run(&mut b, |b| b.begin_transaction_block());
        run(&mut b, |b| b.define_savepoint("a"));
        run(&mut b, |b| b.define_savepoint("b"));
        assert_eq!(b.get_current_transaction_nest_level(), 3);

        run(&mut b, |b| b.release_savepoint("a"));
        assert_eq!(b.get_current_transaction_nest_level(), 1);
        assert_eq!(b.block_state(), TBlockState::InProgress);
        run(&mut b, |b| b.end_transaction_block().map(|_| ()));
    }

    #[test]
    fn test_release_unknown_savepoint() {
        let (_shared, mut b) = backend();
        run(&mut b, |b| b.begin_transaction_block());
        b.start_transaction_command().unwrap();
        let err = b.release_savepoint("nope").unwrap_err();
        assert!(matches!(err, MeridianError::Xact(XactError::NoSuchSavepoint(_))));
        b.abort_current_transaction();
        b.abort_out_of_any_transaction();
    }

    #[test]
    fn test_rollback_to_savepoint_restarts_it() {
        let (shared, mut b) = backend();
        run(&mut b, |b| b.begin_transaction_block());
        run(&mut b, |b| b.define_savepoint("sp"));
        b.start_transaction_command().unwrap();
        let sub = b.get_current_transaction_id().unwrap();
        let subxid = b.get_current_sub_transaction_id();
        b.commit_transaction_command().unwrap();

        run(&mut b, |b| b.rollback_to_savepoint("sp"));
        assert_eq!(b.block_state(), TBlockState::SubInProgress);
        assert_eq!(b.stack.current().name.as_deref(), Some("sp"));
        assert_ne!(b.get_current_sub_transaction_id(), subxid);
        assert!(!b.transaction_id_is_current(sub));
        assert_eq!(shared.clog.status(sub), meridian_storage::XidStatus::Aborted);

        run(&mut b, |b| b.end_transaction_block().map(|_| ()));
        assert_eq!(b.block_state(), TBlockState::Default);
    }

    #[test]
    fn test_rollback_to_savepoint_after_error() {
        let (_shared, mut b) = backend();
        run(&mut b, |b| b.begin_transaction_block());
        run(&mut b, |b| b.define_savepoint("sp"));
        b.start_transaction_command().unwrap();
        b.abort_current_transaction();
        assert_eq!(b.block_state(), TBlockState::SubAbort);

        run(&mut b, |b| b.rollback_to_savepoint("sp"));
        assert_eq!(b.block_state(), TBlockState::SubInProgress);
        run(&mut b, |b| b.end_transaction_block().map(|_| ()));
        assert_eq!(b.block_state(), TBlockState::Default);
    }

    #[test]
    fn test_commit_with_failed_subtransaction_rolls_back() {
        let (shared, mut b) = backend();
        run(&mut b, |b| b.begin_transaction_block());
        b.start_transaction_command().unwrap();
        let top = b.get_top_transaction_id().unwrap();
        b.commit_transaction_command().unwrap();
        run(&mut b, |b| b.define_savepoint("sp"));
        b.start_transaction_command().unwrap();
        b.abort_current_transaction();

        b.start_transaction_command().unwrap();
        assert!(!b.end_transaction_block().unwrap());
        b.commit_transaction_command().unwrap();
        assert_eq!(b.block_state(), TBlockState::Default);
        assert!(!shared.xid_did_commit(top));
    }

    #[test]
    fn test_internal_subtransaction_round_trip() {
        let (shared, mut b) = backend();
        b.start_transaction_command().unwrap();
        b.get_top_transaction_id().unwrap();

        b.begin_internal_subtransaction(None).unwrap();
        assert!(b.is_sub_transaction());
        let kept = b.get_current_transaction_id().unwrap();
        b.release_current_subtransaction().unwrap();

        b.begin_internal_subtransaction(Some("trap")).unwrap();
        let dropped = b.get_current_transaction_id().unwrap();
        b.rollback_and_release_current_subtransaction().unwrap();
        assert!(!b.is_sub_transaction());

        assert_eq!(b.committed_children(), &[kept]);
        b.commit_transaction_command().unwrap();
        assert!(shared.xid_did_commit(kept));
        assert!(!shared.xid_did_commit(dropped));
    }

    #[test]
    fn test_abort_out_of_nested_block() {
        let (_shared, mut b) = backend();
        run(&mut b, |b| b.begin_transaction_block());
        run(&mut b, |b| b.define_savepoint("a"));
        run(&mut b, |b| b.define_savepoint("b"));
        b.abort_out_of_any_transaction();
        assert_eq!(b.block_state(), TBlockState::Default);
        assert_eq!(b.trans_state(), TransState::Default);
        assert!(!b.is_sub_transaction());
    }

    #[test]
    fn test_prepare_block_moves_to_two_phase() {
        let (shared, mut b) = backend();
        run(&mut b, |b| b.begin_transaction_block());
        b.start_transaction_command().unwrap();
        let xid = b.get_top_transaction_id().unwrap();
        assert!(b.prepare_transaction_block("gx1").unwrap());
        b.commit_transaction_command().unwrap();

        assert_eq!(b.block_state(), TBlockState::Default);
        assert_eq!(shared.twophase.len(), 1);
        assert!(shared.xid_in_progress(xid));

        b.finish_prepared_transaction("gx1", true).unwrap();
        assert!(shared.xid_did_commit(xid));
        assert!(shared.twophase.is_empty());
    }
}
