use thiserror::Error;

use crate::types::{Lsn, SessionId, Xid};

/// Convenience alias for `Result<T, MeridianError>`.
pub type MeridianResult<T> = Result<T, MeridianError>;

/// Error classification for retry/escalation decisions.
///
/// - `UserError`   — misuse of the transaction API (bad savepoint, wrong block state)
/// - `Retryable`   — deadlock victim, failed distributed prepare; client SHOULD retry
/// - `Transient`   — timeout, cancellation, resource exhaustion; client MAY retry after back-off
/// - `InternalBug` — should never happen; triggers alert + diagnostic dump
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorKind {
    UserError,
    Retryable,
    Transient,
    InternalBug,
}

/// How far an error unwinds.
///
/// `Error` aborts the current transaction, `Fatal` ends the process that
/// raised it, `Panic` means shared state may be inconsistent and the whole
/// node must restart.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum Severity {
    Error,
    Fatal,
    Panic,
}

/// Why a statement stopped waiting.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CancelReason {
    UserRequest,
    StatementTimeout,
    LockTimeout,
}

impl std::fmt::Display for CancelReason {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            CancelReason::UserRequest => write!(f, "canceling statement due to user request"),
            CancelReason::StatementTimeout => {
                write!(f, "canceling statement due to statement timeout")
            }
            CancelReason::LockTimeout => write!(f, "canceling statement due to lock timeout"),
        }
    }
}

/// Top-level error type that all crate-specific errors convert into.
#[derive(Error, Debug)]
pub enum MeridianError {
    #[error("Transaction error: {0}")]
    Xact(#[from] XactError),

    #[error("WAL error: {0}")]
    Wal(#[from] WalError),

    #[error("Shared snapshot error: {0}")]
    Snapshot(#[from] SnapshotError),

    #[error("Lock error: {0}")]
    Lock(#[from] LockError),

    #[error("Two-phase error: {0}")]
    TwoPhase(#[from] TwoPhaseError),

    #[error("Redo error: {0}")]
    Redo(#[from] RedoError),

    #[error("{0}")]
    Canceled(CancelReason),

    #[error("Configuration error: {0}")]
    Config(String),

    #[error("Serialization error: {0}")]
    Serialization(String),

    /// Internal bug — should never occur in production.
    /// Always carries a unique `error_code` and `debug_context` for post-mortem.
    #[error("InternalBug [{error_code}]: {message} | context: {debug_context}")]
    InternalBug {
        error_code: &'static str,
        message: String,
        debug_context: String,
    },
}

/// Transaction state machine errors.
#[derive(Error, Debug)]
pub enum XactError {
    #[error("{op}: unexpected state {state}")]
    InvalidState { op: &'static str, state: String },

    #[error("current transaction is aborted, commands ignored until end of transaction block")]
    InFailedTransaction,

    #[error("no such savepoint: {0}")]
    NoSuchSavepoint(String),

    #[error("{0} can only be used in transaction blocks")]
    NoTransactionBlock(&'static str),

    #[error("{0} cannot run inside a transaction block")]
    InsideTransactionBlock(&'static str),

    #[error("cannot have more than 2^32-1 subtransactions in a transaction")]
    TooManySubtransactions,

    #[error("cannot have more than 2^32-2 commands in a transaction")]
    TooManyCommands,

    #[error("sorry, too many clients already (max {0})")]
    TooManyConnections(usize),

    #[error("cannot assign transaction ids in a reader process")]
    ReaderCannotAssignXid,

    #[error("cannot PREPARE a transaction that has exported snapshots")]
    PrepareExportedSnapshots,

    #[error("cannot PREPARE a transaction that has operated on temporary tables")]
    PrepareTempRelation,

    #[error("cannot commit a transaction that deleted files but has no xid")]
    FilesWithoutXid,

    #[error("transaction handle {handle} is stale (current {current})")]
    StaleHandle { handle: u32, current: u32 },

    #[error("distributed prepare of {0} failed")]
    DistributedPrepareFailed(String),

    #[error("cannot abort transaction {0}, it was already committed")]
    AlreadyCommitted(Xid),

    #[error("transaction {0} was already aborted when attempting to prepare")]
    AlreadyAborted(Xid),

    #[error("illegal local/distributed transaction state change {from} -> {to}")]
    IllegalDistribTransition { from: String, to: String },

    #[error("{record} record of transaction {xid} is logged but could not be completed: {reason}")]
    OutcomeUnresolved {
        xid: Xid,
        record: &'static str,
        reason: String,
    },

    #[error("node stopped after an unrecoverable failure; restart to recover from the log")]
    NodeNeedsRestart,
}

/// Durable log errors.
#[derive(Error, Debug)]
pub enum WalError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Corrupt record at {lsn}: {reason}")]
    Corrupt { lsn: Lsn, reason: String },

    #[error("Truncated input: need {expected} bytes, have {actual}")]
    Truncated { expected: usize, actual: usize },

    #[error("Position {0} is past the end of the log")]
    OutOfRange(Lsn),
}

/// Shared snapshot slot table errors.
#[derive(Error, Debug)]
pub enum SnapshotError {
    #[error("shared snapshot slot for session {0} already exists")]
    SlotCollision(SessionId),

    #[error("sorry, too many clients already (max {max} shared snapshot slots)")]
    TooManySlots { max: usize },

    #[error("no shared snapshot slot for session {session} after {waited_ms} ms")]
    NotFound { session: SessionId, waited_ms: u64 },

    #[error("writer for session {0} did not publish a snapshot in time")]
    NotReady(SessionId),

    #[error("snapshot has {xcnt} in-progress ids, slot capacity is {max}")]
    XipOverflow { xcnt: usize, max: usize },

    #[error("cursor snapshot file {path}: {reason}")]
    CursorFile { path: String, reason: String },
}

/// Lock manager errors.
#[derive(Error, Debug)]
pub enum LockError {
    #[error("deadlock detected: {0}")]
    Deadlock(String),

    #[error("deadlock detected: owner {0} waits on a lock it holds")]
    SelfDeadlock(u32),

    #[error("could not obtain lock on {0}")]
    NotAvailable(String),
}

/// Two-phase commit errors.
#[derive(Error, Debug)]
pub enum TwoPhaseError {
    #[error("transaction identifier \"{0}\" is already in use")]
    DuplicateGid(String),

    #[error("maximum number of prepared transactions reached ({max})")]
    TooManyPrepared { max: usize },

    #[error("transaction identifier \"{0}\" is too long")]
    GidTooLong(String),

    #[error("prepared transaction with identifier \"{0}\" does not exist")]
    NotFound(String),

    #[error("prepared transaction with identifier \"{0}\" is busy")]
    Busy(String),

    #[error("two-phase state for transaction {0} not found during replay")]
    ReplayXidNotFound(Xid),

    #[error("two-phase state file {path}: {reason}")]
    StateFile { path: String, reason: String },
}

/// Recovery errors. All of them halt recovery.
#[derive(Error, Debug)]
pub enum RedoError {
    #[error("xact redo: unknown op code {info:#04x} at {lsn}")]
    UnknownOpcode { info: u8, lsn: Lsn },

    #[error("xact redo: malformed record at {lsn}: {reason}")]
    Malformed { lsn: Lsn, reason: String },

    #[error("redo: unknown resource manager {0}")]
    UnknownRmgr(u8),
}

// ── MeridianError classification & helpers ───────────────────────────────────

impl MeridianError {
    /// Classify this error for retry/escalation decisions.
    pub fn kind(&self) -> ErrorKind {
        match self {
            MeridianError::Xact(XactError::InFailedTransaction) => ErrorKind::UserError,
            MeridianError::Xact(XactError::NoSuchSavepoint(_)) => ErrorKind::UserError,
            MeridianError::Xact(XactError::NoTransactionBlock(_)) => ErrorKind::UserError,
            MeridianError::Xact(XactError::InsideTransactionBlock(_)) => ErrorKind::UserError,
            MeridianError::Xact(XactError::PrepareExportedSnapshots) => ErrorKind::UserError,
            MeridianError::Xact(XactError::PrepareTempRelation) => ErrorKind::UserError,
            MeridianError::Xact(XactError::StaleHandle { .. }) => ErrorKind::UserError,
            MeridianError::TwoPhase(TwoPhaseError::DuplicateGid(_)) => ErrorKind::UserError,
            MeridianError::TwoPhase(TwoPhaseError::GidTooLong(_)) => ErrorKind::UserError,
            MeridianError::TwoPhase(TwoPhaseError::NotFound(_)) => ErrorKind::UserError,
            MeridianError::Config(_) => ErrorKind::UserError,

            MeridianError::Lock(LockError::Deadlock(_)) => ErrorKind::Retryable,
            MeridianError::Lock(LockError::SelfDeadlock(_)) => ErrorKind::Retryable,
            MeridianError::Xact(XactError::DistributedPrepareFailed(_)) => ErrorKind::Retryable,
            MeridianError::TwoPhase(TwoPhaseError::Busy(_)) => ErrorKind::Retryable,

            MeridianError::Canceled(_) => ErrorKind::Transient,
            MeridianError::Lock(LockError::NotAvailable(_)) => ErrorKind::Transient,
            MeridianError::Snapshot(SnapshotError::TooManySlots { .. }) => ErrorKind::Transient,
            MeridianError::Xact(XactError::TooManyConnections(_)) => ErrorKind::Transient,
            MeridianError::Snapshot(SnapshotError::NotFound { .. }) => ErrorKind::Transient,
            MeridianError::Snapshot(SnapshotError::NotReady(_)) => ErrorKind::Transient,
            MeridianError::TwoPhase(TwoPhaseError::TooManyPrepared { .. }) => {
                ErrorKind::Transient
            }
            MeridianError::Xact(XactError::TooManySubtransactions) => ErrorKind::Transient,
            MeridianError::Xact(XactError::TooManyCommands) => ErrorKind::Transient,
            MeridianError::Wal(WalError::Io(_)) => ErrorKind::Transient,

            MeridianError::InternalBug { .. } => ErrorKind::InternalBug,
            _ => ErrorKind::InternalBug,
        }
    }

    /// How far this error unwinds: abort the transaction, end the process,
    /// or stop the node.
    pub fn severity(&self) -> Severity {
        match self {
            MeridianError::Xact(XactError::AlreadyCommitted(_)) => Severity::Panic,
            MeridianError::Xact(XactError::OutcomeUnresolved { .. }) => Severity::Panic,
            MeridianError::Xact(XactError::NodeNeedsRestart) => Severity::Fatal,
            MeridianError::Xact(XactError::AlreadyAborted(_)) => Severity::Fatal,
            MeridianError::Xact(XactError::IllegalDistribTransition { .. }) => Severity::Fatal,
            MeridianError::Snapshot(SnapshotError::SlotCollision(_)) => Severity::Fatal,
            MeridianError::TwoPhase(TwoPhaseError::ReplayXidNotFound(_)) => Severity::Fatal,
            MeridianError::Redo(_) => Severity::Fatal,
            MeridianError::Wal(WalError::Corrupt { .. }) => Severity::Fatal,
            MeridianError::InternalBug { .. } => Severity::Fatal,
            _ => Severity::Error,
        }
    }

    /// Returns true if the process that observed this error must exit.
    pub fn is_fatal(&self) -> bool {
        self.severity() >= Severity::Fatal
    }

    pub fn is_retryable(&self) -> bool {
        matches!(self.kind(), ErrorKind::Retryable)
    }

    pub fn is_user_error(&self) -> bool {
        matches!(self.kind(), ErrorKind::UserError)
    }

    pub fn is_transient(&self) -> bool {
        matches!(self.kind(), ErrorKind::Transient)
    }

    pub fn is_internal_bug(&self) -> bool {
        matches!(self.kind(), ErrorKind::InternalBug)
    }

    /// Map to a PostgreSQL SQLSTATE code.
    pub fn pg_sqlstate(&self) -> &'static str {
        match self {
            MeridianError::Xact(XactError::InFailedTransaction) => "25P02", // in_failed_sql_transaction
            MeridianError::Xact(XactError::NoSuchSavepoint(_)) => "3B001", // invalid_savepoint_specification
            MeridianError::Xact(XactError::NoTransactionBlock(_)) => "25P01", // no_active_sql_transaction
            MeridianError::Xact(XactError::InsideTransactionBlock(_)) => "25001", // active_sql_transaction
            MeridianError::Xact(XactError::TooManySubtransactions) => "54000", // program_limit_exceeded
            MeridianError::Xact(XactError::TooManyCommands) => "54000",
            MeridianError::Xact(XactError::PrepareExportedSnapshots) => "0A000", // feature_not_supported
            MeridianError::Xact(XactError::PrepareTempRelation) => "0A000",
            MeridianError::Xact(XactError::DistributedPrepareFailed(_)) => "40000", // transaction_rollback
            MeridianError::Xact(XactError::StaleHandle { .. }) => "25000", // invalid_transaction_state
            MeridianError::Snapshot(SnapshotError::TooManySlots { .. }) => "53300", // too_many_connections
            MeridianError::Xact(XactError::TooManyConnections(_)) => "53300",
            MeridianError::Lock(LockError::Deadlock(_)) => "40P01", // deadlock_detected
            MeridianError::Lock(LockError::SelfDeadlock(_)) => "40P01",
            MeridianError::Lock(LockError::NotAvailable(_)) => "55P03", // lock_not_available
            MeridianError::Canceled(CancelReason::LockTimeout) => "55P03",
            MeridianError::Canceled(_) => "57014", // query_canceled
            MeridianError::TwoPhase(TwoPhaseError::DuplicateGid(_)) => "42710", // duplicate_object
            MeridianError::TwoPhase(TwoPhaseError::TooManyPrepared { .. }) => "53400", // configuration_limit_exceeded
            MeridianError::TwoPhase(TwoPhaseError::GidTooLong(_)) => "22023", // invalid_parameter_value
            MeridianError::TwoPhase(TwoPhaseError::NotFound(_)) => "42704", // undefined_object
            MeridianError::TwoPhase(TwoPhaseError::Busy(_)) => "55000", // object_not_in_prerequisite_state
            MeridianError::TwoPhase(TwoPhaseError::StateFile { .. }) => "XX001", // data_corrupted
            MeridianError::Wal(WalError::Corrupt { .. }) => "XX001",
            MeridianError::Xact(XactError::OutcomeUnresolved { .. }) => "58030", // io_error
            MeridianError::Xact(XactError::NodeNeedsRestart) => "57P02", // crash_shutdown
            MeridianError::Config(_) => "F0000", // config_file_error
            MeridianError::InternalBug { .. } => "XX000", // internal_error
            _ => "XX000",
        }
    }

    /// Map to a PostgreSQL severity string.
    pub fn pg_severity(&self) -> &'static str {
        match self.severity() {
            Severity::Error => "ERROR",
            Severity::Fatal => "FATAL",
            Severity::Panic => "PANIC",
        }
    }

    /// Construct an internal bug error with a unique code and debug context.
    pub fn internal_bug(
        error_code: &'static str,
        message: impl Into<String>,
        debug_context: impl Into<String>,
    ) -> Self {
        MeridianError::InternalBug {
            error_code,
            message: message.into(),
            debug_context: debug_context.into(),
        }
    }

    /// State-machine violation for operation `op` observed in `state`.
    pub fn invalid_state(op: &'static str, state: impl std::fmt::Display) -> Self {
        MeridianError::Xact(XactError::InvalidState {
            op,
            state: state.to_string(),
        })
    }
}
