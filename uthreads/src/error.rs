//! Error types and the per-thread "last error" slot.
//!
//! Each failure domain gets its own plain enum with a hand-written
//! `Display` and `std::error::Error` impl rather than a derive macro. Every
//! `Error` converts into the flat [`Status`] the public API returns, and
//! every fallible call also stashes its status in [`last_error`] before
//! returning, mirroring the familiar `errno` pattern.

use std::cell::Cell;
use std::fmt;

/// Flat status code returned by the public API, per the library's
/// C-compatible contract.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Status {
    Success,
    InvalidArgument,
    Deadlock,
    Busy,
    WouldBlock,
    TryAgain,
}

impl fmt::Display for Status {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Status::Success => "success",
            Status::InvalidArgument => "invalid argument",
            Status::Deadlock => "deadlock",
            Status::Busy => "busy",
            Status::WouldBlock => "would block",
            Status::TryAgain => "try again",
        };
        f.write_str(s)
    }
}

thread_local! {
    static LAST_ERROR: Cell<Status> = const { Cell::new(Status::Success) };
}

/// Reads the caller's thread-local "last error" slot.
///
/// Never blocks, never fails. Returns [`Status::Success`] if no fallible
/// library call has failed on this thread yet.
pub fn last_error() -> Status {
    LAST_ERROR.with(Cell::get)
}

pub(crate) fn set_last_error(status: Status) {
    LAST_ERROR.with(|slot| slot.set(status));
}

/// `start`'s null-function-pointer and `mapping`'s invalid-tag cases from
/// the spec's C-style signature have no counterpart here: `create` takes an
/// owned closure (never null) and `mapping: Mapping` (an enum the type
/// system already restricts to its two variants), so there is no value this
/// enum could hold for either.
#[derive(Debug)]
pub enum CreateError {
    StackAllocation(std::io::Error),
    TaskCreation(std::io::Error),
}

impl fmt::Display for CreateError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            CreateError::StackAllocation(e) => write!(f, "failed to allocate thread stack: {e}"),
            CreateError::TaskCreation(e) => write!(f, "failed to create kernel task: {e}"),
        }
    }
}

impl std::error::Error for CreateError {}

impl From<&CreateError> for Status {
    fn from(e: &CreateError) -> Self {
        match e {
            CreateError::StackAllocation(_) | CreateError::TaskCreation(_) => Status::TryAgain,
        }
    }
}

#[derive(Debug)]
pub enum JoinError {
    SelfJoin,
    AlreadyJoined,
    AlreadyHasJoiner,
}

impl fmt::Display for JoinError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            JoinError::SelfJoin => write!(f, "a thread cannot join itself"),
            JoinError::AlreadyJoined => write!(f, "target thread has already been joined"),
            JoinError::AlreadyHasJoiner => write!(f, "target thread already has a joiner"),
        }
    }
}

impl std::error::Error for JoinError {}

impl From<&JoinError> for Status {
    fn from(e: &JoinError) -> Self {
        match e {
            JoinError::SelfJoin => Status::Deadlock,
            JoinError::AlreadyJoined | JoinError::AlreadyHasJoiner => Status::InvalidArgument,
        }
    }
}

#[derive(Debug)]
pub enum KillError {
    InvalidSignal,
    SendFailed(std::io::Error),
}

impl fmt::Display for KillError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            KillError::InvalidSignal => write!(f, "signal number out of range 1..=31"),
            KillError::SendFailed(e) => write!(f, "failed to deliver signal: {e}"),
        }
    }
}

impl std::error::Error for KillError {}

impl From<&KillError> for Status {
    fn from(e: &KillError) -> Self {
        match e {
            KillError::InvalidSignal => Status::InvalidArgument,
            KillError::SendFailed(_) => Status::TryAgain,
        }
    }
}

#[derive(Debug)]
pub enum SigmaskError {
    InvalidHow,
    Failed(std::io::Error),
}

impl fmt::Display for SigmaskError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            SigmaskError::InvalidHow => write!(f, "invalid sigmask `how` value"),
            SigmaskError::Failed(e) => write!(f, "failed to change signal mask: {e}"),
        }
    }
}

impl std::error::Error for SigmaskError {}

impl From<&SigmaskError> for Status {
    fn from(e: &SigmaskError) -> Self {
        match e {
            SigmaskError::InvalidHow => Status::InvalidArgument,
            SigmaskError::Failed(_) => Status::TryAgain,
        }
    }
}

#[derive(Debug)]
pub enum LockError {
    NotOwner,
    WouldBlock,
}

impl fmt::Display for LockError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            LockError::NotOwner => write!(f, "unlock attempted by a thread that is not the owner"),
            LockError::WouldBlock => write!(f, "lock is held and trylock must not block"),
        }
    }
}

impl std::error::Error for LockError {}

impl From<&LockError> for Status {
    fn from(e: &LockError) -> Self {
        match e {
            LockError::NotOwner => Status::InvalidArgument,
            LockError::WouldBlock => Status::Busy,
        }
    }
}

/// Records `status` in the caller's last-error slot and returns it, for use
/// at every fallible API boundary: `status_of(&err).record()`.
pub(crate) trait RecordStatus {
    fn record(self) -> Status;
}

impl RecordStatus for Status {
    fn record(self) -> Status {
        set_last_error(self);
        self
    }
}
