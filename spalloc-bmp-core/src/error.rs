use crate::model::BmpBoard;
use thiserror::Error;

/// Classified outcome of talking to a BMP. The worker retry loop keys off
/// these kinds; they never cross a task boundary raw (they are converted
/// into completion messages first).
#[derive(Clone, Debug, Error)]
pub enum HardwareError {
    /// Timeouts and retryable BMP response codes. Worth another attempt.
    #[error("transient BMP failure: {0}")]
    Transient(String),

    /// The BMP reported an addressable part of the machine unreachable.
    /// Retrying will not help; the board wants quarantining.
    #[error("board at {at} is unreachable")]
    Permanent { at: BmpBoard },

    /// The BMP rejected the message itself. Our bug, not the hardware's.
    #[error("BMP rejected request: {0}")]
    CallerBug(String),

    /// Anything else that went wrong on the wire.
    #[error("BMP I/O failure: {0}")]
    Io(String),
}

impl HardwareError {
    /// True when the retry contract allows another attempt.
    pub fn is_transient(&self) -> bool {
        matches!(self, HardwareError::Transient(_))
    }
}

/// Store-side failures, split so the controller tick can skip on contention
/// and propagate everything else.
#[derive(Debug, Error)]
pub enum StoreError {
    /// A concurrent transaction holds what we need; retry next tick.
    #[error("store is busy")]
    Busy,

    #[error("not found: {0}")]
    NotFound(String),

    #[error(transparent)]
    Backend(#[from] anyhow::Error),
}

pub type StoreResult<T> = Result<T, StoreError>;
