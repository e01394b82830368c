use std::sync::Arc;

use thiserror::Error;

/// Convenience alias used throughout the crate.
pub type Result<T, E = Error> = std::result::Result<T, E>;

/// Errors surfaced by the engine and by measurement lifecycles.
///
/// `Overflow` intervals are not represented here: they are stream markers,
/// surfaced through result state, and never raised as errors.
#[derive(Debug, Clone, Error)]
pub enum Error {
    /// Unknown channel, or a channel outside the configured numbering scheme.
    #[error("invalid channel {0}")]
    InvalidChannel(i32),

    /// A channel was released without a prior registration.
    #[error("channel {0} is not registered")]
    NotRegistered(i32),

    /// A fence wait exceeded its timeout.
    #[error("timed out waiting for fence {0}")]
    FenceTimeout(u32),

    /// The distinguished abort signal raised by `MeasureCtx::check_abort`.
    /// The dispatcher catches it and treats the measurement as stopped.
    #[error("measurement aborted")]
    Aborted,

    /// Any other failure raised inside `on_block`. Stored on the measurement
    /// and resurfaced by `wait_until_finished`; peers are unaffected.
    #[error("measurement fault: {0}")]
    Fault(Arc<anyhow::Error>),

    /// Invalid parameters passed to a measurement constructor.
    #[error("invalid measurement parameters: {0}")]
    InvalidArgument(&'static str),

    /// The engine has been shut down; the stream no longer accepts input.
    #[error("engine is shut down")]
    Shutdown,
}

impl Error {
    /// Wraps an arbitrary failure as a measurement fault.
    pub fn fault(err: anyhow::Error) -> Self {
        Self::Fault(Arc::new(err))
    }
}

impl From<anyhow::Error> for Error {
    fn from(err: anyhow::Error) -> Self {
        Self::fault(err)
    }
}
