//! Crate-level error types.
//!
//! Errors are grouped by how the processor reacts to them: terminal errors
//! skip the retry path entirely, delay-carrying errors reschedule without
//! consuming retry budget, and everything else is retried with backoff.

use std::time::Duration;

use thiserror::Error;

/// Errors produced by queues, codecs, handlers, and the processor.
#[derive(Debug, Clone, Error)]
pub enum Error {
    /// Argument encoding or decoding failed. Terminal: no retry.
    #[error("codec: {0}")]
    Codec(String),

    /// Decoded args do not match the handler's parameter list. Terminal.
    #[error("handler signature mismatch: {0}")]
    HandlerSignature(String),

    /// A message with the same name was already accepted this period.
    #[error("message with the same name already exists")]
    Duplicate,

    /// Handler asked for redelivery after an explicit delay. Does not
    /// consume retry budget.
    #[error("retry after {0:?}")]
    RetryAfter(Duration),

    /// Plain handler failure, retried with backoff.
    #[error("handler: {0}")]
    Handler(String),

    /// The queue's ready buffer stayed full for the whole add timeout.
    #[error("queue buffer is full")]
    BufferFull,

    /// Operation on a queue or processor that was already stopped.
    #[error("queue is closed")]
    Closed,

    /// `stop_timeout` expired with workers still running.
    #[error("stop timed out with {0} workers still running")]
    StopTimeout(usize),

    /// `process_one` found nothing to reserve.
    #[error("no messages in queue")]
    NoMessages,

    /// Backend adapter failure.
    #[error("backend: {0}")]
    Backend(#[from] BackendError),
}

impl Error {
    /// Wrap an arbitrary handler failure.
    pub fn handler(err: impl std::fmt::Display) -> Self {
        Error::Handler(err.to_string())
    }

    /// Request redelivery after `delay` without consuming retry budget.
    pub fn retry_after(delay: Duration) -> Self {
        Error::RetryAfter(delay)
    }

    /// The explicit redelivery delay, if this error carries one.
    pub fn delay(&self) -> Option<Duration> {
        match self {
            Error::RetryAfter(d) => Some(*d),
            _ => None,
        }
    }

    /// Terminal errors go straight to the fallback handler, never the
    /// retry path.
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            Error::Codec(_)
                | Error::HandlerSignature(_)
                | Error::Duplicate
                | Error::Backend(BackendError::Permanent(_))
        )
    }
}

/// Errors surfaced by a backend service client.
#[derive(Debug, Clone, Error)]
pub enum BackendError {
    /// 5xx, network timeout. Retried locally a few times before surfacing.
    #[error("transient backend failure: {0}")]
    Transient(String),

    /// The message is already gone (404 on delete/release).
    #[error("message not found")]
    NotFound,

    /// The queue does not exist yet; created lazily and retried.
    #[error("queue not found")]
    MissingQueue,

    /// Anything the backend will keep rejecting.
    #[error("backend failure: {0}")]
    Permanent(String),
}

impl BackendError {
    pub fn is_transient(&self) -> bool {
        matches!(self, BackendError::Transient(_))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn delay_carrying_error() {
        let err = Error::retry_after(Duration::from_secs(5));
        assert_eq!(err.delay(), Some(Duration::from_secs(5)));
        assert!(!err.is_terminal());

        assert_eq!(Error::handler("boom").delay(), None);
    }

    #[test]
    fn terminal_kinds() {
        assert!(Error::Codec("bad body".into()).is_terminal());
        assert!(Error::HandlerSignature("arity".into()).is_terminal());
        assert!(Error::Duplicate.is_terminal());
        assert!(!Error::handler("transient").is_terminal());
        assert!(!Error::Backend(BackendError::Transient("503".into())).is_terminal());
    }
}
