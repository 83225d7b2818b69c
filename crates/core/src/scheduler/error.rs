use std::time::Duration;

use thiserror::Error;

use crate::producer::domain::frame_producer::ProducerError;

/// Why the scheduler never started. No frames are produced after this.
#[derive(Error, Debug)]
pub enum StartupError {
    #[error("frame producer is unavailable: {0}")]
    ProducerUnavailable(#[source] ProducerError),
    #[error("failed to evaluate source '{name}': {source}")]
    SourceEvaluation {
        name: String,
        #[source]
        source: ProducerError,
    },
    #[error("output node {index} is not available: {source}")]
    OutputNode {
        index: usize,
        #[source]
        source: ProducerError,
    },
    #[error("invalid configuration: {0}")]
    InvalidConfig(String),
    #[error("scheduler cannot start from the {0} state")]
    InvalidState(&'static str),
}

/// A completion that breaks the request/callback contract.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ProtocolViolation {
    #[error("completion for frame {0}, which has no outstanding request")]
    UnknownIndex(usize),
    #[error("frame {0} was delivered more than once")]
    DuplicateDelivery(usize),
    #[error("frame {0} is next in line but was never requested")]
    MissingSlot(usize),
    #[error("producer answered the request for frame {requested} with frame {reported}")]
    MismatchedIndex { requested: usize, reported: usize },
}

/// Failure returned from a pull. Everything except `Stopped` and
/// `NotStarted` is latched: later pulls return the same error.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum PullError {
    #[error("producer failed on frame {index}: {message}")]
    ProducerFailure { index: usize, message: String },
    #[error("timed out after {waited:?} waiting for frame {index}")]
    Timeout { index: usize, waited: Duration },
    #[error("protocol violation: {0}")]
    ProtocolViolation(#[from] ProtocolViolation),
    #[error("scheduler has been stopped")]
    Stopped,
    #[error("scheduler has not been started")]
    NotStarted,
}

impl PullError {
    pub fn producer_failure(index: usize, error: &ProducerError) -> Self {
        Self::ProducerFailure {
            index,
            message: error.message().to_string(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_producer_failure_message() {
        let err = PullError::producer_failure(3, &ProducerError::new("bad filter"));
        assert_eq!(err.to_string(), "producer failed on frame 3: bad filter");
    }

    #[test]
    fn test_protocol_violation_converts() {
        let err: PullError = ProtocolViolation::UnknownIndex(9).into();
        assert_eq!(
            err.to_string(),
            "protocol violation: completion for frame 9, which has no outstanding request"
        );
    }

    #[test]
    fn test_mismatched_index_names_both_frames() {
        let err: PullError = ProtocolViolation::MismatchedIndex {
            requested: 4,
            reported: 6,
        }
        .into();
        assert_eq!(
            err.to_string(),
            "protocol violation: producer answered the request for frame 4 with frame 6"
        );
    }

    #[test]
    fn test_startup_error_keeps_source() {
        let err = StartupError::SourceEvaluation {
            name: "clip.vpy".into(),
            source: ProducerError::new("syntax error"),
        };
        assert_eq!(
            err.to_string(),
            "failed to evaluate source 'clip.vpy': syntax error"
        );
        assert!(std::error::Error::source(&err).is_some());
    }
}
