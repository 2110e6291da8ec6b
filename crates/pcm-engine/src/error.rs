//! Engine error types.
//!
//! Every failure carries the [`Stage`] it happened in and the reason the device gave,
//! so callers can tell a configuration mismatch from a runtime fault.

use std::fmt;

use thiserror::Error;

use crate::pcm::FormatRejection;

/// Where in negotiation or delivery a failure happened.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Stage {
    Open,
    HwParamsAlloc,
    HwParamsAny,
    Access,
    Format,
    Rate,
    Channels,
    HwParamsCommit,
    SwParamsAlloc,
    SwParams,
    SwParamsCommit,
    Prepare,
    Wait,
    Query,
    Produce,
    Deliver,
    Start,
    Recover,
}

impl fmt::Display for Stage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Stage::Open => "open device",
            Stage::HwParamsAlloc => "allocate hardware parameters",
            Stage::HwParamsAny => "initialize hardware parameters",
            Stage::Access => "set access type",
            Stage::Format => "set sample format",
            Stage::Rate => "set sample rate",
            Stage::Channels => "set channel count",
            Stage::HwParamsCommit => "commit hardware parameters",
            Stage::SwParamsAlloc => "allocate software parameters",
            Stage::SwParams => "set software thresholds",
            Stage::SwParamsCommit => "commit software parameters",
            Stage::Prepare => "prepare device",
            Stage::Wait => "wait for device",
            Stage::Query => "query available frames",
            Stage::Produce => "produce samples",
            Stage::Deliver => "write samples",
            Stage::Start => "start device",
            Stage::Recover => "recover from underrun",
        };
        f.write_str(s)
    }
}

/// Errors surfaced by negotiation and the delivery loop.
#[derive(Debug, Error, PartialEq, Eq)]
pub enum EngineError {
    /// The sink cannot be opened or initialised.
    #[error("cannot {stage} on {device}: {reason}")]
    DeviceUnavailable {
        stage: Stage,
        device: String,
        reason: String,
    },

    /// A negotiation-time descriptor could not be allocated.
    #[error("cannot {stage}: {reason}")]
    ResourceExhausted { stage: Stage, reason: String },

    /// A requested parameter was rejected by the device.
    #[error("cannot {stage}: requested {requested}, device supports {supported}")]
    UnsupportedFormat {
        stage: Stage,
        requested: String,
        supported: String,
    },

    /// The readiness wait or availability query itself failed.
    #[error("cannot {stage}: {reason}")]
    PollFailed { stage: Stage, reason: String },

    /// The device did not become ready in time. Not fatal: the handle stays open.
    #[error("device not ready after {timeout_ms} ms")]
    WaitTimeout { timeout_ms: u64 },

    /// The ring buffer ran dry.
    #[error("buffer underrun detected while trying to {stage}")]
    Underrun { stage: Stage },

    /// The device accepted a different number of frames than were written.
    #[error("write delivered {written} of {requested} frames: {reason}")]
    DeliveryFailure {
        requested: usize,
        written: usize,
        reason: String,
    },

    /// The sample producer could not fill the requested frames.
    #[error("sample producer failed: {reason}")]
    Producer { reason: String },

    /// The loop already reached its terminal state.
    #[error("delivery loop already stopped")]
    Stopped,
}

impl EngineError {
    /// `false` only for [`EngineError::WaitTimeout`], which a caller may retry.
    pub fn is_fatal(&self) -> bool {
        !matches!(self, EngineError::WaitTimeout { .. })
    }

    pub fn stage(&self) -> Option<Stage> {
        match self {
            EngineError::DeviceUnavailable { stage, .. }
            | EngineError::ResourceExhausted { stage, .. }
            | EngineError::UnsupportedFormat { stage, .. }
            | EngineError::PollFailed { stage, .. }
            | EngineError::Underrun { stage } => Some(*stage),
            EngineError::WaitTimeout { .. } => Some(Stage::Wait),
            EngineError::DeliveryFailure { .. } => Some(Stage::Deliver),
            EngineError::Producer { .. } => Some(Stage::Produce),
            EngineError::Stopped => None,
        }
    }

    pub(crate) fn rejected(stage: Stage, rejection: FormatRejection) -> Self {
        EngineError::UnsupportedFormat {
            stage,
            requested: rejection.requested,
            supported: rejection.supported,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn only_wait_timeout_is_retryable() {
        assert!(!EngineError::WaitTimeout { timeout_ms: 1000 }.is_fatal());
        assert!(EngineError::Underrun { stage: Stage::Query }.is_fatal());
        assert!(EngineError::Stopped.is_fatal());
    }

    #[test]
    fn messages_name_stage_and_values() {
        let err = EngineError::UnsupportedFormat {
            stage: Stage::Channels,
            requested: "9".to_string(),
            supported: "1..=2".to_string(),
        };
        assert_eq!(
            err.to_string(),
            "cannot set channel count: requested 9, device supports 1..=2"
        );
        assert_eq!(err.stage(), Some(Stage::Channels));
    }

    #[test]
    fn delivery_failure_reports_counts() {
        let err = EngineError::DeliveryFailure {
            requested: 2048,
            written: 1024,
            reason: "short write".to_string(),
        };
        assert_eq!(err.to_string(), "write delivered 1024 of 2048 frames: short write");
        assert_eq!(err.stage(), Some(Stage::Deliver));
    }
}
