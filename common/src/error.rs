// Copyright 2023 Oxide Computer Company
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::types::{DriveLocation, JobErrorCode, ObjectId, Position};

/// Errors surfaced by the engine and the harness.
///
/// Every failure is returned to the caller; nothing here is logged and
/// then dropped.
#[derive(Clone, Debug, Deserialize, Error, PartialEq, Serialize)]
pub enum SepError {
    #[error("Timed out waiting for {0}")]
    Timeout(String),

    #[error("Position {0} is already removed")]
    PositionAlreadyRemoved(Position),

    #[error("Position {0} is not removed")]
    PositionNotRemoved(Position),

    #[error("All {0} positions are already removed")]
    AllPositionsRemoved(usize),

    #[error("No position is available")]
    NoPositionAvailable,

    #[error("Position {0} already needs a spare")]
    PositionAlreadyNeedsSpare(Position),

    #[error("Position {0} does not need a spare")]
    PositionNotNeedingSpare(Position),

    #[error("Position {0} is outside the raid group width")]
    InvalidPosition(Position),

    #[error("Invalid configuration: {0}")]
    InvalidConfiguration(String),

    #[error("Invalid argument: {0}")]
    InvalidArgument(String),

    #[error("Job rejected with {0:?}")]
    JobRejected(JobErrorCode),

    #[error("Raid group {0} has failed")]
    RaidGroupFailed(ObjectId),

    #[error("Object {0} not found")]
    ObjectNotFound(ObjectId),

    #[error("No raid group with number {0}")]
    RaidGroupNumberNotFound(u32),

    #[error("Drive {0} not found")]
    DriveNotFound(DriveLocation),

    #[error("Drive {0} was not pulled with this handle")]
    DriveHandleMismatch(DriveLocation),

    #[error("Drive {0} is already pulled")]
    DriveAlreadyPulled(DriveLocation),

    #[error("Peer SP is not alive")]
    PeerNotAlive,

    #[error("Raid group has not been created yet")]
    NotConfigured,

    #[error("Receive side of the request channel disconnected")]
    RecvDisconnected,

    #[error("Config error: {0}")]
    ConfigError(String),

    #[error("IO Error: {0}")]
    IoError(String),
}

impl From<std::io::Error> for SepError {
    fn from(e: std::io::Error) -> Self {
        SepError::IoError(format!("{:?}", e))
    }
}

impl From<anyhow::Error> for SepError {
    fn from(e: anyhow::Error) -> Self {
        SepError::ConfigError(format!("{:#}", e))
    }
}

impl SepError {
    /// Timeouts are always fatal to the calling test.
    pub fn is_timeout(&self) -> bool {
        matches!(self, SepError::Timeout(_))
    }

    /// Precondition violations point at a test setup bug, not a transient
    /// condition, and are never worth retrying.
    pub fn is_precondition(&self) -> bool {
        matches!(
            self,
            SepError::PositionAlreadyRemoved(_)
                | SepError::PositionNotRemoved(_)
                | SepError::AllPositionsRemoved(_)
                | SepError::NoPositionAvailable
                | SepError::PositionAlreadyNeedsSpare(_)
                | SepError::PositionNotNeedingSpare(_)
                | SepError::InvalidPosition(_)
                | SepError::InvalidArgument(_)
        )
    }
}

#[macro_export]
macro_rules! sep_bail {
    ($i:ident) => { return Err($crate::SepError::$i) };
    ($i:ident, $str:expr) => {
        return Err($crate::SepError::$i($str.into()))
    };
    ($i:ident, $fmt:expr, $($arg:tt)*) => {
        return Err($crate::SepError::$i(format!($fmt, $($arg)*)))
    };
}

#[cfg(test)]
mod test {
    use super::*;

    fn bail_timeout() -> Result<(), SepError> {
        sep_bail!(Timeout, "quiesce of {} after {}s", ObjectId(0x10f), 30);
    }

    fn bail_position() -> Result<(), SepError> {
        sep_bail!(PositionNotRemoved, Position(3));
    }

    #[test]
    fn bail_formats_message() {
        let e = bail_timeout().unwrap_err();
        assert!(e.is_timeout());
        assert!(!e.is_precondition());
        assert_eq!(
            e.to_string(),
            "Timed out waiting for quiesce of 0x10f after 30s"
        );
    }

    #[test]
    fn bail_with_value() {
        let e = bail_position().unwrap_err();
        assert!(e.is_precondition());
        assert_eq!(e, SepError::PositionNotRemoved(Position(3)));
    }
}
