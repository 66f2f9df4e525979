/// Error taxonomy shared by every component.
///
/// Nothing in this crate halts the node: bounded structures report
/// `CapacityExceeded` and the caller drops the observation, transmit
/// failures are logged and swallowed by the mesh queue.
use serde::Serialize;
use thiserror::Error;

/// Bounded resource that ran out of room.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Resource {
    RecordStore,
    FilterArena,
    CuckooFilter,
    MeshQueue,
    Outbox,
    EventBus,
}

#[derive(Debug, Error, Clone, Copy, PartialEq, Eq)]
pub enum Error {
    #[error("capacity exceeded: {0:?}")]
    CapacityExceeded(Resource),

    /// A filter modification transaction is open, or the filter set is
    /// malformed and cannot be committed.
    #[error("inconsistent state")]
    InconsistentState,

    #[error("not found")]
    NotFound,

    #[error("invalid arguments")]
    InvalidArgs,

    #[error("payload too large")]
    PayloadTooLarge,

    #[error("transmit failure")]
    TransmitFailure,
}

pub type Result<T> = core::result::Result<T, Error>;

/// Result code reported back to the controller for a control command.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ResultCode {
    Ok,
    OutOfSpace,
    InvalidArgs,
    NotFound,
    InconsistentState,
    Busy,
}

impl ResultCode {
    pub fn as_str(&self) -> &'static str {
        match self {
            ResultCode::Ok => "ok",
            ResultCode::OutOfSpace => "out_of_space",
            ResultCode::InvalidArgs => "invalid_args",
            ResultCode::NotFound => "not_found",
            ResultCode::InconsistentState => "inconsistent_state",
            ResultCode::Busy => "busy",
        }
    }
}

impl From<Error> for ResultCode {
    fn from(err: Error) -> Self {
        match err {
            Error::CapacityExceeded(_) => ResultCode::OutOfSpace,
            Error::InconsistentState => ResultCode::InconsistentState,
            Error::NotFound => ResultCode::NotFound,
            Error::InvalidArgs | Error::PayloadTooLarge => ResultCode::InvalidArgs,
            Error::TransmitFailure => ResultCode::Busy,
        }
    }
}

impl<T> From<&Result<T>> for ResultCode {
    fn from(res: &Result<T>) -> Self {
        match res {
            Ok(_) => ResultCode::Ok,
            Err(e) => (*e).into(),
        }
    }
}
