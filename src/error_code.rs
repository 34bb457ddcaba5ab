//! Numeric result codes returned across the boundary.
//!
//! Values 0..=16 mirror the gRPC status codes one to one; values from 17 on
//! are specific to this crate. The numbering is part of the external contract
//! and must not change.

use tonic::Code;
use tracing::warn;

use crate::ElectionError;
use crate::Error;
use crate::RegistryError;
use crate::SessionError;
use crate::StoreError;

#[repr(i32)]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ErrorCode {
    OK = 0,
    Canceled = 1,
    Unknown = 2,
    InvalidArgument = 3,
    DeadlineExceeded = 4,
    NotFound = 5,
    AlreadyExists = 6,
    PermissionDenied = 7,
    ResourceExhausted = 8,
    FailedPrecondition = 9,
    Aborted = 10,
    OutOfRange = 11,
    Unimplemented = 12,
    Internal = 13,
    Unavailable = 14,
    DataLoss = 15,
    Unauthenticated = 16,
    TxnUnkownOp = 17,
    ObjectNotExist = 18,
    ErrObjectType = 19,
    KeyNotExist = 20,
    CampaignInternalErr = 21,
    CampaignLeaderSuccess = 22,
    ObserverLeaderInternal = 23,
    ObserverLeaderChange = 24,
    LeaderResignErr = 25,
    LeaderResiginSuccess = 26,
}

impl ErrorCode {
    pub fn as_i32(self) -> i32 {
        self as i32
    }

    pub fn is_ok(self) -> bool {
        self == ErrorCode::OK
    }

    /// Folds an internal error into a boundary code, logging every non-OK
    /// outcome under `op`.
    pub fn translate(
        op: &'static str,
        err: &Error,
    ) -> ErrorCode {
        let code = Self::classify(err);
        warn!(op, code = ?code, "{}", err);
        code
    }

    /// Like [`ErrorCode::translate`] but for a result, mapping `Ok` to `OK`.
    pub fn from_result<T>(
        op: &'static str,
        result: &Result<T, Error>,
    ) -> ErrorCode {
        match result {
            Ok(_) => ErrorCode::OK,
            Err(e) => Self::translate(op, e),
        }
    }

    fn classify(err: &Error) -> ErrorCode {
        match err {
            Error::Store(e) => Self::from_store(e),
            Error::Registry(RegistryError::NotFound(_)) => ErrorCode::ObjectNotExist,
            Error::Registry(RegistryError::TypeMismatch { .. }) => ErrorCode::ErrObjectType,
            Error::Session(SessionError::Grant { source, .. }) => Self::from_store(source),
            Error::Session(SessionError::InvalidTtl(_)) => ErrorCode::InvalidArgument,
            Error::Session(SessionError::Expired(_)) => ErrorCode::Unavailable,
            Error::Election(e) => match e {
                ElectionError::NoLeader(_) => ErrorCode::NotFound,
                ElectionError::NotLeader(_) => ErrorCode::FailedPrecondition,
                ElectionError::InvalidState { .. } => ErrorCode::FailedPrecondition,
                ElectionError::SessionLost(_) => ErrorCode::Unavailable,
                ElectionError::Canceled(_) => ErrorCode::Canceled,
                ElectionError::Timeout(_) => ErrorCode::DeadlineExceeded,
                ElectionError::ObserverClosed => ErrorCode::Unavailable,
                ElectionError::ProbeFailed(source) => Self::from_store(source),
            },
            Error::Config(_) => ErrorCode::InvalidArgument,
        }
    }

    fn from_store(err: &StoreError) -> ErrorCode {
        match err {
            StoreError::Status { code, .. } => ErrorCode::from(*code),
            StoreError::Canceled => ErrorCode::Canceled,
            StoreError::DeadlineExceeded(_) => ErrorCode::DeadlineExceeded,
            StoreError::Compacted { .. } => ErrorCode::OutOfRange,
            StoreError::WatchClosed => ErrorCode::Unavailable,
            StoreError::Transport(_) => ErrorCode::Unavailable,
            StoreError::InvalidRequest(_) => ErrorCode::InvalidArgument,
        }
    }
}

impl From<Code> for ErrorCode {
    fn from(code: Code) -> Self {
        match code {
            Code::Ok => ErrorCode::OK,
            Code::Cancelled => ErrorCode::Canceled,
            Code::Unknown => ErrorCode::Unknown,
            Code::InvalidArgument => ErrorCode::InvalidArgument,
            Code::DeadlineExceeded => ErrorCode::DeadlineExceeded,
            Code::NotFound => ErrorCode::NotFound,
            Code::AlreadyExists => ErrorCode::AlreadyExists,
            Code::PermissionDenied => ErrorCode::PermissionDenied,
            Code::ResourceExhausted => ErrorCode::ResourceExhausted,
            Code::FailedPrecondition => ErrorCode::FailedPrecondition,
            Code::Aborted => ErrorCode::Aborted,
            Code::OutOfRange => ErrorCode::OutOfRange,
            Code::Unimplemented => ErrorCode::Unimplemented,
            Code::Internal => ErrorCode::Internal,
            Code::Unavailable => ErrorCode::Unavailable,
            Code::DataLoss => ErrorCode::DataLoss,
            Code::Unauthenticated => ErrorCode::Unauthenticated,
        }
    }
}

impl TryFrom<i32> for ErrorCode {
    type Error = i32;

    fn try_from(value: i32) -> Result<Self, Self::Error> {
        let code = match value {
            0 => ErrorCode::OK,
            1 => ErrorCode::Canceled,
            2 => ErrorCode::Unknown,
            3 => ErrorCode::InvalidArgument,
            4 => ErrorCode::DeadlineExceeded,
            5 => ErrorCode::NotFound,
            6 => ErrorCode::AlreadyExists,
            7 => ErrorCode::PermissionDenied,
            8 => ErrorCode::ResourceExhausted,
            9 => ErrorCode::FailedPrecondition,
            10 => ErrorCode::Aborted,
            11 => ErrorCode::OutOfRange,
            12 => ErrorCode::Unimplemented,
            13 => ErrorCode::Internal,
            14 => ErrorCode::Unavailable,
            15 => ErrorCode::DataLoss,
            16 => ErrorCode::Unauthenticated,
            17 => ErrorCode::TxnUnkownOp,
            18 => ErrorCode::ObjectNotExist,
            19 => ErrorCode::ErrObjectType,
            20 => ErrorCode::KeyNotExist,
            21 => ErrorCode::CampaignInternalErr,
            22 => ErrorCode::CampaignLeaderSuccess,
            23 => ErrorCode::ObserverLeaderInternal,
            24 => ErrorCode::ObserverLeaderChange,
            25 => ErrorCode::LeaderResignErr,
            26 => ErrorCode::LeaderResiginSuccess,
            other => return Err(other),
        };
        Ok(code)
    }
}

impl From<ErrorCode> for i32 {
    fn from(code: ErrorCode) -> Self {
        code as i32
    }
}

impl std::fmt::Display for ErrorCode {
    fn fmt(
        &self,
        f: &mut std::fmt::Formatter<'_>,
    ) -> std::fmt::Result {
        write!(f, "{:?}({})", self, *self as i32)
    }
}
