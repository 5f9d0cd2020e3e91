//! Error taxonomy shared by every control-plane component.
//!
//! Business denials are never errors: a refused scan is an
//! [`Admission::Deny`](crate::gate::Admission::Deny) value. Everything in
//! this module is either a caller mistake (validation, not found, conflict)
//! or an infrastructure fault, and infrastructure faults must always be
//! treated as "do not proceed".

use chrono::{DateTime, Utc};

/// Coarse classification of a [`ControlError`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ErrorKind {
    /// Malformed input, rejected before any side effect.
    Validation,
    /// The referenced record does not exist.
    NotFound,
    /// The operation conflicts with the record's current state.
    Conflict,
    /// Storage, authority or audit sink unavailable.
    Infrastructure,
}

/// Errors from control-plane operations.
#[derive(Debug, thiserror::Error)]
pub enum ControlError {
    /// `valid_until` does not come strictly after `valid_from`.
    #[error("valid_until ({valid_until}) must be after valid_from ({valid_from})")]
    InvalidRange {
        /// Start of the requested window.
        valid_from: DateTime<Utc>,
        /// End of the requested window.
        valid_until: DateTime<Utc>,
    },

    /// A rejection was requested without a reason.
    #[error("a reason is required when rejecting an authorization")]
    MissingReason,

    /// A required field is missing or malformed.
    #[error("invalid input: {0}")]
    InvalidInput(String),

    /// A timestamp falls outside the years 0 to 9999 that storage can order.
    #[error("timestamp {0} is outside the storable range")]
    TimeOutOfRange(DateTime<Utc>),

    /// An unknown enum value was parsed from input or storage.
    #[error("invalid {field} value: {value:?}")]
    InvalidEnum {
        /// Which field contained the bad value.
        field: &'static str,
        /// The unexpected value.
        value: String,
    },

    /// No authorization, session or scan exists with the given id.
    #[error("{id} not found")]
    NotFound {
        /// The unknown identifier.
        id: String,
    },

    /// The authorization already left the pending state.
    #[error("authorization {id} was already {status}")]
    AlreadyDecided {
        /// Identifier of the record.
        id: String,
        /// The terminal status it holds.
        status: String,
    },

    /// A scan job already reached a final status.
    #[error("scan {id} is already {status}")]
    ScanFinished {
        /// Identifier of the job.
        id: String,
        /// The final status it holds.
        status: String,
    },

    /// Database operation failed.
    #[error("database error: {0}")]
    Database(#[from] sqlx::Error),

    /// A stored row could not be decoded.
    #[error("corrupt {field} in storage: {value:?}")]
    CorruptRow {
        /// Column that failed to decode.
        field: &'static str,
        /// Raw stored value.
        value: String,
    },

    /// The external pulse authority could not be consulted.
    #[error("pulse authority error: {0}")]
    Authority(String),

    /// JSON encoding or decoding failed.
    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    /// The audit writer actor has stopped.
    #[error("audit writer channel closed")]
    AuditWriterClosed,

    /// The audit signing key was rejected.
    #[error("audit signing failed: {0}")]
    Signing(String),
}

impl ControlError {
    /// Classify this error for callers that map it onto a transport status.
    pub fn kind(&self) -> ErrorKind {
        match self {
            Self::InvalidRange { .. }
            | Self::MissingReason
            | Self::InvalidInput(_)
            | Self::TimeOutOfRange(_)
            | Self::InvalidEnum { .. } => ErrorKind::Validation,
            Self::NotFound { .. } => ErrorKind::NotFound,
            Self::AlreadyDecided { .. } | Self::ScanFinished { .. } => ErrorKind::Conflict,
            Self::Database(_)
            | Self::CorruptRow { .. }
            | Self::Authority(_)
            | Self::Serialization(_)
            | Self::AuditWriterClosed
            | Self::Signing(_) => ErrorKind::Infrastructure,
        }
    }

    /// Returns `true` for faults that must be treated as deny-and-report.
    pub fn is_infrastructure(&self) -> bool {
        self.kind() == ErrorKind::Infrastructure
    }
}
