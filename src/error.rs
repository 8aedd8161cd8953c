//! Error types for the compute-system client

use std::time::Duration;

use serde::Deserialize;
use thiserror::Error;

use crate::service::ServiceCode;

/// A diagnostic event reported by the host service alongside a failed call.
#[derive(Debug, Clone, Default, PartialEq, Deserialize)]
#[serde(rename_all = "PascalCase", default)]
pub struct ErrorEvent {
    pub message: String,
    pub stack_trace: Option<String>,
    pub provider: Option<String>,
    pub event_id: u32,
    pub flags: u32,
    pub source: Option<String>,
}

/// The underlying cause of a failed system or process operation.
///
/// Every variant is cloneable so the terminal wait outcome can be handed to
/// every concurrent `wait` caller.
#[derive(Debug, Clone, Error)]
pub enum OpError {
    #[error("the handle has already been closed")]
    AlreadyClosed,

    #[error("the operation timed out after {0:?}")]
    Timeout(Duration),

    #[error("the handle was invalidated while waiting")]
    HandleInvalidated,

    #[error("has not yet exited")]
    NotExited,

    #[error("the compute system exited unexpectedly")]
    UnexpectedExit,

    #[error("the host service returned {0}")]
    Service(ServiceCode),

    #[error("the notification reported failure code {0:#010x}")]
    Notification(i32),

    #[error("the host service returned no document")]
    MissingDocument,

    #[error("failed to encode request: {0}")]
    Encode(String),

    #[error("failed to decode host document: {0}")]
    Decode(String),
}

impl From<serde_json::Error> for OpError {
    fn from(err: serde_json::Error) -> Self {
        OpError::Encode(err.to_string())
    }
}

/// A failed operation against a compute system, carrying the outgoing request
/// document and any host events for diagnostics.
#[derive(Debug, Clone, Error)]
#[error("{op} {system_id}: {cause}")]
pub struct SystemError {
    pub system_id: String,
    pub op: &'static str,
    #[source]
    pub cause: OpError,
    pub document: Option<String>,
    pub events: Vec<ErrorEvent>,
}

impl SystemError {
    pub fn new(system_id: impl Into<String>, op: &'static str, cause: OpError) -> Self {
        Self {
            system_id: system_id.into(),
            op,
            cause,
            document: None,
            events: Vec::new(),
        }
    }

    pub fn with_document(mut self, document: impl Into<String>) -> Self {
        self.document = Some(document.into());
        self
    }

    pub fn with_events(mut self, events: Vec<ErrorEvent>) -> Self {
        self.events = events;
        self
    }
}

/// A failed operation against a process inside a compute system.
#[derive(Debug, Clone, Error)]
#[error("{op} {system_id}/{process_id}: {cause}")]
pub struct ProcessError {
    pub system_id: String,
    pub process_id: u32,
    pub op: &'static str,
    #[source]
    pub cause: OpError,
    pub events: Vec<ErrorEvent>,
}

impl ProcessError {
    pub fn new(
        system_id: impl Into<String>,
        process_id: u32,
        op: &'static str,
        cause: OpError,
    ) -> Self {
        Self {
            system_id: system_id.into(),
            process_id,
            op,
            cause,
            events: Vec::new(),
        }
    }

    pub fn with_events(mut self, events: Vec<ErrorEvent>) -> Self {
        self.events = events;
        self
    }
}

#[derive(Debug, Clone, Error)]
pub enum Error {
    #[error(transparent)]
    System(#[from] SystemError),

    #[error(transparent)]
    Process(#[from] ProcessError),

    #[error("{host_path} is not attached to compute system {system_id}")]
    NotAttached { system_id: String, host_path: String },

    #[error("no free persistent-memory device slots on compute system {system_id}")]
    NoFreeSlots { system_id: String },

    #[error("{op} is not supported on a {os} compute system")]
    UnsupportedOs { op: &'static str, os: String },

    #[error("configuration error: {0}")]
    Config(String),
}

pub type Result<T> = std::result::Result<T, Error>;

impl Error {
    /// The per-operation cause, when this error came from a host call.
    pub fn cause(&self) -> Option<&OpError> {
        match self {
            Error::System(e) => Some(&e.cause),
            Error::Process(e) => Some(&e.cause),
            _ => None,
        }
    }

    /// True if an awaited notification did not arrive within its budget.
    pub fn is_timeout(&self) -> bool {
        matches!(self.cause(), Some(OpError::Timeout(_)))
    }

    /// True if the operation was attempted on a closed handle.
    pub fn is_already_closed(&self) -> bool {
        matches!(self.cause(), Some(OpError::AlreadyClosed))
    }

    /// True if the host reported the target gone.
    pub fn is_not_exist(&self) -> bool {
        matches!(
            self.cause(),
            Some(OpError::Service(
                ServiceCode::SystemNotFound | ServiceCode::ElementNotFound
            ))
        )
    }
}
