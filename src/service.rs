//! The host control-plane boundary.
//!
//! Every privileged operation the client performs goes through [`HostService`],
//! a thin synchronous trait mirroring the host virtualization service's call
//! surface. The production implementation is an FFI adapter that forwards
//! native completion callbacks into [`crate::DispatchEngine::dispatch`]; tests
//! substitute fakes or mocks.

use std::fmt;

use tokio::io::{AsyncRead, AsyncWrite};

use crate::error::ErrorEvent;

/// Opaque handle to a host-managed compute system.
pub type SystemHandle = u64;

/// Opaque handle to a process inside a compute system.
pub type ProcessHandle = u64;

/// Classification of a host call result.
///
/// `Pending` means the call was accepted and will complete asynchronously via
/// a notification; the remaining non-success codes separate idempotent
/// outcomes ("already stopped"), soft failures ("not found"), and hard
/// failures.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ServiceCode {
    Success,
    Pending,
    AlreadyStopped,
    InvalidState,
    SystemNotFound,
    ElementNotFound,
    AccessDenied,
    Unexpected(i32),
}

impl fmt::Display for ServiceCode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ServiceCode::Success => write!(f, "success"),
            ServiceCode::Pending => write!(f, "operation pending"),
            ServiceCode::AlreadyStopped => write!(f, "already stopped"),
            ServiceCode::InvalidState => write!(f, "invalid state for operation"),
            ServiceCode::SystemNotFound => write!(f, "compute system does not exist"),
            ServiceCode::ElementNotFound => write!(f, "element not found"),
            ServiceCode::AccessDenied => write!(f, "access denied"),
            ServiceCode::Unexpected(code) => write!(f, "unexpected failure {code:#010x}"),
        }
    }
}

/// Result of a host call: the classified code, an optional result document,
/// and any diagnostic events parsed from the result payload.
#[derive(Debug)]
pub struct HostResponse {
    pub code: ServiceCode,
    pub document: Option<String>,
    pub events: Vec<ErrorEvent>,
}

impl HostResponse {
    pub fn success() -> Self {
        Self::new(ServiceCode::Success)
    }

    pub fn pending() -> Self {
        Self::new(ServiceCode::Pending)
    }

    pub fn new(code: ServiceCode) -> Self {
        Self {
            code,
            document: None,
            events: Vec::new(),
        }
    }

    pub fn with_document(mut self, document: impl Into<String>) -> Self {
        self.document = Some(document.into());
        self
    }
}

/// The three standard I/O streams of a process, surrendered once by the host
/// when the process is created. Dropping a stream closes the local side only;
/// the host-side pipes live until the process handle is closed.
#[derive(Default)]
pub struct StdioHandles {
    pub stdin: Option<Box<dyn AsyncWrite + Send + Unpin>>,
    pub stdout: Option<Box<dyn AsyncRead + Send + Unpin>>,
    pub stderr: Option<Box<dyn AsyncRead + Send + Unpin>>,
}

/// What the host hands back for a freshly created or opened process.
pub struct ProcessInfo {
    pub handle: ProcessHandle,
    pub pid: u32,
    pub stdio: StdioHandles,
}

/// Synchronous call surface of the host virtualization service.
///
/// Calls that return [`ServiceCode::Pending`] complete later through the
/// notification channel registered with `register_system_callback` /
/// `register_process_callback`; the adapter must route those notifications to
/// the dispatch engine under the token it was given.
#[cfg_attr(test, mockall::automock)]
pub trait HostService: Send + Sync + 'static {
    fn create_system(&self, id: &str, document: &str) -> (HostResponse, Option<SystemHandle>);
    fn open_system(&self, id: &str) -> (HostResponse, Option<SystemHandle>);
    fn register_system_callback(&self, handle: SystemHandle, token: u64) -> HostResponse;
    fn unregister_system_callback(&self, handle: SystemHandle) -> HostResponse;
    fn start_system(&self, handle: SystemHandle, options: &str) -> HostResponse;
    fn shutdown_system(&self, handle: SystemHandle, options: &str) -> HostResponse;
    fn terminate_system(&self, handle: SystemHandle, options: &str) -> HostResponse;
    fn pause_system(&self, handle: SystemHandle, options: &str) -> HostResponse;
    fn resume_system(&self, handle: SystemHandle, options: &str) -> HostResponse;
    fn get_system_properties(&self, handle: SystemHandle, query: &str) -> HostResponse;
    fn modify_system(&self, handle: SystemHandle, settings: &str) -> HostResponse;
    fn close_system(&self, handle: SystemHandle) -> HostResponse;

    fn create_process(
        &self,
        handle: SystemHandle,
        config: &str,
    ) -> (HostResponse, Option<ProcessInfo>);
    fn open_process(&self, handle: SystemHandle, pid: u32)
        -> (HostResponse, Option<ProcessHandle>);
    fn register_process_callback(&self, handle: ProcessHandle, token: u64) -> HostResponse;
    fn unregister_process_callback(&self, handle: ProcessHandle) -> HostResponse;
    fn signal_process(&self, handle: ProcessHandle, options: &str) -> HostResponse;
    fn terminate_process(&self, handle: ProcessHandle) -> HostResponse;
    fn modify_process(&self, handle: ProcessHandle, request: &str) -> HostResponse;
    fn get_process_properties(&self, handle: ProcessHandle) -> HostResponse;
    fn close_process(&self, handle: ProcessHandle) -> HostResponse;
}
