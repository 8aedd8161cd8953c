//! Host compute client
//!
//! A Rust client library for a host-resident virtualization service: it
//! creates, starts, monitors, modifies, and tears down VM-backed compute
//! systems and the processes running inside them, and manages ref-counted
//! resources (file shares, persistent-memory devices) attached to those VMs.
//!
//! Every privileged host call is asynchronous under the hood — issue a
//! request, later receive a completion notification — but the API surface is
//! a set of ordinary awaitable operations that are thread-safe and
//! idempotent to close. The [`DispatchEngine`] routes completion events to
//! waiting operations; the [`HostService`] trait is the seam to the real
//! service (or a test double).
//!
//! # Example
//!
//! ```no_run
//! use std::sync::Arc;
//! use hostcompute::{DispatchEngine, HostService, VirtualMachine, VmOptions};
//!
//! # async fn demo(host: Arc<dyn HostService>) -> hostcompute::Result<()> {
//! let engine = Arc::new(DispatchEngine::new());
//!
//! let vm = VirtualMachine::create(host, engine, VmOptions {
//!     memory_mb: 2048,
//!     boot_files_path: Some(r"C:\vm\Files".into()),
//!     scratch_path: Some(r"C:\vm\scratch\sandbox.vhdx".into()),
//!     ..Default::default()
//! })
//! .await?;
//!
//! vm.start().await?;
//! let guest_path = vm.add_share(r"C:\layers\base", Default::default(), None).await?;
//! tracing::info!(%guest_path, "share attached");
//!
//! vm.remove_share(r"C:\layers\base").await?;
//! vm.close().await?;
//! # Ok(())
//! # }
//! ```

pub mod error;
pub mod notify;
pub mod process;
pub mod schema;
pub mod service;
pub mod system;
pub mod throttle;
pub mod timeouts;
pub mod vm;

pub use error::{Error, OpError, Result};
pub use notify::{DispatchEngine, Notification, NotificationKind, NotifyStatus};
pub use process::Process;
pub use service::{HostService, HostResponse, ProcessInfo, ServiceCode, StdioHandles};
pub use system::ComputeSystem;
pub use throttle::StartThrottle;
pub use vm::{OsKind, VirtualMachine, VmOptions};
