//! Virtual machine façade: a compute system plus its ref-counted resource
//! attachments.
//!
//! The façade translates attach/detach calls into at most one host-level
//! modify per host path, tracked in per-kind ledgers. Lock order is fixed:
//! the system handle lock (shared) is taken before a ledger lock, never the
//! reverse, so a close in progress cannot deadlock with a concurrent attach.

mod document;
mod pmem;
mod resource;
mod share;

pub use pmem::{DEFAULT_PMEM_DEVICES, MAX_PMEM_DEVICES};
pub use share::SHARE_GUEST_PREFIX;

use std::sync::Arc;

use serde_json::Value;
use tokio::sync::Mutex;
use tracing::debug;

use crate::error::{Error, Result, SystemError};
use crate::notify::DispatchEngine;
use crate::service::HostService;
use crate::system::ComputeSystem;
use crate::vm::pmem::PmemKind;
use crate::vm::resource::{Attachment, Ledger, ResourceKind};
use crate::vm::share::ShareKind;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OsKind {
    Windows,
    Linux,
}

/// Options for creating a new virtual machine.
pub struct VmOptions {
    /// Identifier; a random UUID when omitted.
    pub id: Option<String>,
    /// Owner recorded in the creation document; defaults to the crate name.
    pub owner: Option<String>,
    pub os: OsKind,
    pub memory_mb: u64,
    pub processor_count: u32,
    /// Folder holding the boot files, shared into the guest read-only.
    pub boot_files_path: Option<String>,
    /// Writable scratch disk, attached at SCSI 0:0. Provisioning the image
    /// is the caller's concern.
    pub scratch_path: Option<String>,
    /// Kernel file name under `boot_files_path` (Linux).
    pub kernel_file: Option<String>,
    /// Initrd file name under `boot_files_path` (Linux).
    pub initrd_file: Option<String>,
    /// Extra kernel command-line options (Linux).
    pub kernel_boot_options: Option<String>,
    /// Named pipe for the serial console (Linux).
    pub console_pipe: Option<String>,
    /// Size of the persistent-memory slot table (Linux).
    pub pmem_device_count: u32,
    /// Overlay document merged on top of the generated one.
    pub additional_document: Option<Value>,
}

impl Default for VmOptions {
    fn default() -> Self {
        Self {
            id: None,
            owner: None,
            os: OsKind::Windows,
            memory_mb: 1024,
            processor_count: 2,
            boot_files_path: None,
            scratch_path: None,
            kernel_file: None,
            initrd_file: None,
            kernel_boot_options: None,
            console_pipe: None,
            pmem_device_count: DEFAULT_PMEM_DEVICES,
            additional_document: None,
        }
    }
}

impl VmOptions {
    fn validate(&self) -> Result<()> {
        if self.memory_mb < 32 {
            return Err(Error::Config("memory must be at least 32MB".into()));
        }
        if self.processor_count < 1 {
            return Err(Error::Config("processor_count must be at least 1".into()));
        }
        if self.pmem_device_count > MAX_PMEM_DEVICES {
            return Err(Error::Config(format!(
                "pmem_device_count exceeds the platform maximum of {MAX_PMEM_DEVICES}"
            )));
        }
        Ok(())
    }
}

pub struct VirtualMachine {
    system: Arc<ComputeSystem>,
    shares: Mutex<Ledger<ShareKind>>,
    pmem: Mutex<Ledger<PmemKind>>,
}

impl VirtualMachine {
    /// Creates (but does not start) a virtual machine from `opts`.
    pub async fn create(
        host: Arc<dyn HostService>,
        engine: Arc<DispatchEngine>,
        opts: VmOptions,
    ) -> Result<VirtualMachine> {
        opts.validate()?;
        let id = opts
            .id
            .clone()
            .unwrap_or_else(|| uuid::Uuid::new_v4().to_string());
        let owner = opts
            .owner
            .clone()
            .unwrap_or_else(|| env!("CARGO_PKG_NAME").to_string());

        let document = document::build(&id, &owner, &opts)?;
        let system = ComputeSystem::create(host, engine, &id, &document).await?;

        Ok(VirtualMachine {
            system,
            shares: Mutex::new(Ledger::new(ShareKind::default())),
            pmem: Mutex::new(Ledger::new(PmemKind::new(opts.pmem_device_count))),
        })
    }

    pub fn id(&self) -> &str {
        self.system.id()
    }

    /// The underlying compute system, for lifecycle and process operations.
    pub fn system(&self) -> &Arc<ComputeSystem> {
        &self.system
    }

    pub async fn start(&self) -> Result<()> {
        self.system.start().await
    }

    pub async fn wait(&self) -> Result<()> {
        self.system.wait().await
    }

    /// Terminates the virtual machine and releases its handle.
    pub async fn close(&self) -> Result<()> {
        // Best-effort terminate; the system may already be gone.
        let _ = self.system.terminate().await;
        self.system.close().await
    }

    fn ensure_os(&self, op: &'static str, required: &str) -> Result<()> {
        let os = self.system.os();
        if os != required {
            return Err(Error::UnsupportedOs {
                op,
                os: os.to_string(),
            });
        }
        Ok(())
    }

    fn not_attached(&self, host_path: &str) -> Error {
        Error::NotAttached {
            system_id: self.system.id().to_string(),
            host_path: host_path.to_string(),
        }
    }

    /// Ref-counted attach, written once for every resource kind: a host
    /// path already in the ledger only gains a reference, otherwise an
    /// identity is allocated and a single host-level add is issued.
    async fn attach<K: ResourceKind>(
        &self,
        ledger: &Mutex<Ledger<K>>,
        host_path: &str,
        settings: K::Settings,
    ) -> Result<(K::Identity, String)> {
        let handle = self.system.attached(K::ADD_OP).await?;
        let mut ledger = ledger.lock().await;
        let Ledger { kind, entries } = &mut *ledger;

        if let Some(attachment) = entries.get_mut(host_path) {
            attachment.ref_count += 1;
            debug!(
                system_id = %self.system.id(),
                host_path,
                identity = ?attachment.identity,
                ref_count = attachment.ref_count,
                "resource already attached"
            );
            return Ok((attachment.identity.clone(), attachment.guest_path.clone()));
        }

        let identity = kind
            .allocate(host_path)
            .ok_or_else(|| Error::NoFreeSlots {
                system_id: self.system.id().to_string(),
            })?;
        let guest_path = kind.guest_path(&identity, &settings);
        let request = kind
            .add_request(&identity, host_path, &guest_path, &settings)
            .map_err(|err| {
                Error::from(SystemError::new(self.system.id(), K::ADD_OP, err.into()))
            })?;

        if let Err(err) = self.system.modify_on(&handle, &request) {
            kind.release(&identity);
            return Err(err);
        }

        debug!(
            system_id = %self.system.id(),
            host_path,
            identity = ?identity,
            "resource attached"
        );
        entries.insert(
            host_path.to_string(),
            Attachment {
                identity: identity.clone(),
                ref_count: 1,
                guest_path: guest_path.clone(),
                settings,
            },
        );
        Ok((identity, guest_path))
    }

    /// Ref-counted detach: the host-level remove and ledger erase happen
    /// only when the last reference goes away. The count never goes below
    /// zero — detaching an unattached path is an error.
    async fn detach<K: ResourceKind>(
        &self,
        ledger: &Mutex<Ledger<K>>,
        host_path: &str,
    ) -> Result<()> {
        let handle = self.system.attached(K::REMOVE_OP).await?;
        let mut ledger = ledger.lock().await;
        let Ledger { kind, entries } = &mut *ledger;

        let attachment = entries
            .get_mut(host_path)
            .ok_or_else(|| self.not_attached(host_path))?;
        if attachment.ref_count > 1 {
            attachment.ref_count -= 1;
            return Ok(());
        }

        let request = kind
            .remove_request(&attachment.identity, &attachment.guest_path, &attachment.settings)
            .map_err(|err| {
                Error::from(SystemError::new(self.system.id(), K::REMOVE_OP, err.into()))
            })?;
        self.system.modify_on(&handle, &request)?;

        if let Some(attachment) = entries.remove(host_path) {
            kind.release(&attachment.identity);
        }
        debug!(system_id = %self.system.id(), host_path, "resource detached");
        Ok(())
    }
}
