//! Persistent-memory devices, Linux guests only.
//!
//! Devices occupy fixed slots out of a bounded table; a slot is free iff its
//! host-path entry is empty. Allocation is first-fit, so freed slots are
//! reused, and the slot number stays stable for the life of the attachment.

use crate::error::Result;
use crate::schema::{pmem_resource_path, MappedPmemDevice, ModifySettingRequest, PmemDevice};
use crate::vm::resource::ResourceKind;
use crate::vm::VirtualMachine;

/// Platform ceiling on persistent-memory device slots per VM.
pub const MAX_PMEM_DEVICES: u32 = 128;

/// Default slot-table size when the caller does not configure one.
pub const DEFAULT_PMEM_DEVICES: u32 = 64;

const PMEM_IMAGE_FORMAT: &str = "Vhd1";

pub(crate) struct PmemSettings {
    pub mount_path: Option<String>,
}

/// Fixed-size slot table; `slots[n]` holds the host path occupying slot `n`.
pub(crate) struct PmemKind {
    slots: Vec<Option<String>>,
}

impl PmemKind {
    pub fn new(capacity: u32) -> Self {
        Self {
            slots: vec![None; capacity as usize],
        }
    }
}

impl ResourceKind for PmemKind {
    type Identity = u32;
    type Settings = PmemSettings;

    const ADD_OP: &'static str = "AddDevice";
    const REMOVE_OP: &'static str = "RemoveDevice";

    fn allocate(&mut self, host_path: &str) -> Option<u32> {
        for (index, slot) in self.slots.iter_mut().enumerate() {
            if slot.is_none() {
                *slot = Some(host_path.to_string());
                return Some(index as u32);
            }
        }
        None
    }

    fn release(&mut self, identity: &u32) {
        if let Some(slot) = self.slots.get_mut(*identity as usize) {
            *slot = None;
        }
    }

    fn guest_path(&self, identity: &u32, settings: &PmemSettings) -> String {
        settings
            .mount_path
            .clone()
            .unwrap_or_else(|| format!("/tmp/p{identity}"))
    }

    fn add_request(
        &self,
        identity: &u32,
        host_path: &str,
        guest_path: &str,
        _settings: &PmemSettings,
    ) -> std::result::Result<ModifySettingRequest, serde_json::Error> {
        let device = PmemDevice {
            host_path: host_path.to_string(),
            read_only: true,
            image_format: PMEM_IMAGE_FORMAT.to_string(),
        };
        let mapped = MappedPmemDevice {
            device_number: *identity,
            mount_path: guest_path.to_string(),
        };
        Ok(
            ModifySettingRequest::add(pmem_resource_path(*identity), serde_json::to_value(device)?)
                .with_hosted_settings(serde_json::to_value(mapped)?),
        )
    }

    fn remove_request(
        &self,
        identity: &u32,
        guest_path: &str,
        _settings: &PmemSettings,
    ) -> std::result::Result<ModifySettingRequest, serde_json::Error> {
        let mapped = MappedPmemDevice {
            device_number: *identity,
            mount_path: guest_path.to_string(),
        };
        Ok(ModifySettingRequest::remove(pmem_resource_path(*identity))
            .with_hosted_settings(serde_json::to_value(mapped)?))
    }
}

impl VirtualMachine {
    /// Attaches a persistent-memory image at the next free slot, or bumps
    /// the reference count if `host_path` is already attached. Returns the
    /// slot number and the guest mount path.
    pub async fn add_pmem_device(
        &self,
        host_path: &str,
        mount_path: Option<&str>,
    ) -> Result<(u32, String)> {
        self.ensure_os(PmemKind::ADD_OP, "linux")?;
        self.attach(
            &self.pmem,
            host_path,
            PmemSettings {
                mount_path: mount_path.map(str::to_string),
            },
        )
        .await
    }

    /// Drops one reference to a persistent-memory device; the host-level
    /// remove happens only when the last reference goes away.
    pub async fn remove_pmem_device(&self, host_path: &str) -> Result<()> {
        self.ensure_os(PmemKind::REMOVE_OP, "linux")?;
        self.detach(&self.pmem, host_path).await
    }

    /// Slot number and guest mount path of an attached device. Pure lookup;
    /// never allocates.
    pub async fn pmem_device(&self, host_path: &str) -> Result<(u32, String)> {
        let pmem = self.pmem.lock().await;
        pmem.get(host_path)
            .map(|attachment| (attachment.identity, attachment.guest_path.clone()))
            .ok_or_else(|| self.not_attached(host_path))
    }
}
