//! Creation-document construction.
//!
//! Compiles [`VmOptions`](crate::vm::VmOptions) into the PascalCase document
//! the host expects, then splices any caller-supplied overlay document on
//! top.

use std::collections::HashMap;

use serde_json::Value;

use crate::error::{Error, Result};
use crate::schema::{
    Chipset, ComPorts, DevicesConfig, MemoryConfig, PmemControllerConfig, ProcessorConfig,
    ScsiAttachment, ScsiController, SmbShare, SmbShareOptions, SystemDocument, Topology, Uefi,
    UefiBootEntry, VirtualMachineConfig, VirtualSmbConfig,
};
use crate::vm::{OsKind, VmOptions};

const WINDOWS_BOOT_PATH: &str = r"\EFI\Microsoft\Boot\bootmgfw.efi";
const BOOT_DEVICE_TYPE: &str = "VmbFs";
const DEFAULT_KERNEL_FILE: &str = "bootx64.efi";
const DEFAULT_INITRD_FILE: &str = "initrd.img";
const BOOT_SHARE_NAME: &str = "os";

pub(crate) fn build(id: &str, owner: &str, opts: &VmOptions) -> Result<Value> {
    let boot_share = opts.boot_files_path.as_ref().map(|path| SmbShare {
        name: BOOT_SHARE_NAME.to_string(),
        path: path.clone(),
        options: Some(SmbShareOptions {
            read_only: true,
            cache_io: true,
            share_read: true,
            take_backup_privilege: true,
            pseudo_oplocks: opts.os == OsKind::Windows,
            ..Default::default()
        }),
    });

    let mut devices = DevicesConfig {
        scsi: HashMap::new(),
        virtual_smb: boot_share.map(|share| VirtualSmbConfig {
            direct_file_mapping_in_mb: Some(1024),
            shares: vec![share],
        }),
        virtual_pmem: None,
        com_ports: None,
    };

    // The scratch disk is always attached at SCSI 0:0.
    if let Some(scratch) = &opts.scratch_path {
        let mut attachments = HashMap::new();
        attachments.insert(
            "0".to_string(),
            ScsiAttachment {
                path: scratch.clone(),
                attachment_type: "VirtualDisk".to_string(),
            },
        );
        devices
            .scsi
            .insert("0".to_string(), ScsiController { attachments });
    }

    let boot_this = match opts.os {
        OsKind::Windows => UefiBootEntry {
            device_path: WINDOWS_BOOT_PATH.to_string(),
            device_type: BOOT_DEVICE_TYPE.to_string(),
            optional_data: String::new(),
        },
        OsKind::Linux => {
            let kernel = opts.kernel_file.as_deref().unwrap_or(DEFAULT_KERNEL_FILE);
            let initrd = opts.initrd_file.as_deref().unwrap_or(DEFAULT_INITRD_FILE);
            let mut optional_data = format!(r"initrd=\{initrd}");
            if opts.console_pipe.is_some() {
                optional_data.push_str(" console=ttyS0,115200");
            }
            if let Some(extra) = &opts.kernel_boot_options {
                optional_data.push(' ');
                optional_data.push_str(extra);
            }
            UefiBootEntry {
                device_path: format!(r"\{kernel}"),
                device_type: BOOT_DEVICE_TYPE.to_string(),
                optional_data,
            }
        }
    };

    if opts.os == OsKind::Linux {
        devices.virtual_pmem = Some(PmemControllerConfig {
            maximum_count: opts.pmem_device_count,
        });
        if let Some(pipe) = &opts.console_pipe {
            devices.com_ports = Some(ComPorts {
                port1: pipe.clone(),
            });
        }
    }

    let document = SystemDocument {
        owner: owner.to_string(),
        schema_version: Default::default(),
        should_terminate_on_last_handle_closed: true,
        virtual_machine: Some(VirtualMachineConfig {
            chipset: Some(Chipset {
                uefi: Some(Uefi {
                    boot_this: Some(boot_this),
                }),
            }),
            compute_topology: Some(Topology {
                memory: MemoryConfig {
                    size_in_mb: opts.memory_mb,
                    allow_overcommit: true,
                },
                processor: ProcessorConfig {
                    count: opts.processor_count,
                },
            }),
            devices: Some(devices),
            guest_connection: Some(Default::default()),
        }),
    };

    let mut document = serde_json::to_value(&document)
        .map_err(|err| Error::Config(format!("failed to build document for {id}: {err}")))?;
    if let Some(overlay) = &opts.additional_document {
        merge(&mut document, overlay);
    }
    Ok(document)
}

/// Deep merge of `overlay` into `base`: objects merge recursively, anything
/// else in the overlay replaces the base value.
pub(crate) fn merge(base: &mut Value, overlay: &Value) {
    match (base, overlay) {
        (Value::Object(base_map), Value::Object(overlay_map)) => {
            for (key, overlay_value) in overlay_map {
                match base_map.get_mut(key) {
                    Some(base_value) => merge(base_value, overlay_value),
                    None => {
                        base_map.insert(key.clone(), overlay_value.clone());
                    }
                }
            }
        }
        (base_value, overlay_value) => *base_value = overlay_value.clone(),
    }
}
