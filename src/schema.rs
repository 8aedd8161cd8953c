//! Wire documents exchanged with the host service and the guest.
//!
//! Shapes follow the host's PascalCase JSON schema. Everything here is plain
//! data; the state machines and the resource façade decide when to send it.

use std::collections::HashMap;

use serde::{Deserialize, Serialize};
use serde_json::Value;

/// Resource path for virtual SMB shares in a modify request.
pub const SHARE_RESOURCE_PATH: &str = "VirtualMachine/Devices/VirtualSmb/Shares";

/// Resource path for one persistent-memory device slot.
pub fn pmem_resource_path(device_number: u32) -> String {
    format!("VirtualMachine/Devices/VirtualPMem/Devices/{device_number}")
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum RequestType {
    Add,
    Remove,
    Update,
}

/// A single settings-modification request against a compute system.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase")]
pub struct ModifySettingRequest {
    pub request_type: RequestType,
    pub resource_path: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub settings: Option<Value>,
    /// Guest-directed metadata forwarded alongside the host-side change.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub hosted_settings: Option<Value>,
}

impl ModifySettingRequest {
    pub fn add(resource_path: impl Into<String>, settings: Value) -> Self {
        Self {
            request_type: RequestType::Add,
            resource_path: resource_path.into(),
            settings: Some(settings),
            hosted_settings: None,
        }
    }

    pub fn remove(resource_path: impl Into<String>) -> Self {
        Self {
            request_type: RequestType::Remove,
            resource_path: resource_path.into(),
            settings: None,
            hosted_settings: None,
        }
    }

    pub fn with_settings(mut self, settings: Value) -> Self {
        self.settings = Some(settings);
        self
    }

    pub fn with_hosted_settings(mut self, hosted: Value) -> Self {
        self.hosted_settings = Some(hosted);
        self
    }
}

/// Resource kinds understood by the guest side of a modify request.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ResourceType {
    MappedDirectory,
    MappedVirtualDisk,
    Network,
    CombinedLayers,
    #[serde(rename = "VPMemDevice")]
    VPMemDevice,
}

/// A modify command passed through the host to the guest.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase")]
pub struct GuestRequest {
    pub request_type: RequestType,
    pub resource_type: ResourceType,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub settings: Option<Value>,
}

/// Layered filesystem description handed to the guest: the guest unions
/// `layers` with `scratch_path` and mounts the result at
/// `container_root_path`.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase", default)]
pub struct CombinedLayers {
    #[serde(skip_serializing_if = "String::is_empty")]
    pub container_root_path: String,
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub layers: Vec<LayerRef>,
    #[serde(skip_serializing_if = "String::is_empty")]
    pub scratch_path: String,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase", default)]
pub struct LayerRef {
    pub id: String,
    pub path: String,
}

/// A host directory mapped into the guest.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase", default)]
pub struct MappedDirectory {
    pub mount_path: String,
    pub port: i32,
    #[serde(skip_serializing_if = "String::is_empty")]
    pub share_name: String,
    pub read_only: bool,
}

/// A virtual disk mapped into the guest over a disk controller.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase", default)]
pub struct MappedVirtualDisk {
    pub mount_path: String,
    pub lun: u8,
    pub controller: u8,
    pub read_only: bool,
}

/// A persistent-memory device slot exposed to the guest.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase", default)]
pub struct MappedPmemDevice {
    pub device_number: u32,
    pub mount_path: String,
}

/// Host-side settings of one virtual SMB share.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase", default)]
pub struct SmbShare {
    pub name: String,
    #[serde(skip_serializing_if = "String::is_empty")]
    pub path: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub options: Option<SmbShareOptions>,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase", default)]
pub struct SmbShareOptions {
    pub read_only: bool,
    pub cache_io: bool,
    pub share_read: bool,
    pub pseudo_oplocks: bool,
    pub take_backup_privilege: bool,
    pub no_directmap: bool,
}

/// Host-side settings of one persistent-memory device.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase", default)]
pub struct PmemDevice {
    pub host_path: String,
    pub read_only: bool,
    #[serde(skip_serializing_if = "String::is_empty")]
    pub image_format: String,
}

// ---- Process modify requests ----------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ProcessModifyOperation {
    ConsoleSize,
    CloseHandle,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum StdioStream {
    StdIn,
    StdOut,
    StdErr,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase")]
pub struct ConsoleSize {
    pub height: u16,
    pub width: u16,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase")]
pub struct CloseHandle {
    pub handle: StdioStream,
}

/// A modify request scoped to one process handle.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase")]
pub struct ProcessModifyRequest {
    pub operation: ProcessModifyOperation,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub console_size: Option<ConsoleSize>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub close_handle: Option<CloseHandle>,
}

impl ProcessModifyRequest {
    pub fn console_size(width: u16, height: u16) -> Self {
        Self {
            operation: ProcessModifyOperation::ConsoleSize,
            console_size: Some(ConsoleSize { height, width }),
            close_handle: None,
        }
    }

    pub fn close_handle(handle: StdioStream) -> Self {
        Self {
            operation: ProcessModifyOperation::CloseHandle,
            console_size: None,
            close_handle: Some(CloseHandle { handle }),
        }
    }
}

/// Exit state reported by the host for a process.
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(rename_all = "PascalCase", default)]
pub struct ProcessStatus {
    pub process_id: u32,
    pub exited: bool,
    pub exit_code: i32,
    pub last_wait_result: i32,
}

// ---- Property queries ------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum PropertyType {
    Memory,
    Statistics,
    ProcessList,
    GuestConnection,
}

#[derive(Debug, Clone, Default, Serialize)]
#[serde(rename_all = "PascalCase")]
pub struct PropertyQuery {
    pub property_types: Vec<PropertyType>,
}

/// Properties of a compute system as reported by the host.
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(rename_all = "PascalCase", default)]
pub struct SystemProperties {
    pub id: String,
    pub state: Option<String>,
    pub system_type: String,
    pub runtime_os_type: Option<String>,
    pub stopped: bool,
}

// ---- Compute system creation document -------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase")]
pub struct SchemaVersion {
    pub major: u32,
    pub minor: u32,
}

impl Default for SchemaVersion {
    fn default() -> Self {
        Self { major: 2, minor: 1 }
    }
}

/// Root of the document sent to create a compute system.
#[derive(Debug, Clone, Default, Serialize)]
#[serde(rename_all = "PascalCase")]
pub struct SystemDocument {
    pub owner: String,
    pub schema_version: SchemaVersion,
    pub should_terminate_on_last_handle_closed: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub virtual_machine: Option<VirtualMachineConfig>,
}

#[derive(Debug, Clone, Default, Serialize)]
#[serde(rename_all = "PascalCase")]
pub struct VirtualMachineConfig {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub chipset: Option<Chipset>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub compute_topology: Option<Topology>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub devices: Option<DevicesConfig>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub guest_connection: Option<GuestConnection>,
}

#[derive(Debug, Clone, Default, Serialize)]
#[serde(rename_all = "PascalCase")]
pub struct Chipset {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub uefi: Option<Uefi>,
}

#[derive(Debug, Clone, Default, Serialize)]
#[serde(rename_all = "PascalCase")]
pub struct Uefi {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub boot_this: Option<UefiBootEntry>,
}

#[derive(Debug, Clone, Default, Serialize)]
#[serde(rename_all = "PascalCase")]
pub struct UefiBootEntry {
    pub device_path: String,
    pub device_type: String,
    #[serde(skip_serializing_if = "String::is_empty")]
    pub optional_data: String,
}

#[derive(Debug, Clone, Default, Serialize)]
#[serde(rename_all = "PascalCase")]
pub struct Topology {
    pub memory: MemoryConfig,
    pub processor: ProcessorConfig,
}

#[derive(Debug, Clone, Default, Serialize)]
#[serde(rename_all = "PascalCase")]
pub struct MemoryConfig {
    #[serde(rename = "SizeInMB")]
    pub size_in_mb: u64,
    pub allow_overcommit: bool,
}

#[derive(Debug, Clone, Default, Serialize)]
#[serde(rename_all = "PascalCase")]
pub struct ProcessorConfig {
    pub count: u32,
}

#[derive(Debug, Clone, Default, Serialize)]
#[serde(rename_all = "PascalCase")]
pub struct DevicesConfig {
    #[serde(skip_serializing_if = "HashMap::is_empty")]
    pub scsi: HashMap<String, ScsiController>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub virtual_smb: Option<VirtualSmbConfig>,
    #[serde(rename = "VirtualPMem", skip_serializing_if = "Option::is_none")]
    pub virtual_pmem: Option<PmemControllerConfig>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub com_ports: Option<ComPorts>,
}

#[derive(Debug, Clone, Default, Serialize)]
#[serde(rename_all = "PascalCase")]
pub struct ScsiController {
    pub attachments: HashMap<String, ScsiAttachment>,
}

#[derive(Debug, Clone, Default, Serialize)]
#[serde(rename_all = "PascalCase")]
pub struct ScsiAttachment {
    pub path: String,
    #[serde(rename = "Type")]
    pub attachment_type: String,
}

#[derive(Debug, Clone, Default, Serialize)]
#[serde(rename_all = "PascalCase")]
pub struct VirtualSmbConfig {
    #[serde(rename = "DirectFileMappingInMB", skip_serializing_if = "Option::is_none")]
    pub direct_file_mapping_in_mb: Option<u64>,
    pub shares: Vec<SmbShare>,
}

#[derive(Debug, Clone, Default, Serialize)]
#[serde(rename_all = "PascalCase")]
pub struct PmemControllerConfig {
    pub maximum_count: u32,
}

#[derive(Debug, Clone, Default, Serialize)]
#[serde(rename_all = "PascalCase")]
pub struct ComPorts {
    pub port1: String,
}

#[derive(Debug, Clone, Default, Serialize)]
#[serde(rename_all = "PascalCase")]
pub struct GuestConnection {}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn modify_request_round_trips() {
        let settings = serde_json::to_value(SmbShare {
            name: "s1".into(),
            path: r"C:\layers\base".into(),
            options: Some(SmbShareOptions {
                read_only: true,
                cache_io: true,
                ..Default::default()
            }),
        })
        .unwrap();
        let request = ModifySettingRequest::add(SHARE_RESOURCE_PATH, settings.clone());

        let encoded = serde_json::to_string(&request).unwrap();
        let decoded: ModifySettingRequest = serde_json::from_str(&encoded).unwrap();

        assert_eq!(decoded.request_type, RequestType::Add);
        assert_eq!(decoded.resource_path, SHARE_RESOURCE_PATH);
        assert_eq!(decoded.settings, Some(settings));
        assert_eq!(decoded.hosted_settings, None);
    }

    #[test]
    fn modify_request_uses_pascal_case_keys() {
        let request = ModifySettingRequest::remove(pmem_resource_path(3))
            .with_hosted_settings(serde_json::json!({"DeviceNumber": 3}));
        let encoded = serde_json::to_string(&request).unwrap();

        assert!(encoded.contains(r#""RequestType":"Remove""#));
        assert!(encoded.contains(r#""ResourcePath":"VirtualMachine/Devices/VirtualPMem/Devices/3""#));
        assert!(encoded.contains(r#""HostedSettings""#));
        assert!(!encoded.contains(r#""Settings""#));
    }

    #[test]
    fn resource_type_wire_names() {
        assert_eq!(
            serde_json::to_string(&ResourceType::VPMemDevice).unwrap(),
            r#""VPMemDevice""#
        );
        assert_eq!(
            serde_json::to_string(&ResourceType::CombinedLayers).unwrap(),
            r#""CombinedLayers""#
        );
    }

    #[test]
    fn console_resize_request_shape() {
        let request = ProcessModifyRequest::console_size(120, 40);
        let encoded = serde_json::to_string(&request).unwrap();
        assert!(encoded.contains(r#""Operation":"ConsoleSize""#));
        assert!(encoded.contains(r#""Height":40"#));
        assert!(encoded.contains(r#""Width":120"#));
        assert!(!encoded.contains("CloseHandle"));
    }

    #[test]
    fn close_stdin_request_shape() {
        let request = ProcessModifyRequest::close_handle(StdioStream::StdIn);
        let encoded = serde_json::to_string(&request).unwrap();
        assert!(encoded.contains(r#""Operation":"CloseHandle""#));
        assert!(encoded.contains(r#""Handle":"StdIn""#));
    }

    #[test]
    fn system_properties_tolerate_missing_fields() {
        let props: SystemProperties =
            serde_json::from_str(r#"{"Id":"vm-1","SystemType":"Container"}"#).unwrap();
        assert_eq!(props.id, "vm-1");
        assert_eq!(props.system_type, "Container");
        assert!(props.runtime_os_type.is_none());
        assert!(!props.stopped);
    }

    #[test]
    fn combined_layers_round_trips() {
        let layers = CombinedLayers {
            container_root_path: "/run/c1/rootfs".into(),
            layers: vec![LayerRef {
                id: "base".into(),
                path: "/layers/base".into(),
            }],
            scratch_path: "/scratch/c1".into(),
        };
        let encoded = serde_json::to_string(&layers).unwrap();
        let decoded: CombinedLayers = serde_json::from_str(&encoded).unwrap();
        assert_eq!(decoded, layers);
    }
}
