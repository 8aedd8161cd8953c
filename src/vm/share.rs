//! File-sharing mounts (virtual SMB shares), Windows guests only.
//!
//! Shares are ref-counted per host path: the first add allocates a short
//! guest-visible name and issues the host-level add, later adds for the same
//! path only bump the count.

use serde_json::Value;

use crate::error::Result;
use crate::schema::{ModifySettingRequest, SmbShare, SmbShareOptions, SHARE_RESOURCE_PATH};
use crate::vm::resource::ResourceKind;
use crate::vm::VirtualMachine;

/// Well-known prefix under which the guest sees virtual SMB shares.
pub const SHARE_GUEST_PREFIX: &str = r"\\?\VMSMB\VSMB-{dcc079ae-60ba-4d07-847c-3493609c0870}\";

pub(crate) struct ShareSettings {
    pub options: SmbShareOptions,
    /// Guest-directed metadata retained for callers composing guest-side
    /// mount requests; not part of the host-level add.
    #[allow(dead_code)]
    pub guest_request: Option<Value>,
}

#[derive(Default)]
pub(crate) struct ShareKind {
    counter: u64,
}

impl ResourceKind for ShareKind {
    type Identity = String;
    type Settings = ShareSettings;

    const ADD_OP: &'static str = "AddShare";
    const REMOVE_OP: &'static str = "RemoveShare";

    fn allocate(&mut self, _host_path: &str) -> Option<String> {
        self.counter += 1;
        Some(format!("s{:x}", self.counter))
    }

    fn release(&mut self, _identity: &String) {
        // Names are never reused; the counter only moves forward.
    }

    fn guest_path(&self, identity: &String, _settings: &ShareSettings) -> String {
        format!("{SHARE_GUEST_PREFIX}{identity}")
    }

    fn add_request(
        &self,
        identity: &String,
        host_path: &str,
        _guest_path: &str,
        settings: &ShareSettings,
    ) -> std::result::Result<ModifySettingRequest, serde_json::Error> {
        let share = SmbShare {
            name: identity.clone(),
            path: host_path.to_string(),
            options: Some(settings.options),
        };
        Ok(ModifySettingRequest::add(
            SHARE_RESOURCE_PATH,
            serde_json::to_value(share)?,
        ))
    }

    fn remove_request(
        &self,
        identity: &String,
        _guest_path: &str,
        _settings: &ShareSettings,
    ) -> std::result::Result<ModifySettingRequest, serde_json::Error> {
        let share = SmbShare {
            name: identity.clone(),
            ..Default::default()
        };
        Ok(ModifySettingRequest::remove(SHARE_RESOURCE_PATH).with_settings(serde_json::to_value(share)?))
    }
}

impl VirtualMachine {
    /// Adds a file share to the compute system, or bumps its reference count
    /// if `host_path` is already attached. Returns the guest path.
    pub async fn add_share(
        &self,
        host_path: &str,
        options: SmbShareOptions,
        guest_request: Option<Value>,
    ) -> Result<String> {
        self.ensure_os(ShareKind::ADD_OP, "windows")?;
        let (_, guest_path) = self
            .attach(
                &self.shares,
                host_path,
                ShareSettings {
                    options,
                    guest_request,
                },
            )
            .await?;
        Ok(guest_path)
    }

    /// Drops one reference to a share; the host-level remove happens only
    /// when the last reference goes away. Removing an unattached path is an
    /// error.
    pub async fn remove_share(&self, host_path: &str) -> Result<()> {
        self.ensure_os(ShareKind::REMOVE_OP, "windows")?;
        self.detach(&self.shares, host_path).await
    }

    /// The guest path of an attached share. Pure lookup; never allocates.
    pub async fn share_guest_path(&self, host_path: &str) -> Result<String> {
        let shares = self.shares.lock().await;
        shares
            .get(host_path)
            .map(|attachment| attachment.guest_path.clone())
            .ok_or_else(|| self.not_attached(host_path))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn names_are_short_hex_tokens() {
        let mut kind = ShareKind::default();
        assert_eq!(kind.allocate("a").unwrap(), "s1");
        for _ in 0..14 {
            kind.allocate("x");
        }
        assert_eq!(kind.allocate("b").unwrap(), "s10");
    }

    #[test]
    fn add_request_targets_the_share_resource_path() {
        let mut kind = ShareKind::default();
        let name = kind.allocate(r"C:\layers\base").unwrap();
        let settings = ShareSettings {
            options: SmbShareOptions {
                read_only: true,
                ..Default::default()
            },
            guest_request: None,
        };
        let request = kind
            .add_request(&name, r"C:\layers\base", "", &settings)
            .unwrap();

        assert_eq!(request.resource_path, SHARE_RESOURCE_PATH);
        let encoded = serde_json::to_string(&request).unwrap();
        assert!(encoded.contains(r#""Name":"s1""#));
        assert!(encoded.contains(r#""ReadOnly":true"#));
    }

    #[test]
    fn guest_path_uses_the_well_known_prefix() {
        let kind = ShareKind::default();
        let settings = ShareSettings {
            options: SmbShareOptions::default(),
            guest_request: None,
        };
        let path = kind.guest_path(&"s2".to_string(), &settings);
        assert!(path.starts_with(SHARE_GUEST_PREFIX));
        assert!(path.ends_with("s2"));
    }
}
