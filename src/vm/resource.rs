//! Ref-counted resource attachment ledger.
//!
//! The ledger shape is identical for every attachable resource kind: a map
//! from host-side path to an allocated guest-visible identity plus a
//! reference count. Kind-specific behavior (identity allocation, request
//! documents, guest paths) hangs off [`ResourceKind`] so the ref-counting
//! logic is written once.

use std::collections::HashMap;
use std::fmt;

use crate::schema::ModifySettingRequest;

pub(crate) trait ResourceKind {
    /// Guest-visible identity of one attachment: a share name, a device
    /// slot, a controller location.
    type Identity: Clone + fmt::Debug;

    /// Caller-supplied, kind-specific attachment metadata.
    type Settings;

    const ADD_OP: &'static str;
    const REMOVE_OP: &'static str;

    /// Reserves the next free identity for `host_path`, or `None` when the
    /// kind's identity space is exhausted.
    fn allocate(&mut self, host_path: &str) -> Option<Self::Identity>;

    /// Returns a reserved identity to the free pool.
    fn release(&mut self, identity: &Self::Identity);

    /// The guest-visible path of an attachment. Stable for its lifetime.
    fn guest_path(&self, identity: &Self::Identity, settings: &Self::Settings) -> String;

    fn add_request(
        &self,
        identity: &Self::Identity,
        host_path: &str,
        guest_path: &str,
        settings: &Self::Settings,
    ) -> Result<ModifySettingRequest, serde_json::Error>;

    fn remove_request(
        &self,
        identity: &Self::Identity,
        guest_path: &str,
        settings: &Self::Settings,
    ) -> Result<ModifySettingRequest, serde_json::Error>;
}

/// One live attachment. `ref_count` is always at least 1; the entry is
/// removed from the ledger when the count would reach 0.
pub(crate) struct Attachment<K: ResourceKind> {
    pub identity: K::Identity,
    pub ref_count: u32,
    pub guest_path: String,
    pub settings: K::Settings,
}

pub(crate) struct Ledger<K: ResourceKind> {
    pub kind: K,
    pub entries: HashMap<String, Attachment<K>>,
}

impl<K: ResourceKind> Ledger<K> {
    pub fn new(kind: K) -> Self {
        Self {
            kind,
            entries: HashMap::new(),
        }
    }

    pub fn get(&self, host_path: &str) -> Option<&Attachment<K>> {
        self.entries.get(host_path)
    }
}
