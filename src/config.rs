//! Configuration data model and validation.
//!
//! Parsing the on-disk configuration file is explicitly out of core
//! scope — this module only defines the tables the loader
//! must produce and the validation/merge step that turns them into an
//! immutable [`RoutingTable`].

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use thiserror::Error;

use crate::acl::{AclMap, AclPolicy};

pub const MAX_QUEUE_LEN: u32 = 1024;

/// Keys shared by the defaults group and per-device overrides.
#[derive(Debug, Clone)]
pub struct Defaults {
    pub queue_length: u32,
    pub direct_io: bool,
    pub trace_io: bool,
    pub pid_file: Option<String>,
    pub control_socket: Option<String>,
    pub state_directory: String,
    pub mtu: u32,
    pub ring_buffer_size: u32,
    pub send_buffer_size: u32,
    pub receive_buffer_size: u32,
    pub tx_ring_bug: Option<bool>,
    pub max_delay: Duration,
    pub merge_delay: Duration,
    pub interfaces: Vec<String>,
}

impl Default for Defaults {
    fn default() -> Self {
        Self {
            queue_length: 32,
            direct_io: false,
            trace_io: false,
            pid_file: None,
            control_socket: None,
            state_directory: "/var/lib/aoe-target".to_string(),
            mtu: 0,
            ring_buffer_size: 128 * 1024,
            send_buffer_size: 128 * 1024,
            receive_buffer_size: 128 * 1024,
            tx_ring_bug: None,
            max_delay: Duration::from_millis(0),
            merge_delay: Duration::from_millis(0),
            interfaces: Vec::new(),
        }
    }
}

/// Per-interface override of a subset of [`Defaults`]' tunables.
#[derive(Debug, Clone, Default)]
pub struct NetifOverride {
    pub mtu: Option<u32>,
    pub ring_buffer_size: Option<u32>,
    pub send_buffer_size: Option<u32>,
    pub receive_buffer_size: Option<u32>,
}

/// A named, reusable group of MAC addresses referenced from device
/// `accept`/`deny` lists by name.
#[derive(Debug, Clone, Default)]
pub struct AclSet {
    pub name: String,
    pub members: AclMap,
}

/// Where a device reads/writes its backing bytes.
#[derive(Debug, Clone)]
pub enum BackingSpec {
    Path(String),
    Uuid(String),
}

/// One configured export, pre-validation.
#[derive(Debug, Clone)]
pub struct DeviceConfig {
    pub shelf: u16,
    pub slot: u8,
    pub backing: BackingSpec,
    pub direct_io: bool,
    pub trace_io: bool,
    pub read_only: bool,
    pub broadcast: bool,
    pub queue_length: u32,
    pub max_delay: Duration,
    pub merge_delay: Duration,
    pub accept: Option<String>,
    pub deny: Option<String>,
    pub interfaces: Vec<String>,
}

/// Every validation failure `config::validate` can report. Fatal on
/// initial load; during a reload the previous configuration is kept in
/// effect and this is only logged.
#[derive(Debug, Error, PartialEq, Eq)]
pub enum ValidationError {
    #[error("device ({shelf}, {slot}) is configured more than once")]
    DuplicateAddress { shelf: u16, slot: u8 },

    #[error("shelf {0:#06x} is reserved for broadcast")]
    ReservedShelf(u16),

    #[error("slot {0:#04x} is reserved for broadcast")]
    ReservedSlot(u8),

    #[error("queue-length {0} is out of range [1, {MAX_QUEUE_LEN}]")]
    QueueLengthOutOfRange(u32),

    #[error("max-delay {0:?} is out of range (0.0, 1.0) seconds")]
    MaxDelayOutOfRange(Duration),

    #[error("merge-delay {0:?} is out of range [0.0, 1.0) seconds")]
    MergeDelayOutOfRange(Duration),

    #[error("mtu {0} is below the minimum frame size")]
    MtuTooSmall(u32),

    #[error("device ({shelf}, {slot}) references unknown ACL set {name:?}")]
    UnknownAclSet { shelf: u16, slot: u8, name: String },
}

/// Minimum MTU: payload floor (1024) plus the common AoE header.
const MIN_MTU: u32 = 1024 + 10;

const SHELF_RESERVED: u16 = 0xffff;
const SLOT_RESERVED: u8 = 0xff;

/// Everything the loader produces for one (re)load attempt.
#[derive(Debug, Clone, Default)]
pub struct RawConfig {
    pub defaults: Defaults,
    pub netif_overrides: HashMap<String, NetifOverride>,
    pub acl_sets: HashMap<String, AclSet>,
    pub devices: Vec<DeviceConfig>,
}

/// A validated, resolved device entry ready for the router/device engine.
#[derive(Debug, Clone)]
pub struct ResolvedDevice {
    pub config: DeviceConfig,
    pub acl: AclPolicy,
}

/// Immutable post-validation routing table: built fresh on every
/// (re)load and swapped in atomically.
#[derive(Debug, Clone, Default)]
pub struct RoutingTable {
    pub defaults: Defaults,
    pub netif_overrides: HashMap<String, NetifOverride>,
    pub devices: Vec<Arc<ResolvedDevice>>,
}

impl RoutingTable {
    pub fn lookup(&self, shelf: u16, slot: u8) -> Vec<&Arc<ResolvedDevice>> {
        if shelf == SHELF_RESERVED || slot == SLOT_RESERVED {
            return self
                .devices
                .iter()
                .filter(|d| {
                    (shelf == SHELF_RESERVED || d.config.shelf == shelf)
                        && (slot == SLOT_RESERVED || d.config.slot == slot)
                })
                .collect();
        }
        self.devices
            .iter()
            .filter(|d| d.config.shelf == shelf && d.config.slot == slot)
            .collect()
    }
}

fn validate_device(dev: &DeviceConfig) -> Result<(), ValidationError> {
    if dev.shelf == SHELF_RESERVED {
        return Err(ValidationError::ReservedShelf(dev.shelf));
    }
    if dev.slot == SLOT_RESERVED {
        return Err(ValidationError::ReservedSlot(dev.slot));
    }
    if dev.queue_length == 0 || dev.queue_length > MAX_QUEUE_LEN {
        return Err(ValidationError::QueueLengthOutOfRange(dev.queue_length));
    }
    if dev.max_delay.as_secs_f64() <= 0.0 || dev.max_delay.as_secs_f64() >= 1.0 {
        return Err(ValidationError::MaxDelayOutOfRange(dev.max_delay));
    }
    if dev.merge_delay.as_secs_f64() < 0.0 || dev.merge_delay.as_secs_f64() >= 1.0 {
        return Err(ValidationError::MergeDelayOutOfRange(dev.merge_delay));
    }
    Ok(())
}

/// Validate a raw loaded configuration and build the immutable
/// [`RoutingTable`] the router swaps in. Rejects duplicate `(shelf,
/// slot)` pairs, reserved broadcast addresses, and out-of-range
/// tunables.
pub fn validate(raw: RawConfig) -> Result<RoutingTable, ValidationError> {
    if raw.defaults.mtu != 0 && raw.defaults.mtu < MIN_MTU {
        return Err(ValidationError::MtuTooSmall(raw.defaults.mtu));
    }

    let mut seen: Vec<(u16, u8)> = Vec::with_capacity(raw.devices.len());
    let mut resolved = Vec::with_capacity(raw.devices.len());

    for dev in raw.devices {
        validate_device(&dev)?;

        let key = (dev.shelf, dev.slot);
        if seen.contains(&key) {
            return Err(ValidationError::DuplicateAddress {
                shelf: dev.shelf,
                slot: dev.slot,
            });
        }
        seen.push(key);

        let mut acl = AclPolicy::default();
        if let Some(name) = &dev.accept {
            let set = raw.acl_sets.get(name).ok_or_else(|| ValidationError::UnknownAclSet {
                shelf: dev.shelf,
                slot: dev.slot,
                name: name.clone(),
            })?;
            acl.accept = Some(set.members.clone());
        }
        if let Some(name) = &dev.deny {
            let set = raw.acl_sets.get(name).ok_or_else(|| ValidationError::UnknownAclSet {
                shelf: dev.shelf,
                slot: dev.slot,
                name: name.clone(),
            })?;
            acl.deny = Some(set.members.clone());
        }

        resolved.push(Arc::new(ResolvedDevice { config: dev, acl }));
    }

    Ok(RoutingTable {
        defaults: raw.defaults,
        netif_overrides: raw.netif_overrides,
        devices: resolved,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::acl::MacAddr;

    fn device(shelf: u16, slot: u8) -> DeviceConfig {
        DeviceConfig {
            shelf,
            slot,
            backing: BackingSpec::Path("/dev/null".to_string()),
            direct_io: false,
            trace_io: false,
            read_only: false,
            broadcast: false,
            queue_length: 32,
            max_delay: Duration::from_millis(10),
            merge_delay: Duration::from_millis(1),
            accept: None,
            deny: None,
            interfaces: Vec::new(),
        }
    }

    #[test]
    fn duplicate_shelf_slot_rejected() {
        let raw = RawConfig {
            devices: vec![device(1, 2), device(1, 2)],
            ..Default::default()
        };
        assert_eq!(
            validate(raw).unwrap_err(),
            ValidationError::DuplicateAddress { shelf: 1, slot: 2 }
        );
    }

    #[test]
    fn distinct_slots_on_same_shelf_are_fine() {
        let raw = RawConfig {
            devices: vec![device(1, 2), device(1, 3)],
            ..Default::default()
        };
        assert!(validate(raw).is_ok());
    }

    #[test]
    fn reserved_broadcast_addresses_rejected() {
        let raw = RawConfig {
            devices: vec![device(0xffff, 1)],
            ..Default::default()
        };
        assert!(matches!(
            validate(raw).unwrap_err(),
            ValidationError::ReservedShelf(0xffff)
        ));

        let raw = RawConfig {
            devices: vec![device(1, 0xff)],
            ..Default::default()
        };
        assert!(matches!(
            validate(raw).unwrap_err(),
            ValidationError::ReservedSlot(0xff)
        ));
    }

    #[test]
    fn queue_length_out_of_range_rejected() {
        let mut dev = device(1, 2);
        dev.queue_length = 0;
        let raw = RawConfig {
            devices: vec![dev],
            ..Default::default()
        };
        assert!(matches!(
            validate(raw).unwrap_err(),
            ValidationError::QueueLengthOutOfRange(0)
        ));
    }

    #[test]
    fn unknown_acl_set_reference_rejected() {
        let mut dev = device(1, 2);
        dev.accept = Some("trusted".to_string());
        let raw = RawConfig {
            devices: vec![dev],
            ..Default::default()
        };
        assert!(matches!(
            validate(raw).unwrap_err(),
            ValidationError::UnknownAclSet { .. }
        ));
    }

    #[test]
    fn routing_table_resolves_acl_from_named_set() {
        let mut members = AclMap::new();
        members.add(MacAddr([1, 2, 3, 4, 5, 6])).unwrap();
        let mut acl_sets = HashMap::new();
        acl_sets.insert(
            "trusted".to_string(),
            AclSet {
                name: "trusted".to_string(),
                members,
            },
        );
        let mut dev = device(1, 2);
        dev.accept = Some("trusted".to_string());
        let raw = RawConfig {
            devices: vec![dev],
            acl_sets,
            ..Default::default()
        };
        let table = validate(raw).unwrap();
        let found = table.lookup(1, 2);
        assert_eq!(found.len(), 1);
        assert!(found[0].acl.admits(MacAddr([1, 2, 3, 4, 5, 6])));
        assert!(!found[0].acl.admits(MacAddr([9, 9, 9, 9, 9, 9])));
    }

    #[test]
    fn broadcast_lookup_matches_all_devices_on_shelf_or_slot() {
        let raw = RawConfig {
            devices: vec![device(1, 2), device(1, 3), device(2, 2)],
            ..Default::default()
        };
        let table = validate(raw).unwrap();
        assert_eq!(table.lookup(0xffff, 0xff).len(), 3);
        assert_eq!(table.lookup(1, 0xff).len(), 2);
        assert_eq!(table.lookup(0xffff, 2).len(), 2);
    }
}
