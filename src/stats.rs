//! Counters backing the control socket's introspection snapshot.
//!
//! Plain atomics-free counters: everything runs on the single event
//! loop thread, so no synchronization is needed.

use std::collections::HashMap;

use serde::Serialize;

use crate::error::CoreError;

#[derive(Debug, Clone, Default, Serialize)]
pub struct NetifCounters {
    pub frames_in: u64,
    pub frames_out: u64,
    pub dropped: u64,
}

#[derive(Debug, Clone, Default, Serialize)]
pub struct DeviceCounters {
    pub reads: u64,
    pub writes: u64,
    pub identifies: u64,
    pub merged_ops: u64,
    pub errors: HashMap<&'static str, u64>,
}

impl DeviceCounters {
    pub fn record_error(&mut self, err: &CoreError) {
        *self.errors.entry(err.counter_name()).or_insert(0) += 1;
    }
}

/// Counters for silent-drop errors that have no device to attribute to
/// (`UnknownExport`, `AclDenied`, a frame too malformed to even carry a
/// `(shelf, slot)`) — incremented by [`crate::router::Router::ingress`]
/// itself rather than by any one device.
#[derive(Debug, Clone, Default, Serialize)]
pub struct RouterCounters {
    pub errors: HashMap<&'static str, u64>,
}

impl RouterCounters {
    pub fn record_error(&mut self, err: &CoreError) {
        *self.errors.entry(err.counter_name()).or_insert(0) += 1;
    }
}

/// Full point-in-time snapshot exposed read-only over the control
/// socket.
#[derive(Debug, Clone, Default, Serialize)]
pub struct Snapshot {
    pub netifs: HashMap<String, NetifCounters>,
    pub devices: HashMap<String, DeviceCounters>,
    pub router: RouterCounters,
    pub buffer_high_water: usize,
    pub buffers_in_use: usize,
}

pub fn device_key(shelf: u16, slot: u8) -> String {
    format!("{shelf}-{slot}")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn record_error_increments_named_counter() {
        let mut counters = DeviceCounters::default();
        counters.record_error(&CoreError::WriteProtected);
        counters.record_error(&CoreError::WriteProtected);
        counters.record_error(&CoreError::UnknownExport);
        assert_eq!(counters.errors["write_protected"], 2);
        assert_eq!(counters.errors["unknown_export"], 1);
    }

    #[test]
    fn router_counters_track_silent_drops() {
        let mut counters = RouterCounters::default();
        counters.record_error(&CoreError::UnknownExport);
        counters.record_error(&CoreError::AclDenied);
        counters.record_error(&CoreError::UnknownExport);
        assert_eq!(counters.errors["unknown_export"], 2);
        assert_eq!(counters.errors["acl_denied"], 1);
    }

    #[test]
    fn snapshot_serializes_to_json() {
        let mut snap = Snapshot::default();
        snap.netifs.insert("eth0".to_string(), NetifCounters::default());
        let json = serde_json::to_string(&snap).unwrap();
        assert!(json.contains("eth0"));
    }
}
