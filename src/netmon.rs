//! Reference netif monitor: polls `/sys/class/net` on a timer and
//! synthesizes up/down events, filtered against the configured
//! interface glob patterns.
//!
//! A production deployment would subscribe to an `rtnetlink` socket
//! instead; this poll-based stand-in satisfies the same event contract
//! without the extra dependency.

use std::collections::HashMap;
use std::fs;
use std::path::Path;

use crate::router::match_patternlist;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum NetifEvent {
    Up { name: String, mac: [u8; 6], mtu: u32, index: u32 },
    Down { name: String },
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
struct InterfaceState {
    up: bool,
    mac: [u8; 6],
    mtu: u32,
    index: u32,
}

/// Polls `/sys/class/net` each time [`NetMonitor::poll`] is called and
/// diffs against the previously observed state, so an interface that
/// comes up after the daemon starts is still noticed, rather than
/// requiring every interface to exist at startup.
pub struct NetMonitor {
    sys_class_net: std::path::PathBuf,
    patterns: Vec<String>,
    last: HashMap<String, InterfaceState>,
}

impl NetMonitor {
    pub fn new(patterns: Vec<String>) -> Self {
        Self::with_root(Path::new("/sys/class/net"), patterns)
    }

    /// Takes an explicit `/sys/class/net`-shaped root, so tests can
    /// point it at a `tempfile::tempdir` fixture instead of the real
    /// filesystem.
    pub fn with_root(sys_class_net: &Path, patterns: Vec<String>) -> Self {
        Self {
            sys_class_net: sys_class_net.to_path_buf(),
            patterns,
            last: HashMap::new(),
        }
    }

    /// Rescans every interface directory and returns the events for
    /// whatever changed since the last call, restricted to interfaces
    /// matching the configured patterns (an absent/empty pattern list
    /// admits everything, per `match_patternlist`'s contract).
    pub fn poll(&mut self) -> Vec<NetifEvent> {
        let mut seen = HashMap::new();
        let mut events = Vec::new();

        let Ok(entries) = fs::read_dir(&self.sys_class_net) else {
            return events;
        };

        for entry in entries.flatten() {
            let name = entry.file_name().to_string_lossy().into_owned();
            if !match_patternlist(&self.patterns, &name) {
                continue;
            }
            let Some(state) = read_interface(&entry.path()) else {
                continue;
            };
            seen.insert(name.clone(), state.clone());

            match self.last.get(&name) {
                Some(prev) if prev.up == state.up => {}
                _ if state.up => events.push(NetifEvent::Up {
                    name: name.clone(),
                    mac: state.mac,
                    mtu: state.mtu,
                    index: state.index,
                }),
                _ => events.push(NetifEvent::Down { name: name.clone() }),
            }
        }

        for name in self.last.keys() {
            if !seen.contains_key(name) {
                events.push(NetifEvent::Down { name: name.clone() });
            }
        }

        self.last = seen;
        events
    }
}

fn read_interface(dir: &Path) -> Option<InterfaceState> {
    let operstate = fs::read_to_string(dir.join("operstate")).ok()?;
    let up = operstate.trim() == "up";

    let mac = fs::read_to_string(dir.join("address")).ok()?;
    let mac = parse_mac(mac.trim())?;

    let mtu: u32 = fs::read_to_string(dir.join("mtu"))
        .ok()
        .and_then(|s| s.trim().parse().ok())
        .unwrap_or(0);
    let index: u32 = fs::read_to_string(dir.join("ifindex"))
        .ok()
        .and_then(|s| s.trim().parse().ok())
        .unwrap_or(0);

    Some(InterfaceState { up, mac, mtu, index })
}

fn parse_mac(s: &str) -> Option<[u8; 6]> {
    let mut out = [0u8; 6];
    let mut parts = s.split(':');
    for slot in &mut out {
        *slot = u8::from_str_radix(parts.next()?, 16).ok()?;
    }
    if parts.next().is_some() {
        return None;
    }
    Some(out)
}
