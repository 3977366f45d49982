//! Stateless-on-the-hot-path dispatcher: binds inbound frames to the
//! device addressed by `(shelf, slot)`, enforces ACLs and the
//! per-device interface allow-list, and forwards completions back to
//! their origin interface.

use std::sync::Arc;

use crate::acl::MacAddr;
use crate::buffer::{BufferPool, PacketBuffer};
use crate::codec::AoeHeader;
use crate::config::ResolvedDevice;
use crate::device::aio::BlockIo;
use crate::device::{self, Device, OutboundReply};
use crate::error::{CoreError, ErrorPolicy};
use crate::stats::RouterCounters;

/// One configured export paired with the runtime device engine that
/// serves it. `config` carries the ACL/interface-pattern admission
/// data (immutable between reloads); `device` carries
/// the mutable in-flight/deferred state.
pub struct RoutedDevice<Io: BlockIo> {
    pub config: Arc<ResolvedDevice>,
    pub device: Device<Io>,
}

pub struct Router<Io: BlockIo> {
    devices: Vec<RoutedDevice<Io>>,
    stats: RouterCounters,
}

impl<Io: BlockIo> Router<Io> {
    pub fn new(devices: Vec<RoutedDevice<Io>>) -> Self {
        Self {
            devices,
            stats: RouterCounters::default(),
        }
    }

    pub fn devices_mut(&mut self) -> impl Iterator<Item = &mut RoutedDevice<Io>> {
        self.devices.iter_mut()
    }

    pub fn devices(&self) -> &[RoutedDevice<Io>] {
        &self.devices
    }

    /// Silent-drop counters for errors this router rejected before any
    /// device saw the frame (`UnknownExport`, `AclDenied`,
    /// `MalformedFrame`) — per-device errors are attributed to the
    /// device's own counters instead.
    pub fn stats(&self) -> &RouterCounters {
        &self.stats
    }

    /// Handles one inbound frame arriving on `netif_id`/`netif_name`
    /// from `mac`. Returns the replies ready right now (possibly
    /// several, for a broadcast identify); deferred reads/writes
    /// produce their replies later via [`Router::poll_completions`].
    ///
    /// `Err` is only ever a silent-drop-policy [`CoreError`]
    /// (`MalformedFrame`, `UnknownExport`, `AclDenied`,
    /// `ExhaustedBuffers`) — the caller bumps the matching counter and
    /// emits nothing.
    pub fn ingress(
        &mut self,
        netif_id: usize,
        netif_name: &str,
        mac: MacAddr,
        frame: &PacketBuffer,
        pool: &mut BufferPool,
    ) -> Result<Vec<OutboundReply>, CoreError> {
        let (header, _) = match AoeHeader::parse(frame.as_slice()) {
            Ok(parsed) => parsed,
            Err(e) => {
                self.stats.record_error(&e);
                return Err(e);
            }
        };
        if header.is_response {
            self.stats.record_error(&CoreError::MalformedFrame);
            return Err(CoreError::MalformedFrame);
        }

        let broadcast_shelf = header.is_broadcast_shelf();
        let broadcast_slot = header.is_broadcast_slot();
        let is_broadcast = broadcast_shelf || broadcast_slot;

        let matched: Vec<usize> = self
            .devices
            .iter()
            .enumerate()
            .filter(|(_, d)| {
                (broadcast_shelf || d.config.config.shelf == header.shelf)
                    && (broadcast_slot || d.config.config.slot == header.slot)
            })
            .map(|(idx, _)| idx)
            .collect();

        if matched.is_empty() {
            self.stats.record_error(&CoreError::UnknownExport);
            return Err(CoreError::UnknownExport);
        }

        let mut replies = Vec::new();
        let mut admitted_any = false;

        for idx in matched {
            let routed = &self.devices[idx];
            if !routed.config.acl.admits(mac) {
                continue;
            }
            if !match_patternlist(&routed.config.config.interfaces, netif_name) {
                continue;
            }
            admitted_any = true;

            let routed = &mut self.devices[idx];
            match routed.device.dispatch(netif_id, mac, header, frame, pool) {
                Ok(mut r) => replies.append(&mut r),
                Err(e) => {
                    if let ErrorPolicy::Reply(code) = e.policy() {
                        if let Ok(frame) = device::build_error_reply(pool, &header, code) {
                            replies.push(OutboundReply { netif_id, frame });
                        }
                    }
                    // SilentDrop-policy errors from a per-device dispatch
                    // (malformed command payload, exhausted buffers) are
                    // dropped for that device only; a broadcast identify
                    // still gets replies from the other matched devices.
                }
            }
        }

        if !is_broadcast && !admitted_any {
            self.stats.record_error(&CoreError::AclDenied);
            return Err(CoreError::AclDenied);
        }

        Ok(replies)
    }

    /// Drains I/O completions for every device, in round-robin order —
    /// called once per event-loop tick alongside [`Router::flush_deferred`].
    pub fn poll_completions(&mut self, pool: &mut BufferPool) -> Vec<OutboundReply> {
        let mut replies = Vec::new();
        for routed in &mut self.devices {
            replies.append(&mut routed.device.poll_completions(pool));
        }
        replies
    }

    /// Promotes deferred I/O for every device whose merge window or
    /// queue-depth slot allows it.
    pub fn flush_deferred(&mut self, now: std::time::Instant, pool: &mut BufferPool) {
        for routed in &mut self.devices {
            routed.device.flush_deferred(now, pool);
        }
    }

    /// The soonest instant any device needs a wake-up to flush a
    /// pending merge window.
    pub fn next_deadline(&self) -> Option<std::time::Instant> {
        self.devices
            .iter()
            .filter_map(|r| r.device.next_deadline())
            .min()
    }
}

/// Glob-style interface allow-list match: an absent/empty list admits
/// everything; otherwise `name` must match at least one pattern.
/// Supports `*` (any run of characters) and `?` (any one character).
pub fn match_patternlist(patterns: &[String], name: &str) -> bool {
    if patterns.is_empty() {
        return true;
    }
    patterns.iter().any(|p| glob_match(p, name))
}

fn glob_match(pattern: &str, text: &str) -> bool {
    let p: Vec<char> = pattern.chars().collect();
    let t: Vec<char> = text.chars().collect();
    glob_match_inner(&p, &t)
}

fn glob_match_inner(p: &[char], t: &[char]) -> bool {
    match p.split_first() {
        None => t.is_empty(),
        Some(('*', rest)) => {
            glob_match_inner(rest, t) || (!t.is_empty() && glob_match_inner(p, &t[1..]))
        }
        Some(('?', rest)) => !t.is_empty() && glob_match_inner(rest, &t[1..]),
        Some((c, rest)) => t.first() == Some(c) && glob_match_inner(rest, &t[1..]),
    }
}
