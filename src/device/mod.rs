//! Per-export device engine: command synthesis (identify/config/mask),
//! async read/write submission, in-flight tracking, deferred-queue
//! draining and adjacent-sector merging.
//!
//! One [`Device`] owns exactly one backing store and one
//! [`aio::BlockIo`] context. The device
//! never blocks: [`Device::dispatch`] either returns a synthesized
//! reply immediately, enqueues an I/O, or returns an error the caller
//! turns into a reply using [`crate::error::CoreError::policy`].

pub mod aio;
pub mod queue;

use std::time::Instant;

use crate::acl::{AclMap, MacAddr};
use crate::buffer::{BufferPool, ExhaustedMemory, PacketBuffer};
use crate::codec::{
    AoeCommand, AoeErrorCode, AoeHeader, AtaHeader, AtaOp, MaskHeader, QueryConfigHeader,
    CCMD_READ, CCMD_SET, CCMD_TEST, CCMD_TEST_PREFIX, COMMON_HEADER_LEN,
};
use crate::error::CoreError;
use crate::stats::DeviceCounters;

use aio::{BlockIo, Completion};
use queue::{DeferredOp, DeviceQueue, InFlightOp, Promoted};

/// A fully built reply frame and the interface it must go out on —
/// the reverse-path record handed back to the router.
pub struct OutboundReply {
    pub netif_id: usize,
    pub frame: PacketBuffer,
}

/// Static identity and per-device tunables the device engine needs at
/// run time (the subset of [`crate::config::DeviceConfig`] it reads).
pub struct DeviceIdentity {
    pub shelf: u16,
    pub slot: u8,
    pub name: String,
    pub read_only: bool,
    pub broadcast: bool,
}

const IDENTIFY_LEN: usize = 512;
const SECTOR_SIZE: u64 = 512;

pub struct Device<Io: BlockIo> {
    identity: DeviceIdentity,
    io: Io,
    queue: DeviceQueue,
    backing_sectors: u64,
    config_blob: Vec<u8>,
    state_directory: String,
    accept: Option<AclMap>,
    deny: Option<AclMap>,
    identify_data: Vec<u8>,
    pub stats: DeviceCounters,
}

impl<Io: BlockIo> Device<Io> {
    pub fn new(
        identity: DeviceIdentity,
        io: Io,
        queue_depth: u32,
        merge_delay: std::time::Duration,
        mtu_payload_cap: usize,
        backing_sectors: u64,
        state_directory: String,
        accept: Option<AclMap>,
        deny: Option<AclMap>,
    ) -> Result<Self, crate::state::StateError> {
        let config_blob =
            crate::state::load(&state_directory, identity.shelf, identity.slot)?.unwrap_or_default();
        let identify_data = build_identify_data(&identity.name, backing_sectors);
        Ok(Self {
            identity,
            io,
            queue: DeviceQueue::new(queue_depth, merge_delay, mtu_payload_cap),
            backing_sectors,
            config_blob,
            state_directory,
            accept,
            deny,
            identify_data,
            stats: DeviceCounters::default(),
        })
    }

    pub fn shelf(&self) -> u16 {
        self.identity.shelf
    }

    pub fn slot(&self) -> u8 {
        self.identity.slot
    }

    pub fn broadcast(&self) -> bool {
        self.identity.broadcast
    }

    pub fn in_flight_len(&self) -> usize {
        self.queue.in_flight_len()
    }

    pub fn deferred_len(&self) -> usize {
        self.queue.deferred_len()
    }

    /// The fd the event loop registers for I/O completion readiness.
    pub fn completion_fd(&self) -> std::os::unix::io::RawFd {
        self.io.completion_fd()
    }

    /// Handles one inbound AoE frame addressed to this device. Never
    /// blocks. Returns the (possibly empty) set of replies ready right
    /// now; a deferred read/write returns an empty vec and its reply
    /// arrives later from [`Device::poll_completions`].
    pub fn dispatch(
        &mut self,
        netif_id: usize,
        mac: MacAddr,
        header: AoeHeader,
        frame: &PacketBuffer,
        pool: &mut BufferPool,
    ) -> Result<Vec<OutboundReply>, CoreError> {
        let payload = &frame.as_slice()[COMMON_HEADER_LEN..];
        match header.command {
            AoeCommand::AtaCommand => self.dispatch_ata(netif_id, mac, header, payload, pool),
            AoeCommand::QueryConfig => self.dispatch_query_config(netif_id, header, payload, pool),
            AoeCommand::MaskCmd => self.dispatch_mask(netif_id, header, payload, pool),
        }
    }

    fn dispatch_ata(
        &mut self,
        netif_id: usize,
        mac: MacAddr,
        header: AoeHeader,
        payload: &[u8],
        pool: &mut BufferPool,
    ) -> Result<Vec<OutboundReply>, CoreError> {
        let ata = AtaHeader::parse(payload)?;
        match ata.op() {
            AtaOp::Identify => {
                self.stats.identifies += 1;
                let buf = build_ata_reply(pool, &header, &ata, 0, &self.identify_data)?;
                Ok(vec![OutboundReply { netif_id, frame: buf }])
            }
            AtaOp::Unsupported(_) => {
                let buf = build_error_reply(pool, &header, AoeErrorCode::UnrecognizedCommand)?;
                Ok(vec![OutboundReply { netif_id, frame: buf }])
            }
            op @ (AtaOp::Read | AtaOp::Write) => {
                let write = op == AtaOp::Write;
                if write && self.identity.read_only {
                    self.stats.record_error(&CoreError::WriteProtected);
                    let buf = build_error_reply(pool, &header, AoeErrorCode::WriteProtected)?;
                    return Ok(vec![OutboundReply { netif_id, frame: buf }]);
                }
                let data = &payload[AtaHeader::LEN..];
                let want = ata.sector_count as usize * SECTOR_SIZE as usize;
                let deferred = DeferredOp {
                    tag: header.tag,
                    netif_id,
                    mac,
                    write,
                    lba: ata.lba,
                    sector_count: u32::from(ata.sector_count),
                    payload: if write {
                        data.get(..want).ok_or(CoreError::MalformedFrame)?.to_vec()
                    } else {
                        Vec::new()
                    },
                    queued_at: Instant::now(),
                };
                self.queue.push_deferred(deferred);
                Ok(Vec::new())
            }
        }
    }

    fn dispatch_query_config(
        &mut self,
        netif_id: usize,
        header: AoeHeader,
        payload: &[u8],
        pool: &mut BufferPool,
    ) -> Result<Vec<OutboundReply>, CoreError> {
        let (qc, config) = QueryConfigHeader::parse(payload)?;
        match qc.ccmd {
            CCMD_SET => {
                self.config_blob = config.to_vec();
                crate::state::store(
                    &self.state_directory,
                    self.identity.shelf,
                    self.identity.slot,
                    &self.config_blob,
                )
                .map_err(|_| CoreError::BackingUnavailable)?;
            }
            CCMD_READ | CCMD_TEST | CCMD_TEST_PREFIX => {}
            _ => {
                let buf = build_error_reply(pool, &header, AoeErrorCode::BadArgument)?;
                return Ok(vec![OutboundReply { netif_id, frame: buf }]);
            }
        }

        let mut out = Vec::with_capacity(COMMON_HEADER_LEN + QueryConfigHeader::LEN + self.config_blob.len());
        header.write_reply(&mut out, 0);
        let reply_hdr = QueryConfigHeader {
            buffer_count: 1,
            firmware_version: 1,
            sector_count: 0,
            ccmd: qc.ccmd,
            config_len: self.config_blob.len() as u16,
        };
        reply_hdr.write(&mut out, &self.config_blob);
        Ok(vec![OutboundReply {
            netif_id,
            frame: frame_from_bytes(pool, &out)?,
        }])
    }

    /// Read-only introspection only: enumerates the configured ACL
    /// entries but never mutates them over the wire.
    fn dispatch_mask(
        &mut self,
        netif_id: usize,
        header: AoeHeader,
        payload: &[u8],
        pool: &mut BufferPool,
    ) -> Result<Vec<OutboundReply>, CoreError> {
        let mask = MaskHeader::parse(payload)?;
        let entries: Vec<MacAddr> = self
            .accept
            .iter()
            .flat_map(|acl| acl.iter())
            .chain(self.deny.iter().flat_map(|acl| acl.iter()))
            .collect();

        let mut out = Vec::with_capacity(COMMON_HEADER_LEN + MaskHeader::LEN + entries.len() * 6);
        header.write_reply(&mut out, 0);
        let reply_hdr = MaskHeader {
            merror: 0,
            mcmd: mask.mcmd,
            mflag: mask.mflag,
            entry_count: entries.len() as u16,
        };
        reply_hdr.write(&mut out, &entries);
        Ok(vec![OutboundReply {
            netif_id,
            frame: frame_from_bytes(pool, &out)?,
        }])
    }

    /// Promotes as many deferred ops as the in-flight set and merge
    /// window allow. Call once per event-loop tick.
    pub fn flush_deferred(&mut self, now: Instant, pool: &mut BufferPool) {
        while let Some(promoted) = self.queue.promote_ready(now) {
            let cookie = self.queue.alloc_cookie();
            match promoted {
                Promoted::Single(op) => self.submit_one(cookie, op, pool),
                Promoted::Merged(a, b) => self.submit_merged(cookie, a, b, pool),
            }
        }
    }

    fn submit_one(&mut self, cookie: u64, op: DeferredOp, pool: &mut BufferPool) {
        let write = op.write;
        let len = op.sector_count as usize * SECTOR_SIZE as usize;
        let offset = op.lba * SECTOR_SIZE;
        let buf = match self.acquire_io_buffer(pool, len, write, &op.payload) {
            Ok(buf) => buf,
            Err(_) => {
                // dropped: ExhaustedBuffers, request silently lost
                self.stats.record_error(&CoreError::ExhaustedBuffers);
                return;
            }
        };
        let result = if write {
            self.io.submit_write(cookie, offset, buf)
        } else {
            self.io.submit_read(cookie, offset, buf)
        };
        if result.is_ok() {
            self.queue.record_in_flight(
                cookie,
                InFlightOp {
                    requests: smallvec::smallvec![op],
                    write,
                },
            );
        }
    }

    fn submit_merged(&mut self, cookie: u64, a: DeferredOp, b: DeferredOp, pool: &mut BufferPool) {
        let write = a.write;
        let total_sectors = a.sector_count + b.sector_count;
        let len = total_sectors as usize * SECTOR_SIZE as usize;
        let offset = a.lba * SECTOR_SIZE;
        let combined_payload = if write {
            let mut combined = a.payload.clone();
            combined.extend_from_slice(&b.payload);
            combined
        } else {
            Vec::new()
        };
        let buf = match self.acquire_io_buffer(pool, len, write, &combined_payload) {
            Ok(buf) => buf,
            Err(_) => {
                self.stats.record_error(&CoreError::ExhaustedBuffers);
                return;
            }
        };
        let result = if write {
            self.io.submit_write(cookie, offset, buf)
        } else {
            self.io.submit_read(cookie, offset, buf)
        };
        if result.is_ok() {
            self.stats.merged_ops += 1;
            self.queue.record_in_flight(
                cookie,
                InFlightOp {
                    requests: smallvec::smallvec![a, b],
                    write,
                },
            );
        }
    }

    fn acquire_io_buffer(
        &self,
        pool: &mut BufferPool,
        len: usize,
        write: bool,
        payload: &[u8],
    ) -> Result<PacketBuffer, ExhaustedMemory> {
        let mut buf = pool.acquire()?;
        if write {
            buf.raw_mut()[..payload.len()].copy_from_slice(payload);
            buf.set_len(payload.len());
        } else {
            buf.set_len(len.min(buf.capacity()));
        }
        Ok(buf)
    }

    /// Drains whatever I/O completions are ready and turns each into
    /// one reply per original request (two for a merged op). Call once
    /// per event-loop tick, after [`Device::flush_deferred`].
    pub fn poll_completions(&mut self, pool: &mut BufferPool) -> Vec<OutboundReply> {
        let completions = self.io.poll_completions();
        let mut replies = Vec::with_capacity(completions.len());
        for Completion { cookie, buf, result } in completions {
            let Some(in_flight) = self.queue.take_in_flight(cookie) else {
                continue;
            };
            match result {
                Ok(_) => {
                    if in_flight.write {
                        self.stats.writes += in_flight.requests.len() as u64;
                    } else {
                        self.stats.reads += in_flight.requests.len() as u64;
                    }
                    self.build_success_replies(&in_flight, &buf, pool, &mut replies);
                }
                Err(_) => {
                    self.stats.record_error(&CoreError::IoFailed(io_error_placeholder()));
                    self.build_error_replies(&in_flight, AoeErrorCode::DeviceFault, pool, &mut replies);
                }
            }
            // `buf` was the I/O buffer submitted for this cookie; its
            // contents are already copied into the reply frame(s) above.
            pool.release(buf);
        }
        replies
    }

    fn build_success_replies(
        &self,
        in_flight: &InFlightOp,
        buf: &PacketBuffer,
        pool: &mut BufferPool,
        replies: &mut Vec<OutboundReply>,
    ) {
        let mut sector_offset = 0u32;
        for req in &in_flight.requests {
            let header = AoeHeader {
                shelf: self.identity.shelf,
                slot: self.identity.slot,
                command: AoeCommand::AtaCommand,
                tag: req.tag,
                is_response: true,
                error: 0,
            };
            let ata = AtaHeader {
                aflags: if req.write { 0x01 } else { 0x00 },
                err_feature: 0,
                sector_count: req.sector_count as u8,
                cmd_status: 0,
                lba: req.lba,
            };
            let data = if in_flight.write {
                &[][..]
            } else {
                let start = sector_offset as usize * SECTOR_SIZE as usize;
                let end = start + req.sector_count as usize * SECTOR_SIZE as usize;
                let slice = buf.as_slice();
                &slice[start.min(slice.len())..end.min(slice.len())]
            };
            if let Ok(frame) = build_ata_reply(pool, &header, &ata, 0, data) {
                replies.push(OutboundReply {
                    netif_id: req.netif_id,
                    frame,
                });
            }
            sector_offset += req.sector_count;
        }
    }

    fn build_error_replies(
        &self,
        in_flight: &InFlightOp,
        code: AoeErrorCode,
        pool: &mut BufferPool,
        replies: &mut Vec<OutboundReply>,
    ) {
        for req in &in_flight.requests {
            let header = AoeHeader {
                shelf: self.identity.shelf,
                slot: self.identity.slot,
                command: AoeCommand::AtaCommand,
                tag: req.tag,
                is_response: true,
                error: 0,
            };
            if let Ok(frame) = build_error_reply(pool, &header, code) {
                replies.push(OutboundReply {
                    netif_id: req.netif_id,
                    frame,
                });
            }
        }
    }

    /// The soonest instant this device needs another wake-up to flush
    /// a pending merge window.
    pub fn next_deadline(&self) -> Option<Instant> {
        self.queue.next_deadline()
    }
}

/// A placeholder [`std::io::Error`] for counter bookkeeping; the real
/// error detail came from the completion and isn't retained once
/// classified (the reply and the log line already carry it).
fn io_error_placeholder() -> std::io::Error {
    std::io::Error::other("device I/O completion failed")
}

fn build_identify_data(name: &str, backing_sectors: u64) -> Vec<u8> {
    let mut data = vec![0u8; IDENTIFY_LEN];
    let name_bytes = name.as_bytes();
    let n = name_bytes.len().min(40);
    data[54..54 + n].copy_from_slice(&name_bytes[..n]);
    data[60..64].copy_from_slice(&(backing_sectors as u32).to_le_bytes());
    data
}

fn frame_from_bytes(pool: &mut BufferPool, bytes: &[u8]) -> Result<PacketBuffer, CoreError> {
    let mut buf = pool.acquire().map_err(|_| CoreError::ExhaustedBuffers)?;
    buf.raw_mut()[..bytes.len()].copy_from_slice(bytes);
    buf.set_len(bytes.len());
    Ok(buf)
}

fn build_ata_reply(
    pool: &mut BufferPool,
    header: &AoeHeader,
    ata: &AtaHeader,
    error: u8,
    data: &[u8],
) -> Result<PacketBuffer, CoreError> {
    let mut out = Vec::with_capacity(COMMON_HEADER_LEN + AtaHeader::LEN + data.len());
    header.write_reply(&mut out, error);
    ata.write_header(&mut out);
    out.extend_from_slice(data);
    frame_from_bytes(pool, &out)
}

/// Builds a minimal AoE error reply (common header only, tag
/// preserved) for a [`CoreError`] whose [`crate::error::ErrorPolicy`]
/// is `Reply` — shared with [`crate::router`], which needs the same
/// shape for failures the device engine itself couldn't resolve (e.g.
/// a `config-set` that failed to persist).
pub(crate) fn build_error_reply(
    pool: &mut BufferPool,
    header: &AoeHeader,
    code: AoeErrorCode,
) -> Result<PacketBuffer, CoreError> {
    let mut out = Vec::with_capacity(COMMON_HEADER_LEN + AtaHeader::LEN);
    header.write_reply(&mut out, code as u8);
    let echo = AtaHeader {
        aflags: 0,
        err_feature: 0,
        sector_count: 0,
        cmd_status: 0,
        lba: 0,
    };
    echo.write_header(&mut out);
    frame_from_bytes(pool, &out)
}

#[cfg(test)]
mod tests {
    use super::*;
    use aio::MemBlockIo;
    use std::time::Duration;

    fn identity(shelf: u16, slot: u8, read_only: bool) -> DeviceIdentity {
        DeviceIdentity {
            shelf,
            slot,
            name: "test-export".to_string(),
            read_only,
            broadcast: false,
        }
    }

    fn device(read_only: bool, state_dir: &std::path::Path) -> Device<MemBlockIo> {
        Device::new(
            identity(1, 2, read_only),
            MemBlockIo::new(vec![0x5a; 4096]),
            32,
            Duration::from_millis(0),
            1500,
            8,
            state_dir.to_str().unwrap().to_string(),
            None,
            None,
        )
        .unwrap()
    }

    fn ata_read_frame(tag: u32, lba: u64, sectors: u8) -> PacketBuffer {
        let header = AoeHeader {
            shelf: 1,
            slot: 2,
            command: AoeCommand::AtaCommand,
            tag,
            is_response: false,
            error: 0,
        };
        let ata = AtaHeader {
            aflags: 0,
            err_feature: 0,
            sector_count: sectors,
            cmd_status: 0x20,
            lba,
        };
        let mut out = Vec::new();
        header.write_request(&mut out);
        ata.write_header(&mut out);
        let mut pool = BufferPool::new(2048, 4);
        let mut buf = pool.acquire().unwrap();
        buf.raw_mut()[..out.len()].copy_from_slice(&out);
        buf.set_len(out.len());
        buf
    }

    #[test]
    fn read_two_sectors_returns_stored_bytes() {
        let dir = tempfile::tempdir().unwrap();
        let mut dev = device(false, dir.path());
        let mut pool = BufferPool::new(2048, 8);

        let frame = ata_read_frame(0x1234_5678, 0, 2);
        let header = AoeHeader::parse(frame.as_slice()).unwrap().0;
        let out = dev
            .dispatch(0, MacAddr([0xaa, 0xbb, 0xcc, 0xdd, 0xee, 0xff]), header, &frame, &mut pool)
            .unwrap();
        assert!(out.is_empty());

        dev.flush_deferred(Instant::now(), &mut pool);
        let replies = dev.poll_completions(&mut pool);
        assert_eq!(replies.len(), 1);
        let (parsed, rest) = AoeHeader::parse(replies[0].frame.as_slice()).unwrap();
        assert_eq!(parsed.tag, 0x1234_5678);
        assert_eq!(parsed.error, 0);
        let (_, data) = rest.split_at(AtaHeader::LEN);
        assert_eq!(data.len(), 1024);
        assert!(data.iter().all(|&b| b == 0x5a));
    }

    #[test]
    fn write_to_read_only_export_is_rejected_without_touching_disk() {
        let dir = tempfile::tempdir().unwrap();
        let mut dev = device(true, dir.path());
        let mut pool = BufferPool::new(2048, 8);

        let header = AoeHeader {
            shelf: 1,
            slot: 2,
            command: AoeCommand::AtaCommand,
            tag: 0xdead_beef,
            is_response: false,
            error: 0,
        };
        let ata = AtaHeader {
            aflags: 0x01,
            err_feature: 0,
            sector_count: 1,
            cmd_status: 0x30,
            lba: 0,
        };
        let mut out = Vec::new();
        header.write_request(&mut out);
        ata.write_header(&mut out);
        out.extend_from_slice(&[0xffu8; 512]);
        let mut frame = pool.acquire().unwrap();
        frame.raw_mut()[..out.len()].copy_from_slice(&out);
        frame.set_len(out.len());

        let replies = dev
            .dispatch(0, MacAddr([1, 2, 3, 4, 5, 6]), header, &frame, &mut pool)
            .unwrap();
        assert_eq!(replies.len(), 1);
        let (parsed, _) = AoeHeader::parse(replies[0].frame.as_slice()).unwrap();
        assert_eq!(parsed.tag, 0xdead_beef);
        assert_eq!(parsed.error, AoeErrorCode::WriteProtected as u8);
        assert_eq!(dev.deferred_len(), 0);
    }

    #[test]
    fn identify_is_synthesized_without_touching_backing_store() {
        let dir = tempfile::tempdir().unwrap();
        let mut dev = device(false, dir.path());
        let mut pool = BufferPool::new(2048, 8);

        let header = AoeHeader {
            shelf: 1,
            slot: 2,
            command: AoeCommand::AtaCommand,
            tag: 7,
            is_response: false,
            error: 0,
        };
        let ata = AtaHeader {
            aflags: 0,
            err_feature: 0,
            sector_count: 1,
            cmd_status: 0xec,
            lba: 0,
        };
        let mut out = Vec::new();
        header.write_request(&mut out);
        ata.write_header(&mut out);
        let mut frame = pool.acquire().unwrap();
        frame.raw_mut()[..out.len()].copy_from_slice(&out);
        frame.set_len(out.len());

        let replies = dev
            .dispatch(0, MacAddr([1, 2, 3, 4, 5, 6]), header, &frame, &mut pool)
            .unwrap();
        assert_eq!(replies.len(), 1);
        assert_eq!(dev.stats.identifies, 1);
    }
}
