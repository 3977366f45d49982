//! `PACKET_RX_RING`/`PACKET_TX_RING` mmap region management.
//!
//! Each ring is a flat mmap'd block of fixed-size frames. Every frame
//! begins with a `tpacket2_hdr` whose `tp_status` word is the only
//! synchronization between kernel and user space: the low bit
//! (`TP_STATUS_USER`/`TP_STATUS_SEND_REQUEST`, value 1) flips meaning
//! depending on ring direction.

use std::io;
use std::ptr::NonNull;

/// Matches `linux/if_packet.h`'s `tpacket2_hdr` layout (TPACKET_V2).
#[repr(C)]
struct TpacketHdr {
    tp_status: u32,
    tp_len: u32,
    tp_snaplen: u32,
    tp_mac: u16,
    tp_net: u16,
    tp_sec: u32,
    tp_nsec: u32,
    tp_vlan_tci: u16,
    tp_vlan_tpid: u16,
    tp_padding: [u8; 4],
}

const TP_STATUS_KERNEL: u32 = 0;
const TP_STATUS_USER: u32 = 1;
const TP_STATUS_SEND_REQUEST: u32 = 1;
const TP_STATUS_SENDING: u32 = 2;

/// One mmap'd ring (RX or TX), owning the region for its lifetime.
pub struct Ring {
    mem: NonNull<u8>,
    mem_len: usize,
    frame_size: u32,
    frame_count: u32,
    cursor: u32,
}

// SAFETY: the mmap region is only ever touched from the single event
// loop thread that owns the `Netif`; `Ring` is moved, not shared.
unsafe impl Send for Ring {}

impl Ring {
    /// Wraps an already-mmap'd region. `mem` must point to
    /// `frame_count * frame_size` bytes mapped with `PROT_READ |
    /// PROT_WRITE` and `MAP_SHARED`, matching a successful
    /// `PACKET_RX_RING`/`PACKET_TX_RING` `setsockopt` + `mmap` pair.
    ///
    /// # Safety
    /// Caller must guarantee the mapping covers at least `frame_count *
    /// frame_size` bytes and stays valid for the returned `Ring`'s
    /// lifetime (i.e. ownership of the mapping transfers here).
    pub unsafe fn from_mmap(mem: *mut libc::c_void, frame_size: u32, frame_count: u32) -> Self {
        Self {
            mem: NonNull::new(mem as *mut u8).expect("mmap returned null"),
            mem_len: frame_size as usize * frame_count as usize,
            frame_size,
            frame_count,
            cursor: 0,
        }
    }

    fn frame_ptr(&self, index: u32) -> *mut u8 {
        debug_assert!(index < self.frame_count);
        unsafe { self.mem.as_ptr().add(index as usize * self.frame_size as usize) }
    }

    fn header(&self, index: u32) -> &TpacketHdr {
        unsafe { &*(self.frame_ptr(index) as *const TpacketHdr) }
    }

    fn header_mut(&self, index: u32) -> &mut TpacketHdr {
        unsafe { &mut *(self.frame_ptr(index) as *mut TpacketHdr) }
    }

    /// Polls the frame at the current RX cursor. If the kernel has
    /// handed it to user space (`TP_STATUS_USER` set), copies its
    /// payload into `out` and advances the cursor, returning the
    /// payload length. Returns `None` if the cursor's slot is still
    /// owned by the kernel.
    pub fn rx_poll(&mut self, out: &mut [u8]) -> Option<usize> {
        let idx = self.cursor;
        let hdr = self.header(idx);
        if hdr.tp_status & TP_STATUS_USER == 0 {
            return None;
        }
        let mac_off = hdr.tp_mac as usize;
        let len = hdr.tp_snaplen as usize;
        let src = unsafe { self.frame_ptr(idx).add(mac_off) };
        let copy_len = len.min(out.len());
        unsafe {
            std::ptr::copy_nonoverlapping(src, out.as_mut_ptr(), copy_len);
        }
        self.header_mut(idx).tp_status = TP_STATUS_KERNEL;
        self.cursor = (self.cursor + 1) % self.frame_count;
        Some(copy_len)
    }

    /// Writes `frame` into the TX cursor's slot and flags it for
    /// transmission, advancing the cursor. Returns `false` (no
    /// progress) if the slot is still in flight from a previous kick.
    pub fn tx_push(&mut self, frame: &[u8]) -> bool {
        let idx = self.cursor;
        let hdr = self.header(idx);
        if hdr.tp_status & (TP_STATUS_SEND_REQUEST | TP_STATUS_SENDING) != 0 {
            return false;
        }
        let data_off = std::mem::size_of::<TpacketHdr>();
        let dst = unsafe { self.frame_ptr(idx).add(data_off) };
        unsafe {
            std::ptr::copy_nonoverlapping(frame.as_ptr(), dst, frame.len());
        }
        let hdr = self.header_mut(idx);
        hdr.tp_len = frame.len() as u32;
        hdr.tp_status = TP_STATUS_SEND_REQUEST;
        self.cursor = (self.cursor + 1) % self.frame_count;
        true
    }

    /// `true` once every TX slot has cleared `TP_STATUS_SENDING`,
    /// meaning a `sendto()` kick can be safely issued again.
    pub fn tx_drained(&self) -> bool {
        (0..self.frame_count).all(|i| self.header(i).tp_status & TP_STATUS_SENDING == 0)
    }

    pub fn frame_count(&self) -> u32 {
        self.frame_count
    }
}

impl Drop for Ring {
    fn drop(&mut self) {
        unsafe {
            libc::munmap(self.mem.as_ptr() as *mut libc::c_void, self.mem_len);
        }
    }
}

pub fn map_errno(context: &'static str) -> io::Error {
    let err = io::Error::last_os_error();
    log::debug!("{context}: {err}");
    err
}
