//! Per-interface raw frame engine: RX drain, TX send-queue with
//! optional batching window, MTU tracking, and the TX-ring-bug
//! per-frame fallback.

pub mod ring;
pub mod socket;

use std::collections::VecDeque;
use std::os::unix::io::RawFd;
use std::time::{Duration, Instant};

use crate::buffer::{BufferPool, PacketBuffer};

/// The seam between a [`Netif`] and its underlying frame source/sink.
/// The real implementation is [`socket::RawSocket`]; tests use an
/// in-memory double so the engine's batching/merge-window/TX-ring-bug
/// logic is exercised without a kernel packet ring.
pub trait RawIo {
    /// Copies the next ready frame into `out`, returning its length, or
    /// `None` if nothing is ready.
    fn recv_frame(&mut self, out: &mut [u8]) -> Option<usize>;

    /// Attempts to hand `frame` to the kernel/sink for transmission.
    /// Returns `false` if the ring/sink has no free slot right now.
    fn send_frame(&mut self, frame: &[u8]) -> bool;

    /// `true` once every in-flight TX slot has been reclaimed by the
    /// kernel, i.e. another batched kick may be issued.
    fn writable_ready(&self) -> bool;

    /// The fd the event loop registers for RX/writable readiness.
    /// Test doubles that never touch a real `Poll` return `-1`.
    fn as_raw_fd(&self) -> RawFd;
}

impl RawIo for socket::RawSocket {
    fn recv_frame(&mut self, out: &mut [u8]) -> Option<usize> {
        socket::RawSocket::recv_frame(self, out)
    }

    fn send_frame(&mut self, frame: &[u8]) -> bool {
        socket::RawSocket::try_send(self, frame)
    }

    fn writable_ready(&self) -> bool {
        self.tx_drained()
    }

    fn as_raw_fd(&self) -> RawFd {
        socket::RawSocket::as_raw_fd(self)
    }
}

/// An in-memory double recording what was sent, for engine unit tests.
#[derive(Default)]
pub struct LoopbackRawIo {
    pub inbox: VecDeque<Vec<u8>>,
    pub sent: Vec<Vec<u8>>,
    pub tx_capacity: usize,
}

impl LoopbackRawIo {
    pub fn new(tx_capacity: usize) -> Self {
        Self {
            tx_capacity,
            ..Default::default()
        }
    }
}

impl RawIo for LoopbackRawIo {
    fn recv_frame(&mut self, out: &mut [u8]) -> Option<usize> {
        let frame = self.inbox.pop_front()?;
        let len = frame.len().min(out.len());
        out[..len].copy_from_slice(&frame[..len]);
        Some(len)
    }

    fn send_frame(&mut self, frame: &[u8]) -> bool {
        if self.sent.len() >= self.tx_capacity {
            return false;
        }
        self.sent.push(frame.to_vec());
        true
    }

    fn writable_ready(&self) -> bool {
        true
    }

    fn as_raw_fd(&self) -> RawFd {
        -1
    }
}

/// Identity and transient statistics for one active interface.
#[derive(Debug, Clone, Default)]
pub struct NetifStats {
    pub frames_in: u64,
    pub frames_out: u64,
    pub dropped: u64,
}

pub const DEFAULT_RX_BUDGET: usize = 64;

pub struct Netif<Io: RawIo> {
    pub name: String,
    pub index: u32,
    pub mac: [u8; 6],
    mtu: u32,
    io: Io,
    send_queue: VecDeque<PacketBuffer>,
    /// When set, every `submit` sends immediately instead of batching —
    /// the per-process TX-ring-bug workaround.
    per_frame_send: bool,
    max_delay: Duration,
    batch_deadline: Option<Instant>,
    high_water: usize,
    pub stats: NetifStats,
}

impl<Io: RawIo> Netif<Io> {
    pub fn new(name: String, index: u32, mac: [u8; 6], mtu: u32, io: Io) -> Self {
        Self {
            name,
            index,
            mac,
            mtu,
            io,
            send_queue: VecDeque::new(),
            per_frame_send: false,
            max_delay: Duration::from_millis(0),
            batch_deadline: None,
            high_water: 8,
            stats: NetifStats::default(),
        }
    }

    pub fn set_tx_ring_bug_workaround(&mut self, enabled: bool) {
        self.per_frame_send = enabled;
    }

    pub fn set_max_delay(&mut self, delay: Duration) {
        self.max_delay = delay;
    }

    pub fn set_high_water(&mut self, n: usize) {
        self.high_water = n;
    }

    pub fn mtu(&self) -> u32 {
        self.mtu
    }

    /// The fd the event loop registers for RX/writable readiness; `-1`
    /// for test doubles that never touch a real `Poll`.
    pub fn io_raw_fd(&self) -> RawFd {
        self.io.as_raw_fd()
    }

    pub fn set_mtu(&mut self, mtu: u32) {
        self.mtu = mtu;
    }

    /// Drains up to `budget` ready frames, handing each to `on_frame`.
    /// Returns the number of frames actually drained.
    pub fn poll_rx<F>(&mut self, pool: &mut BufferPool, budget: usize, mut on_frame: F) -> usize
    where
        F: FnMut(&mut Netif<Io>, PacketBuffer),
    {
        let mut drained = 0;
        while drained < budget {
            let mut buf = match pool.acquire() {
                Ok(buf) => buf,
                Err(_) => {
                    self.stats.dropped += 1;
                    break;
                }
            };
            let len = match self.io.recv_frame(buf.raw_mut()) {
                Some(len) => len,
                None => {
                    pool.release(buf);
                    break;
                }
            };
            buf.set_len(len);
            drained += 1;
            self.stats.frames_in += 1;
            on_frame(self, buf);
        }
        drained
    }

    /// Appends `buf` to the send FIFO. If the TX-ring-bug workaround is
    /// active, or the batching window has elapsed, or the FIFO exceeds
    /// the high-water threshold, flushes immediately.
    pub fn submit(&mut self, buf: PacketBuffer, pool: &mut BufferPool) {
        self.send_queue.push_back(buf);
        let over_high_water = self.send_queue.len() > self.high_water;
        if self.per_frame_send || self.max_delay.is_zero() || over_high_water {
            self.flush_send_queue(pool);
        } else if self.batch_deadline.is_none() {
            self.batch_deadline = Some(Instant::now() + self.max_delay);
        }
    }

    /// Drains the send FIFO until the sink has no more room, then
    /// disarms the batching deadline. Each buffer handed to the sink is
    /// returned to `pool` — the kernel/sink has its own copy once
    /// `send_frame` accepts it, so a buffer is never referenced from
    /// two queues simultaneously.
    pub fn flush_send_queue(&mut self, pool: &mut BufferPool) {
        while let Some(buf) = self.send_queue.front() {
            if !self.io.send_frame(buf.as_slice()) {
                break;
            }
            let buf = self.send_queue.pop_front().expect("front just matched");
            pool.release(buf);
            self.stats.frames_out += 1;
        }
        self.batch_deadline = None;
    }

    /// Called on writable-readiness: drains the FIFO and disarms the
    /// watch, matching the netif TX contract.
    pub fn on_writable(&mut self, pool: &mut BufferPool) {
        if self.io.writable_ready() {
            self.flush_send_queue(pool);
        }
    }

    /// The soonest instant this netif needs another wake-up to flush
    /// its batching window, if any is pending.
    pub fn next_deadline(&self) -> Option<Instant> {
        self.batch_deadline
    }

    /// Runs the batching deadline if it has elapsed.
    pub fn tick(&mut self, now: Instant, pool: &mut BufferPool) {
        if let Some(deadline) = self.batch_deadline {
            if now >= deadline {
                self.flush_send_queue(pool);
            }
        }
    }

    pub fn pending_sends(&self) -> usize {
        self.send_queue.len()
    }
}

#[cfg(test)]
impl Netif<LoopbackRawIo> {
    /// Queues a raw frame for the next `poll_rx` to hand back, for
    /// event-loop-level tests that need to drive a `Netif` without a
    /// real ring.
    pub(crate) fn push_inbound_for_test(&mut self, frame: Vec<u8>) {
        self.io.inbox.push_back(frame);
    }
}

#[cfg(feature = "tx-ring-bug-autodetect")]
pub fn autodetect_tx_ring_bug() -> bool {
    autodetect_tx_ring_bug_for(kernel_release().as_deref())
}

#[cfg(feature = "tx-ring-bug-autodetect")]
fn kernel_release() -> Option<String> {
    let mut uts: libc::utsname = unsafe { std::mem::zeroed() };
    if unsafe { libc::uname(&mut uts) } != 0 {
        return None;
    }
    let cstr = unsafe { std::ffi::CStr::from_ptr(uts.release.as_ptr()) };
    cstr.to_str().ok().map(str::to_string)
}

/// Known-broken kernel release prefixes — not portable, must not be
/// relied on; a configuration switch always overrides the guess.
#[cfg(feature = "tx-ring-bug-autodetect")]
const BROKEN_RELEASE_PREFIXES: &[&str] = &["2.6.31", "2.6.32"];

#[cfg(feature = "tx-ring-bug-autodetect")]
fn autodetect_tx_ring_bug_for(release: Option<&str>) -> bool {
    match release {
        Some(r) => BROKEN_RELEASE_PREFIXES.iter().any(|p| r.starts_with(p)),
        None => false,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::buffer::BufferPool;

    fn netif(tx_capacity: usize) -> Netif<LoopbackRawIo> {
        Netif::new(
            "eth0".to_string(),
            1,
            [0x02, 0, 0, 0, 0, 1],
            1500,
            LoopbackRawIo::new(tx_capacity),
        )
    }

    #[test]
    fn poll_rx_drains_up_to_budget() {
        let mut nif = netif(8);
        for i in 0..5u8 {
            nif.io.inbox.push_back(vec![i; 20]);
        }
        let mut pool = BufferPool::new(64, 16);
        let mut seen = 0;
        nif.poll_rx(&mut pool, 3, |_, _| seen += 1);
        assert_eq!(seen, 3);
        assert_eq!(nif.stats.frames_in, 3);
        assert_eq!(nif.io.inbox.len(), 2);
    }

    #[test]
    fn submit_flushes_immediately_with_zero_delay() {
        let mut nif = netif(8);
        let mut pool = BufferPool::new(64, 4);
        let mut buf = pool.acquire().unwrap();
        buf.set_len(10);
        nif.submit(buf, &mut pool);
        assert_eq!(nif.pending_sends(), 0);
        assert_eq!(nif.io.sent.len(), 1);
    }

    #[test]
    fn submit_batches_when_max_delay_set() {
        let mut nif = netif(8);
        nif.set_max_delay(Duration::from_millis(50));
        let mut pool = BufferPool::new(64, 4);
        let mut buf = pool.acquire().unwrap();
        buf.set_len(10);
        nif.submit(buf, &mut pool);
        assert_eq!(nif.pending_sends(), 1);
        assert!(nif.next_deadline().is_some());
        nif.tick(Instant::now() + Duration::from_millis(51), &mut pool);
        assert_eq!(nif.pending_sends(), 0);
    }

    #[test]
    fn tx_ring_bug_workaround_forces_per_frame_send() {
        let mut nif = netif(8);
        nif.set_max_delay(Duration::from_millis(500));
        nif.set_tx_ring_bug_workaround(true);
        let mut pool = BufferPool::new(64, 4);
        let mut buf = pool.acquire().unwrap();
        buf.set_len(10);
        nif.submit(buf, &mut pool);
        assert_eq!(nif.pending_sends(), 0);
    }

    #[test]
    fn high_water_mark_cuts_batching_window_short() {
        let mut nif = netif(8);
        nif.set_max_delay(Duration::from_millis(500));
        nif.set_high_water(2);
        let mut pool = BufferPool::new(64, 8);
        for _ in 0..3 {
            let mut buf = pool.acquire().unwrap();
            buf.set_len(4);
            nif.submit(buf, &mut pool);
        }
        assert_eq!(nif.pending_sends(), 0);
    }

    #[test]
    fn full_tx_sink_leaves_remainder_queued() {
        let mut nif = netif(1);
        let mut pool = BufferPool::new(64, 4);
        for _ in 0..2 {
            let mut buf = pool.acquire().unwrap();
            buf.set_len(4);
            nif.submit(buf, &mut pool);
        }
        assert_eq!(nif.pending_sends(), 1);
        nif.io.tx_capacity = 4;
        nif.on_writable(&mut pool);
        assert_eq!(nif.pending_sends(), 0);
    }

    #[cfg(feature = "tx-ring-bug-autodetect")]
    #[test]
    fn autodetect_matches_known_broken_prefixes() {
        assert!(autodetect_tx_ring_bug_for(Some("2.6.31-generic")));
        assert!(!autodetect_tx_ring_bug_for(Some("6.8.0-generic")));
        assert!(!autodetect_tx_ring_bug_for(None));
    }
}
