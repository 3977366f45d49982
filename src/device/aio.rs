//! Asynchronous block I/O seam. The real backend submits through
//! `io_uring`, reporting completions through one readable fd registered
//! with the event loop; tests use an in-memory backing store that
//! completes on the next `poll_completions` call.

use std::io;
#[cfg(target_os = "linux")]
use std::os::unix::io::AsRawFd;
use std::os::unix::io::RawFd;

use crate::buffer::PacketBuffer;

#[derive(Debug)]
pub struct Completion {
    pub cookie: u64,
    pub buf: PacketBuffer,
    pub result: io::Result<usize>,
}

pub trait BlockIo {
    fn submit_read(&mut self, cookie: u64, offset: u64, buf: PacketBuffer) -> io::Result<()>;
    fn submit_write(&mut self, cookie: u64, offset: u64, buf: PacketBuffer) -> io::Result<()>;
    /// Drains whatever completions are ready; never blocks.
    fn poll_completions(&mut self) -> Vec<Completion>;
    /// The fd the event loop should watch for completion readiness.
    fn completion_fd(&self) -> RawFd;
}

#[cfg(target_os = "linux")]
pub struct IoUringBlockIo {
    ring: io_uring::IoUring,
    fd: RawFd,
    in_flight: std::collections::HashMap<u64, PacketBuffer>,
}

#[cfg(target_os = "linux")]
impl IoUringBlockIo {
    pub fn new(fd: RawFd, queue_depth: u32) -> io::Result<Self> {
        let ring = io_uring::IoUring::new(queue_depth)?;
        Ok(Self {
            ring,
            fd,
            in_flight: std::collections::HashMap::new(),
        })
    }

    fn push_read(&mut self, cookie: u64, offset: u64, mut buf: PacketBuffer) -> io::Result<()> {
        use io_uring::{opcode, types};
        let ptr = buf.raw_mut().as_mut_ptr();
        let len = buf.capacity() as u32;
        let entry = opcode::Read::new(types::Fd(self.fd), ptr, len)
            .offset(offset)
            .build()
            .user_data(cookie);
        self.in_flight.insert(cookie, buf);
        unsafe {
            self.ring
                .submission()
                .push(&entry)
                .map_err(|_| io::Error::new(io::ErrorKind::WouldBlock, "submission queue full"))?;
        }
        self.ring.submit()?;
        Ok(())
    }

    fn push_write(&mut self, cookie: u64, offset: u64, buf: PacketBuffer) -> io::Result<()> {
        use io_uring::{opcode, types};
        let entry = opcode::Write::new(types::Fd(self.fd), buf.as_slice().as_ptr(), buf.len() as u32)
            .offset(offset)
            .build()
            .user_data(cookie);
        self.in_flight.insert(cookie, buf);
        unsafe {
            self.ring
                .submission()
                .push(&entry)
                .map_err(|_| io::Error::new(io::ErrorKind::WouldBlock, "submission queue full"))?;
        }
        self.ring.submit()?;
        Ok(())
    }
}

#[cfg(target_os = "linux")]
impl BlockIo for IoUringBlockIo {
    fn submit_read(&mut self, cookie: u64, offset: u64, buf: PacketBuffer) -> io::Result<()> {
        self.push_read(cookie, offset, buf)
    }

    fn submit_write(&mut self, cookie: u64, offset: u64, buf: PacketBuffer) -> io::Result<()> {
        self.push_write(cookie, offset, buf)
    }

    fn poll_completions(&mut self) -> Vec<Completion> {
        let cqes: Vec<_> = self.ring.completion().collect();
        cqes.into_iter()
            .filter_map(|cqe| {
                let cookie = cqe.user_data();
                let buf = self.in_flight.remove(&cookie)?;
                let result = if cqe.result() < 0 {
                    Err(io::Error::from_raw_os_error(-cqe.result()))
                } else {
                    Ok(cqe.result() as usize)
                };
                Some(Completion { cookie, buf, result })
            })
            .collect()
    }

    fn completion_fd(&self) -> RawFd {
        self.ring.as_raw_fd()
    }
}

/// In-memory backing store for device engine tests: a flat byte
/// buffer, reads/writes apply immediately, completions surface on the
/// next `poll_completions` call (one tick of simulated latency).
#[derive(Default)]
pub struct MemBlockIo {
    pub data: Vec<u8>,
    pending: Vec<PendingMemOp>,
}

struct PendingMemOp {
    cookie: u64,
    offset: u64,
    write: bool,
    buf: PacketBuffer,
}

impl MemBlockIo {
    pub fn new(data: Vec<u8>) -> Self {
        Self {
            data,
            pending: Vec::new(),
        }
    }
}

impl BlockIo for MemBlockIo {
    fn submit_read(&mut self, cookie: u64, offset: u64, buf: PacketBuffer) -> io::Result<()> {
        self.pending.push(PendingMemOp {
            cookie,
            offset,
            write: false,
            buf,
        });
        Ok(())
    }

    fn submit_write(&mut self, cookie: u64, offset: u64, buf: PacketBuffer) -> io::Result<()> {
        self.pending.push(PendingMemOp {
            cookie,
            offset,
            write: true,
            buf,
        });
        Ok(())
    }

    fn poll_completions(&mut self) -> Vec<Completion> {
        let pending = std::mem::take(&mut self.pending);
        pending
            .into_iter()
            .map(|op| {
                let PendingMemOp {
                    cookie,
                    offset,
                    write,
                    mut buf,
                } = op;
                let start = offset as usize;
                let result = if write {
                    let len = buf.len();
                    if start + len > self.data.len() {
                        self.data.resize(start + len, 0);
                    }
                    self.data[start..start + len].copy_from_slice(buf.as_slice());
                    Ok(len)
                } else {
                    let want = buf.capacity();
                    let end = (start + want).min(self.data.len());
                    let got = end.saturating_sub(start);
                    buf.raw_mut()[..got].copy_from_slice(&self.data[start..end]);
                    buf.set_len(got);
                    Ok(got)
                };
                Completion { cookie, buf, result }
            })
            .collect()
    }

    fn completion_fd(&self) -> RawFd {
        -1
    }
}
