//! Raw `AF_PACKET` socket construction and `PACKET_RX_RING`/
//! `PACKET_TX_RING` setup.

use std::io;
use std::os::unix::io::{AsRawFd, RawFd};

use socket2::{Domain, Protocol, Socket, Type};

use crate::error::NetifError;
use crate::netif::ring::Ring;

const SOL_PACKET: i32 = 263;
const PACKET_RX_RING: i32 = 5;
const PACKET_TX_RING: i32 = 13;
const PACKET_VERSION: i32 = 10;
const TPACKET_V2: i32 = 1;

#[repr(C)]
struct TpacketReq {
    tp_block_size: u32,
    tp_block_nr: u32,
    tp_frame_size: u32,
    tp_frame_nr: u32,
}

pub struct RingConfig {
    pub frame_size: u32,
    pub frame_count: u32,
}

impl RingConfig {
    fn block_size(&self) -> u32 {
        self.frame_size
    }

    fn req(&self) -> TpacketReq {
        TpacketReq {
            tp_block_size: self.block_size(),
            tp_block_nr: self.frame_count,
            tp_frame_size: self.frame_size,
            tp_frame_nr: self.frame_count,
        }
    }
}

/// An opened and ring-mapped raw packet socket bound to one interface.
pub struct RawSocket {
    socket: Socket,
    rx: Ring,
    tx: Ring,
}

impl RawSocket {
    pub fn open(
        iface: &str,
        if_index: i32,
        ethertype: u16,
        rx_cfg: &RingConfig,
        tx_cfg: &RingConfig,
    ) -> Result<Self, NetifError> {
        let socket = Socket::new(
            Domain::PACKET,
            Type::RAW,
            Some(Protocol::from(i32::from(ethertype.to_be()))),
        )
        .map_err(|source| NetifError::SocketOpen {
            iface: iface.to_string(),
            source,
        })?;

        let fd = socket.as_raw_fd();
        set_packet_version(fd).map_err(|source| NetifError::SocketOpen {
            iface: iface.to_string(),
            source,
        })?;

        let rx_req = rx_cfg.req();
        setsockopt_ring(fd, PACKET_RX_RING, &rx_req).map_err(|source| NetifError::RingSetup {
            iface: iface.to_string(),
            ring: "rx",
            source,
        })?;
        let tx_req = tx_cfg.req();
        setsockopt_ring(fd, PACKET_TX_RING, &tx_req).map_err(|source| NetifError::RingSetup {
            iface: iface.to_string(),
            ring: "tx",
            source,
        })?;

        let rx_len = rx_req.tp_block_size as usize * rx_req.tp_block_nr as usize;
        let tx_len = tx_req.tp_block_size as usize * tx_req.tp_block_nr as usize;
        let total_len = rx_len + tx_len;

        let mem = unsafe {
            libc::mmap(
                std::ptr::null_mut(),
                total_len,
                libc::PROT_READ | libc::PROT_WRITE,
                libc::MAP_SHARED,
                fd,
                0,
            )
        };
        if mem == libc::MAP_FAILED {
            return Err(NetifError::RingSetup {
                iface: iface.to_string(),
                ring: "mmap",
                source: io::Error::last_os_error(),
            });
        }

        let rx_mem = mem;
        let tx_mem = unsafe { (mem as *mut u8).add(rx_len) as *mut libc::c_void };

        let rx = unsafe { Ring::from_mmap(rx_mem, rx_cfg.frame_size, rx_cfg.frame_count) };
        let tx = unsafe { Ring::from_mmap(tx_mem, tx_cfg.frame_size, tx_cfg.frame_count) };

        bind_to_interface(fd, if_index, ethertype).map_err(|source| NetifError::Bind {
            iface: iface.to_string(),
            source,
        })?;

        Ok(Self { socket, rx, tx })
    }

    pub fn recv_frame(&mut self, out: &mut [u8]) -> Option<usize> {
        self.rx.rx_poll(out)
    }

    pub fn try_send(&mut self, frame: &[u8]) -> bool {
        if self.tx.tx_push(frame) {
            self.kick();
            true
        } else {
            false
        }
    }

    pub fn tx_drained(&self) -> bool {
        self.tx.tx_drained()
    }

    fn kick(&self) {
        unsafe {
            libc::send(self.socket.as_raw_fd(), std::ptr::null(), 0, libc::MSG_DONTWAIT);
        }
    }

    pub fn as_raw_fd(&self) -> RawFd {
        self.socket.as_raw_fd()
    }
}

fn set_packet_version(fd: RawFd) -> io::Result<()> {
    let version: i32 = TPACKET_V2;
    let rc = unsafe {
        libc::setsockopt(
            fd,
            SOL_PACKET,
            PACKET_VERSION,
            &version as *const i32 as *const libc::c_void,
            std::mem::size_of::<i32>() as libc::socklen_t,
        )
    };
    if rc != 0 {
        return Err(io::Error::last_os_error());
    }
    Ok(())
}

fn setsockopt_ring(fd: RawFd, opt: i32, req: &TpacketReq) -> io::Result<()> {
    let rc = unsafe {
        libc::setsockopt(
            fd,
            SOL_PACKET,
            opt,
            req as *const TpacketReq as *const libc::c_void,
            std::mem::size_of::<TpacketReq>() as libc::socklen_t,
        )
    };
    if rc != 0 {
        return Err(io::Error::last_os_error());
    }
    Ok(())
}

fn bind_to_interface(fd: RawFd, if_index: i32, ethertype: u16) -> io::Result<()> {
    let mut addr: libc::sockaddr_ll = unsafe { std::mem::zeroed() };
    addr.sll_family = libc::AF_PACKET as u16;
    addr.sll_protocol = ethertype.to_be();
    addr.sll_ifindex = if_index;

    let rc = unsafe {
        libc::bind(
            fd,
            &addr as *const libc::sockaddr_ll as *const libc::sockaddr,
            std::mem::size_of::<libc::sockaddr_ll>() as libc::socklen_t,
        )
    };
    if rc != 0 {
        return Err(io::Error::last_os_error());
    }
    Ok(())
}
