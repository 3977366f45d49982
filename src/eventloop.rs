//! Single-threaded readiness-driven event loop.
//!
//! A `mio::Poll`-based readiness dispatcher: one `Token` per registered
//! fd, a soonest-deadline timeout capped at 10 seconds, reload/exit
//! flags only acted on at the top of the loop (never from inside a
//! signal handler).

use std::collections::HashMap;
use std::time::{Duration, Instant};

use mio::unix::SourceFd;
use mio::{Events, Interest, Poll, Token};
use signal_hook::consts::signal::{SIGHUP, SIGINT, SIGQUIT, SIGTERM};
use signal_hook_mio::v1_0::Signals;

use crate::buffer::BufferPool;
use crate::device::aio::BlockIo;
use crate::device::OutboundReply;
use crate::netif::{Netif, RawIo};
use crate::router::Router;

/// Idle poll timeout cap.
const IDLE_TIMEOUT: Duration = Duration::from_secs(10);

const SIGNAL_TOKEN: Token = Token(0);
const FIRST_NETIF_TOKEN: usize = 1;
/// Device completion tokens start past a generous netif allowance so
/// the two ranges never collide regardless of interface count.
const FIRST_DEVICE_TOKEN: usize = 1 << 16;

enum Registration {
    Netif(usize),
    Device(usize),
}

/// Owns the poller, every configured interface, the router, and the
/// shared buffer pool. `reload()` is the only hook a caller (`main.rs`)
/// needs to drive a `SIGHUP`-triggered config reload.
pub struct Server<NetIo: RawIo, BlockIoT: BlockIo> {
    poll: Poll,
    signals: Signals,
    netifs: Vec<Netif<NetIo>>,
    router: Router<BlockIoT>,
    pool: BufferPool,
    tokens: HashMap<Token, Registration>,
    exit_requested: bool,
    reload_requested: bool,
}

impl<NetIo: RawIo, BlockIoT: BlockIo> Server<NetIo, BlockIoT> {
    pub fn new(
        netifs: Vec<Netif<NetIo>>,
        router: Router<BlockIoT>,
        pool: BufferPool,
    ) -> std::io::Result<Self> {
        let poll = Poll::new()?;
        let signals = Signals::new([SIGHUP, SIGINT, SIGTERM, SIGQUIT])?;

        let mut server = Self {
            poll,
            signals,
            netifs,
            router,
            pool,
            tokens: HashMap::new(),
            exit_requested: false,
            reload_requested: false,
        };
        server.register_all()?;
        Ok(server)
    }

    fn register_all(&mut self) -> std::io::Result<()> {
        self.poll
            .registry()
            .register(&mut self.signals, SIGNAL_TOKEN, Interest::READABLE)?;

        for (idx, netif) in self.netifs.iter().enumerate() {
            let fd = netif.io_raw_fd();
            if fd < 0 {
                continue; // loopback test double: nothing to register
            }
            let token = Token(FIRST_NETIF_TOKEN + idx);
            self.poll
                .registry()
                .register(&mut SourceFd(&fd), token, Interest::READABLE | Interest::WRITABLE)?;
            self.tokens.insert(token, Registration::Netif(idx));
        }

        for (idx, routed) in self.router.devices().iter().enumerate() {
            let fd = routed.device.completion_fd();
            if fd < 0 {
                continue;
            }
            let token = Token(FIRST_DEVICE_TOKEN + idx);
            self.poll
                .registry()
                .register(&mut SourceFd(&fd), token, Interest::READABLE)?;
            self.tokens.insert(token, Registration::Device(idx));
        }

        Ok(())
    }

    pub fn request_exit(&mut self) {
        self.exit_requested = true;
    }

    /// Runs until a shutdown signal arrives or `request_exit` is called
    /// externally. `on_reload` is invoked once per top-of-loop pass
    /// where a `SIGHUP` was observed since the last pass; its return
    /// value replaces the router and netif MTU/interface overrides it
    /// chooses to apply — the in-flight device state making up each
    /// `Router` is left untouched by a reload.
    pub fn run<F>(&mut self, mut on_reload: F) -> std::io::Result<()>
    where
        F: FnMut(&mut Router<BlockIoT>, &mut Vec<Netif<NetIo>>),
    {
        let mut events = Events::with_capacity(128);
        while !self.exit_requested {
            if self.reload_requested {
                self.reload_requested = false;
                on_reload(&mut self.router, &mut self.netifs);
            }

            let timeout = self.next_timeout();
            self.poll.poll(&mut events, Some(timeout))?;

            for event in events.iter() {
                if event.token() == SIGNAL_TOKEN {
                    self.drain_signals();
                    continue;
                }
                match self.tokens.get(&event.token()) {
                    Some(Registration::Netif(idx)) => {
                        self.service_netif(*idx, event.is_writable());
                    }
                    Some(Registration::Device(idx)) => {
                        self.service_device_completions(*idx);
                    }
                    None => {}
                }
            }

            let now = Instant::now();
            for netif in &mut self.netifs {
                netif.tick(now, &mut self.pool);
            }
            self.router.flush_deferred(now, &mut self.pool);
            self.dispatch_pending_completions();
        }
        Ok(())
    }

    fn drain_signals(&mut self) {
        for signal in self.signals.pending() {
            match signal {
                SIGHUP => self.reload_requested = true,
                SIGINT | SIGTERM | SIGQUIT => self.exit_requested = true,
                _ => {}
            }
        }
    }

    fn service_netif(&mut self, idx: usize, writable: bool) {
        if writable {
            let Some(netif) = self.netifs.get_mut(idx) else {
                return;
            };
            netif.on_writable(&mut self.pool);
        }
        let mut inbound = Vec::new();
        let Some(netif) = self.netifs.get_mut(idx) else {
            return;
        };
        netif.poll_rx(&mut self.pool, crate::netif::DEFAULT_RX_BUDGET, |nif, buf| {
            inbound.push((nif.mac, buf));
        });
        for (mac, frame) in inbound {
            let netif_name = self.netifs[idx].name.clone();
            match self.router.ingress(idx, &netif_name, crate::acl::MacAddr(mac), &frame, &mut self.pool) {
                Ok(replies) => self.send_replies(replies),
                Err(_err) => {
                    // Always a silent-drop policy error here; the router
                    // already recorded it in its own counters (a per-device
                    // dispatch error is instead recorded on that device and
                    // may still carry a reply, so it comes back as `Ok`).
                }
            }
            // The frame has been fully consumed (dispatched or dropped);
            // return it to the shared pool regardless of outcome.
            self.pool.release(frame);
        }
    }

    fn service_device_completions(&mut self, _idx: usize) {
        self.dispatch_pending_completions();
    }

    fn dispatch_pending_completions(&mut self) {
        let replies = self.router.poll_completions(&mut self.pool);
        self.send_replies(replies);
    }

    fn send_replies(&mut self, replies: Vec<OutboundReply>) {
        for reply in replies {
            if let Some(netif) = self.netifs.get_mut(reply.netif_id) {
                netif.submit(reply.frame, &mut self.pool);
            } else {
                self.pool.release(reply.frame);
            }
        }
    }

    /// The soonest of: the 10s idle cap, any netif's batching deadline,
    /// any device's merge-window deadline.
    fn next_timeout(&self) -> Duration {
        let now = Instant::now();
        let soonest = self
            .netifs
            .iter()
            .filter_map(Netif::next_deadline)
            .chain(self.router.next_deadline())
            .min();

        match soonest {
            Some(deadline) => deadline.saturating_duration_since(now).min(IDLE_TIMEOUT),
            None => IDLE_TIMEOUT,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::acl::{AclMap, AclPolicy, MacAddr};
    use crate::codec::{AoeCommand, AoeHeader, AtaHeader};
    use crate::config::{BackingSpec, DeviceConfig, ResolvedDevice};
    use crate::device::aio::MemBlockIo;
    use crate::device::{Device, DeviceIdentity};
    use crate::netif::LoopbackRawIo;
    use crate::router::RoutedDevice;
    use std::sync::Arc;

    fn write_frame(shelf: u16, slot: u8, tag: u32, lba: u64, sectors: u8, data: &[u8]) -> Vec<u8> {
        let header = AoeHeader {
            shelf,
            slot,
            command: AoeCommand::AtaCommand,
            tag,
            is_response: false,
            error: 0,
        };
        let ata = AtaHeader {
            aflags: 0x01,
            err_feature: 0,
            sector_count: sectors,
            cmd_status: 0x30, // WRITE SECTORS
            lba,
        };
        let mut out = Vec::new();
        header.write_request(&mut out);
        ata.write_header(&mut out);
        out.extend_from_slice(data);
        out
    }

    fn device_config() -> DeviceConfig {
        DeviceConfig {
            shelf: 1,
            slot: 2,
            backing: BackingSpec::Path("/dev/null".to_string()),
            direct_io: false,
            trace_io: false,
            read_only: false,
            broadcast: false,
            queue_length: 8,
            max_delay: Duration::from_millis(10),
            merge_delay: Duration::from_millis(0),
            accept: None,
            deny: None,
            interfaces: vec![],
        }
    }

    /// A write accepted just before a reload is deferred to the queue;
    /// the reload itself only swaps admission policy for requests that
    /// arrive afterward — the queued write still drains and replies on
    /// its original netif once the backing I/O completes.
    #[test]
    fn in_flight_write_completes_after_reload_denies_new_requests() {
        let dir = tempfile::tempdir().unwrap();
        let mac = MacAddr([1, 2, 3, 4, 5, 6]);

        let mut accept = AclMap::new();
        accept.add(mac).unwrap();

        let identity = DeviceIdentity {
            shelf: 1,
            slot: 2,
            name: "dev-1-2".to_string(),
            read_only: false,
            broadcast: false,
        };
        let device = Device::new(
            identity,
            MemBlockIo::new(vec![0u8; 4096]),
            8,
            Duration::from_millis(0),
            1500,
            8,
            dir.path().to_str().unwrap().to_string(),
            Some(accept.clone()),
            None,
        )
        .unwrap();

        let router = Router::new(vec![RoutedDevice {
            config: Arc::new(ResolvedDevice {
                config: device_config(),
                acl: AclPolicy {
                    accept: Some(accept),
                    deny: None,
                },
            }),
            device,
        }]);

        let netif = Netif::new("eth0".to_string(), 0, [0; 6], 1500, LoopbackRawIo::new(8));
        let mut server = Server::new(vec![netif], router, BufferPool::new(2048, 16)).unwrap();

        server.netifs[0].push_inbound_for_test(write_frame(1, 2, 0xabcd, 0, 1, &[0x42; 512]));
        server.service_netif(0, false);
        assert_eq!(server.router.devices()[0].device.deferred_len(), 1);

        // SIGHUP observed: flagged, but not acted on until the top of
        // the next loop iteration (mirrors `Server::run`'s own check).
        server.reload_requested = true;
        assert!(server.reload_requested);
        server.reload_requested = false;

        // The reload swaps this device's admission policy to deny the
        // initiator outright — simulating what a real `on_reload`
        // callback does to `Router::devices_mut`.
        let mut deny = AclMap::new();
        deny.add(mac).unwrap();
        for routed in server.router.devices_mut() {
            routed.config = Arc::new(ResolvedDevice {
                config: routed.config.config.clone(),
                acl: AclPolicy {
                    accept: None,
                    deny: Some(deny.clone()),
                },
            });
        }

        // A request from the same initiator arriving after the reload
        // is now rejected; the in-flight write from before the reload
        // is untouched by the policy swap.
        server.netifs[0].push_inbound_for_test(write_frame(1, 2, 0xbeef, 1, 1, &[0x99; 512]));
        server.service_netif(0, false);
        assert_eq!(server.router.devices()[0].device.deferred_len(), 1);

        let now = Instant::now();
        server.router.flush_deferred(now, &mut server.pool);
        let replies = server.router.poll_completions(&mut server.pool);
        assert_eq!(replies.len(), 1);
        assert_eq!(replies[0].netif_id, 0);
    }
}
