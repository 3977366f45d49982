//! Control-socket reference implementation: a Unix-domain-socket
//! listener that writes one JSON [`Snapshot`] per accepted connection
//! then closes it. Read-only, matching the control socket's "read-only
//! introspection" stance — there is no command the other end can send.

use std::io::{self, Write};
use std::os::unix::net::{UnixListener, UnixStream};
use std::path::Path;

use crate::stats::Snapshot;

pub struct ControlSocket {
    listener: UnixListener,
}

impl ControlSocket {
    /// Binds `path`, removing a stale socket file left behind by a
    /// prior unclean shutdown first (a fresh `bind` otherwise fails
    /// with `AddrInUse`).
    pub fn bind(path: &Path) -> io::Result<Self> {
        if path.exists() {
            std::fs::remove_file(path)?;
        }
        let listener = UnixListener::bind(path)?;
        listener.set_nonblocking(true)?;
        Ok(Self { listener })
    }

    pub fn as_raw_fd(&self) -> std::os::unix::io::RawFd {
        std::os::unix::io::AsRawFd::as_raw_fd(&self.listener)
    }

    /// Accepts and serves every connection currently pending; never
    /// blocks. Call on readiness of [`ControlSocket::as_raw_fd`].
    pub fn service(&self, snapshot: &Snapshot) {
        loop {
            match self.listener.accept() {
                Ok((stream, _addr)) => write_snapshot(stream, snapshot),
                Err(e) if e.kind() == io::ErrorKind::WouldBlock => break,
                Err(_) => break,
            }
        }
    }
}

fn write_snapshot(mut stream: UnixStream, snapshot: &Snapshot) {
    if let Ok(json) = serde_json::to_vec(snapshot) {
        let _ = stream.write_all(&json);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Read;

    #[test]
    fn accepted_connection_receives_one_json_snapshot_then_closes() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("ctl.sock");
        let ctl = ControlSocket::bind(&path).unwrap();

        let mut snapshot = Snapshot::default();
        snapshot.buffer_high_water = 7;

        let connector_path = path.clone();
        let client = std::thread::spawn(move || {
            // The listener is nonblocking on the server side; give the
            // accept loop a moment to catch up rather than racing it.
            std::thread::sleep(std::time::Duration::from_millis(20));
            let mut stream = UnixStream::connect(&connector_path).unwrap();
            let mut buf = Vec::new();
            stream.read_to_end(&mut buf).unwrap();
            buf
        });

        std::thread::sleep(std::time::Duration::from_millis(40));
        ctl.service(&snapshot);

        let received = client.join().unwrap();
        let parsed: Snapshot = serde_json::from_slice(&received).unwrap();
        assert_eq!(parsed.buffer_high_water, 7);
    }

    #[test]
    fn bind_removes_stale_socket_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("ctl.sock");
        std::fs::write(&path, b"stale").unwrap();
        assert!(ControlSocket::bind(&path).is_ok());
    }
}
