//! Sorted, fixed-capacity MAC address set with O(log n) membership.
//!
//! Entries are ordered by the 6-byte MAC left-aligned into a zero-padded
//! `u64` (big-endian), compared as a plain integer rather than a byte
//! slice.

/// Upper bound on ACL membership: small cardinalities only, by design.
pub const MAX_ACL_LEN: usize = 64;

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct MacAddr(pub [u8; 6]);

impl MacAddr {
    pub const BROADCAST: MacAddr = MacAddr([0xff; 6]);

    fn padded(self) -> u64 {
        let mut buf = [0u8; 8];
        buf[..6].copy_from_slice(&self.0);
        u64::from_be_bytes(buf)
    }

    pub fn is_broadcast(self) -> bool {
        self == Self::BROADCAST
    }

    pub fn is_multicast(self) -> bool {
        self.0[0] & 0x01 != 0
    }
}

impl std::fmt::Display for MacAddr {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let [a, b, c, d, e, g] = self.0;
        write!(f, "{a:02x}:{b:02x}:{c:02x}:{d:02x}:{e:02x}:{g:02x}")
    }
}

#[derive(Debug, Clone, Default)]
pub struct AclMap {
    entries: smallvec::SmallVec<[u64; 8]>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, thiserror::Error)]
#[error("ACL table full")]
pub struct AclFull;

impl AclMap {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Insert `addr`, preserving sort order. Idempotent on duplicate
    /// insert. Fails with [`AclFull`] only once the duplicate check has
    /// already established that this would be a genuinely new entry —
    /// re-adding an existing member never fails even at capacity.
    pub fn add(&mut self, addr: MacAddr) -> Result<(), AclFull> {
        let key = addr.padded();
        let pos = self.entries.partition_point(|&e| e < key);

        if pos < self.entries.len() && self.entries[pos] == key {
            return Ok(());
        }

        if self.entries.len() >= MAX_ACL_LEN {
            return Err(AclFull);
        }

        self.entries.insert(pos, key);
        Ok(())
    }

    /// Remove `addr`. No-op if absent.
    pub fn remove(&mut self, addr: MacAddr) {
        let key = addr.padded();
        if let Ok(pos) = self.entries.binary_search(&key) {
            self.entries.remove(pos);
        }
    }

    /// Binary-search membership test.
    pub fn contains(&self, addr: MacAddr) -> bool {
        self.entries.binary_search(&addr.padded()).is_ok()
    }

    /// Iterates members in ascending order, for mask-command
    /// introspection (the AoE mask-command's read-only enumeration).
    pub fn iter(&self) -> impl Iterator<Item = MacAddr> + '_ {
        self.entries
            .iter()
            .map(|&key| MacAddr(key.to_be_bytes()[..6].try_into().unwrap()))
    }

    /// Merge every member of `other` into `self`, stopping at the first
    /// `AclFull`.
    pub fn extend_from(&mut self, other: &AclMap) -> Result<(), AclFull> {
        for &key in &other.entries {
            let addr = MacAddr(key.to_be_bytes()[..6].try_into().unwrap());
            self.add(addr)?;
        }
        Ok(())
    }

    #[cfg(test)]
    fn is_sorted(&self) -> bool {
        self.entries.windows(2).all(|w| w[0] < w[1])
    }
}

/// Admission policy for a device: deny wins over accept.
#[derive(Debug, Clone, Default)]
pub struct AclPolicy {
    pub accept: Option<AclMap>,
    pub deny: Option<AclMap>,
}

impl AclPolicy {
    /// `true` if `addr` is allowed to address this device.
    pub fn admits(&self, addr: MacAddr) -> bool {
        if let Some(deny) = &self.deny {
            if deny.contains(addr) {
                return false;
            }
        }
        if let Some(accept) = &self.accept {
            return accept.contains(addr);
        }
        true
    }
}
