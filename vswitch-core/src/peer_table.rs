//! Concurrent, time-aged MAC -> peer endpoint map.
//!
//! This is the single shared mutable structure in the whole switch: every
//! ingress datagram writes to it, every egress decision reads from it. The
//! lock is held only across a hash-map probe, a few field writes, or a
//! snapshot copy — never across a `.await` or a callback invocation.

use std::collections::HashMap;
use std::net::{IpAddr, Ipv6Addr, SocketAddr};
use std::sync::Mutex;
use std::time::{Duration, Instant};

use crate::mac::BROADCAST;

/// Entries older than this (relative to their `last_seen`) are evicted by
/// the periodic sweep.
pub const PEER_TTL: Duration = Duration::from_secs(20);

/// Value stored per MAC.
#[derive(Debug, Clone)]
pub struct PeerRecord {
    pub endpoint: SocketAddr,
    pub observed_ttl: u8,
    pub last_seen: Instant,
}

/// Normalizes a [`SocketAddr`] so that an IPv4 address and its
/// IPv4-mapped-into-IPv6 equivalent compare equal, as required by the
/// peer-endpoint equality rule.
fn normalize(addr: SocketAddr) -> (IpAddr, u16) {
    match addr {
        SocketAddr::V6(v6) => {
            if let Some(v4) = v6.ip().to_ipv4_mapped() {
                (IpAddr::V4(v4), v6.port())
            } else {
                (IpAddr::V6(*v6.ip()), v6.port())
            }
        }
        SocketAddr::V4(v4) => (IpAddr::V4(*v4.ip()), v4.port()),
    }
}

pub fn endpoints_equal(a: SocketAddr, b: SocketAddr) -> bool {
    normalize(a) == normalize(b)
}

/// Unroutable placeholder used for the pre-seeded `BROADCAST` entry before
/// a real core endpoint has been configured.
pub fn unset_endpoint() -> SocketAddr {
    SocketAddr::new(IpAddr::V6(Ipv6Addr::UNSPECIFIED), 0)
}

pub struct PeerTable {
    inner: Mutex<HashMap<u64, PeerRecord>>,
}

impl PeerTable {
    /// Creates a table pre-seeded with the `BROADCAST` bucket pointing at
    /// `core_endpoint` (the configured upstream peer).
    pub fn new(core_endpoint: SocketAddr) -> Self {
        let mut map = HashMap::new();
        map.insert(
            BROADCAST,
            PeerRecord {
                endpoint: core_endpoint,
                observed_ttl: u8::MAX,
                last_seen: Instant::now(),
            },
        );
        Self {
            inner: Mutex::new(map),
        }
    }

    /// Write path on ingress. See `spec.md` §4.B for the exact rule.
    pub fn learn(&self, mac: u64, endpoint: SocketAddr, observed_ttl: u8) {
        let mut map = self.inner.lock().expect("peer table lock poisoned");
        match map.get_mut(&mac) {
            None => {
                map.insert(
                    mac,
                    PeerRecord {
                        endpoint,
                        observed_ttl,
                        last_seen: Instant::now(),
                    },
                );
            }
            Some(record) => {
                if endpoints_equal(record.endpoint, endpoint) {
                    record.last_seen = Instant::now();
                } else if observed_ttl >= record.observed_ttl {
                    record.endpoint = endpoint;
                    record.observed_ttl = observed_ttl;
                    record.last_seen = Instant::now();
                }
                // Otherwise: a farther-hop observation for an already-closer
                // peer. Reject silently (logged by the caller at debug level).
            }
        }
    }

    /// Read path on egress. Returns the `BROADCAST` bucket's endpoint when
    /// `mac` is unknown, so a caller that ignores `found` routes upstream.
    pub fn lookup(&self, mac: u64) -> (SocketAddr, bool) {
        let map = self.inner.lock().expect("peer table lock poisoned");
        match map.get(&mac) {
            Some(record) => (record.endpoint, true),
            None => {
                let broadcast_endpoint = map
                    .get(&BROADCAST)
                    .map(|r| r.endpoint)
                    .unwrap_or_else(unset_endpoint);
                (broadcast_endpoint, false)
            }
        }
    }

    /// Snapshots `(mac, endpoint)` pairs under the lock, then releases it
    /// before the caller does anything with the snapshot (never send
    /// under the lock).
    pub fn snapshot(&self) -> Vec<(u64, SocketAddr)> {
        let map = self.inner.lock().expect("peer table lock poisoned");
        map.iter().map(|(mac, rec)| (*mac, rec.endpoint)).collect()
    }

    pub fn remove(&self, mac: u64) {
        let mut map = self.inner.lock().expect("peer table lock poisoned");
        map.remove(&mac);
    }

    /// Evicts every non-`BROADCAST` entry whose `last_seen` predates
    /// `now - PEER_TTL`. Returns the evicted MACs (for logging).
    pub fn sweep_expired(&self) -> Vec<u64> {
        let now = Instant::now();
        let mut map = self.inner.lock().expect("peer table lock poisoned");
        let expired: Vec<u64> = map
            .iter()
            .filter(|(mac, rec)| **mac != BROADCAST && now.duration_since(rec.last_seen) > PEER_TTL)
            .map(|(mac, _)| *mac)
            .collect();
        for mac in &expired {
            map.remove(mac);
        }
        expired
    }

    #[cfg(test)]
    pub fn observed_ttl_of(&self, mac: u64) -> Option<u8> {
        self.inner
            .lock()
            .expect("peer table lock poisoned")
            .get(&mac)
            .map(|r| r.observed_ttl)
    }
}
