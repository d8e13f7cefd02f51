//! Ingress and egress decision logic: deliver-to-TAP, unicast-forward,
//! broadcast fan-out, TTL decrement, source suppression.
//!
//! These functions are pure with respect to I/O: they consult the
//! [`PeerTable`] (and write to it on ingress) but never touch a socket or
//! the TAP handle directly. They return a list of [`Action`]s for the
//! caller (`Switch`) to execute, the same separation the teacher keeps
//! between `forwarding::pick_route`/`find_backend_config` (pure selection)
//! and `proxy::server` (the I/O that acts on the selection).

use std::net::SocketAddr;

use crate::mac::{parse_frame_macs, BROADCAST};
use crate::peer_table::{endpoints_equal, PeerTable};

/// Something the caller must do as a result of a forwarding decision.
#[derive(Debug, PartialEq, Eq)]
pub enum Action {
    /// Write `frame` to the local TAP device.
    WriteTap(Vec<u8>),
    /// Encode and send `frame` to `endpoint` with the given TTL.
    Send {
        frame: Vec<u8>,
        endpoint: SocketAddr,
        ttl: u8,
    },
}

pub struct ForwardingEngine {
    local_mac: u64,
    send_ttl: u8,
}

impl ForwardingEngine {
    pub fn new(local_mac: u64, send_ttl: u8) -> Self {
        Self {
            local_mac,
            send_ttl,
        }
    }

    /// Handles one decoded datagram arriving from the network.
    pub fn ingress(
        &self,
        peer_table: &PeerTable,
        frame: &[u8],
        src_endpoint: SocketAddr,
        ttl: u8,
        is_control: bool,
    ) -> Vec<Action> {
        let mut actions = Vec::new();
        let (dmac, smac) = parse_frame_macs(frame);

        // 2a: deliver to TAP (data frames only).
        if !is_control
            && (dmac == self.local_mac || dmac == BROADCAST)
            && smac != self.local_mac
            && frame.len() > 12
        {
            actions.push(Action::WriteTap(frame.to_vec()));
        }

        // 2b: learn the sender, regardless of is_control — control frames
        // participate in MAC learning even though they never reach TAP.
        if smac != BROADCAST && smac != self.local_mac {
            peer_table.learn(smac, src_endpoint, ttl);
        }

        // 3: forwarding decision, for well-formed frames only.
        if dmac == self.local_mac || ttl == 0 || frame.len() <= 12 {
            return actions;
        }

        if dmac != BROADCAST {
            let (next_ep, found) = peer_table.lookup(dmac);
            if found {
                actions.push(Action::Send {
                    frame: frame.to_vec(),
                    endpoint: next_ep,
                    ttl: ttl - 1,
                });
            }
        } else {
            actions.extend(self.broadcast_fanout(peer_table, frame, Some(src_endpoint), ttl));
        }

        actions
    }

    /// Fans `frame` out to every known peer, suppressing the source and
    /// de-duplicating destinations. Direct (P2P) peers get `ttl' = 0` so
    /// they deliver locally but never re-forward; the upstream/core bucket
    /// gets `ttl' = ttl - 1`.
    fn broadcast_fanout(
        &self,
        peer_table: &PeerTable,
        frame: &[u8],
        source_endpoint: Option<SocketAddr>,
        ttl: u8,
    ) -> Vec<Action> {
        let snapshot = peer_table.snapshot();
        let mut sent: Vec<SocketAddr> = Vec::new();
        let mut actions = Vec::new();

        for (mac, endpoint) in snapshot {
            if let Some(src) = source_endpoint {
                if endpoints_equal(endpoint, src) {
                    continue;
                }
            }
            if sent.iter().any(|s| endpoints_equal(*s, endpoint)) {
                continue;
            }

            let out_ttl = if mac == BROADCAST { ttl.saturating_sub(1) } else { 0 };
            actions.push(Action::Send {
                frame: frame.to_vec(),
                endpoint,
                ttl: out_ttl,
            });
            sent.push(endpoint);
        }

        actions
    }

    /// Handles one frame read from the local TAP device.
    pub fn egress(&self, peer_table: &PeerTable, frame: &[u8]) -> Vec<Action> {
        if frame.len() <= 12 {
            return Vec::new();
        }

        let (dmac, _smac) = parse_frame_macs(frame);
        let (next_ep, _found) = peer_table.lookup(dmac);

        if next_ep.port() != 0 {
            vec![Action::Send {
                frame: frame.to_vec(),
                endpoint: next_ep,
                ttl: self.send_ttl,
            }]
        } else if dmac == BROADCAST {
            self.broadcast_fanout(peer_table, frame, None, self.send_ttl)
        } else {
            Vec::new()
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::mac::pack;
    use std::net::{IpAddr, Ipv4Addr};

    fn addr(port: u16) -> SocketAddr {
        SocketAddr::new(IpAddr::V4(Ipv4Addr::new(127, 0, 0, 1)), port)
    }

    fn local_mac() -> u64 {
        pack([0x02, 0x00, 0x00, 0x00, 0x00, 0x01])
    }

    fn remote_mac(n: u8) -> u64 {
        pack([0x02, 0x00, 0x00, 0x00, 0x00, n])
    }

    fn frame(dmac: u64, smac: u64, payload_len: usize) -> Vec<u8> {
        let mut f = vec![0u8; 12 + payload_len];
        f[0..6].copy_from_slice(&crate::mac::unpack(dmac));
        f[6..12].copy_from_slice(&crate::mac::unpack(smac));
        f
    }

    #[test]
    fn ingress_delivers_to_tap_for_local_destination() {
        let table = PeerTable::new(addr(9001));
        let engine = ForwardingEngine::new(local_mac(), 8);
        let f = frame(local_mac(), remote_mac(2), 4);
        let actions = engine.ingress(&table, &f, addr(9002), 4, false);
        assert!(actions.contains(&Action::WriteTap(f.clone())));
    }

    #[test]
    fn ingress_does_not_deliver_degenerate_frame() {
        let table = PeerTable::new(addr(9001));
        let engine = ForwardingEngine::new(local_mac(), 8);
        let f = frame(local_mac(), remote_mac(2), 0); // exactly 12 bytes
        let actions = engine.ingress(&table, &f, addr(9002), 4, false);
        assert!(actions.is_empty());
        // smac still learned from a degenerate frame.
        assert!(table.lookup(remote_mac(2)).1);
    }

    #[test]
    fn ingress_learns_sender_mac_including_for_control_frames() {
        let table = PeerTable::new(addr(9001));
        let engine = ForwardingEngine::new(local_mac(), 8);
        let f = frame(0, remote_mac(2), 4);
        let actions = engine.ingress(&table, &f, addr(9002), 4, true);
        assert!(actions.iter().all(|a| !matches!(a, Action::WriteTap(_))));
        assert!(table.lookup(remote_mac(2)).1);
    }

    #[test]
    fn ingress_ignores_smac_equal_to_broadcast_or_local() {
        let table = PeerTable::new(addr(9001));
        let engine = ForwardingEngine::new(local_mac(), 8);
        let f = frame(remote_mac(3), crate::mac::BROADCAST, 4);
        engine.ingress(&table, &f, addr(9002), 4, false);
        assert!(!table.lookup(crate::mac::BROADCAST).1 || table.lookup(crate::mac::BROADCAST).0 == addr(9001));
    }

    #[test]
    fn ingress_forwards_unicast_when_destination_known() {
        let table = PeerTable::new(addr(9001));
        table.learn(remote_mac(2), addr(9002), 4);
        let engine = ForwardingEngine::new(local_mac(), 8);
        let f = frame(remote_mac(2), remote_mac(3), 4);
        let actions = engine.ingress(&table, &f, addr(9003), 4, false);
        assert_eq!(
            actions,
            vec![Action::Send {
                frame: f,
                endpoint: addr(9002),
                ttl: 3,
            }]
        );
    }

    #[test]
    fn ingress_does_not_forward_when_ttl_zero() {
        let table = PeerTable::new(addr(9001));
        table.learn(remote_mac(2), addr(9002), 4);
        let engine = ForwardingEngine::new(local_mac(), 8);
        let f = frame(remote_mac(2), remote_mac(3), 4);
        let actions = engine.ingress(&table, &f, addr(9003), 0, false);
        assert!(actions.iter().all(|a| !matches!(a, Action::Send { .. })));
    }

    #[test]
    fn ingress_does_not_forward_when_destination_is_local() {
        let table = PeerTable::new(addr(9001));
        let engine = ForwardingEngine::new(local_mac(), 8);
        let f = frame(local_mac(), remote_mac(3), 4);
        let actions = engine.ingress(&table, &f, addr(9003), 4, false);
        assert!(actions.iter().all(|a| !matches!(a, Action::Send { .. })));
    }

    #[test]
    fn broadcast_fanout_suppresses_source_and_dedupes() {
        let table = PeerTable::new(addr(9001));
        table.learn(remote_mac(2), addr(9002), 4);
        table.learn(remote_mac(3), addr(9002), 4); // same endpoint as mac(2): deduped
        table.learn(remote_mac(4), addr(9004), 4);
        let engine = ForwardingEngine::new(local_mac(), 8);
        let f = frame(crate::mac::BROADCAST, remote_mac(5), 4);

        // Source endpoint is addr(9004): that peer is suppressed.
        let actions = engine.ingress(&table, &f, addr(9004), 4, false);
        let endpoints: Vec<SocketAddr> = actions
            .iter()
            .filter_map(|a| match a {
                Action::Send { endpoint, .. } => Some(*endpoint),
                _ => None,
            })
            .collect();
        assert!(!endpoints.contains(&addr(9004)));
        assert_eq!(endpoints.iter().filter(|e| **e == addr(9002)).count(), 1);
    }

    #[test]
    fn broadcast_fanout_uses_ttl_minus_one_for_core_and_zero_for_p2p() {
        let table = PeerTable::new(addr(9001)); // BROADCAST bucket = core
        table.learn(remote_mac(2), addr(9002), 4); // a direct P2P peer
        let engine = ForwardingEngine::new(local_mac(), 8);
        let f = frame(crate::mac::BROADCAST, remote_mac(5), 4);
        let actions = engine.ingress(&table, &f, addr(9999), 4, false);

        for action in actions {
            if let Action::Send { endpoint, ttl, .. } = action {
                if endpoint == addr(9001) {
                    assert_eq!(ttl, 3);
                } else if endpoint == addr(9002) {
                    assert_eq!(ttl, 0);
                }
            }
        }
    }

    #[test]
    fn egress_sends_unicast_when_route_known() {
        let table = PeerTable::new(addr(9001));
        table.learn(remote_mac(2), addr(9002), 4);
        let engine = ForwardingEngine::new(local_mac(), 8);
        let f = frame(remote_mac(2), local_mac(), 4);
        let actions = engine.egress(&table, &f);
        assert_eq!(
            actions,
            vec![Action::Send {
                frame: f,
                endpoint: addr(9002),
                ttl: 8,
            }]
        );
    }

    #[test]
    fn egress_sends_to_core_for_broadcast_when_core_configured() {
        let table = PeerTable::new(addr(9001));
        let engine = ForwardingEngine::new(local_mac(), 8);
        let f = frame(crate::mac::BROADCAST, local_mac(), 4);
        let actions = engine.egress(&table, &f);
        assert_eq!(
            actions,
            vec![Action::Send {
                frame: f,
                endpoint: addr(9001),
                ttl: 8,
            }]
        );
    }

    #[test]
    fn egress_fans_out_broadcast_when_no_core_configured() {
        let table = PeerTable::new(crate::peer_table::unset_endpoint());
        table.learn(remote_mac(2), addr(9002), 4);
        table.learn(remote_mac(3), addr(9003), 4);
        let engine = ForwardingEngine::new(local_mac(), 8);
        let f = frame(crate::mac::BROADCAST, local_mac(), 4);
        let actions = engine.egress(&table, &f);
        assert_eq!(actions.len(), 2);
        assert!(actions
            .iter()
            .all(|a| matches!(a, Action::Send { ttl: 0, .. })));
    }

    #[test]
    fn egress_drops_when_unknown_unicast_destination() {
        let table = PeerTable::new(crate::peer_table::unset_endpoint());
        let engine = ForwardingEngine::new(local_mac(), 8);
        let f = frame(remote_mac(9), local_mac(), 4);
        let actions = engine.egress(&table, &f);
        assert!(actions.is_empty());
    }

    #[test]
    fn egress_drops_degenerate_frame() {
        let table = PeerTable::new(addr(9001));
        let engine = ForwardingEngine::new(local_mac(), 8);
        let f = frame(remote_mac(9), local_mac(), 0);
        let actions = engine.egress(&table, &f);
        assert!(actions.is_empty());
    }
}
