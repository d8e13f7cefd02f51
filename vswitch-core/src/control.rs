//! Control-plane protocol layered on the same datagram stream as data
//! frames: peer discovery, peer-info exchange, and the minimal keep-alive/
//! punch frame.
//!
//! A control frame looks exactly like an Ethernet frame with
//! `dmac = 00:00:00:00:00:00`; its payload (bytes 12..) is
//! `"<PREFIX><verb>,<arg>,..."`. The prefix is pinned to `TVS_`, matching
//! the original implementation's `TVS_CMD_PREFIX` (see `DESIGN.md`, Open
//! Question on the control prefix).

use std::net::IpAddr;

use crate::mac;

pub const CONTROL_PREFIX: &str = "TVS_";

/// Datagrams larger than this are split across multiple `ReQueryPeers`
/// frames, each a fresh buffer (never a reused/extended one — see
/// `DESIGN.md` on the splitter's fresh-buffer-per-datagram behavior).
const MAX_REQUERY_PEERS_BYTES: usize = 1000;

#[derive(Debug, Clone, PartialEq)]
pub enum ControlMessage {
    QueryPeers,
    ReQueryPeers(Vec<(u64, IpAddr, u16)>),
    QueryPeerInfo,
    ReQueryPeerInfo { local_ip: IpAddr, local_mac: u64 },
}

/// True iff the decoded frame's bytes 12.. begin with [`CONTROL_PREFIX`].
/// This is the `is_control` flag the forwarding engine receives.
pub fn is_control_frame(frame: &[u8]) -> bool {
    frame.len() >= 12 + CONTROL_PREFIX.len() && &frame[12..12 + CONTROL_PREFIX.len()] == CONTROL_PREFIX.as_bytes()
}

/// Parses the payload of a control frame. Returns `None` on any malformed
/// payload; the caller logs a warning and drops the frame.
pub fn parse_payload(frame: &[u8]) -> Option<ControlMessage> {
    if !is_control_frame(frame) {
        return None;
    }
    let payload = std::str::from_utf8(&frame[12..]).ok()?;
    let rest = payload.strip_prefix(CONTROL_PREFIX)?;
    let mut parts = rest.split(',');
    let verb = parts.next()?;

    match verb {
        "QueryPeers" => Some(ControlMessage::QueryPeers),
        "QueryPeerInfo" => Some(ControlMessage::QueryPeerInfo),
        "ReQueryPeers" => {
            let mut peers = Vec::new();
            for triple in parts {
                if triple.is_empty() {
                    continue;
                }
                let fields: Vec<&str> = triple.splitn(3, '-').collect();
                if fields.len() != 3 {
                    return None;
                }
                let mac_key = mac::parse(fields[0])?;
                let ip: IpAddr = fields[1].parse().ok()?;
                let port: u16 = fields[2].parse().ok()?;
                peers.push((mac_key, ip, port));
            }
            Some(ControlMessage::ReQueryPeers(peers))
        }
        "ReQueryPeerInfo" => {
            let ip: IpAddr = parts.next()?.parse().ok()?;
            let local_mac = mac::parse(parts.next()?)?;
            Some(ControlMessage::ReQueryPeerInfo { local_ip: ip, local_mac })
        }
        _ => None,
    }
}

fn build_frame(dmac: u64, smac: u64, payload: &str) -> Vec<u8> {
    let mut frame = Vec::with_capacity(12 + payload.len());
    frame.extend_from_slice(&mac::unpack(dmac));
    frame.extend_from_slice(&mac::unpack(smac));
    frame.extend_from_slice(payload.as_bytes());
    frame
}

pub fn build_query_peers(local_mac: u64) -> Vec<u8> {
    build_frame(mac::ZERO, local_mac, &format!("{CONTROL_PREFIX}QueryPeers,"))
}

pub fn build_query_peer_info(local_mac: u64) -> Vec<u8> {
    build_frame(mac::ZERO, local_mac, &format!("{CONTROL_PREFIX}QueryPeerInfo,"))
}

pub fn build_requery_peer_info(local_mac: u64, local_ip: IpAddr) -> Vec<u8> {
    build_frame(
        mac::ZERO,
        local_mac,
        &format!(
            "{CONTROL_PREFIX}ReQueryPeerInfo,{local_ip},{}",
            mac::to_string(local_mac)
        ),
    )
}

/// Splits `peers` into one or more `ReQueryPeers` datagrams, never letting
/// any single one exceed [`MAX_REQUERY_PEERS_BYTES`]. Each datagram is
/// built fresh (no shared/extended buffer across datagrams).
pub fn build_requery_peers(local_mac: u64, peers: &[(u64, IpAddr, u16)]) -> Vec<Vec<u8>> {
    let verb = format!("{CONTROL_PREFIX}ReQueryPeers,");
    let mut datagrams = Vec::new();
    let mut current = verb.clone();
    let mut has_entry = false;

    for (mac_key, ip, port) in peers {
        let triple = format!("{}-{}-{}", mac::to_string(*mac_key), ip, port);
        let sep_len = if has_entry { 1 } else { 0 };
        if has_entry && current.len() + sep_len + triple.len() > MAX_REQUERY_PEERS_BYTES {
            datagrams.push(build_frame(mac::ZERO, local_mac, &current));
            current = verb.clone();
            has_entry = false;
        }
        if has_entry {
            current.push(',');
        }
        current.push_str(&triple);
        has_entry = true;
    }

    datagrams.push(build_frame(mac::ZERO, local_mac, &current));
    datagrams
}

/// Minimal 12-byte keep-alive/punch frame: just the Ethernet header, no
/// EtherType or payload. Sent with `ttl = 0`.
pub fn build_keepalive(dmac: u64, smac: u64) -> Vec<u8> {
    build_frame(dmac, smac, "")
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::net::Ipv4Addr;

    fn a_mac(n: u8) -> u64 {
        mac::pack([0x02, 0x00, 0x00, 0x00, 0x00, n])
    }

    #[test]
    fn is_control_frame_detects_prefix() {
        let f = build_query_peers(a_mac(1));
        assert!(is_control_frame(&f));
        let data = vec![0u8; 20];
        assert!(!is_control_frame(&data));
    }

    #[test]
    fn query_peers_roundtrips() {
        let f = build_query_peers(a_mac(1));
        assert_eq!(parse_payload(&f), Some(ControlMessage::QueryPeers));
    }

    #[test]
    fn query_peer_info_roundtrips() {
        let f = build_query_peer_info(a_mac(1));
        assert_eq!(parse_payload(&f), Some(ControlMessage::QueryPeerInfo));
    }

    #[test]
    fn requery_peer_info_roundtrips() {
        let ip = IpAddr::V4(Ipv4Addr::new(10, 0, 0, 5));
        let f = build_requery_peer_info(a_mac(1), ip);
        assert_eq!(
            parse_payload(&f),
            Some(ControlMessage::ReQueryPeerInfo {
                local_ip: ip,
                local_mac: a_mac(1),
            })
        );
    }

    #[test]
    fn requery_peers_roundtrips_single_datagram() {
        let peers = vec![
            (a_mac(2), IpAddr::V4(Ipv4Addr::new(127, 0, 0, 1)), 9002u16),
            (a_mac(3), IpAddr::V4(Ipv4Addr::new(127, 0, 0, 1)), 9003u16),
        ];
        let datagrams = build_requery_peers(a_mac(1), &peers);
        assert_eq!(datagrams.len(), 1);
        match parse_payload(&datagrams[0]) {
            Some(ControlMessage::ReQueryPeers(parsed)) => assert_eq!(parsed, peers),
            other => panic!("unexpected: {other:?}"),
        }
    }

    #[test]
    fn requery_peers_splits_past_byte_budget() {
        let peers: Vec<(u64, IpAddr, u16)> = (0..200u8)
            .map(|n| {
                (
                    a_mac(if n == 0 { 1 } else { n }),
                    IpAddr::V4(Ipv4Addr::new(10, 0, 0, n)),
                    9000 + n as u16,
                )
            })
            .collect();
        let datagrams = build_requery_peers(a_mac(1), &peers);
        assert!(datagrams.len() > 1);
        for d in &datagrams {
            assert!(d.len() - 12 <= MAX_REQUERY_PEERS_BYTES + 64);
        }
        let mut recovered = Vec::new();
        for d in &datagrams {
            if let Some(ControlMessage::ReQueryPeers(chunk)) = parse_payload(d) {
                recovered.extend(chunk);
            } else {
                panic!("chunk failed to parse");
            }
        }
        assert_eq!(recovered, peers);
    }

    #[test]
    fn empty_peer_list_yields_bare_verb_datagram() {
        let datagrams = build_requery_peers(a_mac(1), &[]);
        assert_eq!(datagrams.len(), 1);
        assert_eq!(
            parse_payload(&datagrams[0]),
            Some(ControlMessage::ReQueryPeers(vec![]))
        );
    }

    #[test]
    fn keepalive_is_exactly_twelve_bytes() {
        let f = build_keepalive(a_mac(2), a_mac(1));
        assert_eq!(f.len(), 12);
    }

    #[test]
    fn malformed_payload_is_rejected_not_panicking() {
        let mut f = vec![0u8; 12];
        f.extend_from_slice(b"TVS_NotAVerb,garbage");
        assert_eq!(parse_payload(&f), None);

        let mut bad_triple = vec![0u8; 12];
        bad_triple.extend_from_slice(b"TVS_ReQueryPeers,not-a-valid-triple-at-all");
        assert_eq!(parse_payload(&bad_triple), None);
    }
}
