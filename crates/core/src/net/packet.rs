// Bootcache - Checkpointed Guest Test Harness
// Copyright (C) 2026 Andrii Shylenko
//
// This software is released under the MIT License.
// See the LICENSE file in the project root for full license information.

use super::NetworkBackend;
use serde::Serialize;
use std::sync::{Arc, Mutex};

const ETHERTYPE_IPV4: u16 = 0x0800;
const ETHERTYPE_ARP: u16 = 0x0806;

const IP_PROTO_ICMP: u8 = 1;
const IP_PROTO_TCP: u8 = 6;
const IP_PROTO_UDP: u8 = 17;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum Direction {
    Sent,
    Received,
}

impl Direction {
    fn tag(&self) -> &'static str {
        match self {
            Direction::Sent => "TX",
            Direction::Received => "RX",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct PacketLogEntry {
    pub direction: Direction,
    pub summary: String,
}

/// Append-only log of frames seen by a [`LoggingBackend`]. Clones share the log.
#[derive(Debug, Clone, Default)]
pub struct PacketLog {
    entries: Arc<Mutex<Vec<PacketLogEntry>>>,
}

impl PacketLog {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, Vec<PacketLogEntry>> {
        self.entries
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    pub fn append(&self, direction: Direction, frame: &[u8]) {
        let summary = summarize_frame(frame, direction);
        tracing::debug!("{}", summary);
        self.lock().push(PacketLogEntry { direction, summary });
    }

    pub fn len(&self) -> usize {
        self.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.lock().is_empty()
    }

    pub fn entries(&self) -> Vec<PacketLogEntry> {
        self.lock().clone()
    }

    /// The last `n` entries, oldest first.
    pub fn tail(&self, n: usize) -> Vec<PacketLogEntry> {
        let entries = self.lock();
        entries[entries.len().saturating_sub(n)..].to_vec()
    }
}

/// Forwards every call to `inner` unchanged, recording each frame on the way.
pub struct LoggingBackend<B> {
    inner: B,
    log: PacketLog,
}

impl<B: NetworkBackend> LoggingBackend<B> {
    pub fn new(inner: B, log: PacketLog) -> Self {
        Self { inner, log }
    }
}

impl<B: NetworkBackend> NetworkBackend for LoggingBackend<B> {
    fn transmit(&mut self, frame: Vec<u8>) {
        self.log.append(Direction::Sent, &frame);
        self.inner.transmit(frame);
    }

    fn poll_receive(&mut self) -> Option<Vec<u8>> {
        let frame = self.inner.poll_receive()?;
        self.log.append(Direction::Received, &frame);
        Some(frame)
    }
}

fn be16(b: &[u8], off: usize) -> u16 {
    u16::from_be_bytes([b[off], b[off + 1]])
}

fn fmt_ip(b: &[u8], off: usize) -> String {
    format!("{}.{}.{}.{}", b[off], b[off + 1], b[off + 2], b[off + 3])
}

fn tcp_flags(flags: u8) -> String {
    let mut s = String::new();
    for (bit, c) in [(0x02, 'S'), (0x10, 'A'), (0x08, 'P'), (0x01, 'F'), (0x04, 'R')] {
        if flags & bit != 0 {
            s.push(c);
        }
    }
    s
}

/// One-line description of an Ethernet frame, e.g. `TX TCP 10.64.0.2:4000->1.2.3.4:443 [SA] 0B`.
pub fn summarize_frame(frame: &[u8], direction: Direction) -> String {
    let dir = direction.tag();
    let len = frame.len();
    if len < 14 {
        return format!("{dir} {len}B (runt)");
    }

    let ethertype = be16(frame, 12);
    if ethertype == ETHERTYPE_ARP {
        return format!("{dir} ARP {len}B");
    }
    if ethertype != ETHERTYPE_IPV4 {
        return format!("{dir} ether=0x{ethertype:04X} {len}B");
    }
    if len < 34 {
        return format!("{dir} IPv4 (short) {len}B");
    }

    let ip = &frame[14..];
    let ihl = ((ip[0] & 0x0F) as usize * 4).max(20);
    let proto = ip[9];
    let src = fmt_ip(ip, 12);
    let dst = fmt_ip(ip, 16);

    match proto {
        IP_PROTO_TCP if ip.len() >= ihl + 4 => {
            let sp = be16(ip, ihl);
            let dp = be16(ip, ihl + 2);
            let flags = ip.get(ihl + 13).copied().unwrap_or(0);
            let hdr_len = ip.get(ihl + 12).map(|b| (b >> 4) as usize * 4).unwrap_or(20);
            let payload = ip.len().saturating_sub(ihl + hdr_len);
            format!(
                "{dir} TCP {src}:{sp}->{dst}:{dp} [{}] {payload}B",
                tcp_flags(flags)
            )
        }
        IP_PROTO_UDP if ip.len() >= ihl + 4 => {
            let sp = be16(ip, ihl);
            let dp = be16(ip, ihl + 2);
            let payload = ip.len().saturating_sub(ihl + 8);
            format!("{dir} UDP {src}:{sp}->{dst}:{dp} {payload}B")
        }
        IP_PROTO_ICMP => {
            format!("{dir} ICMP {src}->{dst} {}B", ip.len().saturating_sub(ihl))
        }
        _ => format!("{dir} IP proto={proto} {src}->{dst} {}B", ip.len()),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::net::channel_pair;

    fn ipv4_frame(proto: u8, l4: &[u8]) -> Vec<u8> {
        let mut f = vec![0xFF; 6];
        f.extend_from_slice(&[2, 0, 0, 0, 0, 1]);
        f.extend_from_slice(&ETHERTYPE_IPV4.to_be_bytes());
        let total = 20 + l4.len();
        f.extend_from_slice(&[0x45, 0, (total >> 8) as u8, total as u8, 0, 0, 0, 0, 64, proto, 0, 0]);
        f.extend_from_slice(&[10, 64, 0, 2]);
        f.extend_from_slice(&[1, 2, 3, 4]);
        f.extend_from_slice(l4);
        f
    }

    #[test]
    fn test_summarize_runt_and_arp() {
        assert_eq!(summarize_frame(&[0; 10], Direction::Sent), "TX 10B (runt)");

        let mut arp = vec![0; 42];
        arp[12] = 0x08;
        arp[13] = 0x06;
        assert_eq!(summarize_frame(&arp, Direction::Received), "RX ARP 42B");

        let mut v6 = vec![0; 60];
        v6[12] = 0x86;
        v6[13] = 0xDD;
        assert_eq!(summarize_frame(&v6, Direction::Sent), "TX ether=0x86DD 60B");
    }

    #[test]
    fn test_summarize_tcp_flags_and_payload() {
        let mut tcp = vec![0u8; 20];
        tcp[0..2].copy_from_slice(&4000u16.to_be_bytes());
        tcp[2..4].copy_from_slice(&443u16.to_be_bytes());
        tcp[12] = 5 << 4;
        tcp[13] = 0x12; // SYN+ACK
        tcp.extend_from_slice(b"hello");
        let frame = ipv4_frame(IP_PROTO_TCP, &tcp);
        assert_eq!(
            summarize_frame(&frame, Direction::Sent),
            "TX TCP 10.64.0.2:4000->1.2.3.4:443 [SA] 5B"
        );
    }

    #[test]
    fn test_summarize_udp_icmp_and_fallback() {
        let mut udp = vec![0u8; 8];
        udp[0..2].copy_from_slice(&5353u16.to_be_bytes());
        udp[2..4].copy_from_slice(&53u16.to_be_bytes());
        udp.extend_from_slice(&[0; 12]);
        assert_eq!(
            summarize_frame(&ipv4_frame(IP_PROTO_UDP, &udp), Direction::Sent),
            "TX UDP 10.64.0.2:5353->1.2.3.4:53 12B"
        );

        assert_eq!(
            summarize_frame(&ipv4_frame(IP_PROTO_ICMP, &[8, 0, 0, 0, 0, 0, 0, 0]), Direction::Received),
            "RX ICMP 10.64.0.2->1.2.3.4 8B"
        );

        assert_eq!(
            summarize_frame(&ipv4_frame(47, &[0; 4]), Direction::Sent),
            "TX IP proto=47 10.64.0.2->1.2.3.4 24B"
        );

        let short = ipv4_frame(IP_PROTO_ICMP, &[])[..30].to_vec();
        assert_eq!(summarize_frame(&short, Direction::Sent), "TX IPv4 (short) 30B");
    }

    #[test]
    fn test_logging_backend_preserves_order() {
        let (guest, host) = channel_pair();
        let log = PacketLog::new();
        let mut backend = LoggingBackend::new(guest, log.clone());

        host.to_guest.send(vec![0; 5]).unwrap();
        host.to_guest.send(vec![0; 6]).unwrap();
        backend.transmit(vec![0; 7]);

        assert_eq!(backend.poll_receive(), Some(vec![0; 5]));
        assert_eq!(backend.poll_receive(), Some(vec![0; 6]));
        assert_eq!(backend.poll_receive(), None);
        assert_eq!(host.from_guest.try_recv().unwrap(), vec![0; 7]);

        let summaries: Vec<String> = log.entries().into_iter().map(|e| e.summary).collect();
        assert_eq!(summaries, vec!["TX 7B (runt)", "RX 5B (runt)", "RX 6B (runt)"]);
        assert_eq!(log.tail(1)[0].direction, Direction::Received);
    }
}
