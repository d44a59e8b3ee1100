//! Active RTT probing with ICMP echo requests.

use std::{
    io,
    net::{IpAddr, SocketAddr},
    sync::atomic::{AtomicU16, Ordering},
    time::Duration,
};

use async_trait::async_trait;
use pnet::packet::{
    icmp::{
        echo_reply::EchoReplyPacket, echo_request::MutableEchoRequestPacket, IcmpTypes,
    },
    ipv4::Ipv4Packet,
    util::checksum,
};
use socket2::{Domain, Protocol, Socket, Type};
use tokio::{net::UdpSocket, time::Instant};

/// Size of the ICMP echo header.
const ECHO_HEADER_LEN: usize = 8;
/// Default number of payload bytes, as sent by `ping`.
pub const DEFAULT_PAYLOAD_SIZE: usize = 56;

const ICMPV6_ECHO_REQUEST: u8 = 128;
const ICMPV6_ECHO_REPLY: u8 = 129;

#[derive(Debug, thiserror::Error)]
pub enum ProbeError {
    #[error("io error: {0}")]
    Io(#[from] io::Error),
    #[error("no reply within {0:?}")]
    Timeout(Duration),
}

/// Measures the round-trip time to a remote address.
#[async_trait]
pub trait Prober: Send + Sync + 'static {
    /// Sends one probe to `addr` and waits at most `timeout` for the answer.
    async fn probe(&self, addr: IpAddr, timeout: Duration) -> Result<Duration, ProbeError>;
}

/// [`Prober`] sending ICMP echo requests.
///
/// Uses an unprivileged datagram ICMP socket when the host allows it, and a raw socket
/// otherwise. Every probe opens its own socket, so concurrent probes never steal each other's
/// replies; sequence numbers are shared so replies on raw sockets can still be told apart.
#[derive(Debug)]
pub struct IcmpProber {
    payload_size: usize,
    identifier: u16,
    seq: AtomicU16,
}

impl IcmpProber {
    pub fn new(payload_size: usize) -> Self {
        Self { payload_size, identifier: std::process::id() as u16, seq: AtomicU16::new(0) }
    }

    fn open(addr: IpAddr) -> io::Result<(UdpSocket, bool)> {
        let (domain, protocol) = match addr {
            IpAddr::V4(_) => (Domain::IPV4, Protocol::ICMPV4),
            IpAddr::V6(_) => (Domain::IPV6, Protocol::ICMPV6),
        };

        let (socket, raw) = match Socket::new(domain, Type::DGRAM, Some(protocol)) {
            Ok(socket) => (socket, false),
            Err(e) if e.kind() == io::ErrorKind::PermissionDenied => {
                tracing::trace!("datagram icmp sockets not permitted, using a raw socket");
                (Socket::new(domain, Type::RAW, Some(protocol))?, true)
            }
            Err(e) => return Err(e),
        };

        socket.set_nonblocking(true)?;
        let socket = UdpSocket::from_std(socket.into())?;

        Ok((socket, raw))
    }
}

impl Default for IcmpProber {
    fn default() -> Self {
        Self::new(DEFAULT_PAYLOAD_SIZE)
    }
}

#[async_trait]
impl Prober for IcmpProber {
    async fn probe(&self, addr: IpAddr, timeout: Duration) -> Result<Duration, ProbeError> {
        let (socket, raw) = Self::open(addr)?;
        let seq = self.seq.fetch_add(1, Ordering::Relaxed);

        let request = match addr {
            IpAddr::V4(_) => echo_request_v4(self.identifier, seq, self.payload_size),
            IpAddr::V6(_) => echo_request_v6(self.identifier, seq, self.payload_size),
        };

        let sent = Instant::now();
        let deadline = sent + timeout;
        socket.send_to(&request, SocketAddr::new(addr, 0)).await?;

        let mut buf = vec![0u8; self.payload_size + ECHO_HEADER_LEN + 128];
        loop {
            let received = tokio::time::timeout_at(deadline, socket.recv_from(&mut buf)).await;
            let (len, from) = match received {
                Ok(res) => res?,
                Err(_) => return Err(ProbeError::Timeout(timeout)),
            };

            if from.ip() != addr {
                continue;
            }

            let Some(reply) = parse_reply(&buf[..len], addr.is_ipv6()) else {
                continue;
            };

            // Datagram sockets get their identifier rewritten by the kernel.
            if reply.seq == seq && (!raw || reply.identifier == self.identifier) {
                return Ok(sent.elapsed());
            }
        }
    }
}

fn payload_pattern(buf: &mut [u8]) {
    for (i, b) in buf.iter_mut().enumerate() {
        *b = i as u8;
    }
}

fn echo_request_v4(identifier: u16, seq: u16, payload_size: usize) -> Vec<u8> {
    let mut buf = vec![0u8; ECHO_HEADER_LEN + payload_size];
    payload_pattern(&mut buf[ECHO_HEADER_LEN..]);

    if let Some(mut packet) = MutableEchoRequestPacket::new(&mut buf) {
        packet.set_icmp_type(IcmpTypes::EchoRequest);
        packet.set_identifier(identifier);
        packet.set_sequence_number(seq);
    }

    let sum = checksum(&buf, 1);
    if let Some(mut packet) = MutableEchoRequestPacket::new(&mut buf) {
        packet.set_checksum(sum);
    }

    buf
}

/// The kernel fills in the ICMPv6 checksum, it needs the pseudo header.
fn echo_request_v6(identifier: u16, seq: u16, payload_size: usize) -> Vec<u8> {
    let mut buf = vec![0u8; ECHO_HEADER_LEN + payload_size];
    buf[0] = ICMPV6_ECHO_REQUEST;
    buf[4..6].copy_from_slice(&identifier.to_be_bytes());
    buf[6..8].copy_from_slice(&seq.to_be_bytes());
    payload_pattern(&mut buf[ECHO_HEADER_LEN..]);
    buf
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
struct EchoReply {
    identifier: u16,
    seq: u16,
}

/// Decodes an echo reply. IPv4 raw sockets deliver the IP header in front of the ICMP message.
fn parse_reply(buf: &[u8], ipv6: bool) -> Option<EchoReply> {
    if ipv6 {
        if buf.len() < ECHO_HEADER_LEN || buf[0] != ICMPV6_ECHO_REPLY {
            return None;
        }
        return Some(EchoReply {
            identifier: u16::from_be_bytes([buf[4], buf[5]]),
            seq: u16::from_be_bytes([buf[6], buf[7]]),
        });
    }

    let icmp = if buf.first()? >> 4 == 4 {
        let header_len = Ipv4Packet::new(buf)?.get_header_length() as usize * 4;
        buf.get(header_len..)?
    } else {
        buf
    };

    let reply = EchoReplyPacket::new(icmp)?;
    if reply.get_icmp_type() != IcmpTypes::EchoReply {
        return None;
    }

    Some(EchoReply { identifier: reply.get_identifier(), seq: reply.get_sequence_number() })
}

#[cfg(any(test, feature = "test-utils"))]
pub use scripted::ScriptedProber;

#[cfg(any(test, feature = "test-utils"))]
mod scripted {
    use std::{net::IpAddr, time::Duration};

    use async_trait::async_trait;
    use parking_lot::Mutex;
    use rustc_hash::FxHashMap;

    use super::{ProbeError, Prober};

    /// A [`Prober`] answering from a table. Unknown addresses time out.
    #[derive(Debug, Default)]
    pub struct ScriptedProber {
        rtts: Mutex<FxHashMap<IpAddr, Duration>>,
        probes: Mutex<Vec<IpAddr>>,
    }

    impl ScriptedProber {
        pub fn new() -> Self {
            Self::default()
        }

        pub fn reply(&self, addr: IpAddr, rtt: Duration) {
            self.rtts.lock().insert(addr, rtt);
        }

        pub fn drop_replies(&self, addr: IpAddr) {
            self.rtts.lock().remove(&addr);
        }

        /// Addresses probed so far, in order.
        pub fn probes(&self) -> Vec<IpAddr> {
            self.probes.lock().clone()
        }
    }

    #[async_trait]
    impl Prober for ScriptedProber {
        async fn probe(&self, addr: IpAddr, timeout: Duration) -> Result<Duration, ProbeError> {
            self.probes.lock().push(addr);
            let rtt = self.rtts.lock().get(&addr).copied();
            rtt.ok_or(ProbeError::Timeout(timeout))
        }
    }
}

#[cfg(test)]
mod tests {
    use pnet::packet::icmp::{self, IcmpPacket};

    use super::*;

    #[test]
    fn v4_request_is_well_formed() {
        let buf = echo_request_v4(0x1234, 7, DEFAULT_PAYLOAD_SIZE);
        assert_eq!(buf.len(), 64);

        let packet = IcmpPacket::new(&buf).unwrap();
        assert_eq!(packet.get_icmp_type(), IcmpTypes::EchoRequest);
        assert_eq!(packet.get_checksum(), icmp::checksum(&packet));
    }

    #[test]
    fn requests_are_not_replies() {
        assert_eq!(parse_reply(&echo_request_v4(1, 2, 8), false), None);
        assert_eq!(parse_reply(&echo_request_v6(1, 2, 8), true), None);
    }

    #[test]
    fn parses_datagram_reply() {
        let mut buf = echo_request_v4(0x1234, 7, 16);
        buf[0] = 0; // echo reply

        assert_eq!(parse_reply(&buf, false), Some(EchoReply { identifier: 0x1234, seq: 7 }));
    }

    #[test]
    fn parses_raw_reply_behind_ip_header() {
        let mut icmp = echo_request_v4(0x1234, 9, 16);
        icmp[0] = 0;

        let mut buf = vec![0u8; 20];
        buf[0] = 0x45;
        buf.extend_from_slice(&icmp);

        assert_eq!(parse_reply(&buf, false), Some(EchoReply { identifier: 0x1234, seq: 9 }));
    }

    #[test]
    fn parses_v6_reply() {
        let mut buf = echo_request_v6(0xbeef, 3, 0);
        buf[0] = ICMPV6_ECHO_REPLY;

        assert_eq!(parse_reply(&buf, true), Some(EchoReply { identifier: 0xbeef, seq: 3 }));
        assert_eq!(parse_reply(&buf[..4], true), None);
    }

    #[tokio::test]
    async fn scripted_prober_times_out_unknown_addresses() {
        let prober = ScriptedProber::new();
        let known: IpAddr = "10.0.0.1".parse().unwrap();
        let unknown: IpAddr = "10.0.0.2".parse().unwrap();
        prober.reply(known, Duration::from_millis(3));

        let rtt = prober.probe(known, Duration::from_secs(1)).await.unwrap();
        assert_eq!(rtt, Duration::from_millis(3));
        assert!(matches!(
            prober.probe(unknown, Duration::from_secs(1)).await,
            Err(ProbeError::Timeout(_))
        ));
        assert_eq!(prober.probes(), vec![known, unknown]);
    }
}
