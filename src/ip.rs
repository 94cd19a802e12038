use std::io::{Cursor, Write};
use std::net::Ipv4Addr;

use etherparse::{Ipv4Header, Ipv4HeaderSlice};
use log::{debug, trace};

use crate::icmp;
use crate::serial::Serial;
use crate::slip::{Slip, MTU};
use crate::tcp::{App, Tcp};

pub const PROTO_ICMP: u8 = 1;
pub const PROTO_TCP: u8 = 6;
pub const PROTO_UDP: u8 = 17;

const TTL: u8 = 64;

/// Local interface state: the address inbound datagrams must carry, and the
/// identification counter stamped on outbound headers.
pub struct Ip {
    addr: Ipv4Addr,
    ident: u16,
}

impl Ip {
    pub fn new(addr: Ipv4Addr) -> Self {
        Ip {
            addr,
            ident: rand::random(),
        }
    }

    pub fn addr(&self) -> Ipv4Addr {
        self.addr
    }

    /// Build a 20-byte header around `payload` and hand the datagram to the
    /// framer. No options, no fragmentation.
    pub fn send<S: Serial>(
        &mut self,
        slip: &mut Slip<S>,
        dst: Ipv4Addr,
        protocol: u8,
        payload: &[u8],
    ) {
        let mut header = Ipv4Header::new(
            payload.len() as u16,
            TTL,
            protocol,
            self.addr.octets(),
            dst.octets(),
        );
        header.identification = self.ident;
        self.ident = self.ident.wrapping_add(1);

        let mut cursor = Cursor::new([0u8; MTU]);
        header.write(&mut cursor).unwrap();
        cursor.write_all(payload).unwrap();

        let len = cursor.position() as usize;
        slip.send(&cursor.get_ref()[..len]);
    }
}

/// Validate an inbound datagram and demultiplex by protocol.
///
/// Every rejection is silent: bad version, bad lengths, a checksum mismatch
/// and foreign destinations all drop the datagram without a reply.
/// Fragmented input is not reassembled; the fragmentation word is never
/// inspected.
pub fn receive<S: Serial, A: App>(
    pkt: &[u8],
    ip: &mut Ip,
    tcp: &mut Tcp,
    slip: &mut Slip<S>,
    app: &mut A,
    now: u32,
) {
    let Ok(header) = Ipv4HeaderSlice::from_slice(pkt) else {
        trace!("ip: unparseable datagram dropped");
        return;
    };

    let header_len = header.ihl() as usize * 4;
    let total_len = header.total_len() as usize;
    if total_len > pkt.len() || total_len < header_len {
        trace!("ip: bad total length {total_len}");
        return;
    }

    match header.to_header().calc_header_checksum() {
        Ok(sum) if sum == header.header_checksum() => {}
        _ => {
            debug!("ip: header checksum mismatch");
            return;
        }
    }

    if header.destination_addr() != ip.addr {
        trace!("ip: datagram for {} ignored", header.destination_addr());
        return;
    }

    let src = header.source_addr();
    let payload = &pkt[header_len..total_len];

    match header.protocol() {
        PROTO_ICMP => icmp::receive(payload, src, ip, slip),
        PROTO_TCP => tcp.on_segment(payload, src, ip, slip, app, now),
        PROTO_UDP => {
            // Demultiplexed but unused; the hook stays so a datagram
            // service can grow here without touching this path.
            trace!("udp: {} byte datagram from {src} dropped", payload.len());
        }
        other => trace!("ip: protocol {other} unsupported"),
    }
}
