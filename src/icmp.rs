use std::io::{Cursor, Write};
use std::net::Ipv4Addr;

use etherparse::{Icmpv4Header, Icmpv4Slice, Icmpv4Type};
use log::{debug, info};

use crate::ip::{Ip, PROTO_ICMP};
use crate::serial::Serial;
use crate::slip::{Slip, MTU};

/// Answer echo requests; every other ICMP type is dropped.
pub fn receive<S: Serial>(msg: &[u8], src: Ipv4Addr, ip: &mut Ip, slip: &mut Slip<S>) {
    let Ok(icmp) = Icmpv4Slice::from_slice(msg) else {
        return;
    };

    // The advertised checksum must match one recomputed over the whole
    // message.
    let expect = Icmpv4Header::with_checksum(icmp.icmp_type(), icmp.payload()).checksum;
    if expect != icmp.checksum() {
        debug!("icmp: checksum mismatch from {src}");
        return;
    }

    let Icmpv4Type::EchoRequest(echo) = icmp.icmp_type() else {
        return;
    };

    info!("ping from {src} seq={}", echo.seq);

    let reply = Icmpv4Header::with_checksum(Icmpv4Type::EchoReply(echo), icmp.payload());

    let mut cursor = Cursor::new([0u8; MTU]);
    reply.write(&mut cursor).unwrap();
    cursor.write_all(icmp.payload()).unwrap();

    let len = cursor.position() as usize;
    ip.send(slip, src, PROTO_ICMP, &cursor.get_ref()[..len]);
}
