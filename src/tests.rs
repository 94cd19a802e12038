//! Whole-stack scenarios driven over the in-memory serial backend: frames
//! go in as SLIP-encoded bytes, replies come back out of the fake device
//! and are decoded and parsed with etherparse.

use std::io::{Cursor, Write};
use std::net::Ipv4Addr;

use etherparse::{
    IcmpEchoHeader, Icmpv4Header, Icmpv4Slice, Icmpv4Type, Ipv4Header, Ipv4HeaderSlice, TcpHeader,
    TcpHeaderSlice,
};

use crate::serial::Mem;
use crate::slip;
use crate::tcp::{App, Conn, Peer, State};
use crate::Stack;

const LOCAL: Ipv4Addr = Ipv4Addr::new(192, 168, 1, 2);
const PEER: Ipv4Addr = Ipv4Addr::new(192, 168, 1, 10);
const PEER_B: Ipv4Addr = Ipv4Addr::new(192, 168, 1, 11);
const PEER_C: Ipv4Addr = Ipv4Addr::new(192, 168, 1, 12);

const PEER_PORT: u16 = 4242;

#[derive(Default)]
struct TestApp {
    accept: bool,
    data: Vec<Vec<u8>>,
    transitions: Vec<(State, State, Peer)>,
    reply: Option<Vec<u8>>,
    close_on_data: bool,
}

impl TestApp {
    fn new() -> Self {
        TestApp {
            accept: true,
            ..TestApp::default()
        }
    }
}

impl App for TestApp {
    fn on_accept(&mut self, _peer: Peer) -> bool {
        self.accept
    }

    fn on_data(&mut self, conn: &mut dyn Conn, data: &[u8]) {
        self.data.push(data.to_vec());

        if let Some(reply) = self.reply.take() {
            conn.send(&reply);
        }
        if self.close_on_data {
            conn.close();
        }
    }

    fn on_state_change(&mut self, old: State, new: State, peer: Peer) {
        self.transitions.push((old, new, peer));
    }
}

fn slip_encode(data: &[u8]) -> Vec<u8> {
    let mut out = vec![slip::END];
    for &byte in data {
        match byte {
            slip::END => out.extend([slip::ESC, slip::ESC_END]),
            slip::ESC => out.extend([slip::ESC, slip::ESC_ESC]),
            other => out.push(other),
        }
    }
    out.push(slip::END);
    out
}

fn slip_decode(bytes: &[u8]) -> Vec<Vec<u8>> {
    let mut frames = Vec::new();
    let mut frame = Vec::new();
    let mut escaped = false;

    for &byte in bytes {
        if escaped {
            escaped = false;
            frame.push(match byte {
                slip::ESC_END => slip::END,
                slip::ESC_ESC => slip::ESC,
                other => other,
            });
        } else if byte == slip::END {
            if !frame.is_empty() {
                frames.push(std::mem::take(&mut frame));
            }
        } else if byte == slip::ESC {
            escaped = true;
        } else {
            frame.push(byte);
        }
    }

    frames
}

fn tcp_packet(
    src: Ipv4Addr,
    dst: Ipv4Addr,
    configure: impl FnOnce(&mut TcpHeader),
    payload: &[u8],
) -> Vec<u8> {
    let mut tcph = TcpHeader::new(PEER_PORT, 80, 0, 1024);
    configure(&mut tcph);

    let ip4h = Ipv4Header::new(
        tcph.header_len() + payload.len() as u16,
        64,
        6,
        src.octets(),
        dst.octets(),
    );
    tcph.checksum = tcph.calc_checksum_ipv4(&ip4h, payload).unwrap();

    let mut cursor = Cursor::new(Vec::new());
    ip4h.write(&mut cursor).unwrap();
    tcph.write(&mut cursor).unwrap();
    cursor.write_all(payload).unwrap();
    cursor.into_inner()
}

fn icmp_packet(src: Ipv4Addr, dst: Ipv4Addr, icmp_type: Icmpv4Type, payload: &[u8]) -> Vec<u8> {
    let icmph = Icmpv4Header::with_checksum(icmp_type, payload);

    let ip4h = Ipv4Header::new(
        (icmph.header_len() + payload.len()) as u16,
        64,
        1,
        src.octets(),
        dst.octets(),
    );

    let mut cursor = Cursor::new(Vec::new());
    ip4h.write(&mut cursor).unwrap();
    icmph.write(&mut cursor).unwrap();
    cursor.write_all(payload).unwrap();
    cursor.into_inner()
}

fn stack() -> (Stack<Mem>, TestApp) {
    let mut stack = Stack::new(Mem::new(), LOCAL);
    stack.listen(80);
    (stack, TestApp::new())
}

fn inject(stack: &mut Stack<Mem>, app: &mut TestApp, now: u32, datagram: &[u8]) {
    stack.serial_mut().feed(&slip_encode(datagram));
    stack.poll_at(now, app);
}

fn sent_frames(stack: &mut Stack<Mem>) -> Vec<Vec<u8>> {
    let bytes = std::mem::take(&mut stack.serial_mut().sent);
    slip_decode(&bytes)
}

fn parse_tcp(frame: &[u8]) -> (Ipv4Header, TcpHeader, Vec<u8>) {
    let ip4h = Ipv4HeaderSlice::from_slice(frame).unwrap();
    let header_len = ip4h.ihl() as usize * 4;
    let tcph = TcpHeaderSlice::from_slice(&frame[header_len..]).unwrap();
    let data_start = header_len + tcph.data_offset() as usize * 4;

    (ip4h.to_header(), tcph.to_header(), frame[data_start..].to_vec())
}

/// Run the three-way handshake: peer SYN seq 100, our SYN|ACK seq 1000
/// ack 101, peer ACK.
fn establish(stack: &mut Stack<Mem>, app: &mut TestApp) {
    let syn = tcp_packet(
        PEER,
        LOCAL,
        |tcph| {
            tcph.sequence_number = 100;
            tcph.syn = true;
        },
        &[],
    );
    inject(stack, app, 0, &syn);

    let frames = sent_frames(stack);
    assert_eq!(frames.len(), 1);

    let (ip4h, synack, _) = parse_tcp(&frames[0]);
    assert_eq!(ip4h.destination, PEER.octets());
    assert!(synack.syn && synack.ack);
    assert_eq!(synack.sequence_number, 1000);
    assert_eq!(synack.acknowledgment_number, 101);
    assert_eq!(synack.window_size, 2048);

    let ack = tcp_packet(
        PEER,
        LOCAL,
        |tcph| {
            tcph.sequence_number = 101;
            tcph.ack = true;
            tcph.acknowledgment_number = 1001;
        },
        &[],
    );
    inject(stack, app, 0, &ack);

    assert_eq!(stack.state(), State::Established);
}

#[test]
fn icmp_echo_is_answered_in_kind() {
    let (mut stack, mut app) = stack();

    let echo = IcmpEchoHeader {
        id: 0x1234,
        seq: 0x0001,
    };
    let request = icmp_packet(PEER, LOCAL, Icmpv4Type::EchoRequest(echo), b"abcd");

    inject(&mut stack, &mut app, 0, &request);
    inject(&mut stack, &mut app, 0, &request);

    let frames = sent_frames(&mut stack);
    assert_eq!(frames.len(), 2);

    let mut idents = Vec::new();
    let mut checksums = Vec::new();

    for frame in &frames {
        let ip4h = Ipv4HeaderSlice::from_slice(frame).unwrap();
        assert_eq!(ip4h.source_addr(), LOCAL);
        assert_eq!(ip4h.destination_addr(), PEER);
        assert_eq!(ip4h.protocol(), 1);
        idents.push(ip4h.identification());

        let reply = Icmpv4Slice::from_slice(&frame[20..]).unwrap();
        let Icmpv4Type::EchoReply(header) = reply.icmp_type() else {
            panic!("expected an echo reply");
        };
        assert_eq!(header.id, 0x1234);
        assert_eq!(header.seq, 0x0001);
        assert_eq!(reply.payload(), b"abcd");

        let recomputed =
            Icmpv4Header::with_checksum(reply.icmp_type(), reply.payload()).checksum;
        assert_eq!(reply.checksum(), recomputed);
        checksums.push(reply.checksum());
    }

    assert_eq!(checksums[0], checksums[1]);
    assert_eq!(idents[1].wrapping_sub(idents[0]), 1);
}

#[test]
fn icmp_with_bad_checksum_is_dropped() {
    let (mut stack, mut app) = stack();

    let echo = IcmpEchoHeader { id: 1, seq: 1 };
    let mut request = icmp_packet(PEER, LOCAL, Icmpv4Type::EchoRequest(echo), b"abcd");
    request[22] ^= 0xFF;

    inject(&mut stack, &mut app, 0, &request);

    assert!(sent_frames(&mut stack).is_empty());
}

#[test]
fn three_way_handshake_reaches_established() {
    let (mut stack, mut app) = stack();

    establish(&mut stack, &mut app);

    assert_eq!(
        app.transitions,
        vec![
            (
                State::Listen,
                State::SynReceived,
                Peer {
                    ip: PEER,
                    port: PEER_PORT
                }
            ),
            (
                State::SynReceived,
                State::Established,
                Peer {
                    ip: PEER,
                    port: PEER_PORT
                }
            ),
        ]
    );
}

#[test]
fn rejected_syn_is_ignored() {
    let (mut stack, mut app) = stack();
    app.accept = false;

    let syn = tcp_packet(
        PEER,
        LOCAL,
        |tcph| {
            tcph.sequence_number = 100;
            tcph.syn = true;
        },
        &[],
    );
    inject(&mut stack, &mut app, 0, &syn);

    assert!(sent_frames(&mut stack).is_empty());
    assert_eq!(stack.state(), State::Listen);
}

#[test]
fn in_order_data_is_acked_and_delivered_once() {
    let (mut stack, mut app) = stack();
    establish(&mut stack, &mut app);

    let request = b"GET /\r\n\r\n";
    let data = tcp_packet(
        PEER,
        LOCAL,
        |tcph| {
            tcph.sequence_number = 101;
            tcph.ack = true;
            tcph.acknowledgment_number = 1001;
            tcph.psh = true;
        },
        request,
    );
    inject(&mut stack, &mut app, 0, &data);

    let frames = sent_frames(&mut stack);
    assert_eq!(frames.len(), 1);

    let (_, ack, payload) = parse_tcp(&frames[0]);
    assert!(ack.ack && !ack.syn && !ack.fin);
    assert_eq!(ack.acknowledgment_number, 101 + request.len() as u32);
    assert!(payload.is_empty());

    assert_eq!(app.data, vec![request.to_vec()]);
}

#[test]
fn out_of_order_data_is_reacked_not_delivered() {
    let (mut stack, mut app) = stack();
    establish(&mut stack, &mut app);

    let stray = tcp_packet(
        PEER,
        LOCAL,
        |tcph| {
            tcph.sequence_number = 999;
            tcph.ack = true;
            tcph.acknowledgment_number = 1001;
            tcph.psh = true;
        },
        b"late",
    );
    inject(&mut stack, &mut app, 0, &stray);

    let frames = sent_frames(&mut stack);
    assert_eq!(frames.len(), 1);

    let (_, ack, _) = parse_tcp(&frames[0]);
    assert_eq!(ack.acknowledgment_number, 101);
    assert!(app.data.is_empty());
}

#[test]
fn app_reply_and_close_ride_the_delivery_callback() {
    let (mut stack, mut app) = stack();
    establish(&mut stack, &mut app);

    app.reply = Some(b"pong".to_vec());
    app.close_on_data = true;

    let data = tcp_packet(
        PEER,
        LOCAL,
        |tcph| {
            tcph.sequence_number = 101;
            tcph.ack = true;
            tcph.acknowledgment_number = 1001;
            tcph.psh = true;
        },
        b"ping",
    );
    inject(&mut stack, &mut app, 0, &data);

    let frames = sent_frames(&mut stack);
    assert_eq!(frames.len(), 3);

    let (_, ack, _) = parse_tcp(&frames[0]);
    assert!(ack.ack && !ack.psh);

    let (_, reply, payload) = parse_tcp(&frames[1]);
    assert!(reply.psh && reply.ack);
    assert_eq!(reply.sequence_number, 1001);
    assert_eq!(payload, b"pong");

    let (_, fin, _) = parse_tcp(&frames[2]);
    assert!(fin.fin && fin.ack);
    assert_eq!(stack.state(), State::FinWait1);
}

#[test]
fn peer_fin_returns_slot_to_listen() {
    let (mut stack, mut app) = stack();
    establish(&mut stack, &mut app);
    app.transitions.clear();

    let fin = tcp_packet(
        PEER,
        LOCAL,
        |tcph| {
            tcph.sequence_number = 101;
            tcph.ack = true;
            tcph.acknowledgment_number = 1001;
            tcph.fin = true;
        },
        &[],
    );
    inject(&mut stack, &mut app, 0, &fin);

    let frames = sent_frames(&mut stack);
    assert_eq!(frames.len(), 1);

    let (_, finack, _) = parse_tcp(&frames[0]);
    assert!(finack.fin && finack.ack);
    assert_eq!(finack.acknowledgment_number, 102);

    assert_eq!(stack.state(), State::Listen);
    assert_eq!(
        app.transitions,
        vec![(
            State::Established,
            State::Listen,
            Peer {
                ip: PEER,
                port: PEER_PORT
            }
        )]
    );
}

#[test]
fn active_close_walks_the_fin_wait_states() {
    let (mut stack, mut app) = stack();
    establish(&mut stack, &mut app);

    stack.close();
    assert_eq!(stack.state(), State::FinWait1);

    let frames = sent_frames(&mut stack);
    let (_, fin, _) = parse_tcp(&frames[0]);
    assert!(fin.fin && fin.ack);
    assert_eq!(fin.sequence_number, 1001);

    let ack = tcp_packet(
        PEER,
        LOCAL,
        |tcph| {
            tcph.sequence_number = 101;
            tcph.ack = true;
            tcph.acknowledgment_number = 1002;
        },
        &[],
    );
    inject(&mut stack, &mut app, 0, &ack);
    assert_eq!(stack.state(), State::FinWait2);

    let fin = tcp_packet(
        PEER,
        LOCAL,
        |tcph| {
            tcph.sequence_number = 101;
            tcph.fin = true;
        },
        &[],
    );
    inject(&mut stack, &mut app, 0, &fin);

    assert_eq!(stack.state(), State::Listen);

    let frames = sent_frames(&mut stack);
    let (_, last, _) = parse_tcp(frames.last().unwrap());
    assert!(last.ack);
    assert_eq!(last.acknowledgment_number, 102);
}

#[test]
fn busy_slot_queues_syns_and_drains_on_fin() {
    let (mut stack, mut app) = stack();
    establish(&mut stack, &mut app);
    app.transitions.clear();

    for peer in [PEER_B, PEER_C] {
        let syn = tcp_packet(
            peer,
            LOCAL,
            |tcph| {
                tcph.sequence_number = 555;
                tcph.syn = true;
            },
            &[],
        );
        inject(&mut stack, &mut app, 0, &syn);
    }

    // Both parked, neither answered yet.
    assert!(sent_frames(&mut stack).is_empty());

    let fin = tcp_packet(
        PEER,
        LOCAL,
        |tcph| {
            tcph.sequence_number = 101;
            tcph.ack = true;
            tcph.acknowledgment_number = 1001;
            tcph.fin = true;
        },
        &[],
    );
    inject(&mut stack, &mut app, 5, &fin);

    let frames = sent_frames(&mut stack);
    assert_eq!(frames.len(), 2);

    let (_, finack, _) = parse_tcp(&frames[0]);
    assert!(finack.fin && finack.ack);

    let (ip4h, synack, _) = parse_tcp(&frames[1]);
    assert_eq!(ip4h.destination, PEER_B.octets());
    assert!(synack.syn && synack.ack);
    assert_eq!(synack.acknowledgment_number, 556);

    assert_eq!(stack.state(), State::SynReceived);
    assert_eq!(
        app.transitions,
        vec![
            (
                State::Established,
                State::Listen,
                Peer {
                    ip: PEER,
                    port: PEER_PORT
                }
            ),
            (
                State::Listen,
                State::SynReceived,
                Peer {
                    ip: PEER_B,
                    port: PEER_PORT
                }
            ),
        ]
    );
}

#[test]
fn expired_backlog_entries_are_not_drained() {
    let (mut stack, mut app) = stack();
    establish(&mut stack, &mut app);

    let syn = tcp_packet(
        PEER_B,
        LOCAL,
        |tcph| {
            tcph.sequence_number = 555;
            tcph.syn = true;
        },
        &[],
    );
    inject(&mut stack, &mut app, 0, &syn);
    assert!(sent_frames(&mut stack).is_empty());

    // Ten seconds of ticks later the entry is stale.
    let fin = tcp_packet(
        PEER,
        LOCAL,
        |tcph| {
            tcph.sequence_number = 101;
            tcph.ack = true;
            tcph.acknowledgment_number = 1001;
            tcph.fin = true;
        },
        &[],
    );
    inject(&mut stack, &mut app, 200, &fin);

    let frames = sent_frames(&mut stack);
    assert_eq!(frames.len(), 1);

    let (_, finack, _) = parse_tcp(&frames[0]);
    assert!(finack.fin && finack.ack);
    assert_eq!(stack.state(), State::Listen);
}

#[test]
fn rst_resets_to_listen_and_drains_the_queue() {
    let (mut stack, mut app) = stack();
    establish(&mut stack, &mut app);
    app.transitions.clear();

    let syn = tcp_packet(
        PEER_B,
        LOCAL,
        |tcph| {
            tcph.sequence_number = 900;
            tcph.syn = true;
        },
        &[],
    );
    inject(&mut stack, &mut app, 0, &syn);

    let rst = tcp_packet(
        PEER,
        LOCAL,
        |tcph| {
            tcph.sequence_number = 101;
            tcph.rst = true;
        },
        &[],
    );
    inject(&mut stack, &mut app, 1, &rst);

    let frames = sent_frames(&mut stack);
    assert_eq!(frames.len(), 1);

    let (ip4h, synack, _) = parse_tcp(&frames[0]);
    assert_eq!(ip4h.destination, PEER_B.octets());
    assert!(synack.syn && synack.ack);

    assert_eq!(app.transitions[0].0, State::Established);
    assert_eq!(app.transitions[0].1, State::Listen);
}

#[test]
fn retransmit_gives_up_after_three_attempts() {
    let (mut stack, mut app) = stack();
    establish(&mut stack, &mut app);

    stack.send_at(0, b"HELLO");

    let frames = sent_frames(&mut stack);
    assert_eq!(frames.len(), 1);
    let (_, first, payload) = parse_tcp(&frames[0]);
    assert!(first.psh && first.ack);
    assert_eq!(first.sequence_number, 1001);
    assert_eq!(payload, b"HELLO");

    let mut copies = 1;
    for now in 1..=20 {
        stack.poll_at(now, &mut app);
        for frame in sent_frames(&mut stack) {
            let (_, tcph, payload) = parse_tcp(&frame);
            assert_eq!(tcph.sequence_number, 1001);
            assert_eq!(payload, b"HELLO");
            copies += 1;
        }
    }

    // One original plus exactly three retries, then the cell is empty.
    assert_eq!(copies, 4);
}

#[test]
fn ack_covering_the_cell_stops_retransmission() {
    let (mut stack, mut app) = stack();
    establish(&mut stack, &mut app);

    stack.send_at(0, b"HELLO");
    sent_frames(&mut stack);

    let ack = tcp_packet(
        PEER,
        LOCAL,
        |tcph| {
            tcph.sequence_number = 101;
            tcph.ack = true;
            tcph.acknowledgment_number = 1006;
        },
        &[],
    );
    inject(&mut stack, &mut app, 1, &ack);

    for now in 2..=10 {
        stack.poll_at(now, &mut app);
    }

    assert!(sent_frames(&mut stack).is_empty());
}

#[test]
fn send_outside_established_is_a_no_op() {
    let (mut stack, _) = stack();

    stack.send_at(0, b"HELLO");

    assert!(sent_frames(&mut stack).is_empty());
}

#[test]
fn segments_for_other_ports_are_ignored() {
    let (mut stack, mut app) = stack();

    let syn = tcp_packet(
        PEER,
        LOCAL,
        |tcph| {
            tcph.destination_port = 8080;
            tcph.sequence_number = 100;
            tcph.syn = true;
        },
        &[],
    );
    inject(&mut stack, &mut app, 0, &syn);

    assert!(sent_frames(&mut stack).is_empty());
    assert!(app.transitions.is_empty());
}

#[test]
fn datagrams_for_other_hosts_are_ignored() {
    let (mut stack, mut app) = stack();

    let syn = tcp_packet(
        PEER,
        Ipv4Addr::new(192, 168, 1, 99),
        |tcph| {
            tcph.sequence_number = 100;
            tcph.syn = true;
        },
        &[],
    );
    inject(&mut stack, &mut app, 0, &syn);

    assert!(sent_frames(&mut stack).is_empty());
}

#[test]
fn corrupted_ip_checksum_is_dropped() {
    let (mut stack, mut app) = stack();

    let mut syn = tcp_packet(
        PEER,
        LOCAL,
        |tcph| {
            tcph.sequence_number = 100;
            tcph.syn = true;
        },
        &[],
    );
    syn[10] ^= 0xFF;
    inject(&mut stack, &mut app, 0, &syn);

    assert!(sent_frames(&mut stack).is_empty());
}

#[test]
fn truncated_datagram_is_dropped() {
    let (mut stack, mut app) = stack();

    // Header advertises 100 payload bytes; only 10 arrive.
    let ip4h = Ipv4Header::new(100, 64, 6, PEER.octets(), LOCAL.octets());
    let mut cursor = Cursor::new(Vec::new());
    ip4h.write(&mut cursor).unwrap();
    cursor.write_all(&[0u8; 10]).unwrap();

    inject(&mut stack, &mut app, 0, &cursor.into_inner());

    assert!(sent_frames(&mut stack).is_empty());
}

#[test]
fn udp_datagrams_fall_into_the_sink() {
    let (mut stack, mut app) = stack();

    let ip4h = Ipv4Header::new(12, 64, 17, PEER.octets(), LOCAL.octets());
    let mut cursor = Cursor::new(Vec::new());
    ip4h.write(&mut cursor).unwrap();
    cursor.write_all(&[0u8; 12]).unwrap();

    inject(&mut stack, &mut app, 0, &cursor.into_inner());

    assert!(sent_frames(&mut stack).is_empty());
    assert_eq!(stack.state(), State::Listen);
}

#[test]
fn active_connect_emits_syn_and_completes() {
    let mut stack = Stack::new(Mem::new(), LOCAL);
    let mut app = TestApp::new();

    stack.listen(80);
    stack.connect(Peer {
        ip: PEER,
        port: 7000,
    });
    assert_eq!(stack.state(), State::SynSent);

    let frames = sent_frames(&mut stack);
    let (_, syn, _) = parse_tcp(&frames[0]);
    assert!(syn.syn && !syn.ack);
    assert_eq!(syn.sequence_number, 1000);

    let synack = tcp_packet(
        PEER,
        LOCAL,
        |tcph| {
            tcph.source_port = 7000;
            tcph.sequence_number = 300;
            tcph.syn = true;
            tcph.ack = true;
            tcph.acknowledgment_number = 1001;
        },
        &[],
    );
    inject(&mut stack, &mut app, 0, &synack);

    assert_eq!(stack.state(), State::Established);

    let frames = sent_frames(&mut stack);
    let (_, ack, _) = parse_tcp(&frames[0]);
    assert!(ack.ack && !ack.syn);
    assert_eq!(ack.acknowledgment_number, 301);
}
