use std::io::{Cursor, Write};
use std::net::Ipv4Addr;

use bitflags::bitflags;
use etherparse::{Ipv4Header, TcpHeader, TcpHeaderSlice};
use log::{debug, info, warn};

mod backlog;
use backlog::Backlog;

use crate::ip::{Ip, PROTO_TCP};
use crate::serial::Serial;
use crate::slip::Slip;

/// First sequence number of every connection this endpoint originates or
/// accepts.
const INITIAL_SEQ: u32 = 1000;

/// Advertised receive window.
const WINDOW: u16 = 2048;

/// Capacity of the retransmit cell, and therefore the largest payload a
/// single [`Tcp::send`] emits.
pub const SEGMENT_CAP: usize = 64;

/// Ticks between retransmissions of the unacknowledged segment.
const RETX_TIMEOUT_TICKS: u32 = 2;

/// Retries before the cell is abandoned.
const RETX_MAX_ATTEMPTS: u8 = 3;

bitflags! {
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct TcpFlags: u8 {
        const FIN = 0x01;
        const SYN = 0x02;
        const RST = 0x04;
        const PSH = 0x08;
        const ACK = 0x10;
    }
}

/*
    The slot cycles through a reduced RFC 793 machine. Teardown is
    short-circuited: whichever side's FIN completes the exchange, the slot
    returns straight to Listen and the next queued SYN is answered.

           listen()                           connect()
    Closed --------> Listen ---------------------------> SynSent
                      ^  |  rcv SYN, accepted               |
                      |  |  snd SYN|ACK                     | rcv SYN|ACK
          rcv RST     |  v                                  | snd ACK
          rcv FIN     | SynReceived --- rcv ACK ---v        v
          snd FIN|ACK +<----------------------- Established <
                      |                             |
                      |                             | close()
                      |       rcv FIN               | snd FIN|ACK
                      +<--- FinWait1 / FinWait2 <---+

    Closing and TimeWait exist for a stricter teardown but no transition
    enters them today.
*/
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum State {
    Closed,
    Listen,
    SynSent,
    SynReceived,
    Established,
    FinWait1,
    FinWait2,
    Closing,
    TimeWait,
}

/// Remote endpoint identity.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Peer {
    pub ip: Ipv4Addr,
    pub port: u16,
}

impl std::fmt::Display for Peer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}:{}", self.ip, self.port)
    }
}

/// Capabilities the engine hands the application during a callback.
pub trait Conn {
    /// Queue up to [`SEGMENT_CAP`] bytes as one PSH|ACK segment. Only the
    /// most recent segment is kept for retransmission, so a later send
    /// overwrites the loss protection of an unacknowledged earlier one;
    /// callers stream larger responses as consecutive chunks and accept
    /// that contract.
    fn send(&mut self, data: &[u8]);

    /// Begin an active close.
    fn close(&mut self);
}

/// Upper-layer hooks. The engine owns nothing above the byte stream; the
/// application implements these and is handed a [`Conn`] to talk back
/// through.
pub trait App {
    /// Admission decision for an inbound SYN. Runs at SYN receipt, before
    /// the handshake completes.
    fn on_accept(&mut self, peer: Peer) -> bool;

    /// In-order payload delivery in Established. The buffer is only valid
    /// for the duration of the call.
    fn on_data(&mut self, conn: &mut dyn Conn, data: &[u8]);

    /// Transitions worth reporting: SynReceived, Established, and the
    /// return to Listen after close or reset.
    fn on_state_change(&mut self, old: State, new: State, peer: Peer);
}

/// The single unacknowledged segment. `seq` is the send sequence from
/// before the segment went out; retransmission rewinds to it.
struct RetxCell {
    buf: [u8; SEGMENT_CAP],
    len: usize,
    seq: u32,
    sent_at: u32,
    attempts: u8,
}

impl RetxCell {
    fn empty() -> Self {
        RetxCell {
            buf: [0; SEGMENT_CAP],
            len: 0,
            seq: 0,
            sent_at: 0,
            attempts: 0,
        }
    }

    fn fill(&mut self, data: &[u8], seq: u32, now: u32) {
        self.buf[..data.len()].copy_from_slice(data);
        self.len = data.len();
        self.seq = seq;
        self.sent_at = now;
        self.attempts = 0;
    }

    fn clear(&mut self) {
        self.len = 0;
    }

    fn is_empty(&self) -> bool {
        self.len == 0
    }
}

/// The single process-wide connection slot, plus its SYN queue and
/// retransmission state.
pub struct Tcp {
    state: State,
    local_port: u16,
    remote: Peer,
    /// Next sequence number we will send.
    seq: u32,
    /// Next sequence number expected from the peer; goes out as the
    /// acknowledgment number on every ACK-bearing segment.
    ack: u32,
    /// Highest acknowledgment the peer has sent us.
    last_ack: u32,
    retx: RetxCell,
    backlog: Backlog,
}

impl Tcp {
    pub fn new() -> Self {
        Tcp {
            state: State::Closed,
            local_port: 0,
            remote: Peer {
                ip: Ipv4Addr::UNSPECIFIED,
                port: 0,
            },
            seq: 0,
            ack: 0,
            last_ack: 0,
            retx: RetxCell::empty(),
            backlog: Backlog::new(),
        }
    }

    pub fn state(&self) -> State {
        self.state
    }

    pub fn remote(&self) -> Peer {
        self.remote
    }

    pub fn last_ack(&self) -> u32 {
        self.last_ack
    }

    /// Passive open.
    pub fn listen(&mut self, port: u16) {
        self.local_port = port;
        self.state = State::Listen;
    }

    /// Active open.
    pub fn connect<S: Serial>(&mut self, peer: Peer, ip: &mut Ip, slip: &mut Slip<S>) {
        self.remote = peer;
        self.seq = INITIAL_SEQ;
        self.ack = 0;
        self.state = State::SynSent;
        self.emit(TcpFlags::SYN, &[], ip, slip);
    }

    /// Emit `data` as one PSH|ACK segment. No-op outside Established.
    /// Payloads longer than [`SEGMENT_CAP`] are truncated to it.
    pub fn send<S: Serial>(&mut self, data: &[u8], ip: &mut Ip, slip: &mut Slip<S>, now: u32) {
        if self.state != State::Established {
            return;
        }

        let data = &data[..data.len().min(SEGMENT_CAP)];

        self.retx.fill(data, self.seq, now);
        self.emit(TcpFlags::PSH | TcpFlags::ACK, data, ip, slip);
    }

    /// Active close. The retransmit cell dies with the connection either
    /// way.
    pub fn close<S: Serial>(&mut self, ip: &mut Ip, slip: &mut Slip<S>) {
        if self.state == State::Established {
            self.state = State::FinWait1;
            self.emit(TcpFlags::FIN | TcpFlags::ACK, &[], ip, slip);
        }

        self.retx.clear();
    }

    /// Main-loop timer: resend the unacknowledged segment once
    /// [`RETX_TIMEOUT_TICKS`] have elapsed, give up after
    /// [`RETX_MAX_ATTEMPTS`]. Tick differences wrap.
    pub fn check_retransmit<S: Serial>(&mut self, now: u32, ip: &mut Ip, slip: &mut Slip<S>) {
        if self.state != State::Established || self.retx.is_empty() {
            return;
        }

        if now.wrapping_sub(self.retx.sent_at) < RETX_TIMEOUT_TICKS {
            return;
        }

        self.retx.attempts += 1;
        if self.retx.attempts > RETX_MAX_ATTEMPTS {
            warn!("retransmit abandoned after {RETX_MAX_ATTEMPTS} attempts, peer unresponsive");
            self.retx.clear();
            return;
        }

        debug!(
            "retransmit #{} of {} bytes to {}",
            self.retx.attempts, self.retx.len, self.remote
        );

        // Rewind and resend; emit advances the sequence again.
        self.seq = self.retx.seq;

        let mut data = [0u8; SEGMENT_CAP];
        let len = self.retx.len;
        data[..len].copy_from_slice(&self.retx.buf[..len]);

        self.emit(TcpFlags::PSH | TcpFlags::ACK, &data[..len], ip, slip);
        self.retx.sent_at = now;
    }

    /// Entry point for every TCP segment addressed to this host.
    pub fn on_segment<S: Serial, A: App>(
        &mut self,
        seg: &[u8],
        src: Ipv4Addr,
        ip: &mut Ip,
        slip: &mut Slip<S>,
        app: &mut A,
        now: u32,
    ) {
        let Ok(header) = TcpHeaderSlice::from_slice(seg) else {
            return;
        };

        if header.destination_port() != self.local_port {
            return;
        }

        let header_len = header.data_offset() as usize * 4;
        let payload = &seg[header_len..];
        let seq_num = header.sequence_number();
        let ack_num = header.acknowledgment_number();
        let peer = Peer {
            ip: src,
            port: header.source_port(),
        };

        // A SYN while the slot is busy is not an error: park it and answer
        // once the slot frees up. This is what lets a single-connection
        // server ride out a burst.
        if header.syn() && !header.ack() && self.state != State::Listen {
            self.backlog.push(peer.ip, peer.port, seq_num, now);
            debug!("syn from {peer} queued, {} pending", self.backlog.len());
            return;
        }

        if header.rst() {
            if self.state != State::Closed && self.state != State::Listen {
                info!("rst from {peer}");

                let old = self.state;
                self.to_listen();
                app.on_state_change(old, State::Listen, peer);
                self.drain_backlog(ip, slip, app, now);
            }
            return;
        }

        let old = self.state;

        match self.state {
            State::Listen => {
                if header.syn() && app.on_accept(peer) {
                    self.open_passive(peer, seq_num, ip, slip);
                    app.on_state_change(old, State::SynReceived, peer);
                }
            }

            State::SynSent => {
                if header.syn() && header.ack() {
                    self.ack = seq_num.wrapping_add(1);
                    self.last_ack = ack_num;
                    self.state = State::Established;
                    self.emit(TcpFlags::ACK, &[], ip, slip);
                    app.on_state_change(old, State::Established, self.remote);
                }
            }

            State::SynReceived => {
                if header.ack() {
                    self.last_ack = ack_num;
                    self.state = State::Established;
                    app.on_state_change(old, State::Established, self.remote);
                }
            }

            State::Established => {
                if header.ack() {
                    self.last_ack = ack_num;

                    if !self.retx.is_empty() {
                        let acked = ack_num.wrapping_sub(self.retx.seq);
                        if acked >= self.retx.len as u32 && acked < 1 << 31 {
                            self.retx.clear();
                        }
                    }
                }

                if !payload.is_empty() {
                    if seq_num == self.ack {
                        self.ack = self.ack.wrapping_add(payload.len() as u32);
                        self.emit(TcpFlags::ACK, &[], ip, slip);

                        let mut conn = ConnRef {
                            tcp: &mut *self,
                            ip: &mut *ip,
                            slip: &mut *slip,
                            now,
                        };
                        app.on_data(&mut conn, payload);
                    } else {
                        // Out of sequence: re-ack what we expect and let
                        // the peer retransmit. Nothing is delivered twice.
                        self.emit(TcpFlags::ACK, &[], ip, slip);
                    }
                }

                if header.fin() {
                    self.ack = seq_num
                        .wrapping_add(payload.len() as u32)
                        .wrapping_add(1);
                    self.emit(TcpFlags::FIN | TcpFlags::ACK, &[], ip, slip);
                    self.to_listen();
                    app.on_state_change(old, State::Listen, peer);
                    self.drain_backlog(ip, slip, app, now);
                }
            }

            State::FinWait1 => {
                if header.ack() {
                    self.last_ack = ack_num;
                    self.state = State::FinWait2;
                }

                if header.fin() {
                    self.ack = seq_num.wrapping_add(1);
                    self.emit(TcpFlags::ACK, &[], ip, slip);
                    self.to_listen();
                    app.on_state_change(old, State::Listen, peer);
                    self.drain_backlog(ip, slip, app, now);
                }
            }

            State::FinWait2 => {
                if header.fin() {
                    self.ack = seq_num.wrapping_add(1);
                    self.emit(TcpFlags::ACK, &[], ip, slip);
                    self.to_listen();
                    app.on_state_change(old, State::Listen, peer);
                    self.drain_backlog(ip, slip, app, now);
                }
            }

            State::Closed | State::Closing | State::TimeWait => {}
        }
    }

    /// Serialize and transmit one segment, then advance the send sequence:
    /// one for SYN, one for FIN, plus the payload length.
    fn emit<S: Serial>(&mut self, flags: TcpFlags, payload: &[u8], ip: &mut Ip, slip: &mut Slip<S>) {
        let mut header = TcpHeader::new(self.local_port, self.remote.port, self.seq, WINDOW);
        header.fin = flags.contains(TcpFlags::FIN);
        header.syn = flags.contains(TcpFlags::SYN);
        header.rst = flags.contains(TcpFlags::RST);
        header.psh = flags.contains(TcpFlags::PSH);
        header.ack = flags.contains(TcpFlags::ACK);
        header.acknowledgment_number = if header.ack { self.ack } else { 0 };

        // Only the addresses matter for the pseudo-header sum.
        let pseudo = Ipv4Header::new(
            header.header_len() + payload.len() as u16,
            64,
            PROTO_TCP,
            ip.addr().octets(),
            self.remote.ip.octets(),
        );
        header.checksum = header.calc_checksum_ipv4(&pseudo, payload).unwrap();

        if header.syn {
            self.seq = self.seq.wrapping_add(1);
        }
        if header.fin {
            self.seq = self.seq.wrapping_add(1);
        }
        self.seq = self.seq.wrapping_add(payload.len() as u32);

        let mut cursor = Cursor::new([0u8; 20 + SEGMENT_CAP]);
        header.write(&mut cursor).unwrap();
        cursor.write_all(payload).unwrap();

        let len = cursor.position() as usize;
        ip.send(slip, self.remote.ip, PROTO_TCP, &cursor.get_ref()[..len]);
    }

    fn open_passive<S: Serial>(
        &mut self,
        peer: Peer,
        their_seq: u32,
        ip: &mut Ip,
        slip: &mut Slip<S>,
    ) {
        self.remote = peer;
        self.seq = INITIAL_SEQ;
        self.ack = their_seq.wrapping_add(1);
        self.emit(TcpFlags::SYN | TcpFlags::ACK, &[], ip, slip);
        self.state = State::SynReceived;
    }

    fn to_listen(&mut self) {
        self.state = State::Listen;
        self.retx.clear();
    }

    /// Answer the next queued SYN, if one survives expiry and the accept
    /// filter. A rejected entry is simply discarded.
    fn drain_backlog<S: Serial, A: App>(
        &mut self,
        ip: &mut Ip,
        slip: &mut Slip<S>,
        app: &mut A,
        now: u32,
    ) {
        if self.state != State::Listen {
            return;
        }

        if let Some(pending) = self.backlog.pop(now) {
            debug!("dequeued syn, {} still pending", self.backlog.len());

            let peer = Peer {
                ip: pending.ip,
                port: pending.port,
            };
            if app.on_accept(peer) {
                self.open_passive(peer, pending.seq, ip, slip);
                app.on_state_change(State::Listen, State::SynReceived, peer);
            }
        }
    }
}

/// Borrowed view handed to [`App::on_data`]; routes application sends and
/// closes back through the engine that is mid-delivery.
struct ConnRef<'a, S: Serial> {
    tcp: &'a mut Tcp,
    ip: &'a mut Ip,
    slip: &'a mut Slip<S>,
    now: u32,
}

impl<S: Serial> Conn for ConnRef<'_, S> {
    fn send(&mut self, data: &[u8]) {
        self.tcp.send(data, self.ip, self.slip, self.now);
    }

    fn close(&mut self) {
        self.tcp.close(self.ip, self.slip);
    }
}
