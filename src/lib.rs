//! A small TCP/IPv4 stack over a SLIP-framed serial link, carrying a
//! single-connection HTTP file server.
//!
//! Layering mirrors the wire: [`serial`] feeds [`slip`], which hands whole
//! datagrams to [`ip`], which demultiplexes into [`icmp`] and [`tcp`]. The
//! application above the engine talks through the [`tcp::App`] and
//! [`tcp::Conn`] traits; [`http`] is the one shipped application.
//!
//! There is exactly one connection slot. SYNs that arrive while it is busy
//! are parked in a bounded backlog and answered when the slot returns to
//! listening, which is how the server absorbs bursts without real
//! concurrency.

use std::net::Ipv4Addr;

pub mod clock;
mod err;
pub mod http;
pub mod icmp;
pub mod ip;
pub mod logger;
pub mod serial;
pub mod slip;
pub mod tcp;

#[cfg(test)]
mod tests;

pub use err::*;

use clock::Clock;
use ip::Ip;
use serial::Serial;
use slip::{Slip, MTU};
use tcp::{App, Peer, State, Tcp};

/// The whole stack as one owned aggregate. Exactly one of these exists per
/// process, and the cooperative main loop drives it; nothing here is shared
/// across threads.
pub struct Stack<S: Serial> {
    slip: Slip<S>,
    ip: Ip,
    tcp: Tcp,
    clock: Clock,
    pkt: [u8; MTU],
}

impl<S: Serial> Stack<S> {
    pub fn new(serial: S, addr: Ipv4Addr) -> Self {
        Stack {
            slip: Slip::new(serial),
            ip: Ip::new(addr),
            tcp: Tcp::new(),
            clock: Clock::new(),
            pkt: [0; MTU],
        }
    }

    pub fn state(&self) -> State {
        self.tcp.state()
    }

    pub fn listen(&mut self, port: u16) {
        self.tcp.listen(port);
    }

    pub fn connect(&mut self, peer: Peer) {
        self.tcp.connect(peer, &mut self.ip, &mut self.slip);
    }

    /// Application-initiated send from outside a callback.
    pub fn send(&mut self, data: &[u8]) {
        let now = self.clock.ticks();
        self.send_at(now, data);
    }

    /// [`Stack::send`] with the tick supplied by the caller.
    pub fn send_at(&mut self, now: u32, data: &[u8]) {
        self.tcp.send(data, &mut self.ip, &mut self.slip, now);
    }

    pub fn close(&mut self) {
        self.tcp.close(&mut self.ip, &mut self.slip);
    }

    /// One main-loop iteration: assemble at most one datagram, dispatch it,
    /// then run the retransmit timer.
    pub fn poll<A: App>(&mut self, app: &mut A) {
        let now = self.clock.ticks();
        self.poll_at(now, app);
    }

    /// [`Stack::poll`] with the tick supplied by the caller; this is the
    /// deterministic entry point the scenario tests drive.
    pub fn poll_at<A: App>(&mut self, now: u32, app: &mut A) {
        if self.slip.poll() {
            let len = self.slip.frame().len();
            self.pkt[..len].copy_from_slice(self.slip.frame());
            self.slip.clear();

            ip::receive(
                &self.pkt[..len],
                &mut self.ip,
                &mut self.tcp,
                &mut self.slip,
                app,
                now,
            );
        }

        self.tcp.check_retransmit(now, &mut self.ip, &mut self.slip);
    }

    pub fn serial_mut(&mut self) -> &mut S {
        self.slip.serial_mut()
    }
}
