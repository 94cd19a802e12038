use log::trace;

use crate::serial::Serial;

pub const END: u8 = 0xC0;
pub const ESC: u8 = 0xDB;
pub const ESC_END: u8 = 0xDC;
pub const ESC_ESC: u8 = 0xDD;

/// Conventional SLIP MTU; also the size of the receive scratch.
pub const MTU: usize = 576;

/// RFC 1055 framer over a byte transport.
pub struct Slip<S> {
    serial: S,
    scratch: [u8; MTU],
    len: usize,
    escaped: bool,
}

impl<S: Serial> Slip<S> {
    pub fn new(serial: S) -> Self {
        Slip {
            serial,
            scratch: [0; MTU],
            len: 0,
            escaped: false,
        }
    }

    /// Drain the transport. Returns true once a complete datagram sits in
    /// the scratch; the caller reads it with [`Slip::frame`] and releases it
    /// with [`Slip::clear`].
    ///
    /// Bytes past the scratch capacity are dropped so an oversized frame
    /// still terminates on its END; the truncated datagram then fails an
    /// upper-layer length check.
    pub fn poll(&mut self) -> bool {
        while let Some(byte) = self.serial.poll_byte() {
            if self.escaped {
                self.escaped = false;

                let byte = match byte {
                    ESC_END => END,
                    ESC_ESC => ESC,
                    other => other,
                };
                self.push(byte);
            } else if byte == END {
                // A zero-length frame is the idle END some peers lead with
                // for resynchronisation; swallow it.
                if self.len > 0 {
                    return true;
                }
            } else if byte == ESC {
                self.escaped = true;
            } else {
                self.push(byte);
            }
        }

        false
    }

    fn push(&mut self, byte: u8) {
        if self.len < MTU {
            self.scratch[self.len] = byte;
            self.len += 1;
        }
    }

    pub fn frame(&self) -> &[u8] {
        &self.scratch[..self.len]
    }

    pub fn clear(&mut self) {
        self.len = 0;
    }

    /// Frame and transmit one datagram, escape-encoding as needed.
    pub fn send(&mut self, data: &[u8]) {
        trace!("slip tx {} bytes", data.len());

        self.serial.put_byte(END);
        for &byte in data {
            match byte {
                END => {
                    self.serial.put_byte(ESC);
                    self.serial.put_byte(ESC_END);
                }
                ESC => {
                    self.serial.put_byte(ESC);
                    self.serial.put_byte(ESC_ESC);
                }
                other => self.serial.put_byte(other),
            }
        }
        self.serial.put_byte(END);
    }

    pub fn serial_mut(&mut self) -> &mut S {
        &mut self.serial
    }
}
