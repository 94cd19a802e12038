use std::collections::VecDeque;
use std::fs::{File, OpenOptions};
use std::io::{self, Read, Write};
use std::os::fd::AsRawFd;
use std::sync::atomic::{AtomicBool, AtomicU8, AtomicUsize, Ordering};
use std::sync::Arc;
use std::thread;

use log::{debug, warn};
use nix::sys::termios::{self, BaudRate, SetArg, SpecialCharacterIndices, Termios};

use crate::Error;

/// Byte-level transport underneath the SLIP framer.
///
/// The surface is deliberately narrow so the layers above can run over an
/// in-memory fake in tests.
pub trait Serial {
    /// Fetch the next received byte, if any.
    fn poll_byte(&mut self) -> Option<u8>;

    /// Transmit one byte. May block until the device accepts it.
    fn put_byte(&mut self, byte: u8);
}

pub(crate) const RX_RING_SIZE: usize = 256;

/// Single-producer single-consumer ring between the reader thread and the
/// main loop. The producer drops bytes when the ring is full rather than
/// overwriting unread data.
pub(crate) struct Ring {
    buf: [AtomicU8; RX_RING_SIZE],
    head: AtomicUsize,
    tail: AtomicUsize,
}

impl Ring {
    pub(crate) fn new() -> Self {
        Ring {
            buf: std::array::from_fn(|_| AtomicU8::new(0)),
            head: AtomicUsize::new(0),
            tail: AtomicUsize::new(0),
        }
    }

    /// Producer side. Returns false when the ring was full and the byte was
    /// dropped.
    pub(crate) fn push(&self, byte: u8) -> bool {
        let head = self.head.load(Ordering::Relaxed);
        let next = (head + 1) % RX_RING_SIZE;

        if next == self.tail.load(Ordering::Acquire) {
            return false;
        }

        self.buf[head].store(byte, Ordering::Relaxed);
        self.head.store(next, Ordering::Release);

        true
    }

    /// Consumer side.
    pub(crate) fn pop(&self) -> Option<u8> {
        let tail = self.tail.load(Ordering::Relaxed);

        if tail == self.head.load(Ordering::Acquire) {
            return None;
        }

        let byte = self.buf[tail].load(Ordering::Relaxed);
        self.tail.store((tail + 1) % RX_RING_SIZE, Ordering::Release);

        Some(byte)
    }
}

/// Serial device backend. A reader thread stands in for the receive
/// interrupt: it drains the tty into the ring, and the main loop consumes
/// from there.
pub struct Tty {
    port: File,
    ring: Arc<Ring>,
    stop: Arc<AtomicBool>,
    reader: Option<thread::JoinHandle<()>>,
    saved: Termios,
}

impl Tty {
    /// Open `path` and switch it to raw 8-N-1 at 9600 baud. The previous
    /// terminal settings are restored on drop.
    pub fn open(path: &str) -> Result<Tty, Error> {
        let port = OpenOptions::new().read(true).write(true).open(path)?;
        let fd = port.as_raw_fd();

        let saved = termios::tcgetattr(fd)?;

        let mut raw = saved.clone();
        termios::cfmakeraw(&mut raw);
        termios::cfsetispeed(&mut raw, BaudRate::B9600)?;
        termios::cfsetospeed(&mut raw, BaudRate::B9600)?;

        // VMIN=0, VTIME=1: reads return within 100ms so the reader thread
        // can notice a shutdown request.
        raw.control_chars[SpecialCharacterIndices::VMIN as usize] = 0;
        raw.control_chars[SpecialCharacterIndices::VTIME as usize] = 1;

        termios::tcsetattr(fd, SetArg::TCSANOW, &raw)?;

        let ring = Arc::new(Ring::new());
        let stop = Arc::new(AtomicBool::new(false));

        let reader = {
            let mut port = port.try_clone()?;
            let ring = ring.clone();
            let stop = stop.clone();

            thread::spawn(move || {
                let mut buf = [0u8; 64];

                while !stop.load(Ordering::Acquire) {
                    match port.read(&mut buf) {
                        Ok(0) => continue,
                        Ok(n) => {
                            for &byte in &buf[..n] {
                                // Overflow loses the newest bytes; the peer
                                // will retransmit.
                                ring.push(byte);
                            }
                        }
                        Err(err) if err.kind() == io::ErrorKind::Interrupted => continue,
                        Err(err) => {
                            warn!("serial read failed: {err}");
                            break;
                        }
                    }
                }
            })
        };

        debug!("opened serial device {path}");

        Ok(Tty {
            port,
            ring,
            stop,
            reader: Some(reader),
            saved,
        })
    }
}

impl Serial for Tty {
    fn poll_byte(&mut self) -> Option<u8> {
        self.ring.pop()
    }

    fn put_byte(&mut self, byte: u8) {
        // The blocking write stands in for the busy-wait on the UART
        // transmit-ready bit; a dead device degrades to dropped output.
        let _ = self.port.write_all(&[byte]);
    }
}

impl Drop for Tty {
    fn drop(&mut self) {
        self.stop.store(true, Ordering::Release);

        if let Some(reader) = self.reader.take() {
            let _ = reader.join();
        }

        let _ = termios::tcsetattr(self.port.as_raw_fd(), SetArg::TCSANOW, &self.saved);
    }
}

/// In-memory transport: bytes queued with [`Mem::feed`] come back out of
/// `poll_byte`, transmitted bytes accumulate in `sent`.
#[derive(Default)]
pub struct Mem {
    pub rx: VecDeque<u8>,
    pub sent: Vec<u8>,
}

impl Mem {
    pub fn new() -> Mem {
        Mem::default()
    }

    pub fn feed(&mut self, bytes: &[u8]) {
        self.rx.extend(bytes);
    }
}

impl Serial for Mem {
    fn poll_byte(&mut self) -> Option<u8> {
        self.rx.pop_front()
    }

    fn put_byte(&mut self, byte: u8) {
        self.sent.push(byte);
    }
}
