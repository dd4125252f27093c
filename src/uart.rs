//! Serial transport for the modem UART.
//!
//! Two dedicated threads own the port: the transmit thread drains a channel
//! of byte bursts to the device, the receive thread reads with an idle
//! timeout — the host analog of receive-to-idle DMA — and pushes received
//! spans into the coordinator queue. [`RxRing`] models the circular receive
//! buffer, including the wrap-around case where a new idle offset lands
//! before the previous one.
//!
//! The line runs raw 8N1 at the configured rate ([`SUPPORTED_BAUDS`]); the
//! idle gap that closes a receive burst is [`RX_IDLE_GAP`], encoded into the
//! port's VTIME. Half-duplex is sufficient at the protocol layer; the
//! coordinator never has a command and a payload in flight simultaneously.

use std::os::fd::BorrowedFd;
use std::os::unix::io::RawFd;
use std::time::Duration;

use nix::fcntl::{self, OFlag};
use nix::sys::stat::Mode;
use nix::sys::termios::{self, BaudRate, SetArg, SpecialCharacterIndices};
use nix::unistd;
use tokio::sync::mpsc;
use tracing::{debug, info, warn};

use crate::config::ModemConfig;
use crate::gsm::CoordinatorHandle;

/// Size of the modeled receive ring.
const RING_SIZE: usize = 1024;

/// Per-read scratch size; AT replies are short.
const READ_BUF_SIZE: usize = 256;

/// Line silence treated as the end of a receive burst. Must be a multiple
/// of 100 ms, the VTIME granularity.
const RX_IDLE_GAP: Duration = Duration::from_millis(100);

/// Line rates the port layer accepts.
pub const SUPPORTED_BAUDS: &[u32] = &[9600, 19200, 38400, 57600, 115_200, 230_400];

/// Circular receive buffer driven by idle-offset events.
pub struct RxRing {
    buf: Vec<u8>,
    read_pos: usize,
    write_pos: usize,
}

impl RxRing {
    #[must_use]
    pub fn new(size: usize) -> Self {
        Self {
            buf: vec![0; size],
            read_pos: 0,
            write_pos: 0,
        }
    }

    /// Copy received bytes into the ring, wrapping at the end. Returns the
    /// write offset afterwards, which doubles as the idle-event offset.
    pub fn write(&mut self, mut bytes: &[u8]) -> usize {
        while !bytes.is_empty() {
            let room = self.buf.len() - self.write_pos;
            let n = bytes.len().min(room);
            self.buf[self.write_pos..self.write_pos + n].copy_from_slice(&bytes[..n]);
            self.write_pos = (self.write_pos + n) % self.buf.len();
            bytes = &bytes[n..];
        }
        self.write_pos
    }

    /// Hand everything between the last consumed position and `offset` to
    /// `sink`. An offset lower than the read position means the ring wrapped;
    /// the tail and head are delivered as two spans, in stream order.
    pub fn on_idle(&mut self, offset: usize, mut sink: impl FnMut(&[u8])) {
        if offset >= self.read_pos {
            if offset > self.read_pos {
                sink(&self.buf[self.read_pos..offset]);
            }
        } else {
            sink(&self.buf[self.read_pos..]);
            if offset > 0 {
                sink(&self.buf[..offset]);
            }
        }
        self.read_pos = offset;
    }
}

/// View the shared descriptor for a nix call.
///
/// # Safety
/// `fd` must be open. The threads never close it, so the `'static` view
/// holds for the life of the process.
unsafe fn port(fd: RawFd) -> BorrowedFd<'static> {
    BorrowedFd::borrow_raw(fd)
}

fn baud_flag(baud: u32) -> Result<BaudRate, String> {
    Ok(match baud {
        9600 => BaudRate::B9600,
        19200 => BaudRate::B19200,
        38400 => BaudRate::B38400,
        57600 => BaudRate::B57600,
        115_200 => BaudRate::B115200,
        230_400 => BaudRate::B230400,
        other => return Err(format!("unsupported baud rate {other}")),
    })
}

/// [`RX_IDLE_GAP`] in VTIME deciseconds.
fn idle_gap_vtime() -> u8 {
    #[allow(clippy::cast_possible_truncation)]
    let vtime = (RX_IDLE_GAP.as_millis() / 100).clamp(1, 255) as u8;
    vtime
}

/// Open the device and put the line into the raw mode the driver expects:
/// 8N1 at the configured rate, no flow control, reads paced by the idle gap.
fn open_port(modem: &ModemConfig) -> Result<RawFd, String> {
    let device = modem.device.as_str();
    let rate = baud_flag(modem.baud)?;

    // O_NONBLOCK only guards the open itself against a wedged modem-status
    // line; the I/O threads want blocking reads paced by VTIME, so it is
    // cleared again right away.
    let fd = fcntl::open(
        device,
        OFlag::O_RDWR | OFlag::O_NOCTTY | OFlag::O_NONBLOCK,
        Mode::empty(),
    )
    .map_err(|e| format!("{device}: open: {e}"))?;

    let flags = OFlag::from_bits_truncate(
        fcntl::fcntl(fd, fcntl::FcntlArg::F_GETFL).map_err(|e| format!("{device}: F_GETFL: {e}"))?,
    );
    fcntl::fcntl(fd, fcntl::FcntlArg::F_SETFL(flags.difference(OFlag::O_NONBLOCK)))
        .map_err(|e| format!("{device}: F_SETFL: {e}"))?;

    // SAFETY: fd was opened above and stays open for the process lifetime
    let view = unsafe { port(fd) };

    let mut tio = termios::tcgetattr(view).map_err(|e| format!("{device}: tcgetattr: {e}"))?;
    termios::cfmakeraw(&mut tio);
    termios::cfsetispeed(&mut tio, rate).map_err(|e| format!("{device}: input rate: {e}"))?;
    termios::cfsetospeed(&mut tio, rate).map_err(|e| format!("{device}: output rate: {e}"))?;

    // The board wires only TX/RX/GND: ignore modem-status lines, keep the
    // receiver on, and leave hardware flow control off.
    tio.control_flags |= termios::ControlFlags::CLOCAL | termios::ControlFlags::CREAD;
    tio.control_flags &= !termios::ControlFlags::CRTSCTS;

    // VMIN=0 with VTIME set makes every read return once the line has been
    // silent for the idle gap — what the receive ring treats as an idle event.
    tio.control_chars[SpecialCharacterIndices::VMIN as usize] = 0;
    tio.control_chars[SpecialCharacterIndices::VTIME as usize] = idle_gap_vtime();

    termios::tcsetattr(view, SetArg::TCSANOW, &tio)
        .map_err(|e| format!("{device}: tcsetattr: {e}"))?;

    // Whatever the modem said while the port was unconfigured is garbage.
    termios::tcflush(view, termios::FlushArg::TCIOFLUSH)
        .map_err(|e| format!("{device}: tcflush: {e}"))?;

    Ok(fd)
}

/// Open the serial device and spawn the transmit/receive thread pair.
///
/// `wire` carries outbound byte bursts from the coordinator; received spans
/// are pushed into `sink` chunk by chunk.
pub fn spawn(
    modem: &ModemConfig,
    wire: mpsc::Receiver<Vec<u8>>,
    sink: CoordinatorHandle,
) -> Result<(), String> {
    let fd = open_port(modem)?;

    let dev = modem.device.clone();
    std::thread::Builder::new()
        .name(format!("uart-tx-{dev}"))
        .spawn(move || transmit_thread(fd, wire, &dev))
        .map_err(|e| format!("spawn uart tx thread: {e}"))?;

    let dev = modem.device.clone();
    std::thread::Builder::new()
        .name(format!("uart-rx-{dev}"))
        .spawn(move || receive_thread(fd, &sink, &dev))
        .map_err(|e| format!("spawn uart rx thread: {e}"))?;

    info!("uart {}: opened ({} 8N1)", modem.device, modem.baud);
    Ok(())
}

/// Drain the wire channel to the device. A write error flushes the port and
/// drops the burst; reception continues untouched.
fn transmit_thread(fd: RawFd, mut wire: mpsc::Receiver<Vec<u8>>, device: &str) {
    // SAFETY: fd stays open for the lifetime of the process
    let view = unsafe { port(fd) };

    while let Some(bytes) = wire.blocking_recv() {
        let mut remaining = bytes.as_slice();
        while !remaining.is_empty() {
            match unistd::write(view, remaining) {
                Ok(n) => remaining = &remaining[n..],
                Err(e) => {
                    warn!("uart {device}: write failed ({e}), flushing port");
                    let _ = termios::tcflush(view, termios::FlushArg::TCIOFLUSH);
                    break;
                }
            }
        }
    }

    debug!("uart {device}: transmit channel closed, thread exiting");
}

/// Read bursts until idle, then hand the new ring span to the coordinator.
fn receive_thread(fd: RawFd, sink: &CoordinatorHandle, device: &str) {
    let mut ring = RxRing::new(RING_SIZE);
    let mut scratch = [0u8; READ_BUF_SIZE];

    loop {
        match unistd::read(fd, &mut scratch) {
            // the idle gap expired with nothing new
            Ok(0) | Err(nix::errno::Errno::EAGAIN) => {}
            Ok(n) => {
                let offset = ring.write(&scratch[..n]);
                ring.on_idle(offset, |span| sink.push_bytes(span));
            }
            Err(e) => {
                warn!("uart {device}: read failed: {e}");
                std::thread::sleep(RX_IDLE_GAP);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn drain(ring: &mut RxRing, offset: usize) -> Vec<u8> {
        let mut out = Vec::new();
        ring.on_idle(offset, |span| out.extend_from_slice(span));
        out
    }

    #[test]
    fn test_ring_straight_span() {
        let mut ring = RxRing::new(16);
        let offset = ring.write(b"OK\r\n");
        assert_eq!(offset, 4);
        assert_eq!(drain(&mut ring, offset), b"OK\r\n");
    }

    #[test]
    fn test_ring_consecutive_writes() {
        let mut ring = RxRing::new(16);
        let first = ring.write(b"RDY");
        assert_eq!(drain(&mut ring, first), b"RDY");
        let second = ring.write(b"\r\nOK");
        assert_eq!(drain(&mut ring, second), b"\r\nOK");
    }

    #[test]
    fn test_ring_wraps_as_two_spans_in_order() {
        let mut ring = RxRing::new(8);
        let first = ring.write(b"abcdef");
        assert_eq!(drain(&mut ring, first), b"abcdef");

        // six more bytes wrap past the end: offset decreases
        let second = ring.write(b"ghijkl");
        assert!(second < first);
        assert_eq!(drain(&mut ring, second), b"ghijkl");
    }

    #[test]
    fn test_ring_wrap_exactly_to_zero() {
        let mut ring = RxRing::new(4);
        let offset = ring.write(b"abcd");
        // a full ring wraps the offset back to zero with nothing consumed yet
        assert_eq!(offset, 0);
        ring.read_pos = 1;
        assert_eq!(drain(&mut ring, 0), b"bcd");
    }

    #[test]
    fn test_ring_empty_idle_event() {
        let mut ring = RxRing::new(8);
        assert_eq!(drain(&mut ring, 0), b"");
    }

    #[test]
    fn test_every_supported_baud_has_a_flag() {
        for &baud in SUPPORTED_BAUDS {
            assert!(baud_flag(baud).is_ok(), "{baud} must map to a termios rate");
        }
    }

    #[test]
    fn test_odd_baud_is_rejected() {
        assert!(baud_flag(12_345).is_err());
        assert!(baud_flag(0).is_err());
    }

    #[test]
    fn test_idle_gap_fits_vtime() {
        // 100 ms is one VTIME decisecond
        assert_eq!(idle_gap_vtime(), 1);
    }
}
