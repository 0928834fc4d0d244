//! Device abstraction.
//!
//! A [`DeviceDriver`] opens named ports and hands back a [`CommDevice`], the
//! primitive set a session needs from the OS: queue sizing, control block,
//! timeouts, an overlapped write with a completion query, a cancellable event
//! wait, a non-blocking single-byte read, status queries and the escape
//! functions driving the output pins.
//!
//! Two backends live in this crate: [`VirtualBus`](super::virtual_port::VirtualBus)
//! (in-memory null-modem pairs) and [`SystemDriver`](super::system::SystemDriver)
//! (OS ports through `serialport`).

use std::fmt;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use bitflags::bitflags;
use thiserror::Error;

use super::config::{CommTimeouts, ControlBlock};
use super::status::ModemStatus;

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
//  Bit sets
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

bitflags! {
    /// Device events the monitor waits for.
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
    pub struct EventMask: u32 {
        /// A byte was placed in the receive queue.
        const RX_CHAR   = 0x0001;
        /// The last byte of the transmit queue was sent.
        const TX_EMPTY  = 0x0004;
        const CTS       = 0x0008;
        const DSR       = 0x0010;
        const RLSD      = 0x0020;
        /// A break was detected on input.
        const BREAK     = 0x0040;
        /// A line-status error occurred.
        const ERR       = 0x0080;
        const RING      = 0x0100;
    }
}

impl EventMask {
    /// Everything the event monitor arms.
    pub const MONITORED: Self = Self::all();

    /// Modem lines whose change bit is set in this mask.
    pub fn modem_changes(&self) -> ModemStatus {
        ModemStatus {
            cts: self.contains(Self::CTS),
            dsr: self.contains(Self::DSR),
            rlsd: self.contains(Self::RLSD),
            ring: self.contains(Self::RING),
        }
    }

    /// Change events matching the lines set in `lines`.
    pub fn for_modem_lines(lines: ModemStatus) -> Self {
        let mut mask = Self::empty();
        mask.set(Self::CTS, lines.cts);
        mask.set(Self::DSR, lines.dsr);
        mask.set(Self::RLSD, lines.rlsd);
        mask.set(Self::RING, lines.ring);
        mask
    }
}

bitflags! {
    /// Line-status errors reported when the device is cleared.
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
    pub struct LineErrors: u32 {
        const RX_OVER   = 0x0001;
        const OVERRUN   = 0x0002;
        const RX_PARITY = 0x0004;
        const FRAME     = 0x0008;
        const BREAK     = 0x0010;
        const TX_FULL   = 0x0100;
        const IO        = 0x0400;
    }
}

impl fmt::Display for LineErrors {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        const NAMES: [(LineErrors, &str); 7] = [
            (LineErrors::FRAME, "Framing"),
            (LineErrors::IO, "IO"),
            (LineErrors::OVERRUN, "Overrun"),
            (LineErrors::RX_OVER, "Receive Overflow"),
            (LineErrors::RX_PARITY, "Parity"),
            (LineErrors::TX_FULL, "Transmit Overflow"),
            (LineErrors::BREAK, "Break"),
        ];
        let names: Vec<&str> = NAMES
            .iter()
            .filter(|(flag, _)| self.contains(*flag))
            .map(|(_, name)| *name)
            .collect();
        if names.is_empty() {
            f.write_str("Unknown")
        } else {
            f.write_str(&names.join(","))
        }
    }
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
//  Errors
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DeviceErrorKind {
    /// Another process or session already holds the port.
    AccessDenied,
    NotFound,
    /// The operation was aborted through `cancel_io` or a cancel token.
    Cancelled,
    /// The handle is no longer valid (device removed or closed).
    Disconnected,
    /// The driver refused a setting or request.
    Rejected,
    Io,
}

/// Error returned by a device primitive.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("[{kind:?}] {message}")]
pub struct DeviceError {
    pub kind: DeviceErrorKind,
    pub message: String,
}

impl DeviceError {
    pub fn new(kind: DeviceErrorKind, message: impl Into<String>) -> Self {
        Self { kind, message: message.into() }
    }

    pub fn access_denied(port: &str) -> Self {
        Self::new(DeviceErrorKind::AccessDenied, format!("{port} is in use"))
    }

    pub fn not_found(port: &str) -> Self {
        Self::new(DeviceErrorKind::NotFound, format!("{port} does not exist"))
    }

    pub fn cancelled() -> Self {
        Self::new(DeviceErrorKind::Cancelled, "operation cancelled")
    }

    pub fn disconnected(port: &str) -> Self {
        Self::new(DeviceErrorKind::Disconnected, format!("{port} handle is no longer valid"))
    }

    pub fn rejected(message: impl Into<String>) -> Self {
        Self::new(DeviceErrorKind::Rejected, message)
    }

    pub fn is_cancelled(&self) -> bool {
        self.kind == DeviceErrorKind::Cancelled
    }
}

impl From<std::io::Error> for DeviceError {
    fn from(err: std::io::Error) -> Self {
        let kind = match err.kind() {
            std::io::ErrorKind::PermissionDenied => DeviceErrorKind::AccessDenied,
            std::io::ErrorKind::NotFound => DeviceErrorKind::NotFound,
            std::io::ErrorKind::Interrupted => DeviceErrorKind::Cancelled,
            std::io::ErrorKind::BrokenPipe | std::io::ErrorKind::NotConnected => {
                DeviceErrorKind::Disconnected
            }
            _ => DeviceErrorKind::Io,
        };
        Self::new(kind, err.to_string())
    }
}

pub type DeviceResult<T> = Result<T, DeviceError>;

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
//  Primitive value types
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

/// Outcome of queueing a write.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WriteStatus {
    /// Finished synchronously; carries the bytes transferred.
    Complete(usize),
    /// Still in flight; query with [`CommDevice::write_result`].
    Pending,
}

/// Queue depths and hold reasons, as returned when clearing errors.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ComStat {
    pub hold_flags: u32,
    pub in_queue: u32,
    pub out_queue: u32,
}

/// Current driver queue sizes; zero when the driver does not say.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct QueueCapacity {
    pub rx: u32,
    pub tx: u32,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EscapeFunction {
    SetRts,
    ClrRts,
    SetDtr,
    ClrDtr,
    SetBreak,
    ClrBreak,
}

impl EscapeFunction {
    pub fn rts(level: bool) -> Self {
        if level { Self::SetRts } else { Self::ClrRts }
    }

    pub fn dtr(level: bool) -> Self {
        if level { Self::SetDtr } else { Self::ClrDtr }
    }

    pub fn brk(level: bool) -> Self {
        if level { Self::SetBreak } else { Self::ClrBreak }
    }
}

/// Shared flag telling the monitor loop and blocking waits to give up.
#[derive(Debug, Clone, Default)]
pub struct CancelToken(Arc<AtomicBool>);

impl CancelToken {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn cancel(&self) {
        self.0.store(true, Ordering::SeqCst);
    }

    pub fn is_cancelled(&self) -> bool {
        self.0.load(Ordering::SeqCst)
    }
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
//  Traits
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

/// Opens named ports.
pub trait DeviceDriver: Send + Sync {
    /// Open `port_name` exclusively.
    ///
    /// A port held elsewhere must fail with [`DeviceErrorKind::AccessDenied`].
    fn open(&self, port_name: &str) -> DeviceResult<Arc<dyn CommDevice>>;
}

/// An open port handle.
///
/// Shared between the session (foreground calls) and the event monitor
/// thread, so every method takes `&self`.
pub trait CommDevice: Send + Sync {
    fn name(&self) -> &str;

    /// Request driver queue sizes.
    fn setup_queues(&self, rx: u32, tx: u32) -> DeviceResult<()>;

    fn set_control_block(&self, block: &ControlBlock) -> DeviceResult<()>;

    fn set_timeouts(&self, timeouts: &CommTimeouts) -> DeviceResult<()>;

    /// Queue `data` for transmission. A pending write replaces nothing; the
    /// caller confirms it through [`write_result`](Self::write_result).
    fn write(&self, data: &[u8]) -> DeviceResult<WriteStatus>;

    /// Completion of the last pending write.
    ///
    /// With `wait` the call blocks until the write finishes or the send
    /// budget runs out and returns `Some(bytes_transferred)`. Without it
    /// `None` means still in flight.
    fn write_result(&self, wait: bool) -> DeviceResult<Option<usize>>;

    fn set_event_mask(&self, mask: EventMask) -> DeviceResult<()>;

    /// Block until an armed event fires, `cancel` is set, or
    /// [`cancel_io`](Self::cancel_io) is called.
    fn wait_event(&self, cancel: &CancelToken) -> DeviceResult<EventMask>;

    /// Next received byte, or `None` when the queue is empty.
    fn read_byte(&self) -> DeviceResult<Option<u8>>;

    /// Abort every blocking call in progress on this handle, including the
    /// pending write.
    fn cancel_io(&self);

    /// Send one byte ahead of anything queued.
    fn transmit_immediate(&self, byte: u8) -> DeviceResult<()>;

    fn modem_status(&self) -> DeviceResult<ModemStatus>;

    /// Read and reset the line-error flags.
    fn clear_error(&self) -> DeviceResult<(LineErrors, ComStat)>;

    fn properties(&self) -> DeviceResult<QueueCapacity>;

    fn escape(&self, function: EscapeFunction) -> DeviceResult<()>;

    /// Whether the handle still refers to a live device.
    fn is_valid(&self) -> bool;

    /// Release the handle. Further calls fail with
    /// [`DeviceErrorKind::Disconnected`].
    fn close(&self);
}
