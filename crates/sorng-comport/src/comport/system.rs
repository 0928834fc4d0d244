//! OS serial ports through the `serialport` crate.
//!
//! `serialport` offers blocking reads and writes, modem line queries and
//! queue depths, but no event wait. The wait is emulated by polling the input
//! depth, the modem lines and the output depth every few milliseconds until
//! an armed event shows up or the wait is cancelled.
//!
//! Three handles share the port. The monitor thread reads, polls and queries
//! status through one; a `comport-tx` writer thread owns another, so a write
//! only queues bytes and never blocks the caller; configuration, pins and the
//! immediate byte go through the third.

use std::io::{self, Read, Write};
use std::sync::atomic::{AtomicBool, AtomicU32, AtomicU64, Ordering};
use std::sync::{mpsc, Arc, Condvar, Mutex, MutexGuard, PoisonError};
use std::thread;
use std::time::{Duration, Instant};

use serialport::{ClearBuffer, FlowControl, SerialPort};

use super::config::{CommTimeouts, ControlBlock, HsOutput};
use super::device::{
    CancelToken, ComStat, CommDevice, DeviceDriver, DeviceError, DeviceErrorKind, DeviceResult,
    EscapeFunction, EventMask, LineErrors, QueueCapacity, WriteStatus,
};
use super::status::ModemStatus;

const POLL_INTERVAL: Duration = Duration::from_millis(5);
const READ_TIMEOUT: Duration = Duration::from_millis(1);
/// Longest wait for room in the output queue; deadlines and cancellation
/// are checked between waits.
const WRITE_SLICE: Duration = Duration::from_millis(20);
const WRITER_THREAD_NAME: &str = "comport-tx";

/// Opens OS ports by name (`COM3`, `/dev/ttyUSB0`, …).
#[derive(Debug, Clone, Copy, Default)]
pub struct SystemDriver;

impl DeviceDriver for SystemDriver {
    fn open(&self, port_name: &str) -> DeviceResult<Arc<dyn CommDevice>> {
        let port = serialport::new(port_name, 9600)
            .timeout(READ_TIMEOUT)
            .open()
            .map_err(|e| port_error(port_name, e))?;
        let device = SystemDevice::new(port_name, port)?;
        log::debug!("{port_name}: opened system port");
        Ok(Arc::new(device))
    }
}

fn port_error(port: &str, err: serialport::Error) -> DeviceError {
    let kind = match err.kind() {
        serialport::ErrorKind::NoDevice => DeviceErrorKind::NotFound,
        serialport::ErrorKind::InvalidInput => DeviceErrorKind::Rejected,
        serialport::ErrorKind::Io(io::ErrorKind::PermissionDenied) => DeviceErrorKind::AccessDenied,
        serialport::ErrorKind::Io(io::ErrorKind::NotFound) => DeviceErrorKind::NotFound,
        _ if err.description.to_lowercase().contains("busy") => DeviceErrorKind::AccessDenied,
        _ => DeviceErrorKind::Io,
    };
    DeviceError::new(kind, format!("{port}: {}", err.description))
}

fn io_error(err: io::Error) -> DeviceError {
    DeviceError::from(err)
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
//  Control block → serialport settings
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
struct LineSettings {
    baud_rate: u32,
    data_bits: serialport::DataBits,
    parity: serialport::Parity,
    stop_bits: serialport::StopBits,
    flow_control: FlowControl,
}

impl LineSettings {
    fn from_block(block: &ControlBlock) -> DeviceResult<Self> {
        let data_bits = match block.byte_size {
            5 => serialport::DataBits::Five,
            6 => serialport::DataBits::Six,
            7 => serialport::DataBits::Seven,
            8 => serialport::DataBits::Eight,
            other => return Err(DeviceError::rejected(format!("{other} data bits"))),
        };
        let parity = match block.parity {
            0 => serialport::Parity::None,
            1 => serialport::Parity::Odd,
            2 => serialport::Parity::Even,
            _ => return Err(DeviceError::rejected("mark/space parity is not supported")),
        };
        let stop_bits = match block.stop_bits {
            0 => serialport::StopBits::One,
            2 => serialport::StopBits::Two,
            _ => return Err(DeviceError::rejected("1.5 stop bits are not supported")),
        };
        let handshake = HsOutput::Handshake.code();
        let flow_control = if block.has(ControlBlock::OUT_X) || block.has(ControlBlock::IN_X) {
            FlowControl::Software
        } else if block.has(ControlBlock::OUT_X_CTS_FLOW) || block.rts_control() == handshake {
            FlowControl::Hardware
        } else {
            FlowControl::None
        };
        Ok(Self {
            baud_rate: block.baud_rate,
            data_bits,
            parity,
            stop_bits,
            flow_control,
        })
    }
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
//  Transmitter
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

struct TxJob {
    id: u64,
    data: Vec<u8>,
    deadline: Option<Instant>,
}

/// Outcome of the most recent write.
struct TxRecord {
    id: u64,
    sent: usize,
    done: bool,
    failure: Option<DeviceError>,
}

#[derive(Default)]
struct TxState {
    next_id: u64,
    last: Option<TxRecord>,
    /// Bytes handed to the writer thread and not yet written or dropped.
    queued: usize,
}

/// State shared with the writer thread.
#[derive(Default)]
struct Shared {
    closed: AtomicBool,
    cancel_epoch: AtomicU64,
    /// Set once a write moved bytes, cleared when the output queue drains.
    tx_draining: AtomicBool,
    tx: Mutex<TxState>,
    tx_done: Condvar,
}

impl Shared {
    /// Push `job` out a byte at a time until it is done, its deadline passes
    /// or I/O is cancelled.
    fn send(&self, port: &mut dyn SerialPort, job: &TxJob) -> (usize, Option<DeviceError>) {
        let epoch = self.cancel_epoch.load(Ordering::SeqCst);
        let mut sent = 0;
        while sent < job.data.len() {
            if self.cancel_epoch.load(Ordering::SeqCst) != epoch {
                return (sent, Some(DeviceError::cancelled()));
            }
            if self.closed.load(Ordering::SeqCst)
                || job.deadline.is_some_and(|deadline| Instant::now() >= deadline)
            {
                break;
            }
            // The handle blocks; a writable handle only has room for one
            // byte for certain.
            match port.write(&job.data[sent..=sent]) {
                Ok(0) => break,
                Ok(n) => sent += n,
                Err(e)
                    if matches!(
                        e.kind(),
                        io::ErrorKind::TimedOut | io::ErrorKind::WouldBlock | io::ErrorKind::Interrupted
                    ) => {}
                Err(e) => return (sent, Some(io_error(e))),
            }
        }
        (sent, None)
    }

    fn finish(&self, job: &TxJob, sent: usize, failure: Option<DeviceError>) {
        if sent > 0 {
            self.tx_draining.store(true, Ordering::SeqCst);
        }
        let mut tx = lock(&self.tx);
        tx.queued = tx.queued.saturating_sub(job.data.len());
        if let Some(record) = tx.last.as_mut().filter(|r| r.id == job.id) {
            record.sent = sent;
            record.done = true;
            record.failure = failure;
        }
        drop(tx);
        self.tx_done.notify_all();
    }
}

fn transmit(mut port: Box<dyn SerialPort>, jobs: mpsc::Receiver<TxJob>, shared: Arc<Shared>) {
    while let Ok(job) = jobs.recv() {
        let (sent, failure) = shared.send(&mut *port, &job);
        if let Some(e) = failure.as_ref().filter(|e| e.kind != DeviceErrorKind::Cancelled) {
            log::warn!("write failed after {sent} of {} bytes: {e}", job.data.len());
        }
        shared.finish(&job, sent, failure);
    }
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
//  Device
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

/// Last levels seen by the poller.
#[derive(Debug, Default)]
struct PollSnapshot {
    lines: ModemStatus,
}

pub struct SystemDevice {
    name: String,
    /// Settings, pins and the immediate byte.
    io: Mutex<Box<dyn SerialPort>>,
    /// Reads, polling and status queries.
    reader: Mutex<Box<dyn SerialPort>>,
    jobs: Mutex<Option<mpsc::Sender<TxJob>>>,
    shared: Arc<Shared>,
    armed: AtomicU32,
    timeouts: Mutex<CommTimeouts>,
    snapshot: Mutex<PollSnapshot>,
}

fn lock<T: ?Sized>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

fn read_lines(port: &mut dyn SerialPort) -> serialport::Result<ModemStatus> {
    Ok(ModemStatus {
        cts: port.read_clear_to_send()?,
        dsr: port.read_data_set_ready()?,
        rlsd: port.read_carrier_detect()?,
        ring: port.read_ring_indicator()?,
    })
}

impl SystemDevice {
    fn new(name: &str, io: Box<dyn SerialPort>) -> DeviceResult<Self> {
        let reader = io.try_clone().map_err(|e| port_error(name, e))?;
        let mut writer = io.try_clone().map_err(|e| port_error(name, e))?;
        writer.set_timeout(WRITE_SLICE).map_err(|e| port_error(name, e))?;

        let shared = Arc::new(Shared::default());
        let (jobs, queue) = mpsc::channel();
        let worker = shared.clone();
        thread::Builder::new()
            .name(WRITER_THREAD_NAME.to_string())
            .spawn(move || transmit(writer, queue, worker))?;

        Ok(Self {
            name: name.to_string(),
            io: Mutex::new(io),
            reader: Mutex::new(reader),
            jobs: Mutex::new(Some(jobs)),
            shared,
            armed: AtomicU32::new(0),
            timeouts: Mutex::new(CommTimeouts::default()),
            snapshot: Mutex::new(PollSnapshot::default()),
        })
    }

    fn ensure_open(&self) -> DeviceResult<()> {
        if self.shared.closed.load(Ordering::SeqCst) {
            Err(DeviceError::disconnected(&self.name))
        } else {
            Ok(())
        }
    }

    fn err(&self, e: serialport::Error) -> DeviceError {
        port_error(&self.name, e)
    }

    /// One sampling pass: which events would the driver have signalled?
    fn poll(&self) -> DeviceResult<EventMask> {
        let mut fired = EventMask::empty();
        let mut reader = lock(&self.reader);
        if reader.bytes_to_read().map_err(|e| self.err(e))? > 0 {
            fired |= EventMask::RX_CHAR;
        }
        if self.shared.tx_draining.load(Ordering::SeqCst)
            && lock(&self.shared.tx).queued == 0
            && reader.bytes_to_write().map_err(|e| self.err(e))? == 0
        {
            self.shared.tx_draining.store(false, Ordering::SeqCst);
            fired |= EventMask::TX_EMPTY;
        }
        let lines = read_lines(&mut **reader).map_err(|e| self.err(e))?;
        drop(reader);

        let mut snapshot = lock(&self.snapshot);
        fired |= EventMask::for_modem_lines(snapshot.lines.diff(&lines));
        snapshot.lines = lines;
        Ok(fired)
    }
}

impl CommDevice for SystemDevice {
    fn name(&self) -> &str {
        &self.name
    }

    fn setup_queues(&self, rx: u32, tx: u32) -> DeviceResult<()> {
        self.ensure_open()?;
        log::debug!("{}: queue sizes {rx}/{tx} requested, driver keeps its own", self.name);
        Ok(())
    }

    fn set_control_block(&self, block: &ControlBlock) -> DeviceResult<()> {
        self.ensure_open()?;
        let settings = LineSettings::from_block(block)?;
        let mut port = lock(&self.io);
        port.set_baud_rate(settings.baud_rate).map_err(|e| self.err(e))?;
        port.set_data_bits(settings.data_bits).map_err(|e| self.err(e))?;
        port.set_parity(settings.parity).map_err(|e| self.err(e))?;
        port.set_stop_bits(settings.stop_bits).map_err(|e| self.err(e))?;
        port.set_flow_control(settings.flow_control).map_err(|e| self.err(e))?;
        // Disable (0) and enable (1) are set here; handshake and toggle are
        // left to the driver.
        match block.rts_control() {
            0 => port.write_request_to_send(false).map_err(|e| self.err(e))?,
            1 => port.write_request_to_send(true).map_err(|e| self.err(e))?,
            _ => {}
        }
        match block.dtr_control() {
            0 => port.write_data_terminal_ready(false).map_err(|e| self.err(e))?,
            1 => port.write_data_terminal_ready(true).map_err(|e| self.err(e))?,
            _ => {}
        }
        let lines = read_lines(&mut **port).map_err(|e| self.err(e))?;
        lock(&self.snapshot).lines = lines;
        Ok(())
    }

    fn set_timeouts(&self, timeouts: &CommTimeouts) -> DeviceResult<()> {
        self.ensure_open()?;
        *lock(&self.timeouts) = *timeouts;
        Ok(())
    }

    /// Hand `data` to the writer thread. Always pending; the outcome is
    /// collected with [`write_result`](CommDevice::write_result).
    fn write(&self, data: &[u8]) -> DeviceResult<WriteStatus> {
        self.ensure_open()?;
        if data.is_empty() {
            return Ok(WriteStatus::Complete(0));
        }
        let deadline = lock(&self.timeouts)
            .write_budget(data.len())
            .map(|budget| Instant::now() + budget);

        let mut tx = lock(&self.shared.tx);
        tx.next_id += 1;
        let id = tx.next_id;
        tx.last = Some(TxRecord {
            id,
            sent: 0,
            done: false,
            failure: None,
        });
        tx.queued += data.len();
        drop(tx);

        let job = TxJob {
            id,
            data: data.to_vec(),
            deadline,
        };
        let sent = lock(&self.jobs)
            .as_ref()
            .map(|jobs| jobs.send(job).is_ok())
            .unwrap_or(false);
        if !sent {
            let mut tx = lock(&self.shared.tx);
            tx.last = None;
            tx.queued = tx.queued.saturating_sub(data.len());
            return Err(DeviceError::disconnected(&self.name));
        }
        Ok(WriteStatus::Pending)
    }

    fn write_result(&self, wait: bool) -> DeviceResult<Option<usize>> {
        let mut tx = lock(&self.shared.tx);
        loop {
            match tx.last.take() {
                None => return Ok(Some(0)),
                Some(record) if record.done => {
                    return match record.failure {
                        Some(e) => Err(e),
                        None => Ok(Some(record.sent)),
                    };
                }
                Some(record) => tx.last = Some(record),
            }
            if !wait {
                return Ok(None);
            }
            self.ensure_open()?;
            tx = self
                .shared
                .tx_done
                .wait(tx)
                .unwrap_or_else(PoisonError::into_inner);
        }
    }

    fn set_event_mask(&self, mask: EventMask) -> DeviceResult<()> {
        self.ensure_open()?;
        self.armed.store(mask.bits(), Ordering::SeqCst);
        Ok(())
    }

    fn wait_event(&self, cancel: &CancelToken) -> DeviceResult<EventMask> {
        let epoch = self.shared.cancel_epoch.load(Ordering::SeqCst);
        loop {
            if cancel.is_cancelled() || self.shared.cancel_epoch.load(Ordering::SeqCst) != epoch {
                return Err(DeviceError::cancelled());
            }
            self.ensure_open()?;
            let armed = EventMask::from_bits_truncate(self.armed.load(Ordering::SeqCst));
            let fired = self.poll()? & armed;
            if !fired.is_empty() {
                return Ok(fired);
            }
            thread::sleep(POLL_INTERVAL);
        }
    }

    fn read_byte(&self) -> DeviceResult<Option<u8>> {
        self.ensure_open()?;
        let mut reader = lock(&self.reader);
        if reader.bytes_to_read().map_err(|e| self.err(e))? == 0 {
            return Ok(None);
        }
        let mut byte = [0u8; 1];
        match reader.read(&mut byte) {
            Ok(1) => Ok(Some(byte[0])),
            Ok(_) => Ok(None),
            Err(e) if matches!(e.kind(), io::ErrorKind::TimedOut | io::ErrorKind::WouldBlock) => {
                Ok(None)
            }
            Err(e) => Err(io_error(e)),
        }
    }

    /// Ends the event wait and abandons the write in progress.
    fn cancel_io(&self) {
        self.shared.cancel_epoch.fetch_add(1, Ordering::SeqCst);
        let _tx = lock(&self.shared.tx);
        self.shared.tx_done.notify_all();
    }

    fn transmit_immediate(&self, byte: u8) -> DeviceResult<()> {
        self.ensure_open()?;
        lock(&self.io)
            .write_all(&[byte])
            .map_err(|e| DeviceError::rejected(e.to_string()))?;
        self.shared.tx_draining.store(true, Ordering::SeqCst);
        Ok(())
    }

    fn modem_status(&self) -> DeviceResult<ModemStatus> {
        self.ensure_open()?;
        read_lines(&mut **lock(&self.reader)).map_err(|e| self.err(e))
    }

    fn clear_error(&self) -> DeviceResult<(LineErrors, ComStat)> {
        self.ensure_open()?;
        let queued = lock(&self.shared.tx).queued;
        let port = lock(&self.reader);
        let os_out = port.bytes_to_write().map_err(|e| self.err(e))?;
        let stat = ComStat {
            hold_flags: 0,
            in_queue: port.bytes_to_read().map_err(|e| self.err(e))?,
            out_queue: os_out.saturating_add(u32::try_from(queued).unwrap_or(u32::MAX)),
        };
        // `serialport` does not surface UART error flags.
        Ok((LineErrors::empty(), stat))
    }

    fn properties(&self) -> DeviceResult<QueueCapacity> {
        self.ensure_open()?;
        Ok(QueueCapacity::default())
    }

    fn escape(&self, function: EscapeFunction) -> DeviceResult<()> {
        self.ensure_open()?;
        let mut port = lock(&self.io);
        let result = match function {
            EscapeFunction::SetRts => port.write_request_to_send(true),
            EscapeFunction::ClrRts => port.write_request_to_send(false),
            EscapeFunction::SetDtr => port.write_data_terminal_ready(true),
            EscapeFunction::ClrDtr => port.write_data_terminal_ready(false),
            EscapeFunction::SetBreak => port.set_break(),
            EscapeFunction::ClrBreak => port.clear_break(),
        };
        result.map_err(|e| self.err(e))
    }

    fn is_valid(&self) -> bool {
        !self.shared.closed.load(Ordering::SeqCst) && lock(&self.reader).bytes_to_read().is_ok()
    }

    fn close(&self) {
        if self.shared.closed.swap(true, Ordering::SeqCst) {
            return;
        }
        // The writer thread exits once its queue is gone.
        lock(&self.jobs).take();
        self.cancel_io();
        if let Err(e) = lock(&self.io).clear(ClearBuffer::All) {
            log::debug!("{}: discarding buffers on close failed: {e}", self.name);
        }
        log::debug!("{}: system port closed", self.name);
    }
}

impl Drop for SystemDevice {
    fn drop(&mut self) {
        self.close();
    }
}
