//! In-memory null-modem bus.
//!
//! Ports are created by name and wired in pairs: bytes written on one end
//! land in the other end's receive queue, RTS drives the peer's CTS and DTR
//! drives the peer's DSR and RLSD. Opening is exclusive, like a real COM
//! port. The bus also exposes fault injection (unplug, line errors, break,
//! modem lines, a transmit stall) so every monitor and session path can be
//! exercised without hardware.

use std::collections::{HashMap, VecDeque};
use std::sync::{Arc, Condvar, Mutex, MutexGuard, PoisonError, Weak};
use std::time::Instant;

use super::config::{CommTimeouts, ControlBlock};
use super::device::{
    CancelToken, ComStat, CommDevice, DeviceDriver, DeviceError, DeviceResult, EscapeFunction,
    EventMask, LineErrors, QueueCapacity, WriteStatus,
};
use super::status::{HoldFlags, ModemStatus};

/// Output pins of a virtual port.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct OutputLines {
    pub rts: bool,
    pub dtr: bool,
    pub brk: bool,
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
//  Port state
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

struct InFlight {
    data: Vec<u8>,
    queued_at: Instant,
    /// Set once the bytes have left the port.
    transferred: Option<usize>,
}

struct PortState {
    peer: Option<Weak<VirtualPort>>,
    present: bool,
    open: bool,
    generation: u64,
    rx: VecDeque<u8>,
    raised: EventMask,
    armed: EventMask,
    errors: LineErrors,
    inputs: ModemStatus,
    outputs: OutputLines,
    stalled: bool,
    in_flight: Option<InFlight>,
    immediate: Option<u8>,
    cancel_epoch: u64,
    block: Option<ControlBlock>,
    timeouts: CommTimeouts,
    queues: QueueCapacity,
}

impl PortState {
    fn new() -> Self {
        Self {
            peer: None,
            present: true,
            open: false,
            generation: 0,
            rx: VecDeque::new(),
            raised: EventMask::empty(),
            armed: EventMask::empty(),
            errors: LineErrors::empty(),
            inputs: ModemStatus::default(),
            outputs: OutputLines::default(),
            stalled: false,
            in_flight: None,
            immediate: None,
            cancel_epoch: 0,
            block: None,
            timeouts: CommTimeouts::default(),
            queues: QueueCapacity::default(),
        }
    }

    /// Forget everything a previous handle left behind.
    fn reset_session(&mut self) {
        self.rx.clear();
        self.raised = EventMask::empty();
        self.armed = EventMask::empty();
        self.errors = LineErrors::empty();
        self.outputs = OutputLines::default();
        self.in_flight = None;
        self.immediate = None;
        self.block = None;
        self.timeouts = CommTimeouts::default();
        self.queues = QueueCapacity::default();
    }

    fn peer(&self) -> Option<Arc<VirtualPort>> {
        self.peer.as_ref().and_then(Weak::upgrade)
    }

    fn hold_flags(&self) -> u32 {
        let mut hold = HoldFlags::empty();
        if self.stalled && (self.in_flight.is_some() || self.immediate.is_some()) {
            hold |= HoldFlags::CTS_HOLD;
        }
        if self.immediate.is_some() {
            hold |= HoldFlags::IMMEDIATE_WAITING;
        }
        hold.bits()
    }

    fn out_queue(&self) -> usize {
        let pending = self
            .in_flight
            .as_ref()
            .filter(|op| op.transferred.is_none())
            .map_or(0, |op| op.data.len());
        pending + usize::from(self.immediate.is_some())
    }
}

struct VirtualPort {
    name: String,
    state: Mutex<PortState>,
    signal: Condvar,
}

impl VirtualPort {
    fn new(name: &str) -> Arc<Self> {
        Arc::new(Self {
            name: name.to_string(),
            state: Mutex::new(PortState::new()),
            signal: Condvar::new(),
        })
    }

    fn lock(&self) -> MutexGuard<'_, PortState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn wait<'a>(&self, guard: MutexGuard<'a, PortState>) -> MutexGuard<'a, PortState> {
        self.signal.wait(guard).unwrap_or_else(PoisonError::into_inner)
    }

    fn raise(&self, events: EventMask) {
        self.lock().raised |= events;
        self.signal.notify_all();
    }

    /// Bytes arriving on the wire.
    fn receive(&self, bytes: &[u8]) {
        if bytes.is_empty() {
            return;
        }
        let mut st = self.lock();
        if !st.present {
            return;
        }
        st.rx.extend(bytes);
        st.raised |= EventMask::RX_CHAR;
        drop(st);
        self.signal.notify_all();
    }

    /// Set the input lines, raising a change event per line that moved.
    fn set_inputs(&self, lines: ModemStatus) {
        let mut st = self.lock();
        let changed = st.inputs.diff(&lines);
        st.inputs = lines;
        st.raised |= EventMask::for_modem_lines(changed);
        drop(st);
        self.signal.notify_all();
    }

    /// Mirror our outputs onto the peer's inputs (null-modem wiring).
    fn drive_peer(peer: Option<Arc<VirtualPort>>, outputs: OutputLines) {
        if let Some(peer) = peer {
            let ring = peer.lock().inputs.ring;
            peer.set_inputs(ModemStatus {
                cts: outputs.rts,
                dsr: outputs.dtr,
                rlsd: outputs.dtr,
                ring,
            });
        }
    }

    /// Let a stalled transmitter go: the immediate byte first, then the
    /// pending write.
    fn release(&self) {
        let mut st = self.lock();
        st.stalled = false;
        let immediate = st.immediate.take();
        let mut payload = Vec::new();
        if let Some(op) = st.in_flight.as_mut().filter(|op| op.transferred.is_none()) {
            op.transferred = Some(op.data.len());
            payload = op.data.clone();
        }
        if immediate.is_some() || !payload.is_empty() {
            st.raised |= EventMask::TX_EMPTY;
        }
        let peer = st.peer();
        drop(st);
        self.signal.notify_all();

        if let Some(peer) = peer {
            if let Some(byte) = immediate {
                peer.receive(&[byte]);
            }
            peer.receive(&payload);
        }
    }
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
//  Bus
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

/// Registry of virtual ports. Cheap to clone; clones share the same ports.
#[derive(Clone, Default)]
pub struct VirtualBus {
    ports: Arc<Mutex<HashMap<String, Arc<VirtualPort>>>>,
}

impl std::fmt::Debug for VirtualBus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let mut names: Vec<String> = self.registry().keys().cloned().collect();
        names.sort();
        f.debug_struct("VirtualBus").field("ports", &names).finish()
    }
}

impl VirtualBus {
    pub fn new() -> Self {
        Self::default()
    }

    fn registry(&self) -> MutexGuard<'_, HashMap<String, Arc<VirtualPort>>> {
        self.ports.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn port(&self, name: &str) -> DeviceResult<Arc<VirtualPort>> {
        self.registry()
            .get(name)
            .cloned()
            .ok_or_else(|| DeviceError::not_found(name))
    }

    fn ensure(&self, name: &str) -> Arc<VirtualPort> {
        self.registry()
            .entry(name.to_string())
            .or_insert_with(|| VirtualPort::new(name))
            .clone()
    }

    /// Create an unconnected port. Existing ports are left alone.
    pub fn add_port(&self, name: &str) {
        self.ensure(name);
    }

    /// Create `a` and `b` if needed and wire them to each other.
    pub fn connect(&self, a: &str, b: &str) {
        let left = self.ensure(a);
        let right = self.ensure(b);
        left.lock().peer = Some(Arc::downgrade(&right));
        right.lock().peer = Some(Arc::downgrade(&left));
        log::debug!("virtual bus: {a} <-> {b}");
    }

    /// Simulate removal of the device; any open handle goes invalid.
    pub fn unplug(&self, name: &str) -> DeviceResult<()> {
        let port = self.port(name)?;
        let mut st = port.lock();
        st.present = false;
        st.open = false;
        drop(st);
        port.signal.notify_all();
        log::debug!("virtual bus: {name} unplugged");
        Ok(())
    }

    pub fn replug(&self, name: &str) -> DeviceResult<()> {
        self.port(name)?.lock().present = true;
        Ok(())
    }

    /// Hold (`true`) or release (`false`) the transmitter. While held,
    /// writes stay pending and count against the send budget.
    pub fn stall(&self, name: &str, stalled: bool) -> DeviceResult<()> {
        let port = self.port(name)?;
        if stalled {
            port.lock().stalled = true;
        } else {
            port.release();
        }
        Ok(())
    }

    pub fn inject_line_error(&self, name: &str, errors: LineErrors) -> DeviceResult<()> {
        let port = self.port(name)?;
        port.lock().errors |= errors;
        port.raise(EventMask::ERR);
        Ok(())
    }

    pub fn inject_break(&self, name: &str) -> DeviceResult<()> {
        self.port(name)?.raise(EventMask::BREAK);
        Ok(())
    }

    pub fn inject_rx(&self, name: &str, bytes: &[u8]) -> DeviceResult<()> {
        self.port(name)?.receive(bytes);
        Ok(())
    }

    pub fn set_modem_lines(&self, name: &str, lines: ModemStatus) -> DeviceResult<()> {
        self.port(name)?.set_inputs(lines);
        Ok(())
    }

    /// Drain the receive queue of a port nobody has open.
    pub fn take_received(&self, name: &str) -> DeviceResult<Vec<u8>> {
        Ok(self.port(name)?.lock().rx.drain(..).collect())
    }

    pub fn is_open(&self, name: &str) -> bool {
        self.port(name)
            .map(|port| {
                let open = port.lock().open;
                open
            })
            .unwrap_or(false)
    }

    pub fn control_block(&self, name: &str) -> Option<ControlBlock> {
        let port = self.port(name).ok()?;
        let block = port.lock().block;
        block
    }

    pub fn output_lines(&self, name: &str) -> Option<OutputLines> {
        let port = self.port(name).ok()?;
        let outputs = port.lock().outputs;
        Some(outputs)
    }
}

impl DeviceDriver for VirtualBus {
    fn open(&self, port_name: &str) -> DeviceResult<Arc<dyn CommDevice>> {
        let port = self.port(port_name)?;
        let mut st = port.lock();
        if !st.present {
            return Err(DeviceError::not_found(port_name));
        }
        if st.open {
            return Err(DeviceError::access_denied(port_name));
        }
        st.open = true;
        st.generation += 1;
        st.reset_session();
        let generation = st.generation;
        drop(st);

        Ok(Arc::new(VirtualDevice { port, generation }))
    }
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
//  Handle
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

/// Open handle on a virtual port.
pub struct VirtualDevice {
    port: Arc<VirtualPort>,
    generation: u64,
}

impl VirtualDevice {
    fn owns(&self, st: &PortState) -> bool {
        st.present && st.open && st.generation == self.generation
    }

    fn live(&self) -> DeviceResult<MutexGuard<'_, PortState>> {
        let st = self.port.lock();
        if self.owns(&st) {
            Ok(st)
        } else {
            Err(DeviceError::disconnected(&self.port.name))
        }
    }
}

impl CommDevice for VirtualDevice {
    fn name(&self) -> &str {
        &self.port.name
    }

    fn setup_queues(&self, rx: u32, tx: u32) -> DeviceResult<()> {
        self.live()?.queues = QueueCapacity { rx, tx };
        Ok(())
    }

    fn set_control_block(&self, block: &ControlBlock) -> DeviceResult<()> {
        if block.baud_rate == 0 {
            return Err(DeviceError::rejected("baud rate 0"));
        }
        let mut st = self.live()?;
        st.block = Some(*block);
        // Enable (1) and handshake (2) both leave the line asserted while idle.
        st.outputs.rts = matches!(block.rts_control(), 1 | 2);
        st.outputs.dtr = matches!(block.dtr_control(), 1 | 2);
        let outputs = st.outputs;
        let peer = st.peer();
        drop(st);
        VirtualPort::drive_peer(peer, outputs);
        Ok(())
    }

    fn set_timeouts(&self, timeouts: &CommTimeouts) -> DeviceResult<()> {
        self.live()?.timeouts = *timeouts;
        Ok(())
    }

    fn write(&self, data: &[u8]) -> DeviceResult<WriteStatus> {
        let mut st = self.live()?;
        if st.stalled {
            // Bytes still held back stay ahead of the new ones.
            match st.in_flight.as_mut().filter(|op| op.transferred.is_none()) {
                Some(op) => op.data.extend_from_slice(data),
                None => {
                    st.in_flight = Some(InFlight {
                        data: data.to_vec(),
                        queued_at: Instant::now(),
                        transferred: None,
                    })
                }
            }
            return Ok(WriteStatus::Pending);
        }
        st.in_flight = None;
        st.raised |= EventMask::TX_EMPTY;
        let peer = st.peer();
        drop(st);
        self.port.signal.notify_all();

        if let Some(peer) = peer {
            peer.receive(data);
        }
        Ok(WriteStatus::Complete(data.len()))
    }

    fn write_result(&self, wait: bool) -> DeviceResult<Option<usize>> {
        let mut st = self.live()?;
        let epoch = st.cancel_epoch;
        loop {
            let Some(op) = st.in_flight.as_ref() else {
                return Ok(Some(0));
            };
            if let Some(sent) = op.transferred {
                st.in_flight = None;
                return Ok(Some(sent));
            }
            if !wait {
                return Ok(None);
            }
            let deadline = st
                .timeouts
                .write_budget(op.data.len())
                .map(|budget| op.queued_at + budget);
            st = match deadline {
                Some(deadline) => {
                    let now = Instant::now();
                    if now >= deadline {
                        // The write completes short; nothing made it out.
                        st.in_flight = None;
                        return Ok(Some(0));
                    }
                    self.port
                        .signal
                        .wait_timeout(st, deadline - now)
                        .unwrap_or_else(PoisonError::into_inner)
                        .0
                }
                None => self.port.wait(st),
            };
            if st.cancel_epoch != epoch {
                return Err(DeviceError::cancelled());
            }
            if !self.owns(&st) {
                return Err(DeviceError::disconnected(&self.port.name));
            }
        }
    }

    fn set_event_mask(&self, mask: EventMask) -> DeviceResult<()> {
        self.live()?.armed = mask;
        Ok(())
    }

    fn wait_event(&self, cancel: &CancelToken) -> DeviceResult<EventMask> {
        let mut st = self.live()?;
        let epoch = st.cancel_epoch;
        loop {
            if cancel.is_cancelled() || st.cancel_epoch != epoch {
                return Err(DeviceError::cancelled());
            }
            if !self.owns(&st) {
                return Err(DeviceError::disconnected(&self.port.name));
            }
            let hits = st.raised & st.armed;
            if !hits.is_empty() {
                st.raised.remove(hits);
                return Ok(hits);
            }
            st = self.port.wait(st);
        }
    }

    fn read_byte(&self) -> DeviceResult<Option<u8>> {
        Ok(self.live()?.rx.pop_front())
    }

    fn cancel_io(&self) {
        self.port.lock().cancel_epoch += 1;
        self.port.signal.notify_all();
    }

    fn transmit_immediate(&self, byte: u8) -> DeviceResult<()> {
        let mut st = self.live()?;
        if st.stalled {
            if st.immediate.is_some() {
                return Err(DeviceError::rejected("immediate buffer is full"));
            }
            st.immediate = Some(byte);
            return Ok(());
        }
        let peer = st.peer();
        drop(st);
        if let Some(peer) = peer {
            peer.receive(&[byte]);
        }
        Ok(())
    }

    fn modem_status(&self) -> DeviceResult<ModemStatus> {
        Ok(self.live()?.inputs)
    }

    fn clear_error(&self) -> DeviceResult<(LineErrors, ComStat)> {
        let mut st = self.live()?;
        let errors = std::mem::replace(&mut st.errors, LineErrors::empty());
        let stat = ComStat {
            hold_flags: st.hold_flags(),
            in_queue: u32::try_from(st.rx.len()).unwrap_or(u32::MAX),
            out_queue: u32::try_from(st.out_queue()).unwrap_or(u32::MAX),
        };
        Ok((errors, stat))
    }

    fn properties(&self) -> DeviceResult<QueueCapacity> {
        Ok(self.live()?.queues)
    }

    fn escape(&self, function: EscapeFunction) -> DeviceResult<()> {
        let mut st = self.live()?;
        match function {
            EscapeFunction::SetRts => st.outputs.rts = true,
            EscapeFunction::ClrRts => st.outputs.rts = false,
            EscapeFunction::SetDtr => st.outputs.dtr = true,
            EscapeFunction::ClrDtr => st.outputs.dtr = false,
            EscapeFunction::SetBreak => st.outputs.brk = true,
            EscapeFunction::ClrBreak => st.outputs.brk = false,
        }
        let outputs = st.outputs;
        let peer = st.peer();
        drop(st);

        if function == EscapeFunction::SetBreak {
            if let Some(peer) = &peer {
                peer.raise(EventMask::BREAK);
            }
        }
        VirtualPort::drive_peer(peer, outputs);
        Ok(())
    }

    fn is_valid(&self) -> bool {
        self.owns(&self.port.lock())
    }

    fn close(&self) {
        let mut st = self.port.lock();
        if !self.owns(&st) {
            return;
        }
        st.open = false;
        st.cancel_epoch += 1;
        let had_outputs = st.outputs != OutputLines::default();
        st.reset_session();
        let peer = st.peer();
        drop(st);
        self.port.signal.notify_all();

        if had_outputs {
            VirtualPort::drive_peer(peer, OutputLines::default());
        }
    }
}
