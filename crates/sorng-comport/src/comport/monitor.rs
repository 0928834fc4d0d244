//! Event monitor.
//!
//! One OS thread per online session waits on the device for the armed
//! events and turns them into [`SerialEvent`]s. It never touches session
//! state: a failure is parked in the shared [`FaultRecord`] and picked up
//! by the next foreground call.

use std::panic::{self, AssertUnwindSafe};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, PoisonError};
use std::thread::{self, JoinHandle, ThreadId};

use super::device::{CancelToken, CommDevice, DeviceError, EventMask};
use super::error::{CommError, CommResult};
use super::events::{EventHub, SerialEvent};

pub const MONITOR_THREAD_NAME: &str = "comport-rx";

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
//  Fault record
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

/// Last fault of the monitor thread, reported at most once.
#[derive(Debug, Default)]
pub struct FaultRecord {
    slot: Mutex<Option<CommError>>,
    raised: AtomicBool,
    reported: AtomicBool,
}

impl FaultRecord {
    pub fn new() -> Self {
        Self::default()
    }

    /// Park `fault`. The slot is filled before `raised` flips so a claimer
    /// that sees the flag also sees the error.
    pub fn record(&self, fault: CommError) {
        *self.slot.lock().unwrap_or_else(PoisonError::into_inner) = Some(fault);
        self.reported.store(false, Ordering::SeqCst);
        self.raised.store(true, Ordering::SeqCst);
    }

    /// Take the parked fault if nobody has reported it yet.
    pub fn claim(&self) -> Option<CommError> {
        if !self.raised.load(Ordering::SeqCst) {
            return None;
        }
        self.reported
            .compare_exchange(false, true, Ordering::SeqCst, Ordering::SeqCst)
            .ok()?;
        self.slot.lock().unwrap_or_else(PoisonError::into_inner).clone()
    }

    pub fn peek(&self) -> Option<CommError> {
        if !self.raised.load(Ordering::SeqCst) {
            return None;
        }
        self.slot.lock().unwrap_or_else(PoisonError::into_inner).clone()
    }

    pub fn is_pending(&self) -> bool {
        self.raised.load(Ordering::SeqCst) && !self.reported.load(Ordering::SeqCst)
    }

    pub fn clear(&self) {
        self.raised.store(false, Ordering::SeqCst);
        self.reported.store(false, Ordering::SeqCst);
        *self.slot.lock().unwrap_or_else(PoisonError::into_inner) = None;
    }
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
//  Thread handle
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

/// Owner of a running monitor thread.
#[derive(Debug)]
pub struct MonitorHandle {
    cancel: CancelToken,
    thread: Option<JoinHandle<()>>,
    thread_id: ThreadId,
}

impl MonitorHandle {
    /// Start monitoring `device`.
    pub fn spawn(
        device: Arc<dyn CommDevice>,
        events: Arc<EventHub>,
        faults: Arc<FaultRecord>,
    ) -> CommResult<Self> {
        let cancel = CancelToken::new();
        let monitor = EventMonitor {
            device,
            events,
            cancel: cancel.clone(),
        };
        let thread = thread::Builder::new()
            .name(MONITOR_THREAD_NAME.to_string())
            .spawn(move || monitor.run(&faults))
            .map_err(|e| CommError::device(format!("failed to start monitor thread: {e}")))?;
        let thread_id = thread.thread().id();
        Ok(Self {
            cancel,
            thread: Some(thread),
            thread_id,
        })
    }

    pub fn is_current_thread(&self) -> bool {
        thread::current().id() == self.thread_id
    }

    pub fn is_finished(&self) -> bool {
        self.thread.as_ref().map_or(true, JoinHandle::is_finished)
    }

    /// Signal the thread, abort the wait it is blocked in, then join it.
    /// Called from the monitor thread itself the handle is detached instead.
    pub fn stop(mut self, device: &dyn CommDevice) {
        self.cancel.cancel();
        device.cancel_io();
        let Some(thread) = self.thread.take() else {
            return;
        };
        if self.is_current_thread() {
            log::debug!("{}: monitor stopped from its own thread, detaching", device.name());
            return;
        }
        if thread.join().is_err() {
            log::error!("{}: monitor thread panicked", device.name());
        }
    }
}

impl Drop for MonitorHandle {
    fn drop(&mut self) {
        // Only reached when `stop` was never called; the thread exits on its
        // next wake-up.
        self.cancel.cancel();
    }
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
//  Loop
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

struct EventMonitor {
    device: Arc<dyn CommDevice>,
    events: Arc<EventHub>,
    cancel: CancelToken,
}

impl EventMonitor {
    fn run(self, faults: &FaultRecord) {
        log::debug!("{}: monitor started", self.device.name());
        match self.pump() {
            Ok(()) => log::debug!("{}: monitor stopped", self.device.name()),
            Err(fault) => {
                log::error!("{}: monitor failed: {fault}", self.device.name());
                faults.record(fault.clone());
                // A panicking handler cannot take the fault down with it.
                let _ = self.publish(SerialEvent::ThreadFault(fault));
            }
        }
    }

    fn pump(&self) -> CommResult<()> {
        loop {
            if self.cancel.is_cancelled() {
                return Ok(());
            }
            self.device
                .set_event_mask(EventMask::MONITORED)
                .map_err(|e| self.fault("event mask rejected", e))?;
            let fired = match self.device.wait_event(&self.cancel) {
                Ok(fired) => fired,
                Err(_) if self.cancel.is_cancelled() => return Ok(()),
                Err(e) => return Err(self.fault("event wait failed", e)),
            };
            if !self.dispatch(fired)? {
                return Ok(());
            }
        }
    }

    /// Handle one batch of events. `Ok(false)` means a cooperative stop was
    /// observed mid-batch.
    fn dispatch(&self, fired: EventMask) -> CommResult<bool> {
        if fired.contains(EventMask::ERR) {
            let (errors, _) = self
                .device
                .clear_error()
                .map_err(|e| self.fault("line status query failed", e))?;
            return Err(CommError::LineError(errors));
        }

        if fired.contains(EventMask::RX_CHAR) && !self.drain()? {
            return Ok(false);
        }
        if fired.contains(EventMask::TX_EMPTY) {
            self.publish(SerialEvent::TransmitComplete)?;
        }
        if fired.contains(EventMask::BREAK) {
            self.publish(SerialEvent::Break)?;
        }

        let changed = fired.modem_changes();
        if !changed.is_empty() {
            let current = match self.device.modem_status() {
                Ok(current) => current,
                Err(_) if self.cancel.is_cancelled() => return Ok(false),
                Err(e) => return Err(self.fault("modem status query failed", e)),
            };
            self.publish(SerialEvent::StatusChanged { changed, current })?;
        }
        Ok(true)
    }

    /// Read one byte at a time until the queue is empty.
    fn drain(&self) -> CommResult<bool> {
        loop {
            match self.device.read_byte() {
                Ok(Some(byte)) => self.publish(SerialEvent::ByteReceived(byte))?,
                Ok(None) => return Ok(true),
                Err(_) if self.cancel.is_cancelled() => return Ok(false),
                Err(e) => return Err(self.fault("receive failed", e)),
            }
        }
    }

    fn publish(&self, event: SerialEvent) -> CommResult<()> {
        panic::catch_unwind(AssertUnwindSafe(|| self.events.emit(event)))
            .map_err(|_| CommError::device("event handler panicked"))
    }

    fn fault(&self, what: &str, err: DeviceError) -> CommError {
        CommError::device(format!("{}: {what}: {err}", self.device.name()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::comport::device::{DeviceDriver, EscapeFunction, LineErrors};
    use crate::comport::status::ModemStatus;
    use crate::comport::virtual_port::VirtualBus;
    use std::time::Duration;
    use tokio::sync::mpsc::UnboundedReceiver;
    use tokio::time::timeout;

    struct Rig {
        bus: VirtualBus,
        device: Arc<dyn CommDevice>,
        events: Arc<EventHub>,
        faults: Arc<FaultRecord>,
        rx: UnboundedReceiver<SerialEvent>,
    }

    fn rig() -> Rig {
        let bus = VirtualBus::new();
        bus.connect("COM1", "COM2");
        let device = bus.open("COM1").unwrap();
        let events = Arc::new(EventHub::new());
        let rx = events.subscribe();
        Rig { bus, device, events, faults: Arc::new(FaultRecord::new()), rx }
    }

    impl Rig {
        fn spawn(&self) -> MonitorHandle {
            MonitorHandle::spawn(self.device.clone(), self.events.clone(), self.faults.clone())
                .unwrap()
        }
    }

    async fn next(rx: &mut UnboundedReceiver<SerialEvent>) -> SerialEvent {
        timeout(Duration::from_secs(2), rx.recv())
            .await
            .expect("timed out waiting for event")
            .expect("event channel closed")
    }

    #[test]
    fn test_fault_record_claims_once() {
        let record = FaultRecord::new();
        assert_eq!(record.claim(), None);
        record.record(CommError::SendTimeout);
        assert!(record.is_pending());
        assert_eq!(record.claim(), Some(CommError::SendTimeout));
        assert_eq!(record.claim(), None);
        assert_eq!(record.peek(), Some(CommError::SendTimeout));
        record.clear();
        assert_eq!(record.peek(), None);
    }

    #[test]
    fn test_fault_record_rearms_on_new_fault() {
        let record = FaultRecord::new();
        record.record(CommError::offline());
        record.claim();
        record.record(CommError::SendTimeout);
        assert_eq!(record.claim(), Some(CommError::SendTimeout));
    }

    #[tokio::test]
    async fn test_bytes_arrive_in_order() {
        let mut rig = rig();
        let monitor = rig.spawn();
        rig.bus.inject_rx("COM1", b"abc").unwrap();
        for expected in b"abc" {
            assert_eq!(next(&mut rig.rx).await, SerialEvent::ByteReceived(*expected));
        }
        monitor.stop(&*rig.device);
        assert!(rig.faults.peek().is_none());
    }

    #[tokio::test]
    async fn test_transmit_complete_and_break() {
        let mut rig = rig();
        let monitor = rig.spawn();
        rig.device.write(b"z").unwrap();
        assert_eq!(next(&mut rig.rx).await, SerialEvent::TransmitComplete);
        rig.bus.inject_break("COM1").unwrap();
        assert_eq!(next(&mut rig.rx).await, SerialEvent::Break);
        monitor.stop(&*rig.device);
    }

    #[tokio::test]
    async fn test_modem_change_reports_changed_and_current() {
        let mut rig = rig();
        let monitor = rig.spawn();
        let peer = rig.bus.open("COM2").unwrap();
        peer.escape(EscapeFunction::SetRts).unwrap();
        let event = next(&mut rig.rx).await;
        assert_eq!(
            event,
            SerialEvent::StatusChanged {
                changed: ModemStatus { cts: true, ..Default::default() },
                current: ModemStatus { cts: true, ..Default::default() },
            }
        );
        monitor.stop(&*rig.device);
    }

    #[tokio::test]
    async fn test_line_error_is_recorded_and_published() {
        let mut rig = rig();
        let monitor = rig.spawn();
        rig.bus.inject_line_error("COM1", LineErrors::FRAME | LineErrors::RX_PARITY).unwrap();
        let expected = CommError::LineError(LineErrors::FRAME | LineErrors::RX_PARITY);
        assert_eq!(next(&mut rig.rx).await, SerialEvent::ThreadFault(expected.clone()));
        assert_eq!(rig.faults.claim(), Some(expected));
        monitor.stop(&*rig.device);
    }

    #[tokio::test]
    async fn test_unplug_records_device_fault() {
        let mut rig = rig();
        let monitor = rig.spawn();
        rig.bus.unplug("COM1").unwrap();
        match next(&mut rig.rx).await {
            SerialEvent::ThreadFault(fault) => assert!(fault.is_device_fault()),
            other => panic!("unexpected event {other:?}"),
        }
        monitor.stop(&*rig.device);
    }

    #[test]
    fn test_stop_joins_blocked_thread() {
        let rig = rig();
        let monitor = rig.spawn();
        std::thread::sleep(Duration::from_millis(20));
        monitor.stop(&*rig.device);
        assert!(rig.faults.peek().is_none());
    }

    #[tokio::test]
    async fn test_panicking_handler_becomes_fault() {
        let mut rig = rig();
        rig.events.on_event(|ev| {
            if matches!(ev, SerialEvent::ByteReceived(_)) {
                panic!("handler bug");
            }
        });
        let monitor = rig.spawn();
        rig.bus.inject_rx("COM1", b"!").unwrap();
        loop {
            if let SerialEvent::ThreadFault(fault) = next(&mut rig.rx).await {
                assert_eq!(fault, CommError::device("event handler panicked"));
                break;
            }
        }
        assert!(rig.faults.peek().is_some());
        monitor.stop(&*rig.device);
    }
}
