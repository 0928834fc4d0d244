//! COM session.
//!
//! A [`Session`] owns one port from [`open`](Session::open) to
//! [`close`](Session::close): it pushes the line configuration to the
//! device, runs the event monitor thread, drives the output pins and
//! serialises every foreground call behind one lock.
//!
//! Every call that needs the device first goes through the online check:
//! a fault parked by the monitor is surfaced (once), a dead handle forces
//! the session offline, and an offline session with auto-reopen armed
//! tries to open again before giving up.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use serde::{Deserialize, Serialize};
use tokio::sync::mpsc;

use super::config::{Handshake, HsOutput, LineConfiguration, SessionConfig};
use super::device::{CommDevice, DeviceDriver, DeviceError, DeviceErrorKind, EscapeFunction};
use super::error::{
    CommError, CommResult, BAD_COM_SETTINGS, BAD_QUEUE_SETTINGS, BAD_TIMEOUT_SETTINGS,
    PORT_OPEN_FAILURE, TRANSMISSION_FAILURE, UNEXPECTED_FAILURE,
};
use super::events::{EventHub, SerialEvent};
use super::monitor::{FaultRecord, MonitorHandle};
use super::status::{ModemStatus, QueueStatus};
use super::write::PendingWrite;

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
//  State
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum SessionState {
    #[default]
    Offline,
    Online,
}

/// Whether the application may drive an output pin, and its last level.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum PinState {
    /// Offline, or the pin is owned by the driver for handshaking.
    #[default]
    Unavailable,
    Controllable(bool),
}

impl PinState {
    pub fn is_controllable(&self) -> bool {
        matches!(self, Self::Controllable(_))
    }

    /// Last level written; `false` when unavailable.
    pub fn level(&self) -> bool {
        matches!(self, Self::Controllable(true))
    }

    fn for_usage(usage: HsOutput) -> Self {
        match usage {
            HsOutput::None => Self::Controllable(false),
            HsOutput::Online => Self::Controllable(true),
            HsOutput::Handshake | HsOutput::Gate => Self::Unavailable,
        }
    }
}

/// Output pins as fixed when the session went online.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct Capabilities {
    pub rts: PinState,
    pub dtr: PinState,
    pub brk: PinState,
}

impl Capabilities {
    pub fn at_open(line: &LineConfiguration) -> Self {
        Self {
            rts: PinState::for_usage(line.use_rts),
            dtr: PinState::for_usage(line.use_dtr),
            brk: PinState::Controllable(false),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Pin {
    Rts,
    Dtr,
    Break,
}

impl Pin {
    fn state(self, caps: &mut Capabilities) -> &mut PinState {
        match self {
            Self::Rts => &mut caps.rts,
            Self::Dtr => &mut caps.dtr,
            Self::Break => &mut caps.brk,
        }
    }

    fn escape(self, level: bool) -> EscapeFunction {
        match self {
            Self::Rts => EscapeFunction::rts(level),
            Self::Dtr => EscapeFunction::dtr(level),
            Self::Break => EscapeFunction::brk(level),
        }
    }
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
//  Hooks
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

/// Extension points around the open / close transitions.
///
/// Both run with the session lock held, so they must not call back into the
/// session; `after_open` gets the device directly instead.
pub trait SessionHooks: Send + Sync {
    /// Runs once the port is configured and monitored. Returning `false`
    /// closes it again and makes `open` return `false`.
    fn after_open(&self, device: &dyn CommDevice) -> bool {
        let _ = device;
        true
    }

    /// Runs before the port is released; `error` is set for forced closes.
    fn before_close(&self, error: bool) {
        let _ = error;
    }
}

struct NoHooks;

impl SessionHooks for NoHooks {}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
//  Internals
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

/// A released port whose monitor still has to be joined. Runs after the
/// session lock is dropped, so a handler blocked on that lock cannot
/// deadlock the join.
struct Teardown {
    device: Arc<dyn CommDevice>,
    monitor: Option<MonitorHandle>,
}

impl Teardown {
    fn run(self) {
        match self.monitor {
            Some(monitor) => monitor.stop(&*self.device),
            None => self.device.cancel_io(),
        }
        self.device.close();
    }
}

/// Closes a freshly opened device unless it makes it to the online state.
struct OpenGuard {
    device: Arc<dyn CommDevice>,
    armed: bool,
}

impl OpenGuard {
    fn new(device: Arc<dyn CommDevice>) -> Self {
        Self { device, armed: true }
    }

    fn disarm(mut self) -> Arc<dyn CommDevice> {
        self.armed = false;
        self.device.clone()
    }
}

impl Drop for OpenGuard {
    fn drop(&mut self) {
        if self.armed {
            self.device.close();
        }
    }
}

struct Inner {
    config: SessionConfig,
    device: Option<Arc<dyn CommDevice>>,
    monitor: Option<MonitorHandle>,
    /// Fault slot of the current monitor; replaced on every close so a
    /// stale monitor cannot report into the next session.
    faults: Arc<FaultRecord>,
    pending: PendingWrite,
    caps: Capabilities,
    auto_reopen: bool,
    check_sends: bool,
    retired: Vec<Teardown>,
}

impl Inner {
    fn on_monitor_thread(&self) -> bool {
        self.monitor.as_ref().is_some_and(MonitorHandle::is_current_thread)
    }
}

fn apply_line(device: &dyn CommDevice, line: &LineConfiguration) -> CommResult<()> {
    let reject = |what: &str, reason: &'static str, err: DeviceError| {
        log::warn!("{}: {what} rejected: {err}", device.name());
        CommError::device(reason)
    };
    if line.rx_queue != 0 || line.tx_queue != 0 {
        device
            .setup_queues(line.rx_queue, line.tx_queue)
            .map_err(|e| reject("queue sizes", BAD_QUEUE_SETTINGS, e))?;
    }
    device
        .set_control_block(&line.control_block())
        .map_err(|e| reject("control block", BAD_COM_SETTINGS, e))?;
    device
        .set_timeouts(&line.timeouts())
        .map_err(|e| reject("timeouts", BAD_TIMEOUT_SETTINGS, e))?;
    Ok(())
}

fn unexpected(device: &dyn CommDevice, what: &str, err: DeviceError) -> CommError {
    log::warn!("{}: {what} failed: {err}", device.name());
    CommError::device(UNEXPECTED_FAILURE)
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
//  Session
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

/// One serial port, opened and monitored.
pub struct Session {
    driver: Arc<dyn DeviceDriver>,
    hooks: Arc<dyn SessionHooks>,
    events: Arc<EventHub>,
    online: AtomicBool,
    inner: Mutex<Inner>,
}

impl std::fmt::Debug for Session {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let port = self
            .inner
            .try_lock()
            .map(|inner| inner.config.port_name.clone())
            .unwrap_or_default();
        f.debug_struct("Session")
            .field("port", &port)
            .field("state", &self.state())
            .finish()
    }
}

impl Session {
    pub fn new(config: SessionConfig, driver: Arc<dyn DeviceDriver>) -> Self {
        Self::with_hooks(config, driver, Arc::new(NoHooks))
    }

    pub fn with_hooks(
        config: SessionConfig,
        driver: Arc<dyn DeviceDriver>,
        hooks: Arc<dyn SessionHooks>,
    ) -> Self {
        let check_sends = config.check_all_sends;
        Self {
            driver,
            hooks,
            events: Arc::new(EventHub::new()),
            online: AtomicBool::new(false),
            inner: Mutex::new(Inner {
                config,
                device: None,
                monitor: None,
                faults: Arc::new(FaultRecord::new()),
                pending: PendingWrite::default(),
                caps: Capabilities::default(),
                auto_reopen: false,
                check_sends,
                retired: Vec::new(),
            }),
        }
    }

    fn lock(&self) -> MutexGuard<'_, Inner> {
        self.inner.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Run `op` under the session lock, then finish any port released
    /// meanwhile.
    fn run<T>(&self, op: impl FnOnce(&mut Inner) -> T) -> T {
        let mut inner = self.lock();
        let out = op(&mut inner);
        let retired = std::mem::take(&mut inner.retired);
        drop(inner);
        for teardown in retired {
            teardown.run();
        }
        out
    }

    /// Online check followed by `op`; any error from `op` forces the
    /// session offline.
    fn checked<T>(
        &self,
        op: impl FnOnce(&mut Inner, &dyn CommDevice) -> CommResult<T>,
    ) -> CommResult<T> {
        self.run(|inner| {
            let device = self.check_online(inner)?;
            op(&mut *inner, &*device).map_err(|e| self.fail(inner, e))
        })
    }

    // ── lifecycle ────────────────────────────────────────────────────

    /// Open the port.
    ///
    /// `Ok(false)` when already online, when another owner holds the port,
    /// or when the `after_open` hook vetoes.
    pub fn open(&self) -> CommResult<bool> {
        self.run(|inner| self.open_locked(inner))
    }

    fn open_locked(&self, inner: &mut Inner) -> CommResult<bool> {
        if inner.device.is_some() {
            return Ok(false);
        }
        inner.config.validate()?;
        let name = inner.config.port_name.clone();

        let guard = match self.driver.open(&name) {
            Ok(device) => OpenGuard::new(device),
            Err(e) if e.kind == DeviceErrorKind::AccessDenied => {
                log::info!("{name}: open refused, port is in use");
                return Ok(false);
            }
            Err(e) => {
                log::warn!("{name}: open failed: {e}");
                return Err(CommError::device(PORT_OPEN_FAILURE));
            }
        };
        log::debug!("{name}: applying {:?}", inner.config.line.control_block());
        apply_line(&*guard.device, &inner.config.line)?;

        let faults = Arc::new(FaultRecord::new());
        let monitor =
            MonitorHandle::spawn(guard.device.clone(), self.events.clone(), faults.clone())?;
        let device = guard.disarm();

        inner.device = Some(device.clone());
        inner.monitor = Some(monitor);
        inner.faults = faults;
        inner.pending.clear();
        inner.caps = Capabilities::at_open(&inner.config.line);
        inner.check_sends = inner.config.check_all_sends;
        self.online.store(true, Ordering::SeqCst);

        if !self.hooks.after_open(&*device) {
            log::warn!("{name}: open vetoed");
            self.shutdown(inner, false);
            return Ok(false);
        }
        inner.auto_reopen = inner.config.auto_reopen;
        log::info!(
            "{name}: online at {} baud",
            inner.config.line.baud_rate.value()
        );
        Ok(true)
    }

    /// Close the port. Does nothing when already offline.
    pub fn close(&self) {
        self.run(|inner| self.shutdown(inner, false));
    }

    /// Release the port. A forced close (`error`) keeps auto-reopen armed.
    fn shutdown(&self, inner: &mut Inner, error: bool) {
        if !error {
            inner.auto_reopen = false;
        }
        if inner.device.is_none() {
            return;
        }
        self.hooks.before_close(error);
        if let Some(device) = inner.device.take() {
            inner.retired.push(Teardown {
                device,
                monitor: inner.monitor.take(),
            });
        }
        inner.faults = Arc::new(FaultRecord::new());
        inner.pending.clear();
        inner.caps = Capabilities::default();
        self.online.store(false, Ordering::SeqCst);
        if error {
            log::warn!("{}: forced offline", inner.config.port_name);
        } else {
            log::info!("{}: closed", inner.config.port_name);
        }
    }

    /// Force the session offline for `err`, unless we are on the monitor
    /// thread, and hand the error back.
    fn fail(&self, inner: &mut Inner, err: CommError) -> CommError {
        if !inner.on_monitor_thread() && inner.device.is_some() {
            log::warn!("{}: {err}", inner.config.port_name);
            self.shutdown(inner, true);
        }
        err
    }

    fn check_online(&self, inner: &mut Inner) -> CommResult<Arc<dyn CommDevice>> {
        if !inner.on_monitor_thread() {
            if let Some(fault) = inner.faults.claim() {
                return Err(self.fail(inner, CommError::background(fault)));
            }
        }
        if let Some(device) = inner.device.clone() {
            if device.is_valid() {
                return Ok(device);
            }
            return Err(self.fail(inner, CommError::offline()));
        }
        if inner.auto_reopen {
            log::info!("{}: reopening", inner.config.port_name);
            match self.open_locked(inner) {
                Ok(true) => {
                    if let Some(device) = inner.device.clone() {
                        return Ok(device);
                    }
                }
                Ok(false) => {}
                Err(e @ CommError::DeviceFault(_)) => return Err(e),
                Err(e) => {
                    log::warn!("{}: reopen failed: {e}", inner.config.port_name);
                    return Err(CommError::device(PORT_OPEN_FAILURE));
                }
            }
        }
        Err(CommError::offline())
    }

    // ── accessors ────────────────────────────────────────────────────

    pub fn state(&self) -> SessionState {
        if self.is_online() {
            SessionState::Online
        } else {
            SessionState::Offline
        }
    }

    pub fn is_online(&self) -> bool {
        self.online.load(Ordering::SeqCst)
    }

    pub fn port_name(&self) -> String {
        self.lock().config.port_name.clone()
    }

    pub fn config(&self) -> SessionConfig {
        self.lock().config.clone()
    }

    /// Edit the configuration. Only allowed while offline; the result is
    /// validated by the next `open`.
    pub fn configure(&self, edit: impl FnOnce(&mut SessionConfig)) -> CommResult<()> {
        let mut inner = self.lock();
        if inner.device.is_some() {
            return Err(CommError::InvalidConfig(
                "configuration cannot change while the session is online".into(),
            ));
        }
        edit(&mut inner.config);
        Ok(())
    }

    pub fn set_handshake(&self, handshake: Handshake) -> CommResult<()> {
        self.configure(|cfg| cfg.line.set_handshake(handshake))
    }

    pub fn capabilities(&self) -> Capabilities {
        self.lock().caps
    }

    /// Bytes of the last write not yet confirmed by the device.
    pub fn pending_bytes(&self) -> usize {
        self.lock().pending.remaining()
    }

    // ── notifications ────────────────────────────────────────────────

    pub fn events(&self) -> &EventHub {
        &self.events
    }

    pub fn on_event<F>(&self, handler: F)
    where
        F: Fn(&SerialEvent) + Send + Sync + 'static,
    {
        self.events.on_event(handler);
    }

    pub fn subscribe(&self) -> mpsc::UnboundedReceiver<SerialEvent> {
        self.events.subscribe()
    }

    // ── writing ──────────────────────────────────────────────────────

    /// Queue `data` after confirming the previous write.
    pub fn write(&self, data: &[u8]) -> CommResult<()> {
        self.checked(|inner, device| {
            let wait = inner.check_sends;
            inner.pending.confirm(device, wait)?;
            inner.pending.queue(device, data)
        })
    }

    pub fn write_byte(&self, byte: u8) -> CommResult<()> {
        self.write(&[byte])
    }

    pub fn write_str(&self, text: &str) -> CommResult<()> {
        self.write(text.as_bytes())
    }

    /// Write `text` followed by CR LF.
    pub fn write_line(&self, text: &str) -> CommResult<()> {
        let mut line = Vec::with_capacity(text.len() + 2);
        line.extend_from_slice(text.as_bytes());
        line.extend_from_slice(b"\r\n");
        self.write(&line)
    }

    /// Block until the last write is confirmed.
    pub fn flush(&self) -> CommResult<()> {
        self.checked(|inner, device| inner.pending.confirm(device, true))
    }

    /// Send one byte ahead of anything queued.
    pub fn send_immediate(&self, byte: u8) -> CommResult<()> {
        self.checked(|_, device| {
            device.transmit_immediate(byte).map_err(|e| {
                log::warn!("{}: immediate byte rejected: {e}", device.name());
                CommError::device(TRANSMISSION_FAILURE)
            })
        })
    }

    // ── status ───────────────────────────────────────────────────────

    pub fn modem_status(&self) -> CommResult<ModemStatus> {
        self.checked(|_, device| {
            device
                .modem_status()
                .map_err(|e| unexpected(device, "modem status query", e))
        })
    }

    pub fn queue_status(&self) -> CommResult<QueueStatus> {
        self.checked(|_, device| {
            let (_, stat) = device
                .clear_error()
                .map_err(|e| unexpected(device, "queue status query", e))?;
            let capacity = device
                .properties()
                .map_err(|e| unexpected(device, "properties query", e))?;
            Ok(QueueStatus::new(stat, capacity.rx, capacity.tx))
        })
    }

    // ── output pins ──────────────────────────────────────────────────

    fn drive(&self, pin: Pin, level: bool) -> CommResult<()> {
        self.run(|inner| {
            if !pin.state(&mut inner.caps).is_controllable() {
                return Ok(());
            }
            let device = self.check_online(inner)?;
            if let Err(e) = device.escape(pin.escape(level)) {
                let err = unexpected(&*device, "escape function", e);
                return Err(self.fail(inner, err));
            }
            *pin.state(&mut inner.caps) = PinState::Controllable(level);
            Ok(())
        })
    }

    /// Drive RTS. A no-op when RTS is used for handshaking or offline.
    pub fn set_rts(&self, level: bool) -> CommResult<()> {
        self.drive(Pin::Rts, level)
    }

    /// Drive DTR. A no-op when DTR is used for handshaking or offline.
    pub fn set_dtr(&self, level: bool) -> CommResult<()> {
        self.drive(Pin::Dtr, level)
    }

    /// Hold the line in break (`true`) or release it.
    pub fn set_break(&self, level: bool) -> CommResult<()> {
        self.drive(Pin::Break, level)
    }

    pub fn rts(&self) -> bool {
        self.capabilities().rts.level()
    }

    pub fn dtr(&self) -> bool {
        self.capabilities().dtr.level()
    }

    pub fn brk(&self) -> bool {
        self.capabilities().brk.level()
    }

    pub fn rts_available(&self) -> bool {
        self.capabilities().rts.is_controllable()
    }

    pub fn dtr_available(&self) -> bool {
        self.capabilities().dtr.is_controllable()
    }
}

impl Drop for Session {
    fn drop(&mut self) {
        self.close();
    }
}
