//! Overlapped write bookkeeping.
//!
//! A session keeps at most one write in flight. Before the next write (and
//! on flush) the previous one is confirmed; a completed write that moved
//! fewer bytes than were queued means the send budget ran out.

use super::device::{CommDevice, WriteStatus};
use super::error::{CommError, CommResult, UNEXPECTED_FAILURE};

/// Bytes of the last queued write the device has not yet confirmed.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct PendingWrite {
    remaining: usize,
}

impl PendingWrite {
    pub fn remaining(&self) -> usize {
        self.remaining
    }

    pub fn is_idle(&self) -> bool {
        self.remaining == 0
    }

    pub(crate) fn clear(&mut self) {
        self.remaining = 0;
    }

    /// Hand `data` to the device.
    pub(crate) fn queue(&mut self, device: &dyn CommDevice, data: &[u8]) -> CommResult<()> {
        self.remaining = data.len();
        match device.write(data) {
            Ok(WriteStatus::Complete(sent)) => {
                self.remaining = self.remaining.saturating_sub(sent);
                Ok(())
            }
            Ok(WriteStatus::Pending) => Ok(()),
            Err(e) => {
                log::warn!("{}: write of {} bytes failed: {e}", device.name(), data.len());
                Err(CommError::device(UNEXPECTED_FAILURE))
            }
        }
    }

    /// Confirm the outstanding write.
    ///
    /// With `wait` this blocks until the device reports completion. Without
    /// it a write still in flight is left alone.
    pub(crate) fn confirm(&mut self, device: &dyn CommDevice, wait: bool) -> CommResult<()> {
        if self.remaining == 0 {
            return Ok(());
        }
        match device.write_result(wait) {
            Ok(Some(sent)) => {
                let short = self.remaining.saturating_sub(sent);
                self.remaining = 0;
                if short != 0 {
                    log::warn!("{}: send timed out with {short} bytes unsent", device.name());
                    return Err(CommError::SendTimeout);
                }
                Ok(())
            }
            Ok(None) => Ok(()),
            Err(e) => {
                log::warn!("{}: write completion query failed: {e}", device.name());
                Err(CommError::device(UNEXPECTED_FAILURE))
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::comport::config::CommTimeouts;
    use crate::comport::device::DeviceDriver;
    use crate::comport::virtual_port::VirtualBus;
    use std::sync::Arc;

    fn device() -> (VirtualBus, Arc<dyn CommDevice>) {
        let bus = VirtualBus::new();
        bus.connect("COM1", "COM2");
        let dev = bus.open("COM1").unwrap();
        (bus, dev)
    }

    #[test]
    fn test_synchronous_write_leaves_nothing_pending() {
        let (bus, dev) = device();
        let mut pending = PendingWrite::default();
        pending.queue(&*dev, b"test").unwrap();
        assert!(pending.is_idle());
        pending.confirm(&*dev, true).unwrap();
        assert_eq!(bus.take_received("COM2").unwrap(), b"test");
    }

    #[test]
    fn test_pending_write_keeps_full_length() {
        let (bus, dev) = device();
        bus.stall("COM1", true).unwrap();
        let mut pending = PendingWrite::default();
        pending.queue(&*dev, b"abc").unwrap();
        assert_eq!(pending.remaining(), 3);
        pending.confirm(&*dev, false).unwrap();
        assert_eq!(pending.remaining(), 3);
    }

    #[test]
    fn test_short_completion_is_send_timeout() {
        let (bus, dev) = device();
        dev.set_timeouts(&CommTimeouts {
            write_total_constant: 20,
            write_total_multiplier: 1,
            ..Default::default()
        })
        .unwrap();
        bus.stall("COM1", true).unwrap();
        let mut pending = PendingWrite::default();
        pending.queue(&*dev, b"abcdef").unwrap();
        assert_eq!(pending.confirm(&*dev, true), Err(CommError::SendTimeout));
        assert!(pending.is_idle());
    }

    #[test]
    fn test_released_write_confirms() {
        let (bus, dev) = device();
        bus.stall("COM1", true).unwrap();
        let mut pending = PendingWrite::default();
        pending.queue(&*dev, b"xy").unwrap();
        bus.stall("COM1", false).unwrap();
        pending.confirm(&*dev, true).unwrap();
        assert!(pending.is_idle());
        assert_eq!(bus.take_received("COM2").unwrap(), b"xy");
    }

    #[test]
    fn test_write_on_dead_handle_is_unexpected_failure() {
        let (bus, dev) = device();
        bus.unplug("COM1").unwrap();
        let mut pending = PendingWrite::default();
        let err = pending.queue(&*dev, b"x").unwrap_err();
        assert_eq!(err, CommError::device(UNEXPECTED_FAILURE));
    }
}
