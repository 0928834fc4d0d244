//! Point-in-time views of the modem lines and the driver queues.
//!
//! Both are plain values copied out of the device; nothing here is cached by
//! the session.

use std::fmt;

use bitflags::bitflags;
use serde::{Deserialize, Serialize};

use super::device::ComStat;

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
//  Modem lines
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

pub const MS_CTS_ON: u32 = 0x0010;
pub const MS_DSR_ON: u32 = 0x0020;
pub const MS_RING_ON: u32 = 0x0040;
pub const MS_RLSD_ON: u32 = 0x0080;

/// Input modem lines as seen by the UART.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ModemStatus {
    /// Clear To Send.
    pub cts: bool,
    /// Data Set Ready.
    pub dsr: bool,
    /// Receive Line Signal Detect (carrier).
    pub rlsd: bool,
    /// Ring Indicator.
    pub ring: bool,
}

impl ModemStatus {
    pub fn from_bits(bits: u32) -> Self {
        Self {
            cts: bits & MS_CTS_ON != 0,
            dsr: bits & MS_DSR_ON != 0,
            rlsd: bits & MS_RLSD_ON != 0,
            ring: bits & MS_RING_ON != 0,
        }
    }

    pub fn bits(&self) -> u32 {
        let mut bits = 0;
        if self.cts {
            bits |= MS_CTS_ON;
        }
        if self.dsr {
            bits |= MS_DSR_ON;
        }
        if self.rlsd {
            bits |= MS_RLSD_ON;
        }
        if self.ring {
            bits |= MS_RING_ON;
        }
        bits
    }

    /// Lines whose level differs between `self` and `other`.
    pub fn diff(&self, other: &ModemStatus) -> ModemStatus {
        Self::from_bits(self.bits() ^ other.bits())
    }

    pub fn is_empty(&self) -> bool {
        self.bits() == 0
    }
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
//  Queue status
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

bitflags! {
    /// Reasons the transmitter is holding, as reported in COMSTAT.
    #[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash)]
    pub struct HoldFlags: u32 {
        const CTS_HOLD = 0x0001;
        const DSR_HOLD = 0x0002;
        const RLSD_HOLD = 0x0004;
        const XOFF_HOLD = 0x0008;
        const XOFF_SENT = 0x0010;
        const EOF = 0x0020;
        const IMMEDIATE_WAITING = 0x0040;
    }
}

/// Depth and capacity of both driver queues plus the hold reasons.
///
/// A capacity of zero means the driver did not report one.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct QueueStatus {
    pub hold: HoldFlags,
    pub in_queue: u32,
    pub out_queue: u32,
    pub in_capacity: u32,
    pub out_capacity: u32,
}

impl QueueStatus {
    pub fn new(stat: ComStat, in_capacity: u32, out_capacity: u32) -> Self {
        Self {
            hold: HoldFlags::from_bits_truncate(stat.hold_flags),
            in_queue: stat.in_queue,
            out_queue: stat.out_queue,
            in_capacity,
            out_capacity,
        }
    }

    pub fn cts_hold(&self) -> bool {
        self.hold.contains(HoldFlags::CTS_HOLD)
    }

    pub fn dsr_hold(&self) -> bool {
        self.hold.contains(HoldFlags::DSR_HOLD)
    }

    pub fn rlsd_hold(&self) -> bool {
        self.hold.contains(HoldFlags::RLSD_HOLD)
    }

    pub fn xoff_hold(&self) -> bool {
        self.hold.contains(HoldFlags::XOFF_HOLD)
    }

    pub fn xoff_sent(&self) -> bool {
        self.hold.contains(HoldFlags::XOFF_SENT)
    }

    pub fn immediate_waiting(&self) -> bool {
        self.hold.contains(HoldFlags::IMMEDIATE_WAITING)
    }

    fn is_holding(&self) -> bool {
        self.hold.intersects(
            HoldFlags::CTS_HOLD
                | HoldFlags::DSR_HOLD
                | HoldFlags::RLSD_HOLD
                | HoldFlags::XOFF_HOLD
                | HoldFlags::XOFF_SENT,
        )
    }
}

fn describe_size(f: &mut fmt::Formatter<'_>, capacity: u32) -> fmt::Result {
    if capacity == 0 {
        write!(f, "of unknown size and ")
    } else {
        write!(f, "{capacity} bytes long and ")
    }
}

impl fmt::Display for QueueStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "The reception queue is ")?;
        describe_size(f, self.in_capacity)?;
        match self.in_queue {
            0 => write!(f, "is empty.")?,
            1 => write!(f, "contains 1 byte.")?,
            n => write!(f, "contains {n} bytes.")?,
        }

        write!(f, " The transmission queue is ")?;
        describe_size(f, self.out_capacity)?;
        match self.out_queue {
            0 => write!(f, "is empty")?,
            1 => write!(f, "contains 1 byte. It is ")?,
            n => write!(f, "contains {n} bytes. It is ")?,
        }
        if self.out_queue > 0 {
            if self.is_holding() {
                write!(f, "holding on")?;
                let reasons = [
                    (HoldFlags::CTS_HOLD, " CTS"),
                    (HoldFlags::DSR_HOLD, " DSR"),
                    (HoldFlags::RLSD_HOLD, " RLSD"),
                    (HoldFlags::XOFF_HOLD, " Rx XOff"),
                    (HoldFlags::XOFF_SENT, " Tx XOff"),
                ];
                for (flag, label) in reasons {
                    if self.hold.contains(flag) {
                        f.write_str(label)?;
                    }
                }
            } else {
                write!(f, "pumping data")?;
            }
        }

        let immediate = if self.immediate_waiting() { "full" } else { "empty" };
        write!(f, ". The immediate buffer is {immediate}.")
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_modem_status_bits() {
        let status = ModemStatus::from_bits(MS_CTS_ON | MS_RLSD_ON);
        assert!(status.cts);
        assert!(status.rlsd);
        assert!(!status.dsr);
        assert!(!status.ring);
        assert_eq!(status.bits(), 0x90);
    }

    #[test]
    fn test_modem_status_diff() {
        let before = ModemStatus { cts: true, dsr: true, ..Default::default() };
        let after = ModemStatus { cts: false, dsr: true, ring: true, ..Default::default() };
        let changed = before.diff(&after);
        assert!(changed.cts);
        assert!(changed.ring);
        assert!(!changed.dsr);
        assert!(before.diff(&before).is_empty());
    }

    #[test]
    fn test_queue_status_unknown_and_empty() {
        let qs = QueueStatus::default();
        assert_eq!(
            qs.to_string(),
            "The reception queue is of unknown size and is empty. \
             The transmission queue is of unknown size and is empty. \
             The immediate buffer is empty."
        );
    }

    #[test]
    fn test_queue_status_holding() {
        let stat = ComStat { hold_flags: 0x01 | 0x08 | 0x40, in_queue: 1, out_queue: 12 };
        let qs = QueueStatus::new(stat, 4096, 2048);
        assert!(qs.cts_hold());
        assert!(qs.xoff_hold());
        assert!(qs.immediate_waiting());
        assert!(!qs.dsr_hold());
        assert_eq!(
            qs.to_string(),
            "The reception queue is 4096 bytes long and contains 1 byte. \
             The transmission queue is 2048 bytes long and contains 12 bytes. \
             It is holding on CTS Rx XOff. The immediate buffer is full."
        );
    }

    #[test]
    fn test_queue_status_pumping() {
        let stat = ComStat { hold_flags: 0, in_queue: 3, out_queue: 1 };
        let text = QueueStatus::new(stat, 0, 0).to_string();
        assert!(text.contains("contains 3 bytes."));
        assert!(text.contains("contains 1 byte. It is pumping data."));
    }

    #[test]
    fn test_unknown_hold_bits_are_dropped() {
        let stat = ComStat { hold_flags: 0xFF00 | 0x02, in_queue: 0, out_queue: 0 };
        assert_eq!(QueueStatus::new(stat, 0, 0).hold, HoldFlags::DSR_HOLD);
    }
}
