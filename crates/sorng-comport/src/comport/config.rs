//! Line configuration for a COM session.
//!
//! [`LineConfiguration`] holds every tunable of the serial line. When a
//! session opens it is lowered into a [`ControlBlock`] and [`CommTimeouts`]
//! and pushed to the device in one go.

use std::time::Duration;

use serde::{Deserialize, Serialize};

use super::error::{CommError, CommResult};

/// Default XON character (DC1).
pub const XON: u8 = 0x11;
/// Default XOFF character (DC3).
pub const XOFF: u8 = 0x13;

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
//  Framing
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

/// Line speed. Serialised as a plain number.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(from = "u32", into = "u32")]
pub enum BaudRate {
    Baud1200,
    Baud2400,
    Baud4800,
    Baud9600,
    Baud19200,
    Baud38400,
    Baud57600,
    #[default]
    Baud115200,
    Baud230400,
    Baud460800,
    Baud921600,
    /// Anything the driver may accept that is not in the table above.
    Custom(u32),
}

const STANDARD_RATES: [(BaudRate, u32); 11] = [
    (BaudRate::Baud1200, 1200),
    (BaudRate::Baud2400, 2400),
    (BaudRate::Baud4800, 4800),
    (BaudRate::Baud9600, 9600),
    (BaudRate::Baud19200, 19200),
    (BaudRate::Baud38400, 38400),
    (BaudRate::Baud57600, 57600),
    (BaudRate::Baud115200, 115200),
    (BaudRate::Baud230400, 230400),
    (BaudRate::Baud460800, 460800),
    (BaudRate::Baud921600, 921600),
];

impl BaudRate {
    pub fn value(&self) -> u32 {
        match self {
            Self::Custom(v) => *v,
            named => STANDARD_RATES
                .iter()
                .find(|(rate, _)| rate == named)
                .map(|(_, v)| *v)
                .unwrap_or_default(),
        }
    }

    pub fn is_standard(&self) -> bool {
        !matches!(self, Self::Custom(_))
    }
}

impl From<u32> for BaudRate {
    fn from(v: u32) -> Self {
        STANDARD_RATES
            .iter()
            .find(|(_, value)| *value == v)
            .map(|(rate, _)| *rate)
            .unwrap_or(Self::Custom(v))
    }
}

impl From<BaudRate> for u32 {
    fn from(rate: BaudRate) -> Self {
        rate.value()
    }
}

/// Bits per character.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(try_from = "u8", into = "u8")]
pub enum DataBits {
    Five,
    Six,
    Seven,
    #[default]
    Eight,
}

impl DataBits {
    pub fn value(&self) -> u8 {
        match self {
            Self::Five => 5,
            Self::Six => 6,
            Self::Seven => 7,
            Self::Eight => 8,
        }
    }
}

impl TryFrom<u8> for DataBits {
    type Error = String;

    fn try_from(v: u8) -> Result<Self, Self::Error> {
        match v {
            5 => Ok(Self::Five),
            6 => Ok(Self::Six),
            7 => Ok(Self::Seven),
            8 => Ok(Self::Eight),
            other => Err(format!("unsupported data bits: {other}")),
        }
    }
}

impl From<DataBits> for u8 {
    fn from(bits: DataBits) -> Self {
        bits.value()
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum Parity {
    #[default]
    None,
    Odd,
    Even,
    Mark,
    Space,
}

impl Parity {
    /// Driver code (0 = none … 4 = space).
    pub fn code(&self) -> u8 {
        match self {
            Self::None => 0,
            Self::Odd => 1,
            Self::Even => 2,
            Self::Mark => 3,
            Self::Space => 4,
        }
    }

    /// Only odd and even parity are actually checked on receive.
    pub fn is_checked(&self) -> bool {
        matches!(self, Self::Odd | Self::Even)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub enum StopBits {
    #[default]
    #[serde(rename = "1")]
    One,
    #[serde(rename = "1.5")]
    OnePointFive,
    #[serde(rename = "2")]
    Two,
}

impl StopBits {
    /// Driver code (0 = one, 1 = one and a half, 2 = two).
    pub fn code(&self) -> u8 {
        match self {
            Self::One => 0,
            Self::OnePointFive => 1,
            Self::Two => 2,
        }
    }
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
//  Flow control
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

/// Handshake preset; see [`LineConfiguration::set_handshake`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum Handshake {
    #[default]
    None,
    XonXoff,
    CtsRts,
    DsrDtr,
}

/// What an output pin (RTS or DTR) is used for.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum HsOutput {
    /// Not asserted; the application may drive it.
    #[default]
    None,
    /// Asserted while the session is online; the application may drive it.
    Online,
    /// Driven by the driver as a receive handshake.
    Handshake,
    /// Asserted by the driver while transmitting.
    Gate,
}

impl HsOutput {
    pub fn code(&self) -> u32 {
        match self {
            Self::None => 0,
            Self::Online => 1,
            Self::Handshake => 2,
            Self::Gate => 3,
        }
    }

    /// Whether the application owns the pin.
    pub fn is_manual(&self) -> bool {
        matches!(self, Self::None | Self::Online)
    }
}

/// Send deadline in milliseconds: `constant + multiplier * bytes`.
///
/// Both zero means writes never time out.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SendTimeout {
    #[serde(default)]
    pub constant_ms: u32,
    #[serde(default)]
    pub multiplier_ms: u32,
}

impl SendTimeout {
    pub fn is_unbounded(&self) -> bool {
        self.constant_ms == 0 && self.multiplier_ms == 0
    }

    /// Deadline for a write of `len` bytes, or `None` when unbounded.
    pub fn budget(&self, len: usize) -> Option<Duration> {
        if self.is_unbounded() {
            return None;
        }
        let per_byte = u64::from(self.multiplier_ms).saturating_mul(len as u64);
        Some(Duration::from_millis(per_byte.saturating_add(u64::from(self.constant_ms))))
    }
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
//  Line configuration
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

fn default_rx_high_water() -> u32 {
    2048
}
fn default_rx_low_water() -> u32 {
    512
}
fn default_true() -> bool {
    true
}
fn default_xon() -> u8 {
    XON
}
fn default_xoff() -> u8 {
    XOFF
}

/// Every setting applied to the device when a session opens.
///
/// A `handshake` named in serialised input is applied through
/// [`set_handshake`](Self::set_handshake) after the other fields, so the
/// preset wins over any flow-control switch given alongside it.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", from = "RawLineConfiguration")]
pub struct LineConfiguration {
    pub baud_rate: BaudRate,
    pub data_bits: DataBits,
    pub parity: Parity,
    pub stop_bits: StopBits,
    /// Last preset applied through [`set_handshake`](Self::set_handshake).
    #[serde(skip_serializing_if = "is_no_handshake")]
    pub handshake: Handshake,
    /// Hold transmission while CTS is low.
    pub tx_flow_cts: bool,
    /// Hold transmission while DSR is low.
    pub tx_flow_dsr: bool,
    /// Honour XOFF/XON from the remote station.
    pub tx_flow_x: bool,
    /// Send XOFF/XON to the remote station.
    pub rx_flow_x: bool,
    /// Discard received bytes while DSR is low.
    pub rx_gate_dsr: bool,
    /// Keep transmitting after we sent XOFF.
    pub tx_when_rx_xoff: bool,
    pub use_rts: HsOutput,
    pub use_dtr: HsOutput,
    /// Free bytes left in the receive queue at which flow is stopped.
    pub rx_high_water: u32,
    /// Queued bytes at which flow is resumed.
    pub rx_low_water: u32,
    /// Requested receive queue size, 0 for the driver default.
    pub rx_queue: u32,
    /// Requested transmit queue size, 0 for the driver default.
    pub tx_queue: u32,
    pub send_timeout: SendTimeout,
    pub xon_char: u8,
    pub xoff_char: u8,
}

fn is_no_handshake(handshake: &Handshake) -> bool {
    *handshake == Handshake::None
}

/// Wire form of [`LineConfiguration`]; every field optional.
#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct RawLineConfiguration {
    #[serde(default)]
    baud_rate: BaudRate,
    #[serde(default)]
    data_bits: DataBits,
    #[serde(default)]
    parity: Parity,
    #[serde(default)]
    stop_bits: StopBits,
    #[serde(default)]
    handshake: Option<Handshake>,
    #[serde(default)]
    tx_flow_cts: bool,
    #[serde(default)]
    tx_flow_dsr: bool,
    #[serde(default)]
    tx_flow_x: bool,
    #[serde(default)]
    rx_flow_x: bool,
    #[serde(default)]
    rx_gate_dsr: bool,
    #[serde(default = "default_true")]
    tx_when_rx_xoff: bool,
    #[serde(default)]
    use_rts: HsOutput,
    #[serde(default)]
    use_dtr: HsOutput,
    #[serde(default = "default_rx_high_water")]
    rx_high_water: u32,
    #[serde(default = "default_rx_low_water")]
    rx_low_water: u32,
    #[serde(default)]
    rx_queue: u32,
    #[serde(default)]
    tx_queue: u32,
    #[serde(default)]
    send_timeout: SendTimeout,
    #[serde(default = "default_xon")]
    xon_char: u8,
    #[serde(default = "default_xoff")]
    xoff_char: u8,
}

impl From<RawLineConfiguration> for LineConfiguration {
    fn from(raw: RawLineConfiguration) -> Self {
        let mut line = Self {
            baud_rate: raw.baud_rate,
            data_bits: raw.data_bits,
            parity: raw.parity,
            stop_bits: raw.stop_bits,
            handshake: Handshake::None,
            tx_flow_cts: raw.tx_flow_cts,
            tx_flow_dsr: raw.tx_flow_dsr,
            tx_flow_x: raw.tx_flow_x,
            rx_flow_x: raw.rx_flow_x,
            rx_gate_dsr: raw.rx_gate_dsr,
            tx_when_rx_xoff: raw.tx_when_rx_xoff,
            use_rts: raw.use_rts,
            use_dtr: raw.use_dtr,
            rx_high_water: raw.rx_high_water,
            rx_low_water: raw.rx_low_water,
            rx_queue: raw.rx_queue,
            tx_queue: raw.tx_queue,
            send_timeout: raw.send_timeout,
            xon_char: raw.xon_char,
            xoff_char: raw.xoff_char,
        };
        if let Some(handshake) = raw.handshake {
            line.set_handshake(handshake);
        }
        line
    }
}

impl Default for LineConfiguration {
    fn default() -> Self {
        Self {
            baud_rate: BaudRate::default(),
            data_bits: DataBits::default(),
            parity: Parity::default(),
            stop_bits: StopBits::default(),
            handshake: Handshake::None,
            tx_flow_cts: false,
            tx_flow_dsr: false,
            tx_flow_x: false,
            rx_flow_x: false,
            rx_gate_dsr: false,
            tx_when_rx_xoff: true,
            use_rts: HsOutput::None,
            use_dtr: HsOutput::None,
            rx_high_water: default_rx_high_water(),
            rx_low_water: default_rx_low_water(),
            rx_queue: 0,
            tx_queue: 0,
            send_timeout: SendTimeout::default(),
            xon_char: XON,
            xoff_char: XOFF,
        }
    }
}

impl LineConfiguration {
    /// Apply a handshake preset, overwriting every flow-control switch it
    /// touches.
    pub fn set_handshake(&mut self, handshake: Handshake) {
        let (cts, dsr, x, rts, dtr) = match handshake {
            Handshake::None => (false, false, false, HsOutput::Online, HsOutput::Online),
            Handshake::XonXoff => (false, false, true, HsOutput::Online, HsOutput::Online),
            Handshake::CtsRts => (true, false, false, HsOutput::Handshake, HsOutput::Online),
            Handshake::DsrDtr => (false, true, false, HsOutput::Online, HsOutput::Handshake),
        };
        self.handshake = handshake;
        self.tx_flow_cts = cts;
        self.tx_flow_dsr = dsr;
        self.tx_flow_x = x;
        self.rx_flow_x = x;
        self.use_rts = rts;
        self.use_dtr = dtr;
        self.tx_when_rx_xoff = true;
        self.rx_gate_dsr = false;
        if handshake == Handshake::XonXoff {
            self.xon_char = XON;
            self.xoff_char = XOFF;
        }
    }

    pub fn with_handshake(mut self, handshake: Handshake) -> Self {
        self.set_handshake(handshake);
        self
    }

    pub fn validate(&self) -> CommResult<()> {
        if self.baud_rate.value() == 0 {
            return Err(CommError::InvalidConfig("baud rate must be positive".into()));
        }
        match (self.data_bits, self.stop_bits) {
            (DataBits::Five, StopBits::Two) => {
                return Err(CommError::InvalidConfig(
                    "two stop bits cannot be used with 5 data bits".into(),
                ))
            }
            (bits, StopBits::OnePointFive) if bits != DataBits::Five => {
                return Err(CommError::InvalidConfig(
                    "1.5 stop bits require 5 data bits".into(),
                ))
            }
            _ => {}
        }
        // The driver takes both limits as 16-bit byte counts.
        for (name, limit) in [
            ("rx high water", self.rx_high_water),
            ("rx low water", self.rx_low_water),
        ] {
            if limit > u32::from(u16::MAX) {
                return Err(CommError::InvalidConfig(format!(
                    "{name} ({limit}) exceeds {}",
                    u16::MAX
                )));
            }
        }
        if (self.tx_flow_x || self.rx_flow_x) && self.xon_char == self.xoff_char {
            return Err(CommError::InvalidConfig(
                "xon and xoff characters must differ".into(),
            ));
        }
        Ok(())
    }

    pub fn control_block(&self) -> ControlBlock {
        ControlBlock::from_line(self)
    }

    pub fn timeouts(&self) -> CommTimeouts {
        CommTimeouts::for_sends(self.send_timeout)
    }
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
//  Session configuration
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

/// Everything a [`Session`](super::session::Session) is built from.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SessionConfig {
    /// OS device name (`COM1`, `/dev/ttyUSB0`, …).
    pub port_name: String,
    #[serde(default)]
    pub line: LineConfiguration,
    /// Reopen transparently on the next call after a forced close.
    #[serde(default)]
    pub auto_reopen: bool,
    /// Wait for the previous write to finish before queueing the next one.
    #[serde(default = "default_true")]
    pub check_all_sends: bool,
}

impl SessionConfig {
    pub fn new(port_name: impl Into<String>) -> Self {
        Self {
            port_name: port_name.into(),
            line: LineConfiguration::default(),
            auto_reopen: false,
            check_all_sends: true,
        }
    }

    pub fn with_line(mut self, line: LineConfiguration) -> Self {
        self.line = line;
        self
    }

    pub fn with_auto_reopen(mut self, enabled: bool) -> Self {
        self.auto_reopen = enabled;
        self
    }

    pub fn with_check_all_sends(mut self, enabled: bool) -> Self {
        self.check_all_sends = enabled;
        self
    }

    pub fn validate(&self) -> CommResult<()> {
        if self.port_name.trim().is_empty() {
            return Err(CommError::InvalidConfig("port name is empty".into()));
        }
        self.line.validate()
    }
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
//  Device encodings
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

/// Packed line settings as handed to the driver.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ControlBlock {
    pub baud_rate: u32,
    pub byte_size: u8,
    pub parity: u8,
    pub stop_bits: u8,
    pub xon_char: u8,
    pub xoff_char: u8,
    pub xon_limit: u16,
    pub xoff_limit: u16,
    pub flags: u32,
}

impl ControlBlock {
    pub const BINARY: u32 = 0x0001;
    pub const PARITY_CHECK: u32 = 0x0002;
    pub const OUT_X_CTS_FLOW: u32 = 0x0004;
    pub const OUT_X_DSR_FLOW: u32 = 0x0008;
    pub const DSR_SENSITIVITY: u32 = 0x0040;
    pub const TX_CONTINUE_ON_XOFF: u32 = 0x0080;
    pub const OUT_X: u32 = 0x0100;
    pub const IN_X: u32 = 0x0200;
    pub const ABORT_ON_ERROR: u32 = 0x8000;

    const DTR_SHIFT: u32 = 4;
    const RTS_SHIFT: u32 = 12;

    pub fn from_line(line: &LineConfiguration) -> Self {
        let mut flags = Self::BINARY | Self::ABORT_ON_ERROR;
        let mut set = |on: bool, bit: u32| {
            if on {
                flags |= bit;
            }
        };
        set(line.parity.is_checked(), Self::PARITY_CHECK);
        set(line.tx_flow_cts, Self::OUT_X_CTS_FLOW);
        set(line.tx_flow_dsr, Self::OUT_X_DSR_FLOW);
        set(line.rx_gate_dsr, Self::DSR_SENSITIVITY);
        // The driver flag has the opposite sense of `tx_when_rx_xoff`.
        set(!line.tx_when_rx_xoff, Self::TX_CONTINUE_ON_XOFF);
        set(line.tx_flow_x, Self::OUT_X);
        set(line.rx_flow_x, Self::IN_X);
        flags |= (line.use_dtr.code() & 0x3) << Self::DTR_SHIFT;
        flags |= (line.use_rts.code() & 0x3) << Self::RTS_SHIFT;

        Self {
            baud_rate: line.baud_rate.value(),
            byte_size: line.data_bits.value(),
            parity: line.parity.code(),
            stop_bits: line.stop_bits.code(),
            xon_char: line.xon_char,
            xoff_char: line.xoff_char,
            xon_limit: u16::try_from(line.rx_low_water).unwrap_or(u16::MAX),
            xoff_limit: u16::try_from(line.rx_high_water).unwrap_or(u16::MAX),
            flags,
        }
    }

    pub fn has(&self, flag: u32) -> bool {
        self.flags & flag == flag
    }

    pub fn dtr_control(&self) -> u32 {
        (self.flags >> Self::DTR_SHIFT) & 0x3
    }

    pub fn rts_control(&self) -> u32 {
        (self.flags >> Self::RTS_SHIFT) & 0x3
    }

    /// Any software or hardware output flow control enabled.
    pub fn uses_flow_control(&self) -> bool {
        self.flags & (Self::OUT_X_CTS_FLOW | Self::OUT_X_DSR_FLOW | Self::OUT_X | Self::IN_X) != 0
            || self.rts_control() == HsOutput::Handshake.code()
            || self.dtr_control() == HsOutput::Handshake.code()
    }
}

/// Driver timeouts in milliseconds. Reads never block; writes get the send
/// budget.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct CommTimeouts {
    pub read_interval: u32,
    pub read_total_multiplier: u32,
    pub read_total_constant: u32,
    pub write_total_multiplier: u32,
    pub write_total_constant: u32,
}

impl CommTimeouts {
    pub fn for_sends(send: SendTimeout) -> Self {
        Self {
            write_total_multiplier: send.multiplier_ms,
            write_total_constant: send.constant_ms,
            ..Self::default()
        }
    }

    pub fn send_timeout(&self) -> SendTimeout {
        SendTimeout {
            constant_ms: self.write_total_constant,
            multiplier_ms: self.write_total_multiplier,
        }
    }

    pub fn write_budget(&self, len: usize) -> Option<Duration> {
        self.send_timeout().budget(len)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn flow_tuple(line: &LineConfiguration) -> (bool, bool, bool, bool, HsOutput, HsOutput) {
        (
            line.tx_flow_cts,
            line.tx_flow_dsr,
            line.tx_flow_x,
            line.rx_flow_x,
            line.use_rts,
            line.use_dtr,
        )
    }

    #[test]
    fn test_defaults() {
        let line = LineConfiguration::default();
        assert_eq!(line.baud_rate.value(), 115200);
        assert_eq!(line.data_bits.value(), 8);
        assert_eq!(line.parity, Parity::None);
        assert_eq!(line.stop_bits, StopBits::One);
        assert_eq!(line.rx_high_water, 2048);
        assert_eq!(line.rx_low_water, 512);
        assert!(line.tx_when_rx_xoff);
        assert_eq!(line.xon_char, 0x11);
        assert_eq!(line.xoff_char, 0x13);
        assert_eq!(line.use_rts, HsOutput::None);
        assert_eq!(line.use_dtr, HsOutput::None);
        assert!(line.send_timeout.is_unbounded());
        assert!(line.validate().is_ok());
    }

    #[test]
    fn test_handshake_none() {
        let line = LineConfiguration::default().with_handshake(Handshake::None);
        assert_eq!(
            flow_tuple(&line),
            (false, false, false, false, HsOutput::Online, HsOutput::Online)
        );
    }

    #[test]
    fn test_handshake_xon_xoff() {
        let mut line = LineConfiguration::default();
        line.xon_char = b'Q';
        line.xoff_char = b'S';
        line.set_handshake(Handshake::XonXoff);
        assert_eq!(
            flow_tuple(&line),
            (false, false, true, true, HsOutput::Online, HsOutput::Online)
        );
        assert_eq!((line.xon_char, line.xoff_char), (XON, XOFF));
    }

    #[test]
    fn test_handshake_cts_rts() {
        let line = LineConfiguration::default().with_handshake(Handshake::CtsRts);
        assert_eq!(
            flow_tuple(&line),
            (true, false, false, false, HsOutput::Handshake, HsOutput::Online)
        );
        assert_eq!(line.handshake, Handshake::CtsRts);
    }

    #[test]
    fn test_handshake_dsr_dtr() {
        let line = LineConfiguration::default().with_handshake(Handshake::DsrDtr);
        assert_eq!(
            flow_tuple(&line),
            (false, true, false, false, HsOutput::Online, HsOutput::Handshake)
        );
    }

    #[test]
    fn test_handshake_resets_gate_and_xoff_continue() {
        let mut line = LineConfiguration::default();
        line.rx_gate_dsr = true;
        line.tx_when_rx_xoff = false;
        line.set_handshake(Handshake::CtsRts);
        assert!(!line.rx_gate_dsr);
        assert!(line.tx_when_rx_xoff);
    }

    #[test]
    fn test_handshake_replaces_previous_preset() {
        let mut line = LineConfiguration::default().with_handshake(Handshake::XonXoff);
        line.set_handshake(Handshake::DsrDtr);
        assert!(!line.tx_flow_x);
        assert!(!line.rx_flow_x);
        assert!(line.tx_flow_dsr);
    }

    #[test]
    fn test_control_block_default_flags() {
        let block = LineConfiguration::default().control_block();
        assert_eq!(block.flags, 0x8001);
        assert_eq!(block.baud_rate, 115200);
        assert_eq!(block.byte_size, 8);
        assert_eq!(block.parity, 0);
        assert_eq!(block.stop_bits, 0);
        assert_eq!(block.xoff_limit, 2048);
        assert_eq!(block.xon_limit, 512);
    }

    #[test]
    fn test_control_block_cts_rts() {
        let mut line = LineConfiguration::default().with_handshake(Handshake::CtsRts);
        line.parity = Parity::Even;
        let block = line.control_block();
        assert!(block.has(ControlBlock::PARITY_CHECK));
        assert!(block.has(ControlBlock::OUT_X_CTS_FLOW));
        assert!(!block.has(ControlBlock::OUT_X_DSR_FLOW));
        assert_eq!(block.rts_control(), 2);
        assert_eq!(block.dtr_control(), 1);
        assert_eq!(block.parity, 2);
        assert!(block.uses_flow_control());
    }

    #[test]
    fn test_control_block_inverts_tx_when_rx_xoff() {
        let mut line = LineConfiguration::default();
        assert!(!line.control_block().has(ControlBlock::TX_CONTINUE_ON_XOFF));
        line.tx_when_rx_xoff = false;
        assert!(line.control_block().has(ControlBlock::TX_CONTINUE_ON_XOFF));
    }

    #[test]
    fn test_mark_parity_not_checked() {
        let mut line = LineConfiguration::default();
        line.parity = Parity::Mark;
        let block = line.control_block();
        assert!(!block.has(ControlBlock::PARITY_CHECK));
        assert_eq!(block.parity, 3);
    }

    #[test]
    fn test_xon_xoff_flags() {
        let block = LineConfiguration::default()
            .with_handshake(Handshake::XonXoff)
            .control_block();
        assert!(block.has(ControlBlock::OUT_X | ControlBlock::IN_X));
        assert_eq!(block.xon_char, XON);
        assert_eq!(block.xoff_char, XOFF);
    }

    #[test]
    fn test_validate_stop_bits() {
        let mut line = LineConfiguration::default();
        line.stop_bits = StopBits::OnePointFive;
        assert!(matches!(line.validate(), Err(CommError::InvalidConfig(_))));
        line.data_bits = DataBits::Five;
        assert!(line.validate().is_ok());
        line.stop_bits = StopBits::Two;
        assert!(line.validate().is_err());
    }

    #[test]
    fn test_validate_rejects_zero_baud_and_bad_water_marks() {
        let mut line = LineConfiguration::default();
        line.baud_rate = BaudRate::Custom(0);
        assert!(line.validate().is_err());

        let mut line = LineConfiguration::default();
        line.rx_high_water = 70_000;
        assert!(line.validate().is_err());
    }

    #[test]
    fn test_water_marks_use_independent_units() {
        let mut line = LineConfiguration::default();
        line.rx_high_water = 512;
        line.rx_low_water = 1024;
        assert!(line.validate().is_ok());
        let block = line.control_block();
        assert_eq!((block.xoff_limit, block.xon_limit), (512, 1024));
        line.rx_low_water = u32::from(u16::MAX) + 1;
        assert!(matches!(line.validate(), Err(CommError::InvalidConfig(_))));
    }

    #[test]
    fn test_validate_xon_equals_xoff() {
        let mut line = LineConfiguration::default();
        line.xon_char = b'A';
        line.xoff_char = b'A';
        assert!(line.validate().is_ok());
        line.tx_flow_x = true;
        assert!(line.validate().is_err());
    }

    #[test]
    fn test_session_config_rejects_empty_port() {
        assert!(SessionConfig::new("  ").validate().is_err());
        assert!(SessionConfig::new("COM3").validate().is_ok());
    }

    #[test]
    fn test_send_timeout_budget() {
        assert_eq!(SendTimeout::default().budget(100), None);
        let timeout = SendTimeout { constant_ms: 50, multiplier_ms: 2 };
        assert_eq!(timeout.budget(10), Some(Duration::from_millis(70)));
        let timeouts = CommTimeouts::for_sends(timeout);
        assert_eq!(timeouts.read_interval, 0);
        assert_eq!(timeouts.write_total_constant, 50);
        assert_eq!(timeouts.write_budget(0), Some(Duration::from_millis(50)));
    }

    #[test]
    fn test_baud_rate_numeric_conversion() {
        assert_eq!(BaudRate::from(9600), BaudRate::Baud9600);
        assert_eq!(BaudRate::from(250000), BaudRate::Custom(250000));
        assert_eq!(u32::from(BaudRate::Baud921600), 921600);
        assert!(!BaudRate::from(31250).is_standard());
    }

    #[test]
    fn test_session_config_json_defaults() {
        let json = r#"{"portName":"COM7","line":{"baudRate":9600,"dataBits":7,"parity":"even"}}"#;
        let cfg: SessionConfig = serde_json::from_str(json).unwrap();
        assert_eq!(cfg.port_name, "COM7");
        assert_eq!(cfg.line.baud_rate, BaudRate::Baud9600);
        assert_eq!(cfg.line.data_bits, DataBits::Seven);
        assert_eq!(cfg.line.parity, Parity::Even);
        assert_eq!(cfg.line.rx_high_water, 2048);
        assert!(cfg.line.tx_when_rx_xoff);
        assert!(cfg.check_all_sends);
        assert!(!cfg.auto_reopen);
    }

    #[test]
    fn test_json_handshake_applies_preset() {
        let parse = |mode: &str| {
            let json = format!(r#"{{"portName":"COM1","line":{{"handshake":"{mode}"}}}}"#);
            serde_json::from_str::<SessionConfig>(&json).unwrap().line
        };
        for (mode, handshake) in [
            ("none", Handshake::None),
            ("xonXoff", Handshake::XonXoff),
            ("ctsRts", Handshake::CtsRts),
            ("dsrDtr", Handshake::DsrDtr),
        ] {
            let line = parse(mode);
            let expected = LineConfiguration::default().with_handshake(handshake);
            assert_eq!(line.handshake, handshake);
            assert_eq!(flow_tuple(&line), flow_tuple(&expected), "{mode}");
        }
    }

    #[test]
    fn test_json_handshake_overrides_switches() {
        let json = r#"{"handshake":"ctsRts","txFlowX":true,"useRts":"none"}"#;
        let line: LineConfiguration = serde_json::from_str(json).unwrap();
        assert!(line.tx_flow_cts);
        assert!(!line.tx_flow_x);
        assert_eq!(line.use_rts, HsOutput::Handshake);
    }

    #[test]
    fn test_json_round_trip_keeps_switches() {
        let mut line = LineConfiguration::default();
        line.tx_flow_dsr = true;
        let restored: LineConfiguration =
            serde_json::from_str(&serde_json::to_string(&line).unwrap()).unwrap();
        assert_eq!(restored, line);

        let preset = LineConfiguration::default().with_handshake(Handshake::CtsRts);
        let restored: LineConfiguration =
            serde_json::from_str(&serde_json::to_string(&preset).unwrap()).unwrap();
        assert_eq!(restored, preset);
    }

    #[test]
    fn test_session_config_json_rejects_bad_data_bits() {
        let json = r#"{"portName":"COM7","line":{"dataBits":9}}"#;
        assert!(serde_json::from_str::<SessionConfig>(json).is_err());
    }
}
