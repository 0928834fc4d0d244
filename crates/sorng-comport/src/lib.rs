//! # SortOfRemote NG – COM Port Engine
//!
//! Full-duplex byte stream over a COM-style serial device:
//!
//! - **Line Configuration** – baud rate, framing, handshake presets, the raw
//!   flow-control switches and the control-block encoding derived from them
//! - **Session** – open / close lifecycle, optional auto-reopen, output pins
//!   (RTS, DTR, break) and live modem / queue status
//! - **Write Path** – overlapped writes with a completion check and a
//!   per-byte send-timeout budget
//! - **Event Monitor** – dedicated thread waiting on device events and
//!   publishing received bytes, transmit-complete, break and modem changes
//! - **Fault Propagation** – monitor failures are parked and surfaced exactly
//!   once on the next foreground call
//! - **Backends** – OS ports through `serialport`, plus an in-memory
//!   null-modem bus for tests and simulations

pub mod comport;
