//! COM port crate: sub-modules.

pub mod config;
pub mod device;
pub mod error;
pub mod events;
pub mod monitor;
pub mod session;
pub mod status;
pub mod system;
pub mod virtual_port;
pub mod write;

// Re-export top-level items for convenience.
pub use config::*;
pub use device::{
    CancelToken, ComStat, CommDevice, DeviceDriver, DeviceError, DeviceErrorKind, DeviceResult,
    EscapeFunction, EventMask, LineErrors, QueueCapacity, WriteStatus,
};
pub use error::{CommError, CommResult};
pub use events::{EventHub, SerialEvent};
pub use session::{Capabilities, PinState, Session, SessionHooks, SessionState};
pub use status::{HoldFlags, ModemStatus, QueueStatus};
pub use system::SystemDriver;
pub use virtual_port::VirtualBus;
pub use write::PendingWrite;
