//! Shared data records and wire types.
//!
//! Every in-memory policy map the supervisor holds, every row the persistence
//! layer reads and writes, and every message that crosses the control socket
//! is typed here. No I/O lives in this crate.

mod command;
mod device;
mod message;
mod schedule;

pub use command::{Command, CommandResult, MacList};
pub use device::{AccessControl, AccessControlMode, Capacity, Device, ForecastPoint, ManualLimit, Quota, ShaperClass};
pub use message::{DeviceRow, Message};
pub use schedule::{PreScheduleState, RepeatMode, RuleType, Schedule};

/// Class id range a [`ShaperClass`] may occupy. Last-octet derived, clamped, and
/// linear-probed on collision; see `hg-net`'s class allocator.
pub const CLASS_ID_MIN: u8 = 10;
pub const CLASS_ID_MAX: u8 = 253;
