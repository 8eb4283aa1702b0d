//! Per-device command serialization and the lifecycle records of every command.

pub mod device_queue;
pub mod types;

pub use device_queue::{CommandHandle, CommandObserver, DeviceQueue};
pub use types::{CommandId, CommandKind, CommandRecord, CommandStatus};
