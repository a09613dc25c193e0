pub mod commands;
pub mod events;

pub use commands::{DeviceSelector, EngineCommand};
pub use events::{EngineEvent, OutputDeviceInfo};
