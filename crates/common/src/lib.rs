//! Common utilities for ptylink
//!
//! This crate provides the plumbing shared by the bridge daemon's pieces:
//! the error taxonomy, device identity and permission-state types, logging
//! setup, and the bounded channel bridges that connect blocking hardware
//! threads to the tokio control task.

pub mod channel;
pub mod device;
pub mod error;
pub mod logging;
pub mod test_utils;

pub use channel::{
    create_bridge, ControlRx, PermissionDecision, PumpEvent, WorkerTx, CHANNEL_CAPACITY,
};
pub use device::{DeviceDescriptor, DeviceKey, PermissionState, RequestId};
pub use error::{Error, Result};
pub use logging::setup_logging;
