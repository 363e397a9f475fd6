//! Narrow boundary to the platform USB host stack
//!
//! Class drivers (such as `usbh-cdc`) consume the host stack exclusively
//! through the traits in this crate: [`HostBackend`] for client registration,
//! enumeration and opening devices, [`DevicePort`] for bulk I/O on an opened
//! interface, and [`HostHooks`] for hot-plug notifications. The production
//! implementation is [`RusbBackend`] (libusb via `rusb`); [`mock::MockHost`]
//! is a scriptable stand-in for tests.

pub mod backend;
pub mod error;
pub mod logging;
pub mod mock;
pub mod traits;
pub mod types;

pub use backend::RusbBackend;
pub use error::{HostError, HostResult};
pub use logging::setup_logging;
pub use traits::{DevicePort, HostBackend, HostHooks, InComplete, OutComplete};
pub use types::{
    ConfigDescriptor, DeviceAddr, DeviceDescriptor, DeviceInfo, DeviceSpeed, EndpointDescriptor,
    InterfaceDescriptor, TransferKind,
};
